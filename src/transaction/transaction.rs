use super::{
    endpoint::EndpointInnerRef,
    key::{TransactionKey, TransactionRole},
    TransactionEvent, TransactionReceiver, TransactionSender, TransactionState, TransactionTimer,
    TransactionType,
};
use crate::{
    transport::{SipAddr, SipConnection},
    Error, Result,
};
use rsip::{Method, Request, Response, SipMessage, StatusCode};
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, info, warn};

/// One request/response exchange with its own state machine and timers.
///
/// A transaction is single-owner: the task that created (or accepted) it
/// drives it by calling [`Transaction::receive`] in a loop, and every
/// timer or inbound message is funneled through the transaction's channel,
/// so state transitions are naturally serialized.
pub struct Transaction {
    pub transaction_type: TransactionType,
    pub key: TransactionKey,
    pub original: Request,
    pub state: TransactionState,
    pub endpoint_inner: EndpointInnerRef,
    pub connection: Option<SipConnection>,
    pub destination: Option<SipAddr>,
    pub last_response: Option<Response>,
    pub last_ack: Option<Request>,
    pub tu_receiver: TransactionReceiver,
    pub tu_sender: TransactionSender,
    timer_retransmit: Option<u64>,
    timer_timeout: Option<u64>,
    timer_completed: Option<u64>,
    is_cleaned_up: bool,
}

impl Transaction {
    fn new(
        transaction_type: TransactionType,
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let (tu_sender, tu_receiver) = unbounded_channel();
        let state = match transaction_type {
            TransactionType::ClientInvite => TransactionState::Calling,
            TransactionType::ClientNonInvite => TransactionState::Trying,
            TransactionType::ServerInvite => TransactionState::Proceeding,
            TransactionType::ServerNonInvite => TransactionState::Trying,
        };
        info!(key = %key, "created {:?} transaction", transaction_type);
        Transaction {
            transaction_type,
            key,
            original,
            state,
            endpoint_inner,
            connection,
            destination: None,
            last_response: None,
            last_ack: None,
            tu_receiver,
            tu_sender,
            timer_retransmit: None,
            timer_timeout: None,
            timer_completed: None,
            is_cleaned_up: false,
        }
    }

    pub fn new_client(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let transaction_type = match original.method {
            Method::Invite => TransactionType::ClientInvite,
            _ => TransactionType::ClientNonInvite,
        };
        Transaction::new(transaction_type, key, original, endpoint_inner, connection)
    }

    /// Server transactions attach to the endpoint immediately so that
    /// retransmissions arriving before the application picks the
    /// transaction up are still routed into its channel.
    pub fn new_server(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let transaction_type = match original.method {
            Method::Invite | Method::Ack => TransactionType::ServerInvite,
            _ => TransactionType::ServerNonInvite,
        };
        let tx = Transaction::new(transaction_type, key, original, endpoint_inner, connection);
        tx.endpoint_inner
            .attach_transaction(&tx.key, tx.tu_sender.clone());
        tx
    }

    fn is_client(&self) -> bool {
        matches!(
            self.transaction_type,
            TransactionType::ClientInvite | TransactionType::ClientNonInvite
        )
    }

    fn is_reliable(&self) -> bool {
        self.connection
            .as_ref()
            .map(|c| c.is_reliable())
            .unwrap_or(true)
    }

    /// Send the original request (client transactions only). Resolves a
    /// connection through the transport layer when none was supplied,
    /// attaches to the endpoint and arms the retransmission/timeout timers.
    pub async fn send(&mut self) -> Result<()> {
        if !self.is_client() {
            return Err(Error::TransactionError(
                "send is a client operation".to_string(),
                self.key.clone(),
            ));
        }
        if self.state >= TransactionState::Accepted {
            return Err(Error::TransactionTerminated(self.key.clone()));
        }

        self.endpoint_inner
            .attach_transaction(&self.key, self.tu_sender.clone());

        match self.connection.clone() {
            Some(connection) => {
                connection
                    .send(self.original.clone().into(), self.destination.as_ref())
                    .await?;
            }
            None => {
                // send_message evicts a stale cached connection and redials
                // once before reporting the destination unreachable
                let target = match &self.destination {
                    Some(addr) => addr.clone(),
                    None => SipConnection::get_destination(&self.original.clone().into())?,
                };
                let connection = self
                    .endpoint_inner
                    .transport_layer
                    .send_message(self.original.clone().into(), Some(&target))
                    .await?;
                self.destination = Some(target);
                self.connection = Some(connection);
            }
        }

        let option = &self.endpoint_inner.option;
        if !self.is_reliable() {
            let timer = match self.transaction_type {
                TransactionType::ClientInvite => {
                    TransactionTimer::TimerA(self.key.clone(), option.t1)
                }
                _ => TransactionTimer::TimerE(self.key.clone(), option.t1),
            };
            self.timer_retransmit = Some(self.endpoint_inner.timers.timeout(option.t1, timer));
        }
        let timeout = match self.transaction_type {
            TransactionType::ClientInvite => TransactionTimer::TimerB(self.key.clone()),
            _ => TransactionTimer::TimerF(self.key.clone()),
        };
        self.timer_timeout = Some(self.endpoint_inner.timers.timeout(option.t1x64, timeout));
        Ok(())
    }

    pub async fn reply(&mut self, status_code: StatusCode) -> Result<()> {
        self.reply_with(status_code, vec![], None).await
    }

    /// Build and send a response on a server transaction, with extra
    /// headers (To-tag, Contact, Record-Route ...) supplied by the caller.
    pub async fn reply_with(
        &mut self,
        status_code: StatusCode,
        headers: Vec<rsip::Header>,
        body: Option<Vec<u8>>,
    ) -> Result<()> {
        let mut response = self
            .endpoint_inner
            .make_response(&self.original, status_code, body);
        for header in headers {
            response.headers.unique_push(header);
        }
        self.respond(response).await
    }

    pub async fn respond(&mut self, response: Response) -> Result<()> {
        if self.is_client() {
            return Err(Error::TransactionError(
                "respond is a server operation".to_string(),
                self.key.clone(),
            ));
        }
        if self.state == TransactionState::Terminated {
            return Err(Error::TransactionTerminated(self.key.clone()));
        }

        let connection = self.connection.clone().ok_or_else(|| {
            Error::TransactionError("no connection".to_string(), self.key.clone())
        })?;
        connection.send(response.clone().into(), None).await?;

        let final_response = response.status_code.kind() != rsip::StatusCodeKind::Provisional;
        let status_code = response.status_code.clone();
        self.last_response = Some(response);

        if !final_response {
            return self.transition(TransactionState::Proceeding).map(|_| ());
        }

        let option = self.endpoint_inner.option.clone();
        match self.transaction_type {
            TransactionType::ServerInvite => {
                self.transition(TransactionState::Completed)?;
                // non-2xx finals are retransmitted until the ACK shows up;
                // for a 2xx, ACK recovery belongs to the dialog layer
                if !self.is_reliable()
                    && status_code.kind() != rsip::StatusCodeKind::Successful
                {
                    self.timer_retransmit = Some(self.endpoint_inner.timers.timeout(
                        option.t1,
                        TransactionTimer::TimerG(self.key.clone(), option.t1),
                    ));
                }
                self.timer_timeout = Some(
                    self.endpoint_inner
                        .timers
                        .timeout(option.t1x64, TransactionTimer::TimerH(self.key.clone())),
                );
            }
            TransactionType::ServerNonInvite => {
                self.transition(TransactionState::Completed)?;
                let linger = if self.is_reliable() {
                    std::time::Duration::ZERO
                } else {
                    option.t1x64
                };
                self.timer_completed = Some(
                    self.endpoint_inner
                        .timers
                        .timeout(linger, TransactionTimer::TimerJ(self.key.clone())),
                );
            }
            _ => {}
        }
        Ok(())
    }

    /// Send an ACK on a client INVITE transaction. Used by the dialog
    /// layer for the 2xx ACK; the non-2xx ACK is generated internally.
    pub async fn send_ack(&mut self, ack: Request) -> Result<()> {
        if self.transaction_type != TransactionType::ClientInvite {
            return Err(Error::TransactionError(
                "ACK on a non-INVITE client transaction".to_string(),
                self.key.clone(),
            ));
        }
        let connection = self.connection.clone().ok_or_else(|| {
            Error::TransactionError("no connection".to_string(), self.key.clone())
        })?;
        connection
            .send(ack.clone().into(), self.destination.as_ref())
            .await?;
        self.last_ack = Some(ack);
        Ok(())
    }

    /// CANCEL a pending client INVITE. A no-op error once a final response
    /// has arrived.
    pub async fn send_cancel(&mut self) -> Result<()> {
        if self.transaction_type != TransactionType::ClientInvite {
            return Err(Error::TransactionError(
                "CANCEL on a non-INVITE client transaction".to_string(),
                self.key.clone(),
            ));
        }
        if self.state >= TransactionState::Accepted {
            return Err(Error::TransactionTerminated(self.key.clone()));
        }
        let cancel = self.endpoint_inner.make_cancel(&self.original)?;
        let connection = self.connection.clone().ok_or_else(|| {
            Error::TransactionError("no connection".to_string(), self.key.clone())
        })?;
        connection
            .send(cancel.into(), self.destination.as_ref())
            .await?;
        Ok(())
    }

    /// Drive the transaction: processes timers and retransmissions
    /// internally and yields only the messages the application must see.
    /// Returns `None` once the transaction terminates. A timeout surfaces
    /// as a locally generated 408 response.
    pub async fn receive(&mut self) -> Option<SipMessage> {
        if self.state == TransactionState::Terminated {
            return None;
        }
        while let Some(event) = self.tu_receiver.recv().await {
            let result = match event {
                TransactionEvent::Received(msg, connection) => {
                    self.on_received(msg, connection).await
                }
                TransactionEvent::Timer(timer) => self.on_timer(timer).await,
                TransactionEvent::Terminate => {
                    self.transition(TransactionState::Terminated).ok();
                    return None;
                }
            };
            match result {
                Ok(Some(msg)) => return Some(msg),
                Ok(None) => {
                    if self.state == TransactionState::Terminated {
                        return None;
                    }
                }
                Err(e) => {
                    warn!(key = %self.key, "error processing event: {}", e);
                }
            }
        }
        None
    }

    async fn on_received(
        &mut self,
        msg: SipMessage,
        connection: Option<SipConnection>,
    ) -> Result<Option<SipMessage>> {
        if self.state == TransactionState::Terminated {
            return Ok(None);
        }
        match msg {
            SipMessage::Response(resp) => {
                if !self.is_client() {
                    return Err(Error::ProtocolViolation(
                        "response delivered to server transaction".to_string(),
                    ));
                }
                match self.transaction_type {
                    TransactionType::ClientInvite => self.client_invite_on_response(resp).await,
                    _ => self.client_non_invite_on_response(resp).await,
                }
            }
            SipMessage::Request(req) => {
                if self.is_client() {
                    return Err(Error::ProtocolViolation(
                        "request delivered to client transaction".to_string(),
                    ));
                }
                self.server_on_request(req, connection).await
            }
        }
    }

    async fn client_invite_on_response(
        &mut self,
        resp: Response,
    ) -> Result<Option<SipMessage>> {
        match resp.status_code.kind() {
            rsip::StatusCodeKind::Provisional => {
                if self.state > TransactionState::Proceeding {
                    return Ok(None);
                }
                self.cancel_retransmit();
                if self.state == TransactionState::Calling {
                    self.transition(TransactionState::Proceeding)?;
                }
                self.last_response = Some(resp.clone());
                Ok(Some(resp.into()))
            }
            rsip::StatusCodeKind::Successful => {
                if self.state >= TransactionState::Completed {
                    return Ok(None);
                }
                self.last_response = Some(resp.clone());
                if self.state < TransactionState::Accepted {
                    // the ACK for a 2xx is the dialog layer's business; the
                    // transaction lingers so 2xx retransmissions and forked
                    // 2xx responses with a new To-tag still reach it
                    self.cancel_retransmit();
                    self.cancel_timeout();
                    self.transition(TransactionState::Accepted)?;
                    self.timer_completed = Some(self.endpoint_inner.timers.timeout(
                        self.endpoint_inner.option.t1x64,
                        TransactionTimer::TimerM(self.key.clone()),
                    ));
                }
                Ok(Some(resp.into()))
            }
            _ => {
                if self.state == TransactionState::Accepted {
                    // a late non-2xx from another branch after a 2xx
                    return Ok(None);
                }
                if self.state >= TransactionState::Completed {
                    // duplicate final: resend the ACK, do not surface again
                    if !self.is_reliable() {
                        if let (Some(ack), Some(connection)) =
                            (self.last_ack.clone(), self.connection.clone())
                        {
                            connection.send(ack.into(), self.destination.as_ref()).await?;
                        }
                    }
                    return Ok(None);
                }
                self.last_response = Some(resp.clone());
                let ack = self.endpoint_inner.make_ack(&self.original, &resp)?;
                if let Some(connection) = self.connection.clone() {
                    connection
                        .send(ack.clone().into(), self.destination.as_ref())
                        .await?;
                }
                self.last_ack = Some(ack);
                self.transition(TransactionState::Completed)?;
                let linger = if self.is_reliable() {
                    std::time::Duration::ZERO
                } else {
                    self.endpoint_inner.option.t1x64
                };
                self.timer_completed = Some(
                    self.endpoint_inner
                        .timers
                        .timeout(linger, TransactionTimer::TimerD(self.key.clone())),
                );
                Ok(Some(resp.into()))
            }
        }
    }

    async fn client_non_invite_on_response(
        &mut self,
        resp: Response,
    ) -> Result<Option<SipMessage>> {
        match resp.status_code.kind() {
            rsip::StatusCodeKind::Provisional => {
                if self.state <= TransactionState::Proceeding {
                    self.transition(TransactionState::Proceeding)?;
                    self.last_response = Some(resp.clone());
                    return Ok(Some(resp.into()));
                }
                Ok(None)
            }
            _ => {
                if self.state >= TransactionState::Completed {
                    return Ok(None);
                }
                self.last_response = Some(resp.clone());
                self.transition(TransactionState::Completed)?;
                let linger = if self.is_reliable() {
                    std::time::Duration::ZERO
                } else {
                    self.endpoint_inner.option.t4
                };
                self.timer_completed = Some(
                    self.endpoint_inner
                        .timers
                        .timeout(linger, TransactionTimer::TimerK(self.key.clone())),
                );
                Ok(Some(resp.into()))
            }
        }
    }

    async fn server_on_request(
        &mut self,
        req: Request,
        _connection: Option<SipConnection>,
    ) -> Result<Option<SipMessage>> {
        match req.method {
            Method::Ack => {
                if self.transaction_type != TransactionType::ServerInvite {
                    return Err(Error::ProtocolViolation(
                        "ACK on a non-INVITE server transaction".to_string(),
                    ));
                }
                match self.state {
                    TransactionState::Completed => {
                        self.cancel_retransmit();
                        self.cancel_timeout();
                        self.transition(TransactionState::Confirmed)?;
                        let linger = if self.is_reliable() {
                            std::time::Duration::ZERO
                        } else {
                            self.endpoint_inner.option.t4
                        };
                        self.timer_completed = Some(
                            self.endpoint_inner
                                .timers
                                .timeout(linger, TransactionTimer::TimerI(self.key.clone())),
                        );
                        Ok(Some(req.into()))
                    }
                    // duplicate ACK in Confirmed is absorbed
                    _ => Ok(None),
                }
            }
            Method::Cancel => {
                // answer the CANCEL itself, then surface it so the
                // application can finish the INVITE with a 487
                let resp =
                    self.endpoint_inner
                        .make_response(&req, StatusCode::OK, None);
                if let Some(connection) = self.connection.clone() {
                    connection.send(resp.into(), None).await?;
                }
                Ok(Some(req.into()))
            }
            _ if req.method == self.original.method => {
                // request retransmission: replay the last response
                if let (Some(resp), Some(connection)) =
                    (self.last_response.clone(), self.connection.clone())
                {
                    connection.send(resp.into(), None).await?;
                }
                Ok(None)
            }
            _ => Err(Error::ProtocolViolation(format!(
                "unexpected {} inside transaction",
                req.method
            ))),
        }
    }

    async fn on_timer(&mut self, timer: TransactionTimer) -> Result<Option<SipMessage>> {
        if self.state == TransactionState::Terminated {
            return Ok(None);
        }
        let option = self.endpoint_inner.option.clone();
        match timer {
            TransactionTimer::TimerA(key, interval) => {
                if self.state == TransactionState::Calling {
                    self.retransmit_original().await?;
                    let next = (interval * 2).min(option.t2);
                    self.timer_retransmit = Some(
                        self.endpoint_inner
                            .timers
                            .timeout(next, TransactionTimer::TimerA(key, next)),
                    );
                }
                Ok(None)
            }
            TransactionTimer::TimerE(key, interval) => {
                if self.state <= TransactionState::Proceeding {
                    self.retransmit_original().await?;
                    let next = (interval * 2).min(option.t2);
                    self.timer_retransmit = Some(
                        self.endpoint_inner
                            .timers
                            .timeout(next, TransactionTimer::TimerE(key, next)),
                    );
                }
                Ok(None)
            }
            TransactionTimer::TimerG(key, interval) => {
                if self.state == TransactionState::Completed {
                    if let (Some(resp), Some(connection)) =
                        (self.last_response.clone(), self.connection.clone())
                    {
                        debug!(key = %self.key, "retransmitting final response");
                        connection.send(resp.into(), None).await?;
                    }
                    let next = (interval * 2).min(option.t2);
                    self.timer_retransmit = Some(
                        self.endpoint_inner
                            .timers
                            .timeout(next, TransactionTimer::TimerG(key, next)),
                    );
                }
                Ok(None)
            }
            TransactionTimer::TimerB(_) | TransactionTimer::TimerF(_) => {
                if self.state <= TransactionState::Proceeding {
                    return self.timeout();
                }
                Ok(None)
            }
            TransactionTimer::TimerH(_) => {
                if self.state == TransactionState::Completed {
                    warn!(key = %self.key, "no ACK received, giving up");
                    self.transition(TransactionState::Terminated)?;
                }
                Ok(None)
            }
            TransactionTimer::TimerM(_) => {
                if self.state == TransactionState::Accepted {
                    self.transition(TransactionState::Terminated)?;
                }
                Ok(None)
            }
            TransactionTimer::TimerD(_)
            | TransactionTimer::TimerI(_)
            | TransactionTimer::TimerJ(_)
            | TransactionTimer::TimerK(_) => {
                self.transition(TransactionState::Terminated)?;
                Ok(None)
            }
            TransactionTimer::TimerCleanup(_) => Ok(None),
        }
    }

    /// Exactly one timeout is reported per transaction, as a locally
    /// generated 408 so the application handles it on the response path.
    fn timeout(&mut self) -> Result<Option<SipMessage>> {
        let timeout_response =
            self.endpoint_inner
                .make_response(&self.original, StatusCode::RequestTimeout, None);
        self.last_response = Some(timeout_response.clone());
        self.transition(TransactionState::Terminated)?;
        Ok(Some(timeout_response.into()))
    }

    async fn retransmit_original(&mut self) -> Result<()> {
        if let Some(connection) = self.connection.clone() {
            debug!(key = %self.key, "retransmitting request");
            connection
                .send(self.original.clone().into(), self.destination.as_ref())
                .await?;
        }
        Ok(())
    }

    fn cancel_retransmit(&mut self) {
        if let Some(id) = self.timer_retransmit.take() {
            self.endpoint_inner.timers.cancel(id);
        }
    }

    fn cancel_timeout(&mut self) {
        if let Some(id) = self.timer_timeout.take() {
            self.endpoint_inner.timers.cancel(id);
        }
    }

    fn cancel_all_timers(&mut self) {
        self.cancel_retransmit();
        self.cancel_timeout();
        if let Some(id) = self.timer_completed.take() {
            self.endpoint_inner.timers.cancel(id);
        }
    }

    fn transition(&mut self, state: TransactionState) -> Result<TransactionState> {
        if self.state == state {
            return Ok(state);
        }
        if self.state == TransactionState::Terminated {
            return Err(Error::TransactionTerminated(self.key.clone()));
        }
        debug!(key = %self.key, "transition {:?} -> {:?}", self.state, state);
        self.state = state;
        if state == TransactionState::Terminated {
            self.cleanup();
        }
        Ok(state)
    }

    fn cleanup(&mut self) {
        if self.is_cleaned_up {
            return;
        }
        self.is_cleaned_up = true;
        self.cancel_all_timers();
        self.endpoint_inner
            .detach_transaction(&self.key, self.last_response.clone());
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        debug!(key = %self.key, "transaction dropped");
        self.cleanup();
    }
}
