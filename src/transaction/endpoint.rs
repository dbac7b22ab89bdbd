use super::{
    key::{TransactionKey, TransactionRole},
    transaction::Transaction,
    TransactionEvent, TransactionSender, TransactionTimer, T1, T1X64, T2, T4, TIMER_INTERVAL,
};
use crate::{
    timer::Timer,
    transport::{SipConnection, TransportEvent, TransportLayer},
    Result,
};
use rsip::{Method, Response, SipMessage, StatusCode};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type StrayMessageHook = Arc<dyn Fn(&SipMessage) + Send + Sync>;
pub type IncomingTransactionReceiver = UnboundedReceiver<Transaction>;

/// Endpoint-wide tunables. Timer constants are configuration, not
/// hardcoded at use sites, so tests can shrink them to milliseconds.
#[derive(Clone)]
pub struct EndpointOption {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
    /// Timeout bound for Timers B, F and H, and the finished-table linger.
    pub t1x64: Duration,
    pub timer_interval: Duration,
    /// Diagnostic hook for responses that match no transaction. The
    /// response is dropped either way.
    pub stray_message_hook: Option<StrayMessageHook>,
}

impl Default for EndpointOption {
    fn default() -> Self {
        EndpointOption {
            t1: T1,
            t2: T2,
            t4: T4,
            t1x64: T1X64,
            timer_interval: TIMER_INTERVAL,
            stray_message_hook: None,
        }
    }
}

pub struct EndpointInner {
    pub user_agent: String,
    pub option: EndpointOption,
    pub timers: Timer<TransactionTimer>,
    pub transport_layer: TransportLayer,
    pub cancel_token: CancellationToken,
    /// Live transactions; all events for a key are funneled into its channel.
    attached_transactions: Mutex<HashMap<TransactionKey, TransactionSender>>,
    /// Recently terminated transactions, kept briefly so a retransmitted
    /// request is answered with the cached final response instead of
    /// spawning a fresh transaction.
    finished_transactions: Mutex<HashMap<TransactionKey, Option<Response>>>,
    incoming_sender: Mutex<Option<UnboundedSender<Transaction>>>,
}

pub type EndpointInnerRef = Arc<EndpointInner>;

/// The protocol engine: owns the transport layer, the timer wheel and the
/// transaction table, and demultiplexes every inbound message.
pub struct Endpoint {
    pub inner: EndpointInnerRef,
}

#[derive(Default)]
pub struct EndpointBuilder {
    user_agent: Option<String>,
    cancel_token: Option<CancellationToken>,
    transport_layer: Option<TransportLayer>,
    option: Option<EndpointOption>,
}

impl EndpointBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = Some(user_agent.to_string());
        self
    }

    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = Some(cancel_token);
        self
    }

    pub fn with_transport_layer(mut self, transport_layer: TransportLayer) -> Self {
        self.transport_layer = Some(transport_layer);
        self
    }

    pub fn with_option(mut self, option: EndpointOption) -> Self {
        self.option = Some(option);
        self
    }

    pub fn build(self) -> Endpoint {
        let cancel_token = self.cancel_token.unwrap_or_default();
        let transport_layer = self
            .transport_layer
            .unwrap_or_else(|| TransportLayer::new(cancel_token.child_token()));
        let inner = EndpointInner {
            user_agent: self.user_agent.unwrap_or_else(|| "sipflow/0.1".to_string()),
            option: self.option.unwrap_or_default(),
            timers: Timer::new(),
            transport_layer,
            cancel_token,
            attached_transactions: Mutex::new(HashMap::new()),
            finished_transactions: Mutex::new(HashMap::new()),
            incoming_sender: Mutex::new(None),
        };
        Endpoint {
            inner: Arc::new(inner),
        }
    }
}

impl Endpoint {
    /// Run the endpoint until cancelled: transports are served, timers
    /// polled, messages dispatched. Callers usually spawn this.
    pub async fn serve(&self) {
        let inner = self.inner.clone();
        tokio::select! {
            _ = self.inner.cancel_token.cancelled() => {
                info!("endpoint cancelled");
            }
            result = inner.process() => {
                if let Err(e) = result {
                    warn!("endpoint serve loop exited: {}", e);
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.inner.cancel_token.cancel();
    }

    /// Channel of new server transactions. Must be taken before traffic
    /// arrives; unmatched requests are rejected while nobody listens.
    pub fn incoming_transactions(&self) -> IncomingTransactionReceiver {
        let (sender, receiver) = unbounded_channel();
        self.incoming_sender().lock().unwrap().replace(sender);
        receiver
    }

    /// Start a client transaction for `request`. The request is not sent
    /// until [`Transaction::send`] is called.
    pub fn client_transaction(&self, request: rsip::Request) -> Result<Transaction> {
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        Ok(Transaction::new_client(
            key,
            request,
            self.inner.clone(),
            None,
        ))
    }

    pub async fn get_addrs(&self) -> Vec<crate::transport::SipAddr> {
        self.inner.transport_layer.get_addrs().await
    }

    fn incoming_sender(&self) -> &Mutex<Option<UnboundedSender<Transaction>>> {
        &self.inner.incoming_sender
    }
}

impl EndpointInner {
    pub async fn process(self: Arc<Self>) -> Result<()> {
        let (sender, mut receiver) = unbounded_channel();
        self.transport_layer.serve_listens(sender).await?;

        let mut interval = tokio::time::interval(self.option.timer_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.process_timers();
                }
                event = receiver.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.on_transport_event(event).await {
                            warn!("error handling transport event: {}", e);
                        }
                    }
                    None => break,
                }
            }
        }
        Ok(())
    }

    fn process_timers(&self) {
        for timer in self.timers.poll(Instant::now()) {
            if let TransactionTimer::TimerCleanup(key) = &timer {
                self.finished_transactions.lock().unwrap().remove(key);
                continue;
            }
            let sender = self
                .attached_transactions
                .lock()
                .unwrap()
                .get(timer.key())
                .cloned();
            match sender {
                // the transaction re-checks its state, a stale timer is a no-op
                Some(sender) => {
                    sender.send(TransactionEvent::Timer(timer)).ok();
                }
                None => debug!("timer for detached transaction: {}", timer),
            }
        }
    }

    async fn on_transport_event(self: &Arc<Self>, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::Incoming(msg, connection, source) => match msg {
                SipMessage::Request(req) => self.handle_request(req, connection).await,
                SipMessage::Response(resp) => self.handle_response(resp, connection, source),
            },
            TransportEvent::New(connection) => {
                self.transport_layer.add_connection(connection).await;
                Ok(())
            }
            TransportEvent::Closed(connection) => {
                debug!("connection closed: {}", connection);
                Ok(())
            }
        }
    }

    async fn handle_request(
        self: &Arc<Self>,
        req: rsip::Request,
        connection: SipConnection,
    ) -> Result<()> {
        let key = TransactionKey::from_request(&req, TransactionRole::Server)?;

        let attached = self
            .attached_transactions
            .lock()
            .unwrap()
            .get(&key)
            .cloned();
        if let Some(sender) = attached {
            sender
                .send(TransactionEvent::Received(req.into(), Some(connection)))
                .ok();
            return Ok(());
        }

        match req.method {
            Method::Cancel => {
                // a CANCEL matches its INVITE by branch and sent-by alone
                let invite_key = key.with_method(Method::Invite);
                let invite_tx = self
                    .attached_transactions
                    .lock()
                    .unwrap()
                    .get(&invite_key)
                    .cloned();
                match invite_tx {
                    Some(sender) => {
                        sender
                            .send(TransactionEvent::Received(req.into(), Some(connection)))
                            .ok();
                    }
                    None => {
                        let resp = self.make_response(
                            &req,
                            StatusCode::CallTransactionDoesNotExist,
                            None,
                        );
                        connection.send(resp.into(), None).await?;
                    }
                }
                Ok(())
            }
            Method::Ack => {
                // a late ACK for an already-reaped transaction is absorbed;
                // a 2xx ACK carries a fresh branch and surfaces as its own
                // incoming transaction for the dialog layer to correlate
                if self.finished_transactions.lock().unwrap().contains_key(&key) {
                    debug!(key = %key, "late ACK absorbed");
                    return Ok(());
                }
                let tx = Transaction::new_server(key, req, self.clone(), Some(connection));
                let incoming = self.incoming_sender.lock().unwrap();
                match incoming.as_ref() {
                    Some(sender) => {
                        sender.send(tx).ok();
                    }
                    None => debug!("ACK without transaction dropped"),
                }
                Ok(())
            }
            _ => {
                let cached = self.finished_transactions.lock().unwrap().get(&key).cloned();
                if let Some(last_response) = cached {
                    debug!(key = %key, "request retransmission absorbed");
                    if let Some(resp) = last_response {
                        connection.send(resp.into(), None).await?;
                    }
                    return Ok(());
                }

                let has_consumer = self.incoming_sender.lock().unwrap().is_some();
                if !has_consumer {
                    warn!("no consumer for incoming transaction, rejecting");
                    let resp = self.make_response(&req, StatusCode::ServiceUnavailable, None);
                    connection.send(resp.into(), None).await?;
                    return Ok(());
                }

                let tx = Transaction::new_server(key, req, self.clone(), Some(connection));
                let incoming = self.incoming_sender.lock().unwrap();
                if let Some(sender) = incoming.as_ref() {
                    sender.send(tx).ok();
                }
                Ok(())
            }
        }
    }

    fn handle_response(
        &self,
        resp: Response,
        _connection: SipConnection,
        source: crate::transport::SipAddr,
    ) -> Result<()> {
        let key = TransactionKey::from_response(&resp, TransactionRole::Client)?;

        let attached = self
            .attached_transactions
            .lock()
            .unwrap()
            .get(&key)
            .cloned();
        if let Some(sender) = attached {
            sender
                .send(TransactionEvent::Received(resp.into(), None))
                .ok();
            return Ok(());
        }

        if self.finished_transactions.lock().unwrap().contains_key(&key) {
            debug!(key = %key, "response retransmission absorbed");
            return Ok(());
        }

        let msg: SipMessage = resp.into();
        if let Some(hook) = &self.option.stray_message_hook {
            hook(&msg);
        }
        debug!("dropping stray response from {}: {}", source, key);
        Ok(())
    }

    pub fn attach_transaction(&self, key: &TransactionKey, sender: TransactionSender) {
        debug!(key = %key, "attached transaction");
        self.attached_transactions
            .lock()
            .unwrap()
            .insert(key.clone(), sender);
    }

    /// Detach a transaction and park its key so retransmissions of the
    /// original request are answered from the cache until the cleanup
    /// timer reaps the entry.
    pub fn detach_transaction(&self, key: &TransactionKey, last_response: Option<Response>) {
        debug!(key = %key, "detached transaction");
        self.attached_transactions.lock().unwrap().remove(key);
        self.finished_transactions
            .lock()
            .unwrap()
            .insert(key.clone(), last_response);
        self.timers
            .timeout(self.option.t1x64, TransactionTimer::TimerCleanup(key.clone()));
    }

    #[cfg(test)]
    pub fn attached_len(&self) -> usize {
        self.attached_transactions.lock().unwrap().len()
    }

    #[cfg(test)]
    pub fn finished_len(&self) -> usize {
        self.finished_transactions.lock().unwrap().len()
    }
}
