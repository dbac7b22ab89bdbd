use super::{
    client_dialog::ClientInviteDialog,
    dialog_layer::{DialogLayerInnerRef, DialogTimer},
    server_dialog::ServerInviteDialog,
    DialogId,
};
use crate::{
    transaction::{
        key::{TransactionKey, TransactionRole},
        transaction::Transaction,
        EndpointInnerRef,
    },
    transport::{SipAddr, SipConnection},
    Error, Result,
};
use rsip::{
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    Header, Method, Param, Request, Response, SipMessage, StatusCode,
};
use std::{
    any::Any,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Dialog lifecycle, published on the dialog's state channel.
///
/// `Timeout` is a notification, not a stored state: it reports an expired
/// dialog timer and may be followed by a `Terminated` when linked-agent
/// recovery is enabled.
#[derive(Clone)]
pub enum DialogState {
    Calling(DialogId),
    Early(DialogId, Response),
    WaitAck(DialogId, Response),
    Confirmed(DialogId, Response),
    Terminated(DialogId, TerminatedReason),
    Timeout(DialogId, TimeoutReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TerminatedReason {
    UacCancel,
    UacBye,
    UasBye,
    UasDecline,
    UacOther(StatusCode),
    Timeout(TimeoutReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutReason {
    /// The 2xx to an INVITE was never acknowledged within the ack-wait
    /// window.
    AckNotReceived,
    /// The dialog sat in an early state longer than the configured bound.
    EarlyStateTimeout,
}

impl DialogState {
    pub fn id(&self) -> &DialogId {
        match self {
            DialogState::Calling(id)
            | DialogState::Early(id, _)
            | DialogState::WaitAck(id, _)
            | DialogState::Confirmed(id, _)
            | DialogState::Terminated(id, _)
            | DialogState::Timeout(id, _) => id,
        }
    }

    pub fn is_early(&self) -> bool {
        matches!(self, DialogState::Calling(_) | DialogState::Early(_, _))
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, DialogState::Confirmed(_, _))
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, DialogState::Terminated(_, _))
    }

    pub fn waiting_ack(&self) -> bool {
        matches!(self, DialogState::WaitAck(_, _))
    }
}

impl std::fmt::Display for DialogState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialogState::Calling(_) => write!(f, "Calling"),
            DialogState::Early(_, resp) => write!(f, "Early({})", resp.status_code),
            DialogState::WaitAck(_, resp) => write!(f, "WaitAck({})", resp.status_code),
            DialogState::Confirmed(_, _) => write!(f, "Confirmed"),
            DialogState::Terminated(_, reason) => write!(f, "Terminated({:?})", reason),
            DialogState::Timeout(_, reason) => write!(f, "Timeout({:?})", reason),
        }
    }
}

pub type DialogStateReceiver = UnboundedReceiver<DialogState>;
pub type DialogStateSender = UnboundedSender<DialogState>;

/// Shared dialog core. Both dialog handles are thin `Arc` wrappers around
/// this; all mutable state is behind its own lock and every lock is
/// released before anything asynchronous happens.
pub struct DialogInner {
    pub role: TransactionRole,
    pub cancel_token: CancellationToken,
    pub id: Mutex<DialogId>,
    pub state: Mutex<DialogState>,

    pub local_seq: AtomicU32,
    pub remote_seq: AtomicU32,
    pub local_contact: Option<rsip::Uri>,
    pub remote_uri: Mutex<rsip::Uri>,
    pub remote_contact: Mutex<Option<rsip::Uri>>,

    pub from: rsip::typed::From,
    pub to: Mutex<rsip::typed::To>,
    pub route_set: Mutex<Vec<rsip::headers::Route>>,

    /// Back-reference to the dialog this one forked from, if any.
    pub fork_of: Option<DialogId>,
    /// Non-owning reference to the paired dialog in linked-agent setups.
    pub peer: Mutex<Option<DialogId>>,

    pub(super) linked_agent: AtomicBool,
    pub(super) validate_sequence: AtomicBool,
    pub(super) app_data: Mutex<Option<Arc<dyn Any + Send + Sync>>>,

    pub(super) endpoint_inner: EndpointInnerRef,
    pub(super) dialog_layer_inner: DialogLayerInnerRef,
    pub(super) state_sender: DialogStateSender,
    pub(super) initial_request: Request,

    pub(super) early_timer: Mutex<Option<u64>>,
    pub(super) ack_timer: Mutex<Option<u64>>,
}

pub type DialogInnerRef = Arc<DialogInner>;

#[derive(Clone)]
pub enum Dialog {
    ClientInvite(ClientInviteDialog),
    ServerInvite(ServerInviteDialog),
}

impl Dialog {
    pub fn id(&self) -> DialogId {
        self.inner().id.lock().unwrap().clone()
    }

    pub fn state(&self) -> DialogState {
        self.inner().state.lock().unwrap().clone()
    }

    pub fn inner(&self) -> &DialogInnerRef {
        match self {
            Dialog::ClientInvite(d) => &d.inner,
            Dialog::ServerInvite(d) => &d.inner,
        }
    }

    /// Handle an in-dialog request arriving on its own server transaction.
    pub async fn handle_request(&self, tx: &mut Transaction) -> Result<()> {
        self.inner().handle_in_dialog_request(tx).await
    }

    pub async fn bye(&self) -> Result<()> {
        match self {
            Dialog::ClientInvite(d) => d.bye().await,
            Dialog::ServerInvite(d) => d.bye().await,
        }
    }
}

impl DialogInner {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        role: TransactionRole,
        id: DialogId,
        initial_request: Request,
        endpoint_inner: EndpointInnerRef,
        dialog_layer_inner: DialogLayerInnerRef,
        state_sender: DialogStateSender,
        local_contact: Option<rsip::Uri>,
        fork_of: Option<DialogId>,
    ) -> Result<DialogInnerRef> {
        let cseq = initial_request.cseq_header()?.seq()?;

        let remote_uri = match role {
            TransactionRole::Client => initial_request.uri.clone(),
            TransactionRole::Server => match contact_uri(&initial_request.headers) {
                Some(uri) => uri,
                None => initial_request.from_header()?.typed()?.uri,
            },
        };

        let from = initial_request.from_header()?.typed()?;
        let mut to = initial_request.to_header()?.typed()?;
        if !to.params.iter().any(|p| matches!(p, Param::Tag(_))) {
            let tag = match role {
                TransactionRole::Client => &id.remote_tag,
                TransactionRole::Server => &id.local_tag,
            };
            if !tag.is_empty() {
                to.params.push(Param::Tag(tag.clone().into()));
            }
        }

        let mut route_set = Vec::new();
        for header in initial_request.headers.iter() {
            if let Header::RecordRoute(rr) = header {
                route_set.push(rsip::headers::Route::from(rr.value()));
            }
        }
        if role == TransactionRole::Client {
            route_set.reverse();
        }

        let option = &dialog_layer_inner.option;
        let inner = DialogInner {
            role,
            cancel_token: dialog_layer_inner.cancel_token.child_token(),
            state: Mutex::new(DialogState::Calling(id.clone())),
            id: Mutex::new(id),
            local_seq: AtomicU32::new(cseq),
            remote_seq: AtomicU32::new(match role {
                TransactionRole::Client => 0,
                TransactionRole::Server => cseq,
            }),
            local_contact,
            remote_uri: Mutex::new(remote_uri),
            remote_contact: Mutex::new(None),
            from,
            to: Mutex::new(to),
            route_set: Mutex::new(route_set),
            fork_of,
            peer: Mutex::new(None),
            linked_agent: AtomicBool::new(option.linked_agent),
            validate_sequence: AtomicBool::new(option.validate_sequence),
            app_data: Mutex::new(None),
            endpoint_inner,
            dialog_layer_inner,
            state_sender,
            initial_request,
            early_timer: Mutex::new(None),
            ack_timer: Mutex::new(None),
        };
        Ok(Arc::new(inner))
    }

    pub fn id(&self) -> DialogId {
        self.id.lock().unwrap().clone()
    }

    pub fn is_early(&self) -> bool {
        self.state.lock().unwrap().is_early()
    }

    pub fn is_confirmed(&self) -> bool {
        self.state.lock().unwrap().is_confirmed()
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().unwrap().is_terminated()
    }

    pub fn waiting_ack(&self) -> bool {
        self.state.lock().unwrap().waiting_ack()
    }

    pub fn increment_local_seq(&self) -> u32 {
        self.local_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Opaque caller-owned slot; the engine never inspects it.
    pub fn set_app_data(&self, data: Arc<dyn Any + Send + Sync>) {
        self.app_data.lock().unwrap().replace(data);
    }

    pub fn app_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.app_data.lock().unwrap().clone()
    }

    pub fn enable_linked_agent(&self) {
        self.linked_agent.store(true, Ordering::Relaxed);
    }

    pub fn linked_agent(&self) -> bool {
        self.linked_agent.load(Ordering::Relaxed)
    }

    pub fn disable_sequence_validation(&self) {
        self.validate_sequence.store(false, Ordering::Relaxed);
    }

    pub fn set_peer(&self, peer: Option<DialogId>) {
        *self.peer.lock().unwrap() = peer;
    }

    /// Re-arm the early-dialog timeout with a per-dialog value.
    pub fn set_early_timeout(&self, duration: Duration) {
        let timers = &self.dialog_layer_inner.timers;
        if let Some(task_id) = self.early_timer.lock().unwrap().take() {
            timers.cancel(task_id);
        }
        let task_id = timers.timeout(duration, DialogTimer::EarlyTimeout(self.id()));
        self.early_timer.lock().unwrap().replace(task_id);
    }

    pub(super) fn arm_ack_wait(&self) {
        let timers = &self.dialog_layer_inner.timers;
        let task_id = timers.timeout(
            self.dialog_layer_inner.option.ack_wait,
            DialogTimer::AckWait(self.id()),
        );
        self.ack_timer.lock().unwrap().replace(task_id);
    }

    /// Monotonic CSeq check per direction; decreasing values are rejected
    /// unless validation has been disabled for this dialog.
    pub fn validate_remote_seq(&self, cseq: u32) -> Result<()> {
        let current = self.remote_seq.load(Ordering::Relaxed);
        if self.validate_sequence.load(Ordering::Relaxed) && current > 0 && cseq < current {
            return Err(Error::DialogSequenceError(
                format!("CSeq {} after {}", cseq, current),
                self.id(),
            ));
        }
        self.remote_seq.store(cseq.max(current), Ordering::Relaxed);
        Ok(())
    }

    /// Learn the peer's tag: update the id, the To header (client side) and
    /// the layer's dialog table key.
    pub(super) fn adopt_remote_tag(&self, tag: &str) {
        let old = self.id();
        if old.remote_tag == tag {
            return;
        }
        let mut new = old.clone();
        new.remote_tag = tag.to_string();
        *self.id.lock().unwrap() = new.clone();
        if self.role == TransactionRole::Client {
            let mut to = self.to.lock().unwrap();
            *to = to.clone().with_tag(tag.into());
        }
        self.dialog_layer_inner.rekey_dialog(&old, new);
    }

    pub(super) fn update_remote_target(&self, resp: &Response) {
        if let Some(contact) = contact_uri(&resp.headers) {
            self.remote_contact.lock().unwrap().replace(contact);
        }
        if self.role == TransactionRole::Client {
            let mut route_set: Vec<rsip::headers::Route> = resp
                .headers
                .iter()
                .filter_map(|h| match h {
                    Header::RecordRoute(rr) => Some(rsip::headers::Route::from(rr.value())),
                    _ => None,
                })
                .collect();
            if !route_set.is_empty() {
                route_set.reverse();
                *self.route_set.lock().unwrap() = route_set;
            }
        }
    }

    pub fn remote_target(&self) -> rsip::Uri {
        self.remote_contact
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| self.remote_uri.lock().unwrap().clone())
    }

    /// Build an in-dialog request: current remote target, route set, local
    /// CSeq (incremented unless an explicit value is given, as for ACK).
    pub async fn make_request(
        &self,
        method: Method,
        cseq: Option<u32>,
        extra_headers: Vec<Header>,
        body: Option<Vec<u8>>,
    ) -> Result<Request> {
        let via = self.endpoint_inner.get_via(None, None).await?;
        let seq = cseq.unwrap_or_else(|| self.increment_local_seq());

        let (from, to) = self.local_remote_headers();
        let mut headers: Vec<Header> = vec![
            Header::Via(via.into()),
            Header::CallId(self.id.lock().unwrap().call_id.clone().into()),
            from,
            to,
            Header::CSeq(rsip::typed::CSeq { seq, method }.into()),
            Header::MaxForwards(70.into()),
            Header::UserAgent(self.endpoint_inner.user_agent.clone().into()),
        ];
        if let Some(contact) = &self.local_contact {
            headers.push(Header::Contact(
                rsip::typed::Contact {
                    display_name: None,
                    uri: contact.clone(),
                    params: vec![],
                }
                .into(),
            ));
        }
        for route in self.route_set.lock().unwrap().iter() {
            headers.push(Header::Route(route.clone()));
        }
        headers.extend(extra_headers);
        headers.push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));

        Ok(Request {
            method,
            uri: self.remote_target(),
            headers: headers.into(),
            body: body.unwrap_or_default(),
            version: rsip::Version::V2,
        })
    }

    /// From/To for outgoing requests: a server dialog swaps the stored
    /// pair, since its From was the peer's.
    fn local_remote_headers(&self) -> (Header, Header) {
        let from = self.from.clone();
        let to = self.to.lock().unwrap().clone();
        match self.role {
            TransactionRole::Client => (Header::From(from.into()), Header::To(to.into())),
            TransactionRole::Server => {
                let local = rsip::typed::From {
                    display_name: to.display_name,
                    uri: to.uri,
                    params: to.params,
                };
                let remote = rsip::typed::To {
                    display_name: from.display_name,
                    uri: from.uri,
                    params: from.params,
                };
                (Header::From(local.into()), Header::To(remote.into()))
            }
        }
    }

    /// Response to an in-dialog (or the initial) request, with this
    /// dialog's To-tag and Contact attached.
    pub fn make_response(
        &self,
        req: &Request,
        status_code: StatusCode,
        extra_headers: Vec<Header>,
        body: Option<Vec<u8>>,
    ) -> Response {
        let mut resp = self.endpoint_inner.make_response(req, status_code, body);
        let local_tag = self.id.lock().unwrap().local_tag.clone();
        if !local_tag.is_empty() {
            if let Some(to) = req.to_header().ok().and_then(|t| t.typed().ok()) {
                if !to.params.iter().any(|p| matches!(p, Param::Tag(_))) {
                    resp.headers
                        .unique_push(Header::To(to.with_tag(local_tag.into()).into()));
                }
            }
        }
        if let Some(contact) = &self.local_contact {
            resp.headers.unique_push(Header::Contact(
                rsip::typed::Contact {
                    display_name: None,
                    uri: contact.clone(),
                    params: vec![],
                }
                .into(),
            ));
        }
        for header in extra_headers {
            resp.headers.unique_push(header);
        }
        resp
    }

    /// ACK for a 2xx: same CSeq number as the 2xx, fresh branch, current
    /// route set and remote target.
    pub async fn make_ack(&self, resp: &Response) -> Result<Request> {
        let seq = resp.cseq_header()?.seq()?;
        self.make_request(Method::Ack, Some(seq), vec![], None).await
    }

    /// The 2xx ACK bypasses the transaction layer and goes straight to the
    /// transport layer, with its stale-connection eviction and retry.
    pub async fn send_ack(&self, ack: Request) -> Result<()> {
        let target = SipConnection::get_destination(&ack.clone().into())?;
        self.endpoint_inner
            .transport_layer
            .send_message(ack.into(), Some(&target))
            .await
            .map(|_| ())
    }

    /// Run a request through its own client transaction and return the
    /// final response, if any.
    pub async fn do_request(&self, request: Request) -> Result<Option<Response>> {
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint_inner.clone(), None);

        // loose routing: the first Route entry, not the request URI,
        // decides where the request is physically sent
        if let Some(route) = tx.original.route_header() {
            if let Some(first) = route.typed().ok().and_then(|r| r.uris().first().cloned()) {
                tx.destination = SipAddr::try_from(&first.uri).ok();
            }
        }
        tx.send().await?;

        while let Some(msg) = tx.receive().await {
            if let SipMessage::Response(resp) = msg {
                if resp.status_code.kind() == rsip::StatusCodeKind::Provisional {
                    continue;
                }
                return Ok(Some(resp));
            }
        }
        Ok(None)
    }

    /// BYE without state checks, used by linked-agent recovery after the
    /// dialog was already marked terminated.
    pub(super) async fn send_bye(&self) -> Result<()> {
        let bye = self.make_request(Method::Bye, None, vec![], None).await?;
        self.do_request(bye).await.map(|_| ())
    }

    /// Shared handling of in-dialog requests arriving on their own server
    /// transactions: BYE tears the dialog down, a stray 2xx ACK confirms
    /// it, session-touching methods get a 200.
    pub(super) async fn handle_in_dialog_request(&self, tx: &mut Transaction) -> Result<()> {
        debug!(id = %self.id(), method = %tx.original.method, "in-dialog request");
        if tx.original.method != Method::Ack {
            let cseq = tx.original.cseq_header()?.seq()?;
            if let Err(e) = self.validate_remote_seq(cseq) {
                warn!(id = %self.id(), "{}", e);
                tx.reply(StatusCode::ServerInternalError).await?;
                return Err(e);
            }
        }

        match tx.original.method {
            Method::Bye => {
                tx.reply(StatusCode::OK).await?;
                let reason = match self.role {
                    TransactionRole::Client => TerminatedReason::UasBye,
                    TransactionRole::Server => TerminatedReason::UacBye,
                };
                self.transition(DialogState::Terminated(self.id(), reason))
            }
            Method::Ack => self.confirm(),
            Method::Info | Method::Options | Method::Update | Method::Message => {
                tx.reply(StatusCode::OK).await
            }
            _ => {
                tx.reply(StatusCode::MethodNotAllowed).await?;
                Err(Error::DialogError(
                    format!("unexpected in-dialog {}", tx.original.method),
                    self.id(),
                ))
            }
        }
    }

    /// ACK observed for our 2xx: cancel the ack-wait timer and confirm.
    /// A duplicate ACK is a no-op.
    pub(super) fn confirm(&self) -> Result<()> {
        let resp = match &*self.state.lock().unwrap() {
            DialogState::WaitAck(_, resp) => resp.clone(),
            _ => return Ok(()),
        };
        if let Some(task_id) = self.ack_timer.lock().unwrap().take() {
            self.dialog_layer_inner.timers.cancel(task_id);
        }
        self.transition(DialogState::Confirmed(self.id(), resp))
    }

    pub(super) fn notify_timeout(&self, reason: TimeoutReason) {
        info!(id = %self.id(), "dialog timeout: {:?}", reason);
        self.state_sender
            .send(DialogState::Timeout(self.id(), reason))
            .ok();
    }

    /// Move to `state`, publishing exactly one notification per distinct
    /// state. A terminated dialog never re-enters a non-terminal state.
    pub fn transition(&self, state: DialogState) -> Result<()> {
        {
            let mut guard = self.state.lock().unwrap();
            if guard.is_terminated() {
                return Err(Error::DialogTerminated(self.id()));
            }
            if std::mem::discriminant(&*guard) == std::mem::discriminant(&state) {
                return Ok(());
            }
            info!(id = %self.id(), "transition {} -> {}", guard, state);
            *guard = state.clone();
        }
        if state.is_terminated() {
            self.cancel_timers();
            self.cancel_token.cancel();
            self.dialog_layer_inner.schedule_release(self.id());
        }
        self.state_sender.send(state).ok();
        Ok(())
    }

    fn cancel_timers(&self) {
        let timers = &self.dialog_layer_inner.timers;
        if let Some(task_id) = self.early_timer.lock().unwrap().take() {
            timers.cancel(task_id);
        }
        if let Some(task_id) = self.ack_timer.lock().unwrap().take() {
            timers.cancel(task_id);
        }
    }
}

/// First Contact header as a URI, if present and parsable.
pub(super) fn contact_uri(headers: &rsip::Headers) -> Option<rsip::Uri> {
    headers.iter().find_map(|h| match h {
        Header::Contact(contact) => contact.typed().ok().map(|c| c.uri),
        _ => None,
    })
}
