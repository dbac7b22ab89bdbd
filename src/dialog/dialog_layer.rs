use super::{
    client_dialog::ClientInviteDialog,
    dialog::{Dialog, DialogInner, DialogInnerRef, DialogState, DialogStateSender, TimeoutReason},
    server_dialog::ServerInviteDialog,
    DialogId,
};
use crate::{
    timer::Timer,
    transaction::{
        key::{TransactionKey, TransactionRole},
        make_tag,
        transaction::Transaction,
        EndpointInnerRef,
    },
    Error, Result,
};
use rsip::prelude::{HeadersExt, UntypedHeader};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Dialog-level timers, polled by [`DialogLayer::serve`]. All of them are
/// safe no-ops when the dialog has moved on by the time they fire.
#[derive(Debug, Clone)]
pub enum DialogTimer {
    /// Dialog still in an early state when this fires.
    EarlyTimeout(DialogId),
    /// 2xx sent, ACK still missing.
    AckWait(DialogId),
    /// Terminated dialog kept around to absorb late in-dialog messages.
    Release(DialogId),
}

impl std::fmt::Display for DialogTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialogTimer::EarlyTimeout(id) => write!(f, "EarlyTimeout({})", id),
            DialogTimer::AckWait(id) => write!(f, "AckWait({})", id),
            DialogTimer::Release(id) => write!(f, "Release({})", id),
        }
    }
}

#[derive(Clone)]
pub struct DialogLayerOption {
    /// How long a dialog may sit in Calling/Early before a timeout
    /// notification is raised. Overridable per dialog.
    pub early_timeout: Duration,
    /// Window for the 2xx ACK before `AckNotReceived` recovery kicks in.
    pub ack_wait: Duration,
    /// When set, expired dialogs are torn down with a synthesized BYE on
    /// the application's behalf instead of notification only.
    pub linked_agent: bool,
    pub validate_sequence: bool,
}

impl Default for DialogLayerOption {
    fn default() -> Self {
        DialogLayerOption {
            early_timeout: Duration::from_secs(300),
            ack_wait: Duration::from_secs(9),
            linked_agent: false,
            validate_sequence: true,
        }
    }
}

pub struct DialogLayerInner {
    pub endpoint: EndpointInnerRef,
    pub option: DialogLayerOption,
    pub timers: Timer<DialogTimer>,
    pub cancel_token: CancellationToken,
    dialogs: Mutex<HashMap<DialogId, Dialog>>,
}

pub type DialogLayerInnerRef = Arc<DialogLayerInner>;

/// Owns the dialog table and the dialog timer loop, and creates dialogs
/// on both the UAC and UAS side.
#[derive(Clone)]
pub struct DialogLayer {
    pub inner: DialogLayerInnerRef,
}

impl DialogLayer {
    pub fn new(endpoint: EndpointInnerRef) -> Self {
        DialogLayer::with_option(endpoint, DialogLayerOption::default())
    }

    pub fn with_option(endpoint: EndpointInnerRef, option: DialogLayerOption) -> Self {
        let cancel_token = endpoint.cancel_token.child_token();
        DialogLayer {
            inner: Arc::new(DialogLayerInner {
                endpoint,
                option,
                timers: Timer::new(),
                cancel_token,
                dialogs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a UAC dialog plus the client INVITE transaction that will
    /// establish it. The caller sends the transaction and then drives it
    /// with [`ClientInviteDialog::process`].
    pub fn create_client_invite(
        &self,
        request: rsip::Request,
        state_sender: DialogStateSender,
        local_contact: Option<rsip::Uri>,
    ) -> Result<(ClientInviteDialog, Transaction)> {
        let local_tag = request
            .from_header()?
            .tag()?
            .map(|t| t.value().to_string())
            .unwrap_or_default();
        if local_tag.is_empty() {
            return Err(Error::SipMessageError(
                "INVITE without a From tag".to_string(),
            ));
        }
        let id = DialogId {
            call_id: request.call_id_header()?.value().to_string(),
            local_tag,
            remote_tag: String::new(),
        };

        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let tx = Transaction::new_client(key, request.clone(), self.inner.endpoint.clone(), None);

        let inner = DialogInner::new(
            TransactionRole::Client,
            id.clone(),
            request,
            self.inner.endpoint.clone(),
            self.inner.clone(),
            state_sender,
            local_contact,
            None,
        )?;
        let dialog = ClientInviteDialog {
            inner: inner.clone(),
        };
        self.inner.insert_dialog(Dialog::ClientInvite(dialog.clone()));
        inner.set_early_timeout(self.inner.option.early_timeout);
        inner.state_sender.send(DialogState::Calling(id)).ok();
        Ok((dialog, tx))
    }

    /// Fetch or create the UAS dialog for an incoming INVITE transaction.
    /// A retransmitted INVITE maps back to the existing dialog.
    pub fn get_or_create_server_invite(
        &self,
        tx: &Transaction,
        state_sender: DialogStateSender,
        local_contact: Option<rsip::Uri>,
    ) -> Result<ServerInviteDialog> {
        let mut id = DialogId::try_from(&tx.original)?;
        if id.remote_tag.is_empty() {
            return Err(Error::SipMessageError(
                "INVITE without a From tag".to_string(),
            ));
        }
        if id.local_tag.is_empty() {
            id.local_tag = make_tag().value().to_string();
        } else if let Some(Dialog::ServerInvite(dialog)) = self.get_dialog(&id) {
            return Ok(dialog);
        }

        let inner = DialogInner::new(
            TransactionRole::Server,
            id.clone(),
            tx.original.clone(),
            self.inner.endpoint.clone(),
            self.inner.clone(),
            state_sender,
            local_contact,
            None,
        )?;
        let dialog = ServerInviteDialog {
            inner: inner.clone(),
        };
        self.inner.insert_dialog(Dialog::ServerInvite(dialog.clone()));
        inner.set_early_timeout(self.inner.option.early_timeout);
        inner.state_sender.send(DialogState::Calling(id)).ok();
        Ok(dialog)
    }

    pub fn get_dialog(&self, id: &DialogId) -> Option<Dialog> {
        self.inner.get_dialog(id)
    }

    /// Route an incoming in-dialog request (BYE, the 2xx ACK, INFO ...) to
    /// its dialog by Call-ID and tag pair.
    pub fn match_dialog(&self, req: &rsip::Request) -> Option<Dialog> {
        let id = DialogId::try_from(req).ok()?;
        self.inner.get_dialog(&id)
    }

    pub fn remove_dialog(&self, id: &DialogId) {
        self.inner.remove_dialog(id);
    }

    pub fn len(&self) -> usize {
        self.inner.dialogs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Poll dialog timers until cancelled. Callers usually spawn this.
    pub async fn serve(&self) {
        let mut interval = tokio::time::interval(self.inner.endpoint.option.timer_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.inner.cancel_token.cancelled() => {
                    info!("dialog layer cancelled");
                    break;
                }
                _ = interval.tick() => {
                    for timer in self.inner.timers.poll(Instant::now()) {
                        self.inner.on_timer(timer);
                    }
                }
            }
        }
    }
}

impl DialogLayerInner {
    fn insert_dialog(&self, dialog: Dialog) {
        let id = dialog.id();
        debug!(id = %id, "dialog created");
        self.dialogs.lock().unwrap().insert(id, dialog);
    }

    pub(super) fn get_dialog(&self, id: &DialogId) -> Option<Dialog> {
        let dialogs = self.dialogs.lock().unwrap();
        dialogs
            .get(id)
            .or_else(|| dialogs.get(&id.swapped()))
            .cloned()
    }

    pub(super) fn remove_dialog(&self, id: &DialogId) {
        debug!(id = %id, "dialog removed");
        self.dialogs.lock().unwrap().remove(id);
    }

    /// Move a dialog to its completed id once the remote tag is learned.
    pub(super) fn rekey_dialog(&self, old: &DialogId, new: DialogId) {
        let mut dialogs = self.dialogs.lock().unwrap();
        if let Some(dialog) = dialogs.remove(old) {
            debug!(old = %old, new = %new, "dialog re-keyed");
            dialogs.insert(new, dialog);
        }
    }

    /// One extra dialog per distinct remote tag observed on the same
    /// INVITE transaction. The fork shares the original's request and
    /// carries `fork_of` back to it.
    pub(super) fn fork_client_dialog(
        self: &Arc<Self>,
        original: &DialogInnerRef,
        remote_tag: &str,
    ) -> Result<ClientInviteDialog> {
        let original_id = original.id();
        let forked_id = DialogId {
            call_id: original_id.call_id.clone(),
            local_tag: original_id.local_tag.clone(),
            remote_tag: remote_tag.to_string(),
        };
        if let Some(Dialog::ClientInvite(existing)) = self.get_dialog(&forked_id) {
            return Ok(existing);
        }
        info!(id = %forked_id, fork_of = %original_id, "forked dialog");

        let inner = DialogInner::new(
            TransactionRole::Client,
            forked_id,
            original.initial_request.clone(),
            self.endpoint.clone(),
            self.clone(),
            original.state_sender.clone(),
            original.local_contact.clone(),
            Some(original_id),
        )?;
        let dialog = ClientInviteDialog { inner };
        self.insert_dialog(Dialog::ClientInvite(dialog.clone()));
        dialog
            .inner
            .set_early_timeout(self.option.early_timeout);
        Ok(dialog)
    }

    pub(super) fn schedule_release(&self, id: DialogId) {
        self.timers
            .timeout(self.endpoint.option.t1x64, DialogTimer::Release(id));
    }

    fn on_timer(self: &Arc<Self>, timer: DialogTimer) {
        match timer {
            DialogTimer::Release(id) => self.remove_dialog(&id),
            DialogTimer::EarlyTimeout(id) => {
                let dialog = match self.get_dialog(&id) {
                    Some(dialog) if dialog.inner().is_early() => dialog,
                    _ => return,
                };
                dialog.inner().notify_timeout(TimeoutReason::EarlyStateTimeout);
                if dialog.inner().linked_agent() {
                    dialog
                        .inner()
                        .transition(DialogState::Terminated(
                            id,
                            super::TerminatedReason::Timeout(TimeoutReason::EarlyStateTimeout),
                        ))
                        .ok();
                }
            }
            DialogTimer::AckWait(id) => {
                let dialog = match self.get_dialog(&id) {
                    Some(dialog) if dialog.inner().waiting_ack() => dialog,
                    _ => return,
                };
                let inner = dialog.inner();
                inner.notify_timeout(TimeoutReason::AckNotReceived);
                if !inner.linked_agent() {
                    return;
                }
                // tear the call down on the application's behalf, and take
                // the paired dialog with it when one is linked
                warn!(id = %id, "no ACK received, sending BYE");
                inner
                    .transition(DialogState::Terminated(
                        id,
                        super::TerminatedReason::Timeout(TimeoutReason::AckNotReceived),
                    ))
                    .ok();
                let bye_inner = inner.clone();
                tokio::spawn(async move {
                    if let Err(e) = bye_inner.send_bye().await {
                        warn!(id = %bye_inner.id(), "recovery BYE failed: {}", e);
                    }
                });
                let peer = inner.peer.lock().unwrap().clone();
                if let Some(peer_id) = peer {
                    if let Some(peer_dialog) = self.get_dialog(&peer_id) {
                        tokio::spawn(async move {
                            if let Err(e) = peer_dialog.bye().await {
                                warn!(id = %peer_dialog.id(), "peer BYE failed: {}", e);
                            }
                        });
                    }
                }
            }
        }
    }
}
