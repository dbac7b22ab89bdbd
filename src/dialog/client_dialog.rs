use super::{
    dialog::{DialogInnerRef, DialogState, TerminatedReason},
    DialogId,
};
use crate::{transaction::transaction::Transaction, Error, Result};
use rsip::{
    prelude::HeadersExt, Method, Response, SipMessage, StatusCode, StatusCodeKind,
};
use tracing::{debug, info, warn};

/// UAC side of an INVITE dialog.
///
/// The owner drives the originating INVITE transaction through
/// [`ClientInviteDialog::process`]; forked responses with distinct remote
/// tags spawn additional dialogs in the layer, each reachable through its
/// own handle and `fork_of` back-reference.
#[derive(Clone)]
pub struct ClientInviteDialog {
    pub(super) inner: DialogInnerRef,
}

impl ClientInviteDialog {
    pub fn id(&self) -> DialogId {
        self.inner.id()
    }

    pub fn state(&self) -> DialogState {
        self.inner.state.lock().unwrap().clone()
    }

    /// Drive the INVITE transaction to completion, updating this dialog
    /// (and any forks) from each response. Returns when the transaction
    /// terminates.
    pub async fn process(&self, tx: &mut Transaction) -> Result<()> {
        while let Some(msg) = tx.receive().await {
            let resp = match msg {
                SipMessage::Response(resp) => resp,
                // the INVITE client transaction only ever surfaces responses
                _ => continue,
            };
            match resp.status_code.kind() {
                StatusCodeKind::Provisional => {
                    if resp.status_code == StatusCode::Trying {
                        continue;
                    }
                    let dialog = self.dialog_for_response(&resp)?;
                    dialog
                        .inner
                        .transition(DialogState::Early(dialog.id(), resp))
                        .ok();
                }
                StatusCodeKind::Successful => {
                    let dialog = self.dialog_for_response(&resp)?;
                    dialog.inner.update_remote_target(&resp);
                    // a retransmitted 2xx collapses in transition, and a 2xx
                    // for an already-terminated dialog is only re-ACKed
                    dialog
                        .inner
                        .transition(DialogState::Confirmed(dialog.id(), resp.clone()))
                        .ok();
                    let ack = dialog.inner.make_ack(&resp).await?;
                    if let Err(e) = dialog.inner.send_ack(ack).await {
                        warn!(id = %dialog.id(), "failed to send ACK: {}", e);
                        return Err(e);
                    }
                    info!(id = %dialog.id(), "dialog confirmed");
                }
                _ => {
                    let reason = if resp.status_code == StatusCode::RequestTerminated {
                        TerminatedReason::UacCancel
                    } else {
                        TerminatedReason::UacOther(resp.status_code.clone())
                    };
                    debug!(id = %self.id(), "INVITE rejected: {}", resp.status_code);
                    self.inner
                        .transition(DialogState::Terminated(self.id(), reason))
                        .ok();
                }
            }
        }
        Ok(())
    }

    /// CANCEL the pending INVITE; the dialog terminates when the 487
    /// arrives through [`ClientInviteDialog::process`].
    pub async fn cancel(&self, tx: &mut Transaction) -> Result<()> {
        tx.send_cancel().await
    }

    pub async fn bye(&self) -> Result<()> {
        if self.inner.is_terminated() {
            return Err(Error::DialogTerminated(self.id()));
        }
        if !self.inner.is_confirmed() {
            return Ok(());
        }
        self.inner
            .transition(DialogState::Terminated(self.id(), TerminatedReason::UacBye))?;
        let bye = self.inner.make_request(Method::Bye, None, vec![], None).await?;
        self.inner.do_request(bye).await.map(|_| ())
    }

    /// In-dialog request arriving on its own server transaction.
    pub async fn handle_request(&self, tx: &mut Transaction) -> Result<()> {
        self.inner.handle_in_dialog_request(tx).await
    }

    /// Resolve which dialog a response belongs to. The first tagged
    /// response claims this dialog; each further distinct tag is a fork.
    fn dialog_for_response(&self, resp: &Response) -> Result<ClientInviteDialog> {
        let tag = resp
            .to_header()?
            .tag()?
            .map(|t| t.value().to_string())
            .unwrap_or_default();
        let current = self.id();
        if tag.is_empty() || tag == current.remote_tag {
            return Ok(self.clone());
        }
        if current.remote_tag.is_empty() {
            self.inner.adopt_remote_tag(&tag);
            return Ok(self.clone());
        }
        self.inner
            .dialog_layer_inner
            .fork_client_dialog(&self.inner, &tag)
    }
}
