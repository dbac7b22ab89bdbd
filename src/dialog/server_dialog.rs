use super::{
    dialog::{DialogInnerRef, DialogState, TerminatedReason},
    DialogId,
};
use crate::{transaction::transaction::Transaction, Error, Result};
use rsip::{Header, Method, SipMessage, StatusCode};
use tracing::{debug, info};

/// UAS side of an INVITE dialog.
///
/// Responses go out through the INVITE server transaction the dialog was
/// created from; after a 2xx the dialog waits for the ACK inside
/// [`ServerInviteDialog::handle`], bounded by the layer's ack-wait timer.
#[derive(Clone)]
pub struct ServerInviteDialog {
    pub(super) inner: DialogInnerRef,
}

impl ServerInviteDialog {
    pub fn id(&self) -> DialogId {
        self.inner.id()
    }

    pub fn state(&self) -> DialogState {
        self.inner.state.lock().unwrap().clone()
    }

    pub fn initial_request(&self) -> &rsip::Request {
        &self.inner.initial_request
    }

    pub async fn ringing(&self, tx: &mut Transaction) -> Result<()> {
        if !self.inner.is_early() {
            return Ok(());
        }
        let resp = self
            .inner
            .make_response(&tx.original, StatusCode::Ringing, vec![], None);
        tx.respond(resp.clone()).await?;
        self.inner.transition(DialogState::Early(self.id(), resp))
    }

    /// Answer with a 2xx and start waiting for the ACK.
    pub async fn accept(
        &self,
        tx: &mut Transaction,
        headers: Vec<Header>,
        body: Option<Vec<u8>>,
    ) -> Result<()> {
        if !self.inner.is_early() {
            return Err(Error::DialogError(
                "accept on a dialog past the early state".to_string(),
                self.id(),
            ));
        }
        let resp = self
            .inner
            .make_response(&tx.original, StatusCode::OK, headers, body);
        tx.respond(resp.clone()).await?;
        self.inner
            .transition(DialogState::WaitAck(self.id(), resp))?;
        self.inner.arm_ack_wait();
        Ok(())
    }

    pub async fn reject(&self, tx: &mut Transaction, status_code: StatusCode) -> Result<()> {
        if self.inner.is_terminated() || self.inner.is_confirmed() {
            return Ok(());
        }
        debug!(id = %self.id(), %status_code, "rejecting dialog");
        let resp = self
            .inner
            .make_response(&tx.original, status_code, vec![], None);
        tx.respond(resp).await?;
        self.inner.transition(DialogState::Terminated(
            self.id(),
            TerminatedReason::UasDecline,
        ))
    }

    /// Drive the INVITE transaction until it terminates: the ACK confirms
    /// the dialog, a CANCEL finishes the INVITE with a 487.
    pub async fn handle(&self, tx: &mut Transaction) -> Result<()> {
        while let Some(msg) = tx.receive().await {
            let req = match msg {
                SipMessage::Request(req) => req,
                _ => continue,
            };
            match req.method {
                Method::Ack => {
                    if self.inner.is_terminated() {
                        break;
                    }
                    info!(id = %self.id(), "dialog confirmed");
                    self.inner.confirm()?;
                }
                Method::Cancel => {
                    debug!(id = %self.id(), "INVITE cancelled");
                    tx.reply(StatusCode::RequestTerminated).await?;
                    self.inner
                        .transition(DialogState::Terminated(
                            self.id(),
                            TerminatedReason::UacCancel,
                        ))
                        .ok();
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// In-dialog request arriving on its own server transaction.
    pub async fn handle_request(&self, tx: &mut Transaction) -> Result<()> {
        self.inner.handle_in_dialog_request(tx).await
    }

    pub async fn bye(&self) -> Result<()> {
        if self.inner.is_terminated() {
            return Err(Error::DialogTerminated(self.id()));
        }
        if !self.inner.is_confirmed() && !self.inner.waiting_ack() {
            return Ok(());
        }
        self.inner
            .transition(DialogState::Terminated(self.id(), TerminatedReason::UasBye))?;
        let bye = self.inner.make_request(Method::Bye, None, vec![], None).await?;
        self.inner.do_request(bye).await.map(|_| ())
    }
}
