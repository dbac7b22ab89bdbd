use crate::Result;
use rsip::prelude::{HeadersExt, UntypedHeader};

pub mod client_dialog;
pub mod dialog;
pub mod dialog_layer;
pub mod server_dialog;
#[cfg(test)]
mod tests;

pub use client_dialog::ClientInviteDialog;
pub use dialog::{
    Dialog, DialogState, DialogStateReceiver, DialogStateSender, TerminatedReason, TimeoutReason,
};
pub use dialog_layer::{DialogLayer, DialogLayerOption};
pub use server_dialog::ServerInviteDialog;

/// Dialog identity: Call-ID plus the local/remote tag pair.
///
/// The remote tag is empty until the peer's first tagged message arrives;
/// the dialog is re-keyed in the layer once it is learned.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    /// The same dialog as seen from the peer's side. Used as a lookup
    /// fallback when an id was derived with the opposite orientation.
    pub fn swapped(&self) -> DialogId {
        DialogId {
            call_id: self.call_id.clone(),
            local_tag: self.remote_tag.clone(),
            remote_tag: self.local_tag.clone(),
        }
    }
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

/// UAS orientation: the request's From tag belongs to the remote party.
impl TryFrom<&rsip::Request> for DialogId {
    type Error = crate::Error;

    fn try_from(req: &rsip::Request) -> Result<Self> {
        Ok(DialogId {
            call_id: req.call_id_header()?.value().to_string(),
            local_tag: req
                .to_header()?
                .tag()?
                .map(|t| t.value().to_string())
                .unwrap_or_default(),
            remote_tag: req
                .from_header()?
                .tag()?
                .map(|t| t.value().to_string())
                .unwrap_or_default(),
        })
    }
}

/// UAC orientation: the response's To tag belongs to the remote party.
impl TryFrom<&rsip::Response> for DialogId {
    type Error = crate::Error;

    fn try_from(resp: &rsip::Response) -> Result<Self> {
        Ok(DialogId {
            call_id: resp.call_id_header()?.value().to_string(),
            local_tag: resp
                .from_header()?
                .tag()?
                .map(|t| t.value().to_string())
                .unwrap_or_default(),
            remote_tag: resp
                .to_header()?
                .tag()?
                .map(|t| t.value().to_string())
                .unwrap_or_default(),
        })
    }
}
