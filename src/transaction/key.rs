use crate::{Error, Result};
use rsip::{
    param::Tag,
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    HostWithPort, Method,
};
use std::hash::Hash;

/// Which side of the exchange owns the transaction. Part of the key so a
/// client and a server transaction for the same branch (loopback traffic)
/// never collide in the endpoint's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

impl std::fmt::Display for TransactionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionRole::Client => write!(f, "c"),
            TransactionRole::Server => write!(f, "s"),
        }
    }
}

/// RFC 3261 matching: branch id plus the top Via sent-by, with ACK
/// normalized to its INVITE so both land on the same entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rfc3261 {
    pub role: TransactionRole,
    pub branch: String,
    pub sent_by: HostWithPort,
    pub method: Method,
    pub cseq: u32,
    pub call_id: String,
}

impl Hash for Rfc3261 {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.role.hash(state);
        self.branch.hash(state);
        self.sent_by.to_string().hash(state);
        self.method.to_string().hash(state);
        self.cseq.hash(state);
        self.call_id.hash(state);
    }
}

/// Fallback matching for peers that send no branch parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rfc2543 {
    pub role: TransactionRole,
    pub method: Method,
    pub cseq: u32,
    pub from_tag: Tag,
    pub call_id: String,
    pub via_host_port: HostWithPort,
}

impl Hash for Rfc2543 {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.role.hash(state);
        self.method.to_string().hash(state);
        self.cseq.hash(state);
        self.from_tag.to_string().hash(state);
        self.call_id.hash(state);
        self.via_host_port.to_string().hash(state);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransactionKey {
    Rfc3261(Rfc3261),
    Rfc2543(Rfc2543),
    Invalid,
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionKey::Rfc3261(key) => write!(
                f,
                "{} {}/{}/{} {}({})",
                key.call_id, key.role, key.method, key.cseq, key.sent_by, key.branch,
            ),
            TransactionKey::Rfc2543(key) => write!(
                f,
                "{} {}/{}/{} {}[{}]",
                key.call_id, key.role, key.method, key.cseq, key.from_tag, key.via_host_port,
            ),
            TransactionKey::Invalid => write!(f, "INVALID"),
        }
    }
}

impl TransactionKey {
    pub fn from_request(req: &rsip::Request, role: TransactionRole) -> Result<Self> {
        let via = req.via_header()?.typed()?;
        let mut method = req.method().clone();
        // an ACK belongs to the INVITE transaction it acknowledges
        if method == Method::Ack {
            method = Method::Invite;
        }
        let call_id = req.call_id_header()?.value().to_string();
        let cseq = req.cseq_header()?.seq()?;
        match via.branch() {
            Some(branch) => Ok(TransactionKey::Rfc3261(Rfc3261 {
                role,
                branch: branch.to_string(),
                sent_by: via.uri.host_with_port.clone(),
                method,
                cseq,
                call_id,
            })),
            None => {
                let from_tag = req.from_header()?.tag()?.ok_or(Error::TransactionError(
                    "from tag missing".to_string(),
                    TransactionKey::Invalid,
                ))?;
                Ok(TransactionKey::Rfc2543(Rfc2543 {
                    role,
                    method,
                    cseq,
                    from_tag,
                    call_id,
                    via_host_port: via.uri.host_with_port.clone(),
                }))
            }
        }
    }

    /// Responses match by the CSeq method, not the response itself.
    pub fn from_response(resp: &rsip::Response, role: TransactionRole) -> Result<Self> {
        let via = resp.via_header()?.typed()?;
        let cseq = resp.cseq_header()?;
        let method = cseq.method()?;
        let call_id = resp.call_id_header()?.value().to_string();
        match via.branch() {
            Some(branch) => Ok(TransactionKey::Rfc3261(Rfc3261 {
                role,
                branch: branch.to_string(),
                sent_by: via.uri.host_with_port.clone(),
                method,
                cseq: cseq.seq()?,
                call_id,
            })),
            None => {
                let from_tag = resp.from_header()?.tag()?.ok_or(Error::TransactionError(
                    "from tag missing".to_string(),
                    TransactionKey::Invalid,
                ))?;
                Ok(TransactionKey::Rfc2543(Rfc2543 {
                    role,
                    method,
                    cseq: cseq.seq()?,
                    from_tag,
                    call_id,
                    via_host_port: via.uri.host_with_port.clone(),
                }))
            }
        }
    }

    /// Same key with the method swapped; a CANCEL is matched to its INVITE
    /// by branch and sent-by alone, so swapping the method is enough.
    pub fn with_method(&self, method: Method) -> Self {
        match self {
            TransactionKey::Rfc3261(key) => TransactionKey::Rfc3261(Rfc3261 {
                method,
                ..key.clone()
            }),
            TransactionKey::Rfc2543(key) => TransactionKey::Rfc2543(Rfc2543 {
                method,
                ..key.clone()
            }),
            TransactionKey::Invalid => TransactionKey::Invalid,
        }
    }
}
