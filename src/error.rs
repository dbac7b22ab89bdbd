use crate::dialog::DialogId;
use crate::transaction::key::TransactionKey;
use crate::transport::SipAddr;

/// Engine-wide error type.
///
/// Variants carry the identity of the object that failed (transaction key,
/// dialog id, destination address) so callers can correlate a failure with
/// the exchange it belongs to without parsing message text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed or unparsable message, handled locally and not fatal.
    SipMessageError(String),
    /// Out-of-sequence or otherwise invalid message inside a valid exchange.
    ProtocolViolation(String),
    /// Generic transport layer error with the destination it concerns.
    TransportLayerError(String, SipAddr),
    /// Connect/send failed after bounded retry; the cache entry was evicted.
    TransportFailure(String, SipAddr),
    /// The peer policy hook rejected a secure connection after the handshake.
    PolicyRejection(String, SipAddr),
    TransactionError(String, TransactionKey),
    /// Operation on a transaction that already reached Terminated.
    TransactionTerminated(TransactionKey),
    DialogError(String, DialogId),
    /// Operation on a dialog that already reached Terminated.
    DialogTerminated(DialogId),
    /// In-dialog request with a decreasing CSeq while validation is enabled.
    DialogSequenceError(String, DialogId),
    ChannelError(String),
    Error(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::SipMessageError(e) => write!(f, "sip message error: {}", e),
            Error::ProtocolViolation(e) => write!(f, "protocol violation: {}", e),
            Error::TransportLayerError(e, addr) => {
                write!(f, "transport layer error: {} ({})", e, addr)
            }
            Error::TransportFailure(e, addr) => write!(f, "transport failure: {} ({})", e, addr),
            Error::PolicyRejection(e, addr) => write!(f, "policy rejection: {} ({})", e, addr),
            Error::TransactionError(e, key) => write!(f, "transaction error: {} ({})", e, key),
            Error::TransactionTerminated(key) => write!(f, "transaction terminated: {}", key),
            Error::DialogError(e, id) => write!(f, "dialog error: {} ({})", e, id),
            Error::DialogTerminated(id) => write!(f, "dialog terminated: {}", id),
            Error::DialogSequenceError(e, id) => write!(f, "dialog sequence error: {} ({})", e, id),
            Error::ChannelError(e) => write!(f, "channel error: {}", e),
            Error::Error(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<rsip::Error> for Error {
    fn from(e: rsip::Error) -> Self {
        Error::SipMessageError(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Error(e.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Self {
        Error::Error(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelError(e.to_string())
    }
}
