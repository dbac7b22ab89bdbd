use crate::transport::SipConnection;
use key::TransactionKey;
use rand::{distributions::Alphanumeric, Rng};
use rsip::SipMessage;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub mod endpoint;
pub mod key;
pub mod message;
pub mod transaction;
#[cfg(test)]
mod tests;

pub use endpoint::{Endpoint, EndpointBuilder, EndpointInner, EndpointInnerRef, EndpointOption};
pub use transaction::Transaction;

/// RFC 3261 base timer defaults. These are only defaults: the effective
/// values live in [`EndpointOption`] and can be overridden per endpoint.
pub const T1: Duration = Duration::from_millis(500);
pub const T2: Duration = Duration::from_secs(4);
pub const T4: Duration = Duration::from_secs(5);
pub const T1X64: Duration = Duration::from_millis(64 * 500);
pub const TIMER_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub enum TransactionState {
    Calling,
    Trying,
    Proceeding,
    /// Client INVITE got a 2xx. The transaction lingers so retransmitted
    /// and forked 2xx responses still reach the dialog layer.
    Accepted,
    Completed,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
}

/// Timers of the four state machines, named after RFC 3261 section 17.
/// Retransmission timers carry the interval to use for the next round.
pub enum TransactionTimer {
    /// Client INVITE retransmission.
    TimerA(TransactionKey, Duration),
    /// Client INVITE timeout.
    TimerB(TransactionKey),
    /// Client INVITE completion (absorb response retransmits).
    TimerD(TransactionKey),
    /// Client non-INVITE retransmission.
    TimerE(TransactionKey, Duration),
    /// Client non-INVITE timeout.
    TimerF(TransactionKey),
    /// Server INVITE final-response retransmission while waiting for ACK.
    TimerG(TransactionKey, Duration),
    /// Server INVITE gives up waiting for the ACK.
    TimerH(TransactionKey),
    /// Server INVITE confirmed-state linger.
    TimerI(TransactionKey),
    /// Server non-INVITE completion.
    TimerJ(TransactionKey),
    /// Client non-INVITE completion.
    TimerK(TransactionKey),
    /// Client INVITE accepted-state linger (RFC 6026).
    TimerM(TransactionKey),
    /// Reap a finished transaction from the retransmit-absorb table.
    TimerCleanup(TransactionKey),
}

impl TransactionTimer {
    pub fn key(&self) -> &TransactionKey {
        match self {
            TransactionTimer::TimerA(key, _)
            | TransactionTimer::TimerB(key)
            | TransactionTimer::TimerD(key)
            | TransactionTimer::TimerE(key, _)
            | TransactionTimer::TimerF(key)
            | TransactionTimer::TimerG(key, _)
            | TransactionTimer::TimerH(key)
            | TransactionTimer::TimerI(key)
            | TransactionTimer::TimerJ(key)
            | TransactionTimer::TimerK(key)
            | TransactionTimer::TimerM(key)
            | TransactionTimer::TimerCleanup(key) => key,
        }
    }
}

impl std::fmt::Display for TransactionTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionTimer::TimerA(key, d) => write!(f, "TimerA({:?}): {}", d, key),
            TransactionTimer::TimerB(key) => write!(f, "TimerB: {}", key),
            TransactionTimer::TimerD(key) => write!(f, "TimerD: {}", key),
            TransactionTimer::TimerE(key, d) => write!(f, "TimerE({:?}): {}", d, key),
            TransactionTimer::TimerF(key) => write!(f, "TimerF: {}", key),
            TransactionTimer::TimerG(key, d) => write!(f, "TimerG({:?}): {}", d, key),
            TransactionTimer::TimerH(key) => write!(f, "TimerH: {}", key),
            TransactionTimer::TimerI(key) => write!(f, "TimerI: {}", key),
            TransactionTimer::TimerJ(key) => write!(f, "TimerJ: {}", key),
            TransactionTimer::TimerK(key) => write!(f, "TimerK: {}", key),
            TransactionTimer::TimerM(key) => write!(f, "TimerM: {}", key),
            TransactionTimer::TimerCleanup(key) => write!(f, "TimerCleanup: {}", key),
        }
    }
}

/// Events delivered into a transaction's single-consumer channel. All state
/// transitions happen on the consumer side, so a timer firing concurrently
/// with an incoming message can never race a transition.
pub enum TransactionEvent {
    Received(SipMessage, Option<SipConnection>),
    Timer(TransactionTimer),
    Terminate,
}

pub type TransactionReceiver = UnboundedReceiver<TransactionEvent>;
pub type TransactionSender = UnboundedSender<TransactionEvent>;

pub fn random_text(count: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(count)
        .map(char::from)
        .collect()
}

pub fn make_via_branch() -> rsip::Param {
    rsip::Param::Branch(rsip::param::Branch::new(format!(
        "z9hG4bK{}",
        random_text(16)
    )))
}

pub fn make_call_id(domain: Option<&str>) -> rsip::headers::CallId {
    format!("{}@{}", random_text(22), domain.unwrap_or("sipflow.local")).into()
}

pub fn make_tag() -> rsip::param::Tag {
    random_text(12).into()
}
