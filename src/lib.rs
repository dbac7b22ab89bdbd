// An embeddable SIP signaling engine in Rust
//
// Layers, bottom up:
// * `timer`       - the scheduling primitive shared by every layer
// * `transport`   - connections and the per-destination connection manager
// * `transaction` - per-request state machines (RFC 3261 section 17)
// * `dialog`      - call-level state spanning transactions (RFC 3261 section 12)

pub mod dialog;
pub mod error;
pub mod timer;
pub mod transaction;
pub mod transport;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
