//! Batching RPC transport.
//!
//! Many logical calls share one physical [`Link`]. Calls issued within the same
//! scheduler tick are coalesced into a single outbound message, and replies are
//! matched back to their callers by correlation id, never by position:
//! * [`Transport`]: dispatch, flush, demultiplexing and cancellation
//! * [`CallHandle`]: per-call stream of events ending in one terminal outcome
//! * [`Link`]: the boundary a batch is exchanged across
//! * [`protocol`]: the wire shapes on both sides of the boundary

#![warn(missing_docs)]

mod config;
mod error;
mod link;
pub mod protocol;
mod transport;

pub use config::TransportConfig;
pub use error::{Error, Result};
pub use link::Link;
pub use protocol::{CallId, Method, ResponseError};
pub use transport::{BatchHold, CallEvent, CallHandle, StopAck, Transport};
