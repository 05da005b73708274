//! Error types for the RPC transport.

use std::sync::Arc;

use crate::protocol::{CallId, ResponseError};

/// A convenient type alias for `Result` with `E` = [`enum@crate::Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Possible errors.
///
/// Cloneable so a single link failure can be delivered to every call in the
/// batch it carried.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// The transport was shut down before the call finished.
	#[error("transport stopped")]
	ServiceStopped,
	/// The call was aborted locally.
	#[error("call cancelled")]
	Cancelled,
	/// The backend replied with an error.
	#[error("{0}")]
	Response(#[from] ResponseError),
	/// The link failed to exchange the batch carrying the call.
	#[error("link failed: {0}")]
	Link(String),
	/// A caller-supplied id is already in flight.
	#[error("duplicate call id {0}")]
	DuplicateId(CallId),
	/// A batch could not be encoded.
	#[error("serialization failed: {0}")]
	Serialize(Arc<serde_json::Error>),
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Self::Serialize(Arc::new(err))
	}
}
