//! The boundary a batch crosses.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::Result;

/// One physical request/response channel, such as an IPC bridge or an HTTP endpoint.
///
/// Reconnection and backoff belong to the implementation. Replies that arrive
/// outside [`Link::exchange`], such as subscription events, are handed to
/// [`Transport::receive`](crate::Transport::receive).
#[async_trait]
pub trait Link: Send + Sync + 'static {
	/// Sends one serialized batch and returns the boundary's reply.
	///
	/// The reply may be a single `{id, result}` object, an array of them, or
	/// `null` when nothing is answered synchronously.
	async fn exchange(&self, batch: JsonValue) -> Result<JsonValue>;
}
