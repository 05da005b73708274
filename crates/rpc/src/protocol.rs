//! Wire shapes exchanged across the link.
//!
//! Outbound, a batch is an array of calls and stop messages. Inbound, a reply is
//! one `{id, result: {type, data}}` object or an array of them. Inbound entries
//! are decoded one at a time so a malformed entry never poisons its siblings.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;

/// Correlation id matching an outbound call to its replies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub String);

impl fmt::Display for CallId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<String> for CallId {
	fn from(id: String) -> Self {
		Self(id)
	}
}

impl From<&str> for CallId {
	fn from(id: &str) -> Self {
		Self(id.to_owned())
	}
}

/// Simple counter-based correlation id generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct CounterIdGen(pub u64);

impl CounterIdGen {
	/// Creates a new counter starting at 0.
	#[must_use]
	pub const fn new() -> Self {
		Self(0)
	}

	/// Generates the next unique id and increments the counter.
	#[allow(clippy::should_implement_trait, reason = "convention")]
	pub fn next(&mut self) -> CallId {
		let id = self.0;
		self.0 += 1;
		CallId(id.to_string())
	}
}

/// Kind of procedure being called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
	/// Read-only, one-shot.
	Query,
	/// Side-effecting, one-shot.
	Mutation,
	/// Long-lived, emits events until stopped.
	Subscription,
}

/// Procedure path and input of one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallParams {
	/// Procedure path, e.g. `tags.list`.
	pub path: String,
	/// Procedure input.
	pub input: JsonValue,
}

/// One call inside an outbound batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundCall {
	/// Correlation id.
	pub id: CallId,
	/// Procedure kind.
	pub method: Method,
	/// Path and input.
	pub params: CallParams,
}

/// Asks the boundary to stop a running call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopMessage {
	jsonrpc: &'static str,
	/// Id of the call to stop.
	pub id: CallId,
	method: &'static str,
	params: Option<()>,
}

impl StopMessage {
	/// Creates a stop message for `id`.
	pub fn new(id: CallId) -> Self {
		Self {
			jsonrpc: "2.0",
			id,
			method: "subscriptionStop",
			params: None,
		}
	}
}

/// Entry of an outbound batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outbound {
	/// A procedure call.
	Call(OutboundCall),
	/// A stop request for an earlier call.
	Stop(StopMessage),
}

/// Error reported by the backend for one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct ResponseError {
	/// Backend error code.
	pub code: i32,
	/// Human-readable message.
	pub message: String,
}

impl ResponseError {
	/// Creates an error from a code and message.
	pub fn new(code: i32, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into(),
		}
	}
}

/// Outcome carried by one inbound reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyResult {
	/// A streamed emission; the call stays open.
	Event(JsonValue),
	/// The final value; the call is finished.
	Response(JsonValue),
	/// A backend failure; the call is finished.
	Error(ResponseError),
}

impl ReplyResult {
	/// Returns true for outcomes that finish the call.
	pub fn is_terminal(&self) -> bool {
		!matches!(self, Self::Event(_))
	}
}

/// One decoded inbound reply.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundReply {
	/// Correlation id of the call this reply belongs to.
	pub id: CallId,
	/// The outcome.
	pub result: ReplyResult,
}

impl InboundReply {
	/// Decodes one `{id, result: {type, data}}` entry.
	///
	/// # Errors
	///
	/// A description of the violation when the entry is malformed or its `type`
	/// is unknown.
	pub fn decode(entry: &JsonValue) -> Result<Self, String> {
		let id = match entry.get("id") {
			Some(JsonValue::String(id)) => CallId(id.clone()),
			Some(JsonValue::Number(id)) => CallId(id.to_string()),
			Some(other) => return Err(format!("invalid id {other}")),
			None => return Err("missing id".into()),
		};
		let result = entry.get("result").ok_or_else(|| format!("missing result for call {id}"))?;
		let data = result.get("data").cloned().unwrap_or(JsonValue::Null);
		let result = match result.get("type").and_then(JsonValue::as_str) {
			Some("event") => ReplyResult::Event(data),
			Some("response") => ReplyResult::Response(data),
			Some("error") => ReplyResult::Error(
				serde_json::from_value(data).map_err(|e| format!("invalid error payload for call {id}: {e}"))?,
			),
			Some(other) => return Err(format!("unknown result type {other:?} for call {id}")),
			None => return Err(format!("missing result type for call {id}")),
		};
		Ok(Self { id, result })
	}
}

/// Decodes a reply payload, logging and dropping malformed entries.
///
/// Accepts a single entry, an array of entries, or `null`.
pub fn parse_replies(payload: JsonValue) -> Vec<InboundReply> {
	let entries = match payload {
		JsonValue::Null => return Vec::new(),
		JsonValue::Array(entries) => entries,
		entry @ JsonValue::Object(_) => vec![entry],
		other => {
			warn!(payload = %other, "rpc.reply.malformed");
			return Vec::new();
		}
	};
	entries
		.iter()
		.filter_map(|entry| {
			InboundReply::decode(entry)
				.inspect_err(|reason| warn!(%reason, "rpc.reply.dropped"))
				.ok()
		})
		.collect()
}
