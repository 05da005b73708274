//! Batching, correlating transport.
//!
//! `exec` registers the call in the correlation table, appends it to the pending
//! batch and schedules a flush if none is pending. The flush waits one scheduler
//! tick (or the configured window), then takes the whole batch, exchanges it over
//! the link and demultiplexes the reply by id.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::config::TransportConfig;
use crate::link::Link;
use crate::protocol::{CallId, CallParams, CounterIdGen, InboundReply, Method, Outbound, OutboundCall, ReplyResult, StopMessage, parse_replies};
use crate::{Error, Result};

/// Non-terminal and terminal successes delivered to a call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
	/// A streamed emission; more may follow.
	Event(JsonValue),
	/// The final value; nothing follows.
	Response(JsonValue),
}

type EventSender = mpsc::UnboundedSender<Result<CallEvent>>;

/// Entry of the pending batch.
enum Queued {
	Call(OutboundCall),
	Stop {
		message: StopMessage,
		ack: oneshot::Sender<Result<()>>,
	},
}

struct State {
	/// Correlation table: in-flight calls by id.
	pending: HashMap<CallId, EventSender>,
	/// Calls and stops accumulated since the last flush.
	batch: Vec<Queued>,
	flush_scheduled: bool,
	/// Live [`BatchHold`]s; flushes wait while non-zero.
	holds: usize,
	closed: bool,
	ids: CounterIdGen,
}

struct Shared {
	link: Arc<dyn Link>,
	config: TransportConfig,
	state: Mutex<State>,
}

/// Multiplexes many logical calls over one [`Link`].
///
/// Clones share the same correlation table and pending batch.
#[derive(Clone)]
pub struct Transport {
	shared: Arc<Shared>,
}

impl std::fmt::Debug for Transport {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let state = self.shared.state.lock();
		f.debug_struct("Transport")
			.field("pending", &state.pending.len())
			.field("queued", &state.batch.len())
			.field("closed", &state.closed)
			.finish_non_exhaustive()
	}
}

impl Transport {
	/// Creates a transport over `link`.
	pub fn new(link: Arc<dyn Link>, config: TransportConfig) -> Self {
		Self {
			shared: Arc::new(Shared {
				link,
				config,
				state: Mutex::new(State {
					pending: HashMap::new(),
					batch: Vec::new(),
					flush_scheduled: false,
					holds: 0,
					closed: false,
					ids: CounterIdGen::new(),
				}),
			}),
		}
	}

	/// Issues a call with a generated correlation id.
	///
	/// Enqueueing is synchronous. On a current-thread runtime every call issued
	/// before the current task yields lands in the same outbound message. On a
	/// multi-thread runtime another worker may flush mid-burst; issue the burst
	/// under [`Transport::hold`] to keep it in one message.
	///
	/// Generated ids skip any id a caller already has in flight.
	///
	/// # Panics
	///
	/// Panics if called outside a tokio runtime.
	pub fn exec(&self, method: Method, path: impl Into<String>, input: JsonValue) -> CallHandle {
		self.enqueue(None, method, path.into(), input)
	}

	/// Issues a call with a caller-supplied correlation id.
	///
	/// The returned handle fails immediately with `Error::DuplicateId` if `id` is
	/// already in flight, or `Error::ServiceStopped` after [`Transport::shutdown`].
	///
	/// # Panics
	///
	/// Panics if called outside a tokio runtime.
	pub fn exec_with_id(&self, id: CallId, method: Method, path: impl Into<String>, input: JsonValue) -> CallHandle {
		self.enqueue(Some(id), method, path.into(), input)
	}

	/// Keeps the pending batch from flushing until the returned hold is dropped.
	///
	/// Calls issued while any hold is alive travel in one outbound message
	/// (subject to `max_batch_size`) regardless of the runtime flavor.
	pub fn hold(&self) -> BatchHold {
		self.shared.state.lock().holds += 1;
		BatchHold {
			shared: self.shared.clone(),
		}
	}

	fn enqueue(&self, id: Option<CallId>, method: Method, path: String, input: JsonValue) -> CallHandle {
		let (tx, rx) = mpsc::unbounded_channel();
		let mut state = self.shared.state.lock();
		let id = match id {
			Some(id) => id,
			None => loop {
				let id = state.ids.next();
				if !state.pending.contains_key(&id) {
					break id;
				}
			},
		};
		let handle = CallHandle { id: id.clone(), rx };

		if state.closed {
			let _ = tx.send(Err(Error::ServiceStopped));
			return handle;
		}
		if state.pending.contains_key(&id) {
			let _ = tx.send(Err(Error::DuplicateId(id)));
			return handle;
		}

		debug!(call_id = %id, ?method, %path, "rpc.exec");
		state.pending.insert(id.clone(), tx);
		state.batch.push(Queued::Call(OutboundCall {
			id,
			method,
			params: CallParams { path, input },
		}));
		let schedule = !std::mem::replace(&mut state.flush_scheduled, true);
		drop(state);

		if schedule {
			schedule_flush(self.shared.clone());
		}
		handle
	}

	/// Aborts an in-flight call.
	///
	/// The correlation entry is removed immediately, so no further outcome reaches
	/// the caller; its handle reports `Error::Cancelled`. A stop message for the
	/// boundary is enqueued on the batching path. A call that never left the
	/// pending batch is simply withdrawn.
	///
	/// Returns `None` if the call already finished or was aborted before.
	pub fn abort(&self, id: &CallId) -> Option<StopAck> {
		let mut state = self.shared.state.lock();
		state.pending.remove(id)?;

		let (ack_tx, ack_rx) = oneshot::channel();
		let queued = state.batch.iter().position(|q| matches!(q, Queued::Call(call) if &call.id == id));
		if let Some(pos) = queued {
			state.batch.remove(pos);
			debug!(call_id = %id, "rpc.abort.withdrawn");
			let _ = ack_tx.send(Ok(()));
			return Some(StopAck { rx: ack_rx });
		}

		debug!(call_id = %id, "rpc.abort");
		state.batch.push(Queued::Stop {
			message: StopMessage::new(id.clone()),
			ack: ack_tx,
		});
		let schedule = !std::mem::replace(&mut state.flush_scheduled, true);
		drop(state);

		if schedule {
			schedule_flush(self.shared.clone());
		}
		Some(StopAck { rx: ack_rx })
	}

	/// Demultiplexes a reply pushed by the boundary outside an exchange.
	pub fn receive(&self, payload: JsonValue) {
		self.shared.receive(payload);
	}

	/// Rejects every outstanding call with `Error::ServiceStopped` and refuses new ones.
	pub fn shutdown(&self) {
		let (pending, batch) = {
			let mut state = self.shared.state.lock();
			state.closed = true;
			(std::mem::take(&mut state.pending), std::mem::take(&mut state.batch))
		};
		debug!(rejected = pending.len(), "rpc.shutdown");
		for tx in pending.into_values() {
			let _ = tx.send(Err(Error::ServiceStopped));
		}
		for queued in batch {
			if let Queued::Stop { ack, .. } = queued {
				let _ = ack.send(Err(Error::ServiceStopped));
			}
		}
	}

	/// Returns true after [`Transport::shutdown`].
	pub fn is_closed(&self) -> bool {
		self.shared.state.lock().closed
	}

	/// Number of calls awaiting a terminal outcome.
	pub fn pending_len(&self) -> usize {
		self.shared.state.lock().pending.len()
	}
}

fn schedule_flush(shared: Arc<Shared>) {
	tokio::spawn(flush(shared));
}

async fn flush(shared: Arc<Shared>) {
	let window = shared.config.window();
	if window.is_zero() {
		tokio::task::yield_now().await;
	} else {
		tokio::time::sleep(window).await;
	}

	let (batch, overflow) = {
		let mut state = shared.state.lock();
		if state.holds > 0 {
			// The last hold to drop reschedules.
			state.flush_scheduled = false;
			return;
		}
		let max = shared.config.max_batch_size;
		let batch: Vec<Queued> = if max > 0 && state.batch.len() > max {
			state.batch.drain(..max).collect()
		} else {
			std::mem::take(&mut state.batch)
		};
		let overflow = !state.batch.is_empty();
		state.flush_scheduled = overflow;
		(batch, overflow)
	};
	if overflow {
		schedule_flush(shared.clone());
	}
	if batch.is_empty() {
		return;
	}

	let mut calls = Vec::new();
	let mut acks = Vec::new();
	let mut wire = Vec::with_capacity(batch.len());
	for queued in batch {
		match queued {
			Queued::Call(call) => {
				calls.push(call.id.clone());
				wire.push(Outbound::Call(call));
			}
			Queued::Stop { message, ack } => {
				acks.push(ack);
				wire.push(Outbound::Stop(message));
			}
		}
	}
	debug!(calls = calls.len(), stops = acks.len(), "rpc.flush");

	let outcome = match serde_json::to_value(&wire) {
		Ok(payload) => shared.link.exchange(payload).await,
		Err(err) => Err(err.into()),
	};
	match outcome {
		Ok(reply) => {
			shared.receive(reply);
			for ack in acks {
				let _ = ack.send(Ok(()));
			}
		}
		Err(err) => {
			error!(error = %err, calls = calls.len(), "rpc.flush.failed");
			shared.fail(&calls, &err);
			for ack in acks {
				let _ = ack.send(Err(err.clone()));
			}
		}
	}
}

impl Shared {
	fn receive(self: &Arc<Self>, payload: JsonValue) {
		for reply in parse_replies(payload) {
			self.dispatch(reply);
		}
	}

	fn dispatch(self: &Arc<Self>, reply: InboundReply) {
		let InboundReply { id, result } = reply;
		let mut state = self.state.lock();
		let Some(tx) = state.pending.get(&id) else {
			warn!(call_id = %id, "rpc.reply.unknown_id");
			return;
		};

		match result {
			ReplyResult::Event(data) => {
				if tx.send(Ok(CallEvent::Event(data))).is_ok() {
					return;
				}
				// The handle is gone; stop the stream at the source.
				drop(state);
				debug!(call_id = %id, "rpc.reply.receiver_dropped");
				let _ = Transport { shared: self.clone() }.abort(&id);
			}
			ReplyResult::Response(data) => {
				if let Some(tx) = state.pending.remove(&id) {
					let _ = tx.send(Ok(CallEvent::Response(data)));
				}
			}
			ReplyResult::Error(err) => {
				if let Some(tx) = state.pending.remove(&id) {
					let _ = tx.send(Err(Error::Response(err)));
				}
			}
		}
	}

	fn fail(&self, calls: &[CallId], err: &Error) {
		let mut state = self.state.lock();
		for id in calls {
			if let Some(tx) = state.pending.remove(id) {
				let _ = tx.send(Err(err.clone()));
			}
		}
	}
}

/// Receiving side of one call.
///
/// Yields zero or more [`CallEvent::Event`]s followed by at most one terminal
/// outcome, then ends. A stream that ends without a terminal outcome was aborted.
#[derive(Debug)]
pub struct CallHandle {
	id: CallId,
	rx: mpsc::UnboundedReceiver<Result<CallEvent>>,
}

impl CallHandle {
	/// Correlation id of the call.
	pub fn id(&self) -> &CallId {
		&self.id
	}

	/// Waits for the next outcome, or `None` once the call is over.
	pub async fn next_event(&mut self) -> Option<Result<CallEvent>> {
		self.rx.recv().await
	}

	/// Waits for the terminal value, skipping streamed events.
	///
	/// # Errors
	///
	/// - `Error::Response` when the backend reports a failure.
	/// - `Error::Cancelled` when the call was aborted.
	/// - `Error::ServiceStopped` when the transport shut down.
	/// - `Error::Link` when the batch carrying the call could not be exchanged.
	pub async fn response(mut self) -> Result<JsonValue> {
		loop {
			match self.rx.recv().await {
				Some(Ok(CallEvent::Event(_))) => {}
				Some(Ok(CallEvent::Response(data))) => return Ok(data),
				Some(Err(err)) => return Err(err),
				None => return Err(Error::Cancelled),
			}
		}
	}
}

impl Stream for CallHandle {
	type Item = Result<CallEvent>;

	fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		self.rx.poll_recv(cx)
	}
}

/// Keeps calls in one outbound message; see [`Transport::hold`].
#[must_use = "the batch is released as soon as the hold is dropped"]
pub struct BatchHold {
	shared: Arc<Shared>,
}

impl std::fmt::Debug for BatchHold {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BatchHold").finish_non_exhaustive()
	}
}

impl Drop for BatchHold {
	fn drop(&mut self) {
		let schedule = {
			let mut state = self.shared.state.lock();
			state.holds -= 1;
			state.holds == 0 && !state.batch.is_empty() && !std::mem::replace(&mut state.flush_scheduled, true)
		};
		if schedule {
			schedule_flush(self.shared.clone());
		}
	}
}

/// Acknowledgement of a stop message.
///
/// Resolves once the batch carrying the stop message has been exchanged with the
/// boundary, or immediately when the call was withdrawn before leaving.
#[derive(Debug)]
#[must_use = "dropping the ack does not undo the abort, but hides its outcome"]
pub struct StopAck {
	rx: oneshot::Receiver<Result<()>>,
}

impl StopAck {
	/// Waits for the boundary to receive the stop message.
	///
	/// # Errors
	///
	/// `Error::Link` if the exchange failed, `Error::ServiceStopped` if the
	/// transport shut down first.
	pub async fn acknowledged(self) -> Result<()> {
		self.rx.await.unwrap_or(Err(Error::ServiceStopped))
	}
}
