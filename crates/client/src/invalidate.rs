//! Server-driven cache invalidation.
//!
//! The backend pushes ordered batches of `{key, arg, result}` operations. A
//! non-null `result` is written straight into the query cache; a null `result`
//! marks the query stale and refetches it once in the background. Operations are
//! applied in receipt order, and a refetch that loses the race against a later
//! write-through is discarded.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tessera_cache::{CacheNode, NodeStore};
use tracing::{debug, warn};

use crate::Result;
use crate::query::{QueryCache, QueryKey};

/// Payload key carrying flat nodes next to a query result.
const NODES_KEY: &str = "nodes";

/// One invalidation instruction.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InvalidateOperation {
	/// Procedure path of the affected query.
	pub key: String,
	/// Argument of the affected query.
	#[serde(default)]
	pub arg: JsonValue,
	/// Fresh result, or `None` when the query must be refetched.
	#[serde(default)]
	pub result: Option<JsonValue>,
}

impl InvalidateOperation {
	/// Query identity this operation targets.
	pub fn query_key(&self) -> QueryKey {
		QueryKey::new(self.key.clone(), self.arg.clone())
	}
}

/// Fetches a fresh result for a stale query.
#[async_trait]
pub trait Refetch: Send + Sync + 'static {
	/// Issues the query again and returns its result.
	async fn refetch(&self, key: &QueryKey) -> Result<JsonValue>;
}

/// Counts of what one [`Invalidator::apply`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
	/// Operations whose result was written through.
	pub replaced: usize,
	/// Operations that started a refetch.
	pub refetched: usize,
	/// Null-result operations for queries nothing has cached.
	pub skipped: usize,
	/// Malformed operations, including results carrying invalid nodes.
	pub dropped: usize,
}

/// Applies invalidation operations to a [`QueryCache`].
pub struct Invalidator {
	queries: Arc<QueryCache>,
	store: Arc<NodeStore>,
	refetch: Arc<dyn Refetch>,
}

impl std::fmt::Debug for Invalidator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Invalidator").field("queries", &self.queries).finish_non_exhaustive()
	}
}

impl Invalidator {
	/// Creates an invalidator writing into `queries`.
	///
	/// Results carrying a `nodes` array are also merged into `store`, so live
	/// subscriptions observe the fresh entities.
	pub fn new(queries: Arc<QueryCache>, store: Arc<NodeStore>, refetch: Arc<dyn Refetch>) -> Arc<Self> {
		Arc::new(Self { queries, store, refetch })
	}

	/// Applies one pushed message: an array of operations or a single operation.
	///
	/// Must be called from within a tokio runtime when the message may contain
	/// null-result operations, since refetches are spawned.
	pub fn apply(self: &Arc<Self>, message: JsonValue) -> ApplySummary {
		let ops = match message {
			JsonValue::Array(ops) => ops,
			op @ JsonValue::Object(_) => vec![op],
			JsonValue::Null => Vec::new(),
			other => {
				warn!(message = %other, "invalidate.malformed");
				return ApplySummary {
					dropped: 1,
					..ApplySummary::default()
				};
			}
		};

		let mut summary = ApplySummary::default();
		for op in ops {
			let op = match InvalidateOperation::deserialize(&op) {
				Ok(op) => op,
				Err(err) => {
					warn!(error = %err, operation = %op, "invalidate.dropped");
					summary.dropped += 1;
					continue;
				}
			};
			self.apply_op(op, &mut summary);
		}
		debug!(
			replaced = summary.replaced,
			refetched = summary.refetched,
			skipped = summary.skipped,
			dropped = summary.dropped,
			"invalidate.apply"
		);
		summary
	}

	fn apply_op(self: &Arc<Self>, op: InvalidateOperation, summary: &mut ApplySummary) {
		let key = op.query_key();
		match op.result {
			Some(result) => {
				if self.land(&key, result, None) {
					summary.replaced += 1;
				} else {
					summary.dropped += 1;
				}
			}
			None => {
				let Some(generation) = self.queries.mark_stale(&key) else {
					debug!(query = key.identity(), "invalidate.skip");
					summary.skipped += 1;
					return;
				};
				summary.refetched += 1;
				let this = self.clone();
				tokio::spawn(async move {
					match this.refetch.refetch(&key).await {
						Ok(result) => {
							this.land(&key, result, Some(generation));
						}
						Err(err) => warn!(query = key.identity(), error = %err, "invalidate.refetch.failed"),
					}
				});
			}
		}
	}

	/// Writes a result into the cache and merges its nodes.
	///
	/// A result whose nodes do not parse is dropped whole. Returns true if the
	/// result was stored.
	fn land(&self, key: &QueryKey, result: JsonValue, generation: Option<u64>) -> bool {
		let nodes = match self.parse_nodes(&result) {
			Ok(nodes) => nodes,
			Err(err) => {
				warn!(query = key.identity(), error = %err, "invalidate.nodes.invalid");
				return false;
			}
		};
		let stored = match generation {
			Some(generation) => self.queries.set_if_current(key, generation, result),
			None => {
				self.queries.set(key, result);
				true
			}
		};
		if stored
			&& !nodes.is_empty()
			&& let Err(err) = self.store.merge(nodes)
		{
			warn!(query = key.identity(), error = %err, "invalidate.merge.failed");
		}
		stored
	}

	fn parse_nodes(&self, result: &JsonValue) -> tessera_cache::Result<Vec<CacheNode>> {
		match result.get(NODES_KEY) {
			None | Some(JsonValue::Null) => Ok(Vec::new()),
			Some(JsonValue::Array(nodes)) => nodes
				.iter()
				.map(|node| CacheNode::from_json(node.clone(), self.store.tags()))
				.collect(),
			Some(other) => Err(tessera_cache::Error::InvalidNode(format!(
				"expected an array of nodes, got {other}"
			))),
		}
	}
}
