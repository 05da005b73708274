//! Composition root wiring the store, the transport and the query cache together.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tessera_cache::{NodeStore, Subscription};
use tessera_rpc::{CallEvent, CallHandle, CallId, Link, Method, StopAck, Transport};
use tracing::{debug, info, warn};

use crate::Result;
use crate::config::ClientConfig;
use crate::invalidate::{ApplySummary, Invalidator, Refetch};
use crate::query::{QueryCache, QueryKey};
use crate::view::QueryView;

/// Refetches stale queries through the shared transport.
struct TransportRefetch {
	transport: Transport,
}

#[async_trait]
impl Refetch for TransportRefetch {
	async fn refetch(&self, key: &QueryKey) -> Result<JsonValue> {
		let handle = self.transport.exec(Method::Query, key.path(), key.arg().clone());
		Ok(handle.response().await?)
	}
}

/// Owns the entity store, the transport and the query cache of one application.
pub struct Client {
	store: Arc<NodeStore>,
	transport: Transport,
	queries: Arc<QueryCache>,
	invalidator: Arc<Invalidator>,
	config: ClientConfig,
}

impl std::fmt::Debug for Client {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Client")
			.field("store", &self.store)
			.field("transport", &self.transport)
			.field("queries", &self.queries)
			.finish_non_exhaustive()
	}
}

impl Client {
	/// Creates a client exchanging batches over `link`.
	pub fn new(link: Arc<dyn Link>, config: ClientConfig) -> Self {
		let store = NodeStore::new(&config.cache);
		let transport = Transport::new(link, config.transport.clone());
		let queries = Arc::new(QueryCache::new());
		let refetch = Arc::new(TransportRefetch {
			transport: transport.clone(),
		});
		let invalidator = Invalidator::new(queries.clone(), store.clone(), refetch);
		Self {
			store,
			transport,
			queries,
			invalidator,
			config,
		}
	}

	/// The shared entity store.
	pub fn store(&self) -> &Arc<NodeStore> {
		&self.store
	}

	/// The shared transport.
	pub fn transport(&self) -> &Transport {
		&self.transport
	}

	/// The query result cache.
	pub fn queries(&self) -> &Arc<QueryCache> {
		&self.queries
	}

	/// Binds a new rendering unit to `tree`.
	///
	/// `tree` may carry a top-level `nodes` array, which is merged first.
	///
	/// # Errors
	///
	/// `Error::Cache` if the embedded nodes are invalid.
	pub fn use_entities(&self, tree: JsonValue) -> Result<Subscription> {
		let mut subscription = Subscription::new(self.store.clone());
		subscription.set_payload(tree)?;
		Ok(subscription)
	}

	/// Issues a raw call on the shared transport.
	pub fn call(&self, method: Method, path: impl Into<String>, input: JsonValue) -> CallHandle {
		self.transport.exec(method, path, input)
	}

	/// Aborts a call issued through [`Client::call`].
	pub fn cancel(&self, id: &CallId) -> Option<StopAck> {
		self.transport.abort(id)
	}

	/// Runs a query, caches its result and returns a live view over it.
	///
	/// The view follows the query's cache entry, so invalidations that replace
	/// or refetch the result reload it.
	///
	/// # Errors
	///
	/// `Error::Rpc` if the call fails, `Error::Cache` if the returned nodes are invalid.
	pub async fn query(&self, path: impl Into<String>, arg: JsonValue) -> Result<QueryView> {
		let key = QueryKey::new(path, arg);
		let result = self
			.transport
			.exec(Method::Query, key.path(), key.arg().clone())
			.response()
			.await?;
		let subscription = self.use_entities(result.clone())?;
		let watched = self.queries.set_and_watch(&key, result);
		debug!(query = key.identity(), "client.query");
		Ok(QueryView::new(key, watched, subscription))
	}

	/// Applies one invalidation message.
	pub fn invalidate(&self, message: JsonValue) -> ApplySummary {
		self.invalidator.apply(message)
	}

	/// Opens the invalidation stream and applies each of its events in order.
	///
	/// Returns the id of the underlying subscription call, which
	/// [`Client::cancel`] stops.
	pub fn listen_invalidations(&self) -> CallId {
		let mut handle = self
			.transport
			.exec(Method::Subscription, self.config.invalidation_path.clone(), JsonValue::Null);
		let id = handle.id().clone();
		let invalidator = self.invalidator.clone();
		info!(call_id = %id, path = %self.config.invalidation_path, "client.invalidation.listen");
		tokio::spawn(async move {
			while let Some(outcome) = handle.next_event().await {
				match outcome {
					Ok(CallEvent::Event(message)) => {
						invalidator.apply(message);
					}
					Ok(CallEvent::Response(_)) => {
						debug!("client.invalidation.closed");
						break;
					}
					Err(err) => {
						warn!(error = %err, "client.invalidation.failed");
						break;
					}
				}
			}
		});
		id
	}

	/// Rejects every outstanding call and stops the transport.
	pub fn shutdown(&self) {
		self.transport.shutdown();
	}
}

#[cfg(test)]
mod tests;
