//! Live view over one cached query result.

use serde_json::Value as JsonValue;
use tessera_cache::{Error as CacheError, Subscription};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::query::QueryKey;

/// A [`Subscription`] fed by a query cache entry.
///
/// The view recomputes when a write touches an entity it depends on, and it
/// reloads its whole payload when the cached result of its query is replaced,
/// either by a write-through invalidation or by a landed refetch.
pub struct QueryView {
	key: QueryKey,
	/// `None` once unmounted or once the cache entry is gone.
	result: Option<watch::Receiver<Option<JsonValue>>>,
	subscription: Subscription,
	reloads: u64,
}

impl std::fmt::Debug for QueryView {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("QueryView")
			.field("query", &self.key.identity())
			.field("reloads", &self.reloads)
			.field("subscription", &self.subscription)
			.finish()
	}
}

impl QueryView {
	pub(crate) fn new(key: QueryKey, result: watch::Receiver<Option<JsonValue>>, subscription: Subscription) -> Self {
		Self {
			key,
			result: Some(result),
			subscription,
			reloads: 0,
		}
	}

	/// Identity of the query behind this view.
	pub fn key(&self) -> &QueryKey {
		&self.key
	}

	/// The current rendering output, or `None` once unmounted.
	pub fn view(&self) -> Option<Result<&JsonValue, &CacheError>> {
		self.subscription.view()
	}

	/// The underlying entity subscription.
	pub fn subscription(&self) -> &Subscription {
		&self.subscription
	}

	/// Number of times the cached result replaced the payload.
	pub fn reloads(&self) -> u64 {
		self.reloads
	}

	/// Waits for a new cached result or a relevant entity write, and recomputes.
	///
	/// Returns `false` once neither source can produce another change.
	pub async fn changed(&mut self) -> bool {
		loop {
			let Some(result) = self.result.as_mut() else {
				return self.subscription.changed().await;
			};
			// A replaced result supersedes writes that arrived alongside it.
			tokio::select! {
				biased;
				replaced = result.changed() => {
					if replaced.is_err() {
						self.result = None;
					} else if self.reload() {
						return true;
					}
				}
				written = self.subscription.changed() => return written,
			}
		}
	}

	/// Applies a pending cached result or queued writes without waiting.
	pub fn try_changed(&mut self) -> bool {
		let replaced = self.result.as_ref().is_some_and(|result| result.has_changed().unwrap_or(false));
		if replaced && self.reload() {
			// Writes queued before the reload are already reflected.
			self.subscription.try_changed();
			return true;
		}
		self.subscription.try_changed()
	}

	/// Drops the payload and stops following the query.
	pub fn unmount(&mut self) {
		self.result = None;
		self.subscription.unmount();
	}

	fn reload(&mut self) -> bool {
		let Some(result) = self.result.as_mut().and_then(|result| result.borrow_and_update().clone()) else {
			return false;
		};
		match self.subscription.set_payload(result) {
			Ok(()) => {
				self.reloads += 1;
				debug!(query = self.key.identity(), reloads = self.reloads, "client.view.reload");
				true
			}
			Err(err) => {
				warn!(query = self.key.identity(), error = %err, "client.view.reload.failed");
				false
			}
		}
	}
}
