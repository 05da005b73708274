//! Binds a rendering unit to the entities its last resolution touched.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, warn};

use crate::node::EntityKey;
use crate::store::{NodeStore, WriteSet};
use crate::{Error, Result};

/// Payload key carrying flat nodes next to the primary payload.
const NODES_KEY: &str = "nodes";

/// Entities a rendering unit depends on, grouped by type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
	ids: HashMap<String, HashSet<String>>,
}

impl SubscriptionSet {
	/// Records `key`.
	pub fn insert(&mut self, key: &EntityKey) {
		if let Some(ids) = self.ids.get_mut(&key.entity_type) {
			ids.insert(key.entity_id.clone());
		} else {
			self.ids.insert(key.entity_type.clone(), HashSet::from([key.entity_id.clone()]));
		}
	}

	/// Returns true if `key` is recorded.
	pub fn contains(&self, key: &EntityKey) -> bool {
		self.ids.get(&key.entity_type).is_some_and(|ids| ids.contains(&key.entity_id))
	}

	/// Returns true if any written key is recorded.
	pub fn intersects(&self, writes: &WriteSet) -> bool {
		writes.iter().any(|key| self.contains(key))
	}

	/// Ids recorded for one entity type.
	pub fn ids(&self, entity_type: &str) -> Option<&HashSet<String>> {
		self.ids.get(entity_type)
	}

	/// Iterates over every recorded key.
	pub fn iter(&self) -> impl Iterator<Item = EntityKey> + '_ {
		self.ids
			.iter()
			.flat_map(|(ty, ids)| ids.iter().map(move |id| EntityKey::new(ty.clone(), id.clone())))
	}

	/// Number of recorded keys.
	pub fn len(&self) -> usize {
		self.ids.values().map(HashSet::len).sum()
	}

	/// Returns true if nothing is recorded.
	pub fn is_empty(&self) -> bool {
		self.ids.values().all(HashSet::is_empty)
	}
}

impl<K: Into<String>, I: Into<String>> FromIterator<(K, I)> for SubscriptionSet {
	fn from_iter<T: IntoIterator<Item = (K, I)>>(iter: T) -> Self {
		let mut set = Self::default();
		for (ty, id) in iter {
			set.insert(&EntityKey::new(ty, id));
		}
		set
	}
}

/// Lifecycle of a [`Subscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
	/// No payload, no listener.
	Idle,
	/// A payload is resolved and writes to its entities are watched.
	Resolved,
}

/// Live resolved view for one rendering unit.
///
/// A subscription only recomputes when a write touches an entity recorded by its
/// last resolution. Writes to any other entity are skipped without re-resolving.
pub struct Subscription {
	store: Arc<NodeStore>,
	writes: Option<broadcast::Receiver<Arc<WriteSet>>>,
	payload: Option<JsonValue>,
	output: Option<Result<JsonValue>>,
	set: SubscriptionSet,
	/// Store version the current output was resolved against.
	version: u64,
	recomputations: u64,
}

impl std::fmt::Debug for Subscription {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Subscription")
			.field("state", &self.state())
			.field("entities", &self.set.len())
			.field("version", &self.version)
			.field("recomputations", &self.recomputations)
			.finish_non_exhaustive()
	}
}

impl Subscription {
	/// Creates an idle subscription on `store`.
	pub fn new(store: Arc<NodeStore>) -> Self {
		Self {
			store,
			writes: None,
			payload: None,
			output: None,
			set: SubscriptionSet::default(),
			version: 0,
			recomputations: 0,
		}
	}

	/// Current lifecycle state.
	pub fn state(&self) -> SubscriptionState {
		if self.writes.is_some() {
			SubscriptionState::Resolved
		} else {
			SubscriptionState::Idle
		}
	}

	/// Replaces the input payload.
	///
	/// A top-level `nodes` array is merged into the store first; the rest of the
	/// payload is then resolved and the subscription set replaced. Resolution
	/// failures do not fail this call, they become the current [`view`](Self::view).
	///
	/// # Errors
	///
	/// `Error::InvalidNode` if the embedded nodes cannot be merged. The previous
	/// output is kept in that case.
	pub fn set_payload(&mut self, mut payload: JsonValue) -> Result<()> {
		if let JsonValue::Object(obj) = &mut payload
			&& let Some(nodes) = obj.remove(NODES_KEY)
		{
			self.store.merge_json(nodes)?;
		}
		if self.writes.is_none() {
			self.writes = Some(self.store.subscribe_writes());
		}
		self.payload = Some(payload);
		self.resolve();
		Ok(())
	}

	/// The current rendering output, or `None` while idle.
	pub fn view(&self) -> Option<std::result::Result<&JsonValue, &Error>> {
		self.output.as_ref().map(Result::as_ref)
	}

	/// Entities the current output depends on.
	pub fn subscription_set(&self) -> &SubscriptionSet {
		&self.set
	}

	/// Number of re-resolutions triggered by writes.
	pub fn recomputations(&self) -> u64 {
		self.recomputations
	}

	/// Waits for a relevant write and recomputes the view.
	///
	/// Returns `false` without waiting when the subscription is idle.
	pub async fn changed(&mut self) -> bool {
		loop {
			let Some(writes) = self.writes.as_mut() else {
				return false;
			};
			let received = writes.recv().await;
			match received {
				Ok(w) if self.is_relevant(&w) => break,
				Ok(_) => {}
				Err(RecvError::Lagged(skipped)) => {
					warn!(skipped, "cache.subscription.lagged");
					break;
				}
				Err(RecvError::Closed) => return false,
			}
		}
		self.recompute();
		true
	}

	/// Drains queued writes and recomputes once if any was relevant.
	pub fn try_changed(&mut self) -> bool {
		let mut dirty = false;
		while let Some(writes) = self.writes.as_mut() {
			let received = writes.try_recv();
			match received {
				Ok(w) => dirty |= self.is_relevant(&w),
				Err(TryRecvError::Lagged(skipped)) => {
					warn!(skipped, "cache.subscription.lagged");
					dirty = true;
				}
				Err(TryRecvError::Empty | TryRecvError::Closed) => break,
			}
		}
		if dirty {
			self.recompute();
		}
		dirty
	}

	/// Drops the payload and the write listener, and releases the entities it
	/// depended on.
	pub fn unmount(&mut self) {
		self.store.release(&self.set);
		self.writes = None;
		self.payload = None;
		self.output = None;
		self.set = SubscriptionSet::default();
	}

	fn is_relevant(&self, writes: &WriteSet) -> bool {
		writes.version() > self.version && self.set.intersects(writes)
	}

	fn recompute(&mut self) {
		self.recomputations += 1;
		debug!(recomputations = self.recomputations, "cache.subscription.recompute");
		self.resolve();
	}

	fn resolve(&mut self) {
		let Some(payload) = self.payload.as_ref() else {
			return;
		};
		let mut touched = SubscriptionSet::default();
		let (output, version) = self.store.resolve_into(&mut touched, payload);
		// Watch the missing entity too so that merging it repairs the view.
		if let Err(Error::DanglingReference(key)) = &output {
			touched.insert(key);
		}
		self.version = version;
		self.store.retain(&touched);
		self.store.release(&self.set);
		self.set = touched;
		self.output = Some(output);
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		self.store.release(&self.set);
	}
}

#[cfg(test)]
mod tests;
