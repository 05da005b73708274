//! Entity node store.
//!
//! The store is the single source of truth for entity fields. All writes go
//! through [`NodeStore::merge`], which overwrites nodes wholesale and then
//! broadcasts the set of written keys to every listener.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::node::{CacheNode, EntityKey, Fields, ReferenceTags};
use crate::resolve::{Resolved, resolve};
use crate::subscription::SubscriptionSet;
use crate::{Error, Result};

/// Entity fields keyed by type, then id.
pub type NodeTable = HashMap<String, HashMap<String, Fields>>;

/// Keys written by one merge, stamped with the store version it produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSet {
	version: u64,
	keys: BTreeSet<EntityKey>,
}

impl WriteSet {
	/// Creates a write set for an explicit version.
	pub fn new(version: u64, keys: impl IntoIterator<Item = EntityKey>) -> Self {
		Self {
			version,
			keys: keys.into_iter().collect(),
		}
	}

	/// Store version after the write was applied.
	pub const fn version(&self) -> u64 {
		self.version
	}

	/// Iterates over the written keys in order.
	pub fn iter(&self) -> impl Iterator<Item = &EntityKey> {
		self.keys.iter()
	}

	/// Returns true if `key` was written.
	pub fn contains(&self, key: &EntityKey) -> bool {
		self.keys.contains(key)
	}

	/// Number of distinct keys written.
	pub fn len(&self) -> usize {
		self.keys.len()
	}

	/// Returns true if nothing was written.
	pub fn is_empty(&self) -> bool {
		self.keys.is_empty()
	}
}

struct Inner {
	table: NodeTable,
	version: u64,
	/// Live subscriptions depending on each key.
	retained: HashMap<EntityKey, usize>,
}

/// Process-wide keyed table of entity fields.
///
/// Construct one per application (or per test) and share it through `Arc`.
pub struct NodeStore {
	tags: ReferenceTags,
	inner: RwLock<Inner>,
	writes_tx: broadcast::Sender<Arc<WriteSet>>,
}

impl std::fmt::Debug for NodeStore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let inner = self.inner.read();
		f.debug_struct("NodeStore")
			.field("tags", &self.tags)
			.field("types", &inner.table.len())
			.field("version", &inner.version)
			.field("listeners", &self.writes_tx.receiver_count())
			.finish_non_exhaustive()
	}
}

impl NodeStore {
	/// Creates an empty store.
	pub fn new(config: &CacheConfig) -> Arc<Self> {
		let (writes_tx, _) = broadcast::channel(config.notify_capacity.max(1));
		Arc::new(Self {
			tags: config.reference_tags(),
			inner: RwLock::new(Inner {
				table: HashMap::new(),
				version: 0,
				retained: HashMap::new(),
			}),
			writes_tx,
		})
	}

	/// Reference tags this store parses nodes and references with.
	pub fn tags(&self) -> &ReferenceTags {
		&self.tags
	}

	/// Overwrites every node in `nodes` and notifies listeners.
	///
	/// All nodes are validated before any is written, so an invalid node leaves
	/// the store untouched. The notification is sent after the table lock is
	/// released.
	///
	/// # Errors
	///
	/// `Error::InvalidNode` if a node carries an empty type or id.
	pub fn merge(&self, nodes: impl IntoIterator<Item = CacheNode>) -> Result<Arc<WriteSet>> {
		let nodes: Vec<CacheNode> = nodes.into_iter().collect();
		for node in &nodes {
			node.validate()?;
		}
		if nodes.is_empty() {
			return Ok(Arc::new(WriteSet {
				version: self.version(),
				keys: BTreeSet::new(),
			}));
		}

		let writes = {
			let mut inner = self.inner.write();
			let mut keys = BTreeSet::new();
			for node in nodes {
				trace!(entity = %node.key, fields = node.fields.len(), "cache.merge.node");
				inner
					.table
					.entry(node.key.entity_type.clone())
					.or_default()
					.insert(node.key.entity_id.clone(), node.fields);
				keys.insert(node.key);
			}
			inner.version += 1;
			Arc::new(WriteSet {
				version: inner.version,
				keys,
			})
		};

		debug!(version = writes.version, keys = writes.len(), "cache.merge");
		self.notify_writers(writes.clone());
		Ok(writes)
	}

	/// Parses a JSON array of wire nodes and merges them.
	///
	/// `null` is treated as an empty array.
	///
	/// # Errors
	///
	/// `Error::InvalidNode` if the value is not an array or any node fails to parse.
	pub fn merge_json(&self, nodes: JsonValue) -> Result<Arc<WriteSet>> {
		let nodes = match nodes {
			JsonValue::Null => Vec::new(),
			JsonValue::Array(nodes) => nodes,
			other => return Err(Error::InvalidNode(format!("expected an array of nodes, got {other}"))),
		};
		let nodes = nodes
			.into_iter()
			.map(|node| CacheNode::from_json(node, &self.tags))
			.collect::<Result<Vec<_>>>()?;
		self.merge(nodes)
	}

	/// Broadcasts a write set to every active listener.
	///
	/// Delivery order across listeners is unspecified. Having no listeners is not an error.
	pub fn notify_writers(&self, writes: Arc<WriteSet>) {
		let _ = self.writes_tx.send(writes);
	}

	/// Subscribes to write notifications.
	pub fn subscribe_writes(&self) -> broadcast::Receiver<Arc<WriteSet>> {
		self.writes_tx.subscribe()
	}

	/// Returns a copy of the fields stored for `key`.
	pub fn get(&self, key: &EntityKey) -> Option<Fields> {
		let inner = self.inner.read();
		inner.table.get(&key.entity_type)?.get(&key.entity_id).cloned()
	}

	/// Returns true if `key` has been merged.
	pub fn contains(&self, key: &EntityKey) -> bool {
		let inner = self.inner.read();
		inner
			.table
			.get(&key.entity_type)
			.is_some_and(|ids| ids.contains_key(&key.entity_id))
	}

	/// Number of stored nodes across all types.
	pub fn len(&self) -> usize {
		self.inner.read().table.values().map(HashMap::len).sum()
	}

	/// Returns true if no node has been merged.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Number of merges applied so far.
	pub fn version(&self) -> u64 {
		self.inner.read().version
	}

	/// Returns true if a live subscription depends on `key`.
	pub fn is_retained(&self, key: &EntityKey) -> bool {
		self.inner.read().retained.contains_key(key)
	}

	/// Drops every node no live subscription depends on and returns how many
	/// were removed.
	///
	/// The store never evicts on its own; this is the only way nodes leave it.
	/// Removal is not broadcast, since no subscription observes the removed keys.
	pub fn sweep(&self) -> usize {
		let mut inner = self.inner.write();
		let Inner { table, retained, .. } = &mut *inner;
		let mut removed = 0;
		table.retain(|entity_type, ids| {
			ids.retain(|entity_id, _| {
				let keep = retained.contains_key(&EntityKey::new(entity_type.clone(), entity_id.clone()));
				removed += usize::from(!keep);
				keep
			});
			!ids.is_empty()
		});
		debug!(removed, remaining = table.values().map(HashMap::len).sum::<usize>(), "cache.sweep");
		removed
	}

	/// Pins every key of `set` against [`NodeStore::sweep`].
	pub(crate) fn retain(&self, set: &SubscriptionSet) {
		if set.is_empty() {
			return;
		}
		let mut inner = self.inner.write();
		for key in set.iter() {
			*inner.retained.entry(key).or_default() += 1;
		}
	}

	/// Undoes one [`NodeStore::retain`] of `set`.
	pub(crate) fn release(&self, set: &SubscriptionSet) {
		if set.is_empty() {
			return;
		}
		let mut inner = self.inner.write();
		for key in set.iter() {
			if let Some(count) = inner.retained.get_mut(&key) {
				*count -= 1;
				if *count == 0 {
					inner.retained.remove(&key);
				}
			}
		}
	}

	/// Resolves every reference in `value` against a consistent snapshot.
	///
	/// # Errors
	///
	/// `Error::DanglingReference` or `Error::CyclicReference`, see [`resolve`].
	pub fn resolve(&self, value: &JsonValue) -> Result<Resolved> {
		let mut touched = SubscriptionSet::default();
		let (view, version) = self.resolve_into(&mut touched, value);
		Ok(Resolved {
			view: view?,
			touched,
			version,
		})
	}

	/// Like [`NodeStore::resolve`], but records into a caller-owned set that keeps
	/// whatever was touched before a failure. The version of the snapshot is
	/// returned either way.
	pub(crate) fn resolve_into(&self, touched: &mut SubscriptionSet, value: &JsonValue) -> (Result<JsonValue>, u64) {
		let inner = self.inner.read();
		(resolve(&inner.table, &self.tags, touched, value), inner.version)
	}
}
