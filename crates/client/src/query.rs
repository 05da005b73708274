//! Cached query results keyed by query identity.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tracing::trace;

/// Identity of one query: its procedure path plus its argument.
#[derive(Debug, Clone)]
pub struct QueryKey {
	path: String,
	arg: JsonValue,
	identity: String,
}

impl QueryKey {
	/// Creates a key; the identity is `path` followed by the compact JSON of `arg`.
	pub fn new(path: impl Into<String>, arg: JsonValue) -> Self {
		let path = path.into();
		let identity = format!("{path}{arg}");
		Self { path, arg, identity }
	}

	/// Procedure path.
	pub fn path(&self) -> &str {
		&self.path
	}

	/// Query argument, `null` when the query takes none.
	pub fn arg(&self) -> &JsonValue {
		&self.arg
	}

	/// Lookup key of this query.
	pub fn identity(&self) -> &str {
		&self.identity
	}
}

impl PartialEq for QueryKey {
	fn eq(&self, other: &Self) -> bool {
		self.identity == other.identity
	}
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.identity.hash(state);
	}
}

struct Entry {
	value: watch::Sender<Option<JsonValue>>,
	stale: bool,
	/// Bumped on every write and every invalidation.
	generation: u64,
}

impl Entry {
	fn new() -> Self {
		let (value, _) = watch::channel(None);
		Self {
			value,
			stale: false,
			generation: 0,
		}
	}

	fn replace(&mut self, key: &QueryKey, value: JsonValue) {
		self.generation += 1;
		self.stale = false;
		self.value.send_replace(Some(value));
		trace!(query = key.identity(), generation = self.generation, "query.set");
	}
}

/// Last known result of every query, with staleness tracking.
///
/// Each entry carries a generation counter. A write that was started against an
/// older generation, such as a slow refetch, is discarded instead of overwriting
/// a fresher value.
#[derive(Default)]
pub struct QueryCache {
	entries: RwLock<HashMap<QueryKey, Entry>>,
}

impl std::fmt::Debug for QueryCache {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("QueryCache")
			.field("entries", &self.entries.read().len())
			.finish_non_exhaustive()
	}
}

impl QueryCache {
	/// Creates an empty cache.
	pub fn new() -> Self {
		Self::default()
	}

	/// Cached value for `key`.
	pub fn get(&self, key: &QueryKey) -> Option<JsonValue> {
		self.entries.read().get(key).and_then(|e| e.value.borrow().clone())
	}

	/// Returns true if an entry exists for `key`, even one without a value yet.
	pub fn contains(&self, key: &QueryKey) -> bool {
		self.entries.read().contains_key(key)
	}

	/// Stores a fresh value, clearing staleness. Returns the new generation.
	pub fn set(&self, key: &QueryKey, value: JsonValue) -> u64 {
		let mut entries = self.entries.write();
		let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
		entry.replace(key, value);
		entry.generation
	}

	/// Stores a fresh value and watches for the values that replace it.
	pub fn set_and_watch(&self, key: &QueryKey, value: JsonValue) -> watch::Receiver<Option<JsonValue>> {
		let mut entries = self.entries.write();
		let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
		entry.replace(key, value);
		entry.value.subscribe()
	}

	/// Stores `value` only if no write or invalidation happened since `generation`.
	pub fn set_if_current(&self, key: &QueryKey, generation: u64, value: JsonValue) -> bool {
		let mut entries = self.entries.write();
		let Some(entry) = entries.get_mut(key) else {
			return false;
		};
		if entry.generation != generation {
			trace!(query = key.identity(), generation, current = entry.generation, "query.set.superseded");
			return false;
		}
		entry.replace(key, value);
		true
	}

	/// Marks `key` stale. Returns the generation a refetch must match, or `None`
	/// if nothing was ever cached for `key`.
	pub fn mark_stale(&self, key: &QueryKey) -> Option<u64> {
		let mut entries = self.entries.write();
		let entry = entries.get_mut(key)?;
		entry.generation += 1;
		entry.stale = true;
		Some(entry.generation)
	}

	/// Returns true if `key` was invalidated and not refreshed since.
	pub fn is_stale(&self, key: &QueryKey) -> bool {
		self.entries.read().get(key).is_some_and(|e| e.stale)
	}

	/// Watches the value of `key`, creating an empty entry if needed.
	pub fn watch(&self, key: &QueryKey) -> watch::Receiver<Option<JsonValue>> {
		let mut entries = self.entries.write();
		entries.entry(key.clone()).or_insert_with(Entry::new).value.subscribe()
	}

	/// Number of entries.
	pub fn len(&self) -> usize {
		self.entries.read().len()
	}

	/// Returns true if nothing is cached.
	pub fn is_empty(&self) -> bool {
		self.entries.read().is_empty()
	}
}
