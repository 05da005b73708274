//! Configuration for the entity node store.

use serde::Deserialize;

use crate::node::ReferenceTags;

/// Default capacity of the write broadcast channel.
const DEFAULT_NOTIFY_CAPACITY: usize = 256;

/// Configuration for a [`NodeStore`](crate::NodeStore).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
	/// Object key naming the entity type of a node or reference.
	pub type_tag: String,
	/// Object key naming the entity id of a node or reference.
	pub id_tag: String,
	/// Number of write sets buffered per listener before it is considered lagging.
	pub notify_capacity: usize,
}

impl Default for CacheConfig {
	fn default() -> Self {
		let tags = ReferenceTags::default();
		Self {
			type_tag: tags.type_tag,
			id_tag: tags.id_tag,
			notify_capacity: DEFAULT_NOTIFY_CAPACITY,
		}
	}
}

impl CacheConfig {
	/// Set the reference tag keys.
	pub fn tags(mut self, type_tag: impl Into<String>, id_tag: impl Into<String>) -> Self {
		self.type_tag = type_tag.into();
		self.id_tag = id_tag.into();
		self
	}

	/// Set the write broadcast capacity.
	pub fn notify_capacity(mut self, capacity: usize) -> Self {
		self.notify_capacity = capacity;
		self
	}

	/// Reference tags described by this configuration.
	pub fn reference_tags(&self) -> ReferenceTags {
		ReferenceTags::new(self.type_tag.clone(), self.id_tag.clone())
	}
}
