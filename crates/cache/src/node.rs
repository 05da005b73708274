//! Flat entity records and the reference markers that point at them.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{Error, Result};

/// Field map of one entity.
pub type Fields = serde_json::Map<String, JsonValue>;

/// Identity of one backend entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
	/// Entity type, e.g. `Tag` or `Location`.
	pub entity_type: String,
	/// Entity id, unique within its type.
	pub entity_id: String,
}

impl EntityKey {
	/// Creates a key from a type and id.
	pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
		Self {
			entity_type: entity_type.into(),
			entity_id: entity_id.into(),
		}
	}
}

impl fmt::Display for EntityKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}#{}", self.entity_type, self.entity_id)
	}
}

/// Object keys that mark a JSON object as a node or a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceTags {
	/// Key holding the entity type.
	pub type_tag: String,
	/// Key holding the entity id.
	pub id_tag: String,
}

impl Default for ReferenceTags {
	fn default() -> Self {
		Self::new("__type", "__id")
	}
}

impl ReferenceTags {
	/// Creates tags from explicit key names.
	pub fn new(type_tag: impl Into<String>, id_tag: impl Into<String>) -> Self {
		Self {
			type_tag: type_tag.into(),
			id_tag: id_tag.into(),
		}
	}

	/// Returns the key of an object carrying both tags as non-empty strings.
	pub fn reference_key(&self, obj: &Fields) -> Option<EntityKey> {
		let entity_type = obj.get(&self.type_tag)?.as_str()?;
		let entity_id = obj.get(&self.id_tag)?.as_str()?;
		if entity_type.is_empty() || entity_id.is_empty() {
			return None;
		}
		Some(EntityKey::new(entity_type, entity_id))
	}

	/// Builds the reference marker for `key`.
	pub fn reference(&self, key: &EntityKey) -> JsonValue {
		let mut obj = Fields::new();
		obj.insert(self.type_tag.clone(), JsonValue::String(key.entity_type.clone()));
		obj.insert(self.id_tag.clone(), JsonValue::String(key.entity_id.clone()));
		JsonValue::Object(obj)
	}
}

/// Authoritative, flattened attributes of one backend entity.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheNode {
	/// Identity of the entity.
	pub key: EntityKey,
	/// Entity attributes, without the type and id tags.
	pub fields: Fields,
}

impl CacheNode {
	/// Creates a node from its parts.
	pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>, fields: Fields) -> Self {
		Self {
			key: EntityKey::new(entity_type, entity_id),
			fields,
		}
	}

	/// Parses a flat wire node, splitting the tags from the fields.
	pub fn from_json(value: JsonValue, tags: &ReferenceTags) -> Result<Self> {
		let JsonValue::Object(mut fields) = value else {
			return Err(Error::InvalidNode(format!("expected an object, got {value}")));
		};
		let entity_type = take_tag(&mut fields, &tags.type_tag)?;
		let entity_id = take_tag(&mut fields, &tags.id_tag)?;
		Ok(Self::new(entity_type, entity_id, fields))
	}

	/// Checks that both parts of the key are non-empty.
	pub(crate) fn validate(&self) -> Result<()> {
		if self.key.entity_type.is_empty() {
			return Err(Error::InvalidNode(format!("empty entity type for id {:?}", self.key.entity_id)));
		}
		if self.key.entity_id.is_empty() {
			return Err(Error::InvalidNode(format!("empty entity id for type {:?}", self.key.entity_type)));
		}
		Ok(())
	}
}

fn take_tag(fields: &mut Fields, tag: &str) -> Result<String> {
	match fields.remove(tag) {
		Some(JsonValue::String(s)) if !s.is_empty() => Ok(s),
		Some(other) => Err(Error::InvalidNode(format!("tag `{tag}` must be a non-empty string, got {other}"))),
		None => Err(Error::InvalidNode(format!("missing tag `{tag}`"))),
	}
}
