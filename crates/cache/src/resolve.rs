//! Reference resolution.

use serde_json::Value as JsonValue;

use crate::node::{EntityKey, Fields, ReferenceTags};
use crate::store::NodeTable;
use crate::subscription::SubscriptionSet;
use crate::{Error, Result};

/// A fully dereferenced payload and the entities it was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
	/// The payload with every reference replaced by entity fields.
	pub view: JsonValue,
	/// Every entity visited while resolving.
	pub touched: SubscriptionSet,
	/// Store version the view was resolved against.
	pub version: u64,
}

/// Replaces every reference in `value` with the fields stored for it.
///
/// Arrays and plain objects are rebuilt element by element; scalars and `null`
/// pass through. Stored fields are resolved recursively, so nodes may refer to
/// other nodes. Every visited entity is recorded into `touched`, including those
/// visited before a failure.
///
/// # Errors
///
/// - `Error::DanglingReference` when a reference names an entity missing from `table`.
/// - `Error::CyclicReference` when an entity's fields refer back to itself.
pub fn resolve(table: &NodeTable, tags: &ReferenceTags, touched: &mut SubscriptionSet, value: &JsonValue) -> Result<JsonValue> {
	Resolver {
		table,
		tags,
		touched,
		stack: Vec::new(),
	}
	.value(value)
}

struct Resolver<'a> {
	table: &'a NodeTable,
	tags: &'a ReferenceTags,
	touched: &'a mut SubscriptionSet,
	/// Entities whose fields are currently being resolved.
	stack: Vec<EntityKey>,
}

impl Resolver<'_> {
	fn value(&mut self, value: &JsonValue) -> Result<JsonValue> {
		match value {
			JsonValue::Array(items) => items.iter().map(|item| self.value(item)).collect::<Result<Vec<_>>>().map(JsonValue::Array),
			JsonValue::Object(obj) => match self.tags.reference_key(obj) {
				Some(key) => self.reference(key),
				None => self.fields(obj).map(JsonValue::Object),
			},
			scalar => Ok(scalar.clone()),
		}
	}

	fn fields(&mut self, obj: &Fields) -> Result<Fields> {
		obj.iter().map(|(k, v)| Ok::<_, Error>((k.clone(), self.value(v)?))).collect()
	}

	fn reference(&mut self, key: EntityKey) -> Result<JsonValue> {
		let table = self.table;
		let Some(fields) = table.get(&key.entity_type).and_then(|ids| ids.get(&key.entity_id)) else {
			return Err(Error::DanglingReference(key));
		};
		if self.stack.contains(&key) {
			return Err(Error::CyclicReference(key));
		}

		self.touched.insert(&key);
		self.stack.push(key);
		let resolved = self.fields(fields);
		self.stack.pop();
		resolved.map(JsonValue::Object)
	}
}
