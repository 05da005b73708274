//! Normalized entity cache for backend-owned records.
//!
//! The backend ships entities flat, keyed by `(type, id)`, and refers to them from
//! response payloads through small reference markers. This crate reassembles those
//! payloads for rendering:
//! * [`NodeStore`]: the single keyed table of entity fields, written only by merges
//! * [`resolve`]: substitutes reference markers with the stored fields
//! * [`Subscription`]: binds one rendering unit to exactly the entities it touched
//!
//! Stores are constructed explicitly and shared through `Arc`; there is no global
//! instance.

#![warn(missing_docs)]

mod config;
mod node;
mod resolve;
mod store;
mod subscription;

pub use config::CacheConfig;
pub use node::{CacheNode, EntityKey, Fields, ReferenceTags};
pub use resolve::{Resolved, resolve};
pub use store::{NodeStore, NodeTable, WriteSet};
pub use subscription::{Subscription, SubscriptionSet, SubscriptionState};

/// A convenient type alias for `Result` with `E` = [`enum@crate::Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Possible errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// A node is missing its type or id tag, or carries an empty one.
	#[error("invalid cache node: {0}")]
	InvalidNode(String),
	/// A reference names an entity the store has never received.
	#[error("dangling reference to {0}")]
	DanglingReference(EntityKey),
	/// A reference was reached again while its own fields were being resolved.
	#[error("cyclic reference through {0}")]
	CyclicReference(EntityKey),
}
