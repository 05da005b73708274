//! Live, de-duplicated views of backend-owned entities.
//!
//! [`Client`] is the composition root: it owns one [`NodeStore`], one
//! [`Transport`] and one [`QueryCache`], and exposes what views use:
//! * [`Client::use_entities`]: a live resolved view over a reference tree
//! * [`Client::query`]: fetch, cache, normalize and follow as a [`QueryView`]
//! * [`Client::call`] / [`Client::cancel`]: raw procedure calls
//! * [`Client::listen_invalidations`]: server-driven cache corrections
//!
//! ## Usage
//!
//! ```ignore
//! let client = Client::new(link, ClientConfig::default());
//! client.listen_invalidations();
//!
//! let mut tags = client.query("tags.list", serde_json::Value::Null).await?;
//! render(tags.view());
//! while tags.changed().await {
//!     render(tags.view());
//! }
//! ```

#![warn(missing_docs)]

mod client;
mod config;
pub mod invalidate;
pub mod query;
mod view;

pub use client::Client;
pub use config::ClientConfig;
pub use invalidate::{ApplySummary, InvalidateOperation, Invalidator, Refetch};
pub use query::{QueryCache, QueryKey};
pub use view::QueryView;
pub use tessera_cache::{CacheConfig, CacheNode, EntityKey, NodeStore, Subscription, SubscriptionSet, SubscriptionState};
pub use tessera_rpc::{CallEvent, CallHandle, CallId, Link, Method, StopAck, Transport, TransportConfig};

/// A convenient type alias for `Result` with `E` = [`enum@crate::Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Possible errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// Merging or resolving entities failed.
	#[error(transparent)]
	Cache(#[from] tessera_cache::Error),
	/// A call failed or the transport stopped.
	#[error(transparent)]
	Rpc(#[from] tessera_rpc::Error),
	/// The configuration document could not be parsed.
	#[error("invalid configuration: {0}")]
	Config(#[from] toml::de::Error),
}
