//! Client configuration.

use serde::Deserialize;
use tessera_cache::CacheConfig;
use tessera_rpc::TransportConfig;

use crate::Result;

/// Default procedure path of the invalidation stream.
const DEFAULT_INVALIDATION_PATH: &str = "invalidation.listen";

/// Configuration for a [`Client`](crate::Client).
///
/// Every field has a default, so an empty TOML document is a valid configuration:
///
/// ```toml
/// invalidation_path = "invalidation.listen"
///
/// [cache]
/// type_tag = "__type"
/// id_tag = "__id"
///
/// [transport]
/// batch_window_ms = 0
/// max_batch_size = 64
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
	/// Entity store settings.
	pub cache: CacheConfig,
	/// Batching transport settings.
	pub transport: TransportConfig,
	/// Procedure path of the long-lived invalidation subscription.
	pub invalidation_path: String,
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			cache: CacheConfig::default(),
			transport: TransportConfig::default(),
			invalidation_path: DEFAULT_INVALIDATION_PATH.into(),
		}
	}
}

impl ClientConfig {
	/// Parses a TOML document.
	///
	/// # Errors
	///
	/// `Error::Config` when the document is malformed or names unknown keys.
	pub fn from_toml(source: &str) -> Result<Self> {
		Ok(toml::from_str(source)?)
	}

	/// Set the cache configuration.
	pub fn cache(mut self, cache: CacheConfig) -> Self {
		self.cache = cache;
		self
	}

	/// Set the transport configuration.
	pub fn transport(mut self, transport: TransportConfig) -> Self {
		self.transport = transport;
		self
	}

	/// Set the invalidation stream path.
	pub fn invalidation_path(mut self, path: impl Into<String>) -> Self {
		self.invalidation_path = path.into();
		self
	}
}
