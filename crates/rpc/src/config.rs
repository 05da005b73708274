//! Transport configuration.

use std::time::Duration;

use serde::Deserialize;

/// Configuration for a [`Transport`](crate::Transport).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
	/// How long a batch stays open after its first call. Zero flushes on the next tick.
	pub batch_window_ms: u64,
	/// Upper bound on entries per outbound message. Zero means unbounded.
	pub max_batch_size: usize,
}

impl TransportConfig {
	/// Set the batch window.
	pub fn batch_window(mut self, window: Duration) -> Self {
		self.batch_window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
		self
	}

	/// Set the maximum batch size.
	pub fn max_batch_size(mut self, size: usize) -> Self {
		self.max_batch_size = size;
		self
	}

	pub(crate) fn window(&self) -> Duration {
		Duration::from_millis(self.batch_window_ms)
	}
}
