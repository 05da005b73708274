use std::collections::HashMap;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use tessera_cache::{EntityKey, SubscriptionState};

use super::*;

/// Link answering queries from a table of canned results and counting calls per path.
#[derive(Default)]
struct Backend {
	results: Mutex<HashMap<String, JsonValue>>,
	calls: Mutex<HashMap<String, usize>>,
	stops: Mutex<Vec<JsonValue>>,
}

impl Backend {
	fn with(results: impl IntoIterator<Item = (&'static str, JsonValue)>) -> Arc<Self> {
		let backend = Self::default();
		backend
			.results
			.lock()
			.extend(results.into_iter().map(|(path, result)| (path.to_owned(), result)));
		Arc::new(backend)
	}

	fn serve(&self, path: &str, result: JsonValue) {
		self.results.lock().insert(path.to_owned(), result);
	}

	fn calls(&self, path: &str) -> usize {
		self.calls.lock().get(path).copied().unwrap_or(0)
	}
}

#[async_trait]
impl Link for Backend {
	async fn exchange(&self, batch: JsonValue) -> tessera_rpc::Result<JsonValue> {
		let mut replies = Vec::new();
		for entry in batch.as_array().into_iter().flatten() {
			if entry.get("jsonrpc").is_some() {
				self.stops.lock().push(entry.clone());
				continue;
			}
			let path = entry["params"]["path"].as_str().unwrap_or_default().to_owned();
			*self.calls.lock().entry(path.clone()).or_default() += 1;
			if entry["method"] == json!("subscription") {
				continue;
			}
			let result = match self.results.lock().get(&path) {
				Some(data) => json!({"type": "response", "data": data}),
				None => json!({"type": "error", "data": {"code": -32601, "message": format!("no procedure {path}")}}),
			};
			replies.push(json!({"id": entry["id"], "result": result}));
		}
		Ok(JsonValue::Array(replies))
	}
}

fn tags_list() -> JsonValue {
	json!({
		"nodes": [
			{"__type": "Tag", "__id": "1", "name": "Work"},
			{"__type": "Tag", "__id": "2", "name": "Home"},
		],
		"items": [{"__type": "Tag", "__id": "1"}, {"__type": "Tag", "__id": "2"}],
	})
}

async fn settle() {
	for _ in 0..32 {
		tokio::task::yield_now().await;
	}
}

#[tokio::test]
async fn query_caches_and_resolves() {
	let backend = Backend::with([("tags.list", tags_list())]);
	let client = Client::new(backend.clone(), ClientConfig::default());

	let view = client.query("tags.list", JsonValue::Null).await.unwrap();

	assert_eq!(
		view.view().unwrap().unwrap(),
		&json!({"items": [{"name": "Work"}, {"name": "Home"}]})
	);
	assert_eq!(view.subscription().state(), SubscriptionState::Resolved);
	assert_eq!(view.subscription().subscription_set().len(), 2);
	assert!(client.queries().get(&QueryKey::new("tags.list", JsonValue::Null)).is_some());
	assert_eq!(client.store().len(), 2);
	assert_eq!(backend.calls("tags.list"), 1);
}

#[tokio::test]
async fn failed_query_reports_backend_error() {
	let client = Client::new(Arc::new(Backend::default()), ClientConfig::default());

	let err = client.query("missing.proc", JsonValue::Null).await.unwrap_err();

	assert!(matches!(
		err,
		crate::Error::Rpc(tessera_rpc::Error::Response(ref e)) if e.code == -32601
	));
	assert!(client.queries().is_empty());
}

#[tokio::test]
async fn use_entities_tracks_writes_to_touched_entities() {
	let client = Client::new(Arc::new(Backend::default()), ClientConfig::default());
	let mut unit = client
		.use_entities(json!({
			"nodes": [{"__type": "Tag", "__id": "1", "name": "Work"}],
			"tag": {"__type": "Tag", "__id": "1"},
		}))
		.unwrap();

	client
		.store()
		.merge_json(json!([{"__type": "Tag", "__id": "1", "name": "Office"}]))
		.unwrap();

	assert!(unit.changed().await);
	assert_eq!(unit.view().unwrap().unwrap(), &json!({"tag": {"name": "Office"}}));
}

#[tokio::test]
async fn pushed_invalidations_are_applied_in_order() {
	let backend = Backend::with([("tags.list", tags_list())]);
	let client = Client::new(backend.clone(), ClientConfig::default());
	client.query("tags.list", JsonValue::Null).await.unwrap();

	let id = client.listen_invalidations();
	settle().await;
	assert_eq!(backend.calls("invalidation.listen"), 1);

	client.transport().receive(json!({
		"id": id.0,
		"result": {"type": "event", "data": [
			{"key": "tags.list", "arg": null, "result": {"items": []}},
			{"key": "tags.list", "arg": null, "result": {"items": ["last"]}},
		]},
	}));
	settle().await;

	assert_eq!(
		client.queries().get(&QueryKey::new("tags.list", JsonValue::Null)),
		Some(json!({"items": ["last"]}))
	);
	assert_eq!(backend.calls("tags.list"), 1);
}

#[tokio::test]
async fn null_result_refetches_through_the_transport() {
	let backend = Backend::with([("tags.list", tags_list())]);
	let client = Client::new(backend.clone(), ClientConfig::default());
	client.query("tags.list", JsonValue::Null).await.unwrap();

	backend.serve("tags.list", json!({
		"nodes": [{"__type": "Tag", "__id": "1", "name": "Office"}],
		"items": [{"__type": "Tag", "__id": "1"}],
	}));
	let summary = client.invalidate(json!([{"key": "tags.list", "arg": null, "result": null}]));
	assert_eq!(summary.refetched, 1);
	settle().await;

	assert_eq!(backend.calls("tags.list"), 2);
	assert!(!client.queries().is_stale(&QueryKey::new("tags.list", JsonValue::Null)));
	assert_eq!(
		client.store().get(&EntityKey::new("Tag", "1")).unwrap()["name"],
		json!("Office")
	);
}

#[tokio::test]
async fn cancelled_listener_sends_stop() {
	let backend = Arc::new(Backend::default());
	let client = Client::new(backend.clone(), ClientConfig::default());
	let id = client.listen_invalidations();
	settle().await;

	client.cancel(&id).unwrap().acknowledged().await.unwrap();

	let stops = backend.stops.lock().clone();
	assert_eq!(stops, vec![json!({"jsonrpc": "2.0", "id": id.0, "method": "subscriptionStop", "params": null})]);
	assert!(client.cancel(&id).is_none());
}

#[tokio::test]
async fn shutdown_rejects_outstanding_calls() {
	let client = Client::new(Arc::new(Backend::default()), ClientConfig::default());
	let handle = client.call(Method::Subscription, "jobs.progress", JsonValue::Null);
	settle().await;

	client.shutdown();

	assert!(matches!(handle.response().await, Err(tessera_rpc::Error::ServiceStopped)));
	assert!(matches!(
		client.query("tags.list", JsonValue::Null).await,
		Err(crate::Error::Rpc(tessera_rpc::Error::ServiceStopped))
	));
}

#[tokio::test]
async fn query_view_follows_write_through_invalidation() {
	let backend = Backend::with([("tags.list", tags_list())]);
	let client = Client::new(backend.clone(), ClientConfig::default());
	let mut view = client.query("tags.list", JsonValue::Null).await.unwrap();

	client.invalidate(json!([{
		"key": "tags.list",
		"arg": null,
		"result": {
			"nodes": [{"__type": "Tag", "__id": "3", "name": "New"}],
			"items": [{"__type": "Tag", "__id": "3"}],
		},
	}]));

	assert!(view.changed().await);
	assert_eq!(view.view().unwrap().unwrap(), &json!({"items": [{"name": "New"}]}));
	assert_eq!(backend.calls("tags.list"), 1);
}

#[tokio::test]
async fn query_view_follows_landed_refetch() {
	let backend = Backend::with([("tags.list", tags_list())]);
	let client = Client::new(backend.clone(), ClientConfig::default());
	let mut view = client.query("tags.list", JsonValue::Null).await.unwrap();

	backend.serve("tags.list", json!({
		"nodes": [{"__type": "Tag", "__id": "2", "name": "Home"}],
		"items": [{"__type": "Tag", "__id": "2"}],
	}));
	client.invalidate(json!({"key": "tags.list", "arg": null, "result": null}));

	assert!(view.changed().await);
	assert_eq!(view.view().unwrap().unwrap(), &json!({"items": [{"name": "Home"}]}));
	assert_eq!(view.reloads(), 1);
}
