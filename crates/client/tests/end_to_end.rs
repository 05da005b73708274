//! Client scenarios driven through a scripted backend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{Value as JsonValue, json};
use tessera_client::{CacheConfig, CacheNode, Client, ClientConfig, EntityKey, Link, QueryKey, TransportConfig};

/// Answers queries by path and counts every call it sees.
#[derive(Default)]
struct ScriptedBackend {
	results: Mutex<HashMap<String, JsonValue>>,
	batches: Mutex<Vec<JsonValue>>,
}

impl ScriptedBackend {
	fn serve(&self, path: &str, result: JsonValue) {
		self.results.lock().insert(path.to_owned(), result);
	}

	fn calls(&self, path: &str) -> usize {
		self.batches
			.lock()
			.iter()
			.flat_map(|batch| batch.as_array().cloned().unwrap_or_default())
			.filter(|entry| entry["params"]["path"] == json!(path))
			.count()
	}
}

#[async_trait]
impl Link for ScriptedBackend {
	async fn exchange(&self, batch: JsonValue) -> tessera_rpc::Result<JsonValue> {
		self.batches.lock().push(batch.clone());
		let results = self.results.lock();
		let replies = batch
			.as_array()
			.into_iter()
			.flatten()
			.filter(|entry| entry["method"] == json!("query"))
			.filter_map(|entry| {
				let data = results.get(entry["params"]["path"].as_str()?)?;
				Some(json!({"id": entry["id"], "result": {"type": "response", "data": data}}))
			})
			.collect();
		Ok(JsonValue::Array(replies))
	}
}

fn setup() -> (Client, Arc<ScriptedBackend>) {
	let _ = tracing_subscriber::fmt::try_init();
	let backend = Arc::new(ScriptedBackend::default());
	let client = Client::new(backend.clone(), ClientConfig::default());
	(client, backend)
}

async fn settle() {
	for _ in 0..32 {
		tokio::task::yield_now().await;
	}
}

fn tag_node(id: &str, value: JsonValue) -> CacheNode {
	let JsonValue::Object(fields) = value else {
		panic!("fields must be an object");
	};
	CacheNode::new("Tag", id, fields)
}

#[tokio::test]
async fn merged_tag_resolves_through_custom_tags() {
	let _ = tracing_subscriber::fmt::try_init();
	let config = ClientConfig::default().cache(CacheConfig::default().tags("entityType", "entityId"));
	let client = Client::new(Arc::new(ScriptedBackend::default()), config);

	client
		.store()
		.merge([tag_node("1", json!({"name": "Work", "color": "#fff"}))])
		.unwrap();
	let unit = client
		.use_entities(json!({"tags": [{"entityType": "Tag", "entityId": "1"}]}))
		.unwrap();

	assert_eq!(
		unit.view().unwrap().unwrap(),
		&json!({"tags": [{"name": "Work", "color": "#fff"}]})
	);
	let touched: Vec<EntityKey> = unit.subscription_set().iter().collect();
	assert_eq!(touched, vec![EntityKey::new("Tag", "1")]);
}

#[tokio::test]
async fn unrelated_writes_do_not_recompute() {
	let (client, backend) = setup();
	backend.serve("tags.get", json!({
		"nodes": [{"__type": "Tag", "__id": "1", "name": "Work"}],
		"tag": {"__type": "Tag", "__id": "1"},
	}));
	let mut unit = client.query("tags.get", json!(1)).await.unwrap();

	client
		.store()
		.merge_json(json!([{"__type": "Tag", "__id": "2", "name": "Home"}]))
		.unwrap();
	assert!(!unit.try_changed());

	client
		.store()
		.merge_json(json!([{"__type": "Tag", "__id": "1", "name": "Office"}]))
		.unwrap();
	assert!(unit.try_changed());
	assert_eq!(unit.subscription().recomputations(), 1);
	assert_eq!(unit.view().unwrap().unwrap(), &json!({"tag": {"name": "Office"}}));
}

#[tokio::test]
async fn invalidation_stream_refetches_only_on_null_results() {
	let (client, backend) = setup();
	backend.serve("tags.list", json!(["a"]));
	backend.serve("locations.list", json!(["x"]));
	client.query("tags.list", JsonValue::Null).await.unwrap();
	client.query("locations.list", JsonValue::Null).await.unwrap();

	let listener = client.listen_invalidations();
	settle().await;
	backend.serve("locations.list", json!(["y"]));
	client.transport().receive(json!({
		"id": listener.0,
		"result": {"type": "event", "data": [
			{"key": "tags.list", "arg": null, "result": ["b"]},
			{"key": "locations.list", "arg": null, "result": null},
		]},
	}));
	settle().await;

	assert_eq!(backend.calls("tags.list"), 1);
	assert_eq!(backend.calls("locations.list"), 2);
	assert_eq!(client.queries().get(&QueryKey::new("tags.list", JsonValue::Null)), Some(json!(["b"])));
	assert_eq!(
		client.queries().get(&QueryKey::new("locations.list", JsonValue::Null)),
		Some(json!(["y"]))
	);
}

#[tokio::test]
async fn concurrent_queries_share_one_batch() {
	let _ = tracing_subscriber::fmt::try_init();
	let backend = Arc::new(ScriptedBackend::default());
	backend.serve("tags.list", json!(1));
	backend.serve("locations.list", json!(2));
	let client = Client::new(backend.clone(), ClientConfig::default().transport(TransportConfig::default()));

	let (tags, locations) = tokio::join!(
		client.query("tags.list", JsonValue::Null),
		client.query("locations.list", JsonValue::Null),
	);

	assert_eq!(tags.unwrap().view().unwrap().unwrap(), &json!(1));
	assert_eq!(locations.unwrap().view().unwrap().unwrap(), &json!(2));
	assert_eq!(backend.batches.lock().len(), 1);
}

#[tokio::test]
async fn shutdown_stops_the_client() {
	let (client, _) = setup();
	client.listen_invalidations();
	settle().await;

	client.shutdown();

	assert_eq!(client.transport().pending_len(), 0);
	assert!(client.transport().is_closed());
	assert!(client.query("tags.list", JsonValue::Null).await.is_err());
}
