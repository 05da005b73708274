use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use super::*;
use crate::CacheConfig;

fn store() -> Arc<NodeStore> {
	NodeStore::new(&CacheConfig::default())
}

fn write(store: &NodeStore, ty: &str, id: &str, name: &str) {
	store
		.merge_json(json!([{"__type": ty, "__id": id, "name": name}]))
		.unwrap();
}

fn tag_ref(id: &str) -> JsonValue {
	json!({"__type": "Tag", "__id": id})
}

#[test]
fn starts_idle() {
	let sub = Subscription::new(store());
	assert_eq!(sub.state(), SubscriptionState::Idle);
	assert!(sub.view().is_none());
	assert!(sub.subscription_set().is_empty());
}

#[test]
fn payload_nodes_merge_before_resolution() {
	let store = store();
	let mut sub = Subscription::new(store.clone());
	sub.set_payload(json!({
		"nodes": [{"__type": "Tag", "__id": "1", "name": "Work", "color": "#fff"}],
		"items": [tag_ref("1")],
	}))
	.unwrap();

	assert_eq!(sub.state(), SubscriptionState::Resolved);
	assert_eq!(sub.view().unwrap().unwrap(), &json!({"items": [{"name": "Work", "color": "#fff"}]}));
	assert_eq!(sub.subscription_set(), &SubscriptionSet::from_iter([("Tag", "1")]));
	assert_eq!(store.len(), 1);
	// Its own merge must not count as an external change.
	assert!(!sub.try_changed());
}

#[tokio::test]
async fn unrelated_write_does_not_recompute() {
	let store = store();
	write(&store, "Tag", "1", "Work");
	write(&store, "Tag", "2", "Home");

	let mut sub = Subscription::new(store.clone());
	sub.set_payload(json!([tag_ref("1")])).unwrap();

	write(&store, "Tag", "2", "Garden");
	assert!(!sub.try_changed());
	assert_eq!(sub.recomputations(), 0);

	write(&store, "Tag", "1", "Office");
	assert!(sub.try_changed());
	assert_eq!(sub.recomputations(), 1);
	assert_eq!(sub.view().unwrap().unwrap(), &json!([{"name": "Office"}]));
}

#[tokio::test]
async fn changed_skips_irrelevant_writes() {
	let store = store();
	write(&store, "Tag", "1", "Work");
	write(&store, "Tag", "2", "Home");

	let mut sub = Subscription::new(store.clone());
	sub.set_payload(json!({"tag": tag_ref("1")})).unwrap();

	write(&store, "Tag", "2", "Garden");
	write(&store, "Tag", "1", "Office");

	let changed = tokio::time::timeout(Duration::from_secs(1), sub.changed()).await.unwrap();
	assert!(changed);
	assert_eq!(sub.recomputations(), 1);
	assert_eq!(sub.view().unwrap().unwrap(), &json!({"tag": {"name": "Office"}}));
	assert!(!sub.try_changed());
}

#[test]
fn new_payload_replaces_subscription_set() {
	let store = store();
	write(&store, "Tag", "1", "Work");
	write(&store, "Tag", "2", "Home");

	let mut sub = Subscription::new(store.clone());
	sub.set_payload(json!([tag_ref("1")])).unwrap();
	sub.set_payload(json!([tag_ref("2")])).unwrap();
	assert_eq!(sub.subscription_set(), &SubscriptionSet::from_iter([("Tag", "2")]));

	write(&store, "Tag", "1", "Office");
	assert!(!sub.try_changed());
	write(&store, "Tag", "2", "Garden");
	assert!(sub.try_changed());
}

#[test]
fn dangling_reference_is_surfaced_and_repaired() {
	let store = store();
	let mut sub = Subscription::new(store.clone());
	sub.set_payload(json!([tag_ref("9")])).unwrap();

	assert_eq!(sub.view().unwrap().unwrap_err(), &Error::DanglingReference(EntityKey::new("Tag", "9")));

	write(&store, "Tag", "9", "Late");
	assert!(sub.try_changed());
	assert_eq!(sub.view().unwrap().unwrap(), &json!([{"name": "Late"}]));
}

#[test]
fn invalid_payload_nodes_keep_previous_output() {
	let store = store();
	write(&store, "Tag", "1", "Work");
	let mut sub = Subscription::new(store.clone());
	sub.set_payload(json!([tag_ref("1")])).unwrap();

	let err = sub
		.set_payload(json!({"nodes": [{"__id": "2"}], "items": []}))
		.unwrap_err();
	assert!(matches!(err, Error::InvalidNode(_)));
	assert_eq!(sub.view().unwrap().unwrap(), &json!([{"name": "Work"}]));
}

#[tokio::test]
async fn unmount_returns_to_idle() {
	let store = store();
	write(&store, "Tag", "1", "Work");
	let mut sub = Subscription::new(store.clone());
	sub.set_payload(json!([tag_ref("1")])).unwrap();

	sub.unmount();
	assert_eq!(sub.state(), SubscriptionState::Idle);
	write(&store, "Tag", "1", "Office");
	assert!(!sub.try_changed());
	assert!(!sub.changed().await);
	assert_eq!(sub.recomputations(), 0);
}

#[tokio::test]
async fn lagging_listener_recomputes_conservatively() {
	let store = NodeStore::new(&CacheConfig::default().notify_capacity(1));
	write(&store, "Tag", "1", "Work");
	let mut sub = Subscription::new(store.clone());
	sub.set_payload(json!([tag_ref("1")])).unwrap();

	for i in 0..4 {
		write(&store, "Tag", "2", &format!("noise {i}"));
	}
	assert!(sub.try_changed());
	assert_eq!(sub.recomputations(), 1);
}

#[test]
fn sweep_keeps_entities_of_live_subscriptions() {
	let store = store();
	write(&store, "Tag", "1", "Work");
	write(&store, "Tag", "2", "Home");
	write(&store, "Location", "9", "Desk");

	let mut first = Subscription::new(store.clone());
	first.set_payload(json!([tag_ref("1")])).unwrap();
	let mut second = Subscription::new(store.clone());
	second.set_payload(json!({"pinned": tag_ref("1")})).unwrap();

	assert_eq!(store.sweep(), 2);
	assert!(store.contains(&EntityKey::new("Tag", "1")));
	assert!(!store.contains(&EntityKey::new("Tag", "2")));

	first.unmount();
	assert!(store.is_retained(&EntityKey::new("Tag", "1")));
	assert_eq!(store.sweep(), 0);

	drop(second);
	assert!(!store.is_retained(&EntityKey::new("Tag", "1")));
	assert_eq!(store.sweep(), 1);
	assert!(store.is_empty());
}

#[test]
fn new_payload_releases_previous_entities() {
	let store = store();
	write(&store, "Tag", "1", "Work");
	write(&store, "Tag", "2", "Home");

	let mut sub = Subscription::new(store.clone());
	sub.set_payload(json!([tag_ref("1")])).unwrap();
	sub.set_payload(json!([tag_ref("2")])).unwrap();

	assert!(!store.is_retained(&EntityKey::new("Tag", "1")));
	assert!(store.is_retained(&EntityKey::new("Tag", "2")));
}
