//! Tests for stores: commits, snapshots, unvalidated values and retention.

use std::sync::{Arc, Mutex};

use statebound::{
    Atom, Engine, NodeKey, NodeOptions, Retainable, RetainedBy, RetentionZone, Selector, Store, Tracer,
    Value,
};

fn observed() -> NodeOptions {
    NodeOptions::new().retained_by(RetainedBy::Observers)
}

fn sorted<'a>(keys: impl IntoIterator<Item = &'a NodeKey>) -> Vec<String> {
    let mut keys: Vec<String> = keys.into_iter().map(|k| k.to_string()).collect();
    keys.sort();
    keys
}

// ============================================================================
// Commits and snapshots
// ============================================================================

#[test]
fn test_commit_reports_dirty_and_downstream() {
    let engine = Engine::new();
    let store = Store::new(&engine);
    let a = Atom::new(&engine, "a", 1).unwrap();
    Atom::new(&engine, "unrelated", 0).unwrap();

    let a_dep = a.clone();
    let b = Selector::new(&engine, "b", move |get| Ok(*get.get(&a_dep)? * 2)).unwrap();
    let c = Selector::new(&engine, "c", move |get| Ok(*get.get(&b)? + 1)).unwrap();
    assert_eq!(*store.get(&c).unwrap(), 3);

    let commits = Arc::new(Mutex::new(Vec::new()));
    let seen = commits.clone();
    store.on_transaction_committed(move |commit| {
        seen.lock()
            .unwrap()
            .push((commit.previous, commit.version, sorted(&commit.dirty), sorted(&commit.downstream)));
    });

    let before = store.current_version().version();
    store.set(&a, 2).unwrap();
    assert_eq!(*store.get(&c).unwrap(), 5);

    let commits = commits.lock().unwrap();
    assert_eq!(commits.len(), 1);
    let (previous, version, dirty, downstream) = &commits[0];
    assert_eq!(*previous, before);
    assert_eq!(*version, store.current_version().version());
    assert_eq!(dirty, &vec!["a"]);
    assert_eq!(downstream, &vec!["a", "b", "c"]);
}

#[test]
fn test_snapshot_is_isolated() {
    let engine = Engine::new();
    let store = Store::new(&engine);
    let a = Atom::new(&engine, "a", 1).unwrap();
    let a_dep = a.clone();
    let b = Selector::new(&engine, "b", move |get| Ok(*get.get(&a_dep)? * 2)).unwrap();

    store.set(&a, 2).unwrap();
    let snapshot = store.snapshot();
    assert_ne!(snapshot.id(), store.id());

    store.set(&a, 3).unwrap();
    assert_eq!(*snapshot.get(&a).unwrap(), 2);
    assert_eq!(*snapshot.get(&b).unwrap(), 4);
    assert_eq!(*store.get(&b).unwrap(), 6);

    snapshot.set(&a, 10).unwrap();
    assert_eq!(*store.get(&a).unwrap(), 3);
    assert_eq!(*snapshot.get(&b).unwrap(), 20);
}

#[test]
fn test_peek_never_evaluates() {
    let engine = Engine::new();
    let store = Store::new(&engine);
    let a = Atom::new(&engine, "a", 1).unwrap();
    let a_dep = a.clone();
    let b = Selector::new(&engine, "b", move |get| Ok(*get.get(&a_dep)? + 1)).unwrap();

    assert!(store.peek(&b).is_none());
    assert!(store.peek(&a).unwrap().is_resolved());

    store.get(&b).unwrap();
    store.invalidate(&b).unwrap();
    let peeked = store.peek(&b).unwrap();
    assert_eq!(peeked.value().unwrap().downcast_ref::<i32>(), Some(&2));
}

#[test]
fn test_unvalidated_value_is_validated_on_read() {
    let engine = Engine::new();
    let store = Store::new(&engine);
    let port = Atom::with_validator(&engine, "port", 80u16, |raw| {
        raw.downcast_ref::<String>().and_then(|s| s.parse().ok())
    })
    .unwrap();
    let port_dep = port.clone();
    let url = Selector::new(&engine, "url", move |get| Ok(format!("localhost:{}", get.get(&port_dep)?))).unwrap();

    assert_eq!(*store.get(&url).unwrap(), "localhost:80");
    store
        .set_unvalidated(port.key(), Value::new(String::from("8080")))
        .unwrap();
    assert_eq!(*store.get(&url).unwrap(), "localhost:8080");

    store
        .set_unvalidated(port.key(), Value::new(String::from("not a port")))
        .unwrap();
    assert_eq!(*store.get(&port).unwrap(), 80);
}

// ============================================================================
// Retention
// ============================================================================

#[derive(Default)]
struct ReleaseRecorder {
    released: Mutex<Vec<String>>,
}

impl Tracer for ReleaseRecorder {
    fn on_node_released(&self, _store: statebound::StoreId, key: &NodeKey) {
        self.released.lock().unwrap().push(key.to_string());
    }
}

#[test]
fn test_released_node_drops_its_state() {
    let recorder = Arc::new(ReleaseRecorder::default());
    let engine = Engine::builder().shared_tracer(recorder.clone()).build();
    let store = Store::new(&engine);
    let a = Atom::with_options(&engine, "a", 1, observed()).unwrap();

    store.set(&a, 5).unwrap();
    assert_eq!(*store.get(&a).unwrap(), 5);
    assert!(store.has_node(a.key()));

    store.retain(a.key().clone());
    store.release(a.key().clone());
    assert!(!store.has_node(a.key()));
    assert_eq!(*store.get(&a).unwrap(), 1);

    // Releasing again is a no-op.
    store.release(a.key().clone());
    assert_eq!(store.retain_count(&Retainable::Node(a.key().clone())), 0);
    assert_eq!(*recorder.released.lock().unwrap(), vec!["a"]);
}

#[test]
fn test_root_retained_nodes_are_never_released() {
    let engine = Engine::new();
    let store = Store::new(&engine);
    let a = Atom::new(&engine, "a", 1).unwrap();

    store.set(&a, 5).unwrap();
    store.get(&a).unwrap();
    store.retain(a.key().clone());
    store.release(a.key().clone());
    assert_eq!(*store.get(&a).unwrap(), 5);
}

#[test]
fn test_subscriber_blocks_release() {
    let engine = Engine::new();
    let store = Store::new(&engine);
    let a = Atom::with_options(&engine, "a", 1, observed()).unwrap();
    let a_dep = a.clone();
    let b = Selector::new(&engine, "b", move |get| Ok(*get.get(&a_dep)? + 1)).unwrap();

    store.set(&a, 5).unwrap();
    assert_eq!(*store.get(&b).unwrap(), 6);

    let guard = store.retain_guard(a.key().clone());
    drop(guard);
    assert_eq!(*store.get(&a).unwrap(), 5);
}

#[test]
fn test_release_reaches_upstream_dependencies() {
    let recorder = Arc::new(ReleaseRecorder::default());
    let engine = Engine::builder().shared_tracer(recorder.clone()).build();
    let store = Store::new(&engine);
    let a = Atom::with_options(&engine, "a", 1, observed()).unwrap();
    let b = Selector::with_options(&engine, "b", observed(), move |get| Ok(*get.get(&a)? + 1)).unwrap();

    let guard = store.retain_guard(b.key().clone());
    assert_eq!(*store.get(&b).unwrap(), 2);
    drop(guard);

    let mut released = recorder.released.lock().unwrap().clone();
    released.sort();
    assert_eq!(released, vec!["a", "b"]);
}

#[test]
fn test_zone_members_are_released_when_every_zone_is() {
    let engine = Engine::new();
    let store = Store::new(&engine);
    let page = RetentionZone::new("page");
    let dialog = RetentionZone::new("dialog");
    let options = NodeOptions::new().retained_by(RetainedBy::Zones(vec![page.clone(), dialog.clone()]));
    let a = Atom::with_options(&engine, "a", 1, options).unwrap();

    store.set(&a, 5).unwrap();
    assert_eq!(*store.get(&a).unwrap(), 5);
    store.retain(page.clone());
    store.retain(dialog.clone());

    store.release(page);
    assert_eq!(*store.get(&a).unwrap(), 5);

    store.release(dialog);
    assert_eq!(*store.get(&a).unwrap(), 1);
}

#[test]
fn test_release_inside_batch_waits_for_commit() {
    let engine = Engine::new();
    let store = Store::new(&engine);
    let a = Atom::with_options(&engine, "a", 1, observed()).unwrap();

    store.set(&a, 5).unwrap();
    store.get(&a).unwrap();
    store.retain(a.key().clone());
    store.batch(|| {
        store.release(a.key().clone());
        store.retain(a.key().clone());
    });
    assert_eq!(*store.get(&a).unwrap(), 5);

    store.batch(|| {
        store.release(a.key().clone());
        assert_eq!(*store.get(&a).unwrap(), 5);
    });
    assert_eq!(*store.get(&a).unwrap(), 1);
}

#[test]
fn test_released_definition_is_deleted() {
    let engine = Engine::new();
    let store = Store::new(&engine);
    let options = observed().delete_definition_on_release(true);
    let a = Atom::with_options(&engine, "a", 1, options).unwrap();

    store.get(&a).unwrap();
    store.retain(a.key().clone());
    store.release(a.key().clone());
    assert!(!engine.is_registered(a.key()));
}

#[test]
fn test_retention_can_be_disabled() {
    let engine = Engine::builder().retention(false).build();
    let store = Store::new(&engine);
    let a = Atom::with_options(&engine, "a", 1, observed()).unwrap();

    store.set(&a, 5).unwrap();
    store.get(&a).unwrap();
    store.retain(a.key().clone());
    store.release(a.key().clone());
    assert_eq!(*store.get(&a).unwrap(), 5);
}
