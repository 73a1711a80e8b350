#![forbid(unsafe_code)]

use kubeward_core::{ObjectIdentity, ObjectSnapshot, ResourceKind, WatchEvent};
use kubeward_kinds::{adapter, daemon_set_json};
use kubeward_kubehub::{MockCluster, WatchConfig};
use kubeward_store::{EntityChange, EntitySyncHub, HubConfig};

const DS: ResourceKind = ResourceKind::DaemonSet;

fn hub() -> EntitySyncHub {
    EntitySyncHub::new(MockCluster::new(), HubConfig::default(), WatchConfig::default())
}

fn snap(name: &str, rv: &str, scheduled: i64, available: i64) -> ObjectSnapshot {
    adapter(DS).snapshot(&daemon_set_json("default", name, rv, scheduled, available)).unwrap()
}

fn id(name: &str) -> ObjectIdentity {
    ObjectIdentity::new(DS, "default", name)
}

#[test]
fn last_writer_wins_per_identity_despite_interleaving() {
    let hub = hub();
    let events = vec![
        WatchEvent::Added(snap("web", "1", 3, 3)),
        WatchEvent::Added(snap("db", "2", 1, 1)),
        WatchEvent::Modified(snap("web", "3", 3, 2)),
        WatchEvent::Modified(snap("db", "4", 1, 0)),
        WatchEvent::Modified(snap("web", "5", 3, 1)),
    ];
    for ev in events {
        hub.apply_event(DS, ev);
    }
    let web = hub.handle(&id("web")).unwrap();
    assert_eq!(*web.snapshot(), snap("web", "5", 3, 1));
    assert_eq!(hub.handle(&id("db")).unwrap().snapshot().resource_version.as_str(), "4");

    let change = hub.apply_event(DS, WatchEvent::Removed(id("web")));
    assert!(matches!(change, Some(EntityChange::Retired(_))));
    assert!(hub.handle(&id("web")).is_none());
    assert!(web.is_retired());
    assert!(hub.handle(&id("db")).is_some());
}

#[test]
fn duplicate_added_behaves_like_modified() {
    let hub = hub();
    let first = match hub.apply_event(DS, WatchEvent::Added(snap("web", "1", 3, 3))) {
        Some(EntityChange::Created(h)) => h,
        other => panic!("expected Created, got {:?}", other),
    };
    match hub.apply_event(DS, WatchEvent::Added(snap("web", "2", 3, 2))) {
        Some(EntityChange::Updated(h)) => assert_eq!(h.id(), first.id()),
        other => panic!("expected Updated, got {:?}", other),
    }
    assert_eq!(hub.handles(DS).len(), 1);
    assert_eq!(first.snapshot().int_field("pods_available"), Some(2));
}

#[test]
fn modified_for_unknown_identity_creates() {
    let hub = hub();
    assert!(matches!(hub.apply_event(DS, WatchEvent::Modified(snap("web", "9", 1, 1))), Some(EntityChange::Created(_))));
    assert_eq!(hub.handles(DS).len(), 1);
}

#[test]
fn removed_for_unknown_identity_is_a_no_op() {
    let hub = hub();
    assert!(hub.apply_event(DS, WatchEvent::Removed(id("ghost"))).is_none());
}

#[test]
fn events_for_another_kind_are_rejected() {
    let hub = hub();
    assert!(hub.apply_event(ResourceKind::Deployment, WatchEvent::Added(snap("web", "1", 1, 1))).is_none());
    assert!(hub.handles(DS).is_empty());
    assert!(matches!(
        hub.apply_event(ResourceKind::Deployment, WatchEvent::ResyncMarker),
        Some(EntityChange::Synced(ResourceKind::Deployment))
    ));
}

#[test]
fn re_added_identity_gets_a_fresh_handle() {
    let hub = hub();
    hub.apply_event(DS, WatchEvent::Added(snap("web", "1", 3, 3)));
    let old = hub.handle(&id("web")).unwrap();
    hub.apply_event(DS, WatchEvent::Removed(id("web")));
    hub.apply_event(DS, WatchEvent::Added(snap("web", "3", 3, 3)));
    let new = hub.handle(&id("web")).unwrap();
    assert_ne!(old.id(), new.id());
    assert!(old.is_retired());
    assert!(!new.is_retired());
}
