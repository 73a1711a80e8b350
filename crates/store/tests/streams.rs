#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kubeward_core::{KubeError, ObjectIdentity, ResourceKind};
use kubeward_kinds::{daemon_set_json, EntityView};
use kubeward_kubehub::{MockCluster, WatchConfig};
use kubeward_store::{EntityChange, EntitySyncHub, HubConfig, HubError, StreamState};
use parking_lot::Mutex;

const DS: ResourceKind = ResourceKind::DaemonSet;

fn recorder() -> (Arc<Mutex<Vec<String>>>, Arc<dyn kubeward_store::HubObserver>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let observer = move |change: &EntityChange| {
        let line = match change {
            EntityChange::Created(h) => format!("+{}", h.identity().name),
            EntityChange::Updated(h) => format!("~{}", h.identity().name),
            EntityChange::Retired(h) => format!("-{}", h.identity().name),
            EntityChange::Synced(kind) => format!("synced {}", kind),
            EntityChange::Failed { kind, message } => format!("failed {}: {}", kind, message),
        };
        sink.lock().push(line);
    };
    (seen, Arc::new(observer))
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn quiet() -> WatchConfig {
    WatchConfig { relist: None, ..WatchConfig::default() }
}

#[tokio::test]
async fn subscribe_mirrors_the_cluster() {
    let cluster = MockCluster::new();
    cluster.apply(DS, daemon_set_json("default", "web", "", 3, 3)).unwrap();
    let hub = EntitySyncHub::new(cluster.clone(), HubConfig::default(), quiet());
    let (seen, observer) = recorder();

    let mut view = hub.subscribe(DS, observer);
    view.wait_synced().await.unwrap();
    assert_eq!(view.state(), StreamState::Synced);
    let web = view.get("default", "web").unwrap();
    assert_eq!(web.state(), "True");

    while cluster.watcher_count() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    cluster.apply(DS, daemon_set_json("default", "web", "", 3, 1)).unwrap();
    eventually("update", || web.snapshot().int_field("pods_available") == Some(1)).await;
    assert_eq!(view.get("default", "web").unwrap().id(), web.id());
    assert_eq!(web.state(), "False");
    eventually("observer", || seen.lock().len() == 3).await;
    assert_eq!(*seen.lock(), vec!["+web", "synced DaemonSet", "~web"]);

    hub.shutdown().await;
}

#[tokio::test]
async fn teardown_retires_and_resubscribe_starts_fresh() {
    let cluster = MockCluster::new();
    cluster.apply(DS, daemon_set_json("default", "web", "", 2, 2)).unwrap();
    cluster.apply(DS, daemon_set_json("default", "db", "", 1, 1)).unwrap();
    let hub = EntitySyncHub::new(cluster.clone(), HubConfig::default(), quiet());
    let (seen, observer) = recorder();
    let mut view = hub.subscribe(DS, observer);
    view.wait_synced().await.unwrap();
    let web = view.get("default", "web").unwrap();

    assert_eq!(hub.teardown(DS).await, 2);
    assert!(web.is_retired());
    assert!(hub.handles(DS).is_empty());
    assert_eq!(view.state(), StreamState::Stopped);
    assert!(hub.state(DS).is_none());
    let mut retired: Vec<String> = seen.lock().iter().filter(|l| l.starts_with('-')).cloned().collect();
    retired.sort();
    assert_eq!(retired, vec!["-db", "-web"]);
    assert_eq!(cluster.watcher_count(), 0);

    let (_, observer) = recorder();
    let mut again = hub.subscribe(DS, observer);
    again.wait_synced().await.unwrap();
    assert_ne!(again.get("default", "web").unwrap().id(), web.id());
    hub.shutdown().await;
}

#[tokio::test]
async fn terminal_stream_error_is_reported() {
    let cluster = MockCluster::new();
    cluster.fail_next_list(KubeError::Unauthorized("token expired".into()));
    let hub = EntitySyncHub::new(cluster.clone(), HubConfig::default(), quiet());
    let (_, observer) = recorder();
    let mut view = hub.subscribe(DS, observer);
    let err = view.wait_synced().await.unwrap_err();
    assert!(matches!(err, HubError::StreamFailed { kind: DS, .. }), "{:?}", err);
    assert!(matches!(hub.state(DS), Some(StreamState::Failed(_))));
    hub.shutdown().await;
}

#[tokio::test]
async fn waiting_on_an_unsubscribed_kind_fails() {
    let hub = EntitySyncHub::new(MockCluster::new(), HubConfig::default(), quiet());
    assert_eq!(hub.wait_synced(DS).await, Err(HubError::NotSubscribed(DS)));
}

#[tokio::test]
async fn kinds_are_isolated_and_counted() {
    let cluster = MockCluster::new();
    cluster.apply(DS, daemon_set_json("default", "web", "", 1, 1)).unwrap();
    cluster
        .apply(
            ResourceKind::Deployment,
            serde_json::json!({
                "metadata": { "name": "api", "namespace": "prod" },
                "spec": { "replicas": 2 },
                "status": { "availableReplicas": 1 }
            }),
        )
        .unwrap();
    let hub = EntitySyncHub::new(cluster.clone(), HubConfig::default(), quiet());
    let (_, a) = recorder();
    let (_, b) = recorder();
    hub.subscribe(DS, a);
    hub.subscribe(ResourceKind::Deployment, b);
    hub.wait_synced(DS).await.unwrap();
    hub.wait_synced(ResourceKind::Deployment).await.unwrap();

    let stats = hub.stats();
    assert_eq!(stats.len(), 2);
    assert!(stats.iter().all(|s| s.entities == 1 && s.state == StreamState::Synced));
    let api = hub.handle(&ObjectIdentity::new(ResourceKind::Deployment, "prod", "api")).unwrap();
    assert_eq!(api.state(), "False");

    assert_eq!(hub.teardown(ResourceKind::Deployment).await, 1);
    assert_eq!(hub.handles(DS).len(), 1);
    hub.shutdown().await;
}

#[tokio::test]
async fn namespace_scope_limits_the_watch() {
    let cluster = MockCluster::new();
    cluster.apply(DS, daemon_set_json("default", "web", "", 1, 1)).unwrap();
    cluster.apply(DS, daemon_set_json("kube-system", "proxy", "", 1, 1)).unwrap();
    let config = HubConfig { namespace: Some("kube-system".to_string()), ..HubConfig::default() };
    let hub = EntitySyncHub::new(cluster.clone(), config, quiet());
    let (_, observer) = recorder();
    hub.subscribe(DS, observer);
    hub.wait_synced(DS).await.unwrap();
    let names: Vec<String> = hub.handles(DS).iter().map(|h| h.identity().name.clone()).collect();
    assert_eq!(names, vec!["proxy"]);
    hub.shutdown().await;
}

#[tokio::test]
async fn late_subscriber_sees_existing_handles() {
    let cluster = MockCluster::new();
    cluster.apply(DS, daemon_set_json("default", "web", "", 1, 1)).unwrap();
    let hub = EntitySyncHub::new(cluster.clone(), HubConfig::default(), quiet());
    let (_, first) = recorder();
    hub.subscribe(DS, first);
    hub.wait_synced(DS).await.unwrap();

    let (seen, late) = recorder();
    let view = hub.subscribe(DS, late);
    assert_eq!(view.state(), StreamState::Synced);
    eventually("replay", || seen.lock().len() == 2).await;
    assert_eq!(*seen.lock(), vec!["+web", "synced DaemonSet"]);
    assert_eq!(cluster.list_calls(), 1);
    hub.shutdown().await;
}

#[tokio::test]
async fn observers_may_call_back_into_the_hub() {
    let cluster = MockCluster::new();
    cluster.apply(DS, daemon_set_json("default", "web", "", 1, 1)).unwrap();
    let hub = EntitySyncHub::new(cluster.clone(), HubConfig::default(), quiet());
    let (_, first) = recorder();
    hub.subscribe(DS, first);
    hub.wait_synced(DS).await.unwrap();

    let calls = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    let inner = hub.clone();
    let reentrant = move |change: &EntityChange| {
        let stats = inner.stats();
        let state = inner.state(DS);
        let nested = inner.subscribe(DS, Arc::new(|_: &EntityChange| {}));
        if let EntityChange::Created(h) = change {
            sink.lock().push((h.identity().name.clone(), stats.len(), state, nested.kind()));
        }
    };
    hub.subscribe(DS, Arc::new(reentrant));
    eventually("reentrant replay", || !calls.lock().is_empty()).await;
    assert_eq!(calls.lock()[0], ("web".to_string(), 1, Some(StreamState::Synced), DS));

    // The applier is still alive and delivering.
    while cluster.watcher_count() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    cluster.apply(DS, daemon_set_json("default", "db", "", 1, 1)).unwrap();
    eventually("live create", || calls.lock().iter().any(|c| c.0 == "db")).await;
    hub.shutdown().await;
}

#[tokio::test]
async fn terminal_error_after_sync_reaches_observers() {
    let cluster = MockCluster::new();
    cluster.apply(DS, daemon_set_json("default", "web", "", 1, 1)).unwrap();
    let hub = EntitySyncHub::new(cluster.clone(), HubConfig::default(), quiet());
    let (seen, observer) = recorder();
    let mut view = hub.subscribe(DS, observer);
    view.wait_synced().await.unwrap();
    while cluster.watcher_count() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    cluster.send_raw(DS, Err(KubeError::Unauthorized("revoked".to_string())));
    eventually("failure", || seen.lock().len() == 3).await;
    assert_eq!(*seen.lock(), vec!["+web", "synced DaemonSet", "failed DaemonSet: unauthorized: revoked"]);
    assert_eq!(view.state(), StreamState::Failed("unauthorized: revoked".to_string()));

    // A subscriber arriving after the failure hears about it as well.
    let (late_seen, late) = recorder();
    hub.subscribe(DS, late);
    assert_eq!(*late_seen.lock(), vec!["+web", "failed DaemonSet: unauthorized: revoked"]);

    assert_eq!(hub.teardown(DS).await, 1);
    hub.shutdown().await;
}
