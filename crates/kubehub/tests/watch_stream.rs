#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kubeward_core::{KubeError, KubeResult, ObjectIdentity, ResourceKind, WatchEvent};
use kubeward_kinds::daemon_set_json;
use kubeward_kubehub::{MockCluster, WatchConfig, WatchStream, WireEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DS: ResourceKind = ResourceKind::DaemonSet;

struct Running {
    rx: mpsc::Receiver<WatchEvent>,
    cancel: CancellationToken,
    handle: JoinHandle<KubeResult<()>>,
}

fn quiet_config() -> WatchConfig {
    WatchConfig { relist: None, ..WatchConfig::default() }
}

fn start(cluster: &Arc<MockCluster>, config: WatchConfig) -> Running {
    let (tx, rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let ws = WatchStream::new(cluster.clone(), DS, None, config);
    let handle = tokio::spawn(ws.run(tx, cancel.clone()));
    Running { rx, cancel, handle }
}

async fn next_within(rx: &mut mpsc::Receiver<WatchEvent>, secs: u64) -> WatchEvent {
    tokio::time::timeout(Duration::from_secs(secs), rx.recv())
        .await
        .expect("event before timeout")
        .expect("stream still open")
}

async fn next(rx: &mut mpsc::Receiver<WatchEvent>) -> WatchEvent {
    next_within(rx, 5).await
}

async fn until_watching(cluster: &MockCluster) {
    while cluster.watcher_count() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

fn id(name: &str) -> ObjectIdentity {
    ObjectIdentity::new(DS, "default", name)
}

fn name_of(ev: &WatchEvent) -> &str {
    ev.identity().map(|i| i.name.as_str()).unwrap_or("<marker>")
}

#[tokio::test(start_paused = true)]
async fn initial_list_is_followed_by_marker() {
    let cluster = MockCluster::new();
    cluster.apply(DS, daemon_set_json("default", "alpha", "", 3, 3)).unwrap();
    cluster.apply(DS, daemon_set_json("default", "beta", "", 2, 1)).unwrap();

    let mut run = start(&cluster, quiet_config());
    let first = next(&mut run.rx).await;
    let second = next(&mut run.rx).await;
    assert!(matches!(first, WatchEvent::Added(_)));
    assert!(matches!(second, WatchEvent::Added(_)));
    assert_eq!((name_of(&first), name_of(&second)), ("alpha", "beta"));
    assert_eq!(next(&mut run.rx).await, WatchEvent::ResyncMarker);
    run.cancel.cancel();
    assert_eq!(run.handle.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn forwards_live_changes_in_order() {
    let cluster = MockCluster::new();
    let mut run = start(&cluster, quiet_config());
    assert_eq!(next(&mut run.rx).await, WatchEvent::ResyncMarker);
    until_watching(&cluster).await;

    cluster.apply(DS, daemon_set_json("default", "web", "", 3, 3)).unwrap();
    cluster.apply(DS, daemon_set_json("default", "web", "", 3, 2)).unwrap();
    cluster.delete(&id("web"));

    assert!(matches!(next(&mut run.rx).await, WatchEvent::Added(_)));
    match next(&mut run.rx).await {
        WatchEvent::Modified(s) => assert_eq!(s.int_field("pods_available"), Some(2)),
        other => panic!("expected Modified, got {:?}", other),
    }
    assert_eq!(next(&mut run.rx).await, WatchEvent::Removed(id("web")));
    run.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn resync_without_changes_emits_only_marker() {
    let cluster = MockCluster::new();
    cluster.apply(DS, daemon_set_json("default", "web", "", 3, 3)).unwrap();
    let mut run = start(&cluster, quiet_config());
    assert!(matches!(next(&mut run.rx).await, WatchEvent::Added(_)));
    assert_eq!(next(&mut run.rx).await, WatchEvent::ResyncMarker);
    until_watching(&cluster).await;

    cluster.close_watches();
    assert_eq!(next(&mut run.rx).await, WatchEvent::ResyncMarker);
    assert_eq!(cluster.list_calls(), 2);
    run.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn resync_emits_removed_added_modified_then_marker() {
    let cluster = MockCluster::new();
    cluster.apply(DS, daemon_set_json("default", "a", "", 3, 3)).unwrap();
    cluster.apply(DS, daemon_set_json("default", "b", "", 3, 3)).unwrap();
    let mut run = start(&cluster, quiet_config());
    for _ in 0..3 {
        next(&mut run.rx).await;
    }
    until_watching(&cluster).await;

    // Missed while disconnected.
    cluster.apply_silently(DS, daemon_set_json("default", "a", "", 3, 1)).unwrap();
    cluster.delete_silently(&id("b"));
    cluster.apply_silently(DS, daemon_set_json("default", "c", "", 1, 1)).unwrap();
    cluster.close_watches();

    assert_eq!(next(&mut run.rx).await, WatchEvent::Removed(id("b")));
    let added = next(&mut run.rx).await;
    assert!(matches!(added, WatchEvent::Added(_)));
    assert_eq!(name_of(&added), "c");
    match next(&mut run.rx).await {
        WatchEvent::Modified(s) => {
            assert_eq!(s.identity, id("a"));
            assert_eq!(s.int_field("pods_available"), Some(1));
        }
        other => panic!("expected Modified, got {:?}", other),
    }
    assert_eq!(next(&mut run.rx).await, WatchEvent::ResyncMarker);
    run.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn stale_watch_open_relists_immediately() {
    let cluster = MockCluster::new();
    cluster.apply(DS, daemon_set_json("default", "web", "", 3, 3)).unwrap();
    cluster.fail_next_watch(KubeError::StaleResourceVersion("too old".into()));
    let started = tokio::time::Instant::now();
    let mut run = start(&cluster, quiet_config());

    assert!(matches!(next(&mut run.rx).await, WatchEvent::Added(_)));
    assert_eq!(next(&mut run.rx).await, WatchEvent::ResyncMarker);
    assert_eq!(next(&mut run.rx).await, WatchEvent::ResyncMarker);
    assert_eq!(cluster.list_calls(), 2);
    assert!(started.elapsed() < Duration::from_millis(500), "no backoff on 410");
    run.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn stale_error_frame_mid_stream_relists() {
    let cluster = MockCluster::new();
    cluster.apply(DS, daemon_set_json("default", "web", "", 3, 3)).unwrap();
    let mut run = start(&cluster, quiet_config());
    next(&mut run.rx).await;
    next(&mut run.rx).await;
    until_watching(&cluster).await;

    cluster.apply_silently(DS, daemon_set_json("default", "web", "", 3, 0)).unwrap();
    cluster.send_raw(DS, Err(KubeError::StaleResourceVersion("compacted".into())));

    match next(&mut run.rx).await {
        WatchEvent::Modified(s) => assert_eq!(s.int_field("pods_available"), Some(0)),
        other => panic!("expected Modified, got {:?}", other),
    }
    assert_eq!(next(&mut run.rx).await, WatchEvent::ResyncMarker);
    run.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn unauthorized_list_fails_the_stream() {
    let cluster = MockCluster::new();
    cluster.fail_next_list(KubeError::Unauthorized("token expired".into()));
    let mut run = start(&cluster, quiet_config());
    let res = run.handle.await.unwrap();
    assert!(matches!(res, Err(KubeError::Unauthorized(_))));
    assert!(run.rx.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn nothing_is_emitted_after_cancel() {
    let cluster = MockCluster::new();
    let mut run = start(&cluster, quiet_config());
    assert_eq!(next(&mut run.rx).await, WatchEvent::ResyncMarker);
    until_watching(&cluster).await;

    run.cancel.cancel();
    assert_eq!(run.handle.await.unwrap(), Ok(()));
    cluster.apply(DS, daemon_set_json("default", "late", "", 1, 1)).unwrap();
    assert!(run.rx.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn transport_errors_back_off_exponentially() {
    let cluster = MockCluster::new();
    for _ in 0..3 {
        cluster.fail_next_list(KubeError::Transport("connection refused".into()));
    }
    let started = tokio::time::Instant::now();
    let mut run = start(&cluster, quiet_config());

    assert_eq!(next(&mut run.rx).await, WatchEvent::ResyncMarker);
    let waited = started.elapsed();
    // 500ms + 1s + 2s
    assert!(waited >= Duration::from_millis(3500), "waited {:?}", waited);
    assert!(waited < Duration::from_millis(4000), "waited {:?}", waited);
    assert_eq!(cluster.list_calls(), 4);
    run.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn version_regression_forces_resync() {
    let cluster = MockCluster::new();
    let old = cluster.apply(DS, daemon_set_json("default", "web", "", 3, 3)).unwrap();
    let mut run = start(&cluster, quiet_config());
    next(&mut run.rx).await;
    next(&mut run.rx).await;
    until_watching(&cluster).await;

    cluster.apply(DS, daemon_set_json("default", "web", "", 3, 2)).unwrap();
    assert!(matches!(next(&mut run.rx).await, WatchEvent::Modified(_)));

    cluster.send_raw(DS, Ok(WireEvent::Modified(old)));
    assert_eq!(next(&mut run.rx).await, WatchEvent::ResyncMarker);
    assert_eq!(cluster.list_calls(), 2);
    run.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn undecodable_frames_are_skipped() {
    let cluster = MockCluster::new();
    let mut run = start(&cluster, quiet_config());
    next(&mut run.rx).await;
    until_watching(&cluster).await;

    cluster.send_raw(DS, Err(KubeError::Decode("missing metadata.namespace".into())));
    cluster.apply(DS, daemon_set_json("default", "web", "", 1, 1)).unwrap();
    assert!(matches!(next(&mut run.rx).await, WatchEvent::Added(_)));
    assert_eq!(cluster.list_calls(), 1);
    run.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn periodic_relist_catches_silent_drift() {
    let cluster = MockCluster::new();
    cluster.apply(DS, daemon_set_json("default", "web", "", 3, 3)).unwrap();
    let config = WatchConfig { relist: Some(Duration::from_secs(60)), ..WatchConfig::default() };
    let mut run = start(&cluster, config);
    next(&mut run.rx).await;
    next(&mut run.rx).await;
    until_watching(&cluster).await;

    cluster.apply_silently(DS, daemon_set_json("default", "web", "", 3, 1)).unwrap();
    match next_within(&mut run.rx, 120).await {
        WatchEvent::Modified(s) => assert_eq!(s.int_field("pods_available"), Some(1)),
        other => panic!("expected Modified, got {:?}", other),
    }
    assert_eq!(next(&mut run.rx).await, WatchEvent::ResyncMarker);
    run.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn dropped_receiver_ends_the_stream() {
    let cluster = MockCluster::new();
    cluster.apply(DS, daemon_set_json("default", "web", "", 3, 3)).unwrap();
    let run = start(&cluster, quiet_config());
    drop(run.rx);
    assert_eq!(run.handle.await.unwrap(), Ok(()));
}
