//! Kubeward store: the entity registry fed by per-kind watch streams.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kubeward_core::{KubeError, ObjectIdentity, ObjectSnapshot, ResourceKind, WatchEvent};
use kubeward_kinds::adapter;
use kubeward_kubehub::{ApiClient, WatchConfig, WatchStream};
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod handle;

pub use handle::EntityHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Buffer between a kind's watch stream and its applier.
    pub queue_cap: usize,
    /// Restrict every watch to one namespace.
    pub namespace: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self { Self { queue_cap: 1024, namespace: None } }
}

impl HubConfig {
    /// `KUBEWARD_QUEUE_CAP` (default 1024).
    pub fn from_env() -> Self {
        let queue_cap = std::env::var("KUBEWARD_QUEUE_CAP")
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(1024);
        Self { queue_cap, namespace: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamState {
    Starting,
    /// The initial list has been applied. Stays set across later resyncs.
    Synced,
    /// Terminal stream error; the kind must be torn down and subscribed again.
    Failed(String),
    Stopped,
}

/// Registry change produced by one applied event.
#[derive(Debug, Clone)]
pub enum EntityChange {
    Created(Arc<EntityHandle>),
    Updated(Arc<EntityHandle>),
    Retired(Arc<EntityHandle>),
    Synced(ResourceKind),
    /// The kind's stream ended on a terminal error. No further changes follow.
    Failed { kind: ResourceKind, message: String },
}

pub trait HubObserver: Send + Sync {
    fn on_change(&self, change: &EntityChange);
}

impl<F> HubObserver for F
where
    F: Fn(&EntityChange) + Send + Sync,
{
    fn on_change(&self, change: &EntityChange) { self(change) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("{0} is not subscribed")]
    NotSubscribed(ResourceKind),
    #[error("{kind} watch failed: {message}")]
    StreamFailed { kind: ResourceKind, message: String },
    #[error("{0} watch stopped before the initial sync")]
    Stopped(ResourceKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindStats {
    pub kind: ResourceKind,
    pub entities: usize,
    pub state: StreamState,
}

struct KindStream {
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    observers: Mutex<Vec<Arc<dyn HubObserver>>>,
    /// Late subscribers, registered by the applier between two events.
    joins: mpsc::UnboundedSender<Arc<dyn HubObserver>>,
    state_tx: watch::Sender<StreamState>,
}

impl KindStream {
    /// Observers are called with no hub lock held.
    fn notify(&self, change: &EntityChange) {
        let observers = self.observers.lock().clone();
        for o in observers.iter() {
            o.on_change(change);
        }
    }
}

struct Inner {
    client: Arc<dyn ApiClient>,
    config: HubConfig,
    watch: WatchConfig,
    registry: RwLock<FxHashMap<ObjectIdentity, Arc<EntityHandle>>>,
    streams: Mutex<FxHashMap<ResourceKind, Arc<KindStream>>>,
    next_id: AtomicU64,
}

/// Identity → handle registry shared by every kind's stream.
///
/// Each kind runs one watch task and one applier task; the applier is the only
/// writer for that kind's identities, so events for one object are applied in
/// stream order. Kinds are isolated from each other but share the registry.
#[derive(Clone)]
pub struct EntitySyncHub {
    inner: Arc<Inner>,
}

impl EntitySyncHub {
    pub fn new(client: Arc<dyn ApiClient>, config: HubConfig, watch: WatchConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                watch,
                registry: RwLock::new(FxHashMap::default()),
                streams: Mutex::new(FxHashMap::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `observer` for `kind`, starting the kind's watch if needed.
    /// A kind that is already running replays its handles to the new observer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe(&self, kind: ResourceKind, observer: Arc<dyn HubObserver>) -> KindView {
        let (stream, late) = {
            let mut streams = self.inner.streams.lock();
            match streams.get(&kind) {
                Some(s) => (s.clone(), Some(observer)),
                None => {
                    let s = self.start_stream(kind, observer);
                    streams.insert(kind, s.clone());
                    (s, None)
                }
            }
        };
        if let Some(observer) = late {
            // The applier replays between two events; once it has exited nothing
            // else changes this kind, so the replay can run here.
            if let Err(rejected) = stream.joins.send(observer) {
                let observer = rejected.0;
                self.replay(kind, &stream, observer.as_ref(), true);
                stream.observers.lock().push(observer);
            }
        }
        KindView { hub: self.clone(), kind, state_rx: stream.state_tx.subscribe() }
    }

    /// Bring a new observer up to date: every live handle, then the sync state.
    fn replay(&self, kind: ResourceKind, stream: &KindStream, observer: &dyn HubObserver, with_failure: bool) {
        for h in self.handles(kind) {
            observer.on_change(&EntityChange::Created(h));
        }
        let state = stream.state_tx.borrow().clone();
        match state {
            StreamState::Synced => observer.on_change(&EntityChange::Synced(kind)),
            StreamState::Failed(message) if with_failure => observer.on_change(&EntityChange::Failed { kind, message }),
            _ => {}
        }
    }

    fn start_stream(&self, kind: ResourceKind, first: Arc<dyn HubObserver>) -> Arc<KindStream> {
        let (state_tx, _) = watch::channel(StreamState::Starting);
        let (joins, joins_rx) = mpsc::unbounded_channel();
        let stream = Arc::new(KindStream {
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            observers: Mutex::new(vec![first]),
            joins,
            state_tx,
        });
        let (tx, rx) = mpsc::channel(self.inner.config.queue_cap);
        let ws = WatchStream::new(self.inner.client.clone(), kind, self.inner.config.namespace.clone(), self.inner.watch.clone());
        let watch_task = tokio::spawn(run_watch(ws, tx, stream.clone()));
        let apply_task = tokio::spawn(run_applier(self.clone(), kind, rx, joins_rx, stream.clone()));
        stream.tasks.lock().extend([watch_task, apply_task]);
        info!(kind = %kind, ns = ?self.inner.config.namespace, "kind subscribed");
        stream
    }

    /// Apply one event to the registry. Observers are not notified.
    pub fn apply_event(&self, kind: ResourceKind, event: WatchEvent) -> Option<EntityChange> {
        if let Some(id) = event.identity() {
            if id.kind != kind {
                warn!(kind = %kind, identity = %id, "dropping event for foreign kind");
                return None;
            }
        }
        match event {
            WatchEvent::Added(snap) | WatchEvent::Modified(snap) => Some(self.upsert(snap)),
            WatchEvent::Removed(id) => self.remove(&id),
            WatchEvent::ResyncMarker => Some(EntityChange::Synced(kind)),
        }
    }

    fn upsert(&self, snap: ObjectSnapshot) -> EntityChange {
        let mut reg = self.inner.registry.write();
        if let Some(h) = reg.get(&snap.identity) {
            debug!(identity = %snap.identity, rv = %snap.resource_version, "entity updated");
            h.replace(snap);
            return EntityChange::Updated(h.clone());
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let h = Arc::new(EntityHandle::new(id, adapter(snap.identity.kind), snap));
        reg.insert(h.identity().clone(), h.clone());
        counter!("hub_entities_created_total", 1u64);
        gauge!("hub_entities", reg.len() as f64);
        debug!(identity = %h.identity(), id, "entity created");
        EntityChange::Created(h)
    }

    fn remove(&self, id: &ObjectIdentity) -> Option<EntityChange> {
        let mut reg = self.inner.registry.write();
        let h = reg.remove(id)?;
        h.retire();
        counter!("hub_entities_retired_total", 1u64);
        gauge!("hub_entities", reg.len() as f64);
        debug!(identity = %id, "entity retired");
        Some(EntityChange::Retired(h))
    }

    pub fn handle(&self, id: &ObjectIdentity) -> Option<Arc<EntityHandle>> {
        self.inner.registry.read().get(id).cloned()
    }

    /// Handles of `kind`, ordered by identity.
    pub fn handles(&self, kind: ResourceKind) -> Vec<Arc<EntityHandle>> {
        let mut out: Vec<_> = self.inner.registry.read().values().filter(|h| h.identity().kind == kind).cloned().collect();
        out.sort_by(|a, b| a.identity().cmp(b.identity()));
        out
    }

    pub fn state(&self, kind: ResourceKind) -> Option<StreamState> {
        self.inner.streams.lock().get(&kind).map(|s| s.state_tx.borrow().clone())
    }

    /// Wait until `kind` completed its first list, or its stream ended first.
    pub async fn wait_synced(&self, kind: ResourceKind) -> Result<(), HubError> {
        let mut rx = {
            let streams = self.inner.streams.lock();
            streams.get(&kind).map(|s| s.state_tx.subscribe()).ok_or(HubError::NotSubscribed(kind))?
        };
        wait_settled(kind, &mut rx).await
    }

    /// Stop the kind's watch, then retire every handle of that kind.
    /// Returns how many handles were retired.
    pub async fn teardown(&self, kind: ResourceKind) -> usize {
        let Some(stream) = self.inner.streams.lock().remove(&kind) else { return 0 };
        stream.cancel.cancel();
        let tasks: Vec<_> = stream.tasks.lock().drain(..).collect();
        for t in tasks {
            if let Err(e) = t.await {
                warn!(kind = %kind, error = %e, "stream task ended abnormally");
            }
        }
        let retired: Vec<Arc<EntityHandle>> = {
            let mut reg = self.inner.registry.write();
            let ids: Vec<ObjectIdentity> = reg.keys().filter(|id| id.kind == kind).cloned().collect();
            let out: Vec<_> = ids.iter().filter_map(|id| reg.remove(id)).collect();
            gauge!("hub_entities", reg.len() as f64);
            out
        };
        for h in retired.iter() {
            h.retire();
            counter!("hub_entities_retired_total", 1u64);
            stream.notify(&EntityChange::Retired(h.clone()));
        }
        stream.state_tx.send_replace(StreamState::Stopped);
        info!(kind = %kind, retired = retired.len(), "kind torn down");
        retired.len()
    }

    /// Tear down every subscribed kind.
    pub async fn shutdown(&self) {
        let kinds: Vec<ResourceKind> = self.inner.streams.lock().keys().copied().collect();
        for kind in kinds {
            self.teardown(kind).await;
        }
    }

    pub fn stats(&self) -> Vec<KindStats> {
        let mut kinds: Vec<ResourceKind> = self.inner.streams.lock().keys().copied().collect();
        kinds.sort();
        kinds
            .into_iter()
            .map(|kind| KindStats {
                kind,
                entities: self.inner.registry.read().keys().filter(|id| id.kind == kind).count(),
                state: self.state(kind).unwrap_or(StreamState::Stopped),
            })
            .collect()
    }
}

async fn wait_settled(kind: ResourceKind, rx: &mut watch::Receiver<StreamState>) -> Result<(), HubError> {
    let settled = rx
        .wait_for(|s| !matches!(s, StreamState::Starting))
        .await
        .map(|s| s.clone())
        .unwrap_or(StreamState::Stopped);
    match settled {
        StreamState::Synced => Ok(()),
        StreamState::Failed(message) => Err(HubError::StreamFailed { kind, message }),
        StreamState::Stopped | StreamState::Starting => Err(HubError::Stopped(kind)),
    }
}

async fn run_watch(ws: WatchStream, tx: mpsc::Sender<WatchEvent>, stream: Arc<KindStream>) {
    let res: Result<(), KubeError> = ws.run(tx.clone(), stream.cancel.clone()).await;
    if let Err(e) = res {
        stream.state_tx.send_replace(StreamState::Failed(e.to_string()));
    }
    // The applier only sees the channel close once the final state is recorded.
    drop(tx);
}

async fn run_applier(
    hub: EntitySyncHub,
    kind: ResourceKind,
    mut rx: mpsc::Receiver<WatchEvent>,
    mut joins: mpsc::UnboundedReceiver<Arc<dyn HubObserver>>,
    stream: Arc<KindStream>,
) {
    loop {
        tokio::select! {
            biased;
            Some(observer) = joins.recv() => {
                hub.replay(kind, &stream, observer.as_ref(), false);
                stream.observers.lock().push(observer);
            }
            ev = rx.recv() => {
                let Some(ev) = ev else { break };
                let Some(change) = hub.apply_event(kind, ev) else { continue };
                stream.notify(&change);
                if let EntityChange::Synced(_) = change {
                    stream.state_tx.send_if_modified(|s| {
                        if *s == StreamState::Starting {
                            *s = StreamState::Synced;
                            true
                        } else {
                            false
                        }
                    });
                }
            }
        }
    }
    joins.close();
    while let Ok(observer) = joins.try_recv() {
        hub.replay(kind, &stream, observer.as_ref(), false);
        stream.observers.lock().push(observer);
    }
    let state = stream.state_tx.borrow().clone();
    if let StreamState::Failed(message) = state {
        warn!(kind = %kind, error = %message, "stream failed; notifying subscribers");
        stream.notify(&EntityChange::Failed { kind, message });
    }
    debug!(kind = %kind, "applier drained");
}

/// Per-kind view handed back by [`EntitySyncHub::subscribe`].
#[derive(Clone)]
pub struct KindView {
    hub: EntitySyncHub,
    kind: ResourceKind,
    state_rx: watch::Receiver<StreamState>,
}

impl KindView {
    pub fn kind(&self) -> ResourceKind { self.kind }

    pub fn handles(&self) -> Vec<Arc<EntityHandle>> { self.hub.handles(self.kind) }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<EntityHandle>> {
        self.hub.handle(&ObjectIdentity::new(self.kind, namespace, name))
    }

    pub fn state(&self) -> StreamState { self.state_rx.borrow().clone() }

    pub async fn wait_synced(&mut self) -> Result<(), HubError> { wait_settled(self.kind, &mut self.state_rx).await }
}
