//! In-memory stand-in for the API server, used by tests and `kubewardctl --mock`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use kubeward_core::{
    Ack, KubeError, KubeResult, ObjectIdentity, ObjectList, ObjectSnapshot, PatchRequest, ResourceKind, ResourceVersion,
};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::client::{ApiClient, WireEvent, WireStream};

struct Watcher {
    kind: ResourceKind,
    namespace: Option<String>,
    tx: UnboundedSender<KubeResult<WireEvent>>,
}

impl Watcher {
    fn wants(&self, id: &ObjectIdentity) -> bool {
        self.kind == id.kind && self.namespace.as_deref().map_or(true, |ns| ns == id.namespace)
    }
}

#[derive(Default)]
struct State {
    rv: u64,
    objects: BTreeMap<ObjectIdentity, ObjectSnapshot>,
    log: Vec<(u64, WireEvent)>,
    compacted: u64,
    watchers: Vec<Watcher>,
    fail_list: VecDeque<KubeError>,
    fail_watch: VecDeque<KubeError>,
    fail_patch: VecDeque<KubeError>,
    patches: Vec<(ObjectIdentity, PatchRequest)>,
    patch_delay: Option<Duration>,
    list_calls: usize,
    watch_calls: usize,
    in_flight: usize,
    max_in_flight: usize,
}

impl State {
    fn bump(&mut self) -> ResourceVersion {
        self.rv += 1;
        ResourceVersion::new(self.rv.to_string())
    }

    fn publish(&mut self, ev: WireEvent) {
        let id = match &ev {
            WireEvent::Added(s) | WireEvent::Modified(s) | WireEvent::Deleted(s) => s.identity.clone(),
            WireEvent::Bookmark(_) => return,
        };
        self.log.push((self.rv, ev.clone()));
        self.watchers.retain(|w| !w.wants(&id) || w.tx.unbounded_send(Ok(ev.clone())).is_ok());
    }
}

/// Fake cluster with a monotonically increasing resource version and a replayable event log.
#[derive(Default)]
pub struct MockCluster {
    state: Mutex<State>,
}

impl MockCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn store(&self, kind: ResourceKind, mut raw: Value, publish: bool) -> KubeResult<ObjectSnapshot> {
        let mut st = self.state.lock();
        let rv = st.bump();
        if let Some(meta) = raw.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert("resourceVersion".to_string(), Value::from(rv.as_str()));
        }
        let snap = kubeward_kinds::adapter(kind).snapshot(&raw)?;
        let existed = st.objects.insert(snap.identity.clone(), snap.clone()).is_some();
        if publish {
            let ev = if existed { WireEvent::Modified(snap.clone()) } else { WireEvent::Added(snap.clone()) };
            st.publish(ev);
        }
        Ok(snap)
    }

    /// Create or update an object and notify watchers. The stored version is overwritten.
    pub fn apply(&self, kind: ResourceKind, raw: Value) -> KubeResult<ObjectSnapshot> {
        self.store(kind, raw, true)
    }

    /// Change state without telling any watcher, as if the event were lost.
    pub fn apply_silently(&self, kind: ResourceKind, raw: Value) -> KubeResult<ObjectSnapshot> {
        self.store(kind, raw, false)
    }

    pub fn delete(&self, id: &ObjectIdentity) -> bool {
        let mut st = self.state.lock();
        let Some(mut snap) = st.objects.remove(id) else { return false };
        snap.resource_version = st.bump();
        st.publish(WireEvent::Deleted(snap));
        true
    }

    pub fn delete_silently(&self, id: &ObjectIdentity) -> bool {
        let mut st = self.state.lock();
        let removed = st.objects.remove(id).is_some();
        if removed {
            st.bump();
        }
        removed
    }

    /// Forget history: watches from an older version now fail with 410.
    pub fn compact(&self) {
        let mut st = self.state.lock();
        st.compacted = st.rv;
        st.log.clear();
    }

    /// End every open watch as the server would on timeout.
    pub fn close_watches(&self) {
        self.state.lock().watchers.clear();
    }

    /// Push an arbitrary frame (or error) to open watches of `kind`.
    pub fn send_raw(&self, kind: ResourceKind, item: KubeResult<WireEvent>) {
        let st = self.state.lock();
        for w in st.watchers.iter().filter(|w| w.kind == kind) {
            let _ = w.tx.unbounded_send(item.clone());
        }
    }

    pub fn fail_next_list(&self, err: KubeError) {
        self.state.lock().fail_list.push_back(err);
    }

    pub fn fail_next_watch(&self, err: KubeError) {
        self.state.lock().fail_watch.push_back(err);
    }

    pub fn fail_next_patch(&self, err: KubeError) {
        self.state.lock().fail_patch.push_back(err);
    }

    pub fn set_patch_delay(&self, delay: Duration) {
        self.state.lock().patch_delay = Some(delay);
    }

    pub fn current_version(&self) -> ResourceVersion {
        ResourceVersion::new(self.state.lock().rv.to_string())
    }

    pub fn patches(&self) -> Vec<(ObjectIdentity, PatchRequest)> {
        self.state.lock().patches.clone()
    }

    pub fn list_calls(&self) -> usize { self.state.lock().list_calls }
    pub fn watch_calls(&self) -> usize { self.state.lock().watch_calls }
    pub fn max_in_flight(&self) -> usize { self.state.lock().max_in_flight }

    pub fn watcher_count(&self) -> usize {
        let mut st = self.state.lock();
        st.watchers.retain(|w| !w.tx.is_closed());
        st.watchers.len()
    }
}

#[async_trait::async_trait]
impl ApiClient for MockCluster {
    async fn list(&self, kind: ResourceKind, namespace: Option<&str>) -> KubeResult<ObjectList> {
        let mut st = self.state.lock();
        st.list_calls += 1;
        if let Some(err) = st.fail_list.pop_front() {
            return Err(err);
        }
        let items = st
            .objects
            .values()
            .filter(|s| s.identity.kind == kind && namespace.map_or(true, |ns| ns == s.identity.namespace))
            .cloned()
            .collect();
        Ok(ObjectList { items, resource_version: ResourceVersion::new(st.rv.to_string()) })
    }

    async fn watch(&self, kind: ResourceKind, namespace: Option<&str>, from: &ResourceVersion) -> KubeResult<WireStream> {
        let mut st = self.state.lock();
        st.watch_calls += 1;
        if let Some(err) = st.fail_watch.pop_front() {
            return Err(err);
        }
        let from_n: u64 = from.as_str().parse().unwrap_or(st.rv);
        if from_n < st.compacted {
            return Err(KubeError::StaleResourceVersion(format!("too old resource version: {} ({})", from_n, st.compacted)));
        }
        let ns = namespace.map(str::to_string);
        let (tx, rx) = unbounded();
        let watcher = Watcher { kind, namespace: ns, tx };
        let replay: Vec<KubeResult<WireEvent>> = st
            .log
            .iter()
            .filter(|(rv, ev)| {
                *rv > from_n
                    && match ev {
                        WireEvent::Added(s) | WireEvent::Modified(s) | WireEvent::Deleted(s) => watcher.wants(&s.identity),
                        WireEvent::Bookmark(_) => false,
                    }
            })
            .map(|(_, ev)| Ok(ev.clone()))
            .collect();
        debug!(kind = %kind, from = from_n, replay = replay.len(), "mock watch opened");
        st.watchers.push(watcher);
        Ok(futures::stream::iter(replay).chain(rx).boxed())
    }

    async fn patch(&self, identity: &ObjectIdentity, patch: &PatchRequest) -> KubeResult<Ack> {
        let delay = {
            let mut st = self.state.lock();
            st.in_flight += 1;
            st.max_in_flight = st.max_in_flight.max(st.in_flight);
            st.patch_delay
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let mut st = self.state.lock();
        st.in_flight -= 1;
        st.patches.push((identity.clone(), patch.clone()));
        if let Some(err) = st.fail_patch.pop_front() {
            return Err(err);
        }
        if !st.objects.contains_key(identity) {
            return Err(KubeError::api(404, "NotFound", format!("{} not found", identity)));
        }
        Ok(Ack { resource_version: Some(ResourceVersion::new(st.rv.to_string())) })
    }
}
