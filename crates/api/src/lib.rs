//! Kubeward public façade.
//!
//! A [`ClusterHub`] owns everything that belongs to one cluster connection: the
//! entity registry, its watch streams and the command dispatcher. Hosts drive it
//! through `start_listener` (entities) and `services` + `dispatch` (commands), and
//! tear it down with `shutdown`.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use kubeward_core::{Ack, MutationRequest, ObjectIdentity, Params, ResourceKind};
use kubeward_kinds::{adapter, ValidationError};
use kubeward_kubehub::{ApiClient, WatchConfig};
use kubeward_ops::{CommandDispatcher, RetryPolicy};
use kubeward_store::{EntityChange, EntityHandle, EntitySyncHub, HubConfig, HubObserver, KindView, StreamState};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

mod sensor;

pub use kubeward_ops::DispatchError;
pub use kubeward_store::HubError;
pub use sensor::KubeSensor;

/// Everything tunable about one cluster connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClusterConfig {
    pub hub: HubConfig,
    pub watch: WatchConfig,
    pub retry: RetryPolicy,
}

impl ClusterConfig {
    pub fn from_env() -> Self {
        Self { hub: HubConfig::from_env(), watch: WatchConfig::from_env(), retry: RetryPolicy::from_env() }
    }

    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.hub.namespace = namespace;
        self
    }
}

/// How long a frontend should wait for the first sync: `KUBEWARD_SYNC_WAIT_SECS` (default 30).
pub fn sync_wait_from_env() -> Duration {
    let secs = std::env::var("KUBEWARD_SYNC_WAIT_SECS")
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(30);
    Duration::from_secs(secs)
}

/// One host-registered command.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServiceSpec {
    pub service: &'static str,
    pub verb: &'static str,
    pub schema: BTreeMap<&'static str, &'static str>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct KindStatus {
    pub kind: ResourceKind,
    pub entities: usize,
    pub state: String,
}

/// Runtime counters and configuration exposed to frontends.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Stats {
    pub kinds: Vec<KindStatus>,
    pub namespace: Option<String>,
    pub queue_cap: usize,
    pub relist_secs: u64,
    pub watch_backoff_max_secs: u64,
    pub dispatch_max_attempts: u32,
}

/// Command registration boundary for `kind`: one entry per verb, with its parameter schema.
pub fn services(kind: ResourceKind) -> Vec<ServiceSpec> {
    adapter(kind)
        .verbs
        .iter()
        .map(|v| ServiceSpec { service: v.service, verb: v.verb, schema: v.schema() })
        .collect()
}

fn state_label(state: &StreamState) -> String {
    match state {
        StreamState::Starting => "starting".to_string(),
        StreamState::Synced => "synced".to_string(),
        StreamState::Failed(msg) => format!("failed: {}", msg),
        StreamState::Stopped => "stopped".to_string(),
    }
}

struct HubInner {
    sync: EntitySyncHub,
    dispatcher: CommandDispatcher,
    config: ClusterConfig,
}

/// Per-connection context handed to every entity and command.
#[derive(Clone)]
pub struct ClusterHub {
    inner: Arc<HubInner>,
}

impl ClusterHub {
    pub fn new(client: Arc<dyn ApiClient>, config: ClusterConfig) -> Self {
        let sync = EntitySyncHub::new(client.clone(), config.hub.clone(), config.watch.clone());
        let dispatcher = CommandDispatcher::new(client, config.retry.clone());
        Self { inner: Arc::new(HubInner { sync, dispatcher, config }) }
    }

    pub fn config(&self) -> &ClusterConfig { &self.inner.config }

    pub fn entities(&self) -> &EntitySyncHub { &self.inner.sync }

    /// Raw registry subscription, for hosts that also want updates and retirements.
    pub fn subscribe(&self, kind: ResourceKind, observer: Arc<dyn HubObserver>) -> KindView {
        self.inner.sync.subscribe(kind, observer)
    }

    /// Start watching `kind` and surface its entities to the host.
    ///
    /// Entities built during the initial listing reach `add_callback` as one batch
    /// once the kind is synced; every later creation arrives on its own.
    /// `retire_callback` runs when an object is deleted or the kind is torn down.
    /// Returns once the initial batch was delivered, or with the stream's terminal error.
    pub async fn start_listener<E, A, R, F>(
        &self,
        kind: ResourceKind,
        add_callback: A,
        retire_callback: R,
        entity_factory: F,
    ) -> Result<KindView, HubError>
    where
        E: Send + 'static,
        A: Fn(Vec<E>) + Send + Sync + 'static,
        R: Fn(Arc<EntityHandle>) + Send + Sync + 'static,
        F: Fn(&ClusterHub, Arc<EntityHandle>) -> E + Send + Sync + 'static,
    {
        let (ready_tx, mut ready_rx) = watch::channel(false);
        let listener = Listener {
            hub: Arc::downgrade(&self.inner),
            pending: Mutex::new(Some(Vec::new())),
            ready: ready_tx,
            add_callback,
            retire_callback,
            entity_factory,
        };
        let mut view = self.inner.sync.subscribe(kind, Arc::new(listener));
        view.wait_synced().await?;
        // A kind that was already synced replays to this listener asynchronously.
        let _ = ready_rx.wait_for(|delivered| *delivered).await;
        if let StreamState::Failed(message) = view.state() {
            return Err(HubError::StreamFailed { kind, message });
        }
        info!(kind = %kind, entities = view.handles().len(), "listener ready");
        Ok(view)
    }

    pub fn services(&self, kind: ResourceKind) -> Vec<ServiceSpec> {
        services(kind)
    }

    pub async fn dispatch(&self, req: MutationRequest) -> Result<Ack, DispatchError> {
        self.inner.dispatcher.dispatch(req).await
    }

    /// Invoke a host service (`set_image_daemon_set`) or plain verb on one object.
    pub async fn call_service(&self, identity: ObjectIdentity, service: &str, params: Params) -> Result<Ack, DispatchError> {
        let spec = adapter(identity.kind)
            .service(service)
            .ok_or_else(|| ValidationError::UnknownVerb { kind: identity.kind, verb: service.to_string() })?;
        self.dispatch(MutationRequest::new(identity, spec.verb, params)).await
    }

    pub fn stats(&self) -> Stats {
        let cfg = &self.inner.config;
        Stats {
            kinds: self
                .inner
                .sync
                .stats()
                .into_iter()
                .map(|s| KindStatus { kind: s.kind, entities: s.entities, state: state_label(&s.state) })
                .collect(),
            namespace: cfg.hub.namespace.clone(),
            queue_cap: cfg.hub.queue_cap,
            relist_secs: cfg.watch.relist.map(|d| d.as_secs()).unwrap_or(0),
            watch_backoff_max_secs: cfg.watch.backoff_max.as_secs(),
            dispatch_max_attempts: cfg.retry.max_attempts,
        }
    }

    /// Stop every stream and retire every entity.
    pub async fn shutdown(&self) {
        self.inner.sync.shutdown().await;
        info!("cluster hub shut down");
    }
}

struct Listener<E, A, R, F> {
    hub: Weak<HubInner>,
    /// `Some` until the first sync; collects the initial batch.
    pending: Mutex<Option<Vec<E>>>,
    /// Flipped once the initial batch went out, or the stream failed.
    ready: watch::Sender<bool>,
    add_callback: A,
    retire_callback: R,
    entity_factory: F,
}

impl<E, A, R, F> HubObserver for Listener<E, A, R, F>
where
    E: Send + 'static,
    A: Fn(Vec<E>) + Send + Sync + 'static,
    R: Fn(Arc<EntityHandle>) + Send + Sync + 'static,
    F: Fn(&ClusterHub, Arc<EntityHandle>) -> E + Send + Sync + 'static,
{
    fn on_change(&self, change: &EntityChange) {
        match change {
            EntityChange::Created(h) => {
                let Some(inner) = self.hub.upgrade() else { return };
                let entity = (self.entity_factory)(&ClusterHub { inner }, h.clone());
                let mut pending = self.pending.lock();
                match pending.as_mut() {
                    Some(batch) => batch.push(entity),
                    None => {
                        drop(pending);
                        (self.add_callback)(vec![entity]);
                    }
                }
            }
            EntityChange::Synced(_) => {
                let batch = self.pending.lock().take();
                if let Some(batch) = batch {
                    (self.add_callback)(batch);
                }
                self.ready.send_replace(true);
            }
            EntityChange::Retired(h) => (self.retire_callback)(h.clone()),
            EntityChange::Failed { kind, message } => {
                warn!(kind = %kind, error = %message, "listener stream failed");
                self.ready.send_replace(true);
            }
            EntityChange::Updated(_) => {}
        }
    }
}
