//! Per-kind list+watch loop that turns the raw watch protocol into a reliable delta sequence.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kubeward_core::{KubeError, KubeResult, ObjectIdentity, ObjectList, ResourceKind, ResourceVersion, WatchEvent};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::client::{ApiClient, WireEvent, MAX_WATCH_TIMEOUT_SECS};

/// Tunables for one watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    /// Periodic full relist; `None` disables it.
    pub relist: Option<Duration>,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Server-side timeout passed on each watch request.
    pub watch_timeout_secs: u32,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            relist: Some(Duration::from_secs(300)),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            watch_timeout_secs: MAX_WATCH_TIMEOUT_SECS,
        }
    }
}

impl WatchConfig {
    /// Read `KUBEWARD_RELIST_SECS`, `KUBEWARD_WATCH_TIMEOUT_SECS`,
    /// `KUBEWARD_WATCH_BACKOFF_INITIAL_MS` and `KUBEWARD_WATCH_BACKOFF_MAX_SECS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let relist_secs: u64 = env_parse("KUBEWARD_RELIST_SECS").unwrap_or(300);
        Self {
            relist: if relist_secs == 0 { None } else { Some(Duration::from_secs(relist_secs)) },
            backoff_initial: env_parse("KUBEWARD_WATCH_BACKOFF_INITIAL_MS").map(Duration::from_millis).unwrap_or(d.backoff_initial),
            backoff_max: env_parse("KUBEWARD_WATCH_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.backoff_max),
            watch_timeout_secs: env_parse::<u32>("KUBEWARD_WATCH_TIMEOUT_SECS")
                .map(|s| s.clamp(1, MAX_WATCH_TIMEOUT_SECS))
                .unwrap_or(d.watch_timeout_secs),
        }
    }
}

pub(crate) fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Listing,
    Watching,
    Resyncing,
}

enum Flow {
    Continue,
    Stop,
}

/// Long-lived subscription for one kind.
///
/// `Listing → Watching → (error) Resyncing → Watching → …`. Every completed list is
/// diffed against the identities already emitted so consumers only ever see real
/// changes, followed by a `ResyncMarker`. Stream errors are absorbed; only terminal
/// configuration errors (see [`KubeError::is_terminal`]) end the loop.
pub struct WatchStream {
    client: Arc<dyn ApiClient>,
    kind: ResourceKind,
    namespace: Option<String>,
    config: WatchConfig,
    phase: Phase,
    resource_version: ResourceVersion,
    known: FxHashMap<ObjectIdentity, ResourceVersion>,
    backoff: Backoff,
    last_list: Option<Instant>,
}

impl WatchStream {
    pub fn new(client: Arc<dyn ApiClient>, kind: ResourceKind, namespace: Option<String>, config: WatchConfig) -> Self {
        let backoff = Backoff::new(config.backoff_initial, config.backoff_max);
        Self {
            client,
            kind,
            namespace,
            config,
            phase: Phase::Listing,
            resource_version: ResourceVersion::default(),
            known: FxHashMap::default(),
            backoff,
            last_list: None,
        }
    }

    pub fn kind(&self) -> ResourceKind { self.kind }
    pub fn phase(&self) -> Phase { self.phase }

    /// Drive the stream until cancelled, the receiver goes away, or a terminal error occurs.
    pub async fn run(mut self, tx: mpsc::Sender<WatchEvent>, cancel: CancellationToken) -> KubeResult<()> {
        info!(kind = %self.kind, ns = ?self.namespace, "watch stream started");
        let res = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }
            let step = match self.phase {
                Phase::Listing | Phase::Resyncing => self.list_phase(&tx, &cancel).await,
                Phase::Watching => self.watch_phase(&tx, &cancel).await,
            };
            match step {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        match &res {
            Ok(()) => info!(kind = %self.kind, "watch stream stopped"),
            Err(e) => error!(kind = %self.kind, error = %e, "watch stream failed; restart required"),
        }
        res
    }

    async fn list_phase(&mut self, tx: &mpsc::Sender<WatchEvent>, cancel: &CancellationToken) -> KubeResult<Flow> {
        let started = std::time::Instant::now();
        let listed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Flow::Stop),
            r = self.client.list(self.kind, self.namespace.as_deref()) => r,
        };
        let list = match listed {
            Ok(list) => list,
            Err(e) => return self.on_error(e, cancel).await,
        };
        histogram!("watch_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("watch_lists_total", 1u64);
        let count = list.items.len();
        let events = self.diff_list(list);
        if self.phase == Phase::Listing {
            info!(kind = %self.kind, count, rv = %self.resource_version, "initial list complete");
        } else {
            debug!(kind = %self.kind, count, changes = events.len() - 1, rv = %self.resource_version, "resync complete");
        }
        self.last_list = Some(Instant::now());
        for ev in events {
            if let Flow::Stop = emit(tx, cancel, ev).await {
                return Ok(Flow::Stop);
            }
        }
        self.phase = Phase::Watching;
        Ok(Flow::Continue)
    }

    /// Replace the known set with `list`: Removed for vanished, Added for new, Modified for changed.
    fn diff_list(&mut self, list: ObjectList) -> Vec<WatchEvent> {
        let mut fresh: FxHashMap<ObjectIdentity, ResourceVersion> = FxHashMap::default();
        let mut added = Vec::new();
        let mut modified = Vec::new();
        for snap in list.items {
            let id = snap.identity.clone();
            if id.kind != self.kind {
                continue;
            }
            match self.known.get(&id) {
                None => added.push(WatchEvent::Added(snap.clone())),
                Some(rv) if *rv != snap.resource_version => modified.push(WatchEvent::Modified(snap.clone())),
                Some(_) => {}
            }
            fresh.insert(id, snap.resource_version);
        }
        let mut removed: Vec<ObjectIdentity> = self.known.keys().filter(|id| !fresh.contains_key(*id)).cloned().collect();
        removed.sort();
        let mut out = Vec::with_capacity(removed.len() + added.len() + modified.len() + 1);
        out.extend(removed.into_iter().map(WatchEvent::Removed));
        out.extend(added);
        out.extend(modified);
        out.push(WatchEvent::ResyncMarker);
        self.known = fresh;
        self.resource_version = list.resource_version;
        out
    }

    async fn watch_phase(&mut self, tx: &mpsc::Sender<WatchEvent>, cancel: &CancellationToken) -> KubeResult<Flow> {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Flow::Stop),
            r = self.client.watch(self.kind, self.namespace.as_deref(), &self.resource_version) => r,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(e) => return self.on_error(e, cancel).await,
        };
        self.backoff.reset();
        debug!(kind = %self.kind, rv = %self.resource_version, "watch opened");
        let relist_at = match (self.config.relist, self.last_list) {
            (Some(every), Some(at)) => Some(at + every),
            _ => None,
        };
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Flow::Stop),
                _ = sleep_until_opt(relist_at) => {
                    self.enter_resync("periodic relist");
                    return Ok(Flow::Continue);
                }
                item = stream.next() => item,
            };
            match item {
                None => return self.on_error(KubeError::StreamClosed, cancel).await,
                Some(Ok(wire)) => match self.accept(wire) {
                    Ok(Some(ev)) => {
                        if let Flow::Stop = emit(tx, cancel, ev).await {
                            return Ok(Flow::Stop);
                        }
                    }
                    Ok(None) => {}
                    Err(stale) => {
                        warn!(kind = %self.kind, got = %stale, have = %self.resource_version, "resource version went backwards");
                        self.enter_resync("version gap");
                        return Ok(Flow::Continue);
                    }
                },
                Some(Err(KubeError::Decode(msg))) => warn!(kind = %self.kind, error = %msg, "skipping undecodable watch event"),
                Some(Err(e)) => return self.on_error(e, cancel).await,
            }
        }
    }

    /// Apply one frame to the bookkeeping. `Err` carries a version older than the one recorded.
    fn accept(&mut self, wire: WireEvent) -> Result<Option<WatchEvent>, ResourceVersion> {
        let rv = wire.resource_version().clone();
        if rv.is_older_than(&self.resource_version) {
            return Err(rv);
        }
        if !rv.is_empty() {
            self.resource_version = rv.clone();
        }
        Ok(match wire {
            WireEvent::Added(s) if s.identity.kind == self.kind => {
                self.known.insert(s.identity.clone(), rv);
                Some(WatchEvent::Added(s))
            }
            WireEvent::Modified(s) if s.identity.kind == self.kind => {
                self.known.insert(s.identity.clone(), rv);
                Some(WatchEvent::Modified(s))
            }
            WireEvent::Deleted(s) if s.identity.kind == self.kind => {
                self.known.remove(&s.identity);
                Some(WatchEvent::Removed(s.identity))
            }
            _ => None,
        })
    }

    async fn on_error(&mut self, err: KubeError, cancel: &CancellationToken) -> KubeResult<Flow> {
        counter!("watch_errors_total", 1u64);
        if err.is_terminal() {
            return Err(err);
        }
        let quiet = matches!(err, KubeError::StreamClosed | KubeError::StaleResourceVersion(_));
        if quiet {
            debug!(kind = %self.kind, reason = %err, "watch interrupted");
        } else {
            warn!(kind = %self.kind, error = %err, phase = ?self.phase, "watch error");
        }
        if self.phase == Phase::Watching {
            self.enter_resync("stream error");
        }
        if !quiet {
            let delay = self.backoff.next_delay();
            debug!(kind = %self.kind, delay_ms = delay.as_millis() as u64, "backing off");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Flow::Stop),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        Ok(Flow::Continue)
    }

    fn enter_resync(&mut self, reason: &'static str) {
        debug!(kind = %self.kind, reason, "resyncing");
        counter!("watch_resyncs_total", 1u64);
        self.phase = Phase::Resyncing;
    }
}

async fn emit(tx: &mpsc::Sender<WatchEvent>, cancel: &CancellationToken, ev: WatchEvent) -> Flow {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Flow::Stop,
        r = tx.send(ev) => match r {
            Ok(()) => {
                counter!("watch_events_total", 1u64);
                Flow::Continue
            }
            Err(_) => {
                debug!("watch receiver dropped");
                Flow::Stop
            }
        },
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}
