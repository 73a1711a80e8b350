//! Kubeward ops: validated mutations, serialized per object and retried on transient failures.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use kubeward_core::{Ack, KubeError, MutationRequest, ObjectIdentity};
use kubeward_kinds::{adapter, ValidationError};
use kubeward_kubehub::{ApiClient, Backoff};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

mod keyed_lock;

pub use keyed_lock::{KeyedAsyncLock, KeyedLockGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total patch attempts, first one included.
    pub max_attempts: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5, initial: Duration::from_millis(200), max: Duration::from_secs(5) }
    }
}

impl RetryPolicy {
    /// `KUBEWARD_DISPATCH_MAX_ATTEMPTS`, `KUBEWARD_DISPATCH_BACKOFF_INITIAL_MS`, `KUBEWARD_DISPATCH_BACKOFF_MAX_SECS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let max_attempts = std::env::var("KUBEWARD_DISPATCH_MAX_ATTEMPTS")
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .map(|n| n.max(1))
            .unwrap_or(d.max_attempts);
        let initial = std::env::var("KUBEWARD_DISPATCH_BACKOFF_INITIAL_MS")
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(d.initial);
        let max = std::env::var("KUBEWARD_DISPATCH_BACKOFF_MAX_SECS")
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(d.max);
        Self { max_attempts, initial, max }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Non-retryable API rejection, surfaced as-is.
    #[error("{verb} on {identity} rejected ({}): {message}", status_text(.status))]
    Rejected { verb: String, identity: ObjectIdentity, status: Option<u16>, message: String },
    #[error("{verb} on {identity} failed after {attempts} attempts: {last}")]
    Exhausted { verb: String, identity: ObjectIdentity, attempts: u32, last: KubeError },
}

fn status_text(status: &Option<u16>) -> String {
    status.map_or_else(|| "no status".to_string(), |s| format!("HTTP {}", s))
}

impl DispatchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            DispatchError::Validation(_) => None,
            DispatchError::Rejected { status, .. } => *status,
            DispatchError::Exhausted { last, .. } => last.status(),
        }
    }
}

/// Sends mutation requests to the API server.
///
/// A request is validated against its kind's verb table before anything touches
/// the network. Requests for the same object queue behind each other in
/// submission order; different objects proceed in parallel. Success means the
/// server accepted the patch, not that the watch has observed its effect.
pub struct CommandDispatcher {
    client: Arc<dyn ApiClient>,
    locks: KeyedAsyncLock<ObjectIdentity>,
    policy: RetryPolicy,
}

impl CommandDispatcher {
    pub fn new(client: Arc<dyn ApiClient>, policy: RetryPolicy) -> Self {
        Self { client, locks: KeyedAsyncLock::new(), policy }
    }

    pub fn policy(&self) -> &RetryPolicy { &self.policy }

    pub async fn dispatch(&self, req: MutationRequest) -> Result<Ack, DispatchError> {
        let patch = adapter(req.identity.kind).render(&req).map_err(|e| {
            counter!("dispatch_err_total", 1u64);
            debug!(identity = %req.identity, verb = %req.verb, error = %e, "rejected before send");
            e
        })?;

        let _guard = self.locks.lock(&req.identity).await;
        let started = Instant::now();
        let mut backoff = Backoff::new(self.policy.initial, self.policy.max);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            counter!("dispatch_attempts_total", 1u64);
            match self.client.patch(&req.identity, &patch).await {
                Ok(ack) => {
                    counter!("dispatch_ok_total", 1u64);
                    histogram!("dispatch_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
                    info!(identity = %req.identity, verb = %req.verb, attempts, rv = ?ack.resource_version, "mutation accepted");
                    return Ok(ack);
                }
                Err(e) if e.is_retryable() && attempts < self.policy.max_attempts => {
                    let delay = backoff.next_delay();
                    warn!(identity = %req.identity, verb = %req.verb, attempts, error = %e, delay_ms = delay.as_millis() as u64, "patch failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    counter!("dispatch_err_total", 1u64);
                    warn!(identity = %req.identity, verb = %req.verb, attempts, error = %e, "mutation failed");
                    return Err(if e.is_retryable() {
                        DispatchError::Exhausted { verb: req.verb, identity: req.identity, attempts, last: e }
                    } else {
                        let message = match &e {
                            KubeError::Api { message, .. } => message.clone(),
                            other => other.to_string(),
                        };
                        DispatchError::Rejected { verb: req.verb, identity: req.identity, status: e.status(), message }
                    });
                }
            }
        }
    }
}
