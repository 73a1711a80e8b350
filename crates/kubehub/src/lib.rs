//! Kubeward kubehub: API client, per-kind watch streams and an in-memory cluster.

#![forbid(unsafe_code)]

mod backoff;
pub mod client;
pub mod mock;
pub mod watch;

pub use backoff::Backoff;
pub use client::{map_kube_error, ApiClient, KubeApiClient, WireEvent, WireStream, MAX_WATCH_TIMEOUT_SECS};
pub use mock::MockCluster;
pub use watch::{Phase, WatchConfig, WatchStream};
