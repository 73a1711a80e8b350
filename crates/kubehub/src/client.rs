//! Thin authenticated transport to the API server.

use anyhow::Context;
use futures::{stream::BoxStream, StreamExt};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, WatchParams},
    core::{ApiResource, DynamicObject, WatchEvent as KubeWatchEvent},
    Client,
};
use kubeward_core::{
    Ack, KubeError, KubeResult, ObjectIdentity, ObjectList, ObjectSnapshot, PatchRequest, PatchStrategy, ResourceKind,
    ResourceVersion,
};
use tracing::{debug, warn};

/// One frame of a Kubernetes watch, already projected into a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum WireEvent {
    Added(ObjectSnapshot),
    Modified(ObjectSnapshot),
    Deleted(ObjectSnapshot),
    /// Progress notification carrying only a resource version.
    Bookmark(ResourceVersion),
}

impl WireEvent {
    pub fn resource_version(&self) -> &ResourceVersion {
        match self {
            WireEvent::Added(s) | WireEvent::Modified(s) | WireEvent::Deleted(s) => &s.resource_version,
            WireEvent::Bookmark(rv) => rv,
        }
    }
}

pub type WireStream = BoxStream<'static, KubeResult<WireEvent>>;

/// list / watch / patch against the cluster. Object safe so the hub can run against a fake.
#[async_trait::async_trait]
pub trait ApiClient: Send + Sync {
    /// Full enumeration of a kind, optionally restricted to one namespace.
    async fn list(&self, kind: ResourceKind, namespace: Option<&str>) -> KubeResult<ObjectList>;

    /// Stream changes after `from`. The stream ending means the server closed it.
    async fn watch(&self, kind: ResourceKind, namespace: Option<&str>, from: &ResourceVersion) -> KubeResult<WireStream>;

    async fn patch(&self, identity: &ObjectIdentity, patch: &PatchRequest) -> KubeResult<Ack>;
}

/// Server-side watch timeout must stay below the apiserver's 295s cap.
pub const MAX_WATCH_TIMEOUT_SECS: u32 = 290;

/// kube-rs backed client. Token refresh and TLS are handled by the underlying `kube::Client`.
#[derive(Clone)]
pub struct KubeApiClient {
    client: Client,
    watch_timeout_secs: u32,
}

impl KubeApiClient {
    pub fn new(client: Client) -> Self {
        Self { client, watch_timeout_secs: MAX_WATCH_TIMEOUT_SECS }
    }

    /// Infer config from kubeconfig or the in-cluster service account.
    pub async fn try_default() -> anyhow::Result<Self> {
        let client = Client::try_default().await.context("building kube client from kubeconfig or in-cluster env")?;
        Ok(Self::new(client))
    }

    pub fn with_watch_timeout(mut self, secs: u32) -> Self {
        self.watch_timeout_secs = secs.clamp(1, MAX_WATCH_TIMEOUT_SECS);
        self
    }

    fn api(&self, kind: ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = api_resource(kind);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

fn api_resource(kind: ResourceKind) -> ApiResource {
    match kind {
        ResourceKind::DaemonSet => ApiResource::erase::<DaemonSet>(&()),
        ResourceKind::Deployment => ApiResource::erase::<Deployment>(&()),
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn snapshot_from(kind: ResourceKind, obj: &DynamicObject) -> KubeResult<ObjectSnapshot> {
    let mut raw = serde_json::to_value(obj).map_err(|e| KubeError::Decode(e.to_string()))?;
    strip_managed_fields(&mut raw);
    kubeward_kinds::adapter(kind).snapshot(&raw)
}

fn wire_from(kind: ResourceKind, ev: KubeWatchEvent<DynamicObject>) -> KubeResult<WireEvent> {
    match ev {
        KubeWatchEvent::Added(o) => snapshot_from(kind, &o).map(WireEvent::Added),
        KubeWatchEvent::Modified(o) => snapshot_from(kind, &o).map(WireEvent::Modified),
        KubeWatchEvent::Deleted(o) => snapshot_from(kind, &o).map(WireEvent::Deleted),
        KubeWatchEvent::Bookmark(b) => Ok(WireEvent::Bookmark(ResourceVersion::new(b.metadata.resource_version))),
        KubeWatchEvent::Error(resp) if resp.code == 410 => Err(KubeError::StaleResourceVersion(resp.message)),
        KubeWatchEvent::Error(resp) => Err(KubeError::api(resp.code, resp.reason, resp.message)),
    }
}

/// Map kube-rs errors onto the shared taxonomy.
pub fn map_kube_error(e: kube::Error) -> KubeError {
    match e {
        kube::Error::Api(resp) if resp.code == 401 => KubeError::Unauthorized(resp.message),
        kube::Error::Api(resp) if resp.code == 410 => KubeError::StaleResourceVersion(resp.message),
        kube::Error::Api(resp) => KubeError::api(resp.code, resp.reason, resp.message),
        kube::Error::Auth(e) => KubeError::Unauthorized(e.to_string()),
        kube::Error::SerdeError(e) => KubeError::Decode(e.to_string()),
        other => KubeError::Transport(other.to_string()),
    }
}

#[async_trait::async_trait]
impl ApiClient for KubeApiClient {
    async fn list(&self, kind: ResourceKind, namespace: Option<&str>) -> KubeResult<ObjectList> {
        let list = self.api(kind, namespace).list(&ListParams::default()).await.map_err(map_kube_error)?;
        let resource_version = ResourceVersion::new(list.metadata.resource_version.clone().unwrap_or_default());
        let mut items = Vec::with_capacity(list.items.len());
        for obj in list.items.iter() {
            match snapshot_from(kind, obj) {
                Ok(s) => items.push(s),
                Err(e) => warn!(kind = %kind, error = %e, "skipping undecodable object"),
            }
        }
        debug!(kind = %kind, ns = ?namespace, count = items.len(), rv = %resource_version, "listed");
        Ok(ObjectList { items, resource_version })
    }

    async fn watch(&self, kind: ResourceKind, namespace: Option<&str>, from: &ResourceVersion) -> KubeResult<WireStream> {
        let wp = WatchParams::default().timeout(self.watch_timeout_secs);
        let stream = self.api(kind, namespace).watch(&wp, from.as_str()).await.map_err(map_kube_error)?;
        Ok(stream
            .map(move |ev| match ev {
                Ok(e) => wire_from(kind, e),
                Err(e) => Err(map_kube_error(e)),
            })
            .boxed())
    }

    async fn patch(&self, identity: &ObjectIdentity, patch: &PatchRequest) -> KubeResult<Ack> {
        let api = self.api(identity.kind, Some(&identity.namespace));
        let pp = PatchParams::default();
        let obj = match patch.strategy {
            PatchStrategy::Strategic => api.patch(&identity.name, &pp, &Patch::Strategic(&patch.body)).await,
            PatchStrategy::Merge => api.patch(&identity.name, &pp, &Patch::Merge(&patch.body)).await,
        }
        .map_err(map_kube_error)?;
        Ok(Ack { resource_version: obj.metadata.resource_version.map(ResourceVersion::new) })
    }
}
