//! Kubeward core types: object identity, snapshots, watch events and mutation requests.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod error;

pub use error::{KubeError, KubeResult};

pub type Uid = [u8; 16];

/// Parameters of a mutation verb, as supplied by the caller.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Resource kinds with a registered adapter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    DaemonSet,
    Deployment,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::DaemonSet, ResourceKind::Deployment];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::DaemonSet => "DaemonSet",
            ResourceKind::Deployment => "Deployment",
        }
    }

    pub fn group(&self) -> &'static str { "apps" }
    pub fn version(&self) -> &'static str { "v1" }

    /// `daemon_set`, `deployment`: used in service and entity ids.
    pub fn snake_name(&self) -> &'static str {
        match self {
            ResourceKind::DaemonSet => "daemon_set",
            ResourceKind::Deployment => "deployment",
        }
    }

    pub fn gvk_key(&self) -> String {
        format!("{}/{}/{}", self.group(), self.version(), self.as_str())
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown resource kind: {0} (expected DaemonSet or Deployment)")]
pub struct UnknownKind(pub String);

impl FromStr for ResourceKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tail = s.rsplit('/').next().unwrap_or(s);
        let norm: String = tail.chars().filter(|c| *c != '_' && *c != '-').collect::<String>().to_ascii_lowercase();
        match norm.as_str() {
            "daemonset" | "daemonsets" | "ds" => Ok(ResourceKind::DaemonSet),
            "deployment" | "deployments" | "deploy" => Ok(ResourceKind::Deployment),
            _ => Err(UnknownKind(s.to_string())),
        }
    }
}

/// Unique key of a cluster object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectIdentity {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectIdentity {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind, namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Opaque resource version token.
///
/// Kubernetes only promises opaqueness; in practice versions are etcd revisions,
/// so two numeric versions are compared numerically. Anything else is incomparable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    pub fn new(v: impl Into<String>) -> Self { Self(v.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    fn numeric(&self) -> Option<u64> { self.0.parse::<u64>().ok() }

    /// True only when both versions are numeric and `self` is strictly older.
    pub fn is_older_than(&self, other: &ResourceVersion) -> bool {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        }
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for ResourceVersion {
    fn from(v: &str) -> Self { Self(v.to_string()) }
}

/// Scalar value of a projected field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Bool(bool),
    Str(String),
}

impl FieldValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Int(v) => serde_json::Value::from(*v),
            FieldValue::Bool(v) => serde_json::Value::Bool(*v),
            FieldValue::Str(v) => serde_json::Value::String(v.clone()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::Str(v) => f.write_str(v),
        }
    }
}

/// Entry representing a projected field: `(attribute name, value)`.
pub type ProjectedEntry = (String, FieldValue);

/// Projector takes a raw JSON object and yields the fields a kind cares about.
pub trait Projector: Send + Sync {
    fn project(&self, raw: &serde_json::Value) -> SmallVec<[ProjectedEntry; 8]>;
}

/// Last-known state of one object. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    pub identity: ObjectIdentity,
    pub uid: Option<Uid>,
    pub resource_version: ResourceVersion,
    pub creation_ts: i64,
    /// Kubernetes labels as key/value pairs.
    pub labels: SmallVec<[(String, String); 8]>,
    /// Fields projected by the kind adapter.
    pub fields: SmallVec<[ProjectedEntry; 8]>,
}

impl ObjectSnapshot {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn int_field(&self, name: &str) -> Option<i64> {
        self.field(name).and_then(FieldValue::as_i64)
    }
}

/// Full listing of a kind at one point of the cluster history.
#[derive(Debug, Clone, Default)]
pub struct ObjectList {
    pub items: Vec<ObjectSnapshot>,
    pub resource_version: ResourceVersion,
}

/// Object-state delta produced by a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(ObjectSnapshot),
    Modified(ObjectSnapshot),
    Removed(ObjectIdentity),
    /// Emitted after every completed list: the consumer now mirrors the cluster.
    ResyncMarker,
}

impl WatchEvent {
    pub fn identity(&self) -> Option<&ObjectIdentity> {
        match self {
            WatchEvent::Added(s) | WatchEvent::Modified(s) => Some(&s.identity),
            WatchEvent::Removed(id) => Some(id),
            WatchEvent::ResyncMarker => None,
        }
    }
}

/// Caller intent to mutate one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    pub identity: ObjectIdentity,
    pub verb: String,
    pub params: Params,
}

impl MutationRequest {
    pub fn new(identity: ObjectIdentity, verb: impl Into<String>, params: Params) -> Self {
        Self { identity, verb: verb.into(), params }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchStrategy {
    Strategic,
    Merge,
}

/// Rendered patch for one verb invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchRequest {
    pub verb: String,
    pub strategy: PatchStrategy,
    pub body: serde_json::Value,
}

/// Server acknowledgement of an accepted mutation. Not proof it was applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub resource_version: Option<ResourceVersion>,
}

pub mod prelude {
    pub use super::{
        Ack, FieldValue, KubeError, KubeResult, MutationRequest, ObjectIdentity, ObjectList, ObjectSnapshot, Params,
        PatchRequest, PatchStrategy, ProjectedEntry, Projector, ResourceKind, ResourceVersion, Uid, WatchEvent,
    };
}
