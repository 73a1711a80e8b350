//! Kubeward kind adapters.
//!
//! Each supported kind is described by a static [`KindAdapter`]: which fields to
//! project out of the raw object, how health is derived from them, which icons to
//! show and which mutation verbs exist. Adapters are data; there is no per-kind code
//! beyond the patch builders.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use kubeward_core::{
    FieldValue, KubeError, MutationRequest, ObjectIdentity, ObjectSnapshot, PatchRequest, ProjectedEntry, Projector,
    ResourceKind, ResourceVersion,
};
use serde_json::Value;
use smallvec::SmallVec;

pub mod daemon_set;
pub mod deployment;
mod path;
pub mod verbs;

pub use verbs::{ParamSpec, ParamType, ValidationError, VerbSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Missing integers project as 0: the API server omits zero-valued counters.
    Int,
    Str,
    Bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub attr: &'static str,
    pub path: &'static str,
    pub ty: FieldType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthRule {
    /// Healthy when both integer fields are present and equal.
    FieldsEqual { left: &'static str, right: &'static str },
}

/// Static description of one resource kind.
#[derive(Debug)]
pub struct KindAdapter {
    pub kind: ResourceKind,
    pub fields: &'static [FieldSpec],
    pub health: HealthRule,
    pub icon_ok: &'static str,
    pub icon_not_ok: &'static str,
    pub verbs: &'static [VerbSpec],
}

/// Adapter registered for `kind`.
pub fn adapter(kind: ResourceKind) -> &'static KindAdapter {
    match kind {
        ResourceKind::DaemonSet => &daemon_set::DAEMON_SET,
        ResourceKind::Deployment => &deployment::DEPLOYMENT,
    }
}

impl KindAdapter {
    pub fn is_healthy(&self, snap: &ObjectSnapshot) -> bool {
        match self.health {
            HealthRule::FieldsEqual { left, right } => match (snap.int_field(left), snap.int_field(right)) {
                (Some(l), Some(r)) => l == r,
                _ => false,
            },
        }
    }

    /// Host-visible state string.
    pub fn state(&self, snap: &ObjectSnapshot) -> String {
        if self.is_healthy(snap) { "True".to_string() } else { "False".to_string() }
    }

    pub fn icon(&self, snap: &ObjectSnapshot) -> &'static str {
        if self.is_healthy(snap) { self.icon_ok } else { self.icon_not_ok }
    }

    /// Base object attributes, projected fields and the `ok` flag.
    pub fn attributes(&self, snap: &ObjectSnapshot) -> BTreeMap<String, Value> {
        let mut attr = BTreeMap::new();
        attr.insert("kind".to_string(), Value::from(self.kind.as_str()));
        attr.insert("name".to_string(), Value::from(snap.identity.name.clone()));
        attr.insert("namespace".to_string(), Value::from(snap.identity.namespace.clone()));
        if let Some(uid) = snap.uid {
            attr.insert("uid".to_string(), Value::from(uuid::Uuid::from_bytes(uid).to_string()));
        }
        attr.insert("resource_version".to_string(), Value::from(snap.resource_version.as_str()));
        let labels: serde_json::Map<String, Value> =
            snap.labels.iter().map(|(k, v)| (k.clone(), Value::from(v.clone()))).collect();
        attr.insert("labels".to_string(), Value::Object(labels));
        for (k, v) in snap.fields.iter() {
            attr.insert(k.clone(), v.to_json());
        }
        attr.insert("ok".to_string(), Value::Bool(self.is_healthy(snap)));
        attr
    }

    pub fn verb(&self, verb: &str) -> Option<&'static VerbSpec> {
        self.verbs.iter().find(|v| v.verb == verb)
    }

    /// Look up a verb by its host service name (`set_image_daemon_set`) or plain verb name.
    pub fn service(&self, name: &str) -> Option<&'static VerbSpec> {
        self.verbs.iter().find(|v| v.service == name).or_else(|| self.verb(name))
    }

    /// Validate a mutation request and render its patch.
    pub fn render(&self, req: &MutationRequest) -> Result<PatchRequest, ValidationError> {
        let spec = self
            .verb(&req.verb)
            .ok_or_else(|| ValidationError::UnknownVerb { kind: self.kind, verb: req.verb.clone() })?;
        spec.render(&req.params)
    }

    /// Build a snapshot from a raw API object of this kind.
    pub fn snapshot(&self, raw: &Value) -> Result<ObjectSnapshot, KubeError> {
        let meta = raw.get("metadata").ok_or_else(|| KubeError::Decode("object missing metadata".to_string()))?;
        let name = path::str_at(meta, "name").ok_or_else(|| KubeError::Decode("object missing metadata.name".to_string()))?;
        let namespace = path::str_at(meta, "namespace")
            .ok_or_else(|| KubeError::Decode(format!("{} {} missing metadata.namespace", self.kind, name)))?;
        let uid = path::str_at(meta, "uid").and_then(|s| uuid::Uuid::parse_str(s).ok()).map(|u| *u.as_bytes());
        let resource_version = ResourceVersion::new(path::str_at(meta, "resourceVersion").unwrap_or(""));
        let creation_ts = path::str_at(meta, "creationTimestamp")
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0);
        let mut labels: SmallVec<[(String, String); 8]> = meta
            .get("labels")
            .and_then(|l| l.as_object())
            .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
            .unwrap_or_default();
        labels.sort();
        Ok(ObjectSnapshot {
            identity: ObjectIdentity::new(self.kind, namespace, name),
            uid,
            resource_version,
            creation_ts,
            labels,
            fields: self.project(raw),
        })
    }
}

impl Projector for KindAdapter {
    fn project(&self, raw: &Value) -> SmallVec<[ProjectedEntry; 8]> {
        let mut out: SmallVec<[ProjectedEntry; 8]> = SmallVec::new();
        for spec in self.fields {
            let found = path::extract_path(raw, spec.path);
            let value = match spec.ty {
                FieldType::Int => Some(FieldValue::Int(found.and_then(Value::as_i64).unwrap_or(0))),
                FieldType::Str => found.and_then(Value::as_str).map(|s| FieldValue::Str(s.to_string())),
                FieldType::Bool => found.and_then(Value::as_bool).map(FieldValue::Bool),
            };
            if let Some(v) = value {
                out.push((spec.attr.to_string(), v));
            }
        }
        out
    }
}

/// Capability set every host-visible entity exposes.
pub trait EntityView {
    fn kind(&self) -> ResourceKind;
    fn state(&self) -> String;
    fn icon(&self) -> &'static str;
    fn extra_attributes(&self) -> BTreeMap<String, Value>;
}

/// Raw DaemonSet object in API shape, handy for tests and demos.
pub fn daemon_set_json(namespace: &str, name: &str, rv: &str, scheduled: i64, available: i64) -> Value {
    serde_json::json!({
        "apiVersion": "apps/v1",
        "kind": "DaemonSet",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "uid": "6a1f0c2e-3b4d-4e5f-8a9b-0c1d2e3f4a5b",
            "resourceVersion": rv,
            "creationTimestamp": "2024-05-01T10:00:00Z",
            "labels": { "app": name }
        },
        "spec": { "template": { "spec": { "containers": [ { "name": "app", "image": "nginx:1.25" } ] } } },
        "status": {
            "currentNumberScheduled": scheduled,
            "desiredNumberScheduled": scheduled,
            "numberAvailable": available,
            "numberUnavailable": scheduled - available
        }
    })
}
