use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use kubeward_core::{ObjectIdentity, ObjectSnapshot, ResourceKind};
use kubeward_kinds::{EntityView, KindAdapter};
use serde_json::Value;

/// Long-lived entity bound to one object identity.
///
/// The snapshot is swapped atomically on every update so readers never see a
/// partially applied object. A handle is never revived: once retired, a later
/// Added for the same identity produces a fresh handle with a new id.
#[derive(Debug)]
pub struct EntityHandle {
    id: u64,
    identity: ObjectIdentity,
    adapter: &'static KindAdapter,
    snapshot: ArcSwap<ObjectSnapshot>,
    retired: AtomicBool,
}

impl EntityHandle {
    pub(crate) fn new(id: u64, adapter: &'static KindAdapter, snapshot: ObjectSnapshot) -> Self {
        Self {
            id,
            identity: snapshot.identity.clone(),
            adapter,
            snapshot: ArcSwap::from_pointee(snapshot),
            retired: AtomicBool::new(false),
        }
    }

    /// Process-unique serial, distinct for every handle ever created.
    pub fn id(&self) -> u64 { self.id }
    pub fn identity(&self) -> &ObjectIdentity { &self.identity }
    pub fn adapter(&self) -> &'static KindAdapter { self.adapter }
    pub fn snapshot(&self) -> Arc<ObjectSnapshot> { self.snapshot.load_full() }
    pub fn is_retired(&self) -> bool { self.retired.load(Ordering::Acquire) }
    pub fn is_healthy(&self) -> bool { self.adapter.is_healthy(&self.snapshot.load()) }

    pub(crate) fn replace(&self, snapshot: ObjectSnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    /// Host entity id, e.g. `sensor.daemon_set_default_web`.
    pub fn entity_id(&self) -> String {
        let raw = format!("{}_{}_{}", self.identity.kind.snake_name(), self.identity.namespace, self.identity.name);
        format!("sensor.{}", slugify(&raw))
    }
}

fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

impl EntityView for EntityHandle {
    fn kind(&self) -> ResourceKind { self.identity.kind }

    fn state(&self) -> String { self.adapter.state(&self.snapshot.load()) }

    fn icon(&self) -> &'static str { self.adapter.icon(&self.snapshot.load()) }

    fn extra_attributes(&self) -> BTreeMap<String, Value> { self.adapter.attributes(&self.snapshot.load()) }
}
