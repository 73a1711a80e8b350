use std::collections::BTreeMap;
use std::sync::Arc;

use kubeward_core::{Ack, MutationRequest, ObjectIdentity, Params, ResourceKind};
use kubeward_kinds::EntityView;
use kubeward_store::EntityHandle;
use serde_json::Value;

use crate::{ClusterHub, DispatchError};

/// Default host entity: one per object, reading through its registry handle.
#[derive(Clone)]
pub struct KubeSensor {
    hub: ClusterHub,
    handle: Arc<EntityHandle>,
}

impl KubeSensor {
    pub fn new(hub: &ClusterHub, handle: Arc<EntityHandle>) -> Self {
        Self { hub: hub.clone(), handle }
    }

    pub fn identity(&self) -> &ObjectIdentity { self.handle.identity() }
    pub fn handle(&self) -> &Arc<EntityHandle> { &self.handle }
    pub fn entity_id(&self) -> String { self.handle.entity_id() }
    pub fn name(&self) -> &str { &self.handle.identity().name }

    /// False once the object is gone or its kind was torn down.
    pub fn available(&self) -> bool { !self.handle.is_retired() }

    pub async fn call_service(&self, service: &str, params: Params) -> Result<Ack, DispatchError> {
        self.hub.call_service(self.identity().clone(), service, params).await
    }

    pub async fn set_image(&self, container: &str, image: &str) -> Result<Ack, DispatchError> {
        let mut params = Params::new();
        params.insert("container".to_string(), Value::from(container));
        params.insert("image".to_string(), Value::from(image));
        self.hub.dispatch(MutationRequest::new(self.identity().clone(), "set_image", params)).await
    }

    pub async fn scale(&self, replicas: i64) -> Result<Ack, DispatchError> {
        let mut params = Params::new();
        params.insert("replicas".to_string(), Value::from(replicas));
        self.hub.dispatch(MutationRequest::new(self.identity().clone(), "scale", params)).await
    }
}

impl EntityView for KubeSensor {
    fn kind(&self) -> ResourceKind { self.handle.kind() }
    fn state(&self) -> String { self.handle.state() }
    fn icon(&self) -> &'static str { self.handle.icon() }
    fn extra_attributes(&self) -> BTreeMap<String, Value> { self.handle.extra_attributes() }
}

impl std::fmt::Debug for KubeSensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeSensor").field("entity_id", &self.entity_id()).field("state", &self.state()).finish()
    }
}
