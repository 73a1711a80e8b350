use kubeward_core::{PatchStrategy, ResourceKind};

use crate::verbs::{scale_patch, set_image_patch, VerbSpec, SCALE_PARAMS, SET_IMAGE_PARAMS};
use crate::{FieldSpec, FieldType, HealthRule, KindAdapter};

pub const ICON_DEPLOYMENT_OK: &str = "mdi:checkbox-marked-circle-outline";
pub const ICON_DEPLOYMENT_NOTOK: &str = "mdi:alert-circle";

const FIELDS: &[FieldSpec] = &[
    FieldSpec { attr: "replicas", path: "spec.replicas", ty: FieldType::Int },
    FieldSpec { attr: "available_replicas", path: "status.availableReplicas", ty: FieldType::Int },
    FieldSpec { attr: "ready_replicas", path: "status.readyReplicas", ty: FieldType::Int },
    FieldSpec { attr: "unavailable_replicas", path: "status.unavailableReplicas", ty: FieldType::Int },
    FieldSpec { attr: "updated_replicas", path: "status.updatedReplicas", ty: FieldType::Int },
    FieldSpec { attr: "image", path: "spec.template.spec.containers[0].image", ty: FieldType::Str },
];

const VERBS: &[VerbSpec] = &[
    VerbSpec {
        verb: "set_image",
        service: "set_image_deployment",
        params: SET_IMAGE_PARAMS,
        strategy: PatchStrategy::Strategic,
        build: set_image_patch,
    },
    VerbSpec {
        verb: "scale",
        service: "scale_deployment",
        params: SCALE_PARAMS,
        strategy: PatchStrategy::Merge,
        build: scale_patch,
    },
];

pub static DEPLOYMENT: KindAdapter = KindAdapter {
    kind: ResourceKind::Deployment,
    fields: FIELDS,
    health: HealthRule::FieldsEqual { left: "available_replicas", right: "replicas" },
    icon_ok: ICON_DEPLOYMENT_OK,
    icon_not_ok: ICON_DEPLOYMENT_NOTOK,
    verbs: VERBS,
};
