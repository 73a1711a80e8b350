use kubeward_core::{PatchStrategy, ResourceKind};

use crate::verbs::{set_image_patch, VerbSpec, SET_IMAGE_PARAMS};
use crate::{FieldSpec, FieldType, HealthRule, KindAdapter};

pub const ICON_DAEMONSET_OK: &str = "mdi:checkbox-marked-circle-outline";
pub const ICON_DAEMONSET_NOTOK: &str = "mdi:alert-circle";

const FIELDS: &[FieldSpec] = &[
    FieldSpec { attr: "current_pods_scheduled", path: "status.currentNumberScheduled", ty: FieldType::Int },
    FieldSpec { attr: "desired_pods_scheduled", path: "status.desiredNumberScheduled", ty: FieldType::Int },
    FieldSpec { attr: "pods_available", path: "status.numberAvailable", ty: FieldType::Int },
    FieldSpec { attr: "pods_unavailable", path: "status.numberUnavailable", ty: FieldType::Int },
    FieldSpec { attr: "image", path: "spec.template.spec.containers[0].image", ty: FieldType::Str },
];

const VERBS: &[VerbSpec] = &[VerbSpec {
    verb: "set_image",
    service: "set_image_daemon_set",
    params: SET_IMAGE_PARAMS,
    strategy: PatchStrategy::Strategic,
    build: set_image_patch,
}];

/// Healthy when every scheduled pod is available.
pub static DAEMON_SET: KindAdapter = KindAdapter {
    kind: ResourceKind::DaemonSet,
    fields: FIELDS,
    health: HealthRule::FieldsEqual { left: "pods_available", right: "current_pods_scheduled" },
    icon_ok: ICON_DAEMONSET_OK,
    icon_not_ok: ICON_DAEMONSET_NOTOK,
    verbs: VERBS,
};
