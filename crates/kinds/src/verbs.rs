//! Mutation verbs: parameter schemas, validation and patch rendering.

use std::collections::BTreeMap;

use kubeward_core::{Params, PatchRequest, PatchStrategy, ResourceKind};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParamType {
    /// Non-empty string.
    String,
    /// Integer greater than or equal to `min`. Numeric strings are coerced.
    Integer { min: i64 },
}

impl ParamType {
    pub fn name(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer { .. } => "integer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    pub ty: ParamType,
}

/// Static description of one verb. All parameters are required.
#[derive(Clone, Copy)]
pub struct VerbSpec {
    pub verb: &'static str,
    /// Service name registered with the host, e.g. `set_image_daemon_set`.
    pub service: &'static str,
    pub params: &'static [ParamSpec],
    pub strategy: PatchStrategy,
    /// Renders the patch body from already validated parameters.
    pub build: fn(&Params) -> Value,
}

impl std::fmt::Debug for VerbSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerbSpec")
            .field("verb", &self.verb)
            .field("service", &self.service)
            .field("params", &self.params)
            .field("strategy", &self.strategy)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{kind} has no verb '{verb}'")]
    UnknownVerb { kind: ResourceKind, verb: String },
    #[error("{verb}: missing required parameter '{param}'")]
    MissingParam { verb: String, param: String },
    #[error("{verb}: parameter '{param}' must not be empty")]
    EmptyParam { verb: String, param: String },
    #[error("{verb}: parameter '{param}' must be a {expected}")]
    WrongType { verb: String, param: String, expected: &'static str },
    #[error("{verb}: parameter '{param}' must be >= {min}")]
    OutOfRange { verb: String, param: String, min: i64 },
    #[error("{verb}: unexpected parameter '{param}'")]
    UnexpectedParam { verb: String, param: String },
}

impl VerbSpec {
    /// `{parameter name: type name}` as handed to the host for input validation.
    pub fn schema(&self) -> BTreeMap<&'static str, &'static str> {
        self.params.iter().map(|p| (p.name, p.ty.name())).collect()
    }

    /// Check `params` against the schema and return them normalized (trimmed strings, coerced integers).
    pub fn validate(&self, params: &Params) -> Result<Params, ValidationError> {
        if let Some(extra) = params.keys().find(|k| !self.params.iter().any(|p| p.name == k.as_str())) {
            return Err(ValidationError::UnexpectedParam { verb: self.verb.to_string(), param: extra.clone() });
        }
        let mut out = Params::new();
        for spec in self.params {
            let raw = params.get(spec.name).filter(|v| !v.is_null()).ok_or_else(|| ValidationError::MissingParam {
                verb: self.verb.to_string(),
                param: spec.name.to_string(),
            })?;
            let value = match spec.ty {
                ParamType::String => Value::String(self.check_string(spec, raw)?),
                ParamType::Integer { min } => Value::from(self.check_integer(spec, raw, min)?),
            };
            out.insert(spec.name.to_string(), value);
        }
        Ok(out)
    }

    /// Validate then render the patch for this verb.
    pub fn render(&self, params: &Params) -> Result<PatchRequest, ValidationError> {
        let normalized = self.validate(params)?;
        Ok(PatchRequest { verb: self.verb.to_string(), strategy: self.strategy, body: (self.build)(&normalized) })
    }

    fn check_string(&self, spec: &ParamSpec, raw: &Value) -> Result<String, ValidationError> {
        let s = raw.as_str().ok_or_else(|| self.wrong_type(spec))?.trim();
        if s.is_empty() {
            return Err(ValidationError::EmptyParam { verb: self.verb.to_string(), param: spec.name.to_string() });
        }
        Ok(s.to_string())
    }

    fn check_integer(&self, spec: &ParamSpec, raw: &Value, min: i64) -> Result<i64, ValidationError> {
        let n = match raw {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
        .ok_or_else(|| self.wrong_type(spec))?;
        if n < min {
            return Err(ValidationError::OutOfRange { verb: self.verb.to_string(), param: spec.name.to_string(), min });
        }
        Ok(n)
    }

    fn wrong_type(&self, spec: &ParamSpec) -> ValidationError {
        ValidationError::WrongType { verb: self.verb.to_string(), param: spec.name.to_string(), expected: spec.ty.name() }
    }
}

pub(crate) const SET_IMAGE_PARAMS: &[ParamSpec] = &[
    ParamSpec { name: "container", ty: ParamType::String },
    ParamSpec { name: "image", ty: ParamType::String },
];

pub(crate) const SCALE_PARAMS: &[ParamSpec] = &[ParamSpec { name: "replicas", ty: ParamType::Integer { min: 0 } }];

/// Strategic merge on the pod template; containers merge by name.
pub(crate) fn set_image_patch(p: &Params) -> Value {
    let container = p.get("container").and_then(Value::as_str).unwrap_or_default();
    let image = p.get("image").and_then(Value::as_str).unwrap_or_default();
    json!({
        "spec": { "template": { "spec": { "containers": [ { "name": container, "image": image } ] } } }
    })
}

pub(crate) fn scale_patch(p: &Params) -> Value {
    let replicas = p.get("replicas").and_then(Value::as_i64).unwrap_or_default();
    json!({ "spec": { "replicas": replicas } })
}
