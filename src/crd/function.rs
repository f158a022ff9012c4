//! Function Custom Resource Definition
//!
//! Defines the declarative Function resource that the operator reconciles
//! into runtime workloads.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{OperatorError, Result};

/// Annotation marking a function as imported; a truthy value means its
/// resources must not be materialized.
pub const SKIP_DEPLOY_ANNOTATION: &str = "funcwave.io/skip-deploy";

/// Function is the Schema for the functions API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "funcwave.io",
    version = "v1beta1",
    kind = "Function",
    namespaced,
    status = "FunctionStatus",
    shortname = "fw",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"HTTPPort","type":"integer","jsonPath":".status.httpPort"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    /// Container image that runs the function
    #[serde(default)]
    pub image: String,

    /// Runtime identifier (e.g. "python:3.11", "nodejs:20")
    #[serde(default)]
    pub runtime: Option<String>,

    /// Entry point within the image
    #[serde(default)]
    pub handler: Option<String>,

    /// Number of function replicas
    #[serde(default)]
    pub replicas: Option<i32>,

    /// Additional environment variables for the function container
    #[serde(default)]
    pub env: Vec<EnvVar>,

    /// Seconds to wait for function resources to become available;
    /// 0 means the operator default
    #[serde(default)]
    pub readiness_timeout_seconds: i64,

    /// Optional HTTP route for the function
    #[serde(default)]
    pub ingress: Option<FunctionIngress>,
}

/// Environment variable
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    /// Environment variable name
    pub name: String,
    /// Environment variable value
    #[serde(default)]
    pub value: Option<String>,
}

/// HTTP route configuration for a function
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FunctionIngress {
    /// Host the route is served on
    pub host: String,
    /// Path prefix for the route
    #[serde(default = "default_ingress_path")]
    pub path: String,
}

/// Status of a Function, owned by the controller
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionStatus {
    /// Current lifecycle state
    #[serde(default)]
    pub state: FunctionState,

    /// Free-form message; carries the error stack on failure states
    #[serde(default)]
    pub message: Option<String>,

    /// Structured log records attached by the build/deploy pipeline
    #[serde(default)]
    pub logs: Vec<serde_json::Value>,

    /// Node-exposed port of the function's http service, 0 when absent
    #[serde(default)]
    pub http_port: i32,

    /// Last completed scale lifecycle transition
    #[serde(default)]
    pub scale_to_zero: Option<ScaleToZeroStatus>,
}

/// Lifecycle states of a Function
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FunctionState {
    /// Created but no build requested yet
    #[default]
    WaitingForBuild,
    /// Image build in progress
    Building,
    /// Deploy requested; resources must be configured
    WaitingForResourceConfiguration,
    /// Resource configuration in progress
    ConfiguringResources,
    /// Scaler requested capacity; resources must be provisioned
    WaitingForScaleResourcesFromZero,
    /// Scaler requested teardown; resources must be removed
    WaitingForScaleResourcesToZero,
    /// Function is serving
    Ready,
    /// Function has no capacity provisioned
    ScaledToZero,
    /// Imported without deployment
    Imported,
    /// Resources failed to become available; retryable
    Unhealthy,
    /// Reconciliation failed
    Error,
}

/// Scale lifecycle events stamped onto function status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ScaleEvent {
    /// Resources were created or updated in place
    ResourceUpdated,
    /// A scale-to-zero transition started
    ScaleToZeroStarted,
    /// A scale-to-zero transition completed
    ScaleToZeroCompleted,
    /// A scale-from-zero transition started
    ScaleFromZeroStarted,
    /// A scale-from-zero transition completed
    ScaleFromZeroCompleted,
}

/// Record of the last completed scale lifecycle transition
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleToZeroStatus {
    /// The event that completed
    pub last_scale_event: ScaleEvent,
    /// RFC 3339 timestamp of the event
    #[serde(default)]
    pub last_scale_event_time: Option<String>,
}

fn default_ingress_path() -> String {
    "/".to_string()
}

/// Whether the skip-deploy annotation is present with a truthy value.
pub fn should_skip_deploy(annotations: Option<&BTreeMap<String, String>>) -> bool {
    annotations
        .and_then(|a| a.get(SKIP_DEPLOY_ANNOTATION))
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "t" | "true"))
        .unwrap_or(false)
}

/// Validate a function name against the orchestrator's qualified-name rule:
/// 1-63 characters, lowercase alphanumerics with interior `-` or `.`.
pub fn validate_qualified_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 {
        return Err(OperatorError::InvalidName(format!(
            "\"{}\" must be between 1 and 63 characters",
            name
        )));
    }

    let valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let first = name.chars().next().unwrap();
    let last = name.chars().last().unwrap();
    if !valid_char(first) || !valid_char(last) {
        return Err(OperatorError::InvalidName(format!(
            "\"{}\" must start and end with a lowercase alphanumeric character",
            name
        )));
    }

    if let Some(bad) = name.chars().find(|&c| !valid_char(c) && c != '-' && c != '.') {
        return Err(OperatorError::InvalidName(format!(
            "\"{}\" contains invalid character '{}'",
            name, bad
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_spec_defaults() {
        let spec: FunctionSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec.readiness_timeout_seconds, 0);
        assert!(spec.replicas.is_none());
        assert!(spec.env.is_empty());
        assert!(spec.ingress.is_none());
    }

    #[test]
    fn test_function_status_defaults() {
        let status = FunctionStatus::default();
        assert_eq!(status.state, FunctionState::WaitingForBuild);
        assert_eq!(status.http_port, 0);
        assert!(status.message.is_none());
        assert!(status.scale_to_zero.is_none());
    }

    #[test]
    fn test_state_wire_format() {
        let json = serde_json::to_string(&FunctionState::WaitingForResourceConfiguration).unwrap();
        assert_eq!(json, "\"waitingForResourceConfiguration\"");

        let json = serde_json::to_string(&FunctionState::ScaledToZero).unwrap();
        assert_eq!(json, "\"scaledToZero\"");

        let state: FunctionState = serde_json::from_str("\"ready\"").unwrap();
        assert_eq!(state, FunctionState::Ready);
    }

    #[test]
    fn test_scale_event_wire_format() {
        let json = serde_json::to_string(&ScaleEvent::ScaleFromZeroCompleted).unwrap();
        assert_eq!(json, "\"scaleFromZeroCompleted\"");

        let json = serde_json::to_string(&ScaleEvent::ResourceUpdated).unwrap();
        assert_eq!(json, "\"resourceUpdated\"");
    }

    #[test]
    fn test_status_field_names() {
        let status = FunctionStatus {
            state: FunctionState::Ready,
            http_port: 30080,
            scale_to_zero: Some(ScaleToZeroStatus {
                last_scale_event: ScaleEvent::ResourceUpdated,
                last_scale_event_time: Some("2024-01-01T00:00:00+00:00".to_string()),
            }),
            ..Default::default()
        };

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["state"], "ready");
        assert_eq!(value["httpPort"], 30080);
        assert_eq!(value["scaleToZero"]["lastScaleEvent"], "resourceUpdated");
        assert!(value["scaleToZero"]["lastScaleEventTime"].is_string());
    }

    #[test]
    fn test_should_skip_deploy_truthy_values() {
        for value in ["true", "True", "TRUE", "1", "t"] {
            let mut annotations = BTreeMap::new();
            annotations.insert(SKIP_DEPLOY_ANNOTATION.to_string(), value.to_string());
            assert!(should_skip_deploy(Some(&annotations)), "value: {}", value);
        }
    }

    #[test]
    fn test_should_skip_deploy_falsy_or_absent() {
        assert!(!should_skip_deploy(None));

        let mut annotations = BTreeMap::new();
        annotations.insert(SKIP_DEPLOY_ANNOTATION.to_string(), "false".to_string());
        assert!(!should_skip_deploy(Some(&annotations)));

        annotations.insert(SKIP_DEPLOY_ANNOTATION.to_string(), "yes".to_string());
        assert!(!should_skip_deploy(Some(&annotations)));
    }

    #[test]
    fn test_validate_qualified_name_accepts_dns_labels() {
        for name in ["fn1", "my-function", "a", "fn.v2", "0abc9"] {
            assert!(validate_qualified_name(name).is_ok(), "name: {}", name);
        }
    }

    #[test]
    fn test_validate_qualified_name_rejects_invalid() {
        for name in ["", "Fn_1!", "-leading", "trailing-", "UPPER", "has space"] {
            assert!(validate_qualified_name(name).is_err(), "name: {}", name);
        }

        let long = "a".repeat(64);
        assert!(validate_qualified_name(&long).is_err());
    }
}
