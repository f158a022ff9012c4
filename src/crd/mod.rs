//! Custom Resource Definitions for the Funcwave Kubernetes Operator
//!
//! Defines the Function CRD: a declarative, deployable unit of code whose
//! runtime resources the operator manages.

mod function;

pub use function::{
    should_skip_deploy, validate_qualified_name, EnvVar, Function, FunctionIngress, FunctionSpec,
    FunctionState, FunctionStatus, ScaleEvent, ScaleToZeroStatus, SKIP_DEPLOY_ANNOTATION,
};
