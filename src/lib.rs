//! Funcwave Kubernetes Operator
//!
//! A Kubernetes operator that reconciles declarative `Function` custom
//! resources into running workloads, and finalizes scale-to/from-zero
//! transitions requested by the scaler subsystem.
//!
//! ## Custom Resources
//!
//! - `Function`: a deployable unit of code; the operator materializes its
//!   deployment, service, configuration blob and optional ingress, and keeps
//!   its status document current.
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: funcwave.io/v1beta1
//! kind: Function
//! metadata:
//!   name: my-function
//! spec:
//!   image: registry.example.com/my-function:latest
//!   replicas: 2
//! ```

pub mod controllers;
pub mod crd;
pub mod error;
pub mod host;
pub mod operator;
pub mod queue;
pub mod resources;
pub mod scale_events;
pub mod status;
pub mod store;

pub use controllers::FunctionReconciler;
pub use crd::{
    Function, FunctionSpec, FunctionState, FunctionStatus, ScaleEvent, ScaleToZeroStatus,
};
pub use error::{OperatorError, Result};
pub use host::{ControllerConfig, ControllerHost};
pub use operator::{Handler, MultiWorkerOperator, OperatorState};
pub use resources::{KubeResourceClient, ResourceClient};
pub use store::{KubeObjectStore, ObjectStore};
