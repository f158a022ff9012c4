//! Controllers for the Funcwave Kubernetes Operator
//!
//! Each controller implements the operator [`Handler`](crate::operator::Handler)
//! seam and reconciles the actual state of its resources with the desired
//! state declared in the custom resources.

mod function;

pub use function::FunctionReconciler;
