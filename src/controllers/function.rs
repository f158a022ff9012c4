//! Function reconciler
//!
//! Drives a Function's child runtime resources toward its declared state and
//! finalizes scale-to/from-zero transitions. Decision logic only: store
//! writes go through [`StatusWriter`] and child resources through
//! [`ResourceClient`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::crd::{
    should_skip_deploy, validate_qualified_name, Function, FunctionState, FunctionStatus,
    ScaleEvent,
};
use crate::error::{panic_message, OperatorError, Result};
use crate::operator::Handler;
use crate::resources::{
    FunctionResources, ResourceClient, CONTAINER_HTTP_PORT_NAME, DEFAULT_READINESS_TIMEOUT_SECONDS,
};
use crate::scale_events::ScaleEventSink;
use crate::status::StatusWriter;
use crate::store::StoreObject;

/// States the reconciler responds to; anything else is left alone.
const RESPOND_STATES: [FunctionState; 5] = [
    // provisioning states: resources must be created or updated
    FunctionState::WaitingForResourceConfiguration,
    FunctionState::WaitingForScaleResourcesFromZero,
    FunctionState::WaitingForScaleResourcesToZero,
    // verified on resync so drift self-heals
    FunctionState::Ready,
    FunctionState::ScaledToZero,
];

/// States that finalize into a scale event once resources are available.
const WAITING_STATES: [FunctionState; 3] = [
    FunctionState::WaitingForResourceConfiguration,
    FunctionState::WaitingForScaleResourcesFromZero,
    FunctionState::WaitingForScaleResourcesToZero,
];

/// Reconciles Function objects dispatched by the operator.
pub struct FunctionReconciler {
    resource_client: Arc<dyn ResourceClient>,
    status_writer: StatusWriter,
    scale_events: ScaleEventSink,
    image_pull_secrets: String,
}

impl FunctionReconciler {
    pub fn new(
        resource_client: Arc<dyn ResourceClient>,
        status_writer: StatusWriter,
        scale_events: ScaleEventSink,
        image_pull_secrets: impl Into<String>,
    ) -> Self {
        Self {
            resource_client,
            status_writer,
            scale_events,
            image_pull_secrets: image_pull_secrets.into(),
        }
    }

    async fn reconcile(&self, function: &Function) -> Result<()> {
        let name = function.name_any();
        let namespace = function
            .namespace()
            .unwrap_or_else(|| "default".to_string());

        validate_qualified_name(&name)?;

        let state = function
            .status
            .as_ref()
            .map(|status| status.state)
            .unwrap_or_default();

        if !RESPOND_STATES.contains(&state) {
            debug!(
                function = %name,
                namespace = %namespace,
                state = ?state,
                "Function is not waiting for resources or ready; skipping",
            );
            return Ok(());
        }

        // imported functions carry the skip-deploy annotation: record the
        // state and bail without materializing anything
        if should_skip_deploy(function.metadata.annotations.as_ref()) {
            info!(function = %name, namespace = %namespace, "Skipping function deploy");
            return self
                .status_writer
                .set_status(
                    function,
                    FunctionStatus {
                        state: FunctionState::Imported,
                        ..Default::default()
                    },
                )
                .await;
        }

        let resources = match self
            .resource_client
            .create_or_update(function, &self.image_pull_secrets)
            .await
        {
            Ok(resources) => resources,
            Err(err) => {
                return Err(self
                    .status_writer
                    .set_error(
                        Some(function),
                        FunctionState::Error,
                        err.wrap("Failed to create/update function resources"),
                    )
                    .await);
            }
        };

        let readiness_timeout = if function.spec.readiness_timeout_seconds > 0 {
            function.spec.readiness_timeout_seconds
        } else {
            DEFAULT_READINESS_TIMEOUT_SECONDS
        };

        let wait_result = match tokio::time::timeout(
            Duration::from_secs(readiness_timeout as u64),
            self.resource_client.wait_available(&namespace, &name),
        )
        .await
        {
            Ok(result) => result,
            Err(_elapsed) => Err(OperatorError::Readiness(format!(
                "function resources were not available within {}s",
                readiness_timeout
            ))),
        };

        if let Err(err) = wait_result {
            return Err(self
                .status_writer
                .set_error(
                    Some(function),
                    FunctionState::Unhealthy,
                    err.wrap("Failed to wait for function resources to be available"),
                )
                .await);
        }

        if !WAITING_STATES.contains(&state) {
            // Ready / ScaledToZero with healthy resources: nothing to record
            return Ok(());
        }

        let (scale_event, final_state) = match state {
            FunctionState::WaitingForScaleResourcesToZero => {
                (ScaleEvent::ScaleToZeroCompleted, FunctionState::ScaledToZero)
            }
            FunctionState::WaitingForScaleResourcesFromZero => {
                (ScaleEvent::ScaleFromZeroCompleted, FunctionState::Ready)
            }
            _ => (ScaleEvent::ResourceUpdated, FunctionState::Ready),
        };

        // a fresh document: prior message and logs are dropped on this
        // transition
        let mut status = FunctionStatus {
            state: final_state,
            http_port: http_port(&resources),
            ..Default::default()
        };
        self.scale_events.stamp(&mut status, scale_event);

        self.status_writer.set_status(function, status).await
    }
}

#[async_trait]
impl Handler for FunctionReconciler {
    async fn create_or_update(&self, object: Arc<dyn StoreObject>) -> Result<()> {
        let Some(function) = object.as_any().downcast_ref::<Function>() else {
            return Err(self
                .status_writer
                .set_error(
                    None,
                    FunctionState::Error,
                    OperatorError::UnexpectedObject(
                        "received unexpected object, expected a function".to_string(),
                    ),
                )
                .await);
        };

        match AssertUnwindSafe(self.reconcile(function)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let err = OperatorError::Panic(panic_message(payload.as_ref()))
                    .wrap("Failed to create/update function");
                Err(self
                    .status_writer
                    .set_error(Some(function), FunctionState::Error, err)
                    .await)
            }
        }
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        debug!(function = name, namespace = namespace, "Deleting function");
        self.resource_client.delete(namespace, name).await
    }
}

/// Node port of the service port named `http`, 0 when absent.
fn http_port(resources: &FunctionResources) -> i32 {
    resources
        .service()
        .and_then(|service| service.spec.as_ref())
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| {
            ports
                .iter()
                .find(|port| port.name.as_deref() == Some(CONTAINER_HTTP_PORT_NAME))
        })
        .and_then(|port| port.node_port)
        .unwrap_or(0)
}
