//! Controller host
//!
//! Wires an object store, a resource client and the function reconciler
//! into a running multi-worker operator, and owns its lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::controllers::FunctionReconciler;
use crate::crd::Function;
use crate::error::Result;
use crate::operator::{MultiWorkerOperator, OperatorState, DEFAULT_RESYNC_INTERVAL};
use crate::resources::ResourceClient;
use crate::scale_events::ScaleEventSink;
use crate::status::StatusWriter;
use crate::store::ObjectStore;

/// Configuration for the controller host, passed by value at construction.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace whose functions are reconciled
    pub namespace: String,
    /// Interval between forced re-enqueues of all known functions
    pub resync_interval: Duration,
    /// Number of reconciliation workers
    pub num_workers: usize,
    /// Comma-separated pull secret names propagated to function pods
    pub image_pull_secrets: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            num_workers: 4,
            image_pull_secrets: String::new(),
        }
    }
}

/// Hosts the function operator inside a larger process.
pub struct ControllerHost {
    operator: Arc<MultiWorkerOperator<Function>>,
}

impl ControllerHost {
    pub fn new(
        store: Arc<dyn ObjectStore<Function>>,
        resource_client: Arc<dyn ResourceClient>,
        config: ControllerConfig,
    ) -> Self {
        let reconciler = FunctionReconciler::new(
            resource_client,
            StatusWriter::new(Arc::clone(&store)),
            ScaleEventSink::system(),
            config.image_pull_secrets,
        );

        let operator = MultiWorkerOperator::new(
            store,
            Arc::new(reconciler),
            config.namespace,
            config.num_workers,
            Some(config.resync_interval),
        );

        Self { operator }
    }

    /// Start the operator. Returns once the cache is synced and the worker
    /// pool is running.
    pub async fn start(&self) -> Result<()> {
        info!("Starting function controller");
        Arc::clone(&self.operator).start().await
    }

    /// Stop the operator, draining workers gracefully.
    pub async fn stop(&self) {
        self.operator.stop().await;
        info!("Function controller stopped");
    }

    pub fn state(&self) -> OperatorState {
        self.operator.state()
    }
}
