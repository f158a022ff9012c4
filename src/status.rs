//! Function status writes
//!
//! All status mutations flow through [`StatusWriter`]; the reconciler never
//! touches the object store directly. Error-state writes are best-effort:
//! a failed bookkeeping write is logged but never masks the error that
//! caused it.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::crd::{Function, FunctionState, FunctionStatus};
use crate::error::{error_stack, OperatorError, Result};
use crate::store::ObjectStore;

/// Depth bound on the error stack rendered into status messages
const ERROR_STACK_DEPTH: usize = 10;

/// Applies status documents onto functions via the object store.
pub struct StatusWriter {
    store: Arc<dyn ObjectStore<Function>>,
}

impl StatusWriter {
    pub fn new(store: Arc<dyn ObjectStore<Function>>) -> Self {
        Self { store }
    }

    /// Overwrite the function's status and update it in the store. The
    /// store's error is returned verbatim.
    pub async fn set_status(&self, function: &Function, status: FunctionStatus) -> Result<()> {
        debug!(
            function = %function.metadata.name.as_deref().unwrap_or_default(),
            state = ?status.state,
            "Setting function status",
        );

        let mut updated = function.clone();
        updated.status = Some(status);

        self.store.update(&updated).await?;
        Ok(())
    }

    /// Put the function into `error_state` carrying a bounded error stack,
    /// then hand the original error back for the caller to return. A `None`
    /// target skips the write; only the log and the returned error occur.
    pub async fn set_error(
        &self,
        function: Option<&Function>,
        error_state: FunctionState,
        err: OperatorError,
    ) -> OperatorError {
        warn!(
            function = function
                .and_then(|f| f.metadata.name.as_deref())
                .unwrap_or("<unknown>"),
            state = ?error_state,
            error = %err,
            "Setting function error",
        );

        if let Some(function) = function {
            let status = FunctionStatus {
                state: error_state,
                message: Some(error_stack(&err, ERROR_STACK_DEPTH)),
                ..Default::default()
            };

            if let Err(write_err) = self.set_status(function, status).await {
                warn!(error = %write_err, "Failed to update function on error");
            }
        }

        err
    }
}
