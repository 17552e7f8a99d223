//! Memory-snapshot checkpoint and restore. Only exercised when the function
//! descriptor carries a `checkpoint_id`; everything else in the pipeline is
//! indifferent to whether a checkpoint ever happens.

use crate::context::GlobalState;
use crate::errors::{CoreError, CoreResult};
use icm_rpc::RpcClient;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const RESTORE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// GPU memory checkpointing is hardware- and driver-specific and out of
/// scope here; it is stubbed behind this trait so the coordinator's sequence
/// matches the host's regardless of what backs it.
pub trait GpuCheckpointer: Send + Sync {
    fn checkpoint(&self) -> Result<(), String>;
    fn restore(&self) -> Result<(), String>;
}

pub struct NoopGpuCheckpointer;

impl GpuCheckpointer for NoopGpuCheckpointer {
    fn checkpoint(&self) -> Result<(), String> {
        Ok(())
    }

    fn restore(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Everything read back out of the restore state file, beyond the fields the
/// coordinator consumes directly. Handed to the caller so it can apply
/// config overrides however it sees fit.
#[derive(Debug, Default, PartialEq)]
pub struct RestoreOutcome {
    pub task_id: Option<String>,
    pub function_id: Option<String>,
    pub overrides: HashMap<String, String>,
    pub debug_pause: bool,
}

/// Coordinates the snapshot/restore handshake for one checkpointed task.
/// Owns the mutable `task_id`/`function_id` the restore step is allowed to
/// rewrite, since `ContainerConfig` itself is immutable by design.
pub struct CheckpointCoordinator {
    state: Arc<GlobalState>,
    restore_state_path: PathBuf,
    gpu: Arc<dyn GpuCheckpointer>,
    task_id: RwLock<String>,
    function_id: RwLock<String>,
}

impl CheckpointCoordinator {
    pub fn new(
        state: Arc<GlobalState>,
        restore_state_path: PathBuf,
        task_id: String,
        function_id: String,
        gpu: Arc<dyn GpuCheckpointer>,
    ) -> Self {
        Self {
            state,
            restore_state_path,
            gpu,
            task_id: RwLock::new(task_id),
            function_id: RwLock::new(function_id),
        }
    }

    pub fn task_id(&self) -> String {
        self.task_id.read().clone()
    }

    pub fn function_id(&self) -> String {
        self.function_id.read().clone()
    }

    /// Runs the full snapshot/restore handshake. `rpc` is the live client
    /// to issue the `Checkpoint` RPC on; `rebuild_client` is called after
    /// restore to produce a fresh client against the refreshed environment
    /// (a new task may run against a different input plane endpoint).
    pub async fn snapshot(
        &self,
        checkpoint_id: &str,
        gpu_snapshot_enabled: bool,
        rpc: Arc<dyn RpcClient>,
        rebuild_client: impl FnOnce() -> Arc<dyn RpcClient>,
    ) -> CoreResult<Arc<dyn RpcClient>> {
        if gpu_snapshot_enabled {
            self.gpu.checkpoint().map_err(CoreError::GpuCheckpoint)?;
        }

        self.state.set_waiting_for_memory_snapshot(true);
        info!(checkpoint_id, "issuing checkpoint, pausing input delivery");
        rpc.checkpoint(checkpoint_id).await?;

        // The client above is about to be replaced; drop our handle to it
        // before restore runs so nothing holds the pre-snapshot connection.
        drop(rpc);

        let outcome = self.restore().await?;
        self.apply_restore_outcome(&outcome);

        let fresh = rebuild_client();

        if gpu_snapshot_enabled {
            self.gpu.restore().map_err(CoreError::GpuCheckpoint)?;
        }

        self.state.set_waiting_for_memory_snapshot(false);
        info!("restore complete, resuming input delivery");
        Ok(fresh)
    }

    /// Busy-waits for the restore state file to appear, then parses it.
    async fn restore(&self) -> CoreResult<RestoreOutcome> {
        loop {
            match tokio::fs::try_exists(&self.restore_state_path).await {
                Ok(true) => break,
                Ok(false) => tokio::time::sleep(RESTORE_POLL_INTERVAL).await,
                Err(e) => {
                    warn!(error = %e, path = %self.restore_state_path.display(), "error polling for restore state file");
                    tokio::time::sleep(RESTORE_POLL_INTERVAL).await;
                }
            }
        }

        let contents = tokio::fs::read_to_string(&self.restore_state_path).await?;
        let mapping: HashMap<String, String> = serde_json::from_str(&contents)?;
        Ok(Self::parse_restore_mapping(mapping))
    }

    fn parse_restore_mapping(mut mapping: HashMap<String, String>) -> RestoreOutcome {
        let debug_pause = mapping
            .remove("snapshot_debug")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let task_id = mapping.remove("task_id").filter(|v| !v.is_empty());
        let function_id = mapping.remove("function_id").filter(|v| !v.is_empty());
        mapping.retain(|_, v| !v.is_empty());

        RestoreOutcome { task_id, function_id, overrides: mapping, debug_pause }
    }

    fn apply_restore_outcome(&self, outcome: &RestoreOutcome) {
        if outcome.debug_pause {
            debug!("snapshot_debug set in restore state, pausing for inspection instead of applying overrides");
            return;
        }

        if let Some(task_id) = &outcome.task_id {
            *self.task_id.write() = task_id.clone();
        }
        if let Some(function_id) = &outcome.function_id {
            *self.function_id.write() = function_id.clone();
        }
        for (key, value) in &outcome.overrides {
            std::env::set_var(key, value);
        }

        self.state.current_inputs.clear();
    }
}
