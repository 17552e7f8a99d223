//! Process-wide singleton wiring the fetcher, executor, and output stages
//! into one pipeline, and exposing the lifecycle operations `main` drives.

use crate::checkpoint::CheckpointCoordinator;
use crate::context::GlobalState;
use crate::errors::CoreResult;
use crate::executor::Executor;
use crate::fetcher::InputFetcher;
use crate::function::FunctionLoader;
use crate::generator_sink::GeneratorSink;
use crate::heartbeat::HeartbeatLoop;
use crate::output::OutputPusher;
use crate::semaphore::ConcurrencySemaphore;
use icm_common::codec::Codec;
use icm_common::ContainerConfig;
use icm_rpc::{BlobStore, RpcClient};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

static INSTANCE: OnceLock<Arc<ContainerManager>> = OnceLock::new();

/// Owns the concurrency slot, the current-inputs table, and the wiring
/// between the fetch/execute/push stages. One instance per process; reset
/// only between tests.
pub struct ContainerManager {
    config: ContainerConfig,
    state: Arc<GlobalState>,
    semaphore: Arc<ConcurrencySemaphore>,
    rpc: RwLock<Arc<dyn RpcClient>>,
    blobs: Arc<dyn BlobStore>,
    loader: Arc<dyn FunctionLoader>,
    codec: Arc<dyn Codec>,
    checkpoint: Option<Arc<CheckpointCoordinator>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    override_tx: watch::Sender<Option<u32>>,
    override_rx: watch::Receiver<Option<u32>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ContainerManager {
    pub fn new(
        config: ContainerConfig,
        rpc: Arc<dyn RpcClient>,
        blobs: Arc<dyn BlobStore>,
        loader: Arc<dyn FunctionLoader>,
        codec: Arc<dyn Codec>,
    ) -> Arc<Self> {
        let state = Arc::new(GlobalState::new());
        let semaphore = Arc::new(ConcurrencySemaphore::new(config.function.target_concurrency));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (override_tx, override_rx) = watch::channel(None);

        let checkpoint = config.function.checkpoint_id.as_ref().map(|_| {
            Arc::new(CheckpointCoordinator::new(
                state.clone(),
                config.restore_state_path.clone(),
                config.task_id.clone(),
                config.function_id.clone(),
                Arc::new(crate::checkpoint::NoopGpuCheckpointer),
            ))
        });

        Arc::new(Self {
            config,
            state,
            semaphore,
            rpc: RwLock::new(rpc),
            blobs,
            loader,
            codec,
            checkpoint,
            shutdown_tx,
            shutdown_rx,
            override_tx,
            override_rx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Installs this instance as the process-wide singleton. Panics if one
    /// is already installed; call exactly once at container startup.
    pub fn install(manager: Arc<Self>) {
        INSTANCE.set(manager).ok().expect("ContainerManager already installed");
    }

    pub fn global() -> Arc<Self> {
        INSTANCE.get().expect("ContainerManager not installed").clone()
    }

    pub fn state(&self) -> Arc<GlobalState> {
        self.state.clone()
    }

    pub fn semaphore(&self) -> Arc<ConcurrencySemaphore> {
        self.semaphore.clone()
    }

    pub fn checkpoint_coordinator(&self) -> Option<Arc<CheckpointCoordinator>> {
        self.checkpoint.clone()
    }

    fn rpc(&self) -> Arc<dyn RpcClient> {
        self.rpc.read().clone()
    }

    /// Spawns the fetch/execute/push pipeline plus the heartbeat and
    /// (if the function descriptor calls for it) dynamic concurrency loops.
    pub fn start(self: &Arc<Self>) {
        let (tx, mut rx) = mpsc::channel(1);

        let fetcher = InputFetcher::new(
            self.config.clone(),
            self.state.clone(),
            self.semaphore.clone(),
            self.rpc(),
            self.blobs.clone(),
        );
        let fetcher_handle = tokio::spawn(async move { fetcher.run(tx).await });

        let sink = Arc::new(GeneratorSink::new(self.rpc(), self.blobs.clone(), self.codec.clone()));
        let executor = Arc::new(Executor::new(self.loader.clone(), self.codec.clone(), self.blobs.clone(), sink));
        let pusher = Arc::new(OutputPusher::new(
            self.rpc(),
            self.state.clone(),
            self.semaphore.clone(),
            self.config.function_id.clone(),
        ));
        let pipeline_handle = tokio::spawn(async move {
            while let Some(ctx) = rx.recv().await {
                let results = executor.execute(ctx.clone()).await;
                pusher.push(ctx, results).await;
            }
        });

        let heartbeat = HeartbeatLoop::new(self.state.clone(), self.rpc(), self.config.function_id.clone());
        let heartbeat_shutdown = self.shutdown_rx.clone();
        let heartbeat_handle = tokio::spawn(async move { heartbeat.run(heartbeat_shutdown).await });

        let cc_loop = crate::concurrency_control::ConcurrencyControlLoop::new(
            self.config.function_id.clone(),
            self.config.function.target_concurrency,
            self.config.function.max_concurrency,
            self.semaphore.clone(),
            self.rpc(),
        );
        let cc_shutdown = self.shutdown_rx.clone();
        let cc_override = self.override_rx.clone();
        let cc_handle = tokio::spawn(async move { cc_loop.run(cc_shutdown, cc_override).await });

        let mut tasks = self.tasks.lock();
        tasks.push(fetcher_handle);
        tasks.push(pipeline_handle);
        tasks.push(heartbeat_handle);
        tasks.push(cc_handle);
        info!(function_id = %self.config.function_id, "container manager pipeline started");
    }

    /// Enters the draining state: outstanding executions complete, but no
    /// new batches are fetched.
    pub fn stop_fetching_inputs(&self) {
        self.state.fetching_inputs.store(false, Ordering::SeqCst);
    }

    pub fn set_input_concurrency(&self, concurrency: u32) {
        self.semaphore.set_capacity(concurrency);
        crate::metrics::set_slots_capacity(&self.config.function_id, concurrency);
        let _ = self.override_tx.send(Some(concurrency));
    }

    /// Runs the checkpoint/restore handshake and swaps in the client it
    /// returns. No-op if this function was not started with a checkpoint id.
    pub async fn run_checkpoint(
        &self,
        rebuild_client: impl FnOnce() -> Arc<dyn RpcClient>,
    ) -> CoreResult<()> {
        let Some(checkpoint) = &self.checkpoint else {
            return Ok(());
        };
        let Some(checkpoint_id) = &self.config.function.checkpoint_id else {
            return Ok(());
        };

        let current = self.rpc();
        let fresh = checkpoint
            .snapshot(checkpoint_id, self.config.function.gpu_snapshot_enabled, current, rebuild_client)
            .await?;
        *self.rpc.write() = fresh;
        Ok(())
    }

    /// Stops fetching, signals every loop to exit, and waits for them to
    /// drain.
    pub async fn shutdown(&self) {
        self.stop_fetching_inputs();
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!(function_id = %self.config.function_id, "container manager shut down");
    }
}
