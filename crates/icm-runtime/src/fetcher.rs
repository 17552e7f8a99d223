//! Pulls inputs from the control plane, respecting slots and batching, and
//! emits hydrated `IoContext` values onto the pipeline channel.

use crate::context::{CallArgs, GlobalState, IoContext};
use crate::semaphore::ConcurrencySemaphore;
use icm_common::{ArgPayload, ContainerConfig};
use icm_rpc::model::GetInputsRequest;
use icm_rpc::{BlobStore, RpcClient};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct InputFetcher {
    config: ContainerConfig,
    state: Arc<GlobalState>,
    semaphore: Arc<ConcurrencySemaphore>,
    rpc: Arc<dyn RpcClient>,
    blobs: Arc<dyn BlobStore>,
}

impl InputFetcher {
    pub fn new(
        config: ContainerConfig,
        state: Arc<GlobalState>,
        semaphore: Arc<ConcurrencySemaphore>,
        rpc: Arc<dyn RpcClient>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self { config, state, semaphore, rpc, blobs }
    }

    /// Runs until the kill switch, `final_input`, one-shot exhaustion, or
    /// `fetching_inputs` flips false. Closes the semaphore on the way out so
    /// outstanding work can drain before the pipeline shuts down.
    pub async fn run(&self, tx: mpsc::Sender<Arc<IoContext>>) {
        let one_shot = self.config.function.is_one_shot();

        loop {
            if !self.state.fetching_inputs.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }

            if let Err(e) = self.semaphore.acquire().await {
                debug!(error = %e, "fetcher stopping: semaphore closed");
                break;
            }

            match self.fetch_one_batch().await {
                Ok(Some((ctx, stop_after))) => {
                    self.state.register(ctx.clone());
                    if tx.send(ctx).await.is_err() {
                        warn!("pipeline receiver dropped, stopping fetcher");
                        self.semaphore.release();
                        break;
                    }
                    if stop_after || one_shot {
                        break;
                    }
                }
                Ok(None) => {
                    // rate-limited or kill switch: release the slot we took.
                    self.semaphore.release();
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "get_inputs failed, releasing slot and retrying");
                    self.semaphore.release();
                }
            }
        }

        self.semaphore.close().await;
        info!("input fetcher drained and exited");
    }

    /// Returns `Ok(Some((ctx, stop_after)))` on a yielded batch,
    /// `Ok(None)` if the fetcher should stop without yielding (kill switch
    /// or rate limit), or `Err` on a transport failure.
    async fn fetch_one_batch(&self) -> Result<Option<(Arc<IoContext>, bool)>, icm_rpc::RpcError> {
        let req = GetInputsRequest {
            function_id: self.config.function_id.clone(),
            average_call_time_ms: Some(self.state.average_call_time_ms()),
            target_concurrency: self.semaphore.current_concurrency(),
            batch_max_size: self.config.function.batch_max_size,
            batch_linger_ms: self.config.function.batch_linger_ms,
        };

        let started_at = std::time::Instant::now();
        let resp = self.rpc.get_inputs(req).await?;
        crate::metrics::record_fetch_latency(&self.config.function_id, started_at.elapsed());

        if let Some(sleep_ms) = resp.rate_limit_sleep_duration_ms {
            debug!(sleep_ms, "rate limited by control plane");
            tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
            return Ok(None);
        }

        if resp.inputs.iter().any(|i| i.kill_switch) {
            info!("kill switch received, stopping fetcher");
            self.state.fetching_inputs.store(false, std::sync::atomic::Ordering::SeqCst);
            return Ok(None);
        }

        if resp.inputs.is_empty() {
            return Ok(None);
        }

        let method_name = resp.inputs[0].method_name.clone();
        debug_assert!(
            resp.inputs.iter().all(|i| i.method_name == method_name),
            "a fetched batch must share one method name"
        );

        let stop_after = resp.inputs.iter().any(|i| i.final_input);

        let mut input_ids = Vec::with_capacity(resp.inputs.len());
        let mut retry_counts = Vec::with_capacity(resp.inputs.len());
        let mut function_call_ids = Vec::with_capacity(resp.inputs.len());
        let mut values = Vec::with_capacity(resp.inputs.len());

        for input in resp.inputs {
            let bytes = match input.args {
                ArgPayload::Inline(bytes) => bytes,
                ArgPayload::Blob(handle) => self.blobs.download(&handle).await?,
            };
            let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
            input_ids.push(input.input_id);
            retry_counts.push(input.retry_count);
            function_call_ids.push(input.function_call_id);
            values.push(value);
        }

        let args = if values.len() == 1 {
            CallArgs::Single(values.into_iter().next().expect("single-element check above"))
        } else {
            CallArgs::Batched(values)
        };

        crate::metrics::record_input_fetched(&self.config.function_id, input_ids.len());
        crate::metrics::set_slots_in_use(&self.config.function_id, self.semaphore.active());

        let ctx = Arc::new(IoContext::new(input_ids, retry_counts, function_call_ids, method_name, args));
        Ok(Some((ctx, stop_after)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use icm_common::FunctionDescriptor;
    use icm_common::FunctionShape;
    use icm_rpc::fake::{FakeBlobStore, FakeRpcClient};
    use std::path::PathBuf;

    fn test_config(max_inputs: u32) -> ContainerConfig {
        ContainerConfig {
            task_id: "tk-1".into(),
            function_id: "fn-1".into(),
            app_id: "ap-1".into(),
            function: FunctionDescriptor {
                function_id: "fn-1".into(),
                method_name: "main".into(),
                shape: FunctionShape::Sync,
                param_names: vec!["x".into()],
                target_concurrency: 1,
                max_concurrency: 1,
                batch_max_size: 0,
                batch_linger_ms: 0,
                max_inputs,
                is_pty: false,
                checkpoint_id: None,
                gpu_snapshot_enabled: false,
            },
            input_plane_endpoint: None,
            restore_state_path: PathBuf::from("/tmp/restore.json"),
        }
    }

    fn sample_input(id: &str, value: i64) -> icm_common::InputRecord {
        icm_common::InputRecord {
            input_id: id.into(),
            retry_count: 0,
            function_call_id: "fc-1".into(),
            method_name: "main".into(),
            args: ArgPayload::Inline(serde_json::to_vec(&serde_json::json!(value)).unwrap()),
            final_input: false,
            kill_switch: false,
        }
    }

    #[tokio::test]
    async fn one_shot_stops_after_first_batch_regardless_of_final_input() {
        let config = test_config(1);
        let state = Arc::new(GlobalState::new());
        let semaphore = Arc::new(ConcurrencySemaphore::new(1));
        let rpc = Arc::new(FakeRpcClient::new());
        let blobs = Arc::new(FakeBlobStore::new());

        rpc.enqueue_inputs(vec![sample_input("in-1", 42)]).await;
        rpc.enqueue_inputs(vec![sample_input("in-2", 99)]).await;

        let fetcher = InputFetcher::new(config, state, semaphore, rpc, blobs);
        let (tx, mut rx) = mpsc::channel(1);
        fetcher.run(tx).await;

        let mut received = Vec::new();
        while let Some(ctx) = rx.recv().await {
            received.push(ctx);
        }
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].input_ids, vec!["in-1".to_string()]);
    }

    #[tokio::test]
    async fn kill_switch_stops_fetcher_and_releases_slot() {
        let config = test_config(0);
        let state = Arc::new(GlobalState::new());
        let semaphore = Arc::new(ConcurrencySemaphore::new(1));
        let rpc = Arc::new(FakeRpcClient::new());
        let blobs = Arc::new(FakeBlobStore::new());

        rpc.enqueue_inputs(vec![icm_common::InputRecord {
            kill_switch: true,
            ..sample_input("in-1", 1)
        }])
        .await;

        let fetcher = InputFetcher::new(config, state.clone(), semaphore.clone(), rpc, blobs);
        let (tx, mut rx) = mpsc::channel(1);
        fetcher.run(tx).await;

        assert!(rx.recv().await.is_none());
        assert_eq!(semaphore.active(), 0);
        assert!(!state.fetching_inputs.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn blob_backed_args_are_hydrated_before_yielding() {
        let config = test_config(1);
        let state = Arc::new(GlobalState::new());
        let semaphore = Arc::new(ConcurrencySemaphore::new(1));
        let rpc = Arc::new(FakeRpcClient::new());
        let blobs = Arc::new(FakeBlobStore::new());

        let handle = blobs.upload(serde_json::to_vec(&serde_json::json!(7)).unwrap()).await.unwrap();
        rpc.enqueue_inputs(vec![icm_common::InputRecord {
            args: ArgPayload::Blob(handle),
            ..sample_input("in-1", 0)
        }])
        .await;

        let fetcher = InputFetcher::new(config, state, semaphore, rpc, blobs);
        let (tx, mut rx) = mpsc::channel(1);
        fetcher.run(tx).await;

        let ctx = rx.recv().await.unwrap();
        match &ctx.args {
            CallArgs::Single(v) => assert_eq!(v, &serde_json::json!(7)),
            _ => panic!("expected single-arg context"),
        }
    }
}
