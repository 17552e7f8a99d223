//! Pushes completed results back to the control plane and retires the
//! owning `IoContext`.

use crate::context::{GlobalState, IoContext};
use crate::semaphore::ConcurrencySemaphore;
use icm_common::{GenericResult, MAX_OUTPUT_BATCH_SIZE};
use icm_rpc::model::{PutOutputsItemRequest, PutOutputsRequest};
use icm_rpc::RpcClient;
use std::sync::Arc;
use tracing::{error, warn};

pub struct OutputPusher {
    rpc: Arc<dyn RpcClient>,
    state: Arc<GlobalState>,
    semaphore: Arc<ConcurrencySemaphore>,
    function_id: String,
}

impl OutputPusher {
    pub fn new(
        rpc: Arc<dyn RpcClient>,
        state: Arc<GlobalState>,
        semaphore: Arc<ConcurrencySemaphore>,
        function_id: String,
    ) -> Self {
        Self { rpc, state, semaphore, function_id }
    }

    /// `results` must have one entry per input id in `ctx`, in the same
    /// order. Pushes in sub-batches of at most 20 items, then retires the
    /// context exactly once regardless of push outcome.
    pub async fn push(&self, ctx: Arc<IoContext>, results: Vec<GenericResult>) {
        if results.len() != ctx.batch_size() {
            error!(
                expected = ctx.batch_size(),
                got = results.len(),
                "executor produced the wrong number of results for this context, dropping extras"
            );
        }

        for result in &results {
            crate::metrics::record_output_pushed(&self.function_id, result.status.as_metric_label());
        }

        let items: Vec<PutOutputsItemRequest> = ctx
            .input_ids
            .iter()
            .zip(ctx.retry_counts.iter())
            .zip(results.into_iter().chain(std::iter::repeat_with(crate::classify::terminated)))
            .map(|((input_id, retry_count), result)| {
                PutOutputsItemRequest::from_result(
                    input_id.clone(),
                    *retry_count,
                    ctx.started_at_utc,
                    result,
                )
            })
            .collect();

        for sub_batch in items.chunks(MAX_OUTPUT_BATCH_SIZE) {
            if let Err(e) = self.rpc.put_outputs(PutOutputsRequest { outputs: sub_batch.to_vec() }).await {
                warn!(error = %e, count = sub_batch.len(), "put_outputs failed after exhausting retries");
            }
        }

        self.exit_context(&ctx);
    }

    fn exit_context(&self, ctx: &IoContext) {
        let user_time_ms = ctx.started_at.elapsed().as_millis() as u64;
        self.state.record_completion(user_time_ms);
        self.state.deregister(ctx);
        self.semaphore.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CallArgs, IoContext};
    use icm_common::ArgPayload;
    use icm_rpc::fake::FakeRpcClient;

    #[tokio::test]
    async fn push_deregisters_context_and_releases_slot() {
        let state = Arc::new(GlobalState::new());
        let semaphore = Arc::new(ConcurrencySemaphore::new(1));
        semaphore.acquire().await.unwrap();
        let rpc = Arc::new(FakeRpcClient::new());

        let ctx = Arc::new(IoContext::new(
            vec!["in-1".into()],
            vec![0],
            vec!["fc-1".into()],
            "main".into(),
            CallArgs::Single(serde_json::Value::Null),
        ));
        state.register(ctx.clone());

        let pusher = OutputPusher::new(rpc.clone(), state.clone(), semaphore.clone(), "fn-1".into());
        pusher.push(ctx, vec![GenericResult::success(ArgPayload::Inline(vec![1, 2, 3]))]).await;

        assert!(state.lookup("in-1").is_none());
        assert_eq!(semaphore.active(), 0);
        assert_eq!(state.calls_completed.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(rpc.pushed_outputs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn large_batch_is_split_into_sub_batches_of_twenty() {
        let state = Arc::new(GlobalState::new());
        let semaphore = Arc::new(ConcurrencySemaphore::new(1));
        semaphore.acquire().await.unwrap();
        let rpc = Arc::new(FakeRpcClient::new());

        let n = 45;
        let input_ids: Vec<String> = (0..n).map(|i| format!("in-{i}")).collect();
        let retry_counts = vec![0; n];
        let function_call_ids = vec!["fc-1".to_string(); n];
        let ctx = Arc::new(IoContext::new(
            input_ids,
            retry_counts,
            function_call_ids,
            "main".into(),
            CallArgs::Batched(vec![]),
        ));
        state.register(ctx.clone());

        let results: Vec<GenericResult> =
            (0..n).map(|_| GenericResult::success(ArgPayload::Inline(vec![]))).collect();

        let pusher = OutputPusher::new(rpc.clone(), state, semaphore, "fn-1".into());
        pusher.push(ctx, results).await;

        assert_eq!(rpc.pushed_outputs.lock().unwrap().len(), n);
    }
}
