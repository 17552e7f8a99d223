//! In-memory `RpcClient`/`BlobStore` stand-ins for integration tests.

use crate::client::RpcClient;
use crate::blob::BlobStore;
use crate::error::RpcError;
use crate::model::*;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Mutex as AsyncMutex;

/// Scripted control-plane fake: inputs and cancel events are queued up
/// front, outputs and task results are recorded for assertions.
pub struct FakeRpcClient {
    pending_inputs: AsyncMutex<VecDeque<Vec<icm_common::InputRecord>>>,
    pending_cancels: AsyncMutex<VecDeque<Vec<String>>>,
    pub pushed_outputs: Mutex<Vec<PutOutputsItemRequest>>,
    pub task_results: Mutex<Vec<TaskResultRequest>>,
    pub checkpoints: Mutex<Vec<String>>,
    pub dynamic_concurrency: Mutex<u32>,
}

impl FakeRpcClient {
    pub fn new() -> Self {
        Self {
            pending_inputs: AsyncMutex::new(VecDeque::new()),
            pending_cancels: AsyncMutex::new(VecDeque::new()),
            pushed_outputs: Mutex::new(Vec::new()),
            task_results: Mutex::new(Vec::new()),
            checkpoints: Mutex::new(Vec::new()),
            dynamic_concurrency: Mutex::new(1),
        }
    }

    pub async fn enqueue_inputs(&self, batch: Vec<icm_common::InputRecord>) {
        self.pending_inputs.lock().await.push_back(batch);
    }

    pub async fn enqueue_cancel(&self, input_ids: Vec<String>) {
        self.pending_cancels.lock().await.push_back(input_ids);
    }
}

impl Default for FakeRpcClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RpcClient for FakeRpcClient {
    async fn hello(&self) -> Result<(), RpcError> {
        Ok(())
    }

    async fn get_inputs(
        &self,
        _req: GetInputsRequest,
    ) -> Result<GetInputsResponse, RpcError> {
        let inputs = self.pending_inputs.lock().await.pop_front().unwrap_or_default();
        Ok(GetInputsResponse { inputs, rate_limit_sleep_duration_ms: None })
    }

    async fn put_outputs(&self, req: PutOutputsRequest) -> Result<(), RpcError> {
        self.pushed_outputs.lock().unwrap().extend(req.outputs);
        Ok(())
    }

    async fn heartbeat(&self, _req: HeartbeatRequest) -> Result<HeartbeatResponse, RpcError> {
        let cancel = self.pending_cancels.lock().await.pop_front();
        Ok(HeartbeatResponse {
            cancel_input_event: cancel.map(|input_ids| CancelInputEvent { input_ids }),
        })
    }

    async fn get_dynamic_concurrency(
        &self,
        _req: GetDynamicConcurrencyRequest,
    ) -> Result<GetDynamicConcurrencyResponse, RpcError> {
        Ok(GetDynamicConcurrencyResponse { concurrency: *self.dynamic_concurrency.lock().unwrap() })
    }

    async fn checkpoint(&self, checkpoint_id: &str) -> Result<(), RpcError> {
        self.checkpoints.lock().unwrap().push(checkpoint_id.to_string());
        Ok(())
    }

    async fn task_result(&self, req: TaskResultRequest) -> Result<(), RpcError> {
        self.task_results.lock().unwrap().push(req);
        Ok(())
    }

    async fn stream_function_call_data(
        &self,
        _function_call_id: &str,
        _direction: DataDirection,
    ) -> Result<Vec<FunctionCallDataChunk>, RpcError> {
        Ok(Vec::new())
    }

    async fn put_function_call_data(
        &self,
        _req: PutFunctionCallDataRequest,
    ) -> Result<(), RpcError> {
        Ok(())
    }
}

/// In-memory blob store keyed by a counter, for tests that exercise the
/// oversize-payload path without a real object store.
#[derive(Default)]
pub struct FakeBlobStore {
    blobs: Mutex<Vec<Vec<u8>>>,
}

impl FakeBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for FakeBlobStore {
    async fn upload(&self, bytes: Vec<u8>) -> Result<String, RpcError> {
        let mut blobs = self.blobs.lock().unwrap();
        blobs.push(bytes);
        Ok(format!("blob-{}", blobs.len() - 1))
    }

    async fn download(&self, handle: &str) -> Result<Vec<u8>, RpcError> {
        let idx: usize = handle
            .strip_prefix("blob-")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| RpcError::BlobNotFound(handle.to_string()))?;
        self.blobs
            .lock()
            .unwrap()
            .get(idx)
            .cloned()
            .ok_or_else(|| RpcError::BlobNotFound(handle.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_blob_store_round_trips() {
        let store = FakeBlobStore::new();
        let handle = store.upload(vec![1, 2, 3]).await.unwrap();
        let back = store.download(&handle).await.unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn fake_blob_store_missing_handle_errors() {
        let store = FakeBlobStore::new();
        let err = store.download("blob-9").await.unwrap_err();
        assert!(matches!(err, RpcError::BlobNotFound(_)));
    }

    #[tokio::test]
    async fn fake_rpc_client_returns_queued_inputs() {
        let client = FakeRpcClient::new();
        client
            .enqueue_inputs(vec![icm_common::InputRecord {
                input_id: "in-1".into(),
                retry_count: 0,
                function_call_id: "fc-1".into(),
                method_name: "main".into(),
                args: icm_common::ArgPayload::Inline(vec![]),
                final_input: true,
                kill_switch: false,
            }])
            .await;
        let resp = client
            .get_inputs(GetInputsRequest {
                function_id: "fn-1".into(),
                average_call_time_ms: None,
                target_concurrency: 1,
                batch_max_size: 0,
                batch_linger_ms: 0,
            })
            .await
            .unwrap();
        assert_eq!(resp.inputs.len(), 1);
    }
}
