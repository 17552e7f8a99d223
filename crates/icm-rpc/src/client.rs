//! Control-plane RPC client.
//!
//! `RpcClient` is the seam the runtime depends on; `HttpRpcClient` is a
//! concrete implementation speaking JSON-over-HTTP to the input plane,
//! retrying transient failures the way the host platform's config sync
//! client does (bounded attempts, fixed delay, logged on every retry).

use crate::error::RpcError;
use crate::model::*;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn hello(&self) -> Result<(), RpcError>;

    async fn get_inputs(
        &self,
        req: GetInputsRequest,
    ) -> Result<GetInputsResponse, RpcError>;

    /// Retries indefinitely on transient and resource-exhausted errors; the
    /// caller (the output pusher) never sees those variants out of this call.
    async fn put_outputs(&self, req: PutOutputsRequest) -> Result<(), RpcError>;

    async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse, RpcError>;

    async fn get_dynamic_concurrency(
        &self,
        req: GetDynamicConcurrencyRequest,
    ) -> Result<GetDynamicConcurrencyResponse, RpcError>;

    async fn checkpoint(&self, checkpoint_id: &str) -> Result<(), RpcError>;

    async fn task_result(&self, req: TaskResultRequest) -> Result<(), RpcError>;

    async fn stream_function_call_data(
        &self,
        function_call_id: &str,
        direction: DataDirection,
    ) -> Result<Vec<FunctionCallDataChunk>, RpcError>;

    async fn put_function_call_data(
        &self,
        req: PutFunctionCallDataRequest,
    ) -> Result<(), RpcError>;
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryConfig {
    pub fn bounded() -> Self {
        Self { max_attempts: 5, delay: Duration::from_millis(500) }
    }

    pub fn unbounded() -> Self {
        Self { max_attempts: u32::MAX, delay: Duration::from_secs(1) }
    }
}

pub struct HttpRpcClient {
    http: reqwest::Client,
    base_url: String,
    bounded: RetryConfig,
    unbounded: RetryConfig,
}

impl HttpRpcClient {
    pub fn new(base_url: String, request_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("failed to build RPC http client");
        Self {
            http,
            base_url,
            bounded: RetryConfig::bounded(),
            unbounded: RetryConfig::unbounded(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json<Req: serde::Serialize + Sync, Resp: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
        retry: &RetryConfig,
    ) -> Result<Resp, RpcError> {
        let mut last_err = None;
        for attempt in 1..=retry.max_attempts {
            match self.post_once(path, body).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                    warn!(
                        attempt,
                        max_attempts = retry.max_attempts,
                        path,
                        error = %e,
                        "rpc call failed, retrying"
                    );
                    last_err = Some(e);
                    tokio::time::sleep(retry.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.expect("loop runs at least once"))
    }

    async fn post_once<Req: serde::Serialize + Sync, Resp: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp, RpcError> {
        debug!(path, "sending rpc request");
        let response = self.http.post(self.url(path)).json(body).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get("retry-after-ms")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000);
            return Err(RpcError::RateLimited { retry_after_ms });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status == reqwest::StatusCode::INSUFFICIENT_STORAGE {
                return Err(RpcError::ResourceExhausted(body));
            }
            return Err(RpcError::Status { status: status.as_u16(), body });
        }
        Ok(response.json::<Resp>().await?)
    }
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    async fn hello(&self) -> Result<(), RpcError> {
        self.post_once("/hello", &()).await
    }

    async fn get_inputs(
        &self,
        req: GetInputsRequest,
    ) -> Result<GetInputsResponse, RpcError> {
        self.post_json("/get_inputs", &req, &self.bounded).await
    }

    async fn put_outputs(&self, req: PutOutputsRequest) -> Result<(), RpcError> {
        self.post_json("/put_outputs", &req, &self.unbounded).await
    }

    async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse, RpcError> {
        self.post_json("/heartbeat", &req, &self.bounded).await
    }

    async fn get_dynamic_concurrency(
        &self,
        req: GetDynamicConcurrencyRequest,
    ) -> Result<GetDynamicConcurrencyResponse, RpcError> {
        self.post_json("/get_dynamic_concurrency", &req, &self.bounded).await
    }

    async fn checkpoint(&self, checkpoint_id: &str) -> Result<(), RpcError> {
        self.post_json(
            "/checkpoint",
            &serde_json::json!({ "checkpointId": checkpoint_id }),
            &self.bounded,
        )
        .await
    }

    async fn task_result(&self, req: TaskResultRequest) -> Result<(), RpcError> {
        self.post_json("/task_result", &req, &self.bounded).await
    }

    async fn stream_function_call_data(
        &self,
        function_call_id: &str,
        direction: DataDirection,
    ) -> Result<Vec<FunctionCallDataChunk>, RpcError> {
        self.post_json(
            "/function_call_data_stream",
            &serde_json::json!({ "functionCallId": function_call_id, "direction": direction }),
            &self.bounded,
        )
        .await
    }

    async fn put_function_call_data(
        &self,
        req: PutFunctionCallDataRequest,
    ) -> Result<(), RpcError> {
        self.post_json("/put_function_call_data", &req, &self.unbounded).await
    }
}
