//! Wire DTOs for the control-plane RPC surface. These are deliberately
//! separate from `icm_common`'s domain types: the wire shapes carry
//! `camelCase` JSON fields and optional/default fields the domain model
//! doesn't need.

use icm_common::codec::DataFormat;
use icm_common::{ArgPayload, GenericResult, InputRecord, ResultStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetInputsRequest {
    pub function_id: String,
    pub average_call_time_ms: Option<f64>,
    pub target_concurrency: u32,
    pub batch_max_size: u32,
    pub batch_linger_ms: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetInputsResponse {
    #[serde(default)]
    pub inputs: Vec<InputRecord>,
    #[serde(default)]
    pub rate_limit_sleep_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PutOutputsItemRequest {
    pub input_id: String,
    pub retry_count: u32,
    pub status: ResultStatus,
    pub input_started_at: chrono::DateTime<chrono::Utc>,
    pub output_created_at: chrono::DateTime<chrono::Utc>,
    pub data_format: DataFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ArgPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl PutOutputsItemRequest {
    pub fn from_result(
        input_id: String,
        retry_count: u32,
        input_started_at: chrono::DateTime<chrono::Utc>,
        result: GenericResult,
    ) -> Self {
        Self {
            input_id,
            retry_count,
            status: result.status,
            input_started_at,
            output_created_at: result.output_created_at,
            data_format: result.data_format,
            data: result.data,
            exception: result.exception,
            traceback: result.traceback,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PutOutputsRequest {
    pub outputs: Vec<PutOutputsItemRequest>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub canceled_inputs_return_outputs_v2: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub cancel_input_event: Option<CancelInputEvent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelInputEvent {
    pub input_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDynamicConcurrencyRequest {
    pub function_id: String,
    pub target_concurrency: u32,
    pub max_concurrency: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDynamicConcurrencyResponse {
    pub concurrency: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResultRequest {
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ArgPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataDirection {
    DataIn,
    DataOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCallDataChunk {
    pub index: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PutFunctionCallDataRequest {
    pub function_call_id: String,
    pub chunks: Vec<FunctionCallDataChunk>,
}
