//! Shared types for the in-container I/O manager.
//!
//! This crate holds the data model that is passed between the RPC boundary
//! (`icm-rpc`) and the coordinator (`icm-runtime`): container configuration,
//! input records, result statuses, and the `Codec` trait used to turn user
//! values into bytes. None of this crate depends on a particular transport.

pub mod codec;
pub mod config;
pub mod logging;

use serde::{Deserialize, Serialize};

/// Payloads larger than this must be blob-carried rather than inlined.
/// 16 MiB minus a conservative framing allowance.
pub const MAX_OBJECT_SIZE_BYTES: usize = 16 * 1024 * 1024 - 64 * 1024;

/// Maximum number of items in one `PutOutputs` call.
pub const MAX_OUTPUT_BATCH_SIZE: usize = 20;

// ============================================================================
// Function descriptor
// ============================================================================

/// Which shape of callable a `FinalizedFunction` wraps. A small closed set,
/// modeled as a tagged enum rather than trait-object polymorphism so the
/// executor can switch on it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionShape {
    Sync,
    Async,
    Generator,
    AsyncGenerator,
    Web,
    Batched,
}

impl FunctionShape {
    pub fn is_generator_like(self) -> bool {
        matches!(self, Self::Generator | Self::AsyncGenerator | Self::Web)
    }

    pub fn is_batched(self) -> bool {
        matches!(self, Self::Batched)
    }
}

/// Static description of the function this container was started to serve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub function_id: String,
    pub method_name: String,
    pub shape: FunctionShape,
    /// Declared parameter names, in order. Used to validate and reshape
    /// batched-call arguments.
    pub param_names: Vec<String>,
    pub target_concurrency: u32,
    pub max_concurrency: u32,
    pub batch_max_size: u32,
    pub batch_linger_ms: u32,
    pub max_inputs: u32,
    pub is_pty: bool,
    pub checkpoint_id: Option<String>,
    pub gpu_snapshot_enabled: bool,
}

impl FunctionDescriptor {
    /// See the "one-shot" open question: `max_inputs == 1` stops the fetcher
    /// after its first yielded batch regardless of `final_input`.
    pub fn is_one_shot(&self) -> bool {
        self.max_inputs == 1
    }
}

// ============================================================================
// ContainerConfig
// ============================================================================

/// Immutable configuration built once at container startup. Mutable fields
/// that the restore path updates (`task_id`, `function_id`) live on the
/// runtime's manager, not here, since this struct is meant to be cheaply
/// cloned and passed around.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub task_id: String,
    pub function_id: String,
    pub app_id: String,
    pub function: FunctionDescriptor,
    pub input_plane_endpoint: Option<String>,
    pub restore_state_path: std::path::PathBuf,
}

// ============================================================================
// Input records
// ============================================================================

/// Argument bytes for an input, either inlined or parked in the blob store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ArgPayload {
    Inline(Vec<u8>),
    Blob(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRecord {
    pub input_id: String,
    pub retry_count: u32,
    pub function_call_id: String,
    pub method_name: String,
    pub args: ArgPayload,
    pub final_input: bool,
    pub kill_switch: bool,
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    Success,
    Failure,
    Terminated,
}

impl ResultStatus {
    pub fn as_metric_label(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Terminated => "terminated",
        }
    }
}

/// Outcome of one input's execution, prior to serialization into an RPC
/// `PutOutputsItem`. Carries either the raw output bytes (already serialized
/// by the `Codec`) or failure metadata.
#[derive(Debug, Clone)]
pub struct GenericResult {
    pub status: ResultStatus,
    pub data: Option<ArgPayload>,
    pub exception: Option<String>,
    pub traceback: Option<String>,
    /// The wire format `data` is encoded in. Stamped alongside the result
    /// itself rather than left to the wire layer, since the ordering
    /// guarantee ties it to the moment the result was produced.
    pub data_format: codec::DataFormat,
    /// When this result was produced, not when user code returned — set at
    /// construction time here, which for a success result is after
    /// serialization completes.
    pub output_created_at: chrono::DateTime<chrono::Utc>,
}

impl GenericResult {
    pub fn success(data: ArgPayload) -> Self {
        Self {
            status: ResultStatus::Success,
            data: Some(data),
            exception: None,
            traceback: None,
            data_format: codec::DataFormat::Json,
            output_created_at: chrono::Utc::now(),
        }
    }

    pub fn terminated() -> Self {
        Self {
            status: ResultStatus::Terminated,
            data: None,
            exception: None,
            traceback: None,
            data_format: codec::DataFormat::Json,
            output_created_at: chrono::Utc::now(),
        }
    }

    pub fn failure(exception: String, traceback: String, data: Option<ArgPayload>) -> Self {
        Self {
            status: ResultStatus::Failure,
            data,
            exception: Some(exception),
            traceback: Some(traceback),
            data_format: codec::DataFormat::Json,
            output_created_at: chrono::Utc::now(),
        }
    }
}

/// Truncate an overlong exception repr, matching the host platform's
/// `MAX_OBJECT_SIZE_BYTES - 1000` budget, and note how much was trimmed.
pub fn truncate_exception_repr(repr: &str) -> String {
    let budget = MAX_OBJECT_SIZE_BYTES.saturating_sub(1000);
    if repr.len() <= budget {
        return repr.to_string();
    }
    let trimmed_bytes = repr.len() - budget;
    let mut cut = budget;
    while !repr.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}...\nTrimmed {} bytes from original exception",
        &repr[..cut],
        trimmed_bytes
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_only_for_exactly_one() {
        let mut f = sample_descriptor();
        f.max_inputs = 1;
        assert!(f.is_one_shot());
        f.max_inputs = 2;
        assert!(!f.is_one_shot());
        f.max_inputs = 0;
        assert!(!f.is_one_shot());
    }

    #[test]
    fn truncate_leaves_short_reprs_untouched() {
        let repr = "Exception('boom')".to_string();
        assert_eq!(truncate_exception_repr(&repr), repr);
    }

    #[test]
    fn truncate_trims_and_annotates_long_reprs() {
        let repr = "x".repeat(MAX_OBJECT_SIZE_BYTES + 5000);
        let out = truncate_exception_repr(&repr);
        assert!(out.len() < repr.len());
        assert!(out.contains("Trimmed"));
    }

    fn sample_descriptor() -> FunctionDescriptor {
        FunctionDescriptor {
            function_id: "fn-1".into(),
            method_name: "main".into(),
            shape: FunctionShape::Sync,
            param_names: vec![],
            target_concurrency: 1,
            max_concurrency: 1,
            batch_max_size: 0,
            batch_linger_ms: 0,
            max_inputs: 0,
            is_pty: false,
            checkpoint_id: None,
            gpu_snapshot_enabled: false,
        }
    }
}
