//! Buckets a failed or cancelled execution into the result shape the output
//! pusher and the lifecycle reporter expect.

use icm_common::{truncate_exception_repr, ArgPayload, GenericResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureBucket {
    Terminated,
    UserFailure,
    LifecycleFailure,
}

/// Produces the `GENERIC_STATUS_TERMINATED` result for a cancelled input.
/// No traceback is logged: the cancellation was requested, not thrown.
pub fn terminated() -> GenericResult {
    GenericResult::terminated()
}

/// Produces the `GENERIC_STATUS_FAILURE` result for a single input's user
/// exception. The exception repr is truncated if it would blow the object
/// size budget; the traceback is kept in full.
pub fn user_failure(exception_repr: &str, traceback: &str) -> GenericResult {
    GenericResult::failure(truncate_exception_repr(exception_repr), traceback.to_string(), None)
}

/// A single structured failure broadcast to every input in a batch that
/// violated the batched-call invariant (wrong arg count, unknown keyword,
/// duplicate keyword, or a return value of the wrong length).
pub fn batch_invariant_violation(message: &str, batch_size: usize) -> Vec<GenericResult> {
    (0..batch_size)
        .map(|_| GenericResult::failure(message.to_string(), String::new(), None))
        .collect()
}

/// Wraps a value that itself failed to serialize. The repr of the original
/// error is preserved so the caller isn't left with nothing.
pub fn serialization_failure(original_repr: &str) -> GenericResult {
    GenericResult::failure(
        format!("SerializationError: {}", truncate_exception_repr(original_repr)),
        String::new(),
        None,
    )
}

pub fn success(data: ArgPayload) -> GenericResult {
    GenericResult::success(data)
}
