//! Environment-variable driven configuration loading.
//!
//! Mirrors the host platform's pattern of reading `std::env::var` with an
//! explicit fallback at every call site rather than a declarative config
//! struct crate — there is exactly one place this config is built
//! (container startup), so a parser/validator layer would be overhead.

use crate::{ContainerConfig, FunctionDescriptor, FunctionShape};
use std::path::PathBuf;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_shape(key: &str, default: FunctionShape) -> FunctionShape {
    match std::env::var(key).ok().as_deref() {
        Some("async") => FunctionShape::Async,
        Some("generator") => FunctionShape::Generator,
        Some("async_generator") => FunctionShape::AsyncGenerator,
        Some("web") => FunctionShape::Web,
        Some("batched") => FunctionShape::Batched,
        Some("sync") => FunctionShape::Sync,
        _ => default,
    }
}

/// Build a `ContainerConfig` from the process environment. Panics only on
/// startup (in `main`), never deep inside the runtime.
pub fn load_from_env() -> ContainerConfig {
    let task_id = env_string_or("ICM_TASK_ID", "tk-dev");
    let function_id = env_string_or("ICM_FUNCTION_ID", "fn-dev");
    let app_id = env_string_or("ICM_APP_ID", "ap-dev");

    let max_concurrency: u32 = env_or("ICM_MAX_CONCURRENCY", 1);
    let target_concurrency: u32 = env_or("ICM_TARGET_CONCURRENCY", max_concurrency);
    let is_pty = env_or("ICM_PTY", false);

    let (max_concurrency, target_concurrency) = if is_pty {
        (1, 1)
    } else {
        (max_concurrency, target_concurrency)
    };

    let function = FunctionDescriptor {
        function_id: function_id.clone(),
        method_name: env_string_or("ICM_METHOD_NAME", "main"),
        shape: env_shape("ICM_FUNCTION_SHAPE", FunctionShape::Sync),
        param_names: std::env::var("ICM_PARAM_NAMES")
            .map(|v| v.split(',').filter(|s| !s.is_empty()).map(String::from).collect())
            .unwrap_or_default(),
        target_concurrency,
        max_concurrency,
        batch_max_size: env_or("ICM_BATCH_MAX_SIZE", 0),
        batch_linger_ms: env_or("ICM_BATCH_LINGER_MS", 0),
        max_inputs: env_or("ICM_MAX_INPUTS", 0),
        is_pty,
        checkpoint_id: std::env::var("ICM_CHECKPOINT_ID").ok().filter(|s| !s.is_empty()),
        gpu_snapshot_enabled: env_or("ICM_GPU_SNAPSHOT", false),
    };

    ContainerConfig {
        task_id,
        function_id,
        app_id,
        function,
        input_plane_endpoint: std::env::var("ICM_INPUT_PLANE_URL").ok().filter(|s| !s.is_empty()),
        restore_state_path: PathBuf::from(env_string_or(
            "ICM_RESTORE_STATE_PATH",
            "/__icm/restore-state.json",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // env::set_var is process-global; serialize the tests that touch it.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn pty_forces_concurrency_to_one() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("ICM_PTY", "true");
        std::env::set_var("ICM_MAX_CONCURRENCY", "20");
        let cfg = load_from_env();
        assert_eq!(cfg.function.max_concurrency, 1);
        assert_eq!(cfg.function.target_concurrency, 1);
        std::env::remove_var("ICM_PTY");
        std::env::remove_var("ICM_MAX_CONCURRENCY");
    }

    #[test]
    fn defaults_are_sane_without_any_env() {
        let _guard = ENV_LOCK.lock().unwrap();
        for key in [
            "ICM_TASK_ID", "ICM_FUNCTION_ID", "ICM_APP_ID", "ICM_MAX_CONCURRENCY",
            "ICM_TARGET_CONCURRENCY", "ICM_PTY",
        ] {
            std::env::remove_var(key);
        }
        let cfg = load_from_env();
        assert_eq!(cfg.function.max_concurrency, 1);
        assert_eq!(cfg.function.target_concurrency, 1);
    }
}
