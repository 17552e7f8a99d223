//! Per-input execution context and the process-wide `current_inputs` table.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Notify};

/// Deserialized arguments for the inputs in this context. A batch keeps one
/// raw value per input; the executor reshapes those into parallel
/// parameter-keyed lists once it knows the target function's `param_names`.
#[derive(Debug, Clone)]
pub enum CallArgs {
    Single(serde_json::Value),
    Batched(Vec<serde_json::Value>),
}

pub type CancelHook = Box<dyn FnOnce() + Send + 'static>;

/// One fetched unit of work: a single input, or a batch sharing one method
/// name. Registered in `current_inputs` under every input id it carries.
pub struct IoContext {
    pub input_ids: Vec<String>,
    pub retry_counts: Vec<u32>,
    pub function_call_ids: Vec<String>,
    pub method_name: String,
    pub args: CallArgs,
    pub started_at: Instant,
    /// Wall-clock counterpart of `started_at`, carried on the wire as each
    /// output's `input_started_at`. `Instant` has no epoch to serialize.
    pub started_at_utc: chrono::DateTime<chrono::Utc>,
    cancel_issued: AtomicBool,
    cancel_hook: Mutex<Option<CancelHook>>,
}

impl IoContext {
    pub fn new(
        input_ids: Vec<String>,
        retry_counts: Vec<u32>,
        function_call_ids: Vec<String>,
        method_name: String,
        args: CallArgs,
    ) -> Self {
        Self {
            input_ids,
            retry_counts,
            function_call_ids,
            method_name,
            args,
            started_at: Instant::now(),
            started_at_utc: chrono::Utc::now(),
            cancel_issued: AtomicBool::new(false),
            cancel_hook: Mutex::new(None),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_batched(&self) -> bool {
        self.input_ids.len() > 1
    }

    /// Registers the callback that interrupts the in-flight execution for
    /// this context. If a cancel already landed before attach, the hook is
    /// invoked immediately instead of being dropped silently.
    pub fn set_cancel_hook(&self, hook: CancelHook) {
        if self.cancel_issued.load(Ordering::SeqCst) {
            tracing::warn!(
                input_ids = ?self.input_ids,
                "cancel hook attached after cancel was already issued, invoking immediately"
            );
            hook();
            return;
        }
        *self.cancel_hook.lock() = Some(hook);
    }

    /// Idempotent: the callback fires at most once.
    pub fn cancel(&self) {
        if self.cancel_issued.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(hook) = self.cancel_hook.lock().take() {
            hook();
        } else {
            tracing::warn!(
                input_ids = ?self.input_ids,
                "cancel arrived before a hook was attached"
            );
        }
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancel_issued.load(Ordering::SeqCst)
    }
}

/// Process-wide state shared by the fetcher, heartbeat loop, executor, and
/// checkpoint coordinator. Holds no RPC client: that is threaded through
/// explicitly so the manager can swap it out on restore.
pub struct GlobalState {
    pub current_inputs: DashMap<String, Arc<IoContext>>,
    pub calls_completed: AtomicU64,
    pub total_user_time_ms: AtomicU64,
    pub fetching_inputs: AtomicBool,
    waiting_tx: watch::Sender<bool>,
    waiting_rx: watch::Receiver<bool>,
    pub heartbeat_wake: Notify,
}

impl GlobalState {
    pub fn new() -> Self {
        let (waiting_tx, waiting_rx) = watch::channel(false);
        Self {
            current_inputs: DashMap::new(),
            calls_completed: AtomicU64::new(0),
            total_user_time_ms: AtomicU64::new(0),
            fetching_inputs: AtomicBool::new(true),
            waiting_tx,
            waiting_rx,
            heartbeat_wake: Notify::new(),
        }
    }

    pub fn register(&self, ctx: Arc<IoContext>) {
        for id in &ctx.input_ids {
            self.current_inputs.insert(id.clone(), ctx.clone());
        }
    }

    pub fn lookup(&self, input_id: &str) -> Option<Arc<IoContext>> {
        self.current_inputs.get(input_id).map(|e| e.clone())
    }

    /// Removes every input id this context owns. Called exactly once, from
    /// `exit_context`.
    pub fn deregister(&self, ctx: &IoContext) {
        for id in &ctx.input_ids {
            self.current_inputs.remove(id);
        }
    }

    pub fn average_call_time_ms(&self) -> f64 {
        let completed = self.calls_completed.load(Ordering::SeqCst);
        if completed == 0 {
            return 0.0;
        }
        self.total_user_time_ms.load(Ordering::SeqCst) as f64 / completed as f64
    }

    pub fn record_completion(&self, user_time_ms: u64) {
        self.calls_completed.fetch_add(1, Ordering::SeqCst);
        self.total_user_time_ms.fetch_add(user_time_ms, Ordering::SeqCst);
    }

    pub fn set_waiting_for_memory_snapshot(&self, waiting: bool) {
        let _ = self.waiting_tx.send(waiting);
    }

    pub fn is_waiting_for_memory_snapshot(&self) -> bool {
        *self.waiting_rx.borrow()
    }

    /// Blocks while a checkpoint snapshot is in flight. Re-checks on every
    /// wakeup rather than trusting a single notification, matching the
    /// host's `while waiting: condition.wait()` pattern.
    pub async fn wait_while_snapshotting(&self) {
        let mut rx = self.waiting_rx.clone();
        while *rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for GlobalState {
    fn default() -> Self {
        Self::new()
    }
}
