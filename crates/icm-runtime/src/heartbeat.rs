//! Periodic liveness ping that doubles as the cancellation inbox.

use crate::context::GlobalState;
use icm_rpc::model::HeartbeatRequest;
use icm_rpc::RpcClient;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, warn};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const HEARTBEAT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
const CANCEL_TICK_FLOOR: Duration = Duration::from_secs(1);
const FAILURE_WINDOW_MULTIPLIER: u32 = 50;

pub struct HeartbeatLoop {
    state: Arc<GlobalState>,
    rpc: Arc<dyn RpcClient>,
    interval: Duration,
    attempt_timeout: Duration,
    function_id: String,
}

impl HeartbeatLoop {
    pub fn new(state: Arc<GlobalState>, rpc: Arc<dyn RpcClient>, function_id: String) -> Self {
        Self {
            state,
            rpc,
            interval: HEARTBEAT_INTERVAL,
            attempt_timeout: HEARTBEAT_ATTEMPT_TIMEOUT,
            function_id,
        }
    }

    /// Runs until `shutdown` fires. Never exits on RPC failure: transient
    /// errors are logged and the loop just ticks again.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut consecutive_failures: u32 = 0;
        let mut failing_since: Option<Instant> = None;

        loop {
            if *shutdown.borrow() {
                return;
            }

            self.state.wait_while_snapshotting().await;

            let tick_started_at = Instant::now();
            let attempt = tokio::time::timeout(
                self.attempt_timeout,
                self.rpc.heartbeat(HeartbeatRequest { canceled_inputs_return_outputs_v2: true }),
            )
            .await;

            let mut cancelled_any = false;
            match attempt {
                Ok(Ok(response)) => {
                    consecutive_failures = 0;
                    failing_since = None;
                    if let Some(event) = response.cancel_input_event {
                        for input_id in event.input_ids {
                            if let Some(ctx) = self.state.lookup(&input_id) {
                                debug!(input_id, "delivering cancel from heartbeat");
                                ctx.cancel();
                                crate::metrics::record_cancellation_observed(&self.function_id);
                                cancelled_any = true;
                            } else {
                                debug!(input_id, "cancel for unknown or already-completed input, ignoring");
                            }
                        }
                    }
                }
                Ok(Err(e)) => {
                    self.record_failure(&mut consecutive_failures, &mut failing_since, &e.to_string());
                }
                Err(_) => {
                    self.record_failure(&mut consecutive_failures, &mut failing_since, "attempt timed out");
                }
            }

            let wait = if cancelled_any {
                CANCEL_TICK_FLOOR
            } else {
                self.interval.saturating_sub(tick_started_at.elapsed())
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    fn record_failure(&self, consecutive: &mut u32, failing_since: &mut Option<Instant>, detail: &str) {
        *consecutive += 1;
        crate::metrics::record_heartbeat_failure(&self.function_id);
        let since = failing_since.get_or_insert_with(Instant::now);
        warn!(consecutive_failures = *consecutive, error = detail, "heartbeat attempt failed");
        if since.elapsed() > self.interval * FAILURE_WINDOW_MULTIPLIER {
            error!(
                failing_for_secs = since.elapsed().as_secs(),
                "heartbeat has been failing for an extended window, container may be unreachable"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use icm_rpc::fake::FakeRpcClient;

    #[tokio::test]
    async fn delivers_cancel_to_registered_context() {
        let state = Arc::new(GlobalState::new());
        let ctx = Arc::new(crate::context::IoContext::new(
            vec!["in-1".into()],
            vec![0],
            vec!["fc-1".into()],
            "main".into(),
            crate::context::CallArgs::Single(serde_json::Value::Null),
        ));
        state.register(ctx.clone());

        let rpc = Arc::new(FakeRpcClient::new());
        rpc.enqueue_cancel(vec!["in-1".into()]).await;

        let loop_ = HeartbeatLoop::new(state.clone(), rpc.clone(), "fn-1".into());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move { loop_.run(shutdown_rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

        assert!(ctx.was_cancelled());
    }

    #[tokio::test]
    async fn cancel_for_unknown_input_is_a_no_op() {
        let state = Arc::new(GlobalState::new());
        let rpc = Arc::new(FakeRpcClient::new());
        rpc.enqueue_cancel(vec!["ghost".into()]).await;

        let loop_ = HeartbeatLoop::new(state, rpc, "fn-1".into());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { loop_.run(shutdown_rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pauses_while_snapshotting() {
        let state = Arc::new(GlobalState::new());
        state.set_waiting_for_memory_snapshot(true);
        let rpc = Arc::new(FakeRpcClient::new());

        let loop_ = HeartbeatLoop::new(state.clone(), rpc.clone(), "fn-1".into());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { loop_.run(shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rpc.checkpoints.lock().unwrap().is_empty());
        state.set_waiting_for_memory_snapshot(false);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
