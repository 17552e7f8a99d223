//! Periodically refreshes target concurrency against the control plane.
//! Only runs when `max_concurrency > target_concurrency`; a fixed
//! `target_concurrency == max_concurrency` function never needs this loop.

use crate::semaphore::ConcurrencySemaphore;
use icm_rpc::model::GetDynamicConcurrencyRequest;
use icm_rpc::RpcClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

pub const DYNAMIC_CONCURRENCY_INTERVAL: Duration = Duration::from_secs(3);
pub const DYNAMIC_CONCURRENCY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ConcurrencyControlLoop {
    function_id: String,
    target_concurrency: u32,
    max_concurrency: u32,
    semaphore: Arc<ConcurrencySemaphore>,
    rpc: Arc<dyn RpcClient>,
}

impl ConcurrencyControlLoop {
    pub fn new(
        function_id: String,
        target_concurrency: u32,
        max_concurrency: u32,
        semaphore: Arc<ConcurrencySemaphore>,
        rpc: Arc<dyn RpcClient>,
    ) -> Self {
        Self { function_id, target_concurrency, max_concurrency, semaphore, rpc }
    }

    pub fn should_run(&self) -> bool {
        self.max_concurrency > self.target_concurrency
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>, mut manual_override: watch::Receiver<Option<u32>>) {
        if !self.should_run() {
            return;
        }

        let mut ticker = tokio::time::interval(DYNAMIC_CONCURRENCY_INTERVAL);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh_once().await;
                }
                _ = manual_override.changed() => {
                    if let Some(n) = *manual_override.borrow() {
                        self.semaphore.set_capacity(n);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn refresh_once(&self) {
        let req = GetDynamicConcurrencyRequest {
            function_id: self.function_id.clone(),
            target_concurrency: self.target_concurrency,
            max_concurrency: self.max_concurrency,
        };
        match tokio::time::timeout(DYNAMIC_CONCURRENCY_TIMEOUT, self.rpc.get_dynamic_concurrency(req)).await {
            Ok(Ok(resp)) => self.semaphore.set_capacity(resp.concurrency),
            Ok(Err(e)) => warn!(error = %e, "dynamic concurrency refresh failed"),
            Err(_) => warn!("dynamic concurrency refresh timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use icm_rpc::fake::FakeRpcClient;

    #[test]
    fn does_not_run_when_target_equals_max() {
        let semaphore = Arc::new(ConcurrencySemaphore::new(4));
        let rpc = Arc::new(FakeRpcClient::new());
        let loop_ = ConcurrencyControlLoop::new("fn-1".into(), 4, 4, semaphore, rpc);
        assert!(!loop_.should_run());
    }

    #[test]
    fn runs_when_max_exceeds_target() {
        let semaphore = Arc::new(ConcurrencySemaphore::new(4));
        let rpc = Arc::new(FakeRpcClient::new());
        let loop_ = ConcurrencyControlLoop::new("fn-1".into(), 2, 10, semaphore, rpc);
        assert!(loop_.should_run());
    }

    #[tokio::test]
    async fn manual_override_sets_capacity_immediately() {
        let semaphore = Arc::new(ConcurrencySemaphore::new(4));
        let rpc = Arc::new(FakeRpcClient::new());
        let loop_ = Arc::new(ConcurrencyControlLoop::new("fn-1".into(), 2, 10, semaphore.clone(), rpc));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (override_tx, override_rx) = watch::channel(None);
        let loop2 = loop_.clone();
        let handle = tokio::spawn(async move { loop2.run(shutdown_rx, override_rx).await });

        override_tx.send(Some(7)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(semaphore.current_concurrency(), 7);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
