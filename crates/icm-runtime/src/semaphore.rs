//! A resizable counting semaphore with at most one waiter.
//!
//! `tokio::sync::Semaphore` does not support shrinking capacity in place, so
//! this tracks `active`/`capacity` directly the way the host platform's pool
//! tracks concurrency with a plain counter plus permit bookkeeping, but
//! without needing to hold onto forgotten permits: `current_concurrency`
//! reports `max(active, capacity)` so an in-flight downsize is visible to
//! callers without any permit gymnastics.

use crate::errors::CoreError;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};

struct Inner {
    active: u32,
    capacity: u32,
    closed: bool,
    waiting: bool,
}

pub struct ConcurrencySemaphore {
    inner: Mutex<Inner>,
    notify: Notify,
    active_tx: watch::Sender<u32>,
}

impl ConcurrencySemaphore {
    pub fn new(capacity: u32) -> Self {
        let (active_tx, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner { active: 0, capacity, closed: false, waiting: false }),
            notify: Notify::new(),
            active_tx,
        }
    }

    /// The sole caller is `InputFetcher`; a second concurrent waiter is a
    /// programming error.
    pub async fn acquire(&self) -> Result<(), CoreError> {
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(CoreError::SemaphoreClosed);
                }
                if inner.active < inner.capacity {
                    inner.active += 1;
                    self.publish_active(inner.active);
                    return Ok(());
                }
                if inner.waiting {
                    return Err(CoreError::SemaphoreAlreadyWaiting);
                }
                inner.waiting = true;
            }
            self.notify.notified().await;
        }
    }

    pub fn release(&self) {
        let mut inner = self.inner.lock();
        inner.active = inner.active.saturating_sub(1);
        inner.waiting = false;
        let active = inner.active;
        let capacity_ok = inner.active < inner.capacity;
        drop(inner);
        self.publish_active(active);
        if capacity_ok {
            self.notify.notify_one();
        }
    }

    /// Never refuses downsizing; `active` may exceed `capacity` until enough
    /// holders release.
    pub fn set_capacity(&self, capacity: u32) {
        let mut inner = self.inner.lock();
        let grew = capacity > inner.capacity;
        let had_room = inner.active < capacity;
        inner.capacity = capacity;
        inner.waiting = inner.waiting && !had_room;
        drop(inner);
        if grew && had_room {
            self.notify.notify_one();
        }
    }

    /// Marks the semaphore closed (no new acquires) and waits for every
    /// outstanding holder to release.
    pub async fn close(&self) {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
        }
        self.notify.notify_waiters();
        let mut rx = self.active_tx.subscribe();
        loop {
            if *rx.borrow() == 0 {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn current_concurrency(&self) -> u32 {
        let inner = self.inner.lock();
        inner.active.max(inner.capacity)
    }

    pub fn active(&self) -> u32 {
        self.inner.lock().active
    }

    fn publish_active(&self, active: u32) {
        let _ = self.active_tx.send(active);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_release_round_trip_is_a_no_op() {
        let sem = ConcurrencySemaphore::new(2);
        sem.acquire().await.unwrap();
        assert_eq!(sem.active(), 1);
        sem.release();
        assert_eq!(sem.active(), 0);
    }

    #[tokio::test]
    async fn second_waiter_is_rejected() {
        let sem = Arc::new(ConcurrencySemaphore::new(1));
        sem.acquire().await.unwrap();

        let sem2 = sem.clone();
        let waiter = tokio::spawn(async move { sem2.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = sem.acquire().await.unwrap_err();
        assert!(matches!(err, CoreError::SemaphoreAlreadyWaiting));

        sem.release();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn downsize_with_outstanding_work_blocks_new_acquires_until_drained() {
        let sem = ConcurrencySemaphore::new(10);
        for _ in 0..8 {
            sem.acquire().await.unwrap();
        }
        sem.set_capacity(1);
        assert_eq!(sem.current_concurrency(), 8);

        for _ in 0..8 {
            sem.release();
        }
        assert_eq!(sem.active(), 0);
        sem.acquire().await.unwrap();
        assert_eq!(sem.active(), 1);
    }

    #[tokio::test]
    async fn close_waits_for_outstanding_holders_to_release() {
        let sem = Arc::new(ConcurrencySemaphore::new(2));
        sem.acquire().await.unwrap();

        let sem2 = sem.clone();
        let closer = tokio::spawn(async move { sem2.close().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!closer.is_finished());

        sem.release();
        tokio::time::timeout(Duration::from_millis(200), closer).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closed_semaphore_rejects_new_acquires() {
        let sem = ConcurrencySemaphore::new(1);
        sem.close().await;
        let err = sem.acquire().await.unwrap_err();
        assert!(matches!(err, CoreError::SemaphoreClosed));
    }
}
