//! Offload bridge: run blocking driver calls off the async runtime.
//!
//! Each [`Offload`] owns a single worker slot. A call first acquires the slot,
//! then moves the slot permit into a `spawn_blocking` closure together with the
//! blocking work. The permit is released only when the blocking work returns,
//! so at most one call per `Offload` is ever executing, even if the caller that
//! started it has gone away.
//!
//! Cancellation only affects the waiter. A native call cannot be interrupted;
//! when the awaiting future is dropped (or loses a [`Offload::run_until`]
//! race) the call keeps running on its worker thread, its result is discarded,
//! and the next call waits for the slot as usual.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Failures of the bridge itself, independent of what the blocking call returns.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OffloadError {
    /// The caller stopped waiting before the call completed
    #[error("call cancelled by caller")]
    Cancelled,

    /// The blocking call panicked
    #[error("blocking call panicked: {0}")]
    Panicked(String),

    /// The bridge was closed or the runtime is shutting down
    #[error("offload bridge closed")]
    Closed,
}

/// A serialized worker slot for blocking calls.
#[derive(Debug, Clone)]
pub struct Offload {
    slot: Arc<Semaphore>,
}

impl Default for Offload {
    fn default() -> Self {
        Self::new()
    }
}

impl Offload {
    /// Create a bridge with one free slot.
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// Wait for the worker slot.
    ///
    /// Holding the returned [`Slot`] blocks every other caller of this bridge
    /// until it is dropped or consumed by [`Slot::run`].
    pub async fn acquire(&self) -> Result<Slot, OffloadError> {
        let permit = self
            .slot
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| OffloadError::Closed)?;
        Ok(Slot { permit })
    }

    /// Run `f` on a blocking worker once the slot is free.
    pub async fn run<F, T>(&self, f: F) -> Result<T, OffloadError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.acquire().await?.run(f).await
    }

    /// Run `f`, giving up when `cancel` resolves first.
    ///
    /// Cancellation while waiting for the slot never starts `f`. Cancellation
    /// after `f` started leaves it running; its result is dropped.
    pub async fn run_until<F, T, C>(&self, f: F, cancel: C) -> Result<T, OffloadError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
        C: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            result = self.run(f) => result,
            _ = cancel => {
                debug!("Offloaded call abandoned by caller");
                Err(OffloadError::Cancelled)
            }
        }
    }

    /// Whether a call currently holds the slot.
    pub fn is_busy(&self) -> bool {
        self.slot.available_permits() == 0
    }

    /// Wait until no call holds the slot, including abandoned ones.
    pub async fn drain(&self) -> Result<(), OffloadError> {
        drop(self.acquire().await?);
        Ok(())
    }

    /// Refuse new calls. Calls already holding the slot finish normally.
    pub fn close(&self) {
        self.slot.close();
    }
}

/// An acquired worker slot.
#[derive(Debug)]
pub struct Slot {
    permit: OwnedSemaphorePermit,
}

impl Slot {
    /// Run `f` on a blocking worker, releasing the slot when `f` returns.
    pub async fn run<F, T>(self, f: F) -> Result<T, OffloadError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.permit;
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        });

        match task.await {
            Ok(value) => Ok(value),
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                warn!(message = %message, "Blocking call panicked");
                Err(OffloadError::Panicked(message))
            }
            Err(_) => Err(OffloadError::Closed),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_returns_value() {
        let offload = Offload::new();
        assert_eq!(offload.run(|| 6 * 7).await, Ok(42));
        assert!(!offload.is_busy());
    }

    #[tokio::test]
    async fn test_panic_is_reported() {
        let offload = Offload::new();
        let result: Result<(), _> = offload.run(|| panic!("boom")).await;
        assert_eq!(result, Err(OffloadError::Panicked("boom".to_string())));
        // Slot is released after a panic
        assert_eq!(offload.run(|| 1).await, Ok(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_calls_never_overlap() {
        let offload = Offload::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let offload = offload.clone();
            let active = active.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                offload
                    .run(move || {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(10));
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abandoned_call_keeps_slot() {
        let offload = Offload::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let flag = finished.clone();

        let result = offload
            .run_until(
                move || {
                    std::thread::sleep(Duration::from_millis(200));
                    flag.store(1, Ordering::SeqCst);
                },
                tokio::time::sleep(Duration::from_millis(20)),
            )
            .await;
        assert_eq!(result, Err(OffloadError::Cancelled));
        assert!(offload.is_busy());

        offload.drain().await.unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(!offload.is_busy());
    }

    #[tokio::test]
    async fn test_held_slot_blocks_second_caller() {
        use tokio_test::{assert_pending, assert_ready_ok, task};

        let offload = Offload::new();
        let slot = offload.acquire().await.unwrap();
        assert!(offload.is_busy());

        let mut waiter = task::spawn(offload.acquire());
        assert_pending!(waiter.poll());

        drop(slot);
        assert!(waiter.is_woken());
        let _second = assert_ready_ok!(waiter.poll());
    }

    #[tokio::test]
    async fn test_closed_bridge_rejects_calls() {
        let offload = Offload::new();
        offload.close();
        assert_eq!(offload.run(|| ()).await, Err(OffloadError::Closed));
    }
}
