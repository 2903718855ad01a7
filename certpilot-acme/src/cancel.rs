//! Cooperative cancellation for long-running workflow steps

use crate::error::{AcmeError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Cancellation flag shared between the scheduler and whoever stops it.
///
/// Clones observe the same flag. Once cancelled it stays cancelled.
///
/// ```
/// use certpilot_acme::{AcmeError, CancelSignal};
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let signal = CancelSignal::new();
/// signal.cancel();
/// let slept = signal.sleep(Duration::from_secs(3600)).await;
/// assert!(matches!(slept, Err(AcmeError::Cancelled)));
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation has been requested
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Sleep for `duration` unless cancelled first
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(AcmeError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Run `future` unless cancelled first
    pub async fn guard<T, F>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(AcmeError::Cancelled),
            result = future => result,
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes() {
        let signal = CancelSignal::new();
        assert!(signal.sleep(Duration::from_secs(60)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_sleep() {
        let signal = CancelSignal::new();
        let sleeper = signal.clone();
        let handle = tokio::spawn(async move { sleeper.sleep(Duration::from_secs(86_400)).await });

        tokio::task::yield_now().await;
        signal.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(AcmeError::Cancelled)));
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_guard_after_cancel() {
        let signal = CancelSignal::new();
        signal.cancel();
        let result = signal.guard(async { Ok(1) }).await;
        assert!(matches!(result, Err(AcmeError::Cancelled)));
    }
}
