//! Admission gate bounding concurrent database constructions.

use crate::error::{ServerError, ServerResult};
use crate::name::DatabaseName;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// A token pool with a fixed capacity.
#[derive(Debug)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    timeout: Duration,
}

/// One unit of construction concurrency. Released on drop.
#[derive(Debug)]
pub struct AdmissionToken {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    /// Creates a gate with `capacity` tokens and an acquire timeout.
    #[must_use]
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            timeout,
        }
    }

    /// Waits for a token for loading `name`.
    ///
    /// # Errors
    ///
    /// - [`ServerError::ConcurrentLoadTimeout`] if none frees up in time
    /// - [`ServerError::ShuttingDown`] if `cancel` fires or the gate is closed
    pub async fn acquire(
        &self,
        name: &DatabaseName,
        cancel: &CancellationToken,
    ) -> ServerResult<AdmissionToken> {
        let permit = Arc::clone(&self.semaphore).acquire_owned();
        let acquire = tokio::time::timeout(self.timeout, permit);
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ServerError::ShuttingDown),
            result = acquire => match result {
                Ok(Ok(permit)) => Ok(AdmissionToken { _permit: permit }),
                Ok(Err(_closed)) => Err(ServerError::ShuttingDown),
                Err(_elapsed) => Err(ServerError::ConcurrentLoadTimeout {
                    name: name.to_string(),
                    waited: self.timeout,
                }),
            },
        }
    }

    /// Returns the configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of tokens currently held.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.semaphore.available_permits())
    }

    /// Closes the gate; pending and future acquires fail.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(n: &str) -> DatabaseName {
        DatabaseName::new(n).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_full() {
        let gate = AdmissionGate::new(1, Duration::from_secs(5));
        let cancel = CancellationToken::new();
        let held = gate.acquire(&name("a"), &cancel).await.unwrap();
        assert_eq!(gate.in_use(), 1);

        let err = gate.acquire(&name("b"), &cancel).await.unwrap_err();
        assert!(matches!(err, ServerError::ConcurrentLoadTimeout { ref name, .. } if name == "b"));

        drop(held);
        assert_eq!(gate.in_use(), 0);
        assert!(gate.acquire(&name("b"), &cancel).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_gets_released_token() {
        let gate = Arc::new(AdmissionGate::new(1, Duration::from_secs(5)));
        let cancel = CancellationToken::new();
        let held = gate.acquire(&name("a"), &cancel).await.unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.acquire(&name("b"), &cancel).await.map(drop) })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn cancel_aborts_wait() {
        let gate = AdmissionGate::new(1, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let _held = gate.acquire(&name("a"), &cancel).await.unwrap();
        cancel.cancel();
        assert!(matches!(
            gate.acquire(&name("b"), &cancel).await,
            Err(ServerError::ShuttingDown)
        ));
    }
}
