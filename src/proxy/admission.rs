//! Admission gate: bounded in-flight proxied requests.
//!
//! # Responsibilities
//! - Hand out one permit per proxied request when a limit is configured
//! - Optionally wait a bounded time for a permit before rejecting
//! - Report saturation for the readiness endpoint
//!
//! # Design Decisions
//! - Semaphore permits are owned; dropping the permit releases the slot on
//!   every exit path, including panics and canceled streams
//! - No FIFO guarantee beyond the semaphore's own contention ordering

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, TryAcquireError};

/// Why a request was refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionRejected {
    /// Gate full and no wait configured: 429.
    Full,
    /// Waited the configured bound without a permit: 503.
    WaitElapsed,
}

/// A held admission slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

/// Bounded counter of in-flight proxied requests. A capacity of zero
/// disables the gate entirely.
#[derive(Debug)]
pub struct AdmissionGate {
    semaphore: Option<Arc<Semaphore>>,
    max_wait: Duration,
}

impl AdmissionGate {
    pub fn new(max_inflight: usize, max_wait: Duration) -> Self {
        Self {
            semaphore: (max_inflight > 0).then(|| Arc::new(Semaphore::new(max_inflight))),
            max_wait,
        }
    }

    /// Acquire a permit, waiting up to the configured bound when the gate
    /// is full.
    pub async fn acquire(&self) -> Result<AdmissionPermit, AdmissionRejected> {
        let Some(semaphore) = &self.semaphore else {
            return Ok(AdmissionPermit { _permit: None });
        };
        if self.max_wait.is_zero() {
            return match semaphore.clone().try_acquire_owned() {
                Ok(permit) => Ok(AdmissionPermit {
                    _permit: Some(permit),
                }),
                Err(TryAcquireError::NoPermits) => Err(AdmissionRejected::Full),
                Err(TryAcquireError::Closed) => Err(AdmissionRejected::Full),
            };
        }
        match tokio::time::timeout(self.max_wait, semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(AdmissionPermit {
                _permit: Some(permit),
            }),
            Ok(Err(_)) => Err(AdmissionRejected::Full),
            Err(_) => Err(AdmissionRejected::WaitElapsed),
        }
    }

    /// True exactly when every permit is held; drives the readiness probe.
    pub fn is_saturated(&self) -> bool {
        match &self.semaphore {
            Some(semaphore) => semaphore.available_permits() == 0,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_gate_always_admits() {
        let gate = AdmissionGate::new(0, Duration::ZERO);
        for _ in 0..100 {
            // Permits are dropped immediately; nothing is counted.
            gate.acquire().await.unwrap();
        }
        assert!(!gate.is_saturated());
    }

    #[tokio::test]
    async fn full_gate_rejects_immediately_without_wait() {
        let gate = AdmissionGate::new(1, Duration::ZERO);
        let held = gate.acquire().await.unwrap();
        assert!(gate.is_saturated());
        assert_eq!(gate.acquire().await.unwrap_err(), AdmissionRejected::Full);
        drop(held);
        assert!(!gate.is_saturated());
        gate.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn full_gate_times_out_with_wait() {
        let gate = AdmissionGate::new(1, Duration::from_millis(20));
        let _held = gate.acquire().await.unwrap();
        assert_eq!(
            gate.acquire().await.unwrap_err(),
            AdmissionRejected::WaitElapsed
        );
    }

    #[tokio::test]
    async fn waiting_request_admitted_when_slot_frees() {
        let gate = Arc::new(AdmissionGate::new(1, Duration::from_secs(5)));
        let held = gate.acquire().await.unwrap();
        let gate2 = gate.clone();
        let waiter = tokio::spawn(async move { gate2.acquire().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);
        waiter.await.unwrap().unwrap();
    }
}
