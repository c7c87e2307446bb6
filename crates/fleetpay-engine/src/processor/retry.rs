//! # Retrying Gateway
//!
//! Wraps any [`ProcessorGateway`] with a per-call timeout and exponential
//! backoff for retryable failures.
//!
//! ```text
//!   call ──► timeout(call_timeout, inner.call) ──► Ok ─────────────► return
//!                 │                                 │
//!             elapsed                        Err(retryable)
//!                 │                                 │ attempts left?
//!                 ▼                                 ├── yes: sleep(backoff), same key
//!           Err(Timeout)                            └── no:  return Err
//!       (never retried here)
//! ```
//!
//! A timed-out call may have reached the processor, so it goes back to the
//! caller as an unknown outcome instead of being retried.

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{
    CaptureRequest, ChargeRequest, OnboardingLink, OnboardingLinkRequest, PaymentIntent,
    ProcessorError, ProcessorGateway, RefundReceipt, RefundRequest, ReleaseRequest,
    SubAccountRequest, TransferReceipt, TransferRequest,
};
use crate::config::ProcessorSettings;
use fleetpay_core::account::AccountSnapshot;

/// Timeout and retry bounds for processor calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub call_timeout: Duration,
    /// Attempts including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&ProcessorSettings::default())
    }
}

impl From<&ProcessorSettings> for RetryPolicy {
    fn from(settings: &ProcessorSettings) -> Self {
        RetryPolicy {
            call_timeout: settings.timeout(),
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_backoff,
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Gateway decorator adding timeouts and retries.
#[derive(Clone)]
pub struct RetryingGateway {
    inner: Arc<dyn ProcessorGateway>,
    policy: RetryPolicy,
}

impl RetryingGateway {
    pub fn new(inner: Arc<dyn ProcessorGateway>, policy: RetryPolicy) -> Self {
        RetryingGateway { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn call<T, F, Fut>(&self, op: &'static str, key: &str, f: F) -> Result<T, ProcessorError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ProcessorError>>,
    {
        let mut backoff = self.policy.backoff();
        let mut attempt = 1u32;

        loop {
            let result = match timeout(self.policy.call_timeout, f()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        op,
                        idempotency_key = key,
                        timeout_ms = self.policy.call_timeout.as_millis() as u64,
                        "Processor call timed out"
                    );
                    return Err(ProcessorError::Timeout);
                }
            };

            match result {
                Ok(value) => {
                    debug!(op, idempotency_key = key, attempt, "Processor call succeeded");
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let mut delay = backoff.next_backoff().unwrap_or(self.policy.max_backoff);
                    if let ProcessorError::RateLimited {
                        retry_after: Some(after),
                    } = &e
                    {
                        delay = delay.max(*after);
                    }

                    warn!(
                        op,
                        idempotency_key = key,
                        attempt,
                        ?delay,
                        error = %e,
                        "Retrying processor call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(op, idempotency_key = key, attempt, error = %e, "Processor call failed");
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl ProcessorGateway for RetryingGateway {
    async fn charge(&self, req: &ChargeRequest) -> Result<PaymentIntent, ProcessorError> {
        self.call("charge", &req.idempotency_key, || self.inner.charge(req))
            .await
    }

    async fn capture(&self, req: &CaptureRequest) -> Result<PaymentIntent, ProcessorError> {
        self.call("capture", &req.idempotency_key, || self.inner.capture(req))
            .await
    }

    async fn release(&self, req: &ReleaseRequest) -> Result<PaymentIntent, ProcessorError> {
        self.call("release", &req.idempotency_key, || self.inner.release(req))
            .await
    }

    async fn refund(&self, req: &RefundRequest) -> Result<RefundReceipt, ProcessorError> {
        self.call("refund", &req.idempotency_key, || self.inner.refund(req))
            .await
    }

    async fn transfer(&self, req: &TransferRequest) -> Result<TransferReceipt, ProcessorError> {
        self.call("transfer", &req.idempotency_key, || self.inner.transfer(req))
            .await
    }

    async fn create_sub_account(
        &self,
        req: &SubAccountRequest,
    ) -> Result<AccountSnapshot, ProcessorError> {
        self.call("create_sub_account", &req.idempotency_key, || {
            self.inner.create_sub_account(req)
        })
        .await
    }

    async fn create_onboarding_link(
        &self,
        req: &OnboardingLinkRequest,
    ) -> Result<OnboardingLink, ProcessorError> {
        // Read-like: link creation has no side effect worth deduplicating.
        self.call("create_onboarding_link", &req.account_id, || {
            self.inner.create_onboarding_link(req)
        })
        .await
    }

    async fn retrieve_account(&self, account_id: &str) -> Result<AccountSnapshot, ProcessorError> {
        self.call("retrieve_account", account_id, || {
            self.inner.retrieve_account(account_id)
        })
        .await
    }
}
