//! Scripted in-memory gateway for tests.
//!
//! Unscripted calls succeed. Like the real processor, a repeated
//! idempotency key returns the object created by the first call.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{
    CaptureMode, CaptureRequest, ChargeRequest, OnboardingLink, OnboardingLinkRequest,
    PaymentIntent, ProcessorError, ProcessorGateway, RefundReceipt, RefundRequest,
    ReleaseRequest, SubAccountRequest, TransferReceipt, TransferRequest,
};
use fleetpay_core::account::AccountSnapshot;
use fleetpay_core::TransferStatus;

enum Reply {
    Fail(ProcessorError),
    Delay(Duration),
}

#[derive(Default)]
pub(crate) struct MockGateway {
    script: Mutex<HashMap<&'static str, VecDeque<Reply>>>,
    calls: Mutex<Vec<(&'static str, String)>>,
    charges: Mutex<Vec<ChargeRequest>>,
    ids: Mutex<HashMap<String, String>>,
    account: Mutex<Option<AccountSnapshot>>,
    seq: AtomicU64,
}

impl MockGateway {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_next(&self, op: &'static str, err: ProcessorError) {
        self.push(op, Reply::Fail(err));
    }

    /// Delays the next call to `op` (then succeeds, if anyone is still waiting).
    pub(crate) fn delay_next(&self, op: &'static str, delay: Duration) {
        self.push(op, Reply::Delay(delay));
    }

    /// Snapshot returned by `retrieve_account`.
    pub(crate) fn set_account(&self, snapshot: AccountSnapshot) {
        *self.account.lock().unwrap() = Some(snapshot);
    }

    pub(crate) fn calls(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(o, _)| *o == op).count()
    }

    pub(crate) fn keys(&self, op: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(o, _)| *o == op)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Every charge request seen, including ones scripted to fail.
    pub(crate) fn charge_requests(&self) -> Vec<ChargeRequest> {
        self.charges.lock().unwrap().clone()
    }

    fn push(&self, op: &'static str, reply: Reply) {
        self.script
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(reply);
    }

    async fn enter(&self, op: &'static str, key: &str) -> Result<(), ProcessorError> {
        self.calls.lock().unwrap().push((op, key.to_string()));
        let reply = self
            .script
            .lock()
            .unwrap()
            .get_mut(op)
            .and_then(VecDeque::pop_front);
        match reply {
            Some(Reply::Fail(e)) => Err(e),
            Some(Reply::Delay(d)) => {
                tokio::time::sleep(d).await;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Same key, same object id.
    fn id_for(&self, prefix: &str, key: &str) -> String {
        let mut ids = self.ids.lock().unwrap();
        ids.entry(key.to_string())
            .or_insert_with(|| format!("{}_mock_{}", prefix, self.seq.fetch_add(1, Ordering::SeqCst)))
            .clone()
    }
}

#[async_trait]
impl ProcessorGateway for MockGateway {
    async fn charge(&self, req: &ChargeRequest) -> Result<PaymentIntent, ProcessorError> {
        self.charges.lock().unwrap().push(req.clone());
        self.enter("charge", &req.idempotency_key).await?;
        let status = match req.capture_mode {
            CaptureMode::Automatic => "succeeded",
            CaptureMode::Manual => "requires_capture",
        };
        Ok(PaymentIntent {
            id: self.id_for("pi", &req.idempotency_key),
            status: status.into(),
            amount_minor: req.amount_minor,
        })
    }

    async fn capture(&self, req: &CaptureRequest) -> Result<PaymentIntent, ProcessorError> {
        self.enter("capture", &req.idempotency_key).await?;
        Ok(PaymentIntent {
            id: req.payment_intent_id.clone(),
            status: "succeeded".into(),
            amount_minor: req.amount_minor,
        })
    }

    async fn release(&self, req: &ReleaseRequest) -> Result<PaymentIntent, ProcessorError> {
        self.enter("release", &req.idempotency_key).await?;
        Ok(PaymentIntent {
            id: req.payment_intent_id.clone(),
            status: "canceled".into(),
            amount_minor: 0,
        })
    }

    async fn refund(&self, req: &RefundRequest) -> Result<RefundReceipt, ProcessorError> {
        self.enter("refund", &req.idempotency_key).await?;
        Ok(RefundReceipt {
            id: self.id_for("re", &req.idempotency_key),
            amount_minor: req.amount_minor,
            status: "succeeded".into(),
        })
    }

    async fn transfer(&self, req: &TransferRequest) -> Result<TransferReceipt, ProcessorError> {
        self.enter("transfer", &req.idempotency_key).await?;
        Ok(TransferReceipt {
            id: self.id_for("tr", &req.idempotency_key),
            status: TransferStatus::Pending,
        })
    }

    async fn create_sub_account(
        &self,
        req: &SubAccountRequest,
    ) -> Result<AccountSnapshot, ProcessorError> {
        self.enter("create_sub_account", &req.idempotency_key).await?;
        Ok(AccountSnapshot {
            processor_account_id: self.id_for("acct", &req.idempotency_key),
            currently_due: vec!["external_account".into(), "tos_acceptance".into()],
            ..Default::default()
        })
    }

    async fn create_onboarding_link(
        &self,
        req: &OnboardingLinkRequest,
    ) -> Result<OnboardingLink, ProcessorError> {
        self.enter("create_onboarding_link", &req.account_id).await?;
        Ok(OnboardingLink {
            url: format!("https://connect.example.com/setup/{}", req.account_id),
            expires_at: 1_900_000_000,
        })
    }

    async fn retrieve_account(&self, account_id: &str) -> Result<AccountSnapshot, ProcessorError> {
        self.enter("retrieve_account", account_id).await?;
        let snapshot = self.account.lock().unwrap().clone();
        Ok(snapshot.unwrap_or_else(|| AccountSnapshot {
            processor_account_id: account_id.to_string(),
            ..Default::default()
        }))
    }
}
