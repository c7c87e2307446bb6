//! # Processor Events
//!
//! The subset of the processor's webhook envelope the reconciler reads.
//!
//! ```json
//! {
//!   "id": "evt_1",
//!   "type": "payment_intent.succeeded",
//!   "created": 1700000000,
//!   "data": { "object": { "id": "pi_123", "amount_received": 20000,
//!                         "metadata": { "booking_id": "…", "idempotency_key": "…" } } }
//! }
//! ```
//!
//! Unknown fields are ignored; every object field is optional because one
//! struct covers payment intents, charges, refunds, transfers and accounts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use fleetpay_core::account::AccountSnapshot;
use fleetpay_core::TransferStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventData {
    pub object: EventObject,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub decline_code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub currently_due: Vec<String>,
    #[serde(default)]
    pub eventually_due: Vec<String>,
    #[serde(default)]
    pub past_due: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundList {
    #[serde(default)]
    pub data: Vec<EventObject>,
}

/// A processor object as carried in `data.object`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventObject {
    pub id: String,
    pub object: Option<String>,
    pub amount: Option<i64>,
    pub amount_capturable: Option<i64>,
    pub amount_received: Option<i64>,
    pub amount_captured: Option<i64>,
    pub currency: Option<String>,
    pub status: Option<String>,
    /// On charges and refunds: the owning payment intent.
    pub payment_intent: Option<String>,
    /// On refunds: the refunded charge.
    pub charge: Option<String>,
    pub captured: Option<bool>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub last_payment_error: Option<PaymentError>,
    pub refunds: Option<RefundList>,
    pub metadata: BTreeMap<String, String>,

    // Connect accounts
    pub charges_enabled: Option<bool>,
    pub payouts_enabled: Option<bool>,
    pub details_submitted: Option<bool>,
    pub requirements: Option<Requirements>,
}

impl ProcessorEvent {
    pub fn parse(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    pub fn object(&self) -> &EventObject {
        &self.data.object
    }

    pub fn kind(&self) -> EventKind {
        EventKind::classify(&self.event_type)
    }
}

impl EventObject {
    /// Processor ids that may identify the booking, most specific first.
    pub fn references(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = Vec::with_capacity(3);
        for candidate in [
            self.payment_intent.as_deref(),
            Some(self.id.as_str()),
            self.charge.as_deref(),
        ]
        .into_iter()
        .flatten()
        {
            if !candidate.is_empty() && !refs.contains(&candidate) {
                refs.push(candidate);
            }
        }
        refs
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// The payment intent this object belongs to (itself, for intents).
    pub fn payment_intent_id(&self) -> &str {
        self.payment_intent.as_deref().unwrap_or(&self.id)
    }

    /// Amount that actually moved, falling back to the nominal amount.
    pub fn settled_amount(&self) -> Option<i64> {
        self.amount_received
            .filter(|a| *a > 0)
            .or(self.amount_captured.filter(|a| *a > 0))
            .or(self.amount)
    }

    pub fn failure(&self) -> Option<(String, String)> {
        if let Some(err) = &self.last_payment_error {
            let code = err
                .decline_code
                .clone()
                .or_else(|| err.code.clone())
                .unwrap_or_else(|| "payment_failed".into());
            return Some((code, err.message.clone().unwrap_or_default()));
        }
        self.failure_code.as_ref().map(|code| {
            (
                code.clone(),
                self.failure_message.clone().unwrap_or_default(),
            )
        })
    }

    pub fn to_account_snapshot(&self) -> AccountSnapshot {
        let requirements = self.requirements.clone().unwrap_or_default();
        AccountSnapshot {
            processor_account_id: self.id.clone(),
            charges_enabled: self.charges_enabled.unwrap_or(false),
            payouts_enabled: self.payouts_enabled.unwrap_or(false),
            details_submitted: self.details_submitted.unwrap_or(false),
            currently_due: requirements.currently_due,
            eventually_due: requirements.eventually_due,
            past_due: requirements.past_due,
        }
    }
}

/// What an event type means for the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A deposit hold is in place.
    AuthorizationConfirmed,
    /// Money moved: a deposit capture or a rental charge.
    PaymentSucceeded,
    /// One refund confirmed (`refund.created`).
    RefundConfirmed,
    /// A charge with its refund list (`charge.refunded`).
    ChargeRefunded,
    AuthorizationCanceled,
    PaymentFailed,
    TransferStatus(TransferStatus),
    AccountUpdated,
    Ignored,
}

impl EventKind {
    pub fn classify(event_type: &str) -> Self {
        match event_type {
            "payment_intent.amount_capturable_updated" => EventKind::AuthorizationConfirmed,
            "payment_intent.succeeded" | "charge.succeeded" | "charge.captured" => {
                EventKind::PaymentSucceeded
            }
            "refund.created" => EventKind::RefundConfirmed,
            "charge.refunded" => EventKind::ChargeRefunded,
            "payment_intent.canceled" => EventKind::AuthorizationCanceled,
            "payment_intent.payment_failed" => EventKind::PaymentFailed,
            "transfer.paid" => EventKind::TransferStatus(TransferStatus::Paid),
            "transfer.failed" => EventKind::TransferStatus(TransferStatus::Failed),
            "transfer.reversed" => EventKind::TransferStatus(TransferStatus::Reversed),
            "account.updated" => EventKind::AccountUpdated,
            _ => EventKind::Ignored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_charge_refunded() {
        let raw = br#"{
            "id": "evt_9",
            "type": "charge.refunded",
            "created": 1700000000,
            "livemode": false,
            "data": { "object": {
                "id": "ch_1", "object": "charge", "payment_intent": "pi_1",
                "amount": 20000, "amount_captured": 20000, "captured": true,
                "refunds": { "data": [ { "id": "re_1", "amount": 2500, "payment_intent": "pi_1" } ] },
                "metadata": { "booking_id": "bk_1" }
            } }
        }"#;
        let event = ProcessorEvent::parse(raw).unwrap();
        assert_eq!(event.kind(), EventKind::ChargeRefunded);

        let object = event.object();
        assert_eq!(object.references(), vec!["pi_1", "ch_1"]);
        assert_eq!(object.payment_intent_id(), "pi_1");
        assert_eq!(object.metadata_value("booking_id"), Some("bk_1"));
        let refunds = &object.refunds.as_ref().unwrap().data;
        assert_eq!(refunds[0].amount, Some(2500));
    }

    #[test]
    fn test_settled_amount_prefers_received() {
        let object = EventObject {
            id: "pi_1".into(),
            amount: Some(50000),
            amount_received: Some(7500),
            ..Default::default()
        };
        assert_eq!(object.settled_amount(), Some(7500));

        let object = EventObject {
            id: "pi_2".into(),
            amount: Some(50000),
            amount_received: Some(0),
            ..Default::default()
        };
        assert_eq!(object.settled_amount(), Some(50000));
    }

    #[test]
    fn test_failure_prefers_decline_code() {
        let object = EventObject {
            id: "pi_1".into(),
            last_payment_error: Some(PaymentError {
                code: Some("card_declined".into()),
                decline_code: Some("insufficient_funds".into()),
                message: Some("Your card has insufficient funds.".into()),
            }),
            ..Default::default()
        };
        assert_eq!(object.failure().unwrap().0, "insufficient_funds");
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            EventKind::classify("transfer.reversed"),
            EventKind::TransferStatus(TransferStatus::Reversed)
        );
        assert_eq!(EventKind::classify("customer.created"), EventKind::Ignored);
    }

    #[test]
    fn test_account_snapshot() {
        let raw = br#"{"id":"evt_a","type":"account.updated","data":{"object":{
            "id":"acct_1","charges_enabled":true,"payouts_enabled":true,"details_submitted":true,
            "requirements":{"past_due":["external_account"]}}}}"#;
        let event = ProcessorEvent::parse(raw).unwrap();
        let snapshot = event.object().to_account_snapshot();
        assert_eq!(snapshot.processor_account_id, "acct_1");
        assert_eq!(snapshot.past_due.len(), 1);
    }
}
