//! # HTTP Processor Client
//!
//! `reqwest` client for a Stripe-compatible REST API.
//!
//! ```text
//!   POST /v1/payment_intents              charge / deposit hold
//!   POST /v1/payment_intents/{id}/capture capture
//!   POST /v1/payment_intents/{id}/cancel  release
//!   POST /v1/refunds                      refund
//!   POST /v1/transfers                    payout to sub-account
//!   POST /v1/accounts                     create sub-account
//!   POST /v1/account_links                onboarding link
//!   GET  /v1/accounts/{id}                account snapshot
//! ```
//!
//! Bodies are form-encoded, auth is a bearer API key, and every mutating
//! call sends its key in the `Idempotency-Key` header.

use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{
    CaptureMode, CaptureRequest, ChargeRequest, Metadata, OnboardingLink, OnboardingLinkRequest,
    PaymentIntent, ProcessorError, ProcessorGateway, RefundReceipt, RefundRequest,
    ReleaseRequest, SubAccountRequest, TransferReceipt, TransferRequest,
};
use crate::config::ProcessorSettings;
use fleetpay_core::account::AccountSnapshot;
use fleetpay_core::TransferStatus;

type Form = Vec<(String, String)>;

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct ApiPaymentIntent {
    id: String,
    status: String,
    #[serde(default)]
    amount: i64,
}

#[derive(Debug, Deserialize)]
struct ApiRefund {
    id: String,
    amount: i64,
    status: String,
}

#[derive(Debug, Deserialize)]
struct ApiTransfer {
    id: String,
    #[serde(default)]
    reversed: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ApiRequirements {
    #[serde(default)]
    currently_due: Vec<String>,
    #[serde(default)]
    eventually_due: Vec<String>,
    #[serde(default)]
    past_due: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiAccount {
    id: String,
    #[serde(default)]
    charges_enabled: bool,
    #[serde(default)]
    payouts_enabled: bool,
    #[serde(default)]
    details_submitted: bool,
    #[serde(default)]
    requirements: Option<ApiRequirements>,
}

impl From<ApiAccount> for AccountSnapshot {
    fn from(account: ApiAccount) -> Self {
        let requirements = account.requirements.unwrap_or_default();
        AccountSnapshot {
            processor_account_id: account.id,
            charges_enabled: account.charges_enabled,
            payouts_enabled: account.payouts_enabled,
            details_submitted: account.details_submitted,
            currently_due: requirements.currently_due,
            eventually_due: requirements.eventually_due,
            past_due: requirements.past_due,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiAccountLink {
    url: String,
    expires_at: i64,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error: ApiErrorDetail,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    decline_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

// =============================================================================
// Client
// =============================================================================

/// Processor client over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpProcessorClient {
    client: Client,
    base_url: Url,
    api_key: String,
}

impl HttpProcessorClient {
    pub fn new(settings: &ProcessorSettings) -> Result<Self, ProcessorError> {
        let base_url = Url::parse(&settings.base_url)
            .map_err(|e| ProcessorError::InvalidRequest(format!("base_url: {}", e)))?;

        // The retrying wrapper owns the per-call timeout; this one only
        // guards against a connection that never completes.
        let client = Client::builder()
            .connect_timeout(settings.timeout())
            .user_agent(concat!("fleetpay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProcessorError::InvalidRequest(e.to_string()))?;

        Ok(HttpProcessorClient {
            client,
            base_url,
            api_key: settings.api_key.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ProcessorError> {
        self.base_url
            .join(path)
            .map_err(|e| ProcessorError::InvalidRequest(format!("{}: {}", path, e)))
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        idempotency_key: Option<&str>,
        form: &Form,
    ) -> Result<T, ProcessorError> {
        let url = self.endpoint(path)?;
        debug!(%url, idempotency_key, "Processor POST");

        let mut request = self.client.post(url).bearer_auth(&self.api_key).form(form);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let response = request.send().await.map_err(map_transport_error)?;
        read_response(response).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ProcessorError> {
        let url = self.endpoint(path)?;
        debug!(%url, "Processor GET");

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(map_transport_error)?;
        read_response(response).await
    }
}

#[async_trait]
impl ProcessorGateway for HttpProcessorClient {
    async fn charge(&self, req: &ChargeRequest) -> Result<PaymentIntent, ProcessorError> {
        let pi: ApiPaymentIntent = self
            .post("v1/payment_intents", Some(&req.idempotency_key), &charge_form(req))
            .await?;
        Ok(pi.into())
    }

    async fn capture(&self, req: &CaptureRequest) -> Result<PaymentIntent, ProcessorError> {
        let form = vec![("amount_to_capture".to_string(), req.amount_minor.to_string())];
        let pi: ApiPaymentIntent = self
            .post(
                &format!("v1/payment_intents/{}/capture", req.payment_intent_id),
                Some(&req.idempotency_key),
                &form,
            )
            .await?;
        Ok(pi.into())
    }

    async fn release(&self, req: &ReleaseRequest) -> Result<PaymentIntent, ProcessorError> {
        let pi: ApiPaymentIntent = self
            .post(
                &format!("v1/payment_intents/{}/cancel", req.payment_intent_id),
                Some(&req.idempotency_key),
                &Form::new(),
            )
            .await?;
        Ok(pi.into())
    }

    async fn refund(&self, req: &RefundRequest) -> Result<RefundReceipt, ProcessorError> {
        let mut form = vec![
            ("payment_intent".to_string(), req.payment_intent_id.clone()),
            ("amount".to_string(), req.amount_minor.to_string()),
        ];
        push_metadata(&mut form, &req.metadata);

        let refund: ApiRefund = self
            .post("v1/refunds", Some(&req.idempotency_key), &form)
            .await?;
        Ok(RefundReceipt {
            id: refund.id,
            amount_minor: refund.amount,
            status: refund.status,
        })
    }

    async fn transfer(&self, req: &TransferRequest) -> Result<TransferReceipt, ProcessorError> {
        let mut form = vec![
            ("amount".to_string(), req.amount_minor.to_string()),
            ("currency".to_string(), req.currency.to_lowercase()),
            ("destination".to_string(), req.destination.clone()),
        ];
        push_metadata(&mut form, &req.metadata);

        let transfer: ApiTransfer = self
            .post("v1/transfers", Some(&req.idempotency_key), &form)
            .await?;
        Ok(TransferReceipt {
            id: transfer.id,
            status: if transfer.reversed {
                TransferStatus::Reversed
            } else {
                TransferStatus::Pending
            },
        })
    }

    async fn create_sub_account(
        &self,
        req: &SubAccountRequest,
    ) -> Result<AccountSnapshot, ProcessorError> {
        let form = vec![
            ("type".to_string(), "express".to_string()),
            ("country".to_string(), req.country.clone()),
            ("email".to_string(), req.email.clone()),
            ("business_profile[name]".to_string(), req.business_name.clone()),
            ("metadata[tenant_id]".to_string(), req.tenant_id.clone()),
        ];
        let account: ApiAccount = self
            .post("v1/accounts", Some(&req.idempotency_key), &form)
            .await?;
        Ok(account.into())
    }

    async fn create_onboarding_link(
        &self,
        req: &OnboardingLinkRequest,
    ) -> Result<OnboardingLink, ProcessorError> {
        let form = vec![
            ("account".to_string(), req.account_id.clone()),
            ("refresh_url".to_string(), req.refresh_url.clone()),
            ("return_url".to_string(), req.return_url.clone()),
            ("type".to_string(), "account_onboarding".to_string()),
        ];
        let link: ApiAccountLink = self.post("v1/account_links", None, &form).await?;
        Ok(OnboardingLink {
            url: link.url,
            expires_at: link.expires_at,
        })
    }

    async fn retrieve_account(&self, account_id: &str) -> Result<AccountSnapshot, ProcessorError> {
        let account: ApiAccount = self.get(&format!("v1/accounts/{}", account_id)).await?;
        Ok(account.into())
    }
}

impl From<ApiPaymentIntent> for PaymentIntent {
    fn from(pi: ApiPaymentIntent) -> Self {
        PaymentIntent {
            id: pi.id,
            status: pi.status,
            amount_minor: pi.amount,
        }
    }
}

// =============================================================================
// Encoding / Error Mapping
// =============================================================================

fn charge_form(req: &ChargeRequest) -> Form {
    let mut form = vec![
        ("amount".to_string(), req.amount_minor.to_string()),
        ("currency".to_string(), req.currency.to_lowercase()),
        ("customer".to_string(), req.customer_id.clone()),
        ("payment_method".to_string(), req.payment_method.clone()),
        ("capture_method".to_string(), req.capture_mode.as_str().to_string()),
        ("confirm".to_string(), "true".to_string()),
        ("off_session".to_string(), "true".to_string()),
    ];
    if let Some(account) = &req.on_behalf_of {
        form.push(("on_behalf_of".to_string(), account.clone()));
    }
    if req.capture_mode == CaptureMode::Manual {
        form.push(("description".to_string(), "Security deposit".to_string()));
    }
    push_metadata(&mut form, &req.metadata);
    form
}

fn push_metadata(form: &mut Form, metadata: &Metadata) {
    for (key, value) in metadata {
        form.push((format!("metadata[{}]", key), value.clone()));
    }
}

fn map_transport_error(err: reqwest::Error) -> ProcessorError {
    if err.is_timeout() {
        ProcessorError::Timeout
    } else if err.is_builder() {
        ProcessorError::InvalidRequest(err.to_string())
    } else {
        ProcessorError::Unavailable(err.to_string())
    }
}

async fn read_response<T: DeserializeOwned>(response: Response) -> Result<T, ProcessorError> {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);

    let body = response.text().await.map_err(|e| {
        if status.is_success() {
            ProcessorError::MalformedResponse(e.to_string())
        } else {
            ProcessorError::Unavailable(e.to_string())
        }
    })?;

    if status.is_success() {
        serde_json::from_str(&body).map_err(|e| ProcessorError::MalformedResponse(e.to_string()))
    } else {
        Err(map_error_response(status, retry_after, &body))
    }
}

/// Maps a non-2xx processor response onto the failure taxonomy.
fn map_error_response(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ProcessorError {
    let detail = serde_json::from_str::<ApiErrorBody>(body)
        .unwrap_or_default()
        .error;
    let message = detail
        .message
        .clone()
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
    let code = detail.decline_code.clone().or(detail.code.clone());

    match status {
        StatusCode::PAYMENT_REQUIRED => match code.as_deref() {
            Some("insufficient_funds") => ProcessorError::InsufficientFunds,
            other => ProcessorError::CardDeclined {
                code: other.unwrap_or("card_declined").to_string(),
                message,
            },
        },
        StatusCode::TOO_MANY_REQUESTS => ProcessorError::RateLimited { retry_after },
        // Another request with the same key is still running.
        StatusCode::CONFLICT => ProcessorError::Unavailable(message),
        StatusCode::UNAUTHORIZED => {
            ProcessorError::InvalidRequest(format!("authentication failed: {}", message))
        }
        StatusCode::FORBIDDEN => ProcessorError::AccountRestricted(message),
        s if s.is_server_error() => ProcessorError::Unavailable(format!("HTTP {}: {}", s.as_u16(), message)),
        _ => match detail.code.as_deref() {
            Some(c) if c.starts_with("account_") => ProcessorError::AccountRestricted(message),
            _ => ProcessorError::InvalidRequest(message),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_body(code: &str, decline: Option<&str>) -> String {
        serde_json::json!({
            "error": { "code": code, "decline_code": decline, "message": "nope" }
        })
        .to_string()
    }

    #[test]
    fn test_declines() {
        let err = map_error_response(
            StatusCode::PAYMENT_REQUIRED,
            None,
            &error_body("card_declined", Some("insufficient_funds")),
        );
        assert_eq!(err, ProcessorError::InsufficientFunds);

        let err = map_error_response(
            StatusCode::PAYMENT_REQUIRED,
            None,
            &error_body("card_declined", Some("stolen_card")),
        );
        assert!(matches!(err, ProcessorError::CardDeclined { code, .. } if code == "stolen_card"));
    }

    #[test]
    fn test_transient_and_restricted() {
        let err = map_error_response(
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(2)),
            "",
        );
        assert_eq!(
            err,
            ProcessorError::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            }
        );
        assert!(map_error_response(StatusCode::BAD_GATEWAY, None, "<html>").is_retryable());
        assert!(matches!(
            map_error_response(
                StatusCode::BAD_REQUEST,
                None,
                &error_body("account_invalid", None)
            ),
            ProcessorError::AccountRestricted(_)
        ));
        assert!(matches!(
            map_error_response(StatusCode::BAD_REQUEST, None, &error_body("parameter_missing", None)),
            ProcessorError::InvalidRequest(m) if m == "nope"
        ));
    }

    #[test]
    fn test_charge_form() {
        let mut metadata = Metadata::new();
        metadata.insert("booking_id".into(), "bk_1".into());
        let form = charge_form(&ChargeRequest {
            idempotency_key: "k".into(),
            amount_minor: 50000,
            currency: "USD".into(),
            customer_id: "cus_1".into(),
            payment_method: "pm_card_1".into(),
            capture_mode: CaptureMode::Manual,
            on_behalf_of: Some("acct_1".into()),
            metadata,
        });

        let get = |k: &str| form.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());
        assert_eq!(get("amount"), Some("50000"));
        assert_eq!(get("currency"), Some("usd"));
        assert_eq!(get("payment_method"), Some("pm_card_1"));
        assert_eq!(get("off_session"), Some("true"));
        assert_eq!(get("capture_method"), Some("manual"));
        assert_eq!(get("on_behalf_of"), Some("acct_1"));
        assert_eq!(get("metadata[booking_id]"), Some("bk_1"));
    }

    #[test]
    fn test_account_snapshot_from_wire() {
        let account: ApiAccount = serde_json::from_str(
            r#"{"id":"acct_1","charges_enabled":true,"payouts_enabled":false,
                "details_submitted":true,"requirements":{"past_due":["external_account"]}}"#,
        )
        .unwrap();
        let snapshot = AccountSnapshot::from(account);
        assert_eq!(snapshot.processor_account_id, "acct_1");
        assert_eq!(snapshot.past_due, vec!["external_account".to_string()]);
        assert!(snapshot.currently_due.is_empty());
    }

    #[test]
    fn test_endpoint_join() {
        let mut settings = ProcessorSettings::default();
        settings.base_url = "https://processor.test/".into();
        let client = HttpProcessorClient::new(&settings).unwrap();
        assert_eq!(
            client.endpoint("v1/refunds").unwrap().as_str(),
            "https://processor.test/v1/refunds"
        );
    }
}
