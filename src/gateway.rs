//! Payment gateway client.
//!
//! The settlement engine talks to the external provider only through
//! [`GatewayClient`]. Every call is a potentially slow, failing network hop:
//! timeouts are reported as failures and drive the same compensation path.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Gateway unreachable at {0}")]
    Connection(String),

    #[error("Gateway request timed out after {0}s")]
    Timeout(u64),

    #[error("Gateway returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Gateway response could not be parsed: {0}")]
    ResponseParsing(String),

    #[error("Gateway declined: {0}")]
    Declined(String),
}

/// Provider handles returned when a charge is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatedCharge {
    pub provider_transaction_id: String,
    pub checkout_reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeStatus {
    pub success: bool,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundReceipt {
    pub success: bool,
    pub refund_reference: Option<String>,
}

/// Capability interface over the external payment provider.
///
/// `correlation_id` is our payment `transaction_id`; reusing it is the only
/// idempotency the provider offers.
pub trait GatewayClient: Send + Sync {
    fn initiate(
        &self,
        amount: i64,
        correlation_id: &str,
        description: &str,
    ) -> Result<InitiatedCharge, GatewayError>;

    fn verify(&self, provider_transaction_id: &str) -> Result<ChargeStatus, GatewayError>;

    fn refund(
        &self,
        provider_transaction_id: &str,
        amount: i64,
        reason: &str,
    ) -> Result<RefundReceipt, GatewayError>;
}

// ─── HTTP client ──────────────────────────────────────────────────────────────

/// Merchant credentials sent with every request.
#[derive(Debug, Clone, Default)]
pub struct MerchantCredentials {
    pub merchant_id: String,
    pub store_id: String,
}

/// Blocking HTTP client for the provider's JSON API.
pub struct HttpGatewayClient {
    base_url: String,
    client: reqwest::blocking::Client,
    credentials: MerchantCredentials,
    timeout_secs: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InitiateRequest<'a> {
    amount: i64,
    order_id: &'a str,
    description: &'a str,
    merchant_id: &'a str,
    store_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitiateResponse {
    success: bool,
    transaction_id: Option<String>,
    payment_url: Option<String>,
    message: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefundRequest<'a> {
    transaction_id: &'a str,
    amount: i64,
    reason: &'a str,
    merchant_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefundResponse {
    success: bool,
    refund_transaction_id: Option<String>,
}

impl HttpGatewayClient {
    pub fn new(
        base_url: &str,
        credentials: MerchantCredentials,
        timeout_secs: u64,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| GatewayError::Connection(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            credentials,
            timeout_secs,
        })
    }

    fn map_send_error(&self, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout(self.timeout_secs)
        } else if e.is_connect() {
            GatewayError::Connection(self.base_url.clone())
        } else {
            GatewayError::Connection(e.to_string())
        }
    }

    fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::blocking::Response,
    ) -> Result<T, GatewayError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json()
            .map_err(|e| GatewayError::ResponseParsing(e.to_string()))
    }
}

impl GatewayClient for HttpGatewayClient {
    fn initiate(
        &self,
        amount: i64,
        correlation_id: &str,
        description: &str,
    ) -> Result<InitiatedCharge, GatewayError> {
        let url = format!("{}/payments/initiate", self.base_url);
        let body = InitiateRequest {
            amount,
            order_id: correlation_id,
            description,
            merchant_id: &self.credentials.merchant_id,
            store_id: &self.credentials.store_id,
        };
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| self.map_send_error(e))?;
        let parsed: InitiateResponse = self.read_json(response)?;

        match (parsed.success, parsed.transaction_id) {
            (true, Some(provider_transaction_id)) => Ok(InitiatedCharge {
                checkout_reference: parsed
                    .payment_url
                    .unwrap_or_else(|| format!("{}/pay?orderId={correlation_id}", self.base_url)),
                provider_transaction_id,
            }),
            _ => Err(GatewayError::Declined(
                parsed.message.unwrap_or_else(|| "charge not accepted".into()),
            )),
        }
    }

    fn verify(&self, provider_transaction_id: &str) -> Result<ChargeStatus, GatewayError> {
        let url = format!("{}/payments/{provider_transaction_id}/status", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| self.map_send_error(e))?;
        self.read_json(response)
    }

    fn refund(
        &self,
        provider_transaction_id: &str,
        amount: i64,
        reason: &str,
    ) -> Result<RefundReceipt, GatewayError> {
        let url = format!("{}/refunds", self.base_url);
        let body = RefundRequest {
            transaction_id: provider_transaction_id,
            amount,
            reason,
            merchant_id: &self.credentials.merchant_id,
        };
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| self.map_send_error(e))?;
        let parsed: RefundResponse = self.read_json(response)?;
        Ok(RefundReceipt {
            success: parsed.success,
            refund_reference: parsed.refund_transaction_id,
        })
    }
}

// ─── Sandbox ──────────────────────────────────────────────────────────────────

/// In-process gateway that accepts everything unless told to fail.
///
/// Used when no provider URL is configured and throughout the tests.
#[derive(Debug, Default)]
pub struct SandboxGateway {
    fail_initiate: AtomicBool,
    decline_verify: AtomicBool,
    fail_refund: AtomicBool,
    initiate_calls: AtomicUsize,
    refund_calls: AtomicUsize,
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_initiate(&self, fail: bool) {
        self.fail_initiate.store(fail, Ordering::SeqCst);
    }

    pub fn decline_verify(&self, decline: bool) {
        self.decline_verify.store(decline, Ordering::SeqCst);
    }

    pub fn fail_refund(&self, fail: bool) {
        self.fail_refund.store(fail, Ordering::SeqCst);
    }

    pub fn initiate_calls(&self) -> usize {
        self.initiate_calls.load(Ordering::SeqCst)
    }

    pub fn refund_calls(&self) -> usize {
        self.refund_calls.load(Ordering::SeqCst)
    }
}

impl GatewayClient for SandboxGateway {
    fn initiate(
        &self,
        _amount: i64,
        correlation_id: &str,
        _description: &str,
    ) -> Result<InitiatedCharge, GatewayError> {
        self.initiate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_initiate.load(Ordering::SeqCst) {
            return Err(GatewayError::Connection("sandbox".into()));
        }
        Ok(InitiatedCharge {
            provider_transaction_id: format!("SBX{}", Uuid::new_v4().simple()),
            checkout_reference: format!("sandbox://pay?orderId={correlation_id}"),
        })
    }

    fn verify(&self, _provider_transaction_id: &str) -> Result<ChargeStatus, GatewayError> {
        if self.decline_verify.load(Ordering::SeqCst) {
            return Ok(ChargeStatus {
                success: false,
                status: "failed".into(),
            });
        }
        Ok(ChargeStatus {
            success: true,
            status: "completed".into(),
        })
    }

    fn refund(
        &self,
        _provider_transaction_id: &str,
        _amount: i64,
        _reason: &str,
    ) -> Result<RefundReceipt, GatewayError> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_refund.load(Ordering::SeqCst) {
            return Err(GatewayError::Timeout(0));
        }
        Ok(RefundReceipt {
            success: true,
            refund_reference: Some(format!("SBXREF{}", Uuid::new_v4().simple())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_accepts_by_default() {
        let gw = SandboxGateway::new();
        let charge = gw.initiate(700, "TXN1", "Consultation").unwrap();
        assert!(charge.provider_transaction_id.starts_with("SBX"));
        assert!(charge.checkout_reference.contains("TXN1"));
        assert!(gw.verify(&charge.provider_transaction_id).unwrap().success);
        assert!(gw.refund(&charge.provider_transaction_id, 700, "x").unwrap().success);
        assert_eq!(gw.initiate_calls(), 1);
        assert_eq!(gw.refund_calls(), 1);
    }

    #[test]
    fn sandbox_failures_are_scriptable() {
        let gw = SandboxGateway::new();
        gw.fail_initiate(true);
        gw.decline_verify(true);
        gw.fail_refund(true);
        assert!(gw.initiate(700, "TXN1", "x").is_err());
        assert!(!gw.verify("SBX1").unwrap().success);
        assert!(gw.refund("SBX1", 10, "x").is_err());

        gw.fail_initiate(false);
        assert!(gw.initiate(700, "TXN1", "x").is_ok());
    }

    #[test]
    fn unreachable_http_gateway_is_a_failure() {
        // nothing listens on port 9 (discard) in test environments
        let client = HttpGatewayClient::new(
            "http://127.0.0.1:9/",
            MerchantCredentials::default(),
            1,
        )
        .unwrap();
        let err = client.initiate(100, "TXN1", "x").unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Connection(_) | GatewayError::Timeout(_)
        ));
    }
}
