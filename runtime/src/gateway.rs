//! Payment gateway implementations.
//!
//! - [`ZarinpalGateway`]: the Zarinpal v4 REST API over `reqwest`.
//! - [`SandboxGateway`]: in-process gateway for local runs; every payment
//!   succeeds.
//! - [`GuardedGateway`]: wraps any gateway with a [`CircuitBreaker`] and call
//!   latency metrics.

use crate::circuit_breaker::{CircuitBreaker, CircuitError};
use checkout_core::gateway::{
    GatewayError, GatewayFuture, GatewayResult, PaymentGateway, PaymentRedirect, PaymentRequest,
    PaymentVerification,
};
use checkout_core::types::Money;
use metrics::histogram;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Zarinpal code for an accepted request or a verified payment.
const CODE_OK: i64 = 100;
/// Zarinpal code for a payment that was already verified.
const CODE_ALREADY_VERIFIED: i64 = 101;

/// Zarinpal connection settings.
#[derive(Debug, Clone)]
pub struct ZarinpalConfig {
    /// Merchant id issued by Zarinpal.
    pub merchant_id: String,
    /// API base, `https://api.zarinpal.com` or `https://sandbox.zarinpal.com`.
    pub base_url: String,
    /// Payment page base; the authority is appended.
    pub start_pay_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl ZarinpalConfig {
    /// Production endpoints for `merchant_id`.
    #[must_use]
    pub fn new(merchant_id: impl Into<String>) -> Self {
        Self {
            merchant_id: merchant_id.into(),
            base_url: "https://api.zarinpal.com".to_string(),
            start_pay_url: "https://www.zarinpal.com/pg/StartPay".to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Overrides the API base. A sandbox base also switches the payment page.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.contains("sandbox") {
            self.start_pay_url = "https://sandbox.zarinpal.com/pg/StartPay".to_string();
        }
        self.base_url = base_url;
        self
    }

    /// Overrides the request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Serialize)]
struct RequestBody<'a> {
    merchant_id: &'a str,
    amount: u64,
    description: &'a str,
    callback_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<Metadata<'a>>,
}

#[derive(Serialize)]
struct Metadata<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mobile: Option<&'a str>,
    order_id: String,
}

#[derive(Serialize)]
struct VerifyBody<'a> {
    merchant_id: &'a str,
    amount: u64,
    authority: &'a str,
}

/// Zarinpal answers `{"data": {...}, "errors": {...}}`; whichever side is
/// unused comes back as an empty array.
#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Value,
    #[serde(default)]
    errors: Value,
}

impl Envelope {
    fn code(&self) -> Option<i64> {
        self.data.get("code").and_then(Value::as_i64)
    }

    fn data_str(&self, field: &str) -> Option<String> {
        match self.data.get(field)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn error(&self) -> (i64, String) {
        let code = self
            .errors
            .get("code")
            .and_then(Value::as_i64)
            .or_else(|| self.code())
            .unwrap_or_default();
        let message = self
            .errors
            .get("message")
            .or_else(|| self.data.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        (code, message)
    }
}

/// Zarinpal v4 gateway.
#[derive(Clone)]
pub struct ZarinpalGateway {
    client: Client,
    config: ZarinpalConfig,
}

impl ZarinpalGateway {
    /// Name used in configuration.
    pub const NAME: &'static str = "zarinpal";

    /// Gateway for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the HTTP client cannot be built.
    pub fn new(config: ZarinpalConfig) -> GatewayResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self { client, config })
    }

    async fn post<B: Serialize + Sync>(&self, path: &str, body: &B) -> GatewayResult<Envelope> {
        let response = self
            .client
            .post(format!("{}{path}", self.config.base_url))
            .header("accept", "application/json")
            .json(body)
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(GatewayError::Transport(format!("HTTP {status}")));
        }
        // 4xx responses still carry the JSON envelope with the error code.
        response
            .json::<Envelope>()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }

    async fn request(&self, request: PaymentRequest) -> GatewayResult<PaymentRedirect> {
        let contact = request.contact.as_deref();
        let body = RequestBody {
            merchant_id: &self.config.merchant_id,
            amount: request.amount.minor(),
            description: &request.description,
            callback_url: &request.callback_url,
            metadata: Some(Metadata {
                email: contact.filter(|c| c.contains('@')),
                mobile: contact.filter(|c| !c.contains('@')),
                order_id: request.order_id.to_string(),
            }),
        };
        let envelope = self.post("/pg/v4/payment/request.json", &body).await?;

        if envelope.code() != Some(CODE_OK) {
            let (code, message) = envelope.error();
            return Err(GatewayError::Rejected { code, message });
        }
        let authority = envelope
            .data_str("authority")
            .ok_or_else(|| GatewayError::InvalidResponse("missing authority".to_string()))?;
        Ok(PaymentRedirect {
            redirect_url: format!("{}/{authority}", self.config.start_pay_url),
            authority,
        })
    }

    async fn verify(&self, authority: String, amount: Money) -> GatewayResult<PaymentVerification> {
        let body = VerifyBody {
            merchant_id: &self.config.merchant_id,
            amount: amount.minor(),
            authority: &authority,
        };
        let envelope = self.post("/pg/v4/payment/verify.json", &body).await?;

        match envelope.code() {
            Some(CODE_OK | CODE_ALREADY_VERIFIED) => Ok(PaymentVerification {
                success: true,
                ref_id: envelope.data_str("ref_id"),
                message: None,
            }),
            _ => {
                let (code, message) = envelope.error();
                Ok(PaymentVerification {
                    success: false,
                    ref_id: None,
                    message: Some(format!("{message} (code {code})")),
                })
            }
        }
    }
}

fn map_transport(error: reqwest::Error) -> GatewayError {
    if error.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Transport(error.to_string())
    }
}

impl PaymentGateway for ZarinpalGateway {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn request_payment(&self, request: PaymentRequest) -> GatewayFuture<'_, PaymentRedirect> {
        Box::pin(self.request(request))
    }

    fn verify_payment(&self, authority: String, amount: Money) -> GatewayFuture<'_, PaymentVerification> {
        Box::pin(self.verify(authority, amount))
    }
}

/// Gateway that accepts every payment without leaving the process.
#[derive(Debug, Clone)]
pub struct SandboxGateway {
    pay_url: String,
}

impl SandboxGateway {
    /// Name used in configuration.
    pub const NAME: &'static str = "sandbox";

    /// Sandbox whose payment pages live under `pay_url`.
    #[must_use]
    pub fn new(pay_url: impl Into<String>) -> Self {
        Self {
            pay_url: pay_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for SandboxGateway {
    fn default() -> Self {
        Self::new("http://localhost:8080/sandbox/pay")
    }
}

impl PaymentGateway for SandboxGateway {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn request_payment(&self, request: PaymentRequest) -> GatewayFuture<'_, PaymentRedirect> {
        Box::pin(async move {
            if request.amount.is_zero() {
                return Err(GatewayError::Rejected {
                    code: -9,
                    message: "amount must be positive".to_string(),
                });
            }
            let authority = format!("SBX{}", uuid::Uuid::new_v4().simple());
            tracing::debug!(order_id = %request.order_id, authority = %authority, "Sandbox payment requested");
            Ok(PaymentRedirect {
                redirect_url: format!("{}/{authority}", self.pay_url),
                authority,
            })
        })
    }

    fn verify_payment(&self, authority: String, _amount: Money) -> GatewayFuture<'_, PaymentVerification> {
        Box::pin(async move {
            Ok(PaymentVerification {
                success: true,
                ref_id: Some(format!("SBX-REF-{}", authority.trim_start_matches("SBX"))),
                message: None,
            })
        })
    }
}

/// Gateway behind a circuit breaker.
///
/// Only transient failures count against the breaker. While it is open,
/// calls fail with [`GatewayError::CircuitOpen`] without reaching the
/// provider.
#[derive(Clone)]
pub struct GuardedGateway {
    inner: Arc<dyn PaymentGateway>,
    breaker: CircuitBreaker,
}

impl GuardedGateway {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn PaymentGateway>, breaker: CircuitBreaker) -> Self {
        Self { inner, breaker }
    }

    /// The breaker in front of the provider.
    #[must_use]
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn guarded<T, F, Fut>(&self, call: &'static str, operation: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let started = Instant::now();
        let result = self
            .breaker
            .call(operation, GatewayError::is_transient)
            .await;
        histogram!(
            "payment_gateway_duration_seconds",
            "gateway" => self.inner.name().to_string(),
            "call" => call
        )
        .record(started.elapsed().as_secs_f64());

        result.map_err(|error| match error {
            CircuitError::Open => GatewayError::CircuitOpen,
            CircuitError::Inner(inner) => inner,
        })
    }
}

impl PaymentGateway for GuardedGateway {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn request_payment(&self, request: PaymentRequest) -> GatewayFuture<'_, PaymentRedirect> {
        Box::pin(async move {
            self.guarded("request", || self.inner.request_payment(request))
                .await
        })
    }

    fn verify_payment(&self, authority: String, amount: Money) -> GatewayFuture<'_, PaymentVerification> {
        Box::pin(async move {
            self.guarded("verify", || self.inner.verify_payment(authority, amount))
                .await
        })
    }
}
