//! Scripted payment gateway.

use checkout_core::gateway::{
    GatewayError, GatewayFuture, PaymentGateway, PaymentRedirect, PaymentRequest,
    PaymentVerification,
};
use checkout_core::types::Money;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Script {
    request_results: VecDeque<Result<(), GatewayError>>,
    verify_results: VecDeque<Result<PaymentVerification, GatewayError>>,
    requests: Vec<PaymentRequest>,
    verifications: Vec<(String, Money)>,
}

/// Gateway whose answers are queued by the test.
///
/// Unscripted calls succeed: requests get authority `A000001`, `A000002`, …
/// and verifications report success with a matching `ref_id`.
#[derive(Clone)]
pub struct ScriptedGateway {
    name: String,
    script: Arc<Mutex<Script>>,
    counter: Arc<AtomicU64>,
}

impl ScriptedGateway {
    /// Gateway registered as `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Arc::new(Mutex::new(Script::default())),
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next payment request fail.
    pub fn fail_next_request(&self, error: GatewayError) {
        self.script().request_results.push_back(Err(error));
    }

    /// Makes the next verification report a declined payment.
    pub fn decline_next_verification(&self, message: impl Into<String>) {
        self.script().verify_results.push_back(Ok(PaymentVerification {
            success: false,
            ref_id: None,
            message: Some(message.into()),
        }));
    }

    /// Makes the next verification fail.
    pub fn fail_next_verification(&self, error: GatewayError) {
        self.script().verify_results.push_back(Err(error));
    }

    /// Payment requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<PaymentRequest> {
        self.script().requests.clone()
    }

    /// Authorities verified so far, with the amount presented.
    #[must_use]
    pub fn verifications(&self) -> Vec<(String, Money)> {
        self.script().verifications.clone()
    }
}

impl PaymentGateway for ScriptedGateway {
    fn name(&self) -> &str {
        &self.name
    }

    fn request_payment(&self, request: PaymentRequest) -> GatewayFuture<'_, PaymentRedirect> {
        let scripted = {
            let mut script = self.script();
            script.requests.push(request);
            script.request_results.pop_front()
        };
        Box::pin(async move {
            if let Some(Err(error)) = scripted {
                return Err(error);
            }
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            let authority = format!("A{n:06}");
            Ok(PaymentRedirect {
                redirect_url: format!("https://pay.example.test/{authority}"),
                authority,
            })
        })
    }

    fn verify_payment(
        &self,
        authority: String,
        amount: Money,
    ) -> GatewayFuture<'_, PaymentVerification> {
        let scripted = {
            let mut script = self.script();
            script.verifications.push((authority.clone(), amount));
            script.verify_results.pop_front()
        };
        Box::pin(async move {
            scripted.unwrap_or_else(|| {
                Ok(PaymentVerification {
                    success: true,
                    ref_id: Some(format!("REF-{authority}")),
                    message: None,
                })
            })
        })
    }
}

impl std::fmt::Debug for ScriptedGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedGateway")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use checkout_core::types::OrderId;

    fn request() -> PaymentRequest {
        PaymentRequest {
            order_id: OrderId::new(),
            amount: Money::from_minor(1_000),
            description: "order".into(),
            callback_url: "https://shop.test/callback".into(),
            contact: None,
        }
    }

    #[tokio::test]
    async fn issues_sequential_authorities() {
        let gateway = ScriptedGateway::new("sandbox");

        let first = gateway.request_payment(request()).await.unwrap();
        let second = gateway.request_payment(request()).await.unwrap();

        assert_eq!(first.authority, "A000001");
        assert_eq!(second.authority, "A000002");
        assert_eq!(gateway.requests().len(), 2);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let gateway = ScriptedGateway::new("sandbox");
        gateway.fail_next_request(GatewayError::Timeout);

        assert_eq!(
            gateway.request_payment(request()).await,
            Err(GatewayError::Timeout)
        );
        assert!(gateway.request_payment(request()).await.is_ok());
    }

    #[tokio::test]
    async fn declined_verification_is_not_an_error() {
        let gateway = ScriptedGateway::new("sandbox");
        gateway.decline_next_verification("cancelled by user");

        let result = gateway
            .verify_payment("A1".into(), Money::from_minor(5))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(gateway.verifications(), vec![("A1".to_string(), Money::from_minor(5))]);
    }
}
