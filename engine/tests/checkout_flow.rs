//! End-to-end checkout and payment settlement against the in-memory store.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use checkout_core::context::RequestContext;
use checkout_core::error::{BusinessRuleViolation, CheckoutError, DiscountRejection};
use checkout_core::gateway::{
    GatewayError, GatewayFuture, GatewayRegistry, PaymentGateway, PaymentRedirect, PaymentRequest,
    PaymentVerification,
};
use checkout_core::model::{
    CallbackStatus, DiscountUsageStatus, Order, OrderStatus, PaymentStatus, ProductVariant,
    WalletReservationStatus,
};
use checkout_core::types::{Money, UserId};
use checkout_engine::{
    CartLine, CheckoutOutcome, CheckoutService, CheckoutSettings, PaymentCleanupJob, PlaceOrder,
};
use checkout_runtime::retry::RetryPolicy;
use checkout_runtime::worker::PeriodicJob;
use checkout_testing::{InMemoryStore, MockClock, ScriptedGateway, fixtures, mock_clock};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    store: InMemoryStore,
    clock: MockClock,
    gateway: ScriptedGateway,
    checkout: CheckoutService,
    user: UserId,
}

impl Harness {
    fn new() -> Self {
        Self::with_retry(RetryPolicy::none())
    }

    fn with_retry(verify_retry: RetryPolicy) -> Self {
        let store = InMemoryStore::new();
        let clock = mock_clock();
        let gateway = ScriptedGateway::new("zarinpal");
        let settings = CheckoutSettings::builder()
            .payment_ttl(Duration::from_secs(15 * 60))
            .callback_url("https://shop.example.test/payments/callback")
            .verify_retry(verify_retry)
            .build();
        let checkout = CheckoutService::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            GatewayRegistry::new().with_gateway(Arc::new(gateway.clone())),
            settings,
        );
        Self {
            store,
            clock,
            gateway,
            checkout,
            user: UserId::new(),
        }
    }

    fn ctx(&self) -> RequestContext {
        RequestContext::for_user(self.user)
    }

    async fn variant(&self, sku: &str, on_hand: i64) -> ProductVariant {
        fixtures::seed_variant(&self.store, fixtures::variant(sku), on_hand)
            .await
            .unwrap()
    }

    async fn place(&self, request: PlaceOrder) -> Result<CheckoutOutcome, CheckoutError> {
        self.checkout.place_order(&self.ctx(), request).await
    }
}

fn cart(key: &str, lines: Vec<CartLine>) -> PlaceOrder {
    PlaceOrder {
        idempotency_key: key.to_string(),
        lines,
        discount_code: None,
        wallet_amount: None,
        contact: None,
    }
}

fn line(variant: &ProductVariant, quantity: u32, unit_price: u64) -> CartLine {
    CartLine {
        variant_id: variant.id,
        quantity,
        unit_price: Money::from_minor(unit_price),
    }
}

fn placed(outcome: CheckoutOutcome) -> (Order, Option<PaymentRedirect>) {
    match outcome {
        CheckoutOutcome::Placed { order, payment } => (order, payment),
        CheckoutOutcome::Duplicate { order } => panic!("expected a new order, got {}", order.id),
    }
}

#[tokio::test]
async fn paid_order_commits_every_hold() {
    let h = Harness::new();
    let shirt = h.variant("SHIRT", 10).await;
    let code = fixtures::seed_discount_code(&h.store, fixtures::percentage_code("SPRING10", 10, 5))
        .await
        .unwrap();
    fixtures::seed_wallet(&h.store, h.user, 300).await.unwrap();

    let mut request = cart("cart-1", vec![line(&shirt, 2, 1_000)]);
    request.discount_code = Some("spring10".into());
    request.wallet_amount = Some(Money::from_minor(300));
    let (order, redirect) = placed(h.place(request).await.unwrap());
    let redirect = redirect.expect("gateway payment owed");

    assert_eq!(order.subtotal, Money::from_minor(2_000));
    assert_eq!(order.discount_total, Money::from_minor(200));
    assert_eq!(order.total, Money::from_minor(1_800));
    assert_eq!(order.wallet_amount, Money::from_minor(300));
    assert_eq!(order.gateway_amount, Money::from_minor(1_500));
    assert_eq!(h.store.variant(shirt.id).unwrap().reserved, 2);
    let payment = h.store.payment(&redirect.authority).unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.amount, Money::from_minor(1_500));
    assert_eq!(h.gateway.requests()[0].callback_url, "https://shop.example.test/payments/callback");

    let settled = h
        .checkout
        .payments()
        .verify_payment(&h.ctx(), &redirect.authority, CallbackStatus::Ok)
        .await
        .unwrap();

    assert_eq!(settled.status, PaymentStatus::Success);
    assert_eq!(settled.ref_id.as_deref(), Some("REF-A000001"));
    assert_eq!(h.store.order(order.id).unwrap().status, OrderStatus::Paid);
    let stored = h.store.variant(shirt.id).unwrap();
    assert_eq!((stored.on_hand, stored.reserved), (8, 0));
    assert_eq!(h.store.discount_code(code.id).unwrap().usage_count, 1);
    let entries = h.store.wallet_entries(h.user);
    assert_eq!(entries.last().unwrap().amount_delta, -300);
    assert_eq!(entries.last().unwrap().balance_after, 0);
    let types = h.store.outbox_types();
    for expected in [
        "StockReserved.v1",
        "DiscountApplied.v1",
        "WalletReserved.v1",
        "OrderPlaced.v1",
        "PaymentInitiated.v1",
        "StockCommitted.v1",
        "DiscountConfirmed.v1",
        "WalletCommitted.v1",
        "OrderPaid.v1",
        "PaymentSucceeded.v1",
    ] {
        assert!(types.iter().any(|t| t == expected), "missing {expected}");
    }

    // A repeated callback changes nothing and does not call the gateway again.
    let again = h
        .checkout
        .payments()
        .verify_payment(&h.ctx(), &redirect.authority, CallbackStatus::Ok)
        .await
        .unwrap();
    assert_eq!(again.status, PaymentStatus::Success);
    assert_eq!(h.gateway.verifications().len(), 1);
}

#[tokio::test]
async fn retried_checkout_returns_the_original_order() {
    let h = Harness::new();
    let mug = h.variant("MUG", 10).await;

    let first = h.place(cart("cart-retry", vec![line(&mug, 2, 500)])).await.unwrap();
    let second = h.place(cart("cart-retry", vec![line(&mug, 2, 500)])).await.unwrap();

    assert!(matches!(second, CheckoutOutcome::Duplicate { .. }));
    assert_eq!(first.order().id, second.order().id);
    assert_eq!(h.store.variant(mug.id).unwrap().reserved, 2);
    assert_eq!(h.store.orders().len(), 1);
    assert_eq!(h.gateway.requests().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_of_one_key_create_one_order() {
    let h = Arc::new(Harness::new());
    let mug = h.variant("MUG", 10).await;

    let mut handles = Vec::new();
    for _ in 0..2 {
        let h = Arc::clone(&h);
        let request = cart("cart-race", vec![line(&mug, 3, 500)]);
        handles.push(tokio::spawn(async move { h.place(request).await }));
    }
    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(outcomes[0].order().id, outcomes[1].order().id);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, CheckoutOutcome::Duplicate { .. }))
            .count(),
        1
    );
    assert_eq!(h.store.orders().len(), 1);
    assert_eq!(h.store.variant(mug.id).unwrap().reserved, 3);
}

#[tokio::test]
async fn cancelled_callback_releases_every_hold_without_calling_the_gateway() {
    let h = Harness::new();
    let cap = h.variant("CAP", 5).await;
    let code = fixtures::seed_discount_code(&h.store, fixtures::fixed_code("FIVE", 500, 5))
        .await
        .unwrap();
    fixtures::seed_wallet(&h.store, h.user, 1_000).await.unwrap();

    let mut request = cart("cart-nok", vec![line(&cap, 1, 3_000)]);
    request.discount_code = Some("FIVE".into());
    request.wallet_amount = Some(Money::from_minor(1_000));
    let (order, redirect) = placed(h.place(request).await.unwrap());
    let authority = redirect.unwrap().authority;

    let payment = h
        .checkout
        .payments()
        .verify_payment(&h.ctx(), &authority, CallbackStatus::Nok)
        .await
        .unwrap();

    assert_eq!(payment.status, PaymentStatus::Failed);
    assert!(h.gateway.verifications().is_empty());
    let order = h.store.order(order.id).unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(h.store.variant(cap.id).unwrap().reserved, 0);
    assert_eq!(h.store.variant(cap.id).unwrap().on_hand, 5);
    assert_eq!(
        h.store.discount_usages(order.id)[0].status,
        DiscountUsageStatus::Cancelled
    );
    assert_eq!(h.store.discount_code(code.id).unwrap().usage_count, 0);
    let hold = h
        .store
        .wallet_reservation(order.wallet_reservation_id.unwrap())
        .unwrap();
    assert_eq!(hold.status, WalletReservationStatus::Released);
    assert_eq!(h.store.wallet_entries(h.user).len(), 1);
}

#[tokio::test]
async fn callback_after_the_deadline_expires_the_payment() {
    let h = Harness::new();
    let cap = h.variant("CAP", 5).await;
    fixtures::seed_wallet(&h.store, h.user, 100).await.unwrap();
    let mut request = cart("cart-late", vec![line(&cap, 1, 1_000)]);
    request.wallet_amount = Some(Money::from_minor(100));
    let (order, redirect) = placed(h.place(request).await.unwrap());

    h.clock.advance(chrono::Duration::minutes(16));
    let payment = h
        .checkout
        .payments()
        .verify_payment(&h.ctx(), &redirect.unwrap().authority, CallbackStatus::Ok)
        .await
        .unwrap();

    assert_eq!(payment.status, PaymentStatus::Expired);
    assert!(h.gateway.verifications().is_empty());
    let order = h.store.order(order.id).unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    let hold = h
        .store
        .wallet_reservation(order.wallet_reservation_id.unwrap())
        .unwrap();
    assert_eq!(hold.status, WalletReservationStatus::Expired);
}

#[tokio::test]
async fn declined_verification_cancels_the_order() {
    let h = Harness::new();
    let cap = h.variant("CAP", 5).await;
    let (order, redirect) = placed(h.place(cart("cart-declined", vec![line(&cap, 2, 700)])).await.unwrap());
    h.gateway.decline_next_verification("insufficient funds");

    let payment = h
        .checkout
        .payments()
        .verify_payment(&h.ctx(), &redirect.unwrap().authority, CallbackStatus::Ok)
        .await
        .unwrap();

    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(payment.failure_reason.as_deref(), Some("insufficient funds"));
    assert_eq!(h.store.order(order.id).unwrap().status, OrderStatus::Cancelled);
    assert_eq!(h.store.variant(cap.id).unwrap().available(), 5);
}

#[tokio::test]
async fn transient_verification_failure_leaves_the_payment_pending() {
    let h = Harness::with_retry(
        RetryPolicy::builder()
            .max_retries(1)
            .initial_delay(Duration::from_millis(1))
            .build(),
    );
    let cap = h.variant("CAP", 5).await;
    let (order, redirect) = placed(h.place(cart("cart-flaky", vec![line(&cap, 1, 700)])).await.unwrap());
    let authority = redirect.unwrap().authority;
    h.gateway.fail_next_verification(GatewayError::Timeout);
    h.gateway.fail_next_verification(GatewayError::Timeout);

    let err = h
        .checkout
        .payments()
        .verify_payment(&h.ctx(), &authority, CallbackStatus::Ok)
        .await
        .unwrap_err();

    assert!(matches!(err, CheckoutError::Gateway(GatewayError::Timeout)));
    assert_eq!(h.gateway.verifications().len(), 2);
    assert_eq!(h.store.payment(&authority).unwrap().status, PaymentStatus::Pending);
    assert_eq!(h.store.order(order.id).unwrap().status, OrderStatus::PendingPayment);

    let payment = h
        .checkout
        .payments()
        .verify_payment(&h.ctx(), &authority, CallbackStatus::Ok)
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Success);
}

#[tokio::test]
async fn webhooks_are_checked_against_the_issuing_gateway() {
    let h = Harness::new();
    let cap = h.variant("CAP", 5).await;
    let (order, redirect) = placed(h.place(cart("cart-hook", vec![line(&cap, 1, 700)])).await.unwrap());
    let authority = redirect.unwrap().authority;
    let payments = h.checkout.payments();

    let err = payments
        .process_webhook(&h.ctx(), "other-psp", &authority, CallbackStatus::Ok, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CheckoutError::BusinessRule(BusinessRuleViolation::GatewayMismatch { .. })
    ));
    assert_eq!(h.store.payment(&authority).unwrap().status, PaymentStatus::Pending);

    let paid = payments
        .process_webhook(&h.ctx(), "zarinpal", &authority, CallbackStatus::Ok, Some("R-77".into()))
        .await
        .unwrap();
    assert_eq!(paid.status, PaymentStatus::Success);
    assert_eq!(h.store.order(order.id).unwrap().status, OrderStatus::Paid);

    let redelivered = payments
        .process_webhook(&h.ctx(), "zarinpal", &authority, CallbackStatus::Nok, None)
        .await
        .unwrap();
    assert_eq!(redelivered.status, PaymentStatus::Success);
    assert_eq!(h.gateway.verifications().len(), 1);
}

#[tokio::test]
async fn cleanup_expires_abandoned_payments() {
    let h = Harness::new();
    let cap = h.variant("CAP", 5).await;
    fixtures::seed_wallet(&h.store, h.user, 200).await.unwrap();
    let mut request = cart("cart-abandoned", vec![line(&cap, 3, 700)]);
    request.wallet_amount = Some(Money::from_minor(200));
    let (order, redirect) = placed(h.place(request).await.unwrap());
    let authority = redirect.unwrap().authority;
    let job = PaymentCleanupJob::new(h.checkout.payments().clone());

    assert_eq!(job.run_once().await.unwrap().processed, 0);

    h.clock.advance(chrono::Duration::minutes(16));
    let run = job.run_once().await.unwrap();

    assert_eq!(run.processed, 1);
    assert!(!run.more);
    let payment = h.store.payment(&authority).unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(payment.failure_reason.as_deref(), Some("payment expired"));
    let order = h.store.order(order.id).unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(h.store.variant(cap.id).unwrap().reserved, 0);
    let hold = h
        .store
        .wallet_reservation(order.wallet_reservation_id.unwrap())
        .unwrap();
    assert_eq!(hold.status, WalletReservationStatus::Expired);

    assert_eq!(job.run_once().await.unwrap().processed, 0);
}

/// Accepts every request, then makes the store drop the next commit: the one
/// that would record the pending payment.
struct LosesPaymentRow {
    store: InMemoryStore,
}

impl PaymentGateway for LosesPaymentRow {
    fn name(&self) -> &str {
        "zarinpal"
    }

    fn request_payment(&self, _request: PaymentRequest) -> GatewayFuture<'_, PaymentRedirect> {
        self.store.fail_next_commit();
        Box::pin(async {
            Ok(PaymentRedirect {
                authority: "A-LOST".into(),
                redirect_url: "https://pay.example.test/A-LOST".into(),
            })
        })
    }

    fn verify_payment(&self, _authority: String, _amount: Money) -> GatewayFuture<'_, PaymentVerification> {
        Box::pin(async { Err(GatewayError::Timeout) })
    }
}

#[tokio::test]
async fn cleanup_cancels_orders_whose_payment_was_never_recorded() {
    let store = InMemoryStore::new();
    let clock = mock_clock();
    let checkout = CheckoutService::new(
        Arc::new(store.clone()),
        Arc::new(clock.clone()),
        GatewayRegistry::new().with_gateway(Arc::new(LosesPaymentRow {
            store: store.clone(),
        })),
        CheckoutSettings::builder()
            .payment_ttl(Duration::from_secs(15 * 60))
            .build(),
    );
    let ctx = RequestContext::for_user(UserId::new());
    let mug = fixtures::seed_variant(&store, fixtures::variant("MUG"), 5)
        .await
        .unwrap();

    let err = checkout
        .place_order(&ctx, cart("cart-lost-payment", vec![line(&mug, 2, 900)]))
        .await
        .unwrap_err();
    assert!(matches!(err, CheckoutError::Fatal(_)));

    let order = store.orders().pop().unwrap();
    assert_eq!(order.status, OrderStatus::PendingPayment);
    assert!(store.payments_for(order.id).is_empty());
    assert_eq!(store.variant(mug.id).unwrap().reserved, 2);

    let job = PaymentCleanupJob::new(checkout.payments().clone());
    assert_eq!(job.run_once().await.unwrap().processed, 0);

    clock.advance(chrono::Duration::minutes(16));
    assert_eq!(job.run_once().await.unwrap().processed, 1);

    assert_eq!(store.order(order.id).unwrap().status, OrderStatus::Cancelled);
    assert_eq!(store.variant(mug.id).unwrap().reserved, 0);
    assert_eq!(job.run_once().await.unwrap().processed, 0);
}

#[tokio::test]
async fn wallet_only_orders_are_settled_immediately() {
    let h = Harness::new();
    let book = h.variant("BOOK", 3).await;
    fixtures::seed_wallet(&h.store, h.user, 5_000).await.unwrap();
    let mut request = cart("cart-wallet", vec![line(&book, 2, 1_000)]);
    request.wallet_amount = Some(Money::from_minor(5_000));

    let (order, redirect) = placed(h.place(request).await.unwrap());

    assert!(redirect.is_none());
    assert_eq!(order.status, OrderStatus::Paid);
    assert_eq!(order.wallet_amount, Money::from_minor(2_000));
    assert!(h.gateway.requests().is_empty());
    assert_eq!(h.store.variant(book.id).unwrap().on_hand, 1);
    assert_eq!(h.store.wallet_entries(h.user).last().unwrap().balance_after, 3_000);
}

#[tokio::test]
async fn refused_payment_request_cancels_the_order() {
    let h = Harness::new();
    let cap = h.variant("CAP", 5).await;
    h.gateway
        .fail_next_request(GatewayError::Transport("connection refused".into()));

    let err = h
        .place(cart("cart-refused", vec![line(&cap, 2, 700)]))
        .await
        .unwrap_err();

    assert!(matches!(err, CheckoutError::Gateway(GatewayError::Transport(_))));
    let orders = h.store.orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].status, OrderStatus::Cancelled);
    assert_eq!(h.store.variant(cap.id).unwrap().reserved, 0);
    assert!(h.store.outbox_types().iter().any(|t| t == "PaymentFailed.v1"));
}

#[tokio::test]
async fn a_failing_line_rolls_back_the_whole_checkout() {
    let h = Harness::new();
    let plenty = h.variant("PLENTY", 10).await;
    let scarce = h.variant("SCARCE", 1).await;
    fixtures::seed_wallet(&h.store, h.user, 1_000).await.unwrap();
    let mut request = cart(
        "cart-partial",
        vec![line(&plenty, 2, 100), line(&scarce, 2, 100)],
    );
    request.wallet_amount = Some(Money::from_minor(100));

    let err = h.place(request).await.unwrap_err();

    assert!(matches!(
        err,
        CheckoutError::BusinessRule(BusinessRuleViolation::OutOfStock { .. })
    ));
    assert_eq!(h.store.variant(plenty.id).unwrap().reserved, 0);
    assert!(h.store.orders().is_empty());
    assert!(h.store.outbox_messages().is_empty());
    assert_eq!(h.store.wallet_entries(h.user).len(), 1);
}

#[tokio::test]
async fn rejected_discount_code_fails_the_checkout() {
    let h = Harness::new();
    let cap = h.variant("CAP", 5).await;
    let mut request = cart("cart-badcode", vec![line(&cap, 1, 700)]);
    request.discount_code = Some("MISSING".into());

    let err = h.place(request).await.unwrap_err();

    assert!(matches!(
        err,
        CheckoutError::BusinessRule(BusinessRuleViolation::DiscountRejected(
            DiscountRejection::NotFound
        ))
    ));
    assert_eq!(h.store.variant(cap.id).unwrap().reserved, 0);
}

#[tokio::test]
async fn checkout_requires_a_customer_and_a_key() {
    let h = Harness::new();
    let cap = h.variant("CAP", 5).await;

    let anonymous = h
        .checkout
        .place_order(&RequestContext::system(), cart("cart-anon", vec![line(&cap, 1, 700)]))
        .await
        .unwrap_err();
    let blank_key = h.place(cart("   ", vec![line(&cap, 1, 700)])).await.unwrap_err();

    assert!(matches!(
        anonymous,
        CheckoutError::BusinessRule(BusinessRuleViolation::MissingCustomer)
    ));
    assert!(matches!(
        blank_key,
        CheckoutError::BusinessRule(BusinessRuleViolation::InvalidIdempotencyKey)
    ));
}
