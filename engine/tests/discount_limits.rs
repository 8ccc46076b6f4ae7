//! Discount usage cap under sequential and concurrent redemption.

#![allow(clippy::unwrap_used)]

use checkout_core::context::RequestContext;
use checkout_core::error::DiscountRejection;
use checkout_core::model::{DiscountApplication, DiscountUsageStatus};
use checkout_core::types::{Money, OrderId, UserId};
use checkout_engine::{ApplyDiscount, DiscountService};
use checkout_testing::{InMemoryStore, fixtures, test_clock};
use std::sync::Arc;

fn service(store: &InMemoryStore) -> DiscountService {
    DiscountService::new(Arc::new(store.clone()), Arc::new(test_clock()))
}

fn apply(code: &str) -> ApplyDiscount {
    ApplyDiscount {
        code: code.to_string(),
        order_total: Money::from_minor(10_000),
        user_id: UserId::new(),
        order_id: OrderId::new(),
        lines: Vec::new(),
    }
}

#[tokio::test]
async fn nth_redemption_succeeds_and_the_next_is_rejected() {
    let store = InMemoryStore::new();
    fixtures::seed_discount_code(&store, fixtures::fixed_code("LIMITED", 500, 3))
        .await
        .unwrap();
    let discounts = service(&store);
    let ctx = RequestContext::system();

    for _ in 0..3 {
        let outcome = discounts.validate_and_apply(&ctx, apply("LIMITED")).await.unwrap();
        assert!(matches!(outcome, DiscountApplication::Applied { .. }));
    }
    let fourth = discounts.validate_and_apply(&ctx, apply("LIMITED")).await.unwrap();

    assert_eq!(
        fourth,
        DiscountApplication::Rejected(DiscountRejection::UsageLimitReached)
    );
}

#[tokio::test]
async fn cancelled_usages_free_their_slot() {
    let store = InMemoryStore::new();
    let code = fixtures::seed_discount_code(&store, fixtures::fixed_code("ONEOFF", 500, 1))
        .await
        .unwrap();
    let discounts = service(&store);
    let ctx = RequestContext::system();
    let first = apply("ONEOFF");
    let order_id = first.order_id;

    discounts.validate_and_apply(&ctx, first).await.unwrap();
    assert_eq!(
        discounts.validate_and_apply(&ctx, apply("ONEOFF")).await.unwrap(),
        DiscountApplication::Rejected(DiscountRejection::UsageLimitReached)
    );

    assert!(discounts.cancel(&ctx, code.id, order_id).await.unwrap());
    assert!(!discounts.cancel(&ctx, code.id, order_id).await.unwrap());
    assert_eq!(
        store.discount_usages(order_id)[0].status,
        DiscountUsageStatus::Cancelled
    );

    let retry = discounts.validate_and_apply(&ctx, apply("ONEOFF")).await.unwrap();
    assert!(matches!(retry, DiscountApplication::Applied { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simultaneous_attempts_at_the_boundary_admit_exactly_one() {
    let store = InMemoryStore::new();
    let code = fixtures::seed_discount_code(&store, fixtures::percentage_code("LAST1", 20, 5))
        .await
        .unwrap();
    let discounts = service(&store);
    let ctx = RequestContext::system();

    // Bring the code to one redemption below its cap.
    for _ in 0..4 {
        let request = apply("LAST1");
        let order_id = request.order_id;
        discounts.validate_and_apply(&ctx, request).await.unwrap();
        assert!(discounts.confirm(&ctx, code.id, order_id).await.unwrap());
    }

    let mut handles = Vec::new();
    for _ in 0..2 {
        let discounts = discounts.clone();
        handles.push(tokio::spawn(async move {
            discounts
                .validate_and_apply(&RequestContext::system(), apply("LAST1"))
                .await
                .unwrap()
        }));
    }
    let mut applied = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            DiscountApplication::Applied { .. } => applied += 1,
            DiscountApplication::Rejected(DiscountRejection::UsageLimitReached) => rejected += 1,
            DiscountApplication::Rejected(_) => {}
        }
    }

    assert_eq!((applied, rejected), (1, 1));
    let stored = store.discount_code(code.id).unwrap();
    assert_eq!(stored.usage_count, 4);
    assert!(stored.usage_count <= stored.max_usage);
}

#[tokio::test]
async fn expired_and_inactive_codes_are_rejected() {
    let store = InMemoryStore::new();
    let mut expired = fixtures::fixed_code("OLD", 500, 10);
    expired.expires_at = Some(checkout_testing::epoch());
    let mut inactive = fixtures::fixed_code("OFF", 500, 10);
    inactive.is_active = false;
    fixtures::seed_discount_code(&store, expired).await.unwrap();
    fixtures::seed_discount_code(&store, inactive).await.unwrap();
    let discounts = service(&store);
    let ctx = RequestContext::system();

    assert_eq!(
        discounts.validate_and_apply(&ctx, apply("OLD")).await.unwrap(),
        DiscountApplication::Rejected(DiscountRejection::Expired)
    );
    assert_eq!(
        discounts.validate_and_apply(&ctx, apply("off")).await.unwrap(),
        DiscountApplication::Rejected(DiscountRejection::Inactive)
    );
}
