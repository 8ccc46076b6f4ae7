//! Inventory reservation manager against the in-memory store.

#![allow(clippy::unwrap_used)]

use checkout_core::context::RequestContext;
use checkout_core::error::{BusinessRuleViolation, CheckoutError};
use checkout_core::model::{InventoryTransactionType, StockLevels};
use checkout_core::types::{ReferenceNumber, RowVersion};
use checkout_engine::{InventoryService, ReserveStock};
use checkout_testing::properties::{StockOp, stock_ops};
use checkout_testing::{InMemoryStore, fixtures, test_clock};
use proptest::prelude::*;
use std::sync::Arc;

fn service(store: &InMemoryStore) -> InventoryService {
    InventoryService::new(Arc::new(store.clone()), Arc::new(test_clock()))
}

fn reference(n: u32) -> ReferenceNumber {
    ReferenceNumber::new(format!("ORD-TEST-{n}"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_buyers_for_six_of_ten_units_one_wins() {
    let store = InMemoryStore::new();
    let variant = fixtures::seed_variant(&store, fixtures::variant("TEE-M"), 10)
        .await
        .unwrap();
    let inventory = service(&store);

    let mut handles = Vec::new();
    for n in 0..2 {
        let inventory = inventory.clone();
        handles.push(tokio::spawn(async move {
            inventory
                .reserve(
                    &RequestContext::system(),
                    ReserveStock::new(variant.id, 6, reference(n)),
                )
                .await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        let result = handle.await.unwrap();
        assert!(
            result.is_ok()
                || matches!(
                    result,
                    Err(CheckoutError::ConcurrencyConflict { .. }
                        | CheckoutError::BusinessRule(BusinessRuleViolation::OutOfStock { .. }))
                ),
            "unexpected result: {result:?}"
        );
        if result.is_ok() {
            successes += 1;
        }
    }

    assert_eq!(successes, 1);
    let stored = store.variant(variant.id).unwrap();
    assert_eq!(stored.reserved, 6);
    assert_eq!(stored.available(), 4);
    assert_eq!(store.ledger_levels(variant.id), stored.levels());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_never_oversell() {
    let store = InMemoryStore::new();
    let variant = fixtures::seed_variant(&store, fixtures::variant("MUG"), 7)
        .await
        .unwrap();
    let inventory = service(&store);

    let mut handles = Vec::new();
    for n in 0..20 {
        let inventory = inventory.clone();
        handles.push(tokio::spawn(async move {
            inventory
                .reserve(
                    &RequestContext::system(),
                    ReserveStock::new(variant.id, 1, reference(n)),
                )
                .await
                .is_ok()
        }));
    }
    let mut reserved = 0;
    for handle in handles {
        if handle.await.unwrap() {
            reserved += 1;
        }
    }

    let stored = store.variant(variant.id).unwrap();
    assert!(reserved <= 7);
    assert_eq!(stored.reserved, reserved);
    assert!(stored.available() >= 0);
    assert_eq!(store.ledger_levels(variant.id), stored.levels());
}

#[tokio::test]
async fn stale_row_version_is_a_conflict() {
    let store = InMemoryStore::new();
    let variant = fixtures::seed_variant(&store, fixtures::variant("CAP"), 5)
        .await
        .unwrap();
    let inventory = service(&store);
    let ctx = RequestContext::system();

    inventory
        .reserve(&ctx, ReserveStock::new(variant.id, 1, reference(1)))
        .await
        .unwrap();
    let err = inventory
        .reserve(
            &ctx,
            ReserveStock::new(variant.id, 1, reference(2)).expecting(RowVersion::INITIAL),
        )
        .await
        .unwrap_err();

    assert!(err.is_conflict());
    assert_eq!(store.variant(variant.id).unwrap().reserved, 1);
}

#[tokio::test]
async fn out_of_stock_reports_what_is_left() {
    let store = InMemoryStore::new();
    let variant = fixtures::seed_variant(&store, fixtures::variant("SOCKS"), 2)
        .await
        .unwrap();

    let err = service(&store)
        .reserve(
            &RequestContext::system(),
            ReserveStock::new(variant.id, 3, reference(1)),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CheckoutError::BusinessRule(BusinessRuleViolation::OutOfStock {
            requested: 3,
            available: 2,
            ..
        })
    ));
    assert!(store.outbox_messages().is_empty());
}

#[tokio::test]
async fn commit_and_release_are_idempotent() {
    let store = InMemoryStore::new();
    let variant = fixtures::seed_variant(&store, fixtures::variant("HOODIE"), 10)
        .await
        .unwrap();
    let inventory = service(&store);
    let ctx = RequestContext::system();

    inventory
        .reserve(&ctx, ReserveStock::new(variant.id, 3, reference(1)))
        .await
        .unwrap();
    inventory
        .reserve(&ctx, ReserveStock::new(variant.id, 2, reference(2)))
        .await
        .unwrap();

    assert_eq!(inventory.commit(&ctx, &reference(1)).await.unwrap().len(), 1);
    assert!(inventory.commit(&ctx, &reference(1)).await.unwrap().is_empty());
    assert!(inventory.release(&ctx, &reference(1)).await.unwrap().is_empty());

    assert_eq!(inventory.release(&ctx, &reference(2)).await.unwrap().len(), 1);
    assert!(inventory.release(&ctx, &reference(2)).await.unwrap().is_empty());
    assert!(inventory.commit(&ctx, &reference(2)).await.unwrap().is_empty());

    let stored = store.variant(variant.id).unwrap();
    assert_eq!(stored.on_hand, 7);
    assert_eq!(stored.reserved, 0);
    assert_eq!(store.ledger_levels(variant.id), stored.levels());
    assert_eq!(
        store.outbox_types(),
        vec![
            "StockReserved.v1",
            "StockReserved.v1",
            "StockCommitted.v1",
            "StockReleased.v1"
        ]
    );
}

#[tokio::test]
async fn release_then_reconcile_restores_the_original_counters() {
    let store = InMemoryStore::new();
    let variant = fixtures::seed_variant(&store, fixtures::variant("SCARF"), 10)
        .await
        .unwrap();
    let inventory = service(&store);
    let ctx = RequestContext::system();
    let before = store.variant(variant.id).unwrap().levels();

    inventory
        .reserve(&ctx, ReserveStock::new(variant.id, 4, reference(1)))
        .await
        .unwrap();
    inventory.release(&ctx, &reference(1)).await.unwrap();
    let corrected = inventory.reconcile(&ctx, variant.id).await.unwrap();

    assert!(!corrected);
    assert_eq!(store.variant(variant.id).unwrap().levels(), before);
}

#[tokio::test]
async fn reconcile_repairs_drifted_counters() {
    let store = InMemoryStore::new();
    let variant = fixtures::seed_variant(&store, fixtures::variant("BELT"), 10)
        .await
        .unwrap();
    let inventory = service(&store);
    let ctx = RequestContext::system();
    inventory
        .reserve(&ctx, ReserveStock::new(variant.id, 2, reference(1)))
        .await
        .unwrap();
    store.set_cached_counters(variant.id, 12, 0);

    assert!(inventory.reconcile(&ctx, variant.id).await.unwrap());
    assert!(!inventory.reconcile(&ctx, variant.id).await.unwrap());

    let stored = store.variant(variant.id).unwrap();
    assert_eq!(stored.levels(), StockLevels { on_hand: 10, reserved: 2 });
    let audit = store
        .inventory_ledger(variant.id)
        .into_iter()
        .find(|row| row.kind == InventoryTransactionType::Reconcile)
        .unwrap();
    assert_eq!(audit.quantity_change, 2);
    assert_eq!(store.ledger_levels(variant.id), stored.levels());
    assert!(store.outbox_types().contains(&"StockReconciled.v1".to_string()));
}

#[tokio::test]
async fn adjustments_cannot_strand_reservations() {
    let store = InMemoryStore::new();
    let variant = fixtures::seed_variant(&store, fixtures::variant("GLOVES"), 5)
        .await
        .unwrap();
    let inventory = service(&store);
    let ctx = RequestContext::system();
    inventory
        .reserve(&ctx, ReserveStock::new(variant.id, 4, reference(1)))
        .await
        .unwrap();

    let err = inventory
        .adjust_stock(&ctx, variant.id, -2, "damaged")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CheckoutError::BusinessRule(BusinessRuleViolation::InvalidQuantity(_))
    ));

    let adjusted = inventory
        .adjust_stock(&ctx, variant.id, 20, "delivery")
        .await
        .unwrap();
    assert_eq!(adjusted.on_hand, 25);
    assert_eq!(
        inventory.availability(variant.id).await.unwrap().available(),
        21
    );
}

#[tokio::test]
async fn registered_variants_start_with_an_opening_row() {
    let store = InMemoryStore::new();
    let inventory = service(&store);

    let variant = inventory
        .register_variant(&RequestContext::system(), fixtures::variant("BAG"), 8)
        .await
        .unwrap();

    assert_eq!(store.ledger_levels(variant.id).on_hand, 8);
    assert_eq!(store.variant(variant.id).unwrap().on_hand, 8);
}

#[tokio::test]
async fn unknown_variants_are_not_found() {
    let store = InMemoryStore::new();

    let err = service(&store)
        .reserve(
            &RequestContext::system(),
            ReserveStock::new(checkout_core::types::VariantId::new(), 1, reference(1)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CheckoutError::NotFound { entity: "product_variant", .. }));
}

async fn apply_ops(ops: Vec<StockOp>) -> (StockLevels, StockLevels) {
    let store = InMemoryStore::new();
    let variant = fixtures::seed_variant(&store, fixtures::variant("PROP"), 10)
        .await
        .unwrap();
    let inventory = service(&store);
    let ctx = RequestContext::system();
    let mut references = Vec::new();

    for op in ops {
        match op {
            StockOp::Reserve(qty) => {
                let n = u32::try_from(references.len()).unwrap();
                if inventory
                    .reserve(&ctx, ReserveStock::new(variant.id, qty, reference(n)))
                    .await
                    .is_ok()
                {
                    references.push(reference(n));
                }
            }
            StockOp::Commit(i) if !references.is_empty() => {
                inventory
                    .commit(&ctx, &references[i % references.len()])
                    .await
                    .unwrap();
            }
            StockOp::Release(i) if !references.is_empty() => {
                inventory
                    .release(&ctx, &references[i % references.len()])
                    .await
                    .unwrap();
            }
            StockOp::Adjust(delta) if delta != 0 => {
                let _ = inventory.adjust_stock(&ctx, variant.id, delta, "prop").await;
            }
            StockOp::Commit(_) | StockOp::Release(_) | StockOp::Adjust(_) => {}
        }
    }

    let cached = store.variant(variant.id).unwrap().levels();
    (cached, store.ledger_levels(variant.id))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn counters_always_match_the_ledger(ops in stock_ops(24)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (cached, ledger) = runtime.block_on(apply_ops(ops));

        prop_assert_eq!(cached, ledger);
        prop_assert!(cached.available() >= 0);
        prop_assert!(cached.reserved >= 0);
    }
}
