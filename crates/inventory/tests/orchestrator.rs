mod support;

use std::time::Duration;

use common::{BranchOp, ErrorKind, ErrorClassification, OrderId, RequestContext, SagaBranch};
use inventory::{
    DeductionOutcome, InventoryDeductionRequest, InventoryError, deduct_lock_key, topics,
};
use lock::LockManager;
use storage::StorageError;
use support::Harness;

#[tokio::test]
async fn deduction_applies_once_across_redelivery() {
    let h = Harness::new().await;
    let product = h.product(10).await;
    let request = InventoryDeductionRequest::new(OrderId::new(1)).with_product(product, 3).unwrap();

    let first = h
        .orchestrator
        .deduct_inventory(&RequestContext::new(), &request)
        .await
        .unwrap();
    let second = h
        .orchestrator
        .deduct_inventory(&RequestContext::new(), &request)
        .await
        .unwrap();

    assert_eq!(first, DeductionOutcome::Applied);
    assert_eq!(second, DeductionOutcome::AlreadyProcessed);
    assert_eq!(h.storage.product_stock(product).await, Some(7));
    assert_eq!(h.storage.record_count().await, 1);
    assert_eq!(h.confirmations().await, 1);
}

#[tokio::test]
async fn insufficient_stock_changes_nothing() {
    let h = Harness::new().await;
    let plenty = h.product(100).await;
    let scarce = h.product(2).await;
    let request = InventoryDeductionRequest::new(OrderId::new(2))
        .with_product(plenty, 1).unwrap()
        .with_product(scarce, 5).unwrap();

    let err = h
        .orchestrator
        .deduct_inventory(&RequestContext::new(), &request)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InsufficientStock);
    assert_eq!(h.storage.product_stock(plenty).await, Some(100));
    assert_eq!(h.storage.product_stock(scarce).await, Some(2));
    assert_eq!(h.storage.record_count().await, 0);
    assert_eq!(h.confirmations().await, 0);
    assert!(!h.locks.is_locked(&deduct_lock_key(OrderId::new(2))).await);
}

#[tokio::test]
async fn variant_stock_is_deducted_with_product_stock() {
    let h = Harness::new().await;
    let product = h.product(10).await;
    let size = h.variant(product, 4).await;
    let request = InventoryDeductionRequest::new(OrderId::new(3))
        .with_product(product, 2).unwrap()
        .with_variant(size, 2).unwrap();

    h.orchestrator
        .deduct_inventory(&RequestContext::new(), &request)
        .await
        .unwrap();

    assert_eq!(h.storage.product_stock(product).await, Some(8));
    assert_eq!(h.storage.variant_stock(size).await, Some(2));
}

#[tokio::test]
async fn unknown_product_is_not_found() {
    let h = Harness::new().await;
    let request = InventoryDeductionRequest::new(OrderId::new(4))
        .with_product(common::ProductId::new(999), 1).unwrap();

    let err = h
        .orchestrator
        .deduct_inventory(&RequestContext::new(), &request)
        .await
        .unwrap_err();
    assert!(matches!(err, InventoryError::Storage(StorageError::NotFound(_))));
}

#[tokio::test]
async fn held_lock_is_a_duplicate_notification() {
    let h = Harness::new().await;
    let product = h.product(10).await;
    let order = OrderId::new(5);
    let ctx = RequestContext::new();

    let other = h
        .locks
        .new_lock(&deduct_lock_key(order), Duration::from_secs(30))
        .await
        .unwrap();
    assert!(other.try_lock(&ctx).await.unwrap());

    let err = h
        .orchestrator
        .deduct_inventory(&ctx, &InventoryDeductionRequest::new(order).with_product(product, 1).unwrap())
        .await
        .unwrap_err();

    assert!(matches!(err, InventoryError::DuplicateNotification(id) if id == order));
    assert!(err.is_terminal());
    assert_eq!(h.storage.product_stock(product).await, Some(10));
    other.unlock(&ctx).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_notifications_for_one_order_deduct_once() {
    let h = Harness::new().await;
    let product = h.product(10).await;
    let request = InventoryDeductionRequest::new(OrderId::new(13))
        .with_product(product, 3)
        .unwrap();

    let calls: Vec<_> = (0..8)
        .map(|_| {
            let orchestrator = h.orchestrator.clone();
            let request = request.clone();
            tokio::spawn(async move {
                orchestrator
                    .deduct_inventory(&RequestContext::new(), &request)
                    .await
            })
        })
        .collect();

    let mut applied = 0;
    for call in calls {
        match call.await.unwrap() {
            Ok(DeductionOutcome::Applied) => applied += 1,
            Ok(DeductionOutcome::AlreadyProcessed) => {}
            Err(InventoryError::DuplicateNotification(id)) => assert_eq!(id, OrderId::new(13)),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    assert_eq!(applied, 1);
    assert_eq!(h.storage.product_stock(product).await, Some(7));
    assert_eq!(h.storage.record_count().await, 1);
    assert_eq!(h.locks.active_leases().await, 0);
}

#[tokio::test]
async fn invalid_request_is_rejected_before_locking() {
    let h = Harness::new().await;
    let err = h
        .orchestrator
        .deduct_inventory(&RequestContext::new(), &InventoryDeductionRequest::new(OrderId::new(6)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn revert_restores_exactly_once() {
    let h = Harness::new().await;
    let product = h.product(10).await;
    let request = InventoryDeductionRequest::new(OrderId::new(7)).with_product(product, 4).unwrap();
    let ctx = RequestContext::new();

    h.orchestrator.deduct_inventory(&ctx, &request).await.unwrap();
    assert_eq!(h.storage.product_stock(product).await, Some(6));

    let first = h.orchestrator.deduct_inventory_revert(&ctx, &request).await.unwrap();
    let second = h.orchestrator.deduct_inventory_revert(&ctx, &request).await.unwrap();

    assert_eq!(first, DeductionOutcome::Applied);
    assert_eq!(second, DeductionOutcome::AlreadyProcessed);
    assert_eq!(h.storage.product_stock(product).await, Some(10));
}

#[tokio::test]
async fn revert_before_deduct_blocks_the_late_deduction() {
    let h = Harness::new().await;
    let product = h.product(10).await;
    let request = InventoryDeductionRequest::new(OrderId::new(8)).with_product(product, 4).unwrap();
    let ctx = RequestContext::new();

    let revert = h.orchestrator.deduct_inventory_revert(&ctx, &request).await.unwrap();
    let deduct = h.orchestrator.deduct_inventory(&ctx, &request).await.unwrap();

    assert_eq!(revert, DeductionOutcome::NullCompensation);
    assert_eq!(deduct, DeductionOutcome::AlreadyCompensated);
    assert_eq!(h.storage.product_stock(product).await, Some(10));
    assert_eq!(h.confirmations().await, 0);
}

#[tokio::test]
async fn saga_compensation_without_action_is_null_and_blocks_late_action() {
    let h = Harness::new().await;
    let product = h.product(10).await;
    let request = InventoryDeductionRequest::new(OrderId::new(9)).with_product(product, 4).unwrap();

    let compensate = RequestContext::new()
        .with_saga_branch(SagaBranch::new("gid-9", "01", BranchOp::Compensate));
    let action =
        RequestContext::new().with_saga_branch(SagaBranch::new("gid-9", "01", BranchOp::Action));

    let revert = h
        .orchestrator
        .deduct_inventory_revert(&compensate, &request)
        .await
        .unwrap();
    let deduct = h.orchestrator.deduct_inventory(&action, &request).await.unwrap();

    assert_eq!(revert, DeductionOutcome::NullCompensation);
    assert_eq!(deduct, DeductionOutcome::BarrierSkipped);
    assert_eq!(h.storage.product_stock(product).await, Some(10));
    assert_eq!(h.storage.record_count().await, 0);
}

#[tokio::test]
async fn saga_action_runs_once_under_barrier() {
    let h = Harness::new().await;
    let product = h.product(10).await;
    let request = InventoryDeductionRequest::new(OrderId::new(10)).with_product(product, 3).unwrap();
    let action =
        RequestContext::new().with_saga_branch(SagaBranch::new("gid-10", "01", BranchOp::Action));

    let first = h.orchestrator.deduct_inventory(&action, &request).await.unwrap();
    assert_eq!(first, DeductionOutcome::Applied);
    assert_eq!(h.storage.barrier_count().await, 1);

    let compensate = RequestContext::new()
        .with_saga_branch(SagaBranch::new("gid-10", "01", BranchOp::Compensate));
    let revert = h
        .orchestrator
        .deduct_inventory_revert(&compensate, &request)
        .await
        .unwrap();
    assert_eq!(revert, DeductionOutcome::Applied);
    assert_eq!(h.storage.product_stock(product).await, Some(10));
}

#[tokio::test]
async fn rejected_confirmation_is_dead_lettered_and_deduction_stands() {
    let h = Harness::without_confirmation_topic().await;
    let product = h.product(10).await;
    let request = InventoryDeductionRequest::new(OrderId::new(11)).with_product(product, 1).unwrap();

    let outcome = h
        .orchestrator
        .deduct_inventory(&RequestContext::new(), &request)
        .await
        .unwrap();

    assert_eq!(outcome, DeductionOutcome::Applied);
    assert_eq!(h.storage.product_stock(product).await, Some(9));
    let dead = h.broker.messages(topics::ON_INVENTORY_DEDUCT_SUCCESS_DLQ).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].partition_key(), Some("11"));
}

#[tokio::test]
async fn cancelled_context_leaves_stock_untouched() {
    let h = Harness::new().await;
    let product = h.product(10).await;
    let ctx = RequestContext::new();
    ctx.cancellation().cancel();

    let result = h
        .orchestrator
        .deduct_inventory(
            &ctx,
            &InventoryDeductionRequest::new(OrderId::new(12)).with_product(product, 1).unwrap(),
        )
        .await;

    assert!(result.is_err());
    assert_eq!(h.storage.product_stock(product).await, Some(10));
}
