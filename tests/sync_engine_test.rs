mod common;

use common::{harness, harness_with_pool, Fault, Op};
use serde_json::json;
use std::time::Duration;

use retail_sync::db::{self, cache, queue, sync_log};
use retail_sync::facade::{DebtFacade, InventoryFacade, SalesFacade};
use retail_sync::model::{is_temp_id, new_temp_id, EntityType, NewQueueItem, Operation, QueueStatus};
use retail_sync::mutation::{DebtEntry, DebtPatch, InventoryAdjustment, Mutation, SaleGroup, SaleLine};
use retail_sync::sync::apply::apply;
use retail_sync::sync::{EngineSettings, SyncEvent};
use retail_sync::SyncError;

#[tokio::test]
async fn offline_debt_is_reconciled_after_reconnect() {
    let h = harness(false).await;
    let debts = DebtFacade::new(h.writer.clone());

    let written = debts
        .create(&h.session, DebtEntry::new(&h.session, "Ada", 5000, 0))
        .await
        .unwrap();
    assert!(written.pending);
    assert!(is_temp_id(&written.id));
    let cached = cache::find(&h.pool, EntityType::Debts, &written.id).await.unwrap().unwrap();
    assert!(cached.dirty);
    assert!(cached.server_id.is_none());

    h.go_online();
    let report = h.engine.run_sync_pass(&h.session).await.unwrap().unwrap();
    assert_eq!((report.total, report.synced, report.failed), (1, 1, 0));

    let rows = cache::get(&h.pool, EntityType::Debts, h.session.store_id).await.unwrap();
    assert_eq!(rows.len(), 1);
    let server_id = rows[0].server_id.clone().unwrap();
    assert!(!is_temp_id(&server_id));
    assert_eq!(rows[0].local_id, server_id);
    assert!(!rows[0].dirty);

    let items = queue::list(&h.pool, h.session.store_id, None).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status, QueueStatus::Synced);

    let remote = h.remote.rows("debts").await;
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0]["owed"], 5000);
    assert_eq!(remote[0]["remaining_balance"], 5000);
    assert_eq!(remote[0]["client_ref"], json!(items[0].client_ref));

    let status = h.engine.status();
    assert!(status.online);
    assert_eq!((status.pending, status.failed), (0, 0));
    assert_eq!(status.last_report, Some(report));
}

#[tokio::test]
async fn sale_group_syncs_before_its_lines() {
    let h = harness(false).await;
    let stock = h
        .remote
        .seed("dynamic_inventory", json!({"dynamic_product_id": "7", "store_id": 1, "available_qty": 10, "quantity_sold": 0}))
        .await;
    let sales = SalesFacade::new(h.writer.clone());

    let line = SaleLine::new(&h.session, "7", 2, 150, "cash");
    let checkout = sales
        .checkout(&h.session, SaleGroup::new(&h.session, 0, "cash"), vec![line])
        .await
        .unwrap();
    assert!(checkout.pending());
    assert_eq!(checkout.group.record.total_amount, 300);
    assert_eq!(checkout.lines[0].record.sale_group_id.as_deref(), Some(checkout.group.id.as_str()));

    h.go_online();
    let report = h.engine.run_sync_pass(&h.session).await.unwrap().unwrap();
    assert_eq!((report.synced, report.failed), (2, 0));

    let calls = h.remote.calls().await;
    let group_insert = calls.iter().position(|c| *c == (Op::Insert, "sale_groups".to_string())).unwrap();
    let line_insert = calls.iter().position(|c| *c == (Op::Insert, "dynamic_sales".to_string())).unwrap();
    assert!(group_insert < line_insert);

    let group_id = h.remote.rows("sale_groups").await[0]["id"].to_string();
    let sale = &h.remote.rows("dynamic_sales").await[0];
    assert_eq!(sale["sale_group_id"], json!(group_id));

    let inventory = h.remote.rows("dynamic_inventory").await;
    assert_eq!(inventory[0]["id"], stock["id"]);
    assert_eq!(inventory[0]["available_qty"], 8);
    assert_eq!(inventory[0]["quantity_sold"], 2);

    let cached_lines = cache::get(&h.pool, EntityType::DynamicSales, 1).await.unwrap();
    assert_eq!(cached_lines[0].payload["sale_group_id"], json!(group_id));
}

#[tokio::test]
async fn one_failure_does_not_stop_the_pass() {
    let h = harness(false).await;
    let debts = DebtFacade::new(h.writer.clone());
    let sales = SalesFacade::new(h.writer.clone());
    let mut events = h.connectivity.notifier().subscribe();

    debts.create(&h.session, DebtEntry::new(&h.session, "Ada", 100, 0)).await.unwrap();
    sales
        .create_sale(&h.session, SaleLine::new(&h.session, "9", 1, 50, "card"))
        .await
        .unwrap();
    debts.create(&h.session, DebtEntry::new(&h.session, "Bo", 200, 0)).await.unwrap();

    h.go_online();
    h.remote.fail_next("dynamic_sales", Op::Insert, Fault::Network).await;
    let report = h.engine.run_sync_pass(&h.session).await.unwrap().unwrap();
    assert_eq!((report.total, report.synced, report.failed), (3, 2, 1));
    assert_eq!(h.remote.rows("debts").await.len(), 2);

    let failed = queue::list(&h.pool, 1, Some(QueueStatus::Failed)).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].entity_type, EntityType::DynamicSales);
    assert_eq!(failed[0].attempts, 1);
    assert!(failed[0].last_error.as_deref().unwrap().contains("simulated timeout"));

    let status = h.engine.status();
    assert_eq!(status.failed, 1);
    assert!(status.last_error.is_some());

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::ItemFailed { entity_type, .. } = event {
            assert_eq!(entity_type, "dynamic_sales");
            saw_failure = true;
        }
    }
    assert!(saw_failure);

    // Next pass retries it.
    let report = h.engine.run_sync_pass(&h.session).await.unwrap().unwrap();
    assert_eq!((report.total, report.synced), (1, 1));
    assert_eq!(h.remote.rows("dynamic_sales").await.len(), 1);

    let log = sync_log::recent(&h.pool, 1, 10).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].failed, 1);
}

#[tokio::test]
async fn replayed_create_reuses_existing_row() {
    let h = harness(false).await;
    let debts = DebtFacade::new(h.writer.clone());
    debts.create(&h.session, DebtEntry::new(&h.session, "Ada", 700, 0)).await.unwrap();
    let item = queue::get_pending(&h.pool, 1, 5).await.unwrap().remove(0);

    // An earlier attempt wrote the row but never saw the response.
    let mut existing = item.data.clone();
    existing["client_ref"] = json!(item.client_ref);
    let existing = h.remote.seed("debts", existing).await;

    h.go_online();
    let report = h.engine.run_sync_pass(&h.session).await.unwrap().unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(h.remote.count(Op::Insert, "debts").await, 0);
    assert_eq!(h.remote.rows("debts").await.len(), 1);

    let cached = cache::get(&h.pool, EntityType::Debts, 1).await.unwrap();
    assert_eq!(cached[0].server_id.as_deref(), Some(existing["id"].to_string().as_str()));
}

#[tokio::test]
async fn applying_the_same_client_ref_twice_creates_one_row() {
    let h = harness(true).await;
    h.remote
        .seed("dynamic_inventory", json!({"dynamic_product_id": "p", "store_id": 1, "available_qty": 5, "quantity_sold": 0}))
        .await;
    let sale = Mutation::CreateSale(SaleLine::new(&h.session, "p", 2, 10, "cash"));

    let first = apply(&h.remote, &sale, "ref-1").await.unwrap();
    let second = apply(&h.remote, &sale, "ref-1").await.unwrap();
    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert_eq!(first.server_id, second.server_id);
    assert_eq!(h.remote.rows("dynamic_sales").await.len(), 1);
    // Stock moved once.
    assert_eq!(h.remote.rows("dynamic_inventory").await[0]["available_qty"], 3);
}

#[tokio::test]
async fn inventory_never_goes_negative() {
    let h = harness(false).await;
    h.remote
        .seed("dynamic_inventory", json!({"dynamic_product_id": "p1", "store_id": 1, "available_qty": 3, "quantity_sold": 0}))
        .await;
    let sales = SalesFacade::new(h.writer.clone());
    for _ in 0..3 {
        sales
            .create_sale(&h.session, SaleLine::new(&h.session, "p1", 2, 100, "cash"))
            .await
            .unwrap();
    }

    h.go_online();
    let report = h.engine.run_sync_pass(&h.session).await.unwrap().unwrap();
    assert_eq!(report.synced, 3);
    let inv = &h.remote.rows("dynamic_inventory").await[0];
    assert_eq!(inv["available_qty"], 0);
    assert_eq!(inv["quantity_sold"], 6);

    let adj = Mutation::AdjustInventory(InventoryAdjustment {
        dynamic_product_id: "p1".into(),
        store_id: 1,
        delta: -10,
        reason: Some("shrinkage".into()),
    });
    apply(&h.remote, &adj, "adj-1").await.unwrap();
    assert_eq!(h.remote.rows("dynamic_inventory").await[0]["available_qty"], 0);
}

#[tokio::test]
async fn items_stop_at_the_retry_cap() {
    let pool = db::init_memory_pool().await.unwrap();
    let settings = EngineSettings {
        max_attempts: 3,
        ..EngineSettings::default()
    };
    let h = harness_with_pool(pool, true, settings);
    let data = Mutation::CreateDebt(DebtEntry::new(&h.session, "Ada", 10, 0)).data();
    let client_ref = queue::enqueue(&h.pool, 1, NewQueueItem::new(EntityType::Debts, Operation::Create, data))
        .await
        .unwrap();

    for _ in 0..3 {
        h.remote.fail_next("debts", Op::Insert, Fault::Conflict).await;
        let report = h.engine.run_sync_pass(&h.session).await.unwrap().unwrap();
        assert_eq!(report.failed, 1);
    }
    let item = queue::get(&h.pool, &client_ref).await.unwrap().unwrap();
    assert_eq!((item.status, item.attempts), (QueueStatus::Failed, 3));
    assert!(queue::get_pending(&h.pool, 1, 3).await.unwrap().is_empty());

    let report = h.engine.run_sync_pass(&h.session).await.unwrap().unwrap();
    assert_eq!(report.total, 0);
    assert!(!h.engine.has_work(&h.session).await.unwrap());

    queue::retry_failed(&h.pool, 1).await.unwrap();
    let report = h.engine.run_sync_pass(&h.session).await.unwrap().unwrap();
    assert_eq!(report.synced, 1);
}

#[tokio::test]
async fn unsupported_and_malformed_items_fail() {
    let h = harness(true).await;
    let store = h.session.store_id;
    queue::enqueue(&h.pool, store, NewQueueItem::new(EntityType::Products, Operation::Create, json!({"name": "x"})))
        .await
        .unwrap();
    queue::enqueue(
        &h.pool,
        store,
        NewQueueItem::new(EntityType::SaleGroups, Operation::Update, json!({})).entity_id("5"),
    )
    .await
    .unwrap();
    queue::enqueue(
        &h.pool,
        store,
        NewQueueItem::new(EntityType::DynamicInventory, Operation::Delete, json!({})).entity_id("5"),
    )
    .await
    .unwrap();
    queue::enqueue(&h.pool, store, NewQueueItem::new(EntityType::Debts, Operation::Create, json!({"owed": "lots"})))
        .await
        .unwrap();

    let report = h.engine.run_sync_pass(&h.session).await.unwrap().unwrap();
    assert_eq!((report.total, report.failed), (4, 4));

    let failed = queue::list(&h.pool, store, Some(QueueStatus::Failed)).await.unwrap();
    let unsupported = failed
        .iter()
        .filter(|i| i.last_error.as_deref().unwrap().starts_with("unsupported mutation"))
        .count();
    assert_eq!(unsupported, 3);
    assert!(failed
        .iter()
        .any(|i| i.last_error.as_deref().unwrap().starts_with("invalid payload")));
    assert!(h.remote.calls().await.is_empty());
}

#[tokio::test]
async fn unsynced_parent_blocks_child() {
    let h = harness(true).await;
    let line = SaleLine::new(&h.session, "p", 1, 10, "cash").in_group(new_temp_id());
    let data = Mutation::CreateSale(line).data();
    queue::enqueue(&h.pool, 1, NewQueueItem::new(EntityType::DynamicSales, Operation::Create, data))
        .await
        .unwrap();

    let report = h.engine.run_sync_pass(&h.session).await.unwrap().unwrap();
    assert_eq!(report.failed, 1);
    let item = &queue::list(&h.pool, 1, None).await.unwrap()[0];
    assert!(item.last_error.as_deref().unwrap().contains("unsynced record"));
    assert_eq!(h.remote.count(Op::Insert, "dynamic_sales").await, 0);
}

#[tokio::test]
async fn offline_pass_is_a_no_op() {
    let h = harness(false).await;
    DebtFacade::new(h.writer.clone())
        .create(&h.session, DebtEntry::new(&h.session, "Ada", 10, 0))
        .await
        .unwrap();

    assert!(h.engine.run_sync_pass(&h.session).await.unwrap().is_none());
    assert!(h.remote.calls().await.is_empty());
    let item = &queue::list(&h.pool, 1, None).await.unwrap()[0];
    assert_eq!((item.status, item.attempts), (QueueStatus::Pending, 0));
}

#[tokio::test]
async fn concurrent_pass_is_refused() {
    let h = harness(true).await;
    let data = Mutation::CreateDebt(DebtEntry::new(&h.session, "Ada", 10, 0)).data();
    queue::enqueue(&h.pool, 1, NewQueueItem::new(EntityType::Debts, Operation::Create, data))
        .await
        .unwrap();
    h.remote.set_delay(Duration::from_millis(100)).await;

    let engine = h.engine.clone();
    let session = h.session.clone();
    let first = tokio::spawn(async move { engine.run_sync_pass(&session).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.engine.is_draining());
    assert!(h.engine.run_sync_pass(&h.session).await.unwrap().is_none());

    let report = first.await.unwrap().unwrap().unwrap();
    assert_eq!(report.synced, 1);
    assert!(!h.engine.is_draining());
    assert_eq!(h.remote.rows("debts").await.len(), 1);
}

#[tokio::test]
async fn queued_update_follows_offline_create() {
    let h = harness(false).await;
    let debts = DebtFacade::new(h.writer.clone());
    let created = debts
        .create(&h.session, DebtEntry::new(&h.session, "Ada", 900, 100))
        .await
        .unwrap();
    let patch = DebtPatch {
        notes: Some("pays fridays".into()),
        deposited: Some(300),
        ..Default::default()
    };
    let updated = debts.update(&h.session, &created.id, patch).await.unwrap();
    assert!(updated.pending);
    assert_eq!(updated.record.remaining_balance, 600);

    h.go_online();
    let report = h.engine.run_sync_pass(&h.session).await.unwrap().unwrap();
    assert_eq!((report.synced, report.failed), (2, 0));

    let remote = &h.remote.rows("debts").await[0];
    assert_eq!(remote["notes"], "pays fridays");
    assert_eq!(remote["remaining_balance"], 600);
    let cached = cache::get(&h.pool, EntityType::Debts, 1).await.unwrap();
    assert_eq!(cached.len(), 1);
    assert!(!cached[0].dirty);
}

#[tokio::test]
async fn queued_delete_purges_tombstone() {
    let h = harness(true).await;
    let debts = DebtFacade::new(h.writer.clone());
    let created = debts
        .create(&h.session, DebtEntry::new(&h.session, "Ada", 900, 0))
        .await
        .unwrap();
    assert!(!created.pending);

    h.go_offline();
    let deleted = debts.delete(&h.session, &created.id).await.unwrap();
    assert!(deleted.pending);
    assert!(debts.list(&h.session).await.unwrap().is_empty());
    assert!(cache::find(&h.pool, EntityType::Debts, &created.id).await.unwrap().unwrap().deleted);

    h.go_online();
    h.engine.run_sync_pass(&h.session).await.unwrap().unwrap();
    assert!(h.remote.rows("debts").await.is_empty());
    assert!(cache::find(&h.pool, EntityType::Debts, &created.id).await.unwrap().is_none());
}

#[tokio::test]
async fn refresh_keeps_local_edits() {
    let h = harness(true).await;
    h.remote
        .seed("customers", json!({"id": 1, "fullname": "Server Ada", "store_id": 1}))
        .await;
    h.remote
        .seed("customers", json!({"id": 2, "fullname": "Other store", "store_id": 2}))
        .await;
    assert_eq!(h.engine.refresh_cache(&h.session, EntityType::Customers).await.unwrap(), 1);

    let mut local = cache::find(&h.pool, EntityType::Customers, "1").await.unwrap().unwrap();
    local.payload["fullname"] = json!("Local Ada");
    local.dirty = true;
    cache::put(&h.pool, &local).await.unwrap();

    h.engine.refresh_cache(&h.session, EntityType::Customers).await.unwrap();
    let rows = cache::get(&h.pool, EntityType::Customers, 1).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].payload["fullname"], "Local Ada");
}

#[tokio::test]
async fn network_errors_from_refresh_surface() {
    let h = harness(false).await;
    let err = h.engine.refresh_cache(&h.session, EntityType::Debts).await.unwrap_err();
    assert!(matches!(err, SyncError::Network(_)));
}

async fn seed_stock(h: &common::Harness, product: &str, available: i64) {
    h.remote
        .seed(
            "dynamic_inventory",
            json!({"dynamic_product_id": product, "store_id": 1, "available_qty": available, "quantity_sold": 0}),
        )
        .await;
}

#[tokio::test]
async fn sale_retried_after_stock_failure_still_moves_stock() {
    let h = harness(false).await;
    seed_stock(&h, "p1", 10).await;
    let sales = SalesFacade::new(h.writer.clone());
    sales
        .create_sale(&h.session, SaleLine::new(&h.session, "p1", 2, 100, "cash"))
        .await
        .unwrap();

    h.go_online();
    h.remote.fail_next("dynamic_inventory", Op::Update, Fault::Network).await;
    let report = h.engine.run_sync_pass(&h.session).await.unwrap().unwrap();
    assert_eq!((report.synced, report.failed), (0, 1));
    // The sale row landed; its stock move did not.
    assert_eq!(h.remote.rows("dynamic_sales").await.len(), 1);
    assert_eq!(h.remote.rows("dynamic_inventory").await[0]["available_qty"], 10);

    let report = h.engine.run_sync_pass(&h.session).await.unwrap().unwrap();
    assert_eq!((report.synced, report.failed), (1, 0));
    assert_eq!(h.remote.rows("dynamic_sales").await.len(), 1);
    let inv = &h.remote.rows("dynamic_inventory").await[0];
    assert_eq!(inv["available_qty"], 8);
    assert_eq!(inv["quantity_sold"], 2);
}

#[tokio::test]
async fn sale_stock_move_is_not_repeated_after_lost_response() {
    let h = harness(false).await;
    seed_stock(&h, "p1", 10).await;
    let sales = SalesFacade::new(h.writer.clone());
    sales
        .create_sale(&h.session, SaleLine::new(&h.session, "p1", 3, 100, "cash"))
        .await
        .unwrap();

    h.go_online();
    h.remote.fail_next("dynamic_inventory", Op::Update, Fault::LostResponse).await;
    let report = h.engine.run_sync_pass(&h.session).await.unwrap().unwrap();
    assert_eq!(report.failed, 1);
    let report = h.engine.run_sync_pass(&h.session).await.unwrap().unwrap();
    assert_eq!(report.synced, 1);

    let inv = &h.remote.rows("dynamic_inventory").await[0];
    assert_eq!(inv["available_qty"], 7);
    assert_eq!(inv["quantity_sold"], 3);
}

#[tokio::test]
async fn adjustment_with_lost_response_is_applied_once() {
    let h = harness(false).await;
    seed_stock(&h, "p1", 10).await;
    let inventory = InventoryFacade::new(h.writer.clone());
    assert!(inventory.adjust(&h.session, "p1", -3, Some("damaged")).await.unwrap().pending);

    h.go_online();
    h.remote.fail_next("dynamic_inventory", Op::Update, Fault::LostResponse).await;
    let report = h.engine.run_sync_pass(&h.session).await.unwrap().unwrap();
    assert_eq!((report.synced, report.failed), (0, 1));
    assert_eq!(h.remote.rows("dynamic_inventory").await[0]["available_qty"], 7);

    let report = h.engine.run_sync_pass(&h.session).await.unwrap().unwrap();
    assert_eq!((report.synced, report.failed), (1, 0));
    assert_eq!(h.remote.rows("dynamic_inventory").await[0]["available_qty"], 7);
    assert_eq!(h.remote.count(Op::Update, "dynamic_inventory").await, 1);
}

#[tokio::test]
async fn interrupted_sale_delete_restocks_once() {
    for fault in [Fault::LostResponse, Fault::Network] {
        let h = harness(true).await;
        seed_stock(&h, "p1", 10).await;
        let sales = SalesFacade::new(h.writer.clone());
        let sale = sales
            .create_sale(&h.session, SaleLine::new(&h.session, "p1", 4, 100, "cash"))
            .await
            .unwrap();
        assert!(!sale.pending);
        assert_eq!(h.remote.rows("dynamic_inventory").await[0]["available_qty"], 6);

        h.go_offline();
        assert!(sales.delete_sale(&h.session, &sale.id).await.unwrap().pending);

        h.go_online();
        h.remote.fail_next("dynamic_sales", Op::Delete, fault).await;
        let report = h.engine.run_sync_pass(&h.session).await.unwrap().unwrap();
        assert_eq!(report.failed, 1, "{:?}", fault);
        let report = h.engine.run_sync_pass(&h.session).await.unwrap().unwrap();
        assert_eq!(report.synced, 1, "{:?}", fault);

        assert!(h.remote.rows("dynamic_sales").await.is_empty());
        let inv = &h.remote.rows("dynamic_inventory").await[0];
        assert_eq!(inv["available_qty"], 10, "{:?}", fault);
        assert_eq!(inv["quantity_sold"], 0, "{:?}", fault);
        assert!(cache::find(&h.pool, EntityType::DynamicSales, &sale.id).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn undecodable_queue_row_does_not_block_the_pass() {
    let h = harness(false).await;
    let debts = DebtFacade::new(h.writer.clone());
    debts.create(&h.session, DebtEntry::new(&h.session, "Ada", 500, 0)).await.unwrap();
    // Written by a newer build that knows an entity this one does not.
    sqlx::query(
        "INSERT INTO sync_queue (client_ref, store_id, entity_type, operation, data, priority, created_at, updated_at) \
         VALUES ('from-newer-build', 1, 'widgets', 'create', '{}', 0, 0, 0)",
    )
    .execute(&h.pool)
    .await
    .unwrap();

    h.go_online();
    let report = h.engine.run_sync_pass(&h.session).await.unwrap().unwrap();
    assert_eq!((report.synced, report.failed), (1, 0));
    assert_eq!(h.remote.rows("debts").await.len(), 1);

    let (status, last_error): (String, Option<String>) =
        sqlx::query_as("SELECT status, last_error FROM sync_queue WHERE client_ref = 'from-newer-build'")
            .fetch_one(&h.pool)
            .await
            .unwrap();
    assert_eq!(status, "failed");
    assert!(last_error.unwrap().contains("unknown entity type"));
    assert!(!h.engine.has_work(&h.session).await.unwrap());
}
