mod common;

use common::harness_with_pool;
use tempfile::tempdir;

use retail_sync::db::{self, cache, queue};
use retail_sync::facade::DebtFacade;
use retail_sync::model::{EntityType, QueueStatus};
use retail_sync::mutation::DebtEntry;
use retail_sync::sync::EngineSettings;

async fn open(url: &str) -> db::Pool {
    let pool = db::init_pool(url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

#[tokio::test]
async fn queued_writes_survive_a_restart() {
    let dir = tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("retail-sync.db").display());

    let pool = open(&url).await;
    let h = harness_with_pool(pool, false, EngineSettings::default());
    let written = DebtFacade::new(h.writer.clone())
        .create(&h.session, DebtEntry::new(&h.session, "Ada", 2500, 0))
        .await
        .unwrap();
    let client_ref = queue::list(&h.pool, 1, None).await.unwrap()[0].client_ref.clone();
    queue::mark_item_syncing(&h.pool, &client_ref).await.unwrap();
    h.pool.close().await;
    drop(h);

    let pool = open(&url).await;
    assert_eq!(queue::recover_interrupted(&pool).await.unwrap(), 1);
    let pending = queue::get_pending(&pool, 1, 5).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].client_ref, client_ref);
    assert_eq!(pending[0].status, QueueStatus::Pending);
    assert_eq!(pending[0].data["owed"], 2500);
    let cached = cache::find(&pool, EntityType::Debts, &written.id).await.unwrap().unwrap();
    assert!(cached.dirty);

    let h = harness_with_pool(pool, true, EngineSettings::default());
    let report = h.engine.run_sync_pass(&h.session).await.unwrap().unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(h.remote.rows("debts").await.len(), 1);
}
