//! Integration tests for the account pool against both store backends.

use std::sync::Arc;

use kiro_gateway::pool::AccountPool;
use kiro_gateway::store::json::JsonStore;
use kiro_gateway::store::sql::SqlStore;
use kiro_gateway::store::{AuthDialect, StoreBackend, StoredAccount};

async fn json_backend(dir: &tempfile::TempDir) -> Arc<dyn StoreBackend> {
    Arc::new(JsonStore::open(dir.path().join("account_pool.json")).await.unwrap())
}

async fn sql_backend(dir: &tempfile::TempDir) -> Arc<dyn StoreBackend> {
    Arc::new(SqlStore::open(&dir.path().join("gateway.db")).await.unwrap())
}

async fn exercise_failover(store: Arc<dyn StoreBackend>) {
    let pool = AccountPool::load(store, 2).await.unwrap();

    pool.add(StoredAccount::new(
        "a0".into(),
        AuthDialect::Social,
        "configs/kiro/a0.json".into(),
        "us-east-1".into(),
    ))
    .await
    .unwrap();
    pool.add(StoredAccount::new(
        "a1".into(),
        AuthDialect::DeviceOidc,
        "configs/kiro/a1.json".into(),
        "eu-west-1".into(),
    ))
    .await
    .unwrap();

    assert_eq!(pool.eligible_account_count().await, 2);

    // a0 goes fatal on the first 403, leaving only a1 eligible.
    pool.mark_unhealthy("a0", 403, "Forbidden").await.unwrap();
    assert_eq!(pool.eligible_account_count().await, 1);

    let selected = pool.select(None, true).await.unwrap();
    assert_eq!(selected.id, "a1");

    // a1 recovers back to full health after a successful probe.
    pool.mark_healthy("a1", false, Some("claude-sonnet-4-20250514".into()), None, None)
        .await
        .unwrap();
    let a1 = pool.get("a1").await.unwrap();
    assert!(a1.healthy);
    assert_eq!(a1.last_health_check_model.as_deref(), Some("claude-sonnet-4-20250514"));

    // Disabling removes an otherwise-healthy account from selection.
    pool.set_disabled("a1", true).await.unwrap();
    assert_eq!(pool.eligible_account_count().await, 0);
}

#[tokio::test]
async fn failover_and_recovery_json_backend() {
    let dir = tempfile::tempdir().unwrap();
    exercise_failover(json_backend(&dir).await).await;
}

#[tokio::test]
async fn failover_and_recovery_sql_backend() {
    let dir = tempfile::tempdir().unwrap();
    exercise_failover(sql_backend(&dir).await).await;
}

#[tokio::test]
async fn transient_errors_accumulate_independently_of_rate_limits() {
    let dir = tempfile::tempdir().unwrap();
    let store = json_backend(&dir).await;
    let pool = AccountPool::load(store, 3).await.unwrap();

    pool.add(StoredAccount::new(
        "a0".into(),
        AuthDialect::Social,
        "configs/kiro/a0.json".into(),
        "us-east-1".into(),
    ))
    .await
    .unwrap();

    // Rate-limit wording never bumps error_count.
    pool.mark_unhealthy("a0", 429, "Too Many Requests").await.unwrap();
    pool.mark_unhealthy("a0", 429, "Too Many Requests").await.unwrap();
    assert_eq!(pool.get("a0").await.unwrap().error_count, 0);
    assert!(pool.get("a0").await.unwrap().healthy);

    // Two 5xx responses bump error_count but stay under the threshold of 3.
    pool.mark_unhealthy("a0", 503, "Service Unavailable").await.unwrap();
    pool.mark_unhealthy("a0", 503, "Service Unavailable").await.unwrap();
    let a0 = pool.get("a0").await.unwrap();
    assert_eq!(a0.error_count, 2);
    assert!(a0.healthy);

    // The third pushes it over the threshold.
    pool.mark_unhealthy("a0", 503, "Service Unavailable").await.unwrap();
    assert!(!pool.get("a0").await.unwrap().healthy);
}

#[tokio::test]
async fn round_robin_advances_independently_per_model_filter() {
    let dir = tempfile::tempdir().unwrap();
    let store = json_backend(&dir).await;
    let pool = AccountPool::load(store, 3).await.unwrap();

    for i in 0..2 {
        pool.add(StoredAccount::new(
            format!("a{i}"),
            AuthDialect::Social,
            format!("configs/kiro/a{i}.json"),
            "us-east-1".into(),
        ))
        .await
        .unwrap();
    }

    // Selecting under two different model filters advances two independent
    // cursors rather than sharing one.
    let first_sonnet = pool.select(Some("claude-sonnet-4-20250514"), true).await.unwrap();
    let first_haiku = pool.select(Some("claude-3-5-haiku-20241022"), true).await.unwrap();
    let second_sonnet = pool.select(Some("claude-sonnet-4-20250514"), true).await.unwrap();

    assert_ne!(first_sonnet.id, second_sonnet.id);
    assert_eq!(first_sonnet.id, first_haiku.id);
}
