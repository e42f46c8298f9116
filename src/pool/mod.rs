//! Account pool (C6, §4.6).
//!
//! In-memory registry of accounts backed by a [`StoreBackend`] for
//! durability. Selection is round-robin, keyed per requested-model filter so
//! different filter sets advance independently; health and usage accounting
//! follow §4.6's classification rules.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::{ErrorCategory, StoreError, UpstreamError};
use crate::store::{HealthCheckRecord, HealthUpdate, StoreBackend, StoredAccount};

/// Runtime view of one account: the durable [`StoredAccount`] plus nothing
/// else — §3 draws no distinction between "pool state" and "stored state"
/// beyond who owns the write path, so this is a thin wrapper rather than a
/// parallel struct.
pub type AccountEntry = StoredAccount;

pub struct AccountPool {
    store: Arc<dyn StoreBackend>,
    accounts: RwLock<HashMap<String, AccountEntry>>,
    /// Round-robin cursors keyed by the model filter string (`""` = no
    /// filter). Each filter key advances independently (§4.6).
    cursors: RwLock<HashMap<String, AtomicUsize>>,
    max_error_count: u32,
    health_check_probe_model: String,
}

impl AccountPool {
    pub async fn load(store: Arc<dyn StoreBackend>, max_error_count: u32) -> Result<Self, StoreError> {
        let loaded = store.load_all().await?;
        let accounts = loaded.into_iter().map(|a| (a.id.clone(), a)).collect();
        Ok(Self {
            store,
            accounts: RwLock::new(accounts),
            cursors: RwLock::new(HashMap::new()),
            max_error_count,
            health_check_probe_model: "claude-sonnet-4-20250514".to_string(),
        })
    }

    pub async fn list_accounts(&self) -> Vec<AccountEntry> {
        self.accounts.read().await.values().cloned().collect()
    }

    /// Direct store access for queries the pool itself has no opinion on
    /// (usage cache reads/writes in C9).
    pub fn store(&self) -> &Arc<dyn StoreBackend> {
        &self.store
    }

    pub async fn get(&self, id: &str) -> Option<AccountEntry> {
        self.accounts.read().await.get(id).cloned()
    }

    pub async fn add(&self, account: StoredAccount) -> Result<(), StoreError> {
        self.store.upsert(&account).await?;
        self.accounts.write().await.insert(account.id.clone(), account);
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.store.delete(id).await?;
        self.accounts.write().await.remove(id);
        Ok(())
    }

    /// Round-robin over the eligible subset for `requested_model`. Each
    /// selection bumps `usage_count`/`last_used` unless `skip_usage_count`.
    pub async fn select(
        &self,
        requested_model: Option<&str>,
        skip_usage_count: bool,
    ) -> Option<AccountEntry> {
        let filter_key = requested_model.unwrap_or("").to_string();

        let eligible: Vec<String> = {
            let accounts = self.accounts.read().await;
            let mut ids: Vec<&AccountEntry> = accounts
                .values()
                .filter(|a| {
                    a.healthy
                        && !a.disabled
                        && requested_model
                            .map(|m| !a.not_supported_models.iter().any(|n| n == m))
                            .unwrap_or(true)
                })
                .collect();
            ids.sort_by(|a, b| a.id.cmp(&b.id));
            ids.into_iter().map(|a| a.id.clone()).collect()
        };

        if eligible.is_empty() {
            return None;
        }

        let index = {
            let mut cursors = self.cursors.write().await;
            let cursor = cursors.entry(filter_key).or_insert_with(|| AtomicUsize::new(0));
            cursor.fetch_add(1, Ordering::Relaxed) % eligible.len()
        };
        let chosen_id = &eligible[index];

        if !skip_usage_count {
            self.store.increment_usage(chosen_id).await.ok();
            let mut accounts = self.accounts.write().await;
            if let Some(entry) = accounts.get_mut(chosen_id) {
                entry.usage_count += 1;
                entry.last_used = Some(Utc::now());
            }
        }

        self.accounts.read().await.get(chosen_id).cloned()
    }

    /// Backfill `cached_email`/`cached_user_id` without otherwise touching
    /// health state — used by the admin usage query (§4.9), which learns a
    /// user's identity as a side effect of fetching usage data.
    pub async fn update_cached_identity(
        &self,
        id: &str,
        cached_email: Option<String>,
        cached_user_id: Option<String>,
    ) -> Result<(), StoreError> {
        if cached_email.is_none() && cached_user_id.is_none() {
            return Ok(());
        }
        self.store
            .update_health(
                id,
                HealthUpdate { cached_email: cached_email.clone(), cached_user_id: cached_user_id.clone(), ..Default::default() },
            )
            .await?;
        let mut accounts = self.accounts.write().await;
        if let Some(entry) = accounts.get_mut(id) {
            if cached_email.is_some() {
                entry.cached_email = cached_email;
            }
            if cached_user_id.is_some() {
                entry.cached_user_id = cached_user_id;
            }
        }
        Ok(())
    }

    pub async fn mark_healthy(
        &self,
        id: &str,
        reset_usage_count: bool,
        health_check_model: Option<String>,
        cached_email: Option<String>,
        cached_user_id: Option<String>,
    ) -> Result<(), StoreError> {
        let update = HealthUpdate {
            healthy: Some(true),
            error_count: Some(0),
            last_health_check_time: Some(Utc::now()),
            last_health_check_model: health_check_model,
            cached_email,
            cached_user_id,
            reset_usage_count,
            ..Default::default()
        };
        self.store.update_health(id, update.clone()).await?;
        let mut accounts = self.accounts.write().await;
        if let Some(entry) = accounts.get_mut(id) {
            entry.healthy = true;
            entry.error_count = 0;
            entry.last_health_check_time = update.last_health_check_time;
            if update.last_health_check_model.is_some() {
                entry.last_health_check_model = update.last_health_check_model;
            }
            if update.cached_email.is_some() {
                entry.cached_email = update.cached_email;
            }
            if update.cached_user_id.is_some() {
                entry.cached_user_id = update.cached_user_id;
            }
            if reset_usage_count {
                entry.usage_count = 0;
            }
        }
        Ok(())
    }

    /// §4.6's `MarkUnhealthy`: classify the error and apply the matching
    /// effect — retryable (rate-limit) signals only log the last-retryable-
    /// error and never touch the store, client-request errors do nothing,
    /// fatal signals flip `healthy=false` immediately and persist, anything
    /// else bumps `error_count` until `max_error_count`.
    pub async fn mark_unhealthy(&self, id: &str, status: u16, body: &str) -> Result<(), StoreError> {
        let category = UpstreamError::classify(status, body);
        let now = Utc::now();

        match category {
            ErrorCategory::RateLimited => {
                warn!(account_id = id, status, body, "rate-limited, not bumping error_count");
                Ok(())
            }
            ErrorCategory::ClientRequest => Ok(()),
            ErrorCategory::FatalAccount => {
                self.store
                    .update_health(
                        id,
                        HealthUpdate {
                            healthy: Some(false),
                            last_error_time: Some(now),
                            last_error_message: Some(body.to_string()),
                            error_count: None,
                            ..Default::default()
                        },
                    )
                    .await?;
                let mut accounts = self.accounts.write().await;
                if let Some(entry) = accounts.get_mut(id) {
                    entry.healthy = false;
                    entry.last_error_time = Some(now);
                    entry.last_error_message = Some(body.to_string());
                }
                Ok(())
            }
            ErrorCategory::Transient | ErrorCategory::InternalInvariant | ErrorCategory::PoolExhausted => {
                if !self.accounts.read().await.contains_key(id) {
                    return Ok(());
                }

                // Atomic bump at the store: concurrent `mark_unhealthy` calls on
                // the same account must never lose an increment (§8), so the
                // read-compute-write happens in the backend, not here.
                let (new_count, now_unhealthy) = self
                    .store
                    .bump_error_count(id, self.max_error_count, now, body)
                    .await?;

                let mut accounts = self.accounts.write().await;
                if let Some(entry) = accounts.get_mut(id) {
                    entry.error_count = new_count;
                    entry.last_error_time = Some(now);
                    entry.last_error_message = Some(body.to_string());
                    if now_unhealthy {
                        entry.healthy = false;
                    }
                }
                Ok(())
            }
        }
    }

    pub async fn set_disabled(&self, id: &str, disabled: bool) -> Result<(), StoreError> {
        self.store.set_disabled(id, disabled).await?;
        let mut accounts = self.accounts.write().await;
        if let Some(entry) = accounts.get_mut(id) {
            entry.disabled = disabled;
        }
        Ok(())
    }

    pub fn eligible_account_count_sync(accounts: &[AccountEntry]) -> usize {
        accounts.iter().filter(|a| a.healthy && !a.disabled).count()
    }

    pub async fn eligible_account_count(&self) -> usize {
        let accounts = self.accounts.read().await;
        accounts.values().filter(|a| a.healthy && !a.disabled).count()
    }

    pub fn probe_model(&self) -> &str {
        &self.health_check_probe_model
    }

    pub async fn record_health_check(
        &self,
        id: &str,
        success: bool,
        check_model: &str,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        self.store
            .record_health_check(HealthCheckRecord {
                account_id: id.to_string(),
                check_time: Utc::now(),
                success,
                check_model: check_model.to_string(),
                error_message,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{json::JsonStore, AuthDialect};

    async fn test_pool() -> (AccountPool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonStore::open(&dir.path().join("pool.json")).await.unwrap());
        let pool = AccountPool::load(store, 3).await.unwrap();
        (pool, dir)
    }

    #[tokio::test]
    async fn round_robin_cycles_through_eligible_accounts() {
        let (pool, _dir) = test_pool().await;
        for i in 0..3 {
            pool.add(StoredAccount::new(
                format!("a{i}"),
                AuthDialect::Social,
                format!("configs/kiro/a{i}.json"),
                "us-east-1".into(),
            ))
            .await
            .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(pool.select(None, true).await.unwrap().id);
        }
        seen.sort();
        assert_eq!(seen, vec!["a0", "a1", "a2"]);
    }

    #[tokio::test]
    async fn disabled_and_unhealthy_accounts_are_skipped() {
        let (pool, _dir) = test_pool().await;
        pool.add(StoredAccount::new(
            "a0".into(),
            AuthDialect::Social,
            "configs/kiro/a0.json".into(),
            "us-east-1".into(),
        ))
        .await
        .unwrap();
        pool.mark_unhealthy("a0", 403, "Forbidden").await.unwrap();
        assert!(pool.select(None, true).await.is_none());
    }

    #[tokio::test]
    async fn error_count_reaches_threshold_then_goes_unhealthy() {
        let (pool, _dir) = test_pool().await;
        pool.add(StoredAccount::new(
            "a0".into(),
            AuthDialect::Social,
            "configs/kiro/a0.json".into(),
            "us-east-1".into(),
        ))
        .await
        .unwrap();

        for _ in 0..2 {
            pool.mark_unhealthy("a0", 500, "oops").await.unwrap();
            assert!(pool.get("a0").await.unwrap().healthy);
        }
        pool.mark_unhealthy("a0", 500, "oops").await.unwrap();
        assert!(!pool.get("a0").await.unwrap().healthy);
    }

    #[tokio::test]
    async fn rate_limited_errors_do_not_bump_error_count() {
        let (pool, _dir) = test_pool().await;
        pool.add(StoredAccount::new(
            "a0".into(),
            AuthDialect::Social,
            "configs/kiro/a0.json".into(),
            "us-east-1".into(),
        ))
        .await
        .unwrap();
        pool.mark_unhealthy("a0", 429, "Too Many Requests").await.unwrap();
        let a = pool.get("a0").await.unwrap();
        assert!(a.healthy);
        assert_eq!(a.error_count, 0);
    }

    #[tokio::test]
    async fn mark_healthy_resets_error_count() {
        let (pool, _dir) = test_pool().await;
        pool.add(StoredAccount::new(
            "a0".into(),
            AuthDialect::Social,
            "configs/kiro/a0.json".into(),
            "us-east-1".into(),
        ))
        .await
        .unwrap();
        pool.mark_unhealthy("a0", 500, "oops").await.unwrap();
        pool.mark_healthy("a0", false, None, None, None).await.unwrap();
        let a = pool.get("a0").await.unwrap();
        assert!(a.healthy);
        assert_eq!(a.error_count, 0);
    }
}
