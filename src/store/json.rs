//! JSON-file store backend (§4.7).
//!
//! Single file `account_pool.json` with shape `{accounts: [...]}`. Writes
//! are read-modify-write with an atomic replace (temp file + fsync +
//! rename) and coalesced by a debounce so bursts of marked-dirty updates
//! produce one disk write. Usage-cache and health-check-history entries
//! live in sibling in-memory maps that are persisted as part of the same
//! file, since the JSON backend has no secondary tables.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, warn};

use crate::error::StoreError;
use crate::store::{
    HealthCheckRecord, HealthUpdate, StoreBackend, StoredAccount, UsageCacheEntry,
};

const DEBOUNCE: Duration = Duration::from_secs(1);
const HEALTH_HISTORY_LIMIT: usize = 2000;

#[derive(Default, Serialize, Deserialize)]
struct FileShape {
    #[serde(default)]
    accounts: Vec<StoredAccount>,
    #[serde(default)]
    usage_cache: Vec<UsageCacheEntry>,
    #[serde(default)]
    health_history: Vec<StoredHealthRecord>,
}

#[derive(Clone, Serialize, Deserialize)]
struct StoredHealthRecord {
    account_id: String,
    check_time: chrono::DateTime<Utc>,
    success: bool,
    check_model: String,
    error_message: Option<String>,
}

struct State {
    accounts: HashMap<String, StoredAccount>,
    usage_cache: HashMap<(String, String), UsageCacheEntry>,
    health_history: Vec<StoredHealthRecord>,
}

pub struct JsonStore {
    path: PathBuf,
    state: Arc<Mutex<State>>,
    dirty_tx: mpsc::UnboundedSender<()>,
}

impl JsonStore {
    /// Load (or create) the store at `path`. Legacy `provider_pools.json`
    /// migration: if `path` is absent but a sibling `provider_pools.json`
    /// exists, read its `"claude-kiro-oauth"` array, dedup by id, write the
    /// new file, and back up the legacy file with a timestamp suffix.
    ///
    /// On JSON parse failure, this refuses to start rather than silently
    /// falling back to an empty pool (DESIGN.md, open question #2).
    pub async fn open(path: PathBuf) -> Result<Self, StoreError> {
        let initial = if path.exists() {
            let contents = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<FileShape>(&contents) {
                Ok(shape) => shape,
                Err(e) => {
                    error!(path = %path.display(), err = %e, "account_pool.json is malformed");
                    return Err(StoreError::MalformedPool(e.to_string()));
                }
            }
        } else if let Some(migrated) = Self::migrate_legacy(&path).await? {
            migrated
        } else {
            FileShape::default()
        };

        let accounts = initial
            .accounts
            .into_iter()
            .map(|a| (a.id.clone(), a))
            .collect();
        let usage_cache = initial
            .usage_cache
            .into_iter()
            .map(|e| ((e.account_id.clone(), e.provider_type.clone()), e))
            .collect();

        let state = Arc::new(Mutex::new(State {
            accounts,
            usage_cache,
            health_history: initial.health_history,
        }));

        let (dirty_tx, mut dirty_rx) = mpsc::unbounded_channel::<()>();

        let writer_state = state.clone();
        let writer_path = path.clone();
        tokio::spawn(async move {
            loop {
                if dirty_rx.recv().await.is_none() {
                    return;
                }
                // Drain any further marks that arrived during the debounce.
                tokio::time::sleep(DEBOUNCE).await;
                while dirty_rx.try_recv().is_ok() {}
                if let Err(e) = Self::flush(&writer_path, &writer_state).await {
                    error!(err = %e, "account_pool.json write failed");
                }
            }
        });

        Ok(Self {
            path,
            state,
            dirty_tx,
        })
    }

    async fn migrate_legacy(path: &Path) -> Result<Option<FileShape>, StoreError> {
        let legacy_path = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("provider_pools.json");
        if !legacy_path.exists() {
            return Ok(None);
        }
        let contents = tokio::fs::read_to_string(&legacy_path).await?;
        let legacy: serde_json::Value = match serde_json::from_str(&contents) {
            Ok(v) => v,
            Err(_) => return Ok(None),
        };
        let array = legacy
            .get("claude-kiro-oauth")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut seen = std::collections::HashSet::new();
        let mut accounts = Vec::new();
        for raw in array {
            if let Ok(account) = serde_json::from_value::<StoredAccount>(raw) {
                if seen.insert(account.id.clone()) {
                    accounts.push(account);
                }
            }
        }

        let shape = FileShape {
            accounts,
            usage_cache: Vec::new(),
            health_history: Vec::new(),
        };
        Self::flush_shape(path, &shape).await?;

        let backup = legacy_path.with_extension(format!("bak-{}", Utc::now().timestamp()));
        let _ = tokio::fs::rename(&legacy_path, &backup).await;

        Ok(Some(shape))
    }

    fn mark_dirty(&self) {
        let _ = self.dirty_tx.send(());
    }

    async fn flush(path: &Path, state: &Arc<Mutex<State>>) -> Result<(), StoreError> {
        let guard = state.lock().await;
        let shape = FileShape {
            accounts: guard.accounts.values().cloned().collect(),
            usage_cache: guard.usage_cache.values().cloned().collect(),
            health_history: guard.health_history.clone(),
        };
        drop(guard);
        Self::flush_shape(path, &shape).await
    }

    /// Atomic replace: write to a sibling temp file, fsync, rename over target.
    async fn flush_shape(path: &Path, shape: &FileShape) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(shape)?;
        let tmp_path = path.with_extension("json.tmp");

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        use tokio::io::AsyncWriteExt;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StoreBackend for JsonStore {
    async fn load_all(&self) -> Result<Vec<StoredAccount>, StoreError> {
        Ok(self.state.lock().await.accounts.values().cloned().collect())
    }

    async fn upsert(&self, account: &StoredAccount) -> Result<(), StoreError> {
        let mut guard = self.state.lock().await;
        guard.accounts.insert(account.id.clone(), account.clone());
        drop(guard);
        self.mark_dirty();
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut guard = self.state.lock().await;
        guard.accounts.remove(id);
        drop(guard);
        self.mark_dirty();
        Ok(())
    }

    async fn update_health(&self, id: &str, update: HealthUpdate) -> Result<(), StoreError> {
        let mut guard = self.state.lock().await;
        let account = guard
            .accounts
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if let Some(h) = update.healthy {
            account.healthy = h;
        }
        if let Some(c) = update.error_count {
            account.error_count = c;
        }
        if update.last_error_time.is_some() {
            account.last_error_time = update.last_error_time;
        }
        if update.last_error_message.is_some() {
            account.last_error_message = update.last_error_message;
        }
        if update.last_health_check_time.is_some() {
            account.last_health_check_time = update.last_health_check_time;
        }
        if update.last_health_check_model.is_some() {
            account.last_health_check_model = update.last_health_check_model;
        }
        if update.cached_email.is_some() {
            account.cached_email = update.cached_email;
        }
        if update.cached_user_id.is_some() {
            account.cached_user_id = update.cached_user_id;
        }
        if update.reset_usage_count {
            account.usage_count = 0;
        }
        account.updated_at = Utc::now();
        drop(guard);
        self.mark_dirty();
        Ok(())
    }

    async fn bump_error_count(
        &self,
        id: &str,
        max_error_count: u32,
        last_error_time: DateTime<Utc>,
        last_error_message: &str,
    ) -> Result<(u32, bool), StoreError> {
        let mut guard = self.state.lock().await;
        let account = guard
            .accounts
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        account.error_count = account.error_count.saturating_add(1);
        if account.error_count >= max_error_count {
            account.healthy = false;
        }
        account.last_error_time = Some(last_error_time);
        account.last_error_message = Some(last_error_message.to_string());
        account.updated_at = Utc::now();
        let result = (account.error_count, account.healthy);
        drop(guard);
        self.mark_dirty();
        Ok(result)
    }

    async fn increment_usage(&self, id: &str) -> Result<(), StoreError> {
        let mut guard = self.state.lock().await;
        let account = guard
            .accounts
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        account.usage_count = account.usage_count.saturating_add(1);
        account.last_used = Some(Utc::now());
        drop(guard);
        self.mark_dirty();
        Ok(())
    }

    async fn set_disabled(&self, id: &str, disabled: bool) -> Result<(), StoreError> {
        let mut guard = self.state.lock().await;
        let account = guard
            .accounts
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        account.disabled = disabled;
        drop(guard);
        self.mark_dirty();
        Ok(())
    }

    async fn get_usage_cache(
        &self,
        account_id: &str,
        provider_type: &str,
    ) -> Result<Option<UsageCacheEntry>, StoreError> {
        let guard = self.state.lock().await;
        let now_ms = Utc::now().timestamp_millis();
        Ok(guard
            .usage_cache
            .get(&(account_id.to_string(), provider_type.to_string()))
            .filter(|e| e.expires_at > now_ms)
            .cloned())
    }

    async fn set_usage_cache(&self, entry: UsageCacheEntry) -> Result<(), StoreError> {
        let mut guard = self.state.lock().await;
        guard
            .usage_cache
            .insert((entry.account_id.clone(), entry.provider_type.clone()), entry);
        drop(guard);
        self.mark_dirty();
        Ok(())
    }

    async fn get_usage_cache_batch(&self) -> Result<Vec<UsageCacheEntry>, StoreError> {
        let guard = self.state.lock().await;
        let now_ms = Utc::now().timestamp_millis();
        Ok(guard
            .usage_cache
            .values()
            .filter(|e| e.expires_at > now_ms)
            .cloned()
            .collect())
    }

    async fn clean_expired_usage_cache(&self) -> Result<u64, StoreError> {
        let mut guard = self.state.lock().await;
        let now_ms = Utc::now().timestamp_millis();
        let before = guard.usage_cache.len();
        guard.usage_cache.retain(|_, e| e.expires_at > now_ms);
        let removed = (before - guard.usage_cache.len()) as u64;
        drop(guard);
        if removed > 0 {
            self.mark_dirty();
        }
        Ok(removed)
    }

    async fn record_health_check(&self, record: HealthCheckRecord) -> Result<(), StoreError> {
        let mut guard = self.state.lock().await;
        guard.health_history.push(StoredHealthRecord {
            account_id: record.account_id,
            check_time: record.check_time,
            success: record.success,
            check_model: record.check_model,
            error_message: record.error_message,
        });
        if guard.health_history.len() > HEALTH_HISTORY_LIMIT {
            let excess = guard.health_history.len() - HEALTH_HISTORY_LIMIT;
            guard.health_history.drain(0..excess);
        }
        drop(guard);
        self.mark_dirty();
        Ok(())
    }

    async fn clean_old_health_history(&self, days: u32) -> Result<u64, StoreError> {
        let mut guard = self.state.lock().await;
        let cutoff = Utc::now() - chrono::Duration::days(days as i64);
        let before = guard.health_history.len();
        guard.health_history.retain(|r| r.check_time >= cutoff);
        let removed = (before - guard.health_history.len()) as u64;
        drop(guard);
        if removed > 0 {
            self.mark_dirty();
        }
        Ok(removed)
    }
}

impl Drop for JsonStore {
    fn drop(&mut self) {
        if self.dirty_tx.send(()).is_err() {
            warn!("json store writer task already stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AuthDialect;

    #[tokio::test]
    async fn upsert_and_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("account_pool.json");
        let store = JsonStore::open(path.clone()).await.unwrap();

        let account = StoredAccount::new(
            "a1".into(),
            AuthDialect::Social,
            "configs/kiro/a1.json".into(),
            "us-east-1".into(),
        );
        store.upsert(&account).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "a1");
    }

    #[tokio::test]
    async fn malformed_file_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("account_pool.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let result = JsonStore::open(path).await;
        assert!(matches!(result, Err(StoreError::MalformedPool(_))));
    }

    #[tokio::test]
    async fn usage_cache_expires() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("account_pool.json");
        let store = JsonStore::open(path).await.unwrap();

        let now_ms = Utc::now().timestamp_millis();
        store
            .set_usage_cache(UsageCacheEntry {
                account_id: "a1".into(),
                provider_type: "claude".into(),
                usage_data: serde_json::json!({"used": 1}),
                cached_at: Utc::now(),
                expires_at: now_ms - 1,
            })
            .await
            .unwrap();

        let hit = store.get_usage_cache("a1", "claude").await.unwrap();
        assert!(hit.is_none(), "expired entry must read as absent");
    }
}
