//! Embedded-SQL store backend (§4.7), WAL mode via `sqlx`.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteConnectOptions, Row, SqlitePool};

use crate::error::StoreError;
use crate::store::{
    AuthDialect, HealthCheckRecord, HealthUpdate, StoreBackend, StoredAccount, UsageCacheEntry,
};

const SCHEMA_VERSION: &str = "1";

#[derive(Clone)]
pub struct SqlStore {
    pool: SqlitePool,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct AccountConfig {
    auth_dialect: AuthDialect,
    credentials_ref: String,
    region: String,
}

impl SqlStore {
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let opts = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}?mode=rwc",
            db_path.display()
        ))
        .map_err(sqlx::Error::from)?
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .busy_timeout(std::time::Duration::from_millis(5000))
        .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
        // Legacy schema check: a `providers` table from a pre-accounts
        // layout is migrated by copying surviving rows, then backed up.
        let legacy_exists: Option<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name='providers'",
        )
        .fetch_optional(pool)
        .await?;

        for stmt in include_str!("migrations/001_accounts.sql").split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(pool).await?;
            }
        }

        if legacy_exists.is_some() {
            // Best-effort copy of any overlapping columns; the legacy table
            // predates the unified schema so only `uuid`/`config` carry over.
            let _ = sqlx::query(
                "INSERT OR IGNORE INTO accounts (uuid, config, created_at, updated_at) \
                 SELECT uuid, config, created_at, created_at FROM providers",
            )
            .execute(pool)
            .await;
            sqlx::query("ALTER TABLE providers RENAME TO providers_bak")
                .execute(pool)
                .await
                .ok();
        }

        sqlx::query(
            "INSERT INTO schema_meta (key, value) VALUES ('version', ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

        Ok(())
    }

    fn row_to_account(row: sqlx::sqlite::SqliteRow) -> Result<StoredAccount, StoreError> {
        let config_json: String = row.try_get("config")?;
        let config: AccountConfig = serde_json::from_str(&config_json)?;
        let not_supported_json: String = row.try_get("not_supported_models")?;
        let not_supported_models: Vec<String> =
            serde_json::from_str(&not_supported_json).unwrap_or_default();

        Ok(StoredAccount {
            id: row.try_get("uuid")?,
            auth_dialect: config.auth_dialect,
            credentials_ref: config.credentials_ref,
            region: config.region,
            cached_email: row.try_get("cached_email")?,
            cached_user_id: row.try_get("cached_user_id")?,
            not_supported_models,
            healthy: row.try_get::<i64, _>("is_healthy")? != 0,
            disabled: row.try_get::<i64, _>("is_disabled")? != 0,
            error_count: row.try_get::<i64, _>("error_count")? as u32,
            usage_count: row.try_get::<i64, _>("usage_count")? as u64,
            last_used: parse_opt_dt(row.try_get("last_used")?),
            last_error_time: parse_opt_dt(row.try_get("last_error_time")?),
            last_error_message: row.try_get("last_error_message")?,
            last_health_check_time: parse_opt_dt(row.try_get("last_health_check_time")?),
            last_health_check_model: row.try_get("last_health_check_model")?,
            created_at: parse_dt(row.try_get("created_at")?),
            updated_at: parse_dt(row.try_get("updated_at")?),
        })
    }
}

fn parse_opt_dt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_dt(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait::async_trait]
impl StoreBackend for SqlStore {
    async fn load_all(&self) -> Result<Vec<StoredAccount>, StoreError> {
        let rows = sqlx::query("SELECT * FROM accounts ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::row_to_account).collect()
    }

    async fn upsert(&self, account: &StoredAccount) -> Result<(), StoreError> {
        let config = serde_json::to_string(&AccountConfig {
            auth_dialect: account.auth_dialect,
            credentials_ref: account.credentials_ref.clone(),
            region: account.region.clone(),
        })?;
        let not_supported = serde_json::to_string(&account.not_supported_models)?;

        sqlx::query(
            "INSERT INTO accounts (
                uuid, config, is_healthy, is_disabled, error_count, usage_count,
                last_used, last_error_time, last_error_message,
                last_health_check_time, last_health_check_model,
                cached_email, cached_user_id, not_supported_models,
                created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(uuid) DO UPDATE SET
                config = excluded.config,
                is_healthy = excluded.is_healthy,
                is_disabled = excluded.is_disabled,
                error_count = excluded.error_count,
                usage_count = excluded.usage_count,
                last_used = excluded.last_used,
                last_error_time = excluded.last_error_time,
                last_error_message = excluded.last_error_message,
                last_health_check_time = excluded.last_health_check_time,
                last_health_check_model = excluded.last_health_check_model,
                cached_email = excluded.cached_email,
                cached_user_id = excluded.cached_user_id,
                not_supported_models = excluded.not_supported_models,
                updated_at = excluded.updated_at",
        )
        .bind(&account.id)
        .bind(&config)
        .bind(account.healthy as i64)
        .bind(account.disabled as i64)
        .bind(account.error_count as i64)
        .bind(account.usage_count as i64)
        .bind(account.last_used.map(|d| d.to_rfc3339()))
        .bind(account.last_error_time.map(|d| d.to_rfc3339()))
        .bind(&account.last_error_message)
        .bind(account.last_health_check_time.map(|d| d.to_rfc3339()))
        .bind(&account.last_health_check_model)
        .bind(&account.cached_email)
        .bind(&account.cached_user_id)
        .bind(&not_supported)
        .bind(account.created_at.to_rfc3339())
        .bind(account.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM accounts WHERE uuid = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Applies whichever fields `update` sets, in one transaction. Callers
    /// that need a relative `error_count` bump use [`Self::bump_error_count`]
    /// instead, since this method only ever writes an absolute count.
    async fn update_health(&self, id: &str, update: HealthUpdate) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().to_rfc3339();

        if update.reset_usage_count {
            sqlx::query("UPDATE accounts SET usage_count = 0 WHERE uuid = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(count) = update.error_count {
            sqlx::query("UPDATE accounts SET error_count = ?, updated_at = ? WHERE uuid = ?")
                .bind(count as i64)
                .bind(&now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(healthy) = update.healthy {
            sqlx::query("UPDATE accounts SET is_healthy = ?, updated_at = ? WHERE uuid = ?")
                .bind(healthy as i64)
                .bind(&now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        if update.last_error_time.is_some() || update.last_error_message.is_some() {
            sqlx::query(
                "UPDATE accounts SET last_error_time = ?, last_error_message = ?, updated_at = ? WHERE uuid = ?",
            )
            .bind(update.last_error_time.map(|d| d.to_rfc3339()))
            .bind(&update.last_error_message)
            .bind(&now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        if update.last_health_check_time.is_some() {
            sqlx::query(
                "UPDATE accounts SET last_health_check_time = ?, last_health_check_model = ?, updated_at = ? WHERE uuid = ?",
            )
            .bind(update.last_health_check_time.map(|d| d.to_rfc3339()))
            .bind(&update.last_health_check_model)
            .bind(&now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        if update.cached_email.is_some() || update.cached_user_id.is_some() {
            sqlx::query(
                "UPDATE accounts SET cached_email = COALESCE(?, cached_email), cached_user_id = COALESCE(?, cached_user_id), updated_at = ? WHERE uuid = ?",
            )
            .bind(&update.cached_email)
            .bind(&update.cached_user_id)
            .bind(&now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// One atomic `UPDATE ... RETURNING` so concurrent `MarkUnhealthy` calls
    /// on the same account never lose a bump (§4.7/§8): the new count and
    /// the healthy flag it implies are computed and returned by SQLite
    /// itself, not read back separately afterward.
    async fn bump_error_count(
        &self,
        id: &str,
        max_error_count: u32,
        last_error_time: DateTime<Utc>,
        last_error_message: &str,
    ) -> Result<(u32, bool), StoreError> {
        let now = Utc::now().to_rfc3339();
        let row = sqlx::query(
            "UPDATE accounts \
             SET error_count = error_count + 1, \
                 is_healthy = CASE WHEN error_count + 1 >= ? THEN 0 ELSE is_healthy END, \
                 last_error_time = ?, \
                 last_error_message = ?, \
                 updated_at = ? \
             WHERE uuid = ? \
             RETURNING error_count, is_healthy",
        )
        .bind(max_error_count as i64)
        .bind(last_error_time.to_rfc3339())
        .bind(last_error_message)
        .bind(&now)
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        let new_count: i64 = row.try_get("error_count")?;
        let healthy: i64 = row.try_get("is_healthy")?;
        Ok((new_count as u32, healthy != 0))
    }

    async fn increment_usage(&self, id: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE accounts SET usage_count = usage_count + 1, last_used = ?, updated_at = ? WHERE uuid = ?",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_disabled(&self, id: &str, disabled: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE accounts SET is_disabled = ?, updated_at = ? WHERE uuid = ?")
            .bind(disabled as i64)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_usage_cache(
        &self,
        account_id: &str,
        provider_type: &str,
    ) -> Result<Option<UsageCacheEntry>, StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let row = sqlx::query(
            "SELECT * FROM usage_cache WHERE account_uuid = ? AND provider_type = ? AND expires_at > ?",
        )
        .bind(account_id)
        .bind(provider_type)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| -> Result<UsageCacheEntry, StoreError> {
            Ok(UsageCacheEntry {
                account_id: r.try_get("account_uuid")?,
                provider_type: r.try_get("provider_type")?,
                usage_data: serde_json::from_str(&r.try_get::<String, _>("usage_data")?)?,
                cached_at: parse_dt(r.try_get("cached_at")?),
                expires_at: r.try_get("expires_at")?,
            })
        })
        .transpose()
    }

    async fn set_usage_cache(&self, entry: UsageCacheEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO usage_cache (account_uuid, provider_type, usage_data, cached_at, expires_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(account_uuid, provider_type) DO UPDATE SET
                usage_data = excluded.usage_data,
                cached_at = excluded.cached_at,
                expires_at = excluded.expires_at",
        )
        .bind(&entry.account_id)
        .bind(&entry.provider_type)
        .bind(serde_json::to_string(&entry.usage_data)?)
        .bind(entry.cached_at.to_rfc3339())
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_usage_cache_batch(&self) -> Result<Vec<UsageCacheEntry>, StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let rows = sqlx::query("SELECT * FROM usage_cache WHERE expires_at > ?")
            .bind(now_ms)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| -> Result<UsageCacheEntry, StoreError> {
                Ok(UsageCacheEntry {
                    account_id: r.try_get("account_uuid")?,
                    provider_type: r.try_get("provider_type")?,
                    usage_data: serde_json::from_str(&r.try_get::<String, _>("usage_data")?)?,
                    cached_at: parse_dt(r.try_get("cached_at")?),
                    expires_at: r.try_get("expires_at")?,
                })
            })
            .collect()
    }

    async fn clean_expired_usage_cache(&self) -> Result<u64, StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let result = sqlx::query("DELETE FROM usage_cache WHERE expires_at <= ?")
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn record_health_check(&self, record: HealthCheckRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO health_check_history (account_uuid, is_healthy, check_model, error_message, check_time)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.account_id)
        .bind(record.success as i64)
        .bind(&record.check_model)
        .bind(&record.error_message)
        .bind(record.check_time.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clean_old_health_history(&self, days: u32) -> Result<u64, StoreError> {
        let cutoff = (Utc::now() - chrono::Duration::days(days as i64)).to_rfc3339();
        let result = sqlx::query("DELETE FROM health_check_history WHERE check_time < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoredAccount;

    #[tokio::test]
    async fn upsert_and_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqlStore::open(&dir.path().join("test.db")).await.unwrap();

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
        assert!(loaded[0].healthy);
    }

    #[tokio::test]
    async fn concurrent_error_count_bumps_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(SqlStore::open(&dir.path().join("test.db")).await.unwrap());

        let account = StoredAccount::new(
            "a1".into(),
            AuthDialect::Social,
            "configs/kiro/a1.json".into(),
            "us-east-1".into(),
        );
        store.upsert(&account).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.bump_error_count("a1", 100, Utc::now(), "boom").await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded[0].error_count, 10);
    }

    #[tokio::test]
    async fn bump_error_count_flips_unhealthy_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqlStore::open(&dir.path().join("test.db")).await.unwrap();

        let account = StoredAccount::new(
            "a1".into(),
            AuthDialect::Social,
            "configs/kiro/a1.json".into(),
            "us-east-1".into(),
        );
        store.upsert(&account).await.unwrap();

        let (count, healthy) = store.bump_error_count("a1", 2, Utc::now(), "first").await.unwrap();
        assert_eq!(count, 1);
        assert!(healthy);

        let (count, healthy) = store.bump_error_count("a1", 2, Utc::now(), "second").await.unwrap();
        assert_eq!(count, 2);
        assert!(!healthy);
    }

    #[tokio::test]
    async fn usage_cache_round_trips_and_expires() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqlStore::open(&dir.path().join("test.db")).await.unwrap();

        store
            .set_usage_cache(UsageCacheEntry {
                account_id: "a1".into(),
                provider_type: "claude".into(),
                usage_data: serde_json::json!({"used": 5}),
                cached_at: Utc::now(),
                expires_at: Utc::now().timestamp_millis() + 60_000,
            })
            .await
            .unwrap();

        let hit = store.get_usage_cache("a1", "claude").await.unwrap();
        assert!(hit.is_some());
        assert_eq!(hit.unwrap().usage_data["used"], 5);
    }
}
