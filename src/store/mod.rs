//! Account-pool store backends (C7, §4.7).
//!
//! Two interchangeable implementations — `json::JsonStore` and
//! `sql::SqlStore` — share the [`StoreBackend`] interface. The account pool
//! (C6) is the sole caller; it owns in-memory state and delegates durable
//! writes here.

pub mod json;
pub mod prompt_log;
pub mod sql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Auth dialect tag (§3 Account, GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthDialect {
    Social,
    DeviceOidc,
}

/// A stored account record — the persisted half of §3's Account (runtime
/// pool state lives in [`crate::pool::AccountEntry`]; this is what C7 reads
/// and writes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAccount {
    pub id: String,
    pub auth_dialect: AuthDialect,
    /// Path to the credentials file, or an inline base64 blob.
    pub credentials_ref: String,
    pub region: String,
    pub cached_email: Option<String>,
    pub cached_user_id: Option<String>,
    #[serde(default)]
    pub not_supported_models: Vec<String>,
    #[serde(default = "default_true")]
    pub healthy: bool,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub usage_count: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
    pub last_health_check_time: Option<DateTime<Utc>>,
    pub last_health_check_model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl StoredAccount {
    pub fn new(id: String, auth_dialect: AuthDialect, credentials_ref: String, region: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            auth_dialect,
            credentials_ref,
            region,
            cached_email: None,
            cached_user_id: None,
            not_supported_models: Vec::new(),
            healthy: true,
            disabled: false,
            error_count: 0,
            usage_count: 0,
            last_used: None,
            last_error_time: None,
            last_error_message: None,
            last_health_check_time: None,
            last_health_check_model: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Mutable health fields applied by `UpdateHealth` (§4.7 interface).
#[derive(Debug, Clone, Default)]
pub struct HealthUpdate {
    pub healthy: Option<bool>,
    pub error_count: Option<u32>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
    pub last_health_check_time: Option<DateTime<Utc>>,
    pub last_health_check_model: Option<String>,
    pub cached_email: Option<String>,
    pub cached_user_id: Option<String>,
    pub reset_usage_count: bool,
}

/// A cached upstream usage document (§3 Usage-cache entry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageCacheEntry {
    pub account_id: String,
    pub provider_type: String,
    pub usage_data: serde_json::Value,
    pub cached_at: DateTime<Utc>,
    /// Integer epoch ms, per §4.7's schema note that all comparisons use
    /// the same type.
    pub expires_at: i64,
}

/// One append-only health-check history row (§3).
#[derive(Debug, Clone)]
pub struct HealthCheckRecord {
    pub account_id: String,
    pub check_time: DateTime<Utc>,
    pub success: bool,
    pub check_model: String,
    pub error_message: Option<String>,
}

/// The interface shared by the JSON-file and embedded-SQL backends (§4.7).
#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn load_all(&self) -> Result<Vec<StoredAccount>, StoreError>;
    async fn upsert(&self, account: &StoredAccount) -> Result<(), StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
    async fn update_health(&self, id: &str, update: HealthUpdate) -> Result<(), StoreError>;
    /// Atomically bump `error_count` by one and flip `healthy` to false once
    /// the result reaches `max_error_count`, returning the post-bump count
    /// and health flag so the caller's in-memory cache can be kept in sync
    /// without a separate read (§4.7/§8: concurrent bumps must not be lost).
    async fn bump_error_count(
        &self,
        id: &str,
        max_error_count: u32,
        last_error_time: DateTime<Utc>,
        last_error_message: &str,
    ) -> Result<(u32, bool), StoreError>;
    async fn increment_usage(&self, id: &str) -> Result<(), StoreError>;
    async fn set_disabled(&self, id: &str, disabled: bool) -> Result<(), StoreError>;

    async fn get_usage_cache(
        &self,
        account_id: &str,
        provider_type: &str,
    ) -> Result<Option<UsageCacheEntry>, StoreError>;
    async fn set_usage_cache(&self, entry: UsageCacheEntry) -> Result<(), StoreError>;
    async fn get_usage_cache_batch(&self) -> Result<Vec<UsageCacheEntry>, StoreError>;
    async fn clean_expired_usage_cache(&self) -> Result<u64, StoreError>;

    async fn record_health_check(&self, record: HealthCheckRecord) -> Result<(), StoreError>;
    async fn clean_old_health_history(&self, days: u32) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_account_defaults_to_healthy_and_enabled() {
        let a = StoredAccount::new(
            "acc-1".into(),
            AuthDialect::Social,
            "configs/kiro/acc-1.json".into(),
            "us-east-1".into(),
        );
        assert!(a.healthy);
        assert!(!a.disabled);
        assert_eq!(a.error_count, 0);
        assert_eq!(a.usage_count, 0);
    }
}
