//! Claude-compatible HTTP gateway in front of the Kiro/CodeWhisperer backend.
//!
//! See SPEC_FULL.md for the module map. `build_app_state` wires config,
//! store, pool, and upstream client into the shared [`orchestrator::AppState`];
//! `router` merges the `/v1/*` and `/api/*` surfaces into one [`axum::Router`].

pub mod admin;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod pool;
pub mod store;
pub mod token;
pub mod translate;
pub mod upstream;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use config::GatewayConfig;
use orchestrator::{AppState, AppStateInner};
use pool::AccountPool;
use store::json::JsonStore;
use store::prompt_log::PromptLog;
use store::sql::SqlStore;
use store::StoreBackend;
use upstream::UpstreamClient;

/// Build the shared [`AppState`]: opens the configured store backend
/// (§4.7, JSON file or embedded SQLite), loads the account pool from it,
/// and assembles the upstream client and prompt log around it.
pub async fn build_app_state(config: GatewayConfig) -> anyhow::Result<AppState> {
    let store: Arc<dyn StoreBackend> = if config.use_sqlite_pool {
        Arc::new(SqlStore::open(&config.sqlite_db_path).await?)
    } else {
        Arc::new(JsonStore::open(config.account_pool_file_path.clone()).await?)
    };

    let pool = AccountPool::load(store, config.max_error_count).await?;

    let http = reqwest::Client::builder().build()?;
    let upstream = UpstreamClient::new(http.clone(), config.request_max_retries, config.request_base_delay_ms);
    let prompt_log = PromptLog::new(config.prompt_log_mode, &config.config_dir, &config.prompt_log_base_name);

    Ok(Arc::new(AppStateInner {
        config,
        pool,
        upstream,
        http,
        prompt_log,
        tokens: RwLock::new(HashMap::new()),
        last_system_prompt: RwLock::new(None),
        health_check_inflight: tokio::sync::Mutex::new(HashSet::new()),
    }))
}

/// The full axum router: C8's `/v1/*` surface merged with C9's `/api/*`
/// admin surface over one shared [`AppState`].
pub fn router(state: AppState) -> axum::Router {
    orchestrator::router(state.clone()).merge(admin::router(state))
}
