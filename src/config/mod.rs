//! Gateway configuration.
//!
//! Priority (highest to lowest): CLI flag > environment variable > TOML file
//! at `{config_dir}/config.toml` > built-in default.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 3_000;
const DEFAULT_CRON_NEAR_MINUTES: u32 = 10;
const DEFAULT_MAX_ERROR_COUNT: u32 = 3;
const DEFAULT_HEALTH_CHECK_CONCURRENCY: usize = 5;
const DEFAULT_USAGE_QUERY_CONCURRENCY: usize = 10;

/// System-prompt override mode (§6 `SYSTEM_PROMPT_MODE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemPromptMode {
    Overwrite,
    Append,
}

/// Where resolved prompts are logged (§6 `PROMPT_LOG_MODE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PromptLogMode {
    #[default]
    None,
    Console,
    File,
}

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{config_dir}/config.toml` — all fields are optional overrides, sitting
/// below env vars and CLI flags in priority.
#[derive(Deserialize, Default)]
struct TomlConfig {
    server_port: Option<u16>,
    host: Option<String>,
    request_max_retries: Option<u32>,
    request_base_delay_ms: Option<u64>,
    cron_near_minutes: Option<u32>,
    cron_refresh_token: Option<bool>,
    max_error_count: Option<u32>,
    enable_thinking_by_default: Option<bool>,
    use_sqlite_pool: Option<bool>,
    sqlite_db_path: Option<String>,
    health_check_concurrency: Option<usize>,
    usage_query_concurrency: Option<usize>,
    account_pool_file_path: Option<String>,
    system_prompt_file_path: Option<String>,
    system_prompt_mode: Option<SystemPromptMode>,
    prompt_log_mode: Option<PromptLogMode>,
    prompt_log_base_name: Option<String>,
}

fn load_toml(path: &Path) -> Option<TomlConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
}

// ─── GatewayConfig ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Shared secret required on every `/v1/*` request. Required — process
    /// refuses to start without it.
    pub required_api_key: String,
    pub server_port: u16,
    pub host: String,
    pub request_max_retries: u32,
    pub request_base_delay_ms: u64,
    pub cron_near_minutes: u32,
    pub cron_refresh_token: bool,
    pub max_error_count: u32,
    pub enable_thinking_by_default: bool,
    pub use_sqlite_pool: bool,
    pub sqlite_db_path: PathBuf,
    pub health_check_concurrency: usize,
    pub usage_query_concurrency: usize,
    pub account_pool_file_path: PathBuf,
    pub system_prompt_file_path: Option<PathBuf>,
    pub system_prompt_mode: SystemPromptMode,
    pub prompt_log_mode: PromptLogMode,
    pub prompt_log_base_name: String,
    /// Directory holding `config.toml`, credential files, and (for the JSON
    /// backend) `account_pool.json` when no explicit path is given.
    pub config_dir: PathBuf,
}

/// Error constructing the config: only the missing shared secret is fatal
/// at this layer (A1 turns it into a non-zero exit).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("REQUIRED_API_KEY is not set — refusing to start without a shared secret")]
    MissingApiKey,
}

impl GatewayConfig {
    /// Build config from CLI overrides + env vars + optional TOML file.
    pub fn new(
        config_dir: PathBuf,
        cli_port: Option<u16>,
        cli_api_key: Option<String>,
    ) -> Result<Self, ConfigError> {
        let toml_path = config_dir.join("config.toml");
        let toml = load_toml(&toml_path).unwrap_or_default();

        let required_api_key = cli_api_key
            .or_else(|| env_string("REQUIRED_API_KEY"))
            .ok_or(ConfigError::MissingApiKey)?;

        let server_port = cli_port
            .or_else(|| env_parsed("SERVER_PORT"))
            .or(toml.server_port)
            .unwrap_or(DEFAULT_PORT);

        let host = env_string("HOST")
            .or(toml.host)
            .unwrap_or_else(|| DEFAULT_HOST.to_string());

        let request_max_retries = env_parsed("REQUEST_MAX_RETRIES")
            .or(toml.request_max_retries)
            .unwrap_or(DEFAULT_MAX_RETRIES);

        let request_base_delay_ms = env_parsed("REQUEST_BASE_DELAY")
            .or(toml.request_base_delay_ms)
            .unwrap_or(DEFAULT_BASE_DELAY_MS);

        let cron_near_minutes = env_parsed("CRON_NEAR_MINUTES")
            .or(toml.cron_near_minutes)
            .unwrap_or(DEFAULT_CRON_NEAR_MINUTES);

        let cron_refresh_token = env_bool("CRON_REFRESH_TOKEN")
            .or(toml.cron_refresh_token)
            .unwrap_or(true);

        let max_error_count = env_parsed("MAX_ERROR_COUNT")
            .or(toml.max_error_count)
            .unwrap_or(DEFAULT_MAX_ERROR_COUNT);

        let enable_thinking_by_default = env_bool("ENABLE_THINKING_BY_DEFAULT")
            .or(toml.enable_thinking_by_default)
            .unwrap_or(false);

        let use_sqlite_pool = env_bool("USE_SQLITE_POOL")
            .or(toml.use_sqlite_pool)
            .unwrap_or(false);

        let sqlite_db_path = env_string("SQLITE_DB_PATH")
            .or(toml.sqlite_db_path)
            .map(PathBuf::from)
            .unwrap_or_else(|| config_dir.join("gateway.db"));

        let health_check_concurrency = env_parsed("HEALTH_CHECK_CONCURRENCY")
            .or(toml.health_check_concurrency)
            .unwrap_or(DEFAULT_HEALTH_CHECK_CONCURRENCY);

        let usage_query_concurrency = env_parsed("USAGE_QUERY_CONCURRENCY")
            .or(toml.usage_query_concurrency)
            .unwrap_or(DEFAULT_USAGE_QUERY_CONCURRENCY);

        let account_pool_file_path = env_string("ACCOUNT_POOL_FILE_PATH")
            .or(toml.account_pool_file_path)
            .map(PathBuf::from)
            .unwrap_or_else(|| config_dir.join("account_pool.json"));

        let system_prompt_file_path = env_string("SYSTEM_PROMPT_FILE_PATH")
            .or(toml.system_prompt_file_path)
            .map(PathBuf::from);

        let system_prompt_mode = toml
            .system_prompt_mode
            .unwrap_or(SystemPromptMode::Append);

        let prompt_log_mode = toml.prompt_log_mode.unwrap_or_default();

        let prompt_log_base_name = env_string("PROMPT_LOG_BASE_NAME")
            .or(toml.prompt_log_base_name)
            .unwrap_or_else(|| "prompts".to_string());

        Ok(Self {
            required_api_key,
            server_port,
            host,
            request_max_retries,
            request_base_delay_ms,
            cron_near_minutes,
            cron_refresh_token,
            max_error_count,
            enable_thinking_by_default,
            use_sqlite_pool,
            sqlite_db_path,
            health_check_concurrency,
            usage_query_concurrency,
            account_pool_file_path,
            system_prompt_file_path,
            system_prompt_mode,
            prompt_log_mode,
            prompt_log_base_name,
            config_dir,
        })
    }
}

pub fn default_config_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("kiro-gateway");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join("kiro-gateway");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".config").join("kiro-gateway");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("kiro-gateway");
        }
    }
    PathBuf::from(".kiro-gateway")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_api_key_is_an_error() {
        std::env::remove_var("REQUIRED_API_KEY");
        let dir = tempfile::tempdir().unwrap();
        let result = GatewayConfig::new(dir.path().to_path_buf(), None, None);
        assert!(matches!(result, Err(ConfigError::MissingApiKey)));
    }

    #[test]
    fn cli_api_key_satisfies_requirement() {
        std::env::remove_var("REQUIRED_API_KEY");
        let dir = tempfile::tempdir().unwrap();
        let cfg = GatewayConfig::new(dir.path().to_path_buf(), None, Some("secret".into())).unwrap();
        assert_eq!(cfg.required_api_key, "secret");
        assert_eq!(cfg.server_port, DEFAULT_PORT);
    }

    #[test]
    fn cli_port_overrides_default() {
        std::env::remove_var("SERVER_PORT");
        let dir = tempfile::tempdir().unwrap();
        let cfg = GatewayConfig::new(dir.path().to_path_buf(), Some(9999), Some("k".into())).unwrap();
        assert_eq!(cfg.server_port, 9999);
    }
}
