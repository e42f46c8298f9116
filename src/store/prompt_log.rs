//! Resolved-prompt logging sink (§6 `PROMPT_LOG_MODE`).
//!
//! Independent of the `tracing` pipeline (A2): this writes the fully
//! resolved request prompt — after history sanitization and system-prompt
//! merge (C2) — as plain text, one entry per request, for prompt debugging.
//! `none` disables it entirely; `console` emits through `tracing::debug!`;
//! `file` appends to a rotating log file using the same atomic
//! open-or-rotate-at-size pattern the audit log uses elsewhere in this
//! codebase.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};

use crate::config::PromptLogMode;

const ROTATE_BYTES: u64 = 50 * 1024 * 1024;

pub struct PromptLog {
    mode: PromptLogMode,
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl PromptLog {
    pub fn new(mode: PromptLogMode, log_dir: &Path, base_name: &str) -> Self {
        Self {
            mode,
            path: log_dir.join(format!("{base_name}.log")),
            file: Mutex::new(None),
        }
    }

    /// Record one resolved prompt. Failures are logged at `warn` and never
    /// propagated — per §8 scenario 8, a broken prompt log must not fail
    /// the request it's logging.
    pub async fn record(&self, account_id: &str, model: &str, resolved_prompt: &str) {
        match self.mode {
            PromptLogMode::None => {}
            PromptLogMode::Console => {
                tracing::debug!(account_id, model, prompt = resolved_prompt, "resolved prompt");
            }
            PromptLogMode::File => {
                if let Err(e) = self.try_append(account_id, model, resolved_prompt).await {
                    tracing::warn!(err = %e, "prompt log write failed");
                }
            }
        }
    }

    async fn try_append(
        &self,
        account_id: &str,
        model: &str,
        resolved_prompt: &str,
    ) -> anyhow::Result<()> {
        let header = format!(
            "--- {} account={account_id} model={model} ---\n",
            Utc::now().to_rfc3339()
        );
        let mut line = header;
        line.push_str(resolved_prompt);
        if !line.ends_with('\n') {
            line.push('\n');
        }
        let bytes = line.as_bytes();

        let mut guard = self.file.lock().await;

        if guard.is_some() {
            if let Ok(meta) = tokio::fs::metadata(&self.path).await {
                if meta.len() >= ROTATE_BYTES {
                    *guard = None;
                    let rotated = self.path.with_extension("log.1");
                    let _ = tokio::fs::rename(&self.path, &rotated).await;
                }
            }
        }

        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(f);
        }

        guard.as_mut().unwrap().write_all(bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn none_mode_never_touches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let log = PromptLog::new(PromptLogMode::None, dir.path(), "prompts");
        log.record("a1", "claude-3", "hello").await;
        assert!(!dir.path().join("prompts.log").exists());
    }

    #[tokio::test]
    async fn file_mode_appends_resolved_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let log = PromptLog::new(PromptLogMode::File, dir.path(), "prompts");
        log.record("a1", "claude-3", "resolved text here").await;

        let content = tokio::fs::read_to_string(dir.path().join("prompts.log"))
            .await
            .unwrap();
        assert!(content.contains("resolved text here"));
        assert!(content.contains("account=a1"));
    }

    #[tokio::test]
    async fn unwritable_directory_does_not_panic() {
        let log = PromptLog::new(
            PromptLogMode::File,
            Path::new("/nonexistent-root-only-path/subdir"),
            "prompts",
        );
        // Should not panic, only warn.
        log.record("a1", "claude-3", "x").await;
    }
}
