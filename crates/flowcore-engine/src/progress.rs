//! Minimal `ProgressSink` for the CLI: `Progress` events go to stderr as
//! they arrive, `on_log` is folded into the same structured `tracing`
//! pipeline `flowcore-observability` sets up.

use async_trait::async_trait;
use flowcore_types::{Progress, ProgressSink};
use tracing::Level;

pub struct ConsoleProgressSink;

#[async_trait]
impl ProgressSink for ConsoleProgressSink {
    async fn on_progress(&self, progress: Progress) {
        let eta = progress
            .eta_ms
            .map(|ms| format!("{ms}ms"))
            .unwrap_or_else(|| "?".to_string());
        eprintln!(
            "stage {}/{}: {}/{} tasks done, {} failed ({:.1}%, eta {})",
            progress.stage_index + 1,
            progress.stage_total,
            progress.tasks_completed,
            progress.tasks_total,
            progress.tasks_failed,
            progress.percent,
            eta
        );
    }

    async fn on_log(&self, level: Level, message: &str, details: Option<serde_json::Value>) {
        let details = details
            .map(|value| value.to_string())
            .unwrap_or_default();
        match level {
            Level::ERROR => tracing::error!(target: "flowcore.engine", %details, "{message}"),
            Level::WARN => tracing::warn!(target: "flowcore.engine", %details, "{message}"),
            _ => tracing::info!(target: "flowcore.engine", %details, "{message}"),
        }
    }
}
