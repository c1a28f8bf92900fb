use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use llmlink_broker::{BrokerConfig, ConnectionBroker};
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Poll `path` for modification and swap the whole document into the broker
/// on change.
///
/// A document that is not valid JSON is skipped so a half-written file does
/// not reset everything to defaults; per-field problems are still corrected
/// the same way as at startup. IPC, API and log settings only take effect on
/// the next restart.
pub async fn watch_config(
    path: PathBuf,
    broker: ConnectionBroker,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut last = modified(&path);
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tick.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }
        let current = modified(&path);
        if current.is_none() || current == last {
            continue;
        }
        last = current;
        if let Some(config) = reload(&path) {
            broker.apply_config(config);
            tracing::info!(path = %path.display(), "config reloaded");
        }
    }
    tracing::debug!("config watcher exited");
}

fn reload(path: &Path) -> Option<BrokerConfig> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(path = %path.display(), err = %e, "failed to read changed config");
            return None;
        }
    };
    if let Err(e) = serde_json::from_str::<Value>(&text) {
        tracing::warn!(path = %path.display(), err = %e, "changed config is not valid JSON, keeping current");
        return None;
    }
    Some(BrokerConfig::parse(&text).config)
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
