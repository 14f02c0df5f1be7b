//! Sync configuration.
//!
//! Layered: built-in defaults, then `local_settings` rows in the `sync`
//! category, then `RECORDBOOK_*` environment variables. Every value is
//! clamped so a bad setting can slow sync down but never disable it.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::db;
use crate::error::StoreError;
use crate::retry::RetryPolicy;

pub const SETTINGS_CATEGORY: &str = "sync";

const KEY_INTERVAL: &str = "interval_secs";
const KEY_BATCH_SIZE: &str = "batch_size";
const KEY_RETRY_BASE: &str = "retry_base_ms";
const KEY_RETRY_MAX: &str = "retry_max_ms";
const KEY_RETRY_ATTEMPTS: &str = "retry_max_attempts";
const KEY_REQUEST_TIMEOUT: &str = "request_timeout_secs";
const KEY_PULL_INTERVAL: &str = "pull_interval_secs";

const ENV_INTERVAL: &str = "RECORDBOOK_SYNC_INTERVAL_SECS";
const ENV_BATCH_SIZE: &str = "RECORDBOOK_SYNC_BATCH_SIZE";
const ENV_RETRY_BASE: &str = "RECORDBOOK_RETRY_BASE_MS";
const ENV_RETRY_MAX: &str = "RECORDBOOK_RETRY_MAX_MS";
const ENV_RETRY_ATTEMPTS: &str = "RECORDBOOK_RETRY_MAX_ATTEMPTS";
const ENV_REQUEST_TIMEOUT: &str = "RECORDBOOK_REQUEST_TIMEOUT_SECS";
const ENV_PULL_INTERVAL: &str = "RECORDBOOK_PULL_INTERVAL_SECS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    pub interval_secs: u64,
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub request_timeout_secs: u64,
    /// How often the loop refreshes the mirror from the server.
    pub pull_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            batch_size: 10,
            retry: RetryPolicy::default(),
            request_timeout_secs: 30,
            pull_interval_secs: 300,
        }
    }
}

fn parse_override<T: std::str::FromStr>(source: &str, key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(source, key, value = raw, "Ignoring unparseable sync setting");
            None
        }
    }
}

impl SyncConfig {
    /// Defaults, overridden by stored settings, overridden by the environment.
    pub fn load(conn: &Connection) -> Self {
        let mut config = Self::default();
        config.apply(|key| db::get_setting(conn, SETTINGS_CATEGORY, key), "settings");
        config.apply(
            |key| {
                let env_key = match key {
                    KEY_INTERVAL => ENV_INTERVAL,
                    KEY_BATCH_SIZE => ENV_BATCH_SIZE,
                    KEY_RETRY_BASE => ENV_RETRY_BASE,
                    KEY_RETRY_MAX => ENV_RETRY_MAX,
                    KEY_RETRY_ATTEMPTS => ENV_RETRY_ATTEMPTS,
                    KEY_REQUEST_TIMEOUT => ENV_REQUEST_TIMEOUT,
                    KEY_PULL_INTERVAL => ENV_PULL_INTERVAL,
                    _ => return None,
                };
                std::env::var(env_key).ok()
            },
            "env",
        );
        config.normalized()
    }

    fn apply(&mut self, lookup: impl Fn(&str) -> Option<String>, source: &str) {
        if let Some(v) = lookup(KEY_INTERVAL).and_then(|r| parse_override(source, KEY_INTERVAL, &r)) {
            self.interval_secs = v;
        }
        if let Some(v) =
            lookup(KEY_BATCH_SIZE).and_then(|r| parse_override(source, KEY_BATCH_SIZE, &r))
        {
            self.batch_size = v;
        }
        if let Some(v) =
            lookup(KEY_RETRY_BASE).and_then(|r| parse_override(source, KEY_RETRY_BASE, &r))
        {
            self.retry.base_delay_ms = v;
        }
        if let Some(v) = lookup(KEY_RETRY_MAX).and_then(|r| parse_override(source, KEY_RETRY_MAX, &r))
        {
            self.retry.max_delay_ms = v;
        }
        if let Some(v) =
            lookup(KEY_RETRY_ATTEMPTS).and_then(|r| parse_override(source, KEY_RETRY_ATTEMPTS, &r))
        {
            self.retry.max_attempts = v;
        }
        if let Some(v) = lookup(KEY_REQUEST_TIMEOUT)
            .and_then(|r| parse_override(source, KEY_REQUEST_TIMEOUT, &r))
        {
            self.request_timeout_secs = v;
        }
        if let Some(v) =
            lookup(KEY_PULL_INTERVAL).and_then(|r| parse_override(source, KEY_PULL_INTERVAL, &r))
        {
            self.pull_interval_secs = v;
        }
    }

    pub fn normalized(self) -> Self {
        Self {
            interval_secs: self.interval_secs.clamp(1, 3_600),
            batch_size: self.batch_size.clamp(1, 500),
            retry: self.retry.normalized(),
            request_timeout_secs: self.request_timeout_secs.clamp(1, 300),
            pull_interval_secs: self.pull_interval_secs.clamp(10, 86_400),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pull_interval(&self) -> Duration {
        Duration::from_secs(self.pull_interval_secs)
    }

    /// Store this config in `local_settings` so it survives restarts.
    pub fn persist(&self, conn: &Connection) -> Result<(), StoreError> {
        let pairs = [
            (KEY_INTERVAL, self.interval_secs.to_string()),
            (KEY_BATCH_SIZE, self.batch_size.to_string()),
            (KEY_RETRY_BASE, self.retry.base_delay_ms.to_string()),
            (KEY_RETRY_MAX, self.retry.max_delay_ms.to_string()),
            (KEY_RETRY_ATTEMPTS, self.retry.max_attempts.to_string()),
            (KEY_REQUEST_TIMEOUT, self.request_timeout_secs.to_string()),
            (KEY_PULL_INTERVAL, self.pull_interval_secs.to_string()),
        ];
        for (key, value) in pairs {
            db::set_setting(conn, SETTINGS_CATEGORY, key, &value)?;
        }
        Ok(())
    }
}
