// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Environment-derived kernel configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::infrastructure::hash_chain::{AuditKey, KeyRegistry};

const DEV_AUDIT_SECRET: &str = "dev_audit_secret_change_me";

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub registry_path: PathBuf,
    pub registry_layers_dir: PathBuf,
    pub use_postgres: bool,
    pub database_url: Option<String>,
    pub snapshot_every: u64,
    pub refresh_mv_every: u64,
    pub mv_refresh_interval: Duration,
    pub mv_refresh_max_backoff: Duration,
    pub tenant_max_concurrency: u32,
    pub rate_limit_window_s: u64,
    /// Zero means wait indefinitely for an approval decision.
    pub approval_timeout: Option<Duration>,
    pub heartbeat_interval: Duration,
    pub step_parallelism: usize,
    pub worker_poll: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            registry_path: PathBuf::from("./config/registry.json"),
            registry_layers_dir: PathBuf::from("./config"),
            use_postgres: false,
            database_url: None,
            snapshot_every: 25,
            refresh_mv_every: 50,
            mv_refresh_interval: Duration::from_secs(60),
            mv_refresh_max_backoff: Duration::from_secs(600),
            tenant_max_concurrency: 2,
            rate_limit_window_s: 60,
            approval_timeout: None,
            heartbeat_interval: Duration::from_secs(15),
            step_parallelism: 4,
            worker_poll: Duration::from_millis(300),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl KernelConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let database_url = std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty());
        let use_postgres = std::env::var("USE_POSTGRES").map(|v| v == "1").unwrap_or(false)
            || database_url.is_some();
        let approval_timeout_s = env_u64("APPROVAL_TIMEOUT_S", 0);

        Self {
            registry_path: std::env::var("REGISTRY_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.registry_path),
            registry_layers_dir: std::env::var("REGISTRY_LAYERS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.registry_layers_dir),
            use_postgres,
            database_url,
            snapshot_every: env_u64("SNAPSHOT_EVERY", 25).max(1),
            refresh_mv_every: env_u64("REFRESH_MV_EVERY", 50).max(1),
            mv_refresh_interval: Duration::from_secs(env_u64("MV_REFRESH_INTERVAL_S", 60).max(1)),
            mv_refresh_max_backoff: Duration::from_secs(env_u64("MV_REFRESH_MAX_BACKOFF_S", 600)),
            tenant_max_concurrency: env_u64("TENANT_MAX_CONCURRENCY", 2).max(1) as u32,
            rate_limit_window_s: env_u64("RATE_LIMIT_WINDOW_S", 60).max(1),
            approval_timeout: match approval_timeout_s {
                0 => None,
                s => Some(Duration::from_secs(s)),
            },
            heartbeat_interval: Duration::from_secs(env_u64("HEARTBEAT_INTERVAL_S", 15).max(1)),
            step_parallelism: env_u64("STEP_PARALLELISM", 4).max(1) as usize,
            worker_poll: Duration::from_millis(env_u64("WORKER_POLL_MS", 300).max(10)),
        }
    }

    /// Audit keyring from the environment.
    ///
    /// Preferred: `AUDIT_KEYS_JSON='[{"kid":"k1","secret":"…","active":true},…]'`.
    /// Fallback: `AUDIT_SECRET` as a single `k0` key; a development default
    /// applies when neither is set.
    pub fn audit_keyring() -> KeyRegistry {
        if let Ok(raw) = std::env::var("AUDIT_KEYS_JSON") {
            if let Ok(keys) = serde_json::from_str::<Vec<AuditKey>>(&raw) {
                if let Ok(ring) = KeyRegistry::new(keys) {
                    return ring;
                }
            }
        }
        let secret =
            std::env::var("AUDIT_SECRET").unwrap_or_else(|_| DEV_AUDIT_SECRET.to_string());
        KeyRegistry::single(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.snapshot_every, 25);
        assert_eq!(cfg.refresh_mv_every, 50);
        assert_eq!(cfg.tenant_max_concurrency, 2);
        assert_eq!(cfg.rate_limit_window_s, 60);
        assert_eq!(cfg.approval_timeout, None);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(15));
    }
}
