//! Policy engine configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the policy manager and permission resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Directory holding `<guild>.avc` snapshots; `None` disables them
    pub snapshot_dir: Option<PathBuf>,
    /// Merged per-guild AVCs; an expired one is rebuilt from resident modules
    pub guild_cache: CacheConfig,
    /// Resolved permission cache
    pub permission_cache: CacheConfig,
}

/// Size and idle lifetime of a bounded cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum resident entries
    pub max_entries: usize,
    /// Idle time before an entry expires
    pub ttl: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: None,
            guild_cache: CacheConfig {
                max_entries: 5000,
                ttl: Duration::from_secs(30 * 60),
            },
            permission_cache: CacheConfig {
                max_entries: 20_000,
                ttl: Duration::from_secs(10 * 60),
            },
        }
    }
}

impl PolicyConfig {
    /// Creates configuration from environment variables.
    ///
    /// Environment variables:
    /// - `POLICY_CACHE_DIR`: AVC snapshot directory (default: unset)
    /// - `POLICY_GUILD_CACHE_MAX`: Guild cache capacity (default: 5000)
    /// - `POLICY_GUILD_CACHE_TTL_SECS`: Guild cache idle TTL (default: 1800)
    /// - `POLICY_PERMISSION_CACHE_MAX`: Permission cache capacity (default: 20000)
    /// - `POLICY_PERMISSION_CACHE_TTL_SECS`: Permission cache TTL (default: 600)
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`PolicyConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup("POLICY_CACHE_DIR").filter(|dir| !dir.trim().is_empty()) {
            config.snapshot_dir = Some(PathBuf::from(dir));
        }
        if let Some(max) = parse(&lookup, "POLICY_GUILD_CACHE_MAX") {
            config.guild_cache.max_entries = max;
        }
        if let Some(secs) = parse(&lookup, "POLICY_GUILD_CACHE_TTL_SECS") {
            config.guild_cache.ttl = Duration::from_secs(secs);
        }
        if let Some(max) = parse(&lookup, "POLICY_PERMISSION_CACHE_MAX") {
            config.permission_cache.max_entries = max;
        }
        if let Some(secs) = parse(&lookup, "POLICY_PERMISSION_CACHE_TTL_SECS") {
            config.permission_cache.ttl = Duration::from_secs(secs);
        }

        config
    }

    /// Snapshot path of `guild`'s merged cache, if snapshots are enabled.
    #[must_use]
    pub fn guild_snapshot_path(&self, guild_id: uuid::Uuid) -> Option<PathBuf> {
        self.snapshot_dir
            .as_ref()
            .map(|dir| dir.join(format!("{guild_id}.avc")))
    }
}

fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let value = lookup(name)?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(variable = name, value = %value, "Ignoring unparseable policy setting");
            None
        }
    }
}
