//! Build Tool Configuration
//!
//! Loads configuration from environment variables.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

use vc_policy::PolicyConfig;

/// Build tool configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the policy sources: `<source_dir>/<guild-uuid>/*.policy`
    pub source_dir: PathBuf,

    /// Output directory for module and guild snapshots
    pub cache_dir: PathBuf,

    /// Policy engine settings (cache sizes, TTLs)
    pub policy: PolicyConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// `POLICY_SOURCE_DIR` and `POLICY_CACHE_DIR` are required; the rest
    /// is read by [`PolicyConfig::from_env`].
    pub fn from_env() -> Result<Self> {
        let source_dir = env::var("POLICY_SOURCE_DIR").context("POLICY_SOURCE_DIR must be set")?;
        let mut policy = PolicyConfig::from_env();
        let cache_dir = policy
            .snapshot_dir
            .clone()
            .context("POLICY_CACHE_DIR must be set")?;
        policy.snapshot_dir = Some(cache_dir.clone());

        Ok(Self {
            source_dir: PathBuf::from(source_dir),
            cache_dir,
            policy,
        })
    }

    /// Configuration rooted at the given directories, with default engine
    /// settings.
    pub fn new(source_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        let cache_dir = cache_dir.into();
        Self {
            source_dir: source_dir.into(),
            policy: PolicyConfig {
                snapshot_dir: Some(cache_dir.clone()),
                ..PolicyConfig::default()
            },
            cache_dir,
        }
    }

    /// Directory holding the module snapshots of one guild.
    pub fn module_dir(&self, guild_id: uuid::Uuid) -> PathBuf {
        self.cache_dir.join("modules").join(guild_id.to_string())
    }
}
