//! Guild policy build.
//!
//! For every `<source_dir>/<guild-uuid>/` directory: compile its `*.policy`
//! files in filename order, write each module snapshot, load the snapshots
//! into a fresh guild, merge, and write the guild snapshot. A guild that
//! fails is reported and skipped; the others are still built.

use std::error::Error as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use uuid::Uuid;
use vc_policy::{PolicyCompiler, PolicyError, PolicyManager};

use crate::config::Config;

/// Outcome of one successfully built guild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildSummary {
    pub guild_id: Uuid,
    pub modules: Vec<String>,
    pub types: usize,
}

#[derive(Debug, Default)]
pub struct BuildReport {
    pub built: Vec<GuildSummary>,
    pub failed: Vec<(Uuid, PolicyError)>,
}

impl BuildReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Build every guild under `config.source_dir`.
///
/// Fails only when the source directory itself cannot be listed.
pub async fn build_all(config: &Config) -> Result<BuildReport> {
    let compiler = PolicyCompiler::default();
    let manager = PolicyManager::new(config.policy.clone());
    let mut report = BuildReport::default();

    for (guild_id, dir) in guild_dirs(&config.source_dir).await? {
        match build_guild(config, &compiler, &manager, guild_id, &dir).await {
            Ok(summary) => {
                info!(
                    %guild_id,
                    modules = summary.modules.len(),
                    types = summary.types,
                    "Built guild policy"
                );
                report.built.push(summary);
            }
            Err(e) => {
                error!(%guild_id, error = %describe(&e), "Guild policy build failed");
                report.failed.push((guild_id, e));
            }
        }
        manager.evict_guild(guild_id);
    }

    Ok(report)
}

/// Compile, persist and merge the sources of one guild.
#[tracing::instrument(skip(config, compiler, manager, dir))]
pub async fn build_guild(
    config: &Config,
    compiler: &PolicyCompiler,
    manager: &PolicyManager,
    guild_id: Uuid,
    dir: &Path,
) -> Result<GuildSummary, PolicyError> {
    manager.reset_guild(guild_id);
    let module_dir = config.module_dir(guild_id);

    for source in policy_sources(dir).await? {
        let module = compiler.compile_file(&source).await?;
        let snapshot = module_dir.join(snapshot_file_name(module.name())?);

        manager.store_module_file(&snapshot, &module).await?;
        manager.load_module_from_file(guild_id, &snapshot).await?;
    }

    let avc = manager.compile_all(guild_id).await?;
    manager.store_guild(guild_id).await?;

    Ok(GuildSummary {
        guild_id,
        modules: manager.loaded_modules(guild_id).await.into_keys().collect(),
        types: avc.map_types.len(),
    })
}

/// File name of a module snapshot. Module names become path components,
/// so anything that could escape the module directory is rejected.
fn snapshot_file_name(module: &str) -> Result<String, PolicyError> {
    let escapes = module.contains(['/', '\\']) || module.starts_with('.');
    if escapes {
        return Err(PolicyError::Validation(format!(
            "module name '{module}' cannot be used as a snapshot file name"
        )));
    }
    Ok(format!("{module}.pm"))
}

/// Guild directories under `root`, sorted by guild id.
async fn guild_dirs(root: &Path) -> Result<Vec<(Uuid, PathBuf)>> {
    let mut entries = tokio::fs::read_dir(root)
        .await
        .with_context(|| format!("Failed to read policy source directory {}", root.display()))?;

    let mut guilds = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("Failed to list {}", root.display()))?
    {
        let path = entry.path();
        if !entry.file_type().await.is_ok_and(|t| t.is_dir()) {
            continue;
        }

        let name = entry.file_name();
        match name.to_str().and_then(|name| Uuid::parse_str(name).ok()) {
            Some(guild_id) => guilds.push((guild_id, path)),
            None => warn!(path = %path.display(), "Skipping directory that is not a guild id"),
        }
    }

    guilds.sort_by_key(|(guild_id, _)| *guild_id);
    Ok(guilds)
}

/// `*.policy` files directly inside `dir`, sorted by file name.
async fn policy_sources(dir: &Path) -> Result<Vec<PathBuf>, PolicyError> {
    let io = |e| PolicyError::Io {
        path: dir.to_path_buf(),
        source: e,
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(io)?;
    let mut sources = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io)? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "policy") {
            sources.push(path);
        }
    }

    sources.sort();
    Ok(sources)
}

/// Human-readable description of a build failure.
///
/// Compile errors are rendered with a source excerpt; other errors are
/// printed with their cause chain.
pub fn describe(error: &PolicyError) -> String {
    if let PolicyError::Compile(compile) = error {
        return compile.render();
    }

    let mut out = error.to_string();
    let mut cause = error.source();
    while let Some(inner) = cause {
        out.push_str(": ");
        out.push_str(&inner.to_string());
        cause = inner.source();
    }
    out
}
