//! Per-guild policy state.
//!
//! A guild's loaded modules are its source of truth and stay resident until
//! the guild is evicted or replaced. The access vector cache merged from them
//! lives in a bounded, idle-expiring cache; an expired cache is rebuilt from
//! the modules it was last merged from.
//!
//! Permission lookups are synchronous and only read resident state. Loading
//! and merging are explicit, asynchronous administrative operations.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::avc::{AccessVectorCache, TypePair};
use crate::cache::TtlCache;
use crate::codec::{self, GuildSnapshot};
use crate::config::PolicyConfig;
use crate::error::PolicyError;
use crate::module::{CompiledModule, TypeId};
use crate::permissions::Permissions;

/// A security type given by name or by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeRef<'a> {
    Name(&'a str),
    Id(TypeId),
}

impl<'a> From<&'a str> for TypeRef<'a> {
    fn from(name: &'a str) -> Self {
        Self::Name(name)
    }
}

impl From<TypeId> for TypeRef<'_> {
    fn from(id: TypeId) -> Self {
        Self::Id(id)
    }
}

impl TypeRef<'_> {
    fn resolve(self, avc: &AccessVectorCache) -> Option<TypeId> {
        match self {
            Self::Name(name) => avc.type_id(name),
            Self::Id(id) => Some(id),
        }
    }
}

type ModuleSet = IndexMap<String, CompiledModule>;

#[derive(Debug, Default)]
struct GuildState {
    /// Loaded modules, in load order.
    modules: RwLock<ModuleSet>,
    /// Modules the published cache was merged from. `None` before the
    /// first merge.
    merged: RwLock<Option<Arc<ModuleSet>>>,
    /// Serializes merges of this guild.
    merge_lock: Mutex<()>,
    rebuild_scheduled: AtomicBool,
}

impl GuildState {
    /// State restored from a snapshot, whose cache was merged from `modules`.
    fn restored(modules: ModuleSet) -> Self {
        Self {
            merged: RwLock::new(Some(Arc::new(modules.clone()))),
            modules: RwLock::new(modules),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct Residency {
    guilds: DashMap<Uuid, Arc<GuildState>>,
    avcs: TtlCache<Uuid, Arc<AccessVectorCache>>,
}

impl Residency {
    fn state(&self, guild_id: Uuid) -> Option<Arc<GuildState>> {
        self.guilds.get(&guild_id).map(|state| Arc::clone(&state))
    }

    /// Publish `avc` for `guild_id` if `state` is still the resident state.
    ///
    /// The guild entry stays borrowed until the cache is in place, so a
    /// concurrent replacement lands either wholly before or wholly after.
    fn publish(&self, guild_id: Uuid, state: &Arc<GuildState>, avc: Arc<AccessVectorCache>) -> bool {
        let Some(resident) = self.guilds.get(&guild_id) else {
            return false;
        };
        if !Arc::ptr_eq(&resident, state) {
            return false;
        }

        self.avcs.insert(guild_id, avc);
        true
    }

    /// Install `snapshot` unless the guild became resident meanwhile.
    fn restore(&self, guild_id: Uuid, snapshot: GuildSnapshot) -> Arc<GuildState> {
        match self.guilds.entry(guild_id) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let state = Arc::new(GuildState::restored(snapshot.modules));
                let _resident = entry.insert(Arc::clone(&state));
                self.avcs.insert(guild_id, Arc::new(snapshot.avc));
                state
            }
        }
    }

    /// Make `state` resident, dropping whatever was resident before.
    fn replace(&self, guild_id: Uuid, state: Arc<GuildState>, avc: Option<AccessVectorCache>) {
        let _resident = self.guilds.entry(guild_id).insert(state);
        match avc {
            Some(avc) => self.avcs.insert(guild_id, Arc::new(avc)),
            None => {
                self.avcs.remove(&guild_id);
            }
        }
    }

    /// Merge the modules behind the guild's last published cache again.
    ///
    /// `None` when the guild was never merged or the merge fails.
    async fn rebuild(&self, guild_id: Uuid, state: &Arc<GuildState>) -> Option<Arc<AccessVectorCache>> {
        let _guard = state.merge_lock.lock().await;
        if let Some(avc) = self.avcs.get(&guild_id) {
            return Some(avc);
        }

        let merged = state.merged.read().clone()?;
        match AccessVectorCache::build(merged.values()) {
            Ok(avc) => {
                let avc = Arc::new(avc);
                if self.publish(guild_id, state, Arc::clone(&avc)) {
                    debug!(%guild_id, modules = merged.len(), "Rebuilt expired guild policy");
                }
                Some(avc)
            }
            Err(e) => {
                error!(%guild_id, error = %e, "Failed to rebuild guild policy");
                None
            }
        }
    }
}

/// Loads, merges and serves guild policy.
#[derive(Debug)]
pub struct PolicyManager {
    config: PolicyConfig,
    residency: Arc<Residency>,
}

impl Default for PolicyManager {
    fn default() -> Self {
        Self::new(PolicyConfig::default())
    }
}

impl PolicyManager {
    #[must_use]
    pub fn new(config: PolicyConfig) -> Self {
        let residency = Residency {
            guilds: DashMap::new(),
            avcs: TtlCache::new(config.guild_cache.max_entries, config.guild_cache.ttl),
        };

        Self {
            residency: Arc::new(residency),
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// The guild snapshot, if snapshots are enabled and one loads.
    async fn read_snapshot(&self, guild_id: Uuid) -> Option<GuildSnapshot> {
        let path = self.config.guild_snapshot_path(guild_id)?;
        match read_guild_file(&path).await {
            Ok(snapshot) => Some(snapshot),
            Err(PolicyError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                debug!(%guild_id, "No policy snapshot for guild");
                None
            }
            Err(e) => {
                error!(%guild_id, error = %e, "Failed to load guild policy snapshot");
                None
            }
        }
    }

    /// Resident state of `guild_id`, restoring its snapshot on a miss.
    async fn restored(&self, guild_id: Uuid) -> Option<Arc<GuildState>> {
        if let Some(state) = self.residency.state(guild_id) {
            return Some(state);
        }

        let snapshot = self.read_snapshot(guild_id).await?;
        Some(self.residency.restore(guild_id, snapshot))
    }

    /// Resident state of `guild_id`, created empty when there is nothing
    /// to restore. Concurrent first touches share one state.
    async fn resident(&self, guild_id: Uuid) -> Arc<GuildState> {
        match self.restored(guild_id).await {
            Some(state) => state,
            None => Arc::clone(&self.residency.guilds.entry(guild_id).or_default()),
        }
    }

    /// Return the guild's current cache, restoring or rebuilding it if
    /// needed.
    ///
    /// On a miss the guild snapshot is tried first; an unreadable snapshot
    /// is logged. A guild with no policy at all reads as an empty cache and
    /// is not made resident.
    #[tracing::instrument(skip(self))]
    pub async fn cache_guild(&self, guild_id: Uuid) -> Arc<AccessVectorCache> {
        if let Some(avc) = self.residency.avcs.get(&guild_id) {
            return avc;
        }

        match self.restored(guild_id).await {
            Some(state) => self
                .residency
                .rebuild(guild_id, &state)
                .await
                .unwrap_or_default(),
            None => Arc::default(),
        }
    }

    /// Register `module` for `guild_id`, replacing a module of the same name.
    ///
    /// The guild's cache is unchanged until the next [`compile_all`].
    ///
    /// [`compile_all`]: PolicyManager::compile_all
    #[tracing::instrument(skip(self, module), fields(module = %module.policy_module.name))]
    pub async fn load_module(
        &self,
        guild_id: Uuid,
        module: CompiledModule,
    ) -> Result<(), PolicyError> {
        module.validate()?;

        let state = self.resident(guild_id).await;
        let previous = state
            .modules
            .write()
            .insert(module.policy_module.name.clone(), module);

        debug!(replaced = previous.is_some(), "Loaded policy module");
        Ok(())
    }

    /// Decode a module snapshot from `path` and register it.
    #[tracing::instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn load_module_from_file(
        &self,
        guild_id: Uuid,
        path: impl AsRef<Path>,
    ) -> Result<(), PolicyError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| PolicyError::io(path, e))?;

        let module =
            codec::decode_module(&bytes).map_err(|e| PolicyError::invalid_file(path, e))?;
        self.load_module(guild_id, module).await
    }

    /// Write `module` as a module snapshot at `path`.
    pub async fn store_module_file(
        &self,
        path: impl AsRef<Path>,
        module: &CompiledModule,
    ) -> Result<(), PolicyError> {
        let bytes = codec::encode_module(module)?;
        write_atomic(path.as_ref(), &bytes).await
    }

    pub async fn unload_module(&self, guild_id: Uuid, name: &str) -> Option<CompiledModule> {
        let state = self.restored(guild_id).await?;
        let removed = state.modules.write().shift_remove(name);
        if removed.is_some() {
            debug!(%guild_id, module = name, "Unloaded policy module");
        }
        removed
    }

    /// Loaded modules of `guild_id`, in load order.
    pub async fn loaded_modules(&self, guild_id: Uuid) -> IndexMap<String, CompiledModule> {
        self.restored(guild_id)
            .await
            .map(|state| state.modules.read().clone())
            .unwrap_or_default()
    }

    /// Cache of `guild_id` if it is resident. Never touches storage.
    ///
    /// An expired cache reads as `None` while it is rebuilt in the
    /// background.
    #[must_use]
    pub fn current_avc(&self, guild_id: Uuid) -> Option<Arc<AccessVectorCache>> {
        if let Some(avc) = self.residency.avcs.get(&guild_id) {
            return Some(avc);
        }

        let state = self.residency.state(guild_id)?;
        if state.merged.read().is_some() {
            self.schedule_rebuild(guild_id, state);
        }
        None
    }

    fn schedule_rebuild(&self, guild_id: Uuid, state: Arc<GuildState>) {
        if state.rebuild_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            state.rebuild_scheduled.store(false, Ordering::Release);
            debug!(%guild_id, "No runtime to rebuild expired guild policy on");
            return;
        };

        let residency = Arc::clone(&self.residency);
        runtime.spawn(async move {
            residency.rebuild(guild_id, &state).await;
            state.rebuild_scheduled.store(false, Ordering::Release);
        });
    }

    /// Rebuild the guild's cache from its loaded modules.
    ///
    /// The merge runs on a private copy; readers keep seeing the previous
    /// cache until the new one is complete. On error the previous cache
    /// stays in place. If the guild's state is replaced while merging, the
    /// merge is redone against the replacement.
    #[tracing::instrument(skip(self))]
    pub async fn compile_all(&self, guild_id: Uuid) -> Result<Arc<AccessVectorCache>, PolicyError> {
        loop {
            let state = self.resident(guild_id).await;
            let _guard = state.merge_lock.lock().await;

            let start = Instant::now();
            let modules = Arc::new(state.modules.read().clone());

            let avc = AccessVectorCache::build(modules.values())?;
            avc.validate()?;
            let avc = Arc::new(avc);

            *state.merged.write() = Some(Arc::clone(&modules));
            if !self.residency.publish(guild_id, &state, Arc::clone(&avc)) {
                debug!("Guild policy replaced during merge, merging again");
                continue;
            }

            info!(
                modules = modules.len(),
                types = avc.map_types.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Compiled guild policy"
            );
            return Ok(avc);
        }
    }

    /// Persist `guild_id` to the configured snapshot directory.
    ///
    /// Returns `false` when snapshots are disabled.
    pub async fn store_guild(&self, guild_id: Uuid) -> Result<bool, PolicyError> {
        let Some(path) = self.config.guild_snapshot_path(guild_id) else {
            return Ok(false);
        };

        self.store_avc(guild_id, path).await?;
        Ok(true)
    }

    /// Load `guild_id` from the configured snapshot directory.
    ///
    /// Returns `false` when snapshots are disabled.
    pub async fn load_guild(&self, guild_id: Uuid) -> Result<bool, PolicyError> {
        let Some(path) = self.config.guild_snapshot_path(guild_id) else {
            return Ok(false);
        };

        self.load_avc(guild_id, path).await?;
        Ok(true)
    }

    /// Write the guild's cache and modules to `path`.
    ///
    /// A guild that is not resident is written as an empty snapshot.
    #[tracing::instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn store_avc(&self, guild_id: Uuid, path: impl AsRef<Path>) -> Result<(), PolicyError> {
        let snapshot = match self.residency.state(guild_id) {
            Some(state) => {
                let avc = match self.residency.avcs.get(&guild_id) {
                    Some(avc) => Some(avc),
                    None => self.residency.rebuild(guild_id, &state).await,
                };
                GuildSnapshot {
                    avc: avc.map(|avc| AccessVectorCache::clone(&avc)).unwrap_or_default(),
                    modules: state.modules.read().clone(),
                }
            }
            None => GuildSnapshot::default(),
        };

        let bytes = codec::encode_guild(&snapshot)?;
        write_atomic(path.as_ref(), &bytes).await?;

        debug!(bytes = bytes.len(), modules = snapshot.modules.len(), "Stored guild policy snapshot");
        Ok(())
    }

    /// Replace the guild's resident state with the snapshot at `path`.
    ///
    /// Nothing is replaced unless the whole snapshot decodes and validates.
    #[tracing::instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn load_avc(&self, guild_id: Uuid, path: impl AsRef<Path>) -> Result<(), PolicyError> {
        let snapshot = read_guild_file(path.as_ref()).await?;

        debug!(modules = snapshot.modules.len(), "Loaded guild policy snapshot");
        let state = Arc::new(GuildState::restored(snapshot.modules));
        self.residency.replace(guild_id, state, Some(snapshot.avc));
        Ok(())
    }

    /// Replace the guild's resident state with an empty one, ignoring any
    /// snapshot on disk. Used before rebuilding a guild from sources.
    pub fn reset_guild(&self, guild_id: Uuid) {
        self.residency.replace(guild_id, Arc::default(), None);
    }

    /// Drop the guild's modules and cache. Snapshots on disk are kept.
    pub fn evict_guild(&self, guild_id: Uuid) {
        let state = self.residency.guilds.remove(&guild_id);
        let avc = self.residency.avcs.remove(&guild_id);
        if state.is_some() || avc.is_some() {
            debug!(%guild_id, "Evicted guild policy");
        }
    }

    /// Number of guilds with resident modules.
    #[must_use]
    pub fn resident_guilds(&self) -> usize {
        self.residency.guilds.len()
    }

    /// Wildcard allow bits of `subject`. Empty when the guild is not
    /// resident or the type is unknown.
    #[must_use]
    pub fn permissions_of<'a>(&self, guild_id: Uuid, subject: impl Into<TypeRef<'a>>) -> Permissions {
        let Some(avc) = self.current_avc(guild_id) else {
            debug!(%guild_id, "Permission lookup for a guild without resident policy");
            return Permissions::empty();
        };

        subject
            .into()
            .resolve(&avc)
            .map(|id| avc.allowed(id))
            .unwrap_or_default()
    }

    /// Allow bits of `subject` acting on `target`.
    #[must_use]
    pub fn permissions_of_with_target<'a, 'b>(
        &self,
        guild_id: Uuid,
        subject: impl Into<TypeRef<'a>>,
        target: impl Into<TypeRef<'b>>,
    ) -> Permissions {
        self.targeted(guild_id, subject.into(), target.into(), AccessVectorCache::allowed_on)
    }

    /// Deny bits recorded for `subject` acting on `target`.
    #[must_use]
    pub fn denied_permissions_of_with_target<'a, 'b>(
        &self,
        guild_id: Uuid,
        subject: impl Into<TypeRef<'a>>,
        target: impl Into<TypeRef<'b>>,
    ) -> Permissions {
        self.targeted(guild_id, subject.into(), target.into(), AccessVectorCache::denied_on)
    }

    fn targeted(
        &self,
        guild_id: Uuid,
        subject: TypeRef<'_>,
        target: TypeRef<'_>,
        lookup: fn(&AccessVectorCache, TypePair) -> Permissions,
    ) -> Permissions {
        let Some(avc) = self.current_avc(guild_id) else {
            debug!(%guild_id, "Permission lookup for a guild without resident policy");
            return Permissions::empty();
        };

        match (subject.resolve(&avc), target.resolve(&avc)) {
            (Some(subject), Some(target)) => lookup(&avc, TypePair::new(subject, target)),
            _ => Permissions::empty(),
        }
    }
}

async fn read_guild_file(path: &Path) -> Result<GuildSnapshot, PolicyError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| PolicyError::io(path, e))?;
    codec::decode_guild(&bytes).map_err(|e| PolicyError::invalid_file(path, e))
}

/// Write `bytes` to a sibling temp file, then rename it over `path`.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PolicyError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PolicyError::io(parent, e))?;
    }

    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| PolicyError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| PolicyError::io(path, e))
}
