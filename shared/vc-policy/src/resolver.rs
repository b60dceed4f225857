//! Policy-aware permission checks for guild members.
//!
//! A member's effective permissions are the bits it holds natively on the
//! platform AND-ed with the bits its security type is allowed by the guild
//! policy. Policy can narrow native grants, never extend them.
//!
//! Resolved policy masks are cached per `(guild, member)` and per
//! `(guild, member, target)`. Each entry remembers the guild cache it was
//! computed from and is only served while that cache is still the guild's
//! current one. An invalidation epoch keeps a lookup that raced an
//! invalidation from re-populating the cache with stale bits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use uuid::Uuid;

use crate::avc::{AccessVectorCache, TypePair};
use crate::cache::TtlCache;
use crate::context::{ContextResolver, EntityKind, EntityRef};
use crate::error::PolicyError;
use crate::manager::PolicyManager;
use crate::permissions::Permissions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CacheKey {
    Member {
        guild_id: Uuid,
        member_id: Uuid,
    },
    Target {
        guild_id: Uuid,
        member_id: Uuid,
        target: EntityRef,
    },
}

impl CacheKey {
    const fn guild_id(&self) -> Uuid {
        match self {
            Self::Member { guild_id, .. } | Self::Target { guild_id, .. } => *guild_id,
        }
    }

    fn involves(&self, entity: &EntityRef) -> bool {
        let (member_id, target) = match self {
            Self::Member { member_id, .. } => (*member_id, None),
            Self::Target {
                member_id, target, ..
            } => (*member_id, Some(target)),
        };

        (entity.kind == EntityKind::Member && entity.id == member_id)
            || target == Some(entity)
    }
}

#[derive(Clone)]
struct Resolved {
    source: Weak<AccessVectorCache>,
    bits: Permissions,
}

impl Resolved {
    fn is_from(&self, avc: &Arc<AccessVectorCache>) -> bool {
        std::ptr::eq(self.source.as_ptr(), Arc::as_ptr(avc))
    }
}

pub struct PermissionResolver {
    manager: Arc<PolicyManager>,
    contexts: Arc<dyn ContextResolver>,
    cache: TtlCache<CacheKey, Resolved>,
    /// Bumped by every invalidation.
    epoch: AtomicU64,
}

impl std::fmt::Debug for PermissionResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionResolver")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl PermissionResolver {
    /// Cache limits are taken from the manager's configuration.
    pub fn new(manager: Arc<PolicyManager>, contexts: Arc<dyn ContextResolver>) -> Self {
        let limits = manager.config().permission_cache;
        Self {
            cache: TtlCache::new(limits.max_entries, limits.ttl),
            epoch: AtomicU64::new(0),
            manager,
            contexts,
        }
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<PolicyManager> {
        &self.manager
    }

    /// Look `key` up, computing and caching it on a miss.
    ///
    /// A guild without resident policy resolves to nothing, and cached
    /// results computed from a replaced guild cache are recomputed.
    fn resolve(
        &self,
        key: CacheKey,
        compute: impl FnOnce(&AccessVectorCache) -> Permissions,
    ) -> Permissions {
        let Some(avc) = self.manager.current_avc(key.guild_id()) else {
            return Permissions::empty();
        };

        if let Some(resolved) = self.cache.get(&key).filter(|resolved| resolved.is_from(&avc)) {
            return resolved.bits;
        }

        let before = self.epoch.load(Ordering::Acquire);
        let bits = compute(&avc);

        if self.epoch.load(Ordering::Acquire) == before {
            self.cache.insert(
                key,
                Resolved {
                    source: Arc::downgrade(&avc),
                    bits,
                },
            );
        }

        tracing::trace!(?key, bits = bits.bits(), "Resolved policy permissions");
        bits
    }

    /// Wildcard policy permissions of `member_id`.
    pub fn policy_permissions(&self, guild_id: Uuid, member_id: Uuid) -> Permissions {
        let member = EntityRef::member(member_id);
        self.resolve(CacheKey::Member { guild_id, member_id }, |avc| {
            self.contexts
                .context_of(guild_id, &member)
                .map(|subject| avc.allowed(subject))
                .unwrap_or_default()
        })
    }

    /// Policy permissions of `member_id` acting on `target`.
    pub fn policy_permissions_on(
        &self,
        guild_id: Uuid,
        member_id: Uuid,
        target: &EntityRef,
    ) -> Permissions {
        let member = EntityRef::member(member_id);
        let key = CacheKey::Target {
            guild_id,
            member_id,
            target: *target,
        };

        self.resolve(key, |avc| {
            let subject = self.contexts.context_of(guild_id, &member);
            let target = self.contexts.context_of(guild_id, target);

            match (subject, target) {
                (Some(subject), Some(target)) => avc.allowed_on(TypePair::new(subject, target)),
                _ => Permissions::empty(),
            }
        })
    }

    /// `native` narrowed by the member's policy permissions.
    pub fn effective_permissions(
        &self,
        guild_id: Uuid,
        member_id: Uuid,
        native: Permissions,
    ) -> Permissions {
        native & self.policy_permissions(guild_id, member_id)
    }

    pub fn effective_permissions_on(
        &self,
        guild_id: Uuid,
        member_id: Uuid,
        target: &EntityRef,
        native: Permissions,
    ) -> Permissions {
        native & self.policy_permissions_on(guild_id, member_id, target)
    }

    /// Whether the member effectively holds every bit of `required`.
    ///
    /// An empty requirement is always satisfied.
    pub fn has_permissions(
        &self,
        guild_id: Uuid,
        member_id: Uuid,
        native: Permissions,
        required: Permissions,
    ) -> bool {
        required.is_empty()
            || self
                .effective_permissions(guild_id, member_id, native)
                .has(required)
    }

    pub fn has_permissions_on(
        &self,
        guild_id: Uuid,
        member_id: Uuid,
        target: &EntityRef,
        native: Permissions,
        required: Permissions,
    ) -> bool {
        required.is_empty()
            || self
                .effective_permissions_on(guild_id, member_id, target, native)
                .has(required)
    }

    /// Forget every cached result for `guild_id`.
    pub fn invalidate_guild(&self, guild_id: Uuid) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.cache.retain(|key, _| key.guild_id() != guild_id);
    }

    /// Forget cached results in which `entity` is the subject or the target.
    /// Call after relabelling it.
    pub fn invalidate_entity(&self, guild_id: Uuid, entity: &EntityRef) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.cache
            .retain(|key, _| key.guild_id() != guild_id || !key.involves(entity));
    }

    pub fn invalidate_member(&self, guild_id: Uuid, member_id: Uuid) {
        self.invalidate_entity(guild_id, &EntityRef::member(member_id));
    }

    /// Re-merge the guild's policy and drop its cached results.
    #[tracing::instrument(skip(self))]
    pub async fn reload_guild(&self, guild_id: Uuid) -> Result<Arc<AccessVectorCache>, PolicyError> {
        let avc = self.manager.compile_all(guild_id).await?;
        self.invalidate_guild(guild_id);
        Ok(avc)
    }
}
