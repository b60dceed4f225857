//! Mapping of guild entities onto security types.
//!
//! Classifying an entity is the host's concern; the resolver only asks a
//! [`ContextResolver`] for the result.

use std::fmt;

use dashmap::DashMap;
use uuid::Uuid;

use crate::module::TypeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Member,
    Role,
    Channel,
}

impl EntityKind {
    /// Single-letter tag used in cache keys and logs.
    #[must_use]
    pub const fn prefix(self) -> char {
        match self {
            Self::Member => 'm',
            Self::Role => 'r',
            Self::Channel => 'c',
        }
    }
}

/// A guild entity that can carry a security type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: Uuid,
}

impl EntityRef {
    #[must_use]
    pub const fn member(id: Uuid) -> Self {
        Self {
            kind: EntityKind::Member,
            id,
        }
    }

    #[must_use]
    pub const fn role(id: Uuid) -> Self {
        Self {
            kind: EntityKind::Role,
            id,
        }
    }

    #[must_use]
    pub const fn channel(id: Uuid) -> Self {
        Self {
            kind: EntityKind::Channel,
            id,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.prefix(), self.id)
    }
}

/// Resolves the security type of an entity within a guild.
///
/// Called on the permission-check path, so implementations must answer
/// from memory.
pub trait ContextResolver: Send + Sync {
    /// `None` when the entity has no type; such entities get no policy
    /// permissions.
    fn context_of(&self, guild_id: Uuid, entity: &EntityRef) -> Option<TypeId>;
}

/// In-memory assignment table.
#[derive(Debug, Default)]
pub struct StaticContextResolver {
    assignments: DashMap<(Uuid, EntityRef), TypeId>,
    defaults: DashMap<Uuid, TypeId>,
}

impl StaticContextResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Label `entity` with `type_id`, replacing any previous label.
    pub fn assign(&self, guild_id: Uuid, entity: EntityRef, type_id: TypeId) {
        self.assignments.insert((guild_id, entity), type_id);
    }

    pub fn unassign(&self, guild_id: Uuid, entity: &EntityRef) -> Option<TypeId> {
        self.assignments
            .remove(&(guild_id, *entity))
            .map(|(_, type_id)| type_id)
    }

    /// Type given to unlabeled entities of `guild_id`.
    pub fn set_default(&self, guild_id: Uuid, type_id: TypeId) {
        self.defaults.insert(guild_id, type_id);
    }

    /// Drop every label and the default of `guild_id`.
    pub fn clear_guild(&self, guild_id: Uuid) {
        self.assignments.retain(|(guild, _), _| *guild != guild_id);
        self.defaults.remove(&guild_id);
    }
}

impl ContextResolver for StaticContextResolver {
    fn context_of(&self, guild_id: Uuid, entity: &EntityRef) -> Option<TypeId> {
        self.assignments
            .get(&(guild_id, *entity))
            .map(|type_id| *type_id)
            .or_else(|| self.defaults.get(&guild_id).map(|type_id| *type_id))
    }
}
