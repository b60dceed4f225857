//! Access vector cache: the merged permission tables of one guild.

use std::time::Instant;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PolicyError;
use crate::module::{CompiledModule, TypeId};
use crate::permissions::Permissions;
use crate::POLICY_VERSION;

/// `(subject, target)` key of the targeted tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypePair {
    pub subject: TypeId,
    pub target: TypeId,
}

impl TypePair {
    #[must_use]
    pub const fn new(subject: TypeId, target: TypeId) -> Self {
        Self { subject, target }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvcDetails {
    pub version: u32,
}

impl Default for AvcDetails {
    fn default() -> Self {
        Self {
            version: POLICY_VERSION,
        }
    }
}

/// Merged, queryable permission tables for one guild.
///
/// Only ever produced by [`AccessVectorCache::build`] (or decoded from a
/// snapshot of one). All lookups are O(1) and return empty permissions for
/// anything unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessVectorCache {
    pub details: AvcDetails,
    pub map_types: IndexMap<TypeId, String>,
    pub map_type_ids: IndexMap<String, TypeId>,
    pub allow_types: IndexMap<TypeId, Permissions>,
    pub deny_types: IndexMap<TypeId, Permissions>,
    pub allow_types_on_targets: IndexMap<TypePair, Permissions>,
    pub deny_types_on_targets: IndexMap<TypePair, Permissions>,
}

impl AccessVectorCache {
    /// Merge `modules`, in order, into a fresh cache.
    ///
    /// Within a module, types are merged in ascending id order. Deny bits
    /// accumulate across modules and mask allow bits at every step, so a
    /// later module's deny also removes an earlier module's allow.
    pub fn build<'a>(
        modules: impl IntoIterator<Item = &'a CompiledModule>,
    ) -> Result<Self, PolicyError> {
        let start = Instant::now();
        let mut avc = Self::default();
        // type id -> module that introduced it
        let mut owners: IndexMap<TypeId, &str> = IndexMap::new();
        let mut module_count = 0usize;

        for module in modules {
            module_count += 1;
            avc.merge_module(module, &mut owners)?;
        }

        debug!(
            modules = module_count,
            types = avc.map_types.len(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "Merged access vector cache"
        );
        Ok(avc)
    }

    fn merge_module<'a>(
        &mut self,
        module: &'a CompiledModule,
        owners: &mut IndexMap<TypeId, &'a str>,
    ) -> Result<(), PolicyError> {
        let module_name = module.name();

        for (index, name) in module.map_types.iter().enumerate() {
            let id = index as TypeId;

            let existing_name = self.map_types.get(&id).filter(|existing| *existing != name);
            let existing_id = self.map_type_ids.get(name).filter(|existing| **existing != id);

            let conflict = match (existing_name, existing_id) {
                (Some(existing), _) => Some((id, existing.clone())),
                (None, Some(&other)) => Some((other, name.clone())),
                (None, None) => None,
            };

            if let Some((conflict_id, existing)) = conflict {
                return Err(PolicyError::ConflictingType {
                    module: module_name.to_string(),
                    existing_module: owners
                        .get(&conflict_id)
                        .map(|owner| (*owner).to_string())
                        .unwrap_or_default(),
                    existing,
                    new: name.clone(),
                    type_id: conflict_id,
                });
            }

            self.map_types.insert(id, name.clone());
            self.map_type_ids.insert(name.clone(), id);
            owners.entry(id).or_insert(module_name);

            let deny = self.deny_types.entry(id).or_default();
            *deny |= module.deny_of(id);
            let deny = *deny;

            let allow = self.allow_types.entry(id).or_default();
            *allow = allow.grant_masked(module.allow_of(id), deny);
        }

        for (&subject, targets) in &module.deny_types_on_targets {
            let wildcard_deny = self.deny_of(subject);
            for (&target, &bits) in targets {
                *self
                    .deny_types_on_targets
                    .entry(TypePair::new(subject, target))
                    .or_default() |= bits | wildcard_deny;
            }
        }

        for (&subject, targets) in &module.allow_types_on_targets {
            let wildcard_allow = self.allowed(subject);
            let wildcard_deny = self.deny_of(subject);
            for (&target, &bits) in targets {
                let pair = TypePair::new(subject, target);
                let targeted_deny = self.denied_on(pair);
                let allow = self.allow_types_on_targets.entry(pair).or_default();
                *allow = allow.grant_masked(bits | wildcard_allow, targeted_deny | wildcard_deny);
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn type_id(&self, name: &str) -> Option<TypeId> {
        self.map_type_ids.get(name).copied()
    }

    #[must_use]
    pub fn type_name(&self, id: TypeId) -> Option<&str> {
        self.map_types.get(&id).map(String::as_str)
    }

    /// Wildcard allow bits of `subject`.
    #[must_use]
    pub fn allowed(&self, subject: TypeId) -> Permissions {
        self.allow_types.get(&subject).copied().unwrap_or_default()
    }

    /// Wildcard deny bits of `subject`.
    #[must_use]
    pub fn deny_of(&self, subject: TypeId) -> Permissions {
        self.deny_types.get(&subject).copied().unwrap_or_default()
    }

    /// Targeted allow bits of `pair`, with every deny known for it removed.
    #[must_use]
    pub fn allowed_on(&self, pair: TypePair) -> Permissions {
        let allow = self
            .allow_types_on_targets
            .get(&pair)
            .copied()
            .unwrap_or_default();
        allow - (self.denied_on(pair) | self.deny_of(pair.subject))
    }

    /// Targeted deny bits of `pair`.
    #[must_use]
    pub fn denied_on(&self, pair: TypePair) -> Permissions {
        self.deny_types_on_targets
            .get(&pair)
            .copied()
            .unwrap_or_default()
    }

    /// Check the structural invariants of a decoded cache.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.details.version > POLICY_VERSION {
            return Err(PolicyError::UnsupportedVersion {
                found: self.details.version,
                supported: POLICY_VERSION,
            });
        }

        if self.map_types.len() != self.map_type_ids.len() {
            return Err(PolicyError::Validation(format!(
                "type index has {} names but {} ids",
                self.map_types.len(),
                self.map_type_ids.len()
            )));
        }

        for (id, name) in &self.map_types {
            if self.map_type_ids.get(name) != Some(id) {
                return Err(PolicyError::Validation(format!(
                    "type '{name}' [@{id}] is missing from the reverse index"
                )));
            }
        }

        for (label, table) in [
            ("allow_types", &self.allow_types),
            ("deny_types", &self.deny_types),
        ] {
            if let Some(id) = table.keys().find(|id| !self.map_types.contains_key(*id)) {
                return Err(PolicyError::Validation(format!(
                    "{label} references unknown type id {id}"
                )));
            }
        }

        for (label, table) in [
            ("allow_types_on_targets", &self.allow_types_on_targets),
            ("deny_types_on_targets", &self.deny_types_on_targets),
        ] {
            let unknown = table.keys().find(|pair| {
                !self.map_types.contains_key(&pair.subject)
                    || !self.map_types.contains_key(&pair.target)
            });

            if let Some(pair) = unknown {
                return Err(PolicyError::Validation(format!(
                    "{label} references unknown type pair ({}, {})",
                    pair.subject, pair.target
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::PolicyCompiler;

    fn compile(source: &str) -> CompiledModule {
        PolicyCompiler::default()
            .compile(source, "test.policy")
            .expect("module should compile")
    }

    fn id(avc: &AccessVectorCache, name: &str) -> TypeId {
        avc.type_id(name).expect("type should be known")
    }

    #[test]
    fn test_merge_two_modules() {
        let first = compile(
            "module { name \"first\" } require { type user_t; type moderator_t; } \
             allow moderator_t user_t { BanMembers, KickMembers }",
        );
        let second = compile(
            "module { name \"second\" } require { type user_t; type moderator_t; } \
             allow moderator_t user_t { ModerateMembers }",
        );

        let avc = AccessVectorCache::build([&first, &second]).expect("modules should merge");
        let pair = TypePair::new(id(&avc, "moderator_t"), id(&avc, "user_t"));

        assert_eq!(
            avc.allowed_on(pair),
            Permissions::BAN_MEMBERS | Permissions::KICK_MEMBERS | Permissions::MODERATE_MEMBERS
        );
        assert_eq!(avc.allowed(id(&avc, "moderator_t")), Permissions::empty());
    }

    #[test]
    fn test_deny_wins_regardless_of_load_order() {
        let allow = compile("module { name \"a\" } require { type s; } allow s * { SendMessages, Speak }");
        let deny = compile("module { name \"b\" } require { type s; } deny s * { SendMessages }");

        for modules in [[&allow, &deny], [&deny, &allow]] {
            let avc = AccessVectorCache::build(modules).expect("modules should merge");
            assert_eq!(avc.allowed(0), Permissions::SPEAK);
            assert_eq!(avc.deny_of(0), Permissions::SEND_MESSAGES);
        }
    }

    #[test]
    fn test_deny_in_same_module_masks_allow() {
        let module = compile("module { name \"m\" } require { type s; } allow s * { BanMembers } deny s * { BanMembers }");
        let avc = AccessVectorCache::build([&module]).expect("module should merge");
        assert!(!avc.allowed(0).has(Permissions::BAN_MEMBERS));
    }

    #[test]
    fn test_wildcard_allow_propagates_to_targets() {
        let module = compile(
            "module { name \"m\" } require { type a; type b; } \
             allow a * { SendMessages } allow a b { KickMembers }",
        );
        let avc = AccessVectorCache::build([&module]).expect("module should merge");

        assert_eq!(
            avc.allowed_on(TypePair::new(0, 1)),
            Permissions::SEND_MESSAGES | Permissions::KICK_MEMBERS
        );
    }

    #[test]
    fn test_targeted_deny_wins_over_targeted_allow() {
        let module = compile(
            "module { name \"m\" } require { type a; type b; } \
             deny a * { MuteMembers } deny a b { KickMembers } allow a b { KickMembers, BanMembers, MuteMembers }",
        );
        let avc = AccessVectorCache::build([&module]).expect("module should merge");
        let pair = TypePair::new(0, 1);

        assert_eq!(avc.allowed_on(pair), Permissions::BAN_MEMBERS);
        assert_eq!(
            avc.denied_on(pair),
            Permissions::KICK_MEMBERS | Permissions::MUTE_MEMBERS
        );
    }

    #[test]
    fn test_later_deny_masks_earlier_targeted_allow() {
        let allow = compile("module { name \"a\" } require { type x; type y; } allow x y { BanMembers }");
        let deny = compile("module { name \"b\" } require { type x; type y; } deny x y { BanMembers }");

        let avc = AccessVectorCache::build([&allow, &deny]).expect("modules should merge");
        assert_eq!(avc.allowed_on(TypePair::new(0, 1)), Permissions::empty());
    }

    #[test]
    fn test_reference_scenario_targeted_deny() {
        let module = compile(
            "module { name \"m\"; version 1; } require { type a; type b; } \
             allow a * { Administrator } deny b a { BanMembers }",
        );
        let avc = AccessVectorCache::build([&module]).expect("module should merge");
        let (a, b) = (id(&avc, "a"), id(&avc, "b"));

        assert!(avc.allowed(a).has(Permissions::ADMINISTRATOR));
        assert!(avc.denied_on(TypePair::new(b, a)).has(Permissions::BAN_MEMBERS));
        assert!(!avc.allowed_on(TypePair::new(b, a)).has(Permissions::BAN_MEMBERS));
    }

    #[test]
    fn test_conflicting_type_id() {
        let first = compile("module { name \"first\" } require { type user_t; }");
        let second = compile("module { name \"second\" } require { type admin_t; }");

        let error = AccessVectorCache::build([&first, &second]).unwrap_err();
        match error {
            PolicyError::ConflictingType {
                module,
                existing_module,
                existing,
                new,
                type_id,
            } => {
                assert_eq!(module, "second");
                assert_eq!(existing_module, "first");
                assert_eq!(existing, "user_t");
                assert_eq!(new, "admin_t");
                assert_eq!(type_id, 0);
            }
            other => panic!("expected conflicting type error, got {other:?}"),
        }
    }

    #[test]
    fn test_conflicting_type_name() {
        let first = compile("module { name \"first\" } require { type a; type b; }");
        let second = compile("module { name \"second\" } require { type b; }");

        let error = AccessVectorCache::build([&first, &second]).unwrap_err();
        assert!(error.to_string().contains("policy module second"));
        assert!(error.to_string().contains("from first"));
    }

    #[test]
    fn test_shared_prefix_is_not_a_conflict() {
        let base = compile("module { name \"base\" } require { type user_t; type mod_t; }");
        let extra = compile("module { name \"extra\" } require { type user_t; type mod_t; type bot_t; } allow bot_t * { Speak }");

        let avc = AccessVectorCache::build([&base, &extra]).expect("modules should merge");
        assert_eq!(avc.type_id("bot_t"), Some(2));
        assert_eq!(avc.type_name(1), Some("mod_t"));
        assert!(avc.validate().is_ok());
    }

    #[test]
    fn test_unknown_lookups_are_empty() {
        let avc = AccessVectorCache::default();
        assert_eq!(avc.type_id("nobody"), None);
        assert_eq!(avc.allowed(3), Permissions::empty());
        assert_eq!(avc.allowed_on(TypePair::new(3, 4)), Permissions::empty());
    }

    #[test]
    fn test_validate_rejects_broken_index() {
        let mut avc = AccessVectorCache::default();
        avc.map_types.insert(0, "a".into());
        avc.map_type_ids.insert("b".into(), 0);
        assert!(matches!(avc.validate(), Err(PolicyError::Validation(_))));

        let mut avc = AccessVectorCache::default();
        avc.allow_types_on_targets
            .insert(TypePair::new(0, 1), Permissions::SPEAK);
        assert!(avc.validate().is_err());
    }
}
