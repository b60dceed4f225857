//! Compiled policy modules.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::PolicyError;
use crate::permissions::Permissions;

/// Dense, zero-based security type identifier.
pub type TypeId = u32;

/// `subject -> target -> permissions`
pub type TargetTable = IndexMap<TypeId, IndexMap<TypeId, Permissions>>;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModuleDetails {
    pub name: String,
    pub author: Option<String>,
    pub version: u32,
}

/// Output of compiling one policy source file. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompiledModule {
    pub policy_module: ModuleDetails,
    /// Type id -> type name, in first-`require` order.
    pub map_types: Vec<String>,
    /// Wildcard allow bits indexed by type id.
    pub allow_types: Vec<Permissions>,
    /// Wildcard deny bits indexed by type id.
    pub deny_types: Vec<Permissions>,
    pub allow_types_on_targets: TargetTable,
    pub deny_types_on_targets: TargetTable,
}

impl CompiledModule {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.policy_module.name
    }

    #[must_use]
    pub fn type_id(&self, name: &str) -> Option<TypeId> {
        self.map_types
            .iter()
            .position(|candidate| candidate == name)
            .map(|index| index as TypeId)
    }

    /// Wildcard allow bits for `type_id`; missing entries are empty.
    #[must_use]
    pub fn allow_of(&self, type_id: TypeId) -> Permissions {
        self.allow_types
            .get(type_id as usize)
            .copied()
            .unwrap_or_default()
    }

    /// Wildcard deny bits for `type_id`; missing entries are empty.
    #[must_use]
    pub fn deny_of(&self, type_id: TypeId) -> Permissions {
        self.deny_types
            .get(type_id as usize)
            .copied()
            .unwrap_or_default()
    }

    /// Check the structural invariants every consumer relies on.
    ///
    /// Applied to decoded snapshots and freshly compiled modules alike.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let name = &self.policy_module.name;
        if name.is_empty() {
            return Err(PolicyError::Validation(
                "module name must not be empty".into(),
            ));
        }

        let type_count = self.map_types.len();
        let mut seen = HashSet::with_capacity(type_count);
        for type_name in &self.map_types {
            if type_name.is_empty() {
                return Err(PolicyError::Validation(format!(
                    "module {name}: empty type name"
                )));
            }
            if !seen.insert(type_name.as_str()) {
                return Err(PolicyError::Validation(format!(
                    "module {name}: type '{type_name}' is declared twice"
                )));
            }
        }

        if self.allow_types.len() > type_count || self.deny_types.len() > type_count {
            return Err(PolicyError::Validation(format!(
                "module {name}: wildcard tables reference {} types but only {type_count} are declared",
                self.allow_types.len().max(self.deny_types.len())
            )));
        }

        for (label, table) in [
            ("allow_types_on_targets", &self.allow_types_on_targets),
            ("deny_types_on_targets", &self.deny_types_on_targets),
        ] {
            for (subject, targets) in table {
                let out_of_range = std::iter::once(subject)
                    .chain(targets.keys())
                    .find(|id| **id as usize >= type_count);

                if let Some(id) = out_of_range {
                    return Err(PolicyError::Validation(format!(
                        "module {name}: {label} references undeclared type id {id}"
                    )));
                }
            }
        }

        Ok(())
    }
}
