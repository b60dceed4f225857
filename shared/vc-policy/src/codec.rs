//! Binary snapshots of compiled modules and guild caches.
//!
//! Every snapshot is a `bincode` header followed by the body:
//!
//! ```text
//! [kind: u32][format version: u32][body ...]
//! ```
//!
//! Bodies are validated after decoding; a snapshot that decodes but does
//! not hold together is rejected like a corrupt one.

use std::io::Cursor;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::avc::AccessVectorCache;
use crate::error::PolicyError;
use crate::module::CompiledModule;
use crate::POLICY_VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum SnapshotKind {
    Module,
    Guild,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    kind: SnapshotKind,
    version: u32,
}

/// Persisted state of one guild: the merged cache plus the raw modules it
/// was built from, keyed by module name in load order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildSnapshot {
    pub avc: AccessVectorCache,
    pub modules: IndexMap<String, CompiledModule>,
}

impl GuildSnapshot {
    pub fn validate(&self) -> Result<(), PolicyError> {
        self.avc.validate()?;

        for (name, module) in &self.modules {
            module.validate()?;
            if name != module.name() {
                return Err(PolicyError::Validation(format!(
                    "module stored as '{name}' is named '{}'",
                    module.name()
                )));
            }
        }

        Ok(())
    }
}

pub fn encode_module(module: &CompiledModule) -> Result<Vec<u8>, PolicyError> {
    encode(SnapshotKind::Module, module)
}

pub fn decode_module(bytes: &[u8]) -> Result<CompiledModule, PolicyError> {
    let module: CompiledModule = decode(SnapshotKind::Module, bytes)?;
    module.validate()?;
    Ok(module)
}

pub fn encode_guild(snapshot: &GuildSnapshot) -> Result<Vec<u8>, PolicyError> {
    encode(SnapshotKind::Guild, snapshot)
}

pub fn decode_guild(bytes: &[u8]) -> Result<GuildSnapshot, PolicyError> {
    let snapshot: GuildSnapshot = decode(SnapshotKind::Guild, bytes)?;
    snapshot.validate()?;
    Ok(snapshot)
}

fn encode<T: Serialize>(kind: SnapshotKind, body: &T) -> Result<Vec<u8>, PolicyError> {
    let mut bytes = bincode::serialize(&Header {
        kind,
        version: POLICY_VERSION,
    })?;
    bincode::serialize_into(&mut bytes, body)?;
    Ok(bytes)
}

fn decode<T: DeserializeOwned>(kind: SnapshotKind, bytes: &[u8]) -> Result<T, PolicyError> {
    let mut cursor = Cursor::new(bytes);
    let header: Header = bincode::deserialize_from(&mut cursor)?;

    if header.kind != kind {
        return Err(PolicyError::Validation(format!(
            "expected a {kind:?} snapshot, found {:?}",
            header.kind
        )));
    }
    if header.version > POLICY_VERSION {
        return Err(PolicyError::UnsupportedVersion {
            found: header.version,
            supported: POLICY_VERSION,
        });
    }

    let body = bincode::deserialize_from(&mut cursor)?;

    let remaining = bytes.len() as u64 - cursor.position();
    if remaining != 0 {
        return Err(PolicyError::Validation(format!(
            "{remaining} trailing bytes after snapshot body"
        )));
    }

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avc::TypePair;
    use crate::compiler::PolicyCompiler;
    use crate::permissions::Permissions;

    fn module() -> CompiledModule {
        PolicyCompiler::default()
            .compile(
                "module { name \"base\"; author \"ops\"; version 4 } \
                 require { type user_t; type mod_t; type bot_t; } \
                 allow mod_t bot_t { UseExternalApps } allow mod_t user_t { BanMembers } \
                 deny user_t * { SendPolls } deny bot_t mod_t { Speak }",
                "base.policy",
            )
            .expect("module should compile")
    }

    #[test]
    fn test_module_round_trip_keeps_wide_masks_and_order() {
        let module = module();
        let decoded = decode_module(&encode_module(&module).expect("encode")).expect("decode");

        assert_eq!(decoded, module);
        assert_eq!(decoded.deny_types[0], Permissions::SEND_POLLS);
        let targets: Vec<_> = decoded.allow_types_on_targets[&1].keys().copied().collect();
        assert_eq!(targets, vec![2, 0]);
    }

    #[test]
    fn test_masks_wider_than_53_bits_survive() {
        let mut module = module();
        module.allow_types[2] = Permissions::from_bits_retain(u128::MAX);

        let decoded = decode_module(&encode_module(&module).expect("encode")).expect("decode");
        assert_eq!(decoded.allow_types[2].bits(), u128::MAX);
    }

    #[test]
    fn test_guild_round_trip() {
        let module = module();
        let avc = AccessVectorCache::build([&module]).expect("module should merge");
        let snapshot = GuildSnapshot {
            avc,
            modules: IndexMap::from([(module.name().to_string(), module)]),
        };

        let decoded = decode_guild(&encode_guild(&snapshot).expect("encode")).expect("decode");
        assert_eq!(decoded, snapshot);
        assert_eq!(
            decoded.avc.allowed_on(TypePair::new(1, 0)),
            Permissions::BAN_MEMBERS
        );
    }

    #[test]
    fn test_future_version_is_rejected() {
        let mut bytes = encode_module(&module()).expect("encode");
        bytes[4..8].copy_from_slice(&(POLICY_VERSION + 1).to_le_bytes());

        assert!(matches!(
            decode_module(&bytes),
            Err(PolicyError::UnsupportedVersion { found, supported })
                if found == POLICY_VERSION + 1 && supported == POLICY_VERSION
        ));
    }

    #[test]
    fn test_wrong_kind_is_rejected() {
        let bytes = encode_module(&module()).expect("encode");
        assert!(matches!(decode_guild(&bytes), Err(PolicyError::Validation(_))));
    }

    #[test]
    fn test_corrupt_bytes_are_rejected() {
        let bytes = encode_module(&module()).expect("encode");

        assert!(matches!(decode_module(&bytes[..bytes.len() / 2]), Err(PolicyError::Decode(_))));
        assert!(matches!(decode_module(&[0xff; 3]), Err(PolicyError::Decode(_))));

        let mut trailing = bytes;
        trailing.push(0);
        assert!(matches!(decode_module(&trailing), Err(PolicyError::Validation(_))));
    }

    #[test]
    fn test_structurally_invalid_module_is_rejected() {
        let mut module = module();
        module
            .allow_types_on_targets
            .entry(0)
            .or_default()
            .insert(99, Permissions::SPEAK);

        let bytes = encode_module(&module).expect("encode");
        assert!(matches!(decode_module(&bytes), Err(PolicyError::Validation(_))));
    }

    #[test]
    fn test_guild_snapshot_key_must_match_module_name() {
        let module = module();
        let snapshot = GuildSnapshot {
            avc: AccessVectorCache::default(),
            modules: IndexMap::from([("renamed".to_string(), module)]),
        };

        let bytes = encode_guild(&snapshot).expect("encode");
        let error = decode_guild(&bytes).unwrap_err();
        assert!(error.to_string().contains("renamed"));
    }
}
