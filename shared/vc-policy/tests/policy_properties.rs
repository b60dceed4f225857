//! Property-based tests for the policy pipeline.
//!
//! ## Properties Verified
//!
//! - Compiling the same source twice yields byte-identical modules
//! - Module and guild snapshots decode to the value that was encoded,
//!   masks wider than 53 bits and target key order included
//! - Deny bits from any module never survive the merge, whatever the load
//!   order, and wildcard grants do not depend on load order
//!
//! Run with: `cargo test -p vc-policy --test policy_properties`

use std::fmt::Write;

use indexmap::IndexMap;
use proptest::prelude::*;
use vc_policy::avc::{AccessVectorCache, TypePair};
use vc_policy::codec::{self, GuildSnapshot};
use vc_policy::module::{ModuleDetails, TargetTable, TypeId};
use vc_policy::{CompiledModule, PermissionRegistry, Permissions, PlatformRegistry, PolicyCompiler};

const TYPES: [&str; 4] = ["unlabeled_t", "member_t", "moderator_t", "channel_t"];

#[derive(Debug, Clone)]
struct Rule {
    allow: bool,
    subject: usize,
    target: Option<usize>,
    permissions: Vec<(&'static str, Permissions)>,
}

fn arb_rule() -> impl Strategy<Value = Rule> {
    (
        any::<bool>(),
        0..TYPES.len(),
        prop::option::of(0..TYPES.len()),
        prop::sample::subsequence(PlatformRegistry.names(), 1..=4),
    )
        .prop_map(|(allow, subject, target, permissions)| Rule {
            allow,
            subject,
            target,
            permissions,
        })
}

fn arb_rules() -> impl Strategy<Value = Vec<Rule>> {
    prop::collection::vec(arb_rule(), 0..12)
}

fn render(name: &str, rules: &[Rule]) -> String {
    let mut source = format!("module {{ name \"{name}\"; version 1; }}\nrequire {{");
    for type_name in TYPES {
        let _ = write!(source, " type {type_name};");
    }
    source.push_str(" }\n");

    for rule in rules {
        let names: Vec<&str> = rule.permissions.iter().map(|(name, _)| *name).collect();
        let _ = writeln!(
            source,
            "{} {} {} {{ {} }}",
            if rule.allow { "allow" } else { "deny" },
            TYPES[rule.subject],
            rule.target.map_or("*", |target| TYPES[target]),
            names.join(", ")
        );
    }
    source
}

fn compile(name: &str, rules: &[Rule]) -> CompiledModule {
    PolicyCompiler::default()
        .compile(&render(name, rules), &format!("{name}.policy"))
        .expect("generated policy should compile")
}

fn arb_mask() -> impl Strategy<Value = Permissions> {
    any::<u128>().prop_map(Permissions::from_bits_retain)
}

fn table(entries: Vec<(TypeId, TypeId, Permissions)>) -> TargetTable {
    let mut table = TargetTable::new();
    for (subject, target, bits) in entries {
        table.entry(subject).or_default().insert(target, bits);
    }
    table
}

/// Structurally valid modules with arbitrary 128-bit masks.
fn arb_module() -> impl Strategy<Value = CompiledModule> {
    (1usize..6)
        .prop_flat_map(|types| {
            let ids = || 0..types as TypeId;
            let entries = || prop::collection::vec((ids(), ids(), arb_mask()), 0..10);
            (
                "[a-z]{1,8}",
                Just(types),
                prop::collection::vec(arb_mask(), 0..=types),
                prop::collection::vec(arb_mask(), 0..=types),
                entries(),
                entries(),
            )
        })
        .prop_map(|(name, types, allow, deny, allow_on, deny_on)| CompiledModule {
            policy_module: ModuleDetails {
                name,
                author: None,
                version: 1,
            },
            map_types: (0..types).map(|i| format!("type{i}_t")).collect(),
            allow_types: allow,
            deny_types: deny,
            allow_types_on_targets: table(allow_on),
            deny_types_on_targets: table(deny_on),
        })
}

fn key_order(table: &TargetTable) -> Vec<(TypeId, Vec<TypeId>)> {
    table
        .iter()
        .map(|(subject, targets)| (*subject, targets.keys().copied().collect()))
        .collect()
}

fn targeted_deny(module: &CompiledModule, pair: TypePair) -> Permissions {
    module
        .deny_types_on_targets
        .get(&pair.subject)
        .and_then(|targets| targets.get(&pair.target))
        .copied()
        .unwrap_or_default()
}

proptest! {
    /// Property: compilation is deterministic
    #[test]
    fn prop_compile_is_deterministic(rules in arb_rules()) {
        let first = compile("generated", &rules);
        let second = compile("generated", &rules);

        prop_assert_eq!(&first, &second);
        prop_assert_eq!(
            codec::encode_module(&first).expect("encode"),
            codec::encode_module(&second).expect("encode")
        );
    }

    /// Property: module snapshots round-trip exactly
    #[test]
    fn prop_module_snapshot_round_trips(module in arb_module()) {
        let bytes = codec::encode_module(&module).expect("encode");
        let decoded = codec::decode_module(&bytes).expect("decode");

        prop_assert_eq!(&decoded, &module);
        prop_assert_eq!(
            key_order(&decoded.allow_types_on_targets),
            key_order(&module.allow_types_on_targets)
        );
        prop_assert_eq!(
            key_order(&decoded.deny_types_on_targets),
            key_order(&module.deny_types_on_targets)
        );
    }

    /// Property: guild snapshots round-trip exactly
    #[test]
    fn prop_guild_snapshot_round_trips(module in arb_module()) {
        let avc = AccessVectorCache::build([&module]).expect("single module merges");
        let mut modules = IndexMap::new();
        modules.insert(module.name().to_string(), module);
        let snapshot = GuildSnapshot { avc, modules };

        let bytes = codec::encode_guild(&snapshot).expect("encode");
        let decoded = codec::decode_guild(&bytes).expect("decode");

        prop_assert_eq!(&decoded, &snapshot);
        prop_assert_eq!(
            decoded.avc.map_types.keys().collect::<Vec<_>>(),
            snapshot.avc.map_types.keys().collect::<Vec<_>>()
        );
    }

    /// Property: deny wins in either load order
    #[test]
    fn prop_deny_wins_in_any_load_order(a in arb_rules(), b in arb_rules()) {
        let a = compile("a", &a);
        let b = compile("b", &b);
        let forward = AccessVectorCache::build([&a, &b]).expect("modules merge");
        let backward = AccessVectorCache::build([&b, &a]).expect("modules merge");

        for subject in 0..TYPES.len() as TypeId {
            let denied = a.deny_of(subject) | b.deny_of(subject);
            prop_assert_eq!(forward.allowed(subject), backward.allowed(subject));
            prop_assert_eq!(
                forward.allowed(subject),
                (a.allow_of(subject) | b.allow_of(subject)) - denied
            );

            for target in 0..TYPES.len() as TypeId {
                let pair = TypePair::new(subject, target);
                let denied = denied | targeted_deny(&a, pair) | targeted_deny(&b, pair);
                for avc in [&forward, &backward] {
                    prop_assert!((avc.allowed_on(pair) & denied).is_empty());
                    prop_assert!(avc.denied_on(pair).contains(targeted_deny(&a, pair)));
                    prop_assert!(avc.denied_on(pair).contains(targeted_deny(&b, pair)));
                }
            }
        }
    }
}
