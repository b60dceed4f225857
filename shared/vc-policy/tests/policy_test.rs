//! End-to-end policy pipeline tests.
//!
//! Source files are compiled, persisted as module snapshots, loaded into a
//! guild, merged, persisted as a guild snapshot and queried through the
//! permission resolver.
//!
//! Run with: `cargo test -p vc-policy --test policy_test`

use std::sync::Arc;

use uuid::Uuid;
use vc_policy::{
    ContextResolver, EntityRef, PermissionResolver, Permissions, PolicyCompiler, PolicyConfig,
    PolicyError, PolicyManager, StaticContextResolver,
};

const BASE: &str = r#"
module {
    name "base";
    author "Policy Team";
    version 1;
}

require {
    type unlabeled_t;
    type member_t;
    type moderator_t;
    type admin_t;
    type staff_channel_t;
}

allow member_t * { ViewChannel, SendMessages, Connect, Speak, AddReactions };
allow moderator_t * { ViewChannel, SendMessages, Connect, Speak, ManageMessages, KickMembers, ModerateMembers };
allow admin_t * { Administrator, BanMembers, KickMembers, ManageRoles, ManageChannels };

allow moderator_t member_t { KickMembers, ModerateMembers, MuteMembers };
deny moderator_t admin_t { KickMembers, ModerateMembers };
allow moderator_t staff_channel_t { ViewChannel, SendMessages };
"#;

const LOCKDOWN: &str = r#"
module { name "lockdown"; version 2 }

require {
    type unlabeled_t;
    type member_t;
}

deny member_t * { SendMessages, AddReactions }
"#;

// ============================================================================
// Compilation
// ============================================================================

#[test]
fn test_compile_reports_rendered_diagnostics() {
    let compiler = PolicyCompiler::default();
    let source = "require { type a; }\nallow a * {\n    SendMessages,\n    Teleport\n}";

    let error = compiler.compile(source, "broken.policy").unwrap_err();
    assert_eq!(error.message(), "Invalid permission type 'Teleport'");

    let rendered = error.render();
    assert!(rendered.contains("broken.policy:4:5"));
    assert!(rendered.contains("4 |     Teleport"));
    assert!(rendered.contains("^^^^^^^^"));
}

#[test]
fn test_compile_error_on_missing_require() {
    let error = PolicyCompiler::default()
        .compile("allow moderator_t * { KickMembers }", "missing.policy")
        .unwrap_err();
    assert!(error.message().contains("did you forget to require it?"));
    assert!(error.message().contains("moderator_t"));
}

// ============================================================================
// Manager
// ============================================================================

#[tokio::test]
async fn test_full_pipeline_with_snapshots() {
    let dir = tempfile::tempdir().expect("tempdir");
    let guild = Uuid::now_v7();
    let config = PolicyConfig {
        snapshot_dir: Some(dir.path().to_path_buf()),
        ..PolicyConfig::default()
    };

    let compiler = PolicyCompiler::default();
    let manager = PolicyManager::new(config.clone());

    for (name, source) in [("base", BASE), ("lockdown", LOCKDOWN)] {
        let module = compiler
            .compile(source, &format!("{name}.policy"))
            .expect("policy should compile");
        let path = dir.path().join("modules").join(format!("{name}.pm"));
        manager
            .store_module_file(&path, &module)
            .await
            .expect("module snapshot should store");
        manager
            .load_module_from_file(guild, &path)
            .await
            .expect("module snapshot should load");
    }

    manager.compile_all(guild).await.expect("guild should compile");
    manager.store_guild(guild).await.expect("guild should store");

    let check = |manager: &PolicyManager| {
        assert_eq!(
            manager.permissions_of(guild, "member_t"),
            Permissions::VIEW_CHANNEL | Permissions::CONNECT | Permissions::SPEAK
        );
        assert!(manager
            .permissions_of_with_target(guild, "moderator_t", "member_t")
            .has(Permissions::MUTE_MEMBERS | Permissions::KICK_MEMBERS));
        assert!(!manager
            .permissions_of_with_target(guild, "moderator_t", "admin_t")
            .has(Permissions::KICK_MEMBERS));
        assert_eq!(
            manager.denied_permissions_of_with_target(guild, "moderator_t", "admin_t"),
            Permissions::KICK_MEMBERS | Permissions::MODERATE_MEMBERS
        );
    };
    check(&manager);

    // A restarted process rebuilds the same state from the guild snapshot.
    let restarted = PolicyManager::new(config);
    restarted.cache_guild(guild).await;
    check(&restarted);

    let modules = restarted.loaded_modules(guild).await;
    let names: Vec<_> = modules.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["base", "lockdown"]);
    assert_eq!(modules["base"].policy_module.author.as_deref(), Some("Policy Team"));
}

#[tokio::test]
async fn test_conflicting_modules_are_reported() {
    let guild = Uuid::now_v7();
    let compiler = PolicyCompiler::default();
    let manager = PolicyManager::default();

    manager
        .load_module(guild, compiler.compile(BASE, "base.policy").expect("compile"))
        .await
        .expect("module should load");
    manager
        .load_module(
            guild,
            compiler
                .compile(
                    "module { name \"rogue\" } require { type unlabeled_t; type guest_t; }",
                    "rogue.policy",
                )
                .expect("compile"),
        )
        .await
        .expect("module should load");

    let error = manager.compile_all(guild).await.unwrap_err();
    let PolicyError::ConflictingType {
        module,
        existing_module,
        existing,
        new,
        type_id,
    } = error
    else {
        panic!("expected conflicting type error");
    };
    assert_eq!(module, "rogue");
    assert_eq!(existing_module, "base");
    assert_eq!(existing, "member_t");
    assert_eq!(new, "guest_t");
    assert_eq!(type_id, 1);
}

// ============================================================================
// Resolver
// ============================================================================

#[tokio::test]
async fn test_resolver_end_to_end() {
    let guild = Uuid::now_v7();
    let compiler = PolicyCompiler::default();
    let manager = Arc::new(PolicyManager::default());
    manager
        .load_module(guild, compiler.compile(BASE, "base.policy").expect("compile"))
        .await
        .expect("module should load");

    let contexts = Arc::new(StaticContextResolver::new());
    let resolver = PermissionResolver::new(
        Arc::clone(&manager),
        Arc::clone(&contexts) as Arc<dyn ContextResolver>,
    );
    resolver.reload_guild(guild).await.expect("guild should compile");

    let (moderator, member, admin) = (Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());
    let staff = EntityRef::channel(Uuid::now_v7());
    contexts.set_default(guild, 0);
    contexts.assign(guild, EntityRef::member(member), 1);
    contexts.assign(guild, EntityRef::member(moderator), 2);
    contexts.assign(guild, EntityRef::member(admin), 3);
    contexts.assign(guild, staff, 4);

    let native = Permissions::all();
    assert!(resolver.has_permissions_on(
        guild,
        moderator,
        &EntityRef::member(member),
        native,
        Permissions::MUTE_MEMBERS
    ));
    assert!(!resolver.has_permissions_on(
        guild,
        moderator,
        &EntityRef::member(admin),
        native,
        Permissions::KICK_MEMBERS
    ));
    assert!(resolver.has_permissions_on(guild, moderator, &staff, native, Permissions::SEND_MESSAGES));
    assert!(!resolver.has_permissions_on(guild, member, &staff, native, Permissions::VIEW_CHANNEL));

    // Unlabeled members fall back to unlabeled_t, which grants nothing.
    let stranger = Uuid::now_v7();
    assert_eq!(resolver.policy_permissions(guild, stranger), Permissions::empty());
    assert!(resolver.has_permissions(guild, stranger, native, Permissions::empty()));

    // Lockdown takes effect after a reload.
    assert!(resolver.has_permissions(guild, member, native, Permissions::SEND_MESSAGES));
    manager
        .load_module(guild, compiler.compile(LOCKDOWN, "lockdown.policy").expect("compile"))
        .await
        .expect("module should load");
    resolver.reload_guild(guild).await.expect("guild should reload");
    assert!(!resolver.has_permissions(guild, member, native, Permissions::SEND_MESSAGES));
    assert!(resolver.has_permissions(guild, member, native, Permissions::SPEAK));
}
