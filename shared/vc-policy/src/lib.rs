//! `VoiceChat` Guild Policy Engine
//!
//! Label-based mandatory access control for guilds. Administrators write
//! policy modules in a small DSL; modules are compiled into permission
//! tables, merged per guild into an access vector cache (AVC), and queried
//! on every permission-gated event.
//!
//! Pipeline: source -> [`lexer`] -> [`parser`] -> [`compiler`] ->
//! [`manager::PolicyManager`] -> [`resolver::PermissionResolver`].

pub mod ast;
pub mod avc;
pub mod cache;
pub mod codec;
pub mod compiler;
pub mod config;
pub mod context;
pub mod diagnostic;
pub mod error;
pub mod lexer;
pub mod manager;
pub mod module;
pub mod parser;
pub mod permissions;
pub mod resolver;
pub mod span;

pub use avc::{AccessVectorCache, TypePair};
pub use cache::TtlCache;
pub use codec::GuildSnapshot;
pub use compiler::PolicyCompiler;
pub use config::{CacheConfig, PolicyConfig};
pub use context::{ContextResolver, EntityKind, EntityRef, StaticContextResolver};
pub use error::{CompileError, ParseError, PolicyError};
pub use manager::{PolicyManager, TypeRef};
pub use module::{CompiledModule, ModuleDetails, TypeId};
pub use permissions::{PermissionRegistry, Permissions, PlatformRegistry};
pub use resolver::PermissionResolver;

/// Highest snapshot/AVC format version this runtime understands.
pub const POLICY_VERSION: u32 = 1;
