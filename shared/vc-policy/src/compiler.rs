//! Compiles policy source into [`CompiledModule`]s.

use std::path::Path;
use std::sync::Arc;

use indexmap::IndexSet;
use tracing::debug;

use crate::ast::{AllowDeny, LiteralKind, ModuleBlock, RequireBlock, Root, RuleKind, Statement, Target};
use crate::error::{CompileError, PolicyError};
use crate::module::{CompiledModule, TypeId};
use crate::parser::parse;
use crate::permissions::{PermissionRegistry, Permissions, PlatformRegistry};
use crate::span::Range;

/// Policy module compiler.
///
/// Holds the permission vocabulary used to resolve names in
/// `allow`/`deny` rules.
#[derive(Clone)]
pub struct PolicyCompiler {
    registry: Arc<dyn PermissionRegistry>,
}

impl Default for PolicyCompiler {
    fn default() -> Self {
        Self::new(Arc::new(PlatformRegistry))
    }
}

impl std::fmt::Debug for PolicyCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyCompiler")
            .field("registry_version", &self.registry.version())
            .finish()
    }
}

impl PolicyCompiler {
    #[must_use]
    pub fn new(registry: Arc<dyn PermissionRegistry>) -> Self {
        Self { registry }
    }

    /// Compile one policy source file.
    ///
    /// Stops at the first syntax or semantic error.
    pub fn compile(&self, source: &str, filename: &str) -> Result<CompiledModule, CompileError> {
        let text: Arc<str> = Arc::from(source);
        let root = parse(source).map_err(|error| CompileError::Syntax {
            filename: filename.to_string(),
            text: Arc::clone(&text),
            error,
        })?;

        let mut unit = CompilationUnit {
            registry: self.registry.as_ref(),
            filename,
            text,
            module: CompiledModule::default(),
            required: false,
        };
        unit.compile_root(&root)?;

        debug!(
            filename,
            module = %unit.module.policy_module.name,
            types = unit.module.map_types.len(),
            "Compiled policy module"
        );
        Ok(unit.module)
    }

    /// Read and compile a policy source file.
    pub async fn compile_file(&self, path: impl AsRef<Path>) -> Result<CompiledModule, PolicyError> {
        let path = path.as_ref();
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PolicyError::io(path, e))?;

        Ok(self.compile(&source, &path.display().to_string())?)
    }
}

/// State for compiling a single file.
struct CompilationUnit<'a> {
    registry: &'a dyn PermissionRegistry,
    filename: &'a str,
    text: Arc<str>,
    module: CompiledModule,
    required: bool,
}

impl CompilationUnit<'_> {
    fn error(&self, message: impl Into<String>, range: Range) -> CompileError {
        CompileError::Semantic {
            filename: self.filename.to_string(),
            text: Arc::clone(&self.text),
            message: message.into(),
            range,
        }
    }

    fn compile_root(&mut self, root: &Root) -> Result<(), CompileError> {
        for statement in &root.statements {
            match statement {
                Statement::Module(block) => self.compile_module(block)?,
                Statement::Require(block) => self.compile_require(block)?,
                Statement::AllowDeny(rule) => self.compile_rule(rule)?,
            }
        }

        Ok(())
    }

    fn compile_module(&mut self, block: &ModuleBlock) -> Result<(), CompileError> {
        for field in ["name", "author"] {
            if let Some(property) = block.property(field) {
                if property.value.kind != LiteralKind::String {
                    return Err(self.error(
                        format!(
                            "module.{field} must be a valid string, found {}",
                            property.value.kind
                        ),
                        property.range,
                    ));
                }
            }
        }

        if let Some(property) = block.property("version") {
            if property.value.kind != LiteralKind::Integer {
                return Err(self.error(
                    format!(
                        "module.version must be a valid integer, found {}",
                        property.value.kind
                    ),
                    property.range,
                ));
            }

            self.module.policy_module.version = property.value.value.parse().map_err(|_| {
                self.error(
                    format!(
                        "module.version must be between 0 and {}, found {}",
                        u32::MAX,
                        property.value.value
                    ),
                    property.value.range,
                )
            })?;
        }

        if let Some(property) = block.property("name") {
            self.module.policy_module.name.clone_from(&property.value.value);
        }
        if let Some(property) = block.property("author") {
            self.module.policy_module.author = Some(property.value.value.clone());
        }

        Ok(())
    }

    fn compile_require(&mut self, block: &RequireBlock) -> Result<(), CompileError> {
        if self.required {
            return Err(self.error(
                "Only one require block is allowed per policy file",
                block.range,
            ));
        }
        self.required = true;

        let types: IndexSet<&str> = block
            .types
            .iter()
            .map(|required| required.identifier.as_str())
            .collect();

        self.module.map_types = types.into_iter().map(str::to_string).collect();
        self.module.allow_types = vec![Permissions::empty(); self.module.map_types.len()];
        self.module.deny_types = vec![Permissions::empty(); self.module.map_types.len()];
        Ok(())
    }

    fn compile_rule(&mut self, rule: &AllowDeny) -> Result<(), CompileError> {
        let subject = self.type_index(&rule.subject.name, rule.subject.range)?;
        let target = match &rule.target {
            Target::Wildcard => None,
            Target::Type(name) => Some(self.type_index(name, rule.target_range)?),
        };

        let mut bits = Permissions::empty();
        for permission in &rule.permissions {
            let flag = self.registry.resolve(&permission.name).ok_or_else(|| {
                self.error(
                    format!("Invalid permission type '{}'", permission.name),
                    permission.range,
                )
            })?;
            bits |= flag;
        }

        let module = &mut self.module;
        match (rule.kind, target) {
            (RuleKind::Allow, None) => module.allow_types[subject as usize] = bits,
            (RuleKind::Deny, None) => module.deny_types[subject as usize] = bits,
            (RuleKind::Allow, Some(target)) => {
                module
                    .allow_types_on_targets
                    .entry(subject)
                    .or_default()
                    .insert(target, bits);
            }
            (RuleKind::Deny, Some(target)) => {
                module
                    .deny_types_on_targets
                    .entry(subject)
                    .or_default()
                    .insert(target, bits);
            }
        }

        Ok(())
    }

    fn type_index(&self, name: &str, range: Range) -> Result<TypeId, CompileError> {
        self.module.type_id(name).ok_or_else(|| {
            self.error(
                format!("Invalid type '{name}': did you forget to require it?"),
                range,
            )
        })
    }
}
