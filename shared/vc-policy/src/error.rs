//! Policy error types.
//!
//! Three layers, matching where a failure can happen:
//! - [`ParseError`]: tokenizing or parsing one source file
//! - [`CompileError`]: compiling one source file (wraps syntax errors)
//! - [`PolicyError`]: loading, merging, and persisting modules for a guild

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::diagnostic::render_excerpt;
use crate::span::Range;

/// Lexical or syntactic error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at {}:{}", range.start.line, range.start.column)]
pub struct ParseError {
    pub message: String,
    pub range: Range,
}

impl ParseError {
    pub fn new(message: impl Into<String>, range: Range) -> Self {
        Self {
            message: message.into(),
            range,
        }
    }
}

/// Error raised while compiling a single policy source file.
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    /// The file could not be tokenized or parsed.
    #[error("{filename}: {error}")]
    Syntax {
        filename: String,
        text: Arc<str>,
        error: ParseError,
    },

    /// The file parsed but violates a semantic rule.
    #[error("{filename}:{}:{}: {message}", range.start.line, range.start.column)]
    Semantic {
        filename: String,
        text: Arc<str>,
        message: String,
        range: Range,
    },
}

impl CompileError {
    /// Human-readable message without location.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Syntax { error, .. } => &error.message,
            Self::Semantic { message, .. } => message,
        }
    }

    /// Source range the error is anchored to.
    #[must_use]
    pub const fn range(&self) -> &Range {
        match self {
            Self::Syntax { error, .. } => &error.range,
            Self::Semantic { range, .. } => range,
        }
    }

    #[must_use]
    pub fn filename(&self) -> &str {
        match self {
            Self::Syntax { filename, .. } | Self::Semantic { filename, .. } => filename,
        }
    }

    /// Render the error with a caret-underlined source excerpt.
    #[must_use]
    pub fn render(&self) -> String {
        let text = match self {
            Self::Syntax { text, .. } | Self::Semantic { text, .. } => text,
        };
        render_excerpt(text, self.filename(), self.range(), self.message())
    }
}

/// Manager-level policy error.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Two modules loaded into the same guild disagree on a type id.
    #[error(
        "Conflicting type definitions in policy module {module}: existing '{existing}' from {existing_module}, new '{new}' [@{type_id}]"
    )]
    ConflictingType {
        module: String,
        existing_module: String,
        existing: String,
        new: String,
        type_id: u32,
    },

    /// Snapshot was written by a newer runtime.
    #[error("Unsupported policy version: {found} (this runtime supports up to {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    /// Snapshot bytes could not be decoded.
    #[error("Malformed policy snapshot")]
    Decode(#[from] bincode::Error),

    /// Decoded or compiled data violates the structural schema.
    #[error("Invalid policy structure: {0}")]
    Validation(String),

    /// Compilation of a policy source failed.
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Reading or writing a policy file failed.
    #[error("I/O error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A policy module or AVC file could not be loaded.
    #[error("Invalid policy file: {path}")]
    InvalidFile {
        path: PathBuf,
        #[source]
        source: Box<PolicyError>,
    },
}

impl PolicyError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid_file(path: impl Into<PathBuf>, source: Self) -> Self {
        Self::InvalidFile {
            path: path.into(),
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;
    use crate::span::Location;

    #[test]
    fn test_parse_error_display_has_location() {
        let error = ParseError::new("Unexpected token '@'", Range::point(Location::new(3, 2, 4)));
        assert_eq!(error.to_string(), "Unexpected token '@' at 2:4");
    }

    #[test]
    fn test_compile_error_accessors() {
        let range = Range::new(Location::new(6, 1, 7), Location::new(11, 1, 12));
        let error = CompileError::Semantic {
            filename: "base.policy".into(),
            text: Arc::from("allow mod_t * {}"),
            message: "Invalid type 'mod_t': did you forget to require it?".into(),
            range,
        };

        assert_eq!(error.filename(), "base.policy");
        assert_eq!(*error.range(), range);
        assert!(error.to_string().starts_with("base.policy:1:7: Invalid type"));
        assert!(error.render().contains("^^^^^"));
    }

    #[test]
    fn test_invalid_file_keeps_cause() {
        let error = PolicyError::invalid_file(
            "/tmp/guild.avc",
            PolicyError::UnsupportedVersion {
                found: 9,
                supported: 1,
            },
        );

        assert!(error.to_string().contains("/tmp/guild.avc"));
        let cause = error.source().expect("cause should be kept");
        assert!(cause.to_string().contains("Unsupported policy version: 9"));
    }
}
