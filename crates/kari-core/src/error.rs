//! Error types shared across the orchestrator.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use crate::config::ConfigError;

/// Result alias for orchestrator-level operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// A manifest that parsed but does not describe a usable module.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("Manifest name is empty")]
    EmptyName,

    #[error("Manifest version is empty")]
    EmptyVersion,

    #[error("Manifest has an empty entry in `{0}`")]
    EmptyEntry(&'static str),

    #[error("Action declared twice: {0}")]
    DuplicateAction(String),

    #[error("Action alias `{alias}` points at undeclared action `{target}`")]
    DanglingAlias { alias: String, target: String },
}

/// Failure to discover, instantiate or register a module unit.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Module root {path} is unreadable: {source}")]
    UnreadableRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unit `{unit}` has no readable manifest: {reason}")]
    MissingManifest { unit: String, reason: String },

    #[error("Unit `{unit}` has an invalid manifest: {reason}")]
    InvalidManifest { unit: String, reason: String },

    #[error("Unit `{unit}` exposes no implementation named `{type_name}`")]
    MissingImplementation { unit: String, type_name: String },

    #[error("Unit `{unit}` failed to instantiate: {reason}")]
    Instantiation { unit: String, reason: String },

    #[error("Module name `{name}` is already registered, unit `{unit}` rejected")]
    DuplicateName { name: String, unit: String },

    #[error("Module `{0}` was preloaded and cannot be reloaded from disk")]
    NotReloadable(String),

    #[error("Module not found: {0}")]
    NotFound(String),
}

impl LoadError {
    /// Short machine-readable tag used in health reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnreadableRoot { .. } => "unreadable_root",
            Self::MissingManifest { .. } => "missing_manifest",
            Self::InvalidManifest { .. } => "invalid_manifest",
            Self::MissingImplementation { .. } => "missing_implementation",
            Self::Instantiation { .. } => "instantiation",
            Self::DuplicateName { .. } => "duplicate_name",
            Self::NotReloadable(_) => "not_reloadable",
            Self::NotFound(_) => "not_found",
        }
    }
}

/// Error raised by a module hook or action.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("{0}")]
    Failed(String),

    #[error("Bad arguments: {0}")]
    BadArguments(String),

    #[error("Module not ready: {0}")]
    NotReady(String),

    #[error("Panicked: {0}")]
    Panicked(String),

    #[error("Timed out after {0} ms")]
    TimedOut(u64),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ModuleError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn bad_arguments(message: impl Into<String>) -> Self {
        Self::BadArguments(message.into())
    }
}

/// Category of a failed control request, serialized verbatim on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlErrorKind {
    UnknownCommand,
    UnknownModule,
    UnknownAction,
    BadArguments,
    ActionFailed,
}

/// Error half of a control response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct ControlError {
    pub kind: ControlErrorKind,
    pub message: String,
}

impl ControlError {
    pub fn new(kind: ControlErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unknown_command(message: impl Into<String>) -> Self {
        Self::new(ControlErrorKind::UnknownCommand, message)
    }

    pub fn unknown_module(name: &str) -> Self {
        Self::new(ControlErrorKind::UnknownModule, format!("No module named `{name}`"))
    }

    pub fn unknown_action(module: &str, action: &str) -> Self {
        Self::new(
            ControlErrorKind::UnknownAction,
            format!("Module `{module}` does not expose action `{action}`"),
        )
    }

    pub fn bad_arguments(message: impl Into<String>) -> Self {
        Self::new(ControlErrorKind::BadArguments, message)
    }

    pub fn action_failed(message: impl Into<String>) -> Self {
        Self::new(ControlErrorKind::ActionFailed, message)
    }
}

/// Fatal orchestrator errors.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Failed to bind control socket at {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
