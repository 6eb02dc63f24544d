//! Core runtime for the K.A.R.I. module orchestrator.
//!
//! This crate hosts everything the daemon needs apart from the concrete
//! modules: manifest discovery and the attachment sequence, the module
//! registry, the shared state store, the pulse scheduler, help
//! aggregation and the line-oriented control socket.

pub mod config;
pub mod control;
pub mod error;
pub mod help;
pub mod loader;
pub mod module;
pub mod orchestrator;
pub mod pulse;
pub mod registry;
pub mod state;

pub use config::{OrchestratorConfig, SocketConfig};
pub use error::{ConfigError, ControlError, ControlErrorKind, CoreError, LoadError, ManifestError, ModuleError, Result};
pub use loader::{LoadReport, ModuleLoader, ModuleRoot};
pub use module::action::{Action, ActionArgs, ActionResult, ActionTable};
pub use module::catalog::ModuleCatalog;
pub use module::manifest::{ExtensionManifest, ModuleCategory};
pub use module::{Module, ModuleContext, ModuleFlags};
pub use orchestrator::Orchestrator;
pub use pulse::{PulseDispatcher, TickReport};
pub use registry::{ModuleInstance, Registry};
pub use state::SharedState;

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::error::ModuleError;
    pub use crate::module::action::{ActionArgs, ActionResult, ActionTable};
    pub use crate::module::manifest::{ExtensionManifest, ModuleCategory};
    pub use crate::module::{Module, ModuleContext, ModuleFlags};
    pub use crate::state::SharedState;
}
