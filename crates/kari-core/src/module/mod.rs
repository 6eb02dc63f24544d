//! The module contract: what a module implements and what it is handed.

pub mod action;
pub mod catalog;
pub mod manifest;

use std::fmt;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::ModuleError;
use crate::registry::{ModuleInstance, Registry};
use crate::state::SharedState;
use action::ActionTable;

/// Diagnostic switches propagated from the orchestrator to every module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleFlags {
    pub debug: bool,
    pub trace: bool,
}

/// A pluggable unit of behaviour.
///
/// Hooks run in this order during attachment: [`attach`](Module::attach),
/// [`on_flags`](Module::on_flags), [`init`](Module::init),
/// [`actions`](Module::actions), then [`initialize`](Module::initialize)
/// on the runtime once the module is registered.
pub trait Module: Send + Sync + 'static {
    /// Receive the context. Called exactly once, before any other hook.
    fn attach(&mut self, _ctx: ModuleContext) {}

    /// Synchronous setup. An error leaves the module registered but not ready.
    fn init(&mut self) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Asynchronous setup, scheduled without blocking the boot sequence.
    /// Return `None` when the module has none.
    fn initialize(self: Arc<Self>) -> Option<BoxFuture<'static, Result<(), ModuleError>>> {
        None
    }

    /// Build the action table. Called once per attachment.
    fn actions(self: Arc<Self>) -> ActionTable;

    /// Debug/trace changed.
    fn on_flags(&self, _flags: ModuleFlags) {}

    /// Called on detach, reload and orchestrator shutdown.
    fn shutdown(&self) {}
}

/// The only surface a module sees of the orchestrator.
#[derive(Clone)]
pub struct ModuleContext {
    name: String,
    state: SharedState,
    registry: Weak<Registry>,
    flags: ModuleFlags,
    span: tracing::Span,
}

impl ModuleContext {
    pub(crate) fn new(
        name: &str,
        state: SharedState,
        registry: &Arc<Registry>,
        flags: ModuleFlags,
    ) -> Self {
        Self {
            name: name.to_string(),
            state,
            registry: Arc::downgrade(registry),
            flags,
            span: tracing::info_span!("module", module = %name),
        }
    }

    /// A context with no registry behind it, for driving a module outside
    /// the orchestrator.
    pub fn detached(name: &str, state: SharedState) -> Self {
        Self {
            name: name.to_string(),
            state,
            registry: Weak::new(),
            flags: ModuleFlags::default(),
            span: tracing::info_span!("module", module = %name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Flags in effect at attach time. Later changes arrive via `on_flags`.
    pub fn flags(&self) -> ModuleFlags {
        self.flags
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Find another attached module by name or unambiguous alias.
    pub fn lookup(&self, name: &str) -> Option<Arc<ModuleInstance>> {
        self.registry.upgrade()?.resolve(name).ok().flatten()
    }
}

impl fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContext")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}
