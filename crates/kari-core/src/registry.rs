//! Registry of attached modules.
//!
//! The registry provides:
//! - Insertion-ordered storage of module instances (load order is help and
//!   pulse order)
//! - Lookup by exact name or declared alias
//! - Bookkeeping of units that failed to load

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::warn;

use crate::error::{LoadError, ModuleError};
use crate::module::action::{panic_message, Action, ActionArgs, ActionResult, ActionTable};
use crate::module::manifest::{ExtensionManifest, ModuleCategory};
use crate::module::{Module, ModuleFlags};

/// Where an instance came from, kept so it can be reloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSource {
    /// Discovered on disk and built through the catalog.
    Unit {
        unit: String,
        type_name: String,
        manifest_path: PathBuf,
    },
    /// Attached programmatically before scanning.
    Preloaded { unit: String },
}

impl ModuleSource {
    pub fn unit(&self) -> &str {
        match self {
            Self::Unit { unit, .. } | Self::Preloaded { unit } => unit,
        }
    }
}

/// An attached module and its runtime bookkeeping.
pub struct ModuleInstance {
    /// Manifest, with the category of the root it was loaded from
    manifest: ExtensionManifest,
    /// Implementation
    module: Arc<dyn Module>,
    /// Actions built at attach time
    actions: ActionTable,
    /// Set once synchronous init succeeds, cleared if async init fails
    ready: AtomicBool,
    debug: AtomicBool,
    trace: AtomicBool,
    /// Last init failure, reported by `health`
    init_error: Mutex<Option<String>>,
    source: ModuleSource,
    attached_at: DateTime<Utc>,
}

impl ModuleInstance {
    pub(crate) fn new(
        manifest: ExtensionManifest,
        module: Arc<dyn Module>,
        actions: ActionTable,
        source: ModuleSource,
        flags: ModuleFlags,
    ) -> Self {
        Self {
            manifest,
            module,
            actions,
            ready: AtomicBool::new(false),
            debug: AtomicBool::new(flags.debug),
            trace: AtomicBool::new(flags.trace),
            init_error: Mutex::new(None),
            source,
            attached_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn manifest(&self) -> &ExtensionManifest {
        &self.manifest
    }

    pub fn category(&self) -> ModuleCategory {
        self.manifest.category
    }

    pub fn module(&self) -> &Arc<dyn Module> {
        &self.module
    }

    pub fn actions(&self) -> &ActionTable {
        &self.actions
    }

    /// Implemented action by exact name, whether or not the manifest exposes it.
    pub fn action(&self, name: &str) -> Option<&Action> {
        self.actions.get(name)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn flags(&self) -> ModuleFlags {
        ModuleFlags {
            debug: self.debug.load(Ordering::SeqCst),
            trace: self.trace.load(Ordering::SeqCst),
        }
    }

    pub(crate) fn apply_flags(&self, flags: ModuleFlags) {
        self.debug.store(flags.debug, Ordering::SeqCst);
        self.trace.store(flags.trace, Ordering::SeqCst);
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.module.on_flags(flags))) {
            warn!(
                category = "modules",
                module = %self.name(),
                error = %panic_message(payload.as_ref()),
                "Flag hook panicked"
            );
        }
    }

    pub fn init_error(&self) -> Option<String> {
        self.init_error.lock().clone()
    }

    pub(crate) fn record_init_error(&self, error: &ModuleError) {
        *self.init_error.lock() = Some(error.to_string());
    }

    pub fn source(&self) -> &ModuleSource {
        &self.source
    }

    pub fn attached_at(&self) -> DateTime<Utc> {
        self.attached_at
    }

    /// Call an exposed action by name or alias.
    pub async fn call(&self, action: &str, args: ActionArgs) -> ActionResult {
        let canonical = self.manifest.resolve_action(action).ok_or_else(|| {
            ModuleError::bad_arguments(format!("`{}` does not expose `{action}`", self.name()))
        })?;
        let callable = self.actions.get(canonical).ok_or_else(|| {
            ModuleError::failed(format!("`{}` declares `{canonical}` but has no implementation", self.name()))
        })?;
        callable.invoke(self.name(), canonical, args, None).await
    }

    pub fn summary(&self) -> ModuleSummary {
        ModuleSummary {
            name: self.name().to_string(),
            version: self.manifest.version.clone(),
            category: self.category(),
            ready: self.is_ready(),
            description: self.manifest.description.clone(),
        }
    }
}

impl std::fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("name", &self.manifest.name)
            .field("category", &self.manifest.category)
            .field("ready", &self.is_ready())
            .field("actions", &self.actions)
            .finish()
    }
}

/// One row of the `mods` listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleSummary {
    pub name: String,
    pub version: String,
    pub category: ModuleCategory,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A unit that could not be attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadFailure {
    pub unit: String,
    pub kind: &'static str,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl LoadFailure {
    pub fn new(unit: impl Into<String>, error: &LoadError) -> Self {
        Self {
            unit: unit.into(),
            kind: error.kind(),
            message: error.to_string(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Alias `{alias}` matches several modules: {}", .candidates.join(", "))]
pub struct AmbiguousAlias {
    pub alias: String,
    pub candidates: Vec<String>,
}

/// Attached modules in load order.
#[derive(Debug, Default)]
pub struct Registry {
    modules: RwLock<IndexMap<String, Arc<ModuleInstance>>>,
    failures: Mutex<Vec<LoadFailure>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an instance. The first module to claim a name keeps it.
    pub fn insert(&self, instance: Arc<ModuleInstance>) -> Result<(), LoadError> {
        let mut modules = self.modules.write();
        if modules.contains_key(instance.name()) {
            return Err(LoadError::DuplicateName {
                name: instance.name().to_string(),
                unit: instance.source().unit().to_string(),
            });
        }
        modules.insert(instance.name().to_string(), instance);
        Ok(())
    }

    /// Swap the instance registered under the same name, keeping its position.
    pub(crate) fn replace(&self, instance: Arc<ModuleInstance>) -> Option<Arc<ModuleInstance>> {
        self.modules
            .write()
            .insert(instance.name().to_string(), instance)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<ModuleInstance>> {
        self.modules.write().shift_remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModuleInstance>> {
        self.modules.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.read().contains_key(name)
    }

    /// Look up by exact name, then by case-insensitive name, then by alias.
    pub fn resolve(&self, name: &str) -> Result<Option<Arc<ModuleInstance>>, AmbiguousAlias> {
        let modules = self.modules.read();
        if let Some(found) = modules.get(name) {
            return Ok(Some(found.clone()));
        }
        let by_name: Vec<&Arc<ModuleInstance>> = modules
            .values()
            .filter(|m| m.name().eq_ignore_ascii_case(name))
            .collect();
        let matches = if by_name.is_empty() {
            modules
                .values()
                .filter(|m| m.manifest().answers_to(name))
                .collect()
        } else {
            by_name
        };
        match matches.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some(Arc::clone(only))),
            many => Err(AmbiguousAlias {
                alias: name.to_string(),
                candidates: many.iter().map(|m| m.name().to_string()).collect(),
            }),
        }
    }

    /// True when some registered instance came from `unit`.
    pub fn has_unit(&self, unit: &str) -> bool {
        self.modules
            .read()
            .values()
            .any(|m| m.source().unit() == unit)
    }

    /// Cloned handles in load order. The lock is released on return.
    pub fn snapshot(&self) -> Vec<Arc<ModuleInstance>> {
        self.modules.read().values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.modules.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.read().is_empty()
    }

    pub fn record_failure(&self, failure: LoadFailure) {
        self.failures.lock().push(failure);
    }

    pub fn failures(&self) -> Vec<LoadFailure> {
        self.failures.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl Module for Nop {
        fn actions(self: Arc<Self>) -> ActionTable {
            ActionTable::new().sync("ping", |_| Ok(serde_json::json!("pong")))
        }
    }

    fn instance(name: &str, aliases: &[&str]) -> Arc<ModuleInstance> {
        let module: Arc<dyn Module> = Arc::new(Nop);
        let actions = module.clone().actions();
        let manifest = ExtensionManifest::new(name, "1.0")
            .with_actions(["ping"])
            .with_aliases(aliases.iter().copied());
        Arc::new(ModuleInstance::new(
            manifest,
            module,
            actions,
            ModuleSource::Preloaded { unit: name.to_lowercase() },
            ModuleFlags::default(),
        ))
    }

    #[test]
    fn test_insert_keeps_order_and_rejects_duplicates() {
        let registry = Registry::new();
        registry.insert(instance("B", &[])).unwrap();
        registry.insert(instance("A", &[])).unwrap();
        let err = registry.insert(instance("B", &[])).unwrap_err();
        assert!(matches!(err, LoadError::DuplicateName { .. }));
        assert_eq!(registry.names(), vec!["B", "A"]);
    }

    #[test]
    fn test_remove_and_replace_preserve_order() {
        let registry = Registry::new();
        for name in ["A", "B", "C"] {
            registry.insert(instance(name, &[])).unwrap();
        }
        let old = registry.get("B").unwrap();
        let previous = registry.replace(instance("B", &[])).unwrap();
        assert!(Arc::ptr_eq(&old, &previous));
        assert_eq!(registry.names(), vec!["A", "B", "C"]);

        registry.remove("A");
        assert_eq!(registry.names(), vec!["B", "C"]);
    }

    #[test]
    fn test_resolve_prefers_exact_name() {
        let registry = Registry::new();
        registry.insert(instance("Voice Box", &["voice"])).unwrap();
        registry.insert(instance("voice", &[])).unwrap();
        let found = registry.resolve("voice").unwrap().unwrap();
        assert_eq!(found.name(), "voice");
        let found = registry.resolve("voice box").unwrap().unwrap();
        assert_eq!(found.name(), "Voice Box");
        assert!(registry.resolve("nobody").unwrap().is_none());
    }

    #[test]
    fn test_resolve_ambiguous_alias() {
        let registry = Registry::new();
        registry.insert(instance("Left", &["hand"])).unwrap();
        registry.insert(instance("Right", &["hand"])).unwrap();
        let err = registry.resolve("hand").unwrap_err();
        assert_eq!(err.candidates, vec!["Left", "Right"]);
    }

    #[tokio::test]
    async fn test_call_requires_exposed_action() {
        let inst = instance("A", &[]);
        assert_eq!(inst.call("ping", ActionArgs::new()).await.unwrap(), "pong");
        assert!(inst.call("nope", ActionArgs::new()).await.is_err());
    }

    #[test]
    fn test_failures_are_recorded() {
        let registry = Registry::new();
        let err = LoadError::MissingManifest {
            unit: "broken".into(),
            reason: "no module.toml".into(),
        };
        registry.record_failure(LoadFailure::new("broken", &err));
        let failures = registry.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, "missing_manifest");
    }
}
