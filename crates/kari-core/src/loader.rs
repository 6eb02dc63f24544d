//! Module discovery and the attachment sequence.
//!
//! A root is scanned for units: a directory holding `module.toml`, or a
//! top-level `<unit>.toml`. Each unit's manifest is parsed, its
//! implementation is looked up in the [`ModuleCatalog`] under the canonical
//! type name, and the instance goes through attach → flags → init → action
//! table → register → async initialize → announcement. A failing unit is
//! logged and recorded; it never stops the scan.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{LoadError, ModuleError};
use crate::module::action::{panic_message, run_async, run_sync, Action, ActionArgs};
use crate::module::catalog::{canonical_type_name, ModuleCatalog, ModuleConstructor};
use crate::module::manifest::{ExtensionManifest, ModuleCategory};
use crate::module::{Module, ModuleContext, ModuleFlags};
use crate::registry::{LoadFailure, ModuleInstance, ModuleSource, Registry};
use crate::state::SharedState;

/// Manifest file name inside a unit directory.
pub const MANIFEST_FILE: &str = "module.toml";

/// A directory scanned for module units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRoot {
    pub path: PathBuf,
    pub category: ModuleCategory,
    /// An unreadable required root aborts boot; an optional one is skipped.
    pub required: bool,
}

impl ModuleRoot {
    pub fn builtin(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            category: ModuleCategory::Builtin,
            required: true,
        }
    }

    pub fn addon(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            category: ModuleCategory::Addon,
            required: false,
        }
    }
}

/// A candidate found while scanning a root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredUnit {
    pub unit: String,
    /// `None` for a unit directory without `module.toml`.
    pub manifest_path: Option<PathBuf>,
    pub category: ModuleCategory,
}

/// List the units under `root` in lexical order.
///
/// Names starting with `_` or `.` are ignored, as are files that are not
/// `.toml`.
pub fn discover(root: &ModuleRoot) -> Result<Vec<DiscoveredUnit>, LoadError> {
    let entries = std::fs::read_dir(&root.path).map_err(|source| LoadError::UnreadableRoot {
        path: root.path.clone(),
        source,
    })?;

    let mut units = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| LoadError::UnreadableRoot {
            path: root.path.clone(),
            source,
        })?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if file_name.starts_with('_') || file_name.starts_with('.') {
            continue;
        }

        let path = entry.path();
        if path.is_dir() {
            let manifest = path.join(MANIFEST_FILE);
            units.push(DiscoveredUnit {
                unit: file_name,
                manifest_path: manifest.is_file().then_some(manifest),
                category: root.category,
            });
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            units.push(DiscoveredUnit {
                unit: stem,
                manifest_path: Some(path),
                category: root.category,
            });
        }
    }
    units.sort_by(|a, b| a.unit.cmp(&b.unit));
    Ok(units)
}

/// Read, parse and validate a manifest file, stamping it with `category`.
pub fn read_manifest(
    unit: &str,
    path: &Path,
    category: ModuleCategory,
) -> Result<ExtensionManifest, LoadError> {
    let content = std::fs::read_to_string(path).map_err(|e| LoadError::MissingManifest {
        unit: unit.to_string(),
        reason: format!("{}: {e}", path.display()),
    })?;
    let mut manifest =
        ExtensionManifest::from_toml_str(&content).map_err(|e| LoadError::InvalidManifest {
            unit: unit.to_string(),
            reason: e.to_string(),
        })?;
    manifest.validate().map_err(|e| LoadError::InvalidManifest {
        unit: unit.to_string(),
        reason: e.to_string(),
    })?;
    manifest.category = category;
    Ok(manifest)
}

/// Outcome of scanning one or more roots.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    /// Module names attached, in load order
    pub attached: Vec<String>,
    /// Units skipped because a preloaded module already covers them
    pub preloaded: Vec<String>,
    pub failures: Vec<LoadFailure>,
}

impl LoadReport {
    pub fn merge(&mut self, other: LoadReport) {
        self.attached.extend(other.attached);
        self.preloaded.extend(other.preloaded);
        self.failures.extend(other.failures);
    }
}

/// Knobs the loader takes from the orchestrator configuration.
#[derive(Debug, Clone, Default)]
pub struct LoaderSettings {
    /// Module asked to announce each newly attached module
    pub voice_module: Option<String>,
    pub announce_action: String,
    pub action_timeout: Option<Duration>,
}

impl From<&OrchestratorConfig> for LoaderSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        let voice = config.voice_module.trim();
        Self {
            voice_module: (!voice.is_empty()).then(|| voice.to_string()),
            announce_action: config.announce_action.clone(),
            action_timeout: config.action_timeout(),
        }
    }
}

pub struct ModuleLoader {
    registry: Arc<Registry>,
    state: SharedState,
    catalog: ModuleCatalog,
    settings: LoaderSettings,
    /// Serialises attach, detach and reload
    lifecycle: Mutex<()>,
}

impl ModuleLoader {
    pub fn new(
        registry: Arc<Registry>,
        state: SharedState,
        catalog: ModuleCatalog,
        settings: LoaderSettings,
    ) -> Self {
        Self {
            registry,
            state,
            catalog,
            settings,
            lifecycle: Mutex::new(()),
        }
    }

    pub fn catalog(&self) -> &ModuleCatalog {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Scan `roots` in order and attach every unit found.
    ///
    /// Fails only when a required root cannot be read.
    pub fn load_all(&self, roots: &[ModuleRoot], flags: ModuleFlags) -> Result<LoadReport, LoadError> {
        let mut report = LoadReport::default();
        for root in roots {
            report.merge(self.load_root(root, flags)?);
        }
        Ok(report)
    }

    pub fn load_root(&self, root: &ModuleRoot, flags: ModuleFlags) -> Result<LoadReport, LoadError> {
        let mut report = LoadReport::default();
        let units = match discover(root) {
            Ok(units) => units,
            Err(e) if root.required => return Err(e),
            Err(LoadError::UnreadableRoot { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                info!(category = "modules", root = %root.path.display(), "Optional module root not present, skipping");
                return Ok(report);
            }
            Err(e) => {
                warn!(category = "modules", root = %root.path.display(), error = %e, "Optional module root unreadable, skipping");
                return Ok(report);
            }
        };

        debug!(category = "modules", root = %root.path.display(), units = units.len(), "Scanning module root");
        for unit in &units {
            match self.load_unit(unit, flags) {
                Ok(Some(instance)) => report.attached.push(instance.name().to_string()),
                Ok(None) => report.preloaded.push(unit.unit.clone()),
                Err(e) => {
                    warn!(category = "modules", unit = %unit.unit, error = %e, "Skipping module unit");
                    let failure = LoadFailure::new(&unit.unit, &e);
                    self.registry.record_failure(failure.clone());
                    report.failures.push(failure);
                }
            }
        }
        Ok(report)
    }

    /// Attach one discovered unit. `Ok(None)` means a preloaded module
    /// already stands in for it.
    pub fn load_unit(
        &self,
        unit: &DiscoveredUnit,
        flags: ModuleFlags,
    ) -> Result<Option<Arc<ModuleInstance>>, LoadError> {
        if self.registry.has_unit(&unit.unit) {
            debug!(category = "modules", unit = %unit.unit, "Unit already attached as a preloaded module");
            return Ok(None);
        }

        let manifest_path = unit.manifest_path.clone().ok_or_else(|| LoadError::MissingManifest {
            unit: unit.unit.clone(),
            reason: format!("no {MANIFEST_FILE}"),
        })?;
        let manifest = read_manifest(&unit.unit, &manifest_path, unit.category)?;

        let type_name = canonical_type_name(&unit.unit);
        let constructor = self.catalog.get(&type_name).cloned().ok_or_else(|| {
            LoadError::MissingImplementation {
                unit: unit.unit.clone(),
                type_name: type_name.clone(),
            }
        })?;

        let _lifecycle = self.lifecycle.lock();
        // Reject before running any module code.
        if self.registry.contains(&manifest.name) {
            return Err(LoadError::DuplicateName {
                name: manifest.name,
                unit: unit.unit.clone(),
            });
        }
        let module = instantiate(&unit.unit, &constructor)?;
        let source = ModuleSource::Unit {
            unit: unit.unit.clone(),
            type_name,
            manifest_path,
        };
        self.attach_locked(manifest, source, module, flags).map(Some)
    }

    /// Attach an already-constructed module.
    pub fn attach(
        &self,
        manifest: ExtensionManifest,
        source: ModuleSource,
        module: Box<dyn Module>,
        flags: ModuleFlags,
    ) -> Result<Arc<ModuleInstance>, LoadError> {
        let _lifecycle = self.lifecycle.lock();
        let unit = source.unit().to_string();
        self.attach_locked(manifest, source, module, flags)
            .inspect_err(|e| self.registry.record_failure(LoadFailure::new(unit, e)))
    }

    /// Remove a module and run its shutdown hook.
    pub fn detach(&self, name: &str) -> Option<Arc<ModuleInstance>> {
        let _lifecycle = self.lifecycle.lock();
        let instance = self.registry.remove(name)?;
        shutdown_instance(&instance);
        info!(category = "modules", module = %name, "Module detached");
        Some(instance)
    }

    /// Shut a catalog-backed module down and attach a fresh instance from
    /// its manifest, keeping its place in load order. On failure the module
    /// stays detached and the failure is recorded.
    pub fn reload(&self, name: &str, flags: ModuleFlags) -> Result<Arc<ModuleInstance>, LoadError> {
        let _lifecycle = self.lifecycle.lock();
        let current = self
            .registry
            .get(name)
            .ok_or_else(|| LoadError::NotFound(name.to_string()))?;
        let ModuleSource::Unit {
            unit,
            type_name,
            manifest_path,
        } = current.source().clone()
        else {
            return Err(LoadError::NotReloadable(name.to_string()));
        };

        shutdown_instance(&current);
        let rebuilt = self.rebuild(&current, &unit, &type_name, &manifest_path, flags);
        match rebuilt {
            Ok(instance) => {
                self.registry.replace(Arc::clone(&instance));
                info!(category = "modules", module = %name, ready = instance.is_ready(), "Module reloaded");
                self.activate(&instance);
                Ok(instance)
            }
            Err(e) => {
                self.registry.remove(name);
                warn!(category = "modules", module = %name, error = %e, "Reload failed, module detached");
                self.registry.record_failure(LoadFailure::new(unit, &e));
                Err(e)
            }
        }
    }

    fn rebuild(
        &self,
        current: &ModuleInstance,
        unit: &str,
        type_name: &str,
        manifest_path: &Path,
        flags: ModuleFlags,
    ) -> Result<Arc<ModuleInstance>, LoadError> {
        let manifest = read_manifest(unit, manifest_path, current.category())?;
        if manifest.name != current.name() {
            return Err(LoadError::InvalidManifest {
                unit: unit.to_string(),
                reason: format!("reload renamed `{}` to `{}`", current.name(), manifest.name),
            });
        }
        let constructor = self.catalog.get(type_name).cloned().ok_or_else(|| {
            LoadError::MissingImplementation {
                unit: unit.to_string(),
                type_name: type_name.to_string(),
            }
        })?;
        let module = instantiate(unit, &constructor)?;
        let source = ModuleSource::Unit {
            unit: unit.to_string(),
            type_name: type_name.to_string(),
            manifest_path: manifest_path.to_path_buf(),
        };
        self.build(manifest, source, module, flags)
    }

    fn attach_locked(
        &self,
        manifest: ExtensionManifest,
        source: ModuleSource,
        module: Box<dyn Module>,
        flags: ModuleFlags,
    ) -> Result<Arc<ModuleInstance>, LoadError> {
        if self.registry.contains(&manifest.name) {
            return Err(LoadError::DuplicateName {
                name: manifest.name,
                unit: source.unit().to_string(),
            });
        }
        let instance = self.build(manifest, source, module, flags)?;
        if let Err(e) = self.registry.insert(Arc::clone(&instance)) {
            shutdown_instance(&instance);
            return Err(e);
        }
        info!(
            category = "modules",
            module = %instance.name(),
            kind = %instance.category(),
            ready = instance.is_ready(),
            "Module attached"
        );
        self.activate(&instance);
        Ok(instance)
    }

    /// Context injection, flags, sync init and the action table.
    fn build(
        &self,
        manifest: ExtensionManifest,
        source: ModuleSource,
        mut module: Box<dyn Module>,
        flags: ModuleFlags,
    ) -> Result<Arc<ModuleInstance>, LoadError> {
        let unit = source.unit().to_string();
        manifest.validate().map_err(|e| LoadError::InvalidManifest {
            unit: unit.clone(),
            reason: e.to_string(),
        })?;

        let ctx = ModuleContext::new(&manifest.name, self.state.clone(), &self.registry, flags);
        catch_unwind(AssertUnwindSafe(|| {
            module.attach(ctx);
            module.on_flags(flags);
        }))
        .map_err(|payload| LoadError::Instantiation {
            unit: unit.clone(),
            reason: panic_message(payload.as_ref()),
        })?;

        let init = catch_unwind(AssertUnwindSafe(|| module.init()))
            .unwrap_or_else(|payload| Err(ModuleError::Panicked(panic_message(payload.as_ref()))));

        let module: Arc<dyn Module> = Arc::from(module);
        let actions = catch_unwind(AssertUnwindSafe(|| Arc::clone(&module).actions())).map_err(
            |payload| LoadError::Instantiation {
                unit: unit.clone(),
                reason: panic_message(payload.as_ref()),
            },
        )?;
        for declared in manifest.actions.iter().chain(&manifest.pulse) {
            if !actions.contains(declared) {
                warn!(category = "modules", module = %manifest.name, action = %declared, "Declared action has no implementation");
            }
        }

        let name = manifest.name.clone();
        let instance = Arc::new(ModuleInstance::new(manifest, module, actions, source, flags));
        match init {
            Ok(()) => instance.set_ready(true),
            Err(e) => {
                warn!(category = "modules", module = %name, error = %e, "Init failed, module left not ready");
                instance.record_init_error(&e);
            }
        }
        Ok(instance)
    }

    /// Post-registration steps: async initialize and the boot announcement.
    fn activate(&self, instance: &Arc<ModuleInstance>) {
        if instance.is_ready() {
            spawn_initialize(instance);
        }
        self.announce(instance);
    }

    fn announce(&self, instance: &ModuleInstance) {
        let Some(voice_name) = self.settings.voice_module.as_deref() else {
            return;
        };
        let Some(voice) = self.registry.get(voice_name) else {
            return;
        };
        if !voice.is_ready() {
            return;
        }
        let Some(action) = voice.action(&self.settings.announce_action).cloned() else {
            return;
        };

        let mut args = ActionArgs::new();
        args.insert("phrase_type".into(), json!("boot"));
        args.insert("module".into(), json!(instance.name()));
        args.insert("category".into(), json!(instance.category()));
        args.insert("ready".into(), json!(instance.is_ready()));

        let module = instance.name().to_string();
        match action {
            Action::Sync(f) => {
                if let Err(e) = run_sync(&f, args) {
                    debug!(category = "modules", module = %module, error = %e, "Boot announcement failed");
                }
            }
            Action::Async(f) => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    return;
                };
                let deadline = self.settings.action_timeout;
                runtime.spawn(async move {
                    if let Err(e) = run_async(f, args, deadline).await {
                        debug!(category = "modules", module = %module, error = %e, "Boot announcement failed");
                    }
                });
            }
        }
    }
}

fn instantiate(unit: &str, constructor: &ModuleConstructor) -> Result<Box<dyn Module>, LoadError> {
    match catch_unwind(AssertUnwindSafe(|| constructor())) {
        Ok(Ok(module)) => Ok(module),
        Ok(Err(e)) => Err(LoadError::Instantiation {
            unit: unit.to_string(),
            reason: e.to_string(),
        }),
        Err(payload) => Err(LoadError::Instantiation {
            unit: unit.to_string(),
            reason: panic_message(payload.as_ref()),
        }),
    }
}

fn spawn_initialize(instance: &Arc<ModuleInstance>) {
    let future = match catch_unwind(AssertUnwindSafe(|| Arc::clone(instance.module()).initialize())) {
        Ok(Some(future)) => future,
        Ok(None) => return,
        Err(payload) => {
            mark_init_failed(instance, &ModuleError::Panicked(panic_message(payload.as_ref())));
            return;
        }
    };
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!(category = "modules", module = %instance.name(), "No async runtime, async initialize skipped");
        return;
    };
    let instance = Arc::clone(instance);
    runtime.spawn(async move {
        let result = AssertUnwindSafe(future)
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(ModuleError::Panicked(panic_message(payload.as_ref()))));
        match result {
            Ok(()) => debug!(category = "modules", module = %instance.name(), "Async initialize complete"),
            Err(e) => mark_init_failed(&instance, &e),
        }
    });
}

fn mark_init_failed(instance: &ModuleInstance, error: &ModuleError) {
    warn!(category = "modules", module = %instance.name(), error = %error, "Async initialize failed, module marked not ready");
    instance.record_init_error(error);
    instance.set_ready(false);
}

pub(crate) fn shutdown_instance(instance: &ModuleInstance) {
    if catch_unwind(AssertUnwindSafe(|| instance.module().shutdown())).is_err() {
        warn!(category = "modules", module = %instance.name(), "Shutdown hook panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_discover_orders_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("zeta")).unwrap();
        fs::write(root.join("zeta").join(MANIFEST_FILE), "name = \"Zeta\"\nversion = \"1\"").unwrap();
        fs::create_dir_all(root.join("alpha")).unwrap();
        fs::create_dir_all(root.join("_private")).unwrap();
        fs::create_dir_all(root.join(".hidden")).unwrap();
        fs::write(root.join("mid.toml"), "name = \"Mid\"\nversion = \"1\"").unwrap();
        fs::write(root.join("notes.txt"), "ignored").unwrap();

        let units = discover(&ModuleRoot::addon(root)).unwrap();
        let names: Vec<&str> = units.iter().map(|u| u.unit.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
        assert!(units[0].manifest_path.is_none());
        assert!(units.iter().all(|u| u.category == ModuleCategory::Addon));
    }

    #[test]
    fn test_discover_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let err = discover(&ModuleRoot::builtin(dir.path().join("absent"))).unwrap_err();
        assert!(matches!(err, LoadError::UnreadableRoot { .. }));
    }

    #[test]
    fn test_read_manifest_stamps_category() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.toml");
        fs::write(&path, "name = \"M\"\nversion = \"1\"\ncategory = \"builtin\"").unwrap();
        let manifest = read_manifest("m", &path, ModuleCategory::Addon).unwrap();
        assert_eq!(manifest.category, ModuleCategory::Addon);

        fs::write(&path, "name = \"\"\nversion = \"1\"").unwrap();
        let err = read_manifest("m", &path, ModuleCategory::Addon).unwrap_err();
        assert!(matches!(err, LoadError::InvalidManifest { .. }));
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = OrchestratorConfig::default();
        config.voice_module = "  ".into();
        let settings = LoaderSettings::from(&config);
        assert!(settings.voice_module.is_none());
        assert_eq!(settings.announce_action, "say");
    }
}
