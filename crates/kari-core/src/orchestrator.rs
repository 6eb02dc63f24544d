//! The orchestrator: owns the registry, shared state, loader and pulse, and
//! runs the control server until asked to stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tracing::info;

use crate::config::OrchestratorConfig;
use crate::control::{self, ControlResponse, ControlServer};
use crate::error::{CoreError, LoadError};
use crate::loader::{shutdown_instance, LoadReport, LoaderSettings, ModuleLoader, ModuleRoot};
use crate::module::catalog::ModuleCatalog;
use crate::module::manifest::{ExtensionManifest, ModuleCategory};
use crate::module::{Module, ModuleFlags};
use crate::pulse::{PulseDispatcher, TickReport};
use crate::registry::{ModuleInstance, ModuleSource, Registry};
use crate::state::SharedState;

pub struct Orchestrator {
    config: OrchestratorConfig,
    state: SharedState,
    registry: Arc<Registry>,
    loader: ModuleLoader,
    pulse: Arc<PulseDispatcher>,
    debug: AtomicBool,
    trace: AtomicBool,
    booted_at: DateTime<Utc>,
    started: Instant,
    shutdown: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, catalog: ModuleCatalog) -> Arc<Self> {
        let state = SharedState::new();
        let registry = Arc::new(Registry::new());
        let booted_at = Utc::now();
        state.set_boot_time(booted_at);

        let loader = ModuleLoader::new(
            Arc::clone(&registry),
            state.clone(),
            catalog,
            LoaderSettings::from(&config),
        );
        let pulse = Arc::new(
            PulseDispatcher::new(Arc::clone(&registry), state.clone())
                .with_action_timeout(config.action_timeout()),
        );
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            debug: AtomicBool::new(config.debug),
            trace: AtomicBool::new(config.trace),
            config,
            state,
            registry,
            loader,
            pulse,
            booted_at,
            started: Instant::now(),
            shutdown,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn pulse(&self) -> &Arc<PulseDispatcher> {
        &self.pulse
    }

    pub fn loader(&self) -> &ModuleLoader {
        &self.loader
    }

    pub fn booted_at(&self) -> DateTime<Utc> {
        self.booted_at
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn flags(&self) -> ModuleFlags {
        ModuleFlags {
            debug: self.debug.load(Ordering::SeqCst),
            trace: self.trace.load(Ordering::SeqCst),
        }
    }

    /// Set debug mode and push it to every attached module.
    pub fn set_debug(&self, on: bool) -> bool {
        let previous = self.debug.swap(on, Ordering::SeqCst);
        if previous != on {
            info!(category = "core", debug = on, "Debug mode changed");
        }
        self.propagate_flags();
        on
    }

    /// Set trace mode and push it to every attached module.
    pub fn set_trace(&self, on: bool) -> bool {
        let previous = self.trace.swap(on, Ordering::SeqCst);
        if previous != on {
            info!(category = "core", trace = on, "Trace mode changed");
        }
        self.propagate_flags();
        on
    }

    /// Flip debug mode atomically and push it to every module. Returns the
    /// new value.
    pub fn toggle_debug(&self) -> bool {
        let on = !self.debug.fetch_xor(true, Ordering::SeqCst);
        info!(category = "core", debug = on, "Debug mode changed");
        self.propagate_flags();
        on
    }

    /// Flip trace mode atomically and push it to every module.
    pub fn toggle_trace(&self) -> bool {
        let on = !self.trace.fetch_xor(true, Ordering::SeqCst);
        info!(category = "core", trace = on, "Trace mode changed");
        self.propagate_flags();
        on
    }

    fn propagate_flags(&self) {
        let flags = self.flags();
        for instance in self.registry.snapshot() {
            instance.apply_flags(flags);
        }
    }

    /// Attach a module built by the host before scanning. A scanned unit
    /// named `unit` is then skipped.
    pub fn attach_preloaded(
        &self,
        unit: &str,
        manifest: ExtensionManifest,
        module: Box<dyn Module>,
    ) -> Result<Arc<ModuleInstance>, LoadError> {
        let source = ModuleSource::Preloaded {
            unit: unit.to_string(),
        };
        self.loader.attach(manifest, source, module, self.flags())
    }

    /// Scan the configured built-in and add-on roots.
    pub fn load_modules(&self) -> Result<LoadReport, LoadError> {
        self.load_roots(&self.config.module_roots())
    }

    pub fn load_roots(&self, roots: &[ModuleRoot]) -> Result<LoadReport, LoadError> {
        let report = self.loader.load_all(roots, self.flags())?;
        self.log_summary();
        Ok(report)
    }

    pub fn reload(&self, name: &str) -> Result<Arc<ModuleInstance>, LoadError> {
        self.loader.reload(name, self.flags())
    }

    pub fn detach(&self, name: &str) -> Option<Arc<ModuleInstance>> {
        self.loader.detach(name)
    }

    /// Run one pulse tick now.
    pub fn tick(&self) -> TickReport {
        self.pulse.tick()
    }

    /// Execute one control line.
    pub async fn execute(&self, line: &str) -> ControlResponse {
        control::handle_line(self, line).await
    }

    pub fn log_summary(&self) {
        let modules = self.registry.snapshot();
        for category in [ModuleCategory::Builtin, ModuleCategory::Addon] {
            let names: Vec<&str> = modules
                .iter()
                .filter(|m| m.category() == category)
                .map(|m| m.name())
                .collect();
            info!(
                category = "modules",
                kind = %category,
                count = names.len(),
                modules = %names.join(", "),
                "Modules loaded"
            );
        }
        let ready = modules.iter().filter(|m| m.is_ready()).count();
        info!(
            category = "modules",
            ready,
            total = modules.len(),
            failures = self.registry.failures().len(),
            "{}/{} modules responsive",
            ready,
            modules.len()
        );
    }

    pub fn status(&self) -> Value {
        let flags = self.flags();
        let modules = self.registry.snapshot();
        let by_category = |category: ModuleCategory| {
            modules
                .iter()
                .filter(|m| m.category() == category)
                .map(|m| m.name())
                .collect::<Vec<_>>()
        };
        json!({
            "status": "running",
            "tick": self.pulse.tick_count(),
            "uptime_secs": self.uptime().as_secs(),
            "boot_time": self.booted_at.to_rfc3339(),
            "debug": flags.debug,
            "trace": flags.trace,
            "modules": modules.iter().map(|m| m.name()).collect::<Vec<_>>(),
            "builtin": by_category(ModuleCategory::Builtin),
            "addon": by_category(ModuleCategory::Addon),
            "vitals": self.state.vitals(),
            "disk_usage": self.state.disk_usage().map(|usage| json!({
                "used_bytes": usage.used_bytes,
                "total_bytes": usage.total_bytes,
                "percent": (usage.percent() * 10.0).round() / 10.0,
                "summary": usage.summary(),
            })),
        })
    }

    pub fn health(&self) -> Value {
        let not_ready: Vec<Value> = self
            .registry
            .snapshot()
            .iter()
            .filter(|m| !m.is_ready())
            .map(|m| json!({"name": m.name(), "error": m.init_error()}))
            .collect();
        json!({
            "failures": self.registry.failures(),
            "not_ready": not_ready,
        })
    }

    /// One-line summary of vitals, module counts, uptime and tick.
    pub fn snapshot_text(&self) -> String {
        let vitals = self.state.vitals();
        let modules = self.registry.snapshot();
        let online = |category: ModuleCategory| {
            modules
                .iter()
                .filter(|m| m.category() == category && m.is_ready())
                .count()
        };
        let disk = self
            .state
            .disk_usage()
            .map_or_else(|| "n/a".to_string(), |usage| usage.summary());
        format!(
            "Vitals: CPU {}, MEM {}, TEMP {}, DISK {}. Modules online: {} builtin / {} addon. Uptime: {}s. Tick: {}.",
            reading(&vitals, "cpu_usage", "%"),
            reading(&vitals, "mem_usage", "%"),
            reading(&vitals, "temperature", "°C"),
            disk,
            online(ModuleCategory::Builtin),
            online(ModuleCategory::Addon),
            self.uptime().as_secs(),
            self.pulse.tick_count(),
        )
    }

    /// Start the pulse and the control server, then wait for
    /// [`request_shutdown`](Self::request_shutdown).
    pub async fn run(self: Arc<Self>) -> Result<(), CoreError> {
        let server = if self.config.socket.enabled {
            let server = ControlServer::bind(&self.config.socket)?;
            info!(category = "control", path = %server.path().display(), "Control socket listening");
            let stop = wait_for_shutdown(self.shutdown.subscribe());
            Some(tokio::spawn(server.serve(Arc::clone(&self), stop)))
        } else {
            info!(category = "control", "Control socket disabled");
            None
        };

        self.pulse.start(self.config.pulse_interval());
        info!(
            category = "core",
            interval_secs = self.config.pulse_interval_secs,
            modules = self.registry.len(),
            "Orchestrator running"
        );

        wait_for_shutdown(self.shutdown.subscribe()).await;
        info!(category = "core", "Shutting down");

        self.pulse.stop().await;
        if let Some(server) = server {
            let _ = server.await;
        }
        self.shutdown_modules();
        Ok(())
    }

    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Run every module's shutdown hook, newest first.
    pub fn shutdown_modules(&self) {
        for instance in self.registry.snapshot().iter().rev() {
            shutdown_instance(instance);
        }
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn reading(vitals: &Map<String, Value>, key: &str, unit: &str) -> String {
    match vitals.get(key).and_then(Value::as_f64) {
        Some(value) => format!("{value:.1}{unit}"),
        None => "n/a".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> Arc<Orchestrator> {
        Orchestrator::new(OrchestratorConfig::default(), ModuleCatalog::new())
    }

    #[test]
    fn test_new_publishes_boot_time() {
        let core = core();
        let stored = core.state().boot_time().unwrap();
        assert_eq!(stored.timestamp(), core.booted_at().timestamp());
        assert_eq!(core.state().tick(), 0);
    }

    #[test]
    fn test_flags_start_from_config() {
        let config = OrchestratorConfig {
            debug: true,
            ..Default::default()
        };
        let core = Orchestrator::new(config, ModuleCatalog::new());
        assert_eq!(core.flags(), ModuleFlags { debug: true, trace: false });
        core.set_trace(true);
        core.set_debug(false);
        assert_eq!(core.flags(), ModuleFlags { debug: false, trace: true });
    }

    #[test]
    fn test_concurrent_toggles_are_not_lost() {
        let core = core();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let core = Arc::clone(&core);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        core.toggle_debug();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        // 200 flips land back where they started.
        assert!(!core.flags().debug);
        assert!(core.toggle_trace());
        assert!(!core.toggle_trace());
    }

    #[test]
    fn test_status_tick_ignores_module_writes() {
        let core = core();
        core.tick();
        core.tick();
        assert!(!core.state().set("tick", "x"));
        assert_eq!(core.status()["tick"], 2);
        assert!(core.snapshot_text().ends_with("Tick: 2."));
    }

    #[test]
    fn test_status_reports_disk_usage_after_housekeeping() {
        let core = core();
        assert!(core.status()["disk_usage"].is_null());
        core.state().publish_disk_usage(&crate::state::DiskUsage {
            used_bytes: 3 * 1024 * 1024 * 1024,
            total_bytes: 4 * 1024 * 1024 * 1024,
        });
        let status = core.status();
        assert_eq!(status["disk_usage"]["percent"], 75.0);
        assert_eq!(status["disk_usage"]["summary"], "3GB used / 4GB");
        assert!(core.snapshot_text().contains("DISK 3GB used / 4GB."));
    }

    #[test]
    fn test_snapshot_text_without_vitals() {
        let core = core();
        core.tick();
        let text = core.snapshot_text();
        assert!(text.starts_with("Vitals: CPU n/a, MEM n/a, TEMP n/a, DISK n/a."));
        assert!(text.contains("Modules online: 0 builtin / 0 addon."));
        assert!(text.ends_with("Tick: 1."));
    }

    #[test]
    fn test_snapshot_text_formats_vitals() {
        let core = core();
        let mut vitals = Map::new();
        vitals.insert("cpu_usage".into(), json!(12.345));
        vitals.insert("mem_usage".into(), json!(50));
        core.state().publish_vitals(vitals);
        let text = core.snapshot_text();
        assert!(text.contains("CPU 12.3%, MEM 50.0%, TEMP n/a"));
    }

    #[tokio::test]
    async fn test_run_without_socket_stops_on_request() {
        let config = OrchestratorConfig {
            pulse_interval_secs: 0.01,
            socket: crate::config::SocketConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let core = Orchestrator::new(config, ModuleCatalog::new());
        let runner = tokio::spawn(Arc::clone(&core).run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        core.request_shutdown();
        runner.await.unwrap().unwrap();
        assert!(core.state().tick() >= 1);
        assert!(!core.pulse().is_running());
    }
}
