//! Periodic heartbeat that drives every module's pulse actions.
//!
//! One tick: bump the counter, publish it to shared state, then walk the
//! registry in load order and invoke each module's pulse actions. Sync
//! actions run inline, async actions are spawned and never awaited by the
//! tick. Any failure is logged and the tick carries on.
//!
//! Every [`DISK_USAGE_EVERY`] ticks the dispatcher also refreshes the
//! `disk_usage` state key before running module actions.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::Disks;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::module::action::{run_async, run_sync, warn_if_overrun, Action, ActionArgs};
use crate::registry::Registry;
use crate::state::{DiskUsage, SharedState};

/// A "pulse verified" debug record is emitted every this many ticks.
pub const PULSE_LOG_EVERY: u64 = 100;
/// Disk usage is refreshed every this many ticks.
pub const DISK_USAGE_EVERY: u64 = 20;

/// Reads root filesystem usage. `None` when it cannot be determined.
pub type DiskSampler = Arc<dyn Fn() -> Option<DiskUsage> + Send + Sync>;

/// Usage of the filesystem mounted at `/`, or of the largest disk when no
/// root mount is listed.
pub fn root_disk_usage() -> Option<DiskUsage> {
    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .list()
        .iter()
        .find(|d| d.mount_point() == Path::new("/"))
        .or_else(|| disks.list().iter().max_by_key(|d| d.total_space()))?;
    let total_bytes = disk.total_space();
    Some(DiskUsage {
        used_bytes: total_bytes.saturating_sub(disk.available_space()),
        total_bytes,
    })
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub tick: u64,
    /// Sync actions run to completion
    pub invoked: usize,
    /// Async actions handed to the runtime
    pub spawned: usize,
    /// Sync actions that returned an error or panicked
    pub failed: usize,
    /// Declared pulse names with no implementation
    pub skipped: usize,
}

pub struct PulseDispatcher {
    registry: Arc<Registry>,
    state: SharedState,
    counter: AtomicU64,
    action_timeout: Option<Duration>,
    running: AtomicBool,
    task_handle: Mutex<Option<JoinHandle<()>>>,
    disk_sampler: DiskSampler,
}

impl fmt::Debug for PulseDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PulseDispatcher")
            .field("ticks", &self.tick_count())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl PulseDispatcher {
    pub fn new(registry: Arc<Registry>, state: SharedState) -> Self {
        Self {
            registry,
            state,
            counter: AtomicU64::new(0),
            action_timeout: None,
            running: AtomicBool::new(false),
            task_handle: Mutex::new(None),
            disk_sampler: Arc::new(root_disk_usage),
        }
    }

    /// Replace the disk usage reader used by housekeeping.
    pub fn with_disk_sampler<F>(mut self, sampler: F) -> Self
    where
        F: Fn() -> Option<DiskUsage> + Send + Sync + 'static,
    {
        self.disk_sampler = Arc::new(sampler);
        self
    }

    pub fn with_action_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.action_timeout = timeout;
        self
    }

    /// Ticks completed so far.
    pub fn tick_count(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Run one tick.
    ///
    /// Async pulse actions are spawned on the current tokio runtime; outside
    /// a runtime they are counted as failed.
    pub fn tick(&self) -> TickReport {
        let tick = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.publish_tick(tick);
        if tick % PULSE_LOG_EVERY == 0 {
            debug!(category = "pulse", tick, modules = self.registry.len(), "System pulse verified");
        }
        if tick % DISK_USAGE_EVERY == 0 {
            self.refresh_disk_usage(tick);
        }

        let mut report = TickReport {
            tick,
            ..Default::default()
        };
        for instance in self.registry.snapshot() {
            for name in &instance.manifest().pulse {
                let Some(action) = instance.action(name) else {
                    report.skipped += 1;
                    continue;
                };
                match action {
                    Action::Sync(f) => {
                        report.invoked += 1;
                        let started = Instant::now();
                        if let Err(e) = run_sync(f, ActionArgs::new()) {
                            report.failed += 1;
                            warn!(category = "pulse", module = %instance.name(), action = %name, tick, error = %e, "Pulse action failed");
                        }
                        warn_if_overrun(instance.name(), name, started, self.action_timeout);
                    }
                    Action::Async(f) => {
                        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                            report.failed += 1;
                            warn!(category = "pulse", module = %instance.name(), action = %name, "No async runtime for pulse action");
                            continue;
                        };
                        report.spawned += 1;
                        let f = f.clone();
                        let module = instance.name().to_string();
                        let action = name.clone();
                        let deadline = self.action_timeout;
                        runtime.spawn(async move {
                            if let Err(e) = run_async(f, ActionArgs::new(), deadline).await {
                                warn!(category = "pulse", module = %module, action = %action, tick, error = %e, "Async pulse action failed");
                            }
                        });
                    }
                }
            }
        }
        report
    }

    fn refresh_disk_usage(&self, tick: u64) {
        let sampler = Arc::clone(&self.disk_sampler);
        match catch_unwind(AssertUnwindSafe(|| sampler())) {
            Ok(Some(usage)) => self.state.publish_disk_usage(&usage),
            Ok(None) => debug!(category = "pulse", tick, "Disk usage unavailable"),
            Err(_) => warn!(category = "pulse", tick, "Disk usage sampler panicked"),
        }
    }

    /// Start ticking every `interval`. The first tick fires immediately.
    /// Does nothing if already running.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                this.tick();
            }
        });
        *self.task_handle.lock() = Some(handle);
    }

    /// Stop the timer. In-flight async actions are left to finish.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.task_handle.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
