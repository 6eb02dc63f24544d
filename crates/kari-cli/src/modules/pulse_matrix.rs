//! Pulse Matrix: samples host vitals on every tick and publishes them under
//! the shared `vitals` key.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kari_core::prelude::*;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use sysinfo::{Components, System};
use tracing::{debug, info, warn};

pub const TYPE_NAME: &str = "PulseMatrix";

/// Temperature (°C) above which the host is considered hot.
const HOT_THRESHOLD: f32 = 82.0;
/// Temperature (°C) the host must drop below before hot is cleared.
const COOL_THRESHOLD: f32 = 75.0;

struct Sampler {
    system: System,
    components: Components,
    hot: bool,
}

pub struct PulseMatrix {
    ctx: Option<ModuleContext>,
    sampler: Mutex<Sampler>,
    debug: AtomicBool,
}

impl PulseMatrix {
    pub fn new() -> Self {
        Self {
            ctx: None,
            sampler: Mutex::new(Sampler {
                system: System::new(),
                components: Components::new_with_refreshed_list(),
                hot: false,
            }),
            debug: AtomicBool::new(false),
        }
    }

    fn context(&self) -> Result<&ModuleContext, ModuleError> {
        self.ctx
            .as_ref()
            .ok_or_else(|| ModuleError::NotReady("Pulse Matrix has no context".to_string()))
    }

    /// Take one reading of CPU, memory and the hottest sensor.
    fn sample(&self) -> Map<String, Value> {
        let mut sampler = self.sampler.lock();
        sampler.system.refresh_cpu_usage();
        sampler.system.refresh_memory();
        sampler.components.refresh();

        let cpu = f64::from(sampler.system.global_cpu_usage());
        let total = sampler.system.total_memory();
        let mem_usage = if total == 0 {
            0.0
        } else {
            sampler.system.used_memory() as f64 / total as f64 * 100.0
        };
        let temperature = sampler
            .components
            .list()
            .iter()
            .map(|c| c.temperature())
            .filter(|t| t.is_finite() && *t > 0.0)
            .fold(None, |hottest: Option<f32>, t| Some(hottest.map_or(t, |h| h.max(t))));

        if let Some(temp) = temperature {
            track_thermal(&mut sampler.hot, temp);
        }

        let mut readings = Map::new();
        readings.insert("cpu_usage".to_string(), json!(round1(cpu)));
        readings.insert("mem_usage".to_string(), json!(round1(mem_usage)));
        readings.insert("mem_free".to_string(), json!(round1(100.0 - mem_usage)));
        readings.insert(
            "temperature".to_string(),
            temperature.map_or(Value::Null, |t| json!(round1(f64::from(t)))),
        );
        readings
    }

    fn pulse(&self) -> ActionResult {
        let ctx = self.context()?;
        let readings = self.sample();
        if self.debug.load(Ordering::Relaxed) {
            let sampled = Value::Object(readings.clone());
            debug!(
                category = "vitals",
                module = %ctx.name(),
                tick = ctx.state().tick(),
                readings = %sampled,
                "Vitals sampled"
            );
        }
        ctx.state().publish_vitals(readings.clone());
        Ok(Value::Object(readings))
    }

    fn get_vitals(&self) -> ActionResult {
        let ctx = self.context()?;
        let vitals = ctx.state().vitals();
        if vitals.is_empty() {
            // Nothing published yet: sample now rather than answer empty.
            let readings = self.sample();
            ctx.state().publish_vitals(readings.clone());
            return Ok(Value::Object(readings));
        }
        Ok(Value::Object(vitals))
    }

    fn report_alive(&self) -> ActionResult {
        let ctx = self.context()?;
        info!(category = "vitals", module = %ctx.name(), "Online and monitoring system vitals");
        Ok(json!("Pulse Matrix online and monitoring system vitals."))
    }
}

impl Default for PulseMatrix {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for PulseMatrix {
    fn attach(&mut self, ctx: ModuleContext) {
        self.debug.store(ctx.flags().debug, Ordering::Relaxed);
        self.ctx = Some(ctx);
    }

    fn init(&mut self) -> Result<(), ModuleError> {
        // Prime the CPU counters; the first usage reading is always zero.
        self.sampler.get_mut().system.refresh_cpu_usage();
        let ctx = self.context()?;
        let _guard = ctx.span().enter();
        info!(category = "vitals", "Initializing vitals monitoring");
        Ok(())
    }

    fn actions(self: Arc<Self>) -> ActionTable {
        let pulse = Arc::clone(&self);
        let vitals = Arc::clone(&self);
        let alive = self;
        ActionTable::new()
            .sync("pulse", move |_| pulse.pulse())
            .sync("get_vitals", move |_| vitals.get_vitals())
            .sync("report_alive", move |_| alive.report_alive())
    }

    fn on_flags(&self, flags: ModuleFlags) {
        self.debug.store(flags.debug, Ordering::Relaxed);
    }
}

fn track_thermal(hot: &mut bool, temp: f32) {
    if !*hot && temp >= HOT_THRESHOLD {
        *hot = true;
        warn!(category = "vitals", temperature = temp, "Thermal threshold crossed");
    } else if *hot && temp <= COOL_THRESHOLD {
        *hot = false;
        info!(category = "vitals", temperature = temp, "Thermals back to normal");
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
