//! Voice Box: turns phrase requests into spoken log lines and answers
//! free-form text sent to the control socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use kari_core::prelude::*;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{debug, info, Instrument};

pub const TYPE_NAME: &str = "VoiceBox";

const PHRASES: &[(&str, &[&str])] = &[
    (
        "boot",
        &[
            "{module} is online.",
            "{module} reporting in.",
            "{module} attached and listening.",
        ],
    ),
    ("greeting", &["Hey. I'm here.", "Hello. All systems nominal."]),
    (
        "status",
        &["Running. CPU {cpu}%, memory {mem}%, tick {tick}."],
    ),
    (
        "fallback",
        &[
            "I heard \"{text}\" but nothing here handles that.",
            "\"{text}\"? Try `help`.",
        ],
    ),
];

const GREETINGS: &[&str] = &["hi", "hello", "hey", "yo"];

pub struct VoiceBox {
    ctx: Option<ModuleContext>,
    /// Next line to use per phrase type, so consecutive lines differ.
    rotation: Mutex<HashMap<String, usize>>,
    online: AtomicBool,
    debug: AtomicBool,
}

impl VoiceBox {
    pub fn new() -> Self {
        Self {
            ctx: None,
            rotation: Mutex::new(HashMap::new()),
            online: AtomicBool::new(false),
            debug: AtomicBool::new(false),
        }
    }

    fn context(&self) -> Result<&ModuleContext, ModuleError> {
        self.ctx
            .as_ref()
            .ok_or_else(|| ModuleError::NotReady("Voice Box has no context".to_string()))
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Pick the next line for `phrase_type`, rotating through its variants.
    fn phrase(&self, phrase_type: &str) -> Option<&'static str> {
        let (_, lines) = PHRASES.iter().find(|(kind, _)| *kind == phrase_type)?;
        let mut rotation = self.rotation.lock();
        let next = rotation.entry(phrase_type.to_string()).or_insert(0);
        let line = lines[*next % lines.len()];
        *next = next.wrapping_add(1);
        Some(line)
    }

    /// Placeholders drawn from the shared vitals and tick.
    fn placeholders(&self, ctx: &ModuleContext, args: &ActionArgs) -> HashMap<String, String> {
        let mut values = HashMap::new();
        let vitals = ctx.state().vitals();
        for (key, name) in [("cpu_usage", "cpu"), ("mem_usage", "mem"), ("temperature", "temp")] {
            let reading = vitals
                .get(key)
                .and_then(Value::as_f64)
                .map_or_else(|| "n/a".to_string(), |v| format!("{v:.0}"));
            values.insert(name.to_string(), reading);
        }
        values.insert("tick".to_string(), ctx.state().tick().to_string());
        for (key, value) in args {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            values.insert(key.clone(), text);
        }
        values
    }

    fn speak(&self, ctx: &ModuleContext, line: &str) -> String {
        let _guard = ctx.span().enter();
        info!(category = "voice", "{}", line);
        line.to_string()
    }

    fn say(&self, args: ActionArgs) -> ActionResult {
        let ctx = self.context()?;
        let line = match args.get("text").and_then(Value::as_str) {
            Some(text) if !text.trim().is_empty() => text.trim().to_string(),
            _ => {
                let phrase_type = args
                    .get("phrase_type")
                    .and_then(Value::as_str)
                    .unwrap_or("boot");
                let template = self.phrase(phrase_type).ok_or_else(|| {
                    ModuleError::bad_arguments(format!("Unknown phrase type: {phrase_type}"))
                })?;
                fill(template, &self.placeholders(ctx, &args))
            }
        };
        if self.debug.load(Ordering::Relaxed) {
            let args = Value::Object(args);
            debug!(category = "voice", args = %args, "say");
        }
        Ok(Value::String(self.speak(ctx, &line)))
    }

    fn respond(&self, args: ActionArgs) -> ActionResult {
        let ctx = self.context()?;
        let text = args
            .get("text")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ModuleError::bad_arguments("respond needs a non-empty `text`"))?;

        let first = text
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_ascii_lowercase();
        let phrase_type = if GREETINGS.contains(&first.as_str()) {
            "greeting"
        } else if text.to_ascii_lowercase().contains("status") {
            "status"
        } else {
            "fallback"
        };

        let template = self
            .phrase(phrase_type)
            .ok_or_else(|| ModuleError::failed(format!("No phrases for {phrase_type}")))?;
        let line = fill(template, &self.placeholders(ctx, &args));
        Ok(Value::String(self.speak(ctx, &line)))
    }

    fn list_phrases(&self) -> ActionResult {
        let table: Map<String, Value> = PHRASES
            .iter()
            .map(|(kind, lines)| (kind.to_string(), json!(lines)))
            .collect();
        Ok(Value::Object(table))
    }
}

impl Default for VoiceBox {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for VoiceBox {
    fn attach(&mut self, ctx: ModuleContext) {
        self.debug.store(ctx.flags().debug, Ordering::Relaxed);
        self.ctx = Some(ctx);
    }

    fn initialize(self: Arc<Self>) -> Option<BoxFuture<'static, Result<(), ModuleError>>> {
        let span = self.ctx.as_ref()?.span().clone();
        Some(
            async move {
                // Let the boot sequence finish before going online.
                tokio::task::yield_now().await;
                self.online.store(true, Ordering::Release);
                info!(category = "voice", phrases = PHRASES.len(), "Voice online");
                Ok(())
            }
            .instrument(span)
            .boxed(),
        )
    }

    fn actions(self: Arc<Self>) -> ActionTable {
        let say = Arc::clone(&self);
        let respond = Arc::clone(&self);
        let phrases = self;
        ActionTable::new()
            .sync("say", move |args| say.say(args))
            .sync("respond", move |args| respond.respond(args))
            .sync("list_phrases", move |_| phrases.list_phrases())
    }

    fn on_flags(&self, flags: ModuleFlags) {
        self.debug.store(flags.debug, Ordering::Relaxed);
    }

    fn shutdown(&self) {
        self.online.store(false, Ordering::Release);
        if let Some(ctx) = &self.ctx {
            self.speak(ctx, "Voice going quiet.");
        }
    }
}

/// Replace `{key}` placeholders; unknown keys are left as written.
fn fill(template: &str, values: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match values.get(key) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
