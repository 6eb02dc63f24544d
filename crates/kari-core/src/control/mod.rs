//! Control channel: request parsing, verb dispatch and the Unix socket server.

pub mod protocol;
pub mod server;

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::ControlError;
use crate::help::{global_help, module_entries, render_action, render_global, render_module};
use crate::module::action::ActionArgs;
use crate::orchestrator::Orchestrator;
use crate::registry::{ModuleInstance, ModuleSummary};

pub use protocol::{Command, ControlRequest, ControlResponse, FlagSwitch};
pub use server::ControlServer;

/// Parse and execute one line. Never fails: errors become `ok: false`.
pub async fn handle_line(core: &Orchestrator, line: &str) -> ControlResponse {
    let outcome = match ControlRequest::parse(line) {
        Ok(request) => dispatch(core, request).await,
        Err(e) => Err(e),
    };
    if let Err(e) = &outcome {
        debug!(category = "control", kind = ?e.kind, error = %e.message, "Control request rejected");
    }
    outcome.into()
}

pub async fn dispatch(
    core: &Orchestrator,
    request: ControlRequest,
) -> Result<ControlResponse, ControlError> {
    match request.command {
        Command::Ping => Ok(ControlResponse::success(json!({"pong": true})).with_text("pong")),
        Command::Status => Ok(ControlResponse::success(core.status())),
        Command::Mods => Ok(mods(core)),
        Command::Health => Ok(ControlResponse::success(core.health())),
        Command::Snapshot => {
            let text = core.snapshot_text();
            Ok(ControlResponse::success(json!(text)).with_text(text))
        }
        Command::Help { module, action } => help(core, module.as_deref(), action.as_deref()),
        Command::Debug(switch) => {
            let on = match switch {
                Some(FlagSwitch::Toggle) => core.toggle_debug(),
                Some(switch) => core.set_debug(switch.apply(core.flags().debug)),
                None => core.flags().debug,
            };
            Ok(ControlResponse::success(json!({"debug": on})).with_text(format!("debug {}", on_off(on))))
        }
        Command::Trace(switch) => {
            let on = match switch {
                Some(FlagSwitch::Toggle) => core.toggle_trace(),
                Some(switch) => core.set_trace(switch.apply(core.flags().trace)),
                None => core.flags().trace,
            };
            Ok(ControlResponse::success(json!({"trace": on})).with_text(format!("trace {}", on_off(on))))
        }
        Command::Call {
            module,
            action,
            args,
        } => call(core, &module, &action, args).await,
        Command::Reload { module } => reload(core, &module),
        Command::Speak(text) => speak(core, &text).await,
        Command::Phrase { phrase_type, mood } => phrase(core, &phrase_type, mood.as_deref()).await,
        Command::FreeForm(text) => free_form(core, &text).await,
    }
}

/// Resolve by name or alias, mapping an ambiguous alias to `BadArguments`.
pub fn resolve_module(core: &Orchestrator, name: &str) -> Result<Arc<ModuleInstance>, ControlError> {
    match core.registry().resolve(name) {
        Ok(Some(instance)) => Ok(instance),
        Ok(None) => Err(ControlError::unknown_module(name)),
        Err(ambiguous) => Err(ControlError::bad_arguments(ambiguous.to_string())),
    }
}

fn mods(core: &Orchestrator) -> ControlResponse {
    let summaries: Vec<ModuleSummary> = core
        .registry()
        .snapshot()
        .iter()
        .map(|m| m.summary())
        .collect();
    let text = summaries
        .iter()
        .map(|m| {
            format!(
                "{} v{} [{}] {}",
                m.name,
                m.version,
                m.category,
                if m.ready { "ready" } else { "not ready" }
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    ControlResponse::success(json!(summaries)).with_text(text)
}

fn help(
    core: &Orchestrator,
    module: Option<&str>,
    action: Option<&str>,
) -> Result<ControlResponse, ControlError> {
    let Some(module) = module else {
        let entries = global_help(core.registry());
        let text = render_global(&entries);
        return Ok(ControlResponse::success(json!(entries)).with_text(text));
    };

    let instance = resolve_module(core, module)?;
    match action {
        None => {
            let entries = module_entries(&instance);
            Ok(ControlResponse::success(json!(entries)).with_text(render_module(&instance)))
        }
        Some(action) => {
            let manifest = instance.manifest();
            let canonical = manifest
                .resolve_action(action)
                .ok_or_else(|| ControlError::unknown_action(instance.name(), action))?;
            let result = json!({
                "module": instance.name(),
                "action": canonical,
                "description": manifest.description_for(canonical),
                "aliases": manifest.aliases_for(canonical),
            });
            let text = render_action(&instance, canonical).unwrap_or_default();
            Ok(ControlResponse::success(result).with_text(text))
        }
    }
}

async fn call(
    core: &Orchestrator,
    module: &str,
    action: &str,
    args: ActionArgs,
) -> Result<ControlResponse, ControlError> {
    let instance = resolve_module(core, module)?;
    // Only actions the manifest lists are reachable from the socket.
    let canonical = instance
        .manifest()
        .resolve_action(action)
        .ok_or_else(|| ControlError::unknown_action(instance.name(), action))?
        .to_string();
    let callable = instance.action(&canonical).cloned().ok_or_else(|| {
        ControlError::new(
            crate::error::ControlErrorKind::UnknownAction,
            format!("Module `{}` declares `{canonical}` but does not implement it", instance.name()),
        )
    })?;

    match callable
        .invoke(instance.name(), &canonical, args, core.config().action_timeout())
        .await
    {
        Ok(value) => Ok(respond_with(value)),
        Err(e) => {
            warn!(category = "control", module = %instance.name(), action = %canonical, error = %e, "Action failed");
            Err(ControlError::action_failed(format!("{}.{canonical}: {e}", instance.name())))
        }
    }
}

fn reload(core: &Orchestrator, module: &str) -> Result<ControlResponse, ControlError> {
    let name = resolve_module(core, module)?.name().to_string();
    let instance = core
        .reload(&name)
        .map_err(|e| ControlError::action_failed(e.to_string()))?;
    Ok(ControlResponse::success(json!({
        "reloaded": instance.name(),
        "ready": instance.is_ready(),
    }))
    .with_text(format!("{} reloaded", instance.name())))
}

/// The configured voice module, provided it is attached and ready.
fn voice(core: &Orchestrator) -> Result<Arc<ModuleInstance>, ControlError> {
    let name = core.config().voice_module.trim();
    let not_ready = || {
        let label = if name.is_empty() { "Voice module" } else { name };
        ControlError::action_failed(format!("{label} not ready"))
    };
    if name.is_empty() {
        return Err(not_ready());
    }
    core.registry()
        .resolve(name)
        .ok()
        .flatten()
        .filter(|m| m.is_ready())
        .ok_or_else(not_ready)
}

/// Run the voice module's announce action with `args`.
async fn voice_say(core: &Orchestrator, args: ActionArgs) -> Result<Value, ControlError> {
    let instance = voice(core)?;
    let action = &core.config().announce_action;
    let callable = instance.action(action).cloned().ok_or_else(|| {
        ControlError::unknown_action(instance.name(), action)
    })?;
    callable
        .invoke(instance.name(), action, args, core.config().action_timeout())
        .await
        .map_err(|e| {
            warn!(category = "control", module = %instance.name(), action = %action, error = %e, "Voice action failed");
            ControlError::action_failed(format!("{}.{action}: {e}", instance.name()))
        })
}

async fn speak(core: &Orchestrator, text: &str) -> Result<ControlResponse, ControlError> {
    let mut args = ActionArgs::new();
    args.insert("text".into(), json!(text));
    let spoken = voice_say(core, args).await?;
    let line = spoken.as_str().unwrap_or(text).to_string();
    Ok(ControlResponse::success(json!({"spoken": true, "text": line})).with_text(line))
}

async fn phrase(
    core: &Orchestrator,
    phrase_type: &str,
    mood: Option<&str>,
) -> Result<ControlResponse, ControlError> {
    let mut args = ActionArgs::new();
    args.insert("phrase_type".into(), json!(phrase_type));
    if let Some(mood) = mood {
        args.insert("mood".into(), json!(mood));
    }
    let spoken = voice_say(core, args).await?;
    let line = spoken.as_str().map(str::to_owned);
    let response = ControlResponse::success(json!({
        "phrase": phrase_type,
        "mood": mood,
        "text": spoken,
    }));
    Ok(match line {
        Some(line) => response.with_text(line),
        None => response,
    })
}

/// Hand a free-form line to the configured default handler.
async fn free_form(core: &Orchestrator, text: &str) -> Result<ControlResponse, ControlError> {
    let handler = &core.config().default_handler;
    let verb = text.split_whitespace().next().unwrap_or_default();
    let unknown = || ControlError::unknown_command(format!("Unknown command: `{verb}`"));

    let instance = core
        .registry()
        .resolve(&handler.module)
        .ok()
        .flatten()
        .filter(|m| m.is_ready())
        .ok_or_else(unknown)?;
    let callable = instance.action(&handler.action).cloned().ok_or_else(unknown)?;

    let mut args = ActionArgs::new();
    args.insert("text".into(), json!(text));
    callable
        .invoke(instance.name(), &handler.action, args, core.config().action_timeout())
        .await
        .map(respond_with)
        .map_err(|e| ControlError::action_failed(format!("{}.{}: {e}", instance.name(), handler.action)))
}

/// String results double as the response text.
fn respond_with(value: Value) -> ControlResponse {
    match value.as_str().map(str::to_owned) {
        Some(text) => ControlResponse::success(value).with_text(text),
        None => ControlResponse::success(value),
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}
