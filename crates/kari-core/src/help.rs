//! Help aggregation over the registry.

use std::fmt::Write;

use serde::Serialize;

use crate::registry::{ModuleInstance, Registry};

/// Control verbs understood by the orchestrator itself.
pub const CORE_COMMANDS: &[(&str, &str)] = &[
    ("help [Module [action]]", "List modules and actions, or describe one"),
    ("status", "Tick, uptime, flags and attached modules"),
    ("mods", "Attached modules with version and readiness"),
    ("call <Module> <action> [json|words]", "Invoke an exposed action"),
    ("debug [on|off|toggle]", "Show or change debug mode"),
    ("trace [on|off|toggle]", "Show or change trace mode"),
    ("snapshot", "One-line summary of vitals, modules and uptime"),
    ("health", "Load failures and modules that are not ready"),
    ("reload <Module>", "Re-attach a module from its manifest"),
    ("speak <text...>", "Say a line through the voice module"),
    ("phrase <type> [mood]", "Speak a phrase of the given type"),
    ("ping", "Liveness check"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HelpEntry {
    pub module: String,
    pub action: String,
    pub description: String,
}

/// Every exposed action, in load order then manifest order.
pub fn global_help(registry: &Registry) -> Vec<HelpEntry> {
    registry
        .snapshot()
        .iter()
        .flat_map(|instance| module_entries(instance))
        .collect()
}

/// Entries for one module, resolved by name or unambiguous alias.
pub fn module_help(registry: &Registry, name: &str) -> Option<Vec<HelpEntry>> {
    let instance = registry.resolve(name).ok().flatten()?;
    Some(module_entries(&instance))
}

pub fn module_entries(instance: &ModuleInstance) -> Vec<HelpEntry> {
    let manifest = instance.manifest();
    manifest
        .actions
        .iter()
        .map(|action| HelpEntry {
            module: manifest.name.clone(),
            action: action.clone(),
            description: manifest.description_for(action).unwrap_or_default().to_string(),
        })
        .collect()
}

pub fn render_global(entries: &[HelpEntry]) -> String {
    let mut out = String::from("Core commands:\n");
    for (usage, about) in CORE_COMMANDS {
        let _ = writeln!(out, "  {usage:<38} {about}");
    }
    if entries.is_empty() {
        out.push_str("\nNo module actions available.");
        return out;
    }

    out.push_str("\nModule actions:");
    let mut current: Option<&str> = None;
    for entry in entries {
        if current != Some(entry.module.as_str()) {
            let _ = write!(out, "\n  {}", entry.module);
            current = Some(entry.module.as_str());
        }
        if entry.description.is_empty() {
            let _ = write!(out, "\n    {}", entry.action);
        } else {
            let _ = write!(out, "\n    {:<20} {}", entry.action, entry.description);
        }
    }
    out
}

pub fn render_module(instance: &ModuleInstance) -> String {
    let manifest = instance.manifest();
    let mut out = format!("{} v{}", manifest.name, manifest.version);
    if let Some(description) = &manifest.description {
        let _ = write!(out, ": {description}");
    }
    if !manifest.aliases.is_empty() {
        let _ = write!(out, "\nAlso known as: {}", manifest.aliases.join(", "));
    }
    if let Some(notes) = manifest.module_notes() {
        let _ = write!(out, "\n{notes}");
    }
    if manifest.actions.is_empty() {
        out.push_str("\nNo exposed actions.");
        return out;
    }
    out.push_str("\nActions:");
    for action in &manifest.actions {
        let _ = write!(out, "\n  {action}");
        let aliases = manifest.aliases_for(action);
        if !aliases.is_empty() {
            let _ = write!(out, " ({})", aliases.join(", "));
        }
        if let Some(description) = manifest.description_for(action) {
            let _ = write!(out, ": {description}");
        }
    }
    out
}

/// Help for one action, accepting aliases and `-` for `_`.
pub fn render_action(instance: &ModuleInstance, requested: &str) -> Option<String> {
    let manifest = instance.manifest();
    let action = manifest.resolve_action(requested)?;
    let mut out = match manifest.description_for(action) {
        Some(text) => format!("{}.{action}: {text}", manifest.name),
        None => format!("{}.{action}: no description", manifest.name),
    };
    let aliases = manifest.aliases_for(action);
    if !aliases.is_empty() {
        let _ = write!(out, "\nAliases: {}", aliases.join(", "));
    }
    let _ = write!(out, "\nUsage: call \"{}\" {action} [json|words]", manifest.name);
    Some(out)
}
