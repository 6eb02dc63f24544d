//! Declarative module manifest.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ManifestError;

/// Help key holding module-level notes rather than an action description.
pub const MODULE_NOTES_KEY: &str = "_module";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleCategory {
    #[default]
    #[serde(alias = "internal")]
    Builtin,
    #[serde(alias = "prosthetic")]
    Addon,
}

impl ModuleCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::Addon => "addon",
        }
    }
}

impl fmt::Display for ModuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the orchestrator knows about a module before running any of
/// its code: identity, exposed actions, pulse hooks and help text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub category: ModuleCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Actions callable over the control socket, in declaration order.
    #[serde(default)]
    pub actions: Vec<String>,
    /// Actions invoked on every tick. They need not be listed in `actions`.
    #[serde(default)]
    pub pulse: Vec<String>,
    /// Alternative names the module can be addressed by.
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub action_aliases: BTreeMap<String, String>,
    #[serde(default)]
    pub help: BTreeMap<String, String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
}

impl ExtensionManifest {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            category: ModuleCategory::default(),
            description: None,
            author: None,
            actions: Vec::new(),
            pulse: Vec::new(),
            aliases: Vec::new(),
            action_aliases: BTreeMap::new(),
            help: BTreeMap::new(),
            capabilities: Vec::new(),
            resources: Vec::new(),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn with_category(mut self, category: ModuleCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actions = actions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_pulse<I, S>(mut self, pulse: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pulse = pulse.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_action_alias(mut self, alias: impl Into<String>, target: impl Into<String>) -> Self {
        self.action_aliases.insert(alias.into(), target.into());
        self
    }

    pub fn with_help(mut self, key: impl Into<String>, text: impl Into<String>) -> Self {
        self.help.insert(key.into(), text.into());
        self
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.name.trim().is_empty() {
            return Err(ManifestError::EmptyName);
        }
        if self.version.trim().is_empty() {
            return Err(ManifestError::EmptyVersion);
        }

        let mut seen = HashSet::new();
        for action in &self.actions {
            if action.trim().is_empty() {
                return Err(ManifestError::EmptyEntry("actions"));
            }
            if !seen.insert(action.as_str()) {
                return Err(ManifestError::DuplicateAction(action.clone()));
            }
        }
        if self.pulse.iter().any(|p| p.trim().is_empty()) {
            return Err(ManifestError::EmptyEntry("pulse"));
        }
        if self.aliases.iter().any(|a| a.trim().is_empty()) {
            return Err(ManifestError::EmptyEntry("aliases"));
        }
        for (alias, target) in &self.action_aliases {
            if alias.trim().is_empty() {
                return Err(ManifestError::EmptyEntry("action_aliases"));
            }
            if !self.exposes(target) {
                return Err(ManifestError::DanglingAlias {
                    alias: alias.clone(),
                    target: target.clone(),
                });
            }
        }
        Ok(())
    }

    /// True when `action` is listed in `actions` verbatim.
    pub fn exposes(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a == action)
    }

    /// Map a requested action name onto a declared one.
    ///
    /// Tries the name as given, then with `-` replaced by `_`, then a
    /// case-insensitive match, then `action_aliases`.
    pub fn resolve_action(&self, requested: &str) -> Option<&str> {
        let normalized = normalize_action(requested);
        for candidate in [requested, normalized.as_str()] {
            if let Some(found) = self.actions.iter().find(|a| a.as_str() == candidate) {
                return Some(found.as_str());
            }
        }
        if let Some(found) = self
            .actions
            .iter()
            .find(|a| a.eq_ignore_ascii_case(&normalized))
        {
            return Some(found.as_str());
        }
        let target = self
            .action_aliases
            .get(requested)
            .or_else(|| self.action_aliases.get(normalized.as_str()))?;
        self.actions.iter().find(|a| *a == target).map(String::as_str)
    }

    /// Aliases that point at `action`.
    pub fn aliases_for(&self, action: &str) -> Vec<&str> {
        self.action_aliases
            .iter()
            .filter(|(_, target)| target.as_str() == action)
            .map(|(alias, _)| alias.as_str())
            .collect()
    }

    pub fn description_for(&self, action: &str) -> Option<&str> {
        self.help.get(action).map(String::as_str)
    }

    pub fn module_notes(&self) -> Option<&str> {
        self.help.get(MODULE_NOTES_KEY).map(String::as_str)
    }

    pub fn answers_to(&self, name: &str) -> bool {
        self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

/// Normalise a user-supplied action name: trim and replace `-` with `_`.
pub fn normalize_action(name: &str) -> String {
    name.trim().replace('-', "_")
}
