//! Explicit table of module implementations the loader may instantiate.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::Module;
use crate::error::ModuleError;

pub type ModuleConstructor = Arc<dyn Fn() -> Result<Box<dyn Module>, ModuleError> + Send + Sync>;

/// Maps canonical type names (`VoiceBox`) to constructors. A discovered unit
/// `voice_box` is instantiated through the `VoiceBox` entry.
#[derive(Clone, Default)]
pub struct ModuleCatalog {
    constructors: BTreeMap<String, ModuleConstructor>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor, replacing any previous entry for `type_name`.
    pub fn register<F>(&mut self, type_name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn() -> Result<Box<dyn Module>, ModuleError> + Send + Sync + 'static,
    {
        self.constructors.insert(type_name.into(), Arc::new(constructor));
        self
    }

    pub fn with<F>(mut self, type_name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn() -> Result<Box<dyn Module>, ModuleError> + Send + Sync + 'static,
    {
        self.register(type_name, constructor);
        self
    }

    pub fn get(&self, type_name: &str) -> Option<&ModuleConstructor> {
        self.constructors.get(type_name)
    }

    /// Constructor for a unit directory/file name.
    pub fn for_unit(&self, unit: &str) -> Option<&ModuleConstructor> {
        self.get(&canonical_type_name(unit))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.constructors.contains_key(type_name)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

impl fmt::Debug for ModuleCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.constructors.keys()).finish()
    }
}

/// `voice_box` → `VoiceBox`, `llm-bridge` → `LlmBridge`.
pub fn canonical_type_name(unit: &str) -> String {
    unit.split(|c: char| c == '_' || c == '-')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::action::ActionTable;

    struct Nop;

    impl Module for Nop {
        fn actions(self: Arc<Self>) -> ActionTable {
            ActionTable::new()
        }
    }

    #[test]
    fn test_canonical_type_name() {
        assert_eq!(canonical_type_name("voice_box"), "VoiceBox");
        assert_eq!(canonical_type_name("pulse_matrix"), "PulseMatrix");
        assert_eq!(canonical_type_name("LLM_bridge"), "LlmBridge");
        assert_eq!(canonical_type_name("net-scan"), "NetScan");
        assert_eq!(canonical_type_name("single"), "Single");
    }

    #[test]
    fn test_register_and_lookup() {
        let catalog = ModuleCatalog::new().with("VoiceBox", || Ok(Box::new(Nop)));
        assert!(catalog.contains("VoiceBox"));
        assert!(catalog.for_unit("voice_box").is_some());
        assert!(catalog.for_unit("pulse_matrix").is_none());
        let build = catalog.get("VoiceBox").unwrap();
        assert!(build().is_ok());
    }
}
