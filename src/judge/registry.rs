use crate::config::types::{ExecutionError, Result};
use crate::judge::adapter::LanguageAdapter;
use crate::judge::languages::{
    java::JavaAdapter, javascript::JavaScriptAdapter, native::NativeAdapter, python::PythonAdapter,
    ruby::RubyAdapter, scripting::ScriptAdapter,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Language identifier (or alias) to adapter lookup. Built once at startup.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn LanguageAdapter>>,
    index: HashMap<String, usize>,
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every language shipped with the runner.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        let adapters: [Arc<dyn LanguageAdapter>; 8] = [
            Arc::new(PythonAdapter),
            Arc::new(JavaScriptAdapter),
            Arc::new(RubyAdapter),
            Arc::new(ScriptAdapter::php()),
            Arc::new(ScriptAdapter::perl()),
            Arc::new(NativeAdapter::C),
            Arc::new(NativeAdapter::Cpp),
            Arc::new(JavaAdapter),
        ];
        for adapter in adapters {
            // Built-in names are distinct.
            let _ = registry.register(adapter);
        }
        registry
    }

    /// Add an adapter. Fails if its name or an alias is already taken.
    pub fn register(&mut self, adapter: Arc<dyn LanguageAdapter>) -> Result<()> {
        let names: Vec<String> = std::iter::once(adapter.language())
            .chain(adapter.aliases().iter().copied())
            .map(str::to_ascii_lowercase)
            .collect();
        if let Some(taken) = names.iter().find(|n| self.index.contains_key(*n)) {
            return Err(ExecutionError::Config(format!(
                "language identifier {taken:?} is already registered"
            )));
        }
        let slot = self.adapters.len();
        self.adapters.push(adapter);
        for name in names {
            self.index.insert(name, slot);
        }
        Ok(())
    }

    /// Case-insensitive lookup by identifier or alias.
    pub fn resolve(&self, language: &str) -> Result<Arc<dyn LanguageAdapter>> {
        self.index
            .get(&language.trim().to_ascii_lowercase())
            .map(|slot| Arc::clone(&self.adapters[*slot]))
            .ok_or_else(|| ExecutionError::UnsupportedLanguage(language.to_string()))
    }

    pub fn adapters(&self) -> impl Iterator<Item = &Arc<dyn LanguageAdapter>> {
        self.adapters.iter()
    }

    pub fn languages(&self) -> Vec<&'static str> {
        self.adapters.iter().map(|a| a.language()).collect()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("languages", &self.languages())
            .finish()
    }
}
