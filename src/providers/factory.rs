use std::collections::HashMap;
use std::sync::Arc;

use strum_macros::EnumIter;

use crate::errors::ProviderError;

use super::anthropic::AnthropicAdapter;
use super::base::ProviderAdapter;
use super::openai::OpenAiAdapter;

/// Backends shipped with the crate. External callers can still register
/// additional adapters under their own names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ProviderType {
    Anthropic,
    OpenAi,
}

type AdapterConstructor = Arc<dyn Fn() -> Result<Arc<dyn ProviderAdapter>, ProviderError> + Send + Sync>;

/// Name-to-constructor table for provider adapters. Built once at startup;
/// lookups never mutate it.
pub struct ProviderRegistry {
    constructors: HashMap<String, AdapterConstructor>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry preloaded with the built-in adapters.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let _ = registry.register(ProviderType::Anthropic.to_string(), || {
            Ok(Arc::new(AnthropicAdapter::new()?) as Arc<dyn ProviderAdapter>)
        });
        let _ = registry.register(ProviderType::OpenAi.to_string(), || {
            Ok(Arc::new(OpenAiAdapter::new()?) as Arc<dyn ProviderAdapter>)
        });
        registry
    }

    /// Add a constructor under `name`. Duplicate names are rejected so one
    /// registration cannot silently shadow another.
    pub fn register<N, F>(&mut self, name: N, constructor: F) -> Result<(), ProviderError>
    where
        N: Into<String>,
        F: Fn() -> Result<Arc<dyn ProviderAdapter>, ProviderError> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.constructors.contains_key(&name) {
            return Err(ProviderError::Configuration(format!(
                "provider '{name}' is already registered"
            )));
        }
        self.constructors.insert(name, Arc::new(constructor));
        Ok(())
    }

    /// Construct a fresh adapter for `name`. Unknown names are a configuration
    /// error naming the available set.
    pub fn create(&self, name: &str) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        match self.constructors.get(name) {
            Some(constructor) => constructor(),
            None => Err(ProviderError::Configuration(format!(
                "unknown provider '{}', available: {}",
                name,
                self.available_providers().join(", ")
            ))),
        }
    }

    pub fn available_providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
