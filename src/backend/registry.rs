//! Registration table of backends.

use std::collections::HashMap;

use crate::error::ConvertError;

use super::{kusto, lucene, splunk, BackendDescriptor};

/// Backends hashed by key, filled once at startup and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<&'static str, BackendDescriptor>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the bundled backends.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(splunk::DESCRIPTOR);
        registry.register(lucene::DESCRIPTOR);
        registry.register(kusto::DESCRIPTOR);
        registry
    }

    /// Register a backend, replacing any backend with the same key.
    pub fn register(&mut self, descriptor: BackendDescriptor) {
        self.backends.insert(descriptor.key, descriptor);
    }

    /// Look up a backend by key.
    ///
    /// # Errors
    /// Returns [`ConvertError::UnknownBackend`] listing every registered key.
    pub fn lookup(&self, target: &str) -> Result<&BackendDescriptor, ConvertError> {
        self.backends
            .get(target)
            .ok_or_else(|| ConvertError::UnknownBackend {
                target: target.to_string(),
                available: self.keys().into_iter().map(str::to_string).collect(),
            })
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<&'static str> = self.backends.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Registered backends, sorted by key.
    pub fn descriptors(&self) -> Vec<&BackendDescriptor> {
        let mut descriptors: Vec<&BackendDescriptor> = self.backends.values().collect();
        descriptors.sort_unstable_by_key(|d| d.key);
        descriptors
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_keys_sorted() {
        let registry = BackendRegistry::with_builtins();
        assert_eq!(registry.keys(), vec!["kusto", "lucene", "splunk"]);
    }

    #[test]
    fn test_unknown_backend_lists_keys() {
        let registry = BackendRegistry::with_builtins();
        match registry.lookup("qradar") {
            Err(ConvertError::UnknownBackend { target, available }) => {
                assert_eq!(target, "qradar");
                assert_eq!(available, vec!["kusto", "lucene", "splunk"]);
            }
            other => panic!("Expected UnknownBackend, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_registry() {
        let registry = BackendRegistry::new();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.lookup("splunk"),
            Err(ConvertError::UnknownBackend { ref available, .. }) if available.is_empty()
        ));
    }
}
