//! Registries: dotted name -> factory, constructed explicitly at startup
//!
//! The pipeline registry maps names like `finra.otc_transparency.ingest_week`
//! to zero-arg factories. The same pattern backs per-domain period and
//! source registries via [`StrategyRegistry`]. Nothing is auto-discovered:
//! each domain registers its own entries at process startup, and separate
//! registry instances are fully isolated from one another.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::RwLock;

use crate::pipeline::PipelineFactory;

/// Errors from registry operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    /// Pipeline name not registered
    #[error("pipeline not found: {0}")]
    PipelineNotFound(String),

    /// Name already registered
    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),

    /// Strategy key not registered
    #[error("{kind} strategy not found: {key}")]
    StrategyNotFound { kind: String, key: String },
}

/// Thread-safe mapping from dotted pipeline name to factory
pub struct PipelineRegistry {
    factories: RwLock<BTreeMap<String, PipelineFactory>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a pipeline factory under a dotted name
    pub fn register(
        &self,
        name: impl Into<String>,
        factory: PipelineFactory,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        let mut factories = self.factories.write();
        if factories.contains_key(&name) {
            return Err(RegistryError::DuplicateRegistration(name));
        }
        factories.insert(name, factory);
        Ok(())
    }

    /// Look up a factory by name
    pub fn get(&self, name: &str) -> Result<PipelineFactory, RegistryError> {
        self.factories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::PipelineNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    /// All registered names, in deterministic (lexicographic) order
    pub fn list(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }

    /// Names under a domain prefix (`finra` matches `finra.*`)
    pub fn list_by_domain(&self, domain: &str) -> Vec<String> {
        let prefix = format!("{domain}.");
        self.factories
            .read()
            .keys()
            .filter(|name| name.starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.factories.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.read().is_empty()
    }
}

impl Default for PipelineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PipelineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineRegistry")
            .field("pipelines", &self.list())
            .finish()
    }
}

/// Generic key->strategy registry with the same discipline
///
/// Backs the per-domain period and source registries. Instances are
/// independent; registering into one never mutates another.
pub struct StrategyRegistry<T: Clone> {
    kind: &'static str,
    entries: RwLock<BTreeMap<String, T>>,
}

impl<T: Clone> StrategyRegistry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn register(&self, key: impl Into<String>, strategy: T) -> Result<(), RegistryError> {
        let key = key.into();
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return Err(RegistryError::DuplicateRegistration(key));
        }
        entries.insert(key, strategy);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<T, RegistryError> {
        self.entries
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::StrategyNotFound {
                kind: self.kind.to_string(),
                key: key.to_string(),
            })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn list(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<T: Clone> fmt::Debug for StrategyRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("kind", &self.kind)
            .field("keys", &self.list())
            .finish()
    }
}
