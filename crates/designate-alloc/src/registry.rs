//! Name → algorithm lookup used when parsing pipeline descriptions.

use std::collections::BTreeMap;
use std::sync::Arc;

use designate_core::Defaults;

use crate::algorithm::Algorithm;
use crate::algorithms;
use crate::error::ConstructionError;

#[derive(Clone, Default)]
pub struct Registry {
    algorithms: BTreeMap<&'static str, Arc<dyn Algorithm>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in algorithm, configured from `defaults`.
    ///
    /// Fails when the owner-server rules in `defaults` do not compile.
    pub fn builtin(defaults: &Defaults) -> Result<Self, ConstructionError> {
        let mut registry = Self::new();
        for algorithm in algorithms::builtin(defaults)? {
            registry.register(algorithm);
        }
        Ok(registry)
    }

    /// Add or replace an algorithm under its own name.
    pub fn register(&mut self, algorithm: Arc<dyn Algorithm>) {
        self.algorithms.insert(algorithm.name(), algorithm);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Algorithm>> {
        self.algorithms.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.algorithms.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.algorithms.keys().copied()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
