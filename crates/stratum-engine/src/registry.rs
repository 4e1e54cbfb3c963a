//! Resource type registry.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::resource::ResourceKind;

/// Maps type tags to resource kinds.
///
/// Kinds are registered explicitly at startup or implicitly the first time
/// they are applied. Finalize uses the registry to find the delete handler
/// for a type recorded in state.
#[derive(Clone, Default)]
pub struct Registry {
    kinds: Arc<RwLock<HashMap<String, ResourceKind>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a kind under its type tag.
    pub fn register(&self, kind: ResourceKind) {
        let mut kinds = self.kinds.write().unwrap_or_else(PoisonError::into_inner);
        kinds.insert(kind.type_name().to_string(), kind);
    }

    /// Look up a kind.
    pub fn get(&self, type_name: &str) -> Option<ResourceKind> {
        let kinds = self.kinds.read().unwrap_or_else(PoisonError::into_inner);
        kinds.get(type_name).cloned()
    }

    pub fn contains(&self, type_name: &str) -> bool {
        let kinds = self.kinds.read().unwrap_or_else(PoisonError::into_inner);
        kinds.contains_key(type_name)
    }

    /// Registered type tags, sorted.
    pub fn type_names(&self) -> Vec<String> {
        let kinds = self.kinds.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = kinds.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("types", &self.type_names())
            .finish()
    }
}
