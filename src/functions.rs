//! Function registry: per-context aggregate of registered function definitions.

use crate::error::CoordinationError;
use crate::types::FunctionDef;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Name-keyed registry of function definitions.
///
/// Registration is first-wins: functions are immutable once registered in a
/// context, and a duplicate name fails with `AlreadyExists`.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, Arc<FunctionDef>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new function definition.
    pub fn register(&self, def: FunctionDef) -> Result<(), CoordinationError> {
        let mut functions = self.functions.write();
        if functions.contains_key(&def.name) {
            return Err(CoordinationError::AlreadyExists(format!(
                "function already registered: {}",
                def.name
            )));
        }
        functions.insert(def.name.clone(), Arc::new(def));
        Ok(())
    }

    /// Look up a definition by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<FunctionDef>> {
        self.functions.read().get(name).map(Arc::clone)
    }

    pub fn len(&self) -> usize {
        self.functions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
