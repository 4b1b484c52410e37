//! Tensor Handle Table
//!
//! Per-context map from (op id, output index) to produced tensor values,
//! with reference counting. Values are handed out as `Arc` clones, so an
//! in-flight operation that resolved an input keeps it alive even if the
//! client releases the handle concurrently.

use crate::error::CoordinationError;
use crate::types::{OpId, TensorValue};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

struct Entry {
    value: Arc<TensorValue>,
    refcount: usize,
}

#[derive(Default)]
struct TableState {
    entries: HashMap<(OpId, u32), Entry>,
    /// Every slot ever produced in this context. Production is
    /// at-most-once for the context lifetime, even after the value is freed.
    produced: HashSet<(OpId, u32)>,
}

/// Reference-counted storage for operation outputs.
#[derive(Default)]
pub struct HandleTable {
    state: Mutex<TableState>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly produced output with reference count 1.
    ///
    /// Producing the same (op, output) slot twice — even after the first
    /// value was released — is a contract violation and fails with
    /// `AlreadyExists`; this is also the backstop that rejects duplicate
    /// operation-id submission.
    pub fn put(&self, op_id: OpId, output: u32, value: TensorValue) -> Result<(), CoordinationError> {
        let mut state = self.state.lock();
        if !state.produced.insert((op_id, output)) {
            return Err(CoordinationError::AlreadyExists(format!(
                "output ({}, {}) was already produced",
                op_id, output
            )));
        }
        state.entries.insert(
            (op_id, output),
            Entry {
                value: Arc::new(value),
                refcount: 1,
            },
        );
        Ok(())
    }

    /// Look up a produced value.
    ///
    /// The queue only calls this once the producing operation is terminal,
    /// so a miss here means the client referenced a slot that was never
    /// produced (or already freed).
    pub fn resolve(&self, op_id: OpId, output: u32) -> Result<Arc<TensorValue>, CoordinationError> {
        let state = self.state.lock();
        state
            .entries
            .get(&(op_id, output))
            .map(|e| Arc::clone(&e.value))
            .ok_or_else(|| {
                CoordinationError::NotFound(format!(
                    "no tensor recorded for operation {} output {}",
                    op_id, output
                ))
            })
    }

    /// Shape metadata for a produced value, if present.
    pub fn shape_of(&self, op_id: OpId, output: u32) -> Option<Vec<i64>> {
        let state = self.state.lock();
        state
            .entries
            .get(&(op_id, output))
            .map(|e| e.value.shape.clone())
    }

    /// Decrement the reference count; frees the value at zero.
    ///
    /// Releasing an unknown or already-freed handle is a no-op: client and
    /// worker lifetimes race benignly and the release side must tolerate it.
    pub fn release(&self, op_id: OpId, output: u32) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(&(op_id, output)) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                state.entries.remove(&(op_id, output));
                debug!(op_id, output, "Released tensor handle");
            }
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every remaining entry. Called at context teardown so no output
    /// outlives its context.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let dropped = state.entries.len();
        state.entries.clear();
        if dropped > 0 {
            debug!(dropped, "Cleared handle table at teardown");
        }
    }
}
