//! Operation Queue & Executor
//!
//! The per-context state machine at the heart of the coordinator. Operations
//! move Pending -> Running -> Completed | Failed; each operation's state is
//! published on a `watch` channel so dependents and `wait_done` callers
//! observe terminal transitions without polling. Cells are created lazily,
//! which makes it legal to depend on an operation that has not been enqueued
//! yet.
//!
//! Synchronous contexts execute items in submission order on the calling
//! task, serialized by a queue-level gate; the first failure aborts the
//! remaining items of that call. Asynchronous contexts admit items
//! immediately and spawn one task per operation that waits for its declared
//! control dependencies and input producers before running. A release
//! applies only after the producer and every previously admitted reader of
//! the handle are terminal, so reordering a release around its consumers is
//! always safe.

use crate::engine::{Dispatch, KernelEngine};
use crate::error::CoordinationError;
use crate::functions::FunctionRegistry;
use crate::handles::HandleTable;
use crate::types::{
    OpId, OpInput, Operation, QueueItem, QueueResponse, RemoteTensorHandle, TensorValue,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error};

/// Per-context scheduling policy, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Sync,
    Async,
}

/// Lifecycle state of one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OpState {
    Pending,
    Running,
    Completed,
    Failed(CoordinationError),
}

impl OpState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OpState::Completed | OpState::Failed(_))
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    /// Admitted operations not yet running
    pub pending: usize,
    /// Operations currently executing
    pub running: usize,
    /// Operations that completed without error
    pub completed: usize,
    /// Operations that reached a failed terminal state
    pub failed: usize,
}

struct OpCell {
    tx: Arc<watch::Sender<OpState>>,
    /// True once the client actually enqueued this id (as opposed to a
    /// placeholder cell created because something depends on it).
    admitted: bool,
}

impl OpCell {
    fn placeholder() -> Self {
        let (tx, _rx) = watch::channel(OpState::Pending);
        Self {
            tx: Arc::new(tx),
            admitted: false,
        }
    }
}

struct QueueInner {
    mode: ExecMode,
    handles: Arc<HandleTable>,
    functions: Arc<FunctionRegistry>,
    engine: Arc<dyn KernelEngine>,
    /// Names of devices visible to this context; a non-empty target device
    /// must match one of them.
    device_names: Vec<String>,
    ops: Mutex<HashMap<OpId, OpCell>>,
    /// State cells of admitted operations that read each handle. A release
    /// of a handle waits for these, never just the producer.
    readers: Mutex<HashMap<(OpId, u32), Vec<Arc<watch::Sender<OpState>>>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    stats: Mutex<QueueStats>,
}

/// Per-context ordered admission of operations and releases.
pub struct OperationQueue {
    inner: Arc<QueueInner>,
    /// Serializes synchronous enqueue calls so two concurrent requests never
    /// overlap execution within one context.
    sync_gate: tokio::sync::Mutex<()>,
}

impl OperationQueue {
    pub fn new(
        mode: ExecMode,
        handles: Arc<HandleTable>,
        functions: Arc<FunctionRegistry>,
        engine: Arc<dyn KernelEngine>,
        device_names: Vec<String>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                mode,
                handles,
                functions,
                engine,
                device_names,
                ops: Mutex::new(HashMap::new()),
                readers: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                stats: Mutex::new(QueueStats::default()),
            }),
            sync_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn mode(&self) -> ExecMode {
        self.inner.mode
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.stats.lock().clone()
    }

    /// Current state of an operation, if known in this context.
    pub fn op_state(&self, op_id: OpId) -> Option<OpState> {
        let ops = self.inner.ops.lock();
        ops.get(&op_id)
            .filter(|c| c.admitted)
            .map(|c| c.tx.borrow().clone())
    }

    /// Admit a batch of items.
    ///
    /// Returns one response slot per item, in submission order. Output shapes
    /// are populated immediately in synchronous mode and left empty in
    /// asynchronous mode, where execution has not happened yet.
    pub async fn enqueue(
        &self,
        items: Vec<QueueItem>,
    ) -> Result<Vec<QueueResponse>, CoordinationError> {
        match self.inner.mode {
            ExecMode::Sync => self.enqueue_sync(items).await,
            ExecMode::Async => self.enqueue_async(items),
        }
    }

    async fn enqueue_sync(
        &self,
        items: Vec<QueueItem>,
    ) -> Result<Vec<QueueResponse>, CoordinationError> {
        let _gate = self.sync_gate.lock().await;
        let mut responses = Vec::with_capacity(items.len());
        for item in items {
            match item {
                QueueItem::Operation(op) => {
                    let tx = self.inner.admit(op.id)?;
                    self.inner.set_state(&tx, OpState::Running);
                    match self.inner.execute_op(&op).await {
                        Ok(shapes) => {
                            self.inner.set_state(&tx, OpState::Completed);
                            responses.push(QueueResponse {
                                output_shapes: shapes,
                            });
                        }
                        Err(err) => {
                            error!(op_id = op.id, name = %op.name, error = %err, "Operation failed");
                            self.inner.set_state(&tx, OpState::Failed(err.clone()));
                            return Err(err);
                        }
                    }
                }
                QueueItem::Release(handle) => {
                    self.inner.handles.release(handle.op_id, handle.output);
                    responses.push(QueueResponse::default());
                }
            }
        }
        Ok(responses)
    }

    fn enqueue_async(
        &self,
        items: Vec<QueueItem>,
    ) -> Result<Vec<QueueResponse>, CoordinationError> {
        let mut responses = Vec::with_capacity(items.len());
        for item in items {
            match item {
                QueueItem::Operation(op) => {
                    let tx = self.inner.admit(op.id)?;
                    self.inner.register_readers(&op, &tx);
                    let inner = Arc::clone(&self.inner);
                    let task = tokio::spawn(async move {
                        inner.run_async(op, tx).await;
                    });
                    self.inner.tasks.lock().push(task);
                    responses.push(QueueResponse::default());
                }
                QueueItem::Release(handle) => {
                    self.inner.schedule_release(handle);
                    responses.push(QueueResponse::default());
                }
            }
        }
        Ok(responses)
    }

    /// Block until every named operation (or, for an empty set, every
    /// operation known at the time of the call) reaches a terminal state.
    ///
    /// Returns the first error among the awaited operations. Purely an
    /// observer: never mutates scheduling order.
    pub async fn wait_done(&self, op_ids: &[OpId]) -> Result<(), CoordinationError> {
        let targets: Vec<(OpId, Arc<watch::Sender<OpState>>)> = {
            let ops = self.inner.ops.lock();
            if op_ids.is_empty() {
                ops.iter()
                    .filter(|(_, cell)| cell.admitted)
                    .map(|(id, cell)| (*id, Arc::clone(&cell.tx)))
                    .collect()
            } else {
                let mut targets = Vec::with_capacity(op_ids.len());
                for id in op_ids {
                    match ops.get(id) {
                        Some(cell) if cell.admitted => targets.push((*id, Arc::clone(&cell.tx))),
                        _ => {
                            return Err(CoordinationError::NotFound(format!(
                                "unknown operation id {}",
                                id
                            )))
                        }
                    }
                }
                targets
            }
        };

        let mut first_error = None;
        for (_id, tx) in targets {
            if let OpState::Failed(err) = wait_terminal(&tx).await {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Record externally produced tensors under `op_id` and mark it
    /// completed without executing anything.
    ///
    /// Backs SendTensor. The id is admitted before anything is recorded, so
    /// a duplicate of an already-submitted operation fails cleanly with no
    /// values left behind in the handle table.
    pub fn inject_completed(
        &self,
        op_id: OpId,
        tensors: Vec<TensorValue>,
    ) -> Result<(), CoordinationError> {
        let tx = self.inner.admit(op_id)?;
        for (index, tensor) in tensors.into_iter().enumerate() {
            if let Err(err) = self.inner.handles.put(op_id, index as u32, tensor) {
                self.inner.set_state(&tx, OpState::Failed(err.clone()));
                return Err(err);
            }
        }
        self.inner.set_state(&tx, OpState::Completed);
        debug!(op_id, "Injected externally produced operation");
        Ok(())
    }

    /// Fail every still-pending operation, wake their waiters, and await all
    /// spawned tasks. Called once, at context teardown.
    pub async fn shutdown(&self) {
        self.inner.fail_pending("context closed");
        loop {
            let tasks: Vec<_> = std::mem::take(&mut *self.inner.tasks.lock());
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                let _ = task.await;
            }
        }
    }
}

impl QueueInner {
    /// Lazily created state cell for `op_id`.
    fn cell_sender(&self, op_id: OpId) -> Arc<watch::Sender<OpState>> {
        let mut ops = self.ops.lock();
        Arc::clone(&ops.entry(op_id).or_insert_with(OpCell::placeholder).tx)
    }

    /// Mark `op_id` as admitted, rejecting duplicate submission.
    fn admit(&self, op_id: OpId) -> Result<Arc<watch::Sender<OpState>>, CoordinationError> {
        let mut ops = self.ops.lock();
        let cell = ops.entry(op_id).or_insert_with(OpCell::placeholder);
        if cell.admitted {
            return Err(CoordinationError::InvalidArgument(format!(
                "duplicate operation id {}",
                op_id
            )));
        }
        cell.admitted = true;
        let tx = Arc::clone(&cell.tx);
        drop(ops);
        self.stats.lock().pending += 1;
        Ok(tx)
    }

    /// Transition to `next` unless the cell is already terminal. Terminal
    /// states never regress; returns whether the transition happened.
    fn set_state(&self, tx: &Arc<watch::Sender<OpState>>, next: OpState) -> bool {
        let mut prev = None;
        tx.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            prev = Some(std::mem::replace(state, next.clone()));
            true
        });
        let Some(prev) = prev else {
            return false;
        };
        let mut stats = self.stats.lock();
        match prev {
            OpState::Pending => stats.pending = stats.pending.saturating_sub(1),
            OpState::Running => stats.running = stats.running.saturating_sub(1),
            _ => {}
        }
        match next {
            OpState::Pending => stats.pending += 1,
            OpState::Running => stats.running += 1,
            OpState::Completed => stats.completed += 1,
            OpState::Failed(_) => stats.failed += 1,
        }
        true
    }

    /// Async-mode execution of one admitted operation.
    async fn run_async(self: Arc<Self>, op: Operation, tx: Arc<watch::Sender<OpState>>) {
        let mut deps: Vec<OpId> = op.control_deps.clone();
        deps.extend(op.input_producers());
        deps.sort_unstable();
        deps.dedup();

        if deps.contains(&op.id) {
            let err = CoordinationError::InvalidArgument(format!(
                "operation {} depends on itself",
                op.id
            ));
            self.set_state(&tx, OpState::Failed(err));
            return;
        }

        for dep in deps {
            let dep_tx = self.cell_sender(dep);
            if let OpState::Failed(err) = wait_terminal(&dep_tx).await {
                let failure = err.into_dependency_failure(dep);
                debug!(
                    op_id = op.id,
                    dep,
                    "Operation failed without running: dependency failed"
                );
                self.set_state(&tx, OpState::Failed(failure));
                return;
            }
        }

        if !self.set_state(&tx, OpState::Running) {
            // Failed at teardown while waiting on dependencies.
            return;
        }
        match self.execute_op(&op).await {
            Ok(_) => {
                self.set_state(&tx, OpState::Completed);
            }
            Err(err) => {
                error!(op_id = op.id, name = %op.name, error = %err, "Operation failed");
                self.set_state(&tx, OpState::Failed(err));
            }
        }
    }

    /// Resolve dispatch and inputs, invoke the engine, record outputs.
    /// Returns the shape of each produced output.
    async fn execute_op(&self, op: &Operation) -> Result<Vec<Vec<i64>>, CoordinationError> {
        if !op.device.is_empty() && !self.device_names.iter().any(|d| d == &op.device) {
            return Err(CoordinationError::InvalidArgument(format!(
                "unknown target device: {}",
                op.device
            )));
        }

        // Dispatch is resolved once, before execution: a registered function
        // shadows any primitive of the same name.
        let dispatch = match self.functions.lookup(&op.name) {
            Some(def) => Dispatch::Function(def),
            None => Dispatch::Primitive,
        };

        let mut inputs = Vec::with_capacity(op.inputs.len());
        for input in &op.inputs {
            match input {
                OpInput::Value(value) => inputs.push(Arc::new(value.clone())),
                OpInput::Handle(handle) => {
                    // Producers are terminal by the time we get here, so a
                    // miss means the slot was never produced or already freed.
                    let value = self.handles.resolve(handle.op_id, handle.output).map_err(
                        |_| {
                            CoordinationError::FailedPrecondition(format!(
                                "input ({}, {}) of operation {} is not available",
                                handle.op_id, handle.output, op.id
                            ))
                        },
                    )?;
                    inputs.push(value);
                }
            }
        }

        let outputs = self.engine.execute(op, dispatch, inputs).await?;
        let mut shapes = Vec::with_capacity(outputs.len());
        for (index, value) in outputs.into_iter().enumerate() {
            shapes.push(value.shape.clone());
            self.handles.put(op.id, index as u32, value)?;
        }
        debug!(op_id = op.id, name = %op.name, outputs = shapes.len(), "Operation completed");
        Ok(shapes)
    }

    /// Record `op` as a reader of each of its handle inputs, so releases of
    /// those handles wait for it to reach a terminal state.
    fn register_readers(&self, op: &Operation, tx: &Arc<watch::Sender<OpState>>) {
        let mut readers = self.readers.lock();
        for input in &op.inputs {
            if let OpInput::Handle(h) = input {
                readers
                    .entry((h.op_id, h.output))
                    .or_default()
                    .push(Arc::clone(tx));
            }
        }
    }

    /// Apply a release, deferring it until the producing operation (when
    /// known and still in flight) and every previously admitted reader of
    /// the handle are terminal. A release submitted after a consumer can
    /// therefore never free the handle out from under it; reference counts
    /// absorb any remaining interleaving.
    fn schedule_release(self: &Arc<Self>, handle: RemoteTensorHandle) {
        let mut blockers: Vec<Arc<watch::Sender<OpState>>> = Vec::new();
        {
            let ops = self.ops.lock();
            if let Some(cell) = ops.get(&handle.op_id).filter(|cell| cell.admitted) {
                blockers.push(Arc::clone(&cell.tx));
            }
        }
        {
            let readers = self.readers.lock();
            if let Some(txs) = readers.get(&(handle.op_id, handle.output)) {
                blockers.extend(txs.iter().cloned());
            }
        }
        blockers.retain(|tx| !tx.borrow().is_terminal());

        if blockers.is_empty() {
            self.handles.release(handle.op_id, handle.output);
            return;
        }
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            for tx in &blockers {
                wait_terminal(tx).await;
            }
            inner.handles.release(handle.op_id, handle.output);
        });
        self.tasks.lock().push(task);
    }

    /// Transition every still-pending cell to Failed so blocked dependents
    /// and waiters wake up. Running operations are left to finish.
    fn fail_pending(&self, reason: &str) {
        let ops = self.ops.lock();
        for (op_id, cell) in ops.iter() {
            cell.tx.send_if_modified(|state| {
                if matches!(state, OpState::Pending) {
                    *state = OpState::Failed(CoordinationError::FailedPrecondition(format!(
                        "operation {}: {}",
                        op_id, reason
                    )));
                    true
                } else {
                    false
                }
            });
        }
    }
}

async fn wait_terminal(tx: &Arc<watch::Sender<OpState>>) -> OpState {
    let mut rx = tx.subscribe();
    loop {
        let state = rx.borrow().clone();
        if state.is_terminal() {
            return state;
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone();
        }
    }
}
