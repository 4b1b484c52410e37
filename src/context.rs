//! Execution contexts and their manager.
//!
//! A context is one isolated client session: its own operation-id and handle
//! namespaces, its own function registry, and a scheduling mode fixed at
//! creation. The manager owns the process-wide context table (empty at
//! startup, fully closed at shutdown) and runs the keep-alive reaper, the
//! only component allowed to destroy a context without an explicit request.

use crate::devices::DeviceProvider;
use crate::engine::KernelEngine;
use crate::error::CoordinationError;
use crate::functions::FunctionRegistry;
use crate::handles::HandleTable;
use crate::queue::{ExecMode, OperationQueue};
use crate::types::{ContextId, DeviceInfo};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// One isolated execution session.
pub struct Context {
    id: ContextId,
    keep_alive: Duration,
    last_activity: Mutex<Instant>,
    devices: Vec<DeviceInfo>,
    handles: Arc<HandleTable>,
    functions: Arc<FunctionRegistry>,
    queue: OperationQueue,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

impl Context {
    fn new(
        id: ContextId,
        mode: ExecMode,
        keep_alive: Duration,
        devices: Vec<DeviceInfo>,
        engine: Arc<dyn KernelEngine>,
    ) -> Self {
        let handles = Arc::new(HandleTable::new());
        let functions = Arc::new(FunctionRegistry::new());
        let device_names = devices.iter().map(|d| d.name.clone()).collect();
        let queue = OperationQueue::new(
            mode,
            Arc::clone(&handles),
            Arc::clone(&functions),
            engine,
            device_names,
        );
        Self {
            id,
            keep_alive,
            last_activity: Mutex::new(Instant::now()),
            devices,
            handles,
            functions,
            queue,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    pub fn handles(&self) -> &Arc<HandleTable> {
        &self.handles
    }

    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.functions
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    /// Record client activity, pushing back the keep-alive deadline.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// True when the inactivity window has outlived the keep-alive deadline.
    pub fn expired(&self) -> bool {
        self.idle_for() > self.keep_alive
    }

    /// Drain in-flight operations, then free every remaining handle.
    async fn close(&self) {
        self.queue.shutdown().await;
        self.handles.clear();
    }
}

/// Process-wide table of live contexts plus the keep-alive reaper.
pub struct ContextManager {
    contexts: RwLock<HashMap<ContextId, Arc<Context>>>,
    engine: Arc<dyn KernelEngine>,
    devices: Arc<dyn DeviceProvider>,
    sweep_interval: Duration,
    reaper_running: Arc<RwLock<bool>>,
    reaper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ContextManager {
    pub fn new(
        engine: Arc<dyn KernelEngine>,
        devices: Arc<dyn DeviceProvider>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            contexts: RwLock::new(HashMap::new()),
            engine,
            devices,
            sweep_interval,
            reaper_running: Arc::new(RwLock::new(false)),
            reaper: Mutex::new(None),
        }
    }

    /// Create a fresh context and return it.
    ///
    /// Fails with `InvalidArgument` for a zero keep-alive duration. The id is
    /// a random 64-bit value checked against the live table, so destroyed
    /// identifiers are never observed again.
    pub fn create_context(
        &self,
        mode: ExecMode,
        keep_alive: Duration,
    ) -> Result<Arc<Context>, CoordinationError> {
        if keep_alive.is_zero() {
            return Err(CoordinationError::InvalidArgument(
                "keep-alive duration must be positive".to_string(),
            ));
        }

        let devices = self.devices.devices();
        let mut contexts = self.contexts.write();
        let id = loop {
            let candidate = ContextId::random();
            if !contexts.contains_key(&candidate) {
                break candidate;
            }
        };
        let context = Arc::new(Context::new(
            id,
            mode,
            keep_alive,
            devices,
            Arc::clone(&self.engine),
        ));
        contexts.insert(id, Arc::clone(&context));
        drop(contexts);

        info!(
            context_id = %id,
            mode = ?mode,
            keep_alive_secs = keep_alive.as_secs(),
            "Created context"
        );
        Ok(context)
    }

    /// Look up a live context.
    pub fn get(&self, id: ContextId) -> Result<Arc<Context>, CoordinationError> {
        self.contexts
            .read()
            .get(&id)
            .map(Arc::clone)
            .ok_or_else(|| CoordinationError::NotFound(format!("unknown context {}", id)))
    }

    pub fn context_count(&self) -> usize {
        self.contexts.read().len()
    }

    /// Remove and destroy a context. Pending operations are drained, then
    /// every remaining handle is freed.
    pub async fn close_context(&self, id: ContextId) -> Result<(), CoordinationError> {
        let context = self
            .contexts
            .write()
            .remove(&id)
            .ok_or_else(|| CoordinationError::NotFound(format!("unknown context {}", id)))?;
        context.close().await;
        info!(context_id = %id, "Closed context");
        Ok(())
    }

    /// Close every live context. Used at process shutdown.
    pub async fn close_all(&self) {
        let contexts: Vec<Arc<Context>> = {
            let mut table = self.contexts.write();
            table.drain().map(|(_, ctx)| ctx).collect()
        };
        let count = contexts.len();
        join_all(contexts.iter().map(|ctx| ctx.close())).await;
        if count > 0 {
            info!(count, "Closed all contexts");
        }
    }

    /// One reaper pass: close every context whose inactivity exceeds its
    /// keep-alive deadline.
    pub async fn sweep(&self) {
        let expired: Vec<ContextId> = {
            let contexts = self.contexts.read();
            contexts
                .iter()
                .filter(|(_, ctx)| ctx.expired())
                .map(|(id, _)| *id)
                .collect()
        };
        for id in expired {
            match self.close_context(id).await {
                Ok(()) => info!(context_id = %id, "Reaped idle context"),
                // Lost a race with an explicit close; nothing left to do.
                Err(CoordinationError::NotFound(_)) => {}
                Err(err) => warn!(context_id = %id, error = %err, "Failed to reap context"),
            }
        }
    }

    /// Start the background reaper. Idempotent.
    pub fn start_reaper(self: &Arc<Self>) {
        let mut running = self.reaper_running.write();
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let manager = Arc::clone(self);
        let running = Arc::clone(&self.reaper_running);
        let interval = self.sweep_interval;
        let handle = tokio::spawn(async move {
            debug!(interval_ms = interval.as_millis() as u64, "Reaper started");
            while *running.read() {
                sleep(interval).await;
                manager.sweep().await;
            }
            debug!("Reaper stopped");
        });
        *self.reaper.lock() = Some(handle);
    }

    /// Stop the background reaper and wait for it to exit. Idempotent.
    pub async fn stop_reaper(&self) {
        {
            let mut running = self.reaper_running.write();
            if !*running {
                return;
            }
            *running = false;
        }
        let handle = self.reaper.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::LocalCpuProvider;
    use crate::engine::ArithmeticEngine;

    fn test_manager(sweep_interval: Duration) -> Arc<ContextManager> {
        Arc::new(ContextManager::new(
            Arc::new(ArithmeticEngine::new()),
            Arc::new(LocalCpuProvider::new(1)),
            sweep_interval,
        ))
    }

    #[tokio::test]
    async fn test_create_and_close() {
        let manager = test_manager(Duration::from_secs(1));
        let ctx = manager
            .create_context(ExecMode::Sync, Duration::from_secs(60))
            .unwrap();
        let id = ctx.id();
        assert_eq!(manager.context_count(), 1);
        assert_eq!(ctx.devices().len(), 1);

        manager.close_context(id).await.unwrap();
        assert!(matches!(
            manager.get(id).unwrap_err(),
            CoordinationError::NotFound(_)
        ));
        assert!(matches!(
            manager.close_context(id).await.unwrap_err(),
            CoordinationError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_zero_keep_alive_rejected() {
        let manager = test_manager(Duration::from_secs(1));
        let err = manager
            .create_context(ExecMode::Sync, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_sweep_closes_only_expired() {
        let manager = test_manager(Duration::from_secs(1));
        let short = manager
            .create_context(ExecMode::Sync, Duration::from_millis(20))
            .unwrap();
        let long = manager
            .create_context(ExecMode::Sync, Duration::from_secs(60))
            .unwrap();

        sleep(Duration::from_millis(60)).await;
        manager.sweep().await;

        assert!(manager.get(short.id()).is_err());
        assert!(manager.get(long.id()).is_ok());
    }

    #[tokio::test]
    async fn test_touch_defers_expiry() {
        let manager = test_manager(Duration::from_secs(1));
        let ctx = manager
            .create_context(ExecMode::Sync, Duration::from_millis(80))
            .unwrap();
        for _ in 0..4 {
            sleep(Duration::from_millis(30)).await;
            ctx.touch();
        }
        manager.sweep().await;
        assert!(manager.get(ctx.id()).is_ok());
    }

    #[tokio::test]
    async fn test_reaper_start_stop_idempotent() {
        let manager = test_manager(Duration::from_millis(10));
        manager.start_reaper();
        manager.start_reaper();
        manager.stop_reaper().await;
        manager.stop_reaper().await;
    }
}
