//! Coordinator service façade.
//!
//! Implements the lifecycle request surface (create, enqueue, wait,
//! keep-alive, close, register-function, send-tensor) on top of the context
//! manager. The transport that delivers these requests lives outside this
//! crate; every request and response type here is serde-ready for it.

use crate::context::ContextManager;
use crate::error::CoordinationError;
use crate::queue::ExecMode;
use crate::types::{
    ContextId, DeviceInfo, FunctionDef, OpId, QueueItem, QueueResponse, TensorValue,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateContextRequest {
    /// Opaque cluster descriptor, recorded for the transport layer only.
    #[serde(default)]
    pub server_descriptor: Option<serde_json::Value>,
    /// Scheduling mode for the whole lifetime of the context.
    pub async_execution: bool,
    /// Inactivity window after which the reaper may destroy the context.
    pub keep_alive_secs: i64,
    /// Client protocol version, echoed into logs; negotiation is external.
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub rendezvous_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateContextResponse {
    pub context_id: ContextId,
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub context_id: ContextId,
    pub items: Vec<QueueItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueResponse {
    /// One slot per submitted item, in submission order.
    pub responses: Vec<QueueResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitQueueDoneRequest {
    pub context_id: ContextId,
    /// Empty means "every operation known in the context".
    #[serde(default)]
    pub op_ids: Vec<OpId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub context_id: ContextId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseContextRequest {
    pub context_id: ContextId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterFunctionRequest {
    pub context_id: ContextId,
    pub function: FunctionDef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendTensorRequest {
    pub context_id: ContextId,
    /// Client-chosen id the injected tensors are recorded under, as if that
    /// id had produced them.
    pub op_id: OpId,
    pub tensors: Vec<TensorValue>,
    #[serde(default)]
    pub device: String,
}

/// The request-handling façade over the context manager.
pub struct CoordinatorService {
    manager: Arc<ContextManager>,
}

impl CoordinatorService {
    pub fn new(manager: Arc<ContextManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ContextManager> {
        &self.manager
    }

    pub fn create_context(
        &self,
        request: CreateContextRequest,
    ) -> Result<CreateContextResponse, CoordinationError> {
        if request.keep_alive_secs <= 0 {
            return Err(CoordinationError::InvalidArgument(format!(
                "keep-alive must be positive, got {}",
                request.keep_alive_secs
            )));
        }
        let mode = if request.async_execution {
            ExecMode::Async
        } else {
            ExecMode::Sync
        };
        let context = self
            .manager
            .create_context(mode, Duration::from_secs(request.keep_alive_secs as u64))?;
        debug!(
            context_id = %context.id(),
            version = request.version,
            rendezvous_id = request.rendezvous_id,
            "CreateContext"
        );
        Ok(CreateContextResponse {
            context_id: context.id(),
            devices: context.devices().to_vec(),
        })
    }

    pub async fn enqueue(
        &self,
        request: EnqueueRequest,
    ) -> Result<EnqueueResponse, CoordinationError> {
        let context = self.manager.get(request.context_id)?;
        context.touch();
        debug!(
            context_id = %request.context_id,
            items = request.items.len(),
            "Enqueue"
        );
        let responses = context.queue().enqueue(request.items).await?;
        Ok(EnqueueResponse { responses })
    }

    pub async fn wait_queue_done(
        &self,
        request: WaitQueueDoneRequest,
    ) -> Result<(), CoordinationError> {
        let context = self.manager.get(request.context_id)?;
        context.touch();
        context.queue().wait_done(&request.op_ids).await
    }

    /// Refresh the keep-alive deadline. A closed or reaped context answers
    /// `NotFound`, never a silent success: the client must restart the
    /// session.
    pub fn keep_alive(&self, request: KeepAliveRequest) -> Result<(), CoordinationError> {
        let context = self.manager.get(request.context_id)?;
        context.touch();
        Ok(())
    }

    pub async fn close_context(
        &self,
        request: CloseContextRequest,
    ) -> Result<(), CoordinationError> {
        self.manager.close_context(request.context_id).await
    }

    pub fn register_function(
        &self,
        request: RegisterFunctionRequest,
    ) -> Result<(), CoordinationError> {
        let context = self.manager.get(request.context_id)?;
        context.touch();
        context.functions().register(request.function)
    }

    /// Inject externally supplied tensors under a client-chosen op id,
    /// bypassing the executor. The id is admitted to the queue before any
    /// value is recorded, so an id that collides with a submitted operation
    /// is rejected without leaving tensors behind.
    pub fn send_tensor(&self, request: SendTensorRequest) -> Result<(), CoordinationError> {
        let context = self.manager.get(request.context_id)?;
        context.touch();

        if !request.device.is_empty()
            && !context.devices().iter().any(|d| d.name == request.device)
        {
            return Err(CoordinationError::InvalidArgument(format!(
                "unknown target device: {}",
                request.device
            )));
        }
        if request.tensors.is_empty() {
            return Err(CoordinationError::InvalidArgument(
                "SendTensor requires at least one tensor".to_string(),
            ));
        }

        context
            .queue()
            .inject_completed(request.op_id, request.tensors)?;
        debug!(
            context_id = %request.context_id,
            op_id = request.op_id,
            "SendTensor"
        );
        Ok(())
    }
}
