//! Integration tests for asynchronous scheduling and dependency ordering
//!
//! Tests cover:
//! - Out-of-order admission (consumer enqueued before its producer)
//! - Control-dependency gating and failure propagation
//! - Deferred error surfacing through WaitQueueDone
//! - Duplicate operation identifiers
//! - Concurrent independent operations

use opflow::context::ContextManager;
use opflow::devices::LocalCpuProvider;
use opflow::engine::ArithmeticEngine;
use opflow::error::CoordinationError;
use opflow::queue::OpState;
use opflow::service::{
    CoordinatorService, CreateContextRequest, EnqueueRequest, SendTensorRequest,
    WaitQueueDoneRequest,
};
use opflow::types::{
    AttrValue, ContextId, OpInput, Operation, QueueItem, RemoteTensorHandle, TensorValue,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn create_test_service() -> CoordinatorService {
    let manager = Arc::new(ContextManager::new(
        Arc::new(ArithmeticEngine::new()),
        Arc::new(LocalCpuProvider::new(1)),
        Duration::from_millis(50),
    ));
    CoordinatorService::new(manager)
}

fn create_async_context(service: &CoordinatorService) -> ContextId {
    service
        .create_context(CreateContextRequest {
            server_descriptor: None,
            async_execution: true,
            keep_alive_secs: 60,
            version: 1,
            rendezvous_id: 0,
        })
        .unwrap()
        .context_id
}

fn const_item(id: i64, value: f64) -> QueueItem {
    let mut attrs = HashMap::new();
    attrs.insert("value".to_string(), AttrValue::Float(value));
    QueueItem::Operation(Operation {
        id,
        name: "Const".to_string(),
        inputs: vec![],
        control_deps: vec![],
        attrs,
        device: String::new(),
    })
}

fn div_by_zero_item(id: i64) -> QueueItem {
    QueueItem::Operation(Operation {
        id,
        name: "Div".to_string(),
        inputs: vec![
            OpInput::Value(TensorValue::scalar_f64(1.0)),
            OpInput::Value(TensorValue::scalar_f64(0.0)),
        ],
        control_deps: vec![],
        attrs: HashMap::new(),
        device: String::new(),
    })
}

#[tokio::test]
async fn test_consumer_enqueued_before_producer() {
    let service = create_test_service();
    let context_id = create_async_context(&service);

    // Op 2 references op 1's output before op 1 exists.
    service
        .enqueue(EnqueueRequest {
            context_id,
            items: vec![QueueItem::Operation(Operation {
                id: 2,
                name: "Add".to_string(),
                inputs: vec![
                    OpInput::Handle(RemoteTensorHandle::new(1, 0)),
                    OpInput::Handle(RemoteTensorHandle::new(1, 0)),
                ],
                control_deps: vec![],
                attrs: HashMap::new(),
                device: String::new(),
            })],
        })
        .await
        .unwrap();

    let context = service.manager().get(context_id).unwrap();
    assert_eq!(context.queue().op_state(2), Some(OpState::Pending));

    service
        .enqueue(EnqueueRequest {
            context_id,
            items: vec![const_item(1, 21.0)],
        })
        .await
        .unwrap();

    service
        .wait_queue_done(WaitQueueDoneRequest {
            context_id,
            op_ids: vec![1, 2],
        })
        .await
        .unwrap();
    assert_eq!(context.queue().op_state(1), Some(OpState::Completed));
    assert_eq!(context.queue().op_state(2), Some(OpState::Completed));
    assert_eq!(
        context.handles().resolve(2, 0).unwrap().as_f64s().unwrap(),
        vec![42.0]
    );
}

#[tokio::test]
async fn test_control_dependency_failure_marks_dependent() {
    let service = create_test_service();
    let context_id = create_async_context(&service);

    let mut gated = const_item(2, 5.0);
    if let QueueItem::Operation(ref mut op) = gated {
        op.control_deps = vec![1];
    }

    service
        .enqueue(EnqueueRequest {
            context_id,
            items: vec![div_by_zero_item(1), gated],
        })
        .await
        .unwrap();

    let err = service
        .wait_queue_done(WaitQueueDoneRequest {
            context_id,
            op_ids: vec![2],
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoordinationError::DependencyFailed { op_id: 1, .. }
    ));

    // The dependent never ran, so it produced nothing.
    let context = service.manager().get(context_id).unwrap();
    assert!(context.handles().resolve(2, 0).is_err());
}

#[tokio::test]
async fn test_async_failure_surfaces_only_at_wait() {
    let service = create_test_service();
    let context_id = create_async_context(&service);

    // Admission succeeds even though execution will fail.
    service
        .enqueue(EnqueueRequest {
            context_id,
            items: vec![div_by_zero_item(1)],
        })
        .await
        .unwrap();

    let err = service
        .wait_queue_done(WaitQueueDoneRequest {
            context_id,
            op_ids: vec![],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::Internal(_)));
}

#[tokio::test]
async fn test_failed_input_producer_propagates() {
    let service = create_test_service();
    let context_id = create_async_context(&service);

    service
        .enqueue(EnqueueRequest {
            context_id,
            items: vec![
                div_by_zero_item(1),
                QueueItem::Operation(Operation {
                    id: 2,
                    name: "Identity".to_string(),
                    inputs: vec![OpInput::Handle(RemoteTensorHandle::new(1, 0))],
                    control_deps: vec![],
                    attrs: HashMap::new(),
                    device: String::new(),
                }),
            ],
        })
        .await
        .unwrap();

    let err = service
        .wait_queue_done(WaitQueueDoneRequest {
            context_id,
            op_ids: vec![2],
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoordinationError::DependencyFailed { op_id: 1, .. }
    ));
}

#[tokio::test]
async fn test_duplicate_operation_id_rejected() {
    let service = create_test_service();
    let context_id = create_async_context(&service);

    service
        .enqueue(EnqueueRequest {
            context_id,
            items: vec![const_item(1, 1.0)],
        })
        .await
        .unwrap();
    let err = service
        .enqueue(EnqueueRequest {
            context_id,
            items: vec![const_item(1, 2.0)],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_independent_ops_all_complete() {
    let service = create_test_service();
    let context_id = create_async_context(&service);

    let items: Vec<QueueItem> = (1..=20).map(|id| const_item(id, id as f64)).collect();
    service
        .enqueue(EnqueueRequest { context_id, items })
        .await
        .unwrap();

    service
        .wait_queue_done(WaitQueueDoneRequest {
            context_id,
            op_ids: vec![],
        })
        .await
        .unwrap();

    let context = service.manager().get(context_id).unwrap();
    let stats = context.queue().stats();
    assert_eq!(stats.completed, 20);
    assert_eq!(stats.failed, 0);
    assert_eq!(context.handles().len(), 20);
}

#[tokio::test]
async fn test_release_after_consumer_preserves_submission_order() {
    // A batch of producer, consumer, release: the release must never free
    // the handle before the consumer resolves it, whichever task runs first.
    for _ in 0..100 {
        let service = create_test_service();
        let context_id = create_async_context(&service);

        service
            .enqueue(EnqueueRequest {
                context_id,
                items: vec![
                    const_item(1, 21.0),
                    QueueItem::Operation(Operation {
                        id: 2,
                        name: "Add".to_string(),
                        inputs: vec![
                            OpInput::Handle(RemoteTensorHandle::new(1, 0)),
                            OpInput::Handle(RemoteTensorHandle::new(1, 0)),
                        ],
                        control_deps: vec![],
                        attrs: HashMap::new(),
                        device: String::new(),
                    }),
                    QueueItem::Release(RemoteTensorHandle::new(1, 0)),
                ],
            })
            .await
            .unwrap();

        service
            .wait_queue_done(WaitQueueDoneRequest {
                context_id,
                op_ids: vec![2],
            })
            .await
            .unwrap();

        let context = service.manager().get(context_id).unwrap();
        assert_eq!(
            context.handles().resolve(2, 0).unwrap().as_f64s().unwrap(),
            vec![42.0]
        );
    }
}

#[tokio::test]
async fn test_send_tensor_against_admitted_id_leaves_no_orphans() {
    let service = create_test_service();
    let context_id = create_async_context(&service);

    // Op 5 is admitted but blocked on op 4, which does not exist yet.
    service
        .enqueue(EnqueueRequest {
            context_id,
            items: vec![QueueItem::Operation(Operation {
                id: 5,
                name: "Add".to_string(),
                inputs: vec![
                    OpInput::Handle(RemoteTensorHandle::new(4, 0)),
                    OpInput::Handle(RemoteTensorHandle::new(4, 0)),
                ],
                control_deps: vec![],
                attrs: HashMap::new(),
                device: String::new(),
            })],
        })
        .await
        .unwrap();

    let err = service
        .send_tensor(SendTensorRequest {
            context_id,
            op_id: 5,
            tensors: vec![TensorValue::scalar_f64(9.0)],
            device: String::new(),
        })
        .unwrap_err();
    assert!(matches!(err, CoordinationError::InvalidArgument(_)));

    // The rejected injection recorded nothing under op 5.
    let context = service.manager().get(context_id).unwrap();
    assert!(context.handles().resolve(5, 0).is_err());

    // The real producer arrives and op 5 executes into its own slots.
    service
        .send_tensor(SendTensorRequest {
            context_id,
            op_id: 4,
            tensors: vec![TensorValue::scalar_f64(21.0)],
            device: String::new(),
        })
        .unwrap();
    service
        .wait_queue_done(WaitQueueDoneRequest {
            context_id,
            op_ids: vec![5],
        })
        .await
        .unwrap();
    assert_eq!(
        context.handles().resolve(5, 0).unwrap().as_f64s().unwrap(),
        vec![42.0]
    );
}

#[tokio::test]
async fn test_release_interleaved_with_async_execution() {
    let service = create_test_service();
    let context_id = create_async_context(&service);

    // Release submitted in the same call as the producer; the handle table
    // absorbs either ordering.
    service
        .enqueue(EnqueueRequest {
            context_id,
            items: vec![
                const_item(1, 3.0),
                QueueItem::Release(RemoteTensorHandle::new(1, 0)),
            ],
        })
        .await
        .unwrap();

    service
        .wait_queue_done(WaitQueueDoneRequest {
            context_id,
            op_ids: vec![1],
        })
        .await
        .unwrap();

    let context = service.manager().get(context_id).unwrap();
    // Closing drains any deferred release task; nothing may leak.
    service
        .close_context(opflow::service::CloseContextRequest { context_id })
        .await
        .unwrap();
    assert!(context.handles().is_empty());
}
