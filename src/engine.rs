//! Kernel execution port.
//!
//! The coordinator never computes tensor values itself; a `KernelEngine`
//! implementation is injected at construction and invoked by the operation
//! queue with resolved inputs. The built-in `ArithmeticEngine` covers the
//! daemon default and the test surface.

use crate::error::CoordinationError;
use crate::types::{AttrValue, FunctionDef, Operation, TensorValue};
use async_trait::async_trait;
use std::sync::Arc;

/// How an operation name was resolved before execution.
///
/// Resolution happens once per operation, in the queue, against the
/// context's function registry; the engine only sees the result.
#[derive(Clone)]
pub enum Dispatch {
    /// The name refers to a primitive kernel known to the engine.
    Primitive,
    /// The name refers to a function registered in the context.
    Function(Arc<FunctionDef>),
}

/// Port for the external kernel/function execution collaborator.
#[async_trait]
pub trait KernelEngine: Send + Sync {
    /// Execute one operation with fully resolved input values.
    ///
    /// On success returns one tensor per declared output, in output order.
    async fn execute(
        &self,
        op: &Operation,
        dispatch: Dispatch,
        inputs: Vec<Arc<TensorValue>>,
    ) -> Result<Vec<TensorValue>, CoordinationError>;
}

/// A small element-wise engine over f64 tensors.
///
/// Supported primitives: `Const` (attr `value`), `Identity`, `Add`, `Sub`,
/// `Mul`, `Div`, `Neg`. Registered functions delegate to the primitive named
/// by the `op` field of their body.
#[derive(Default)]
pub struct ArithmeticEngine;

impl ArithmeticEngine {
    pub fn new() -> Self {
        Self
    }

    fn unary(
        inputs: &[Arc<TensorValue>],
        f: impl Fn(f64) -> f64,
    ) -> Result<Vec<TensorValue>, CoordinationError> {
        let [a] = inputs else {
            return Err(CoordinationError::InvalidArgument(
                "unary kernel expects exactly one input".to_string(),
            ));
        };
        let values = decode(a)?;
        let out: Vec<f64> = values.iter().copied().map(f).collect();
        Ok(vec![TensorValue::from_f64s(a.shape.clone(), &out)])
    }

    fn binary(
        inputs: &[Arc<TensorValue>],
        f: impl Fn(f64, f64) -> Result<f64, CoordinationError>,
    ) -> Result<Vec<TensorValue>, CoordinationError> {
        let [a, b] = inputs else {
            return Err(CoordinationError::InvalidArgument(
                "binary kernel expects exactly two inputs".to_string(),
            ));
        };
        if a.shape != b.shape {
            return Err(CoordinationError::InvalidArgument(format!(
                "shape mismatch: {:?} vs {:?}",
                a.shape, b.shape
            )));
        }
        let (xs, ys) = (decode(a)?, decode(b)?);
        let mut out = Vec::with_capacity(xs.len());
        for (x, y) in xs.iter().zip(ys.iter()) {
            out.push(f(*x, *y)?);
        }
        Ok(vec![TensorValue::from_f64s(a.shape.clone(), &out)])
    }

    fn run_primitive(
        &self,
        name: &str,
        op: &Operation,
        inputs: &[Arc<TensorValue>],
    ) -> Result<Vec<TensorValue>, CoordinationError> {
        match name {
            "Const" => {
                let value = match op.attrs.get("value") {
                    Some(AttrValue::Float(v)) => *v,
                    Some(AttrValue::Int(v)) => *v as f64,
                    _ => {
                        return Err(CoordinationError::InvalidArgument(
                            "Const requires a numeric 'value' attribute".to_string(),
                        ))
                    }
                };
                Ok(vec![TensorValue::scalar_f64(value)])
            }
            "Identity" => Self::unary(inputs, |x| x),
            "Neg" => Self::unary(inputs, |x| -x),
            "Add" => Self::binary(inputs, |x, y| Ok(x + y)),
            "Sub" => Self::binary(inputs, |x, y| Ok(x - y)),
            "Mul" => Self::binary(inputs, |x, y| Ok(x * y)),
            "Div" => Self::binary(inputs, |x, y| {
                if y == 0.0 {
                    Err(CoordinationError::Internal("division by zero".to_string()))
                } else {
                    Ok(x / y)
                }
            }),
            other => Err(CoordinationError::NotFound(format!(
                "unknown kernel: {}",
                other
            ))),
        }
    }
}

fn decode(value: &TensorValue) -> Result<Vec<f64>, CoordinationError> {
    value.as_f64s().ok_or_else(|| {
        CoordinationError::InvalidArgument(format!(
            "arithmetic engine only handles F64 tensors, got {:?}",
            value.dtype
        ))
    })
}

#[async_trait]
impl KernelEngine for ArithmeticEngine {
    async fn execute(
        &self,
        op: &Operation,
        dispatch: Dispatch,
        inputs: Vec<Arc<TensorValue>>,
    ) -> Result<Vec<TensorValue>, CoordinationError> {
        match dispatch {
            Dispatch::Primitive => self.run_primitive(&op.name, op, &inputs),
            Dispatch::Function(def) => {
                let delegate = def
                    .body
                    .get("op")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        CoordinationError::InvalidArgument(format!(
                            "function {} has no 'op' field in its body",
                            def.name
                        ))
                    })?;
                self.run_primitive(delegate, op, &inputs)
            }
        }
    }
}
