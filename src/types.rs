//! Core identifier and value types shared across the coordinator.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Client-assigned operation identifier, unique within one context.
pub type OpId = i64;

/// Opaque context identifier.
///
/// A 64-bit random value, hex-rendered for logs and wire messages. Collision
/// resistance (plus an allocation-time check against the live table) is what
/// guarantees a destroyed identifier is never observed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(u64);

impl ContextId {
    pub fn from_raw(raw: u64) -> Self {
        ContextId(raw)
    }

    pub fn random() -> Self {
        ContextId(rand::random::<u64>())
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0.to_be_bytes()))
    }
}

/// Reference to one output slot of one operation.
///
/// Used both as an operation input and as the unit of explicit release.
/// Ownership is tracked centrally by the handle table, not by this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteTensorHandle {
    pub op_id: OpId,
    pub output: u32,
}

impl RemoteTensorHandle {
    pub fn new(op_id: OpId, output: u32) -> Self {
        Self { op_id, output }
    }
}

/// Element type of a tensor payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
}

impl DType {
    pub fn byte_width(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }
}

/// An opaque tensor payload: dtype, shape, and little-endian element bytes.
///
/// The coordinator never interprets the data beyond shape metadata; the
/// f64 helpers exist for the built-in arithmetic engine and for tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorValue {
    pub dtype: DType,
    pub shape: Vec<i64>,
    pub data: Vec<u8>,
}

impl TensorValue {
    pub fn from_f64s(shape: Vec<i64>, values: &[f64]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            dtype: DType::F64,
            shape,
            data,
        }
    }

    pub fn scalar_f64(value: f64) -> Self {
        Self::from_f64s(vec![], &[value])
    }

    pub fn num_elements(&self) -> usize {
        self.data.len() / self.dtype.byte_width()
    }

    /// Decode the payload as f64 elements. Returns `None` for non-F64 dtypes.
    pub fn as_f64s(&self) -> Option<Vec<f64>> {
        if self.dtype != DType::F64 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        )
    }
}

/// Named attribute attached to an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

/// One input of an operation: a literal value or a reference to another
/// operation's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpInput {
    Value(TensorValue),
    Handle(RemoteTensorHandle),
}

/// One client-submitted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Client-assigned id; becomes the namespace for this op's outputs.
    pub id: OpId,
    /// Kernel or registered-function name to invoke.
    pub name: String,
    /// Ordered inputs.
    pub inputs: Vec<OpInput>,
    /// Explicit ordering constraints independent of data flow.
    pub control_deps: Vec<OpId>,
    /// Named attributes handed to the kernel.
    pub attrs: HashMap<String, AttrValue>,
    /// Target device name; empty string means "any local device".
    pub device: String,
}

impl Operation {
    /// Op ids this operation's handle inputs reference.
    pub fn input_producers(&self) -> impl Iterator<Item = OpId> + '_ {
        self.inputs.iter().filter_map(|input| match input {
            OpInput::Handle(h) => Some(h.op_id),
            OpInput::Value(_) => None,
        })
    }
}

/// The unit enqueued by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueueItem {
    Operation(Operation),
    /// Decrement the reference count of one output handle.
    Release(RemoteTensorHandle),
}

/// One response slot per submitted queue item, in submission order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueResponse {
    /// Shape of each declared output. Populated as soon as known: immediately
    /// in synchronous mode, empty (deferred) in asynchronous mode, always
    /// empty for release items.
    pub output_shapes: Vec<Vec<i64>>,
}

/// A function registered in a context, immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    /// Opaque body consumed by the kernel engine.
    pub body: serde_json::Value,
}

/// One locally visible device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub kind: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_id_display_is_hex() {
        let id = ContextId::from_raw(0xdead_beef);
        assert_eq!(id.to_string(), "00000000deadbeef");
    }

    #[test]
    fn test_tensor_value_f64_round_trip() {
        let t = TensorValue::from_f64s(vec![3], &[1.0, -2.5, 4.0]);
        assert_eq!(t.num_elements(), 3);
        assert_eq!(t.as_f64s().unwrap(), vec![1.0, -2.5, 4.0]);
    }

    #[test]
    fn test_input_producers_skips_literals() {
        let op = Operation {
            id: 7,
            name: "Add".to_string(),
            inputs: vec![
                OpInput::Value(TensorValue::scalar_f64(1.0)),
                OpInput::Handle(RemoteTensorHandle::new(3, 0)),
            ],
            control_deps: vec![],
            attrs: HashMap::new(),
            device: String::new(),
        };
        assert_eq!(op.input_producers().collect::<Vec<_>>(), vec![3]);
    }
}
