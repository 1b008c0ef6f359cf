//! Host-side tensor values used as dummy inputs and model parameters.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::error::ExportError;

/// Element type. Codes follow `TensorProto.DataType` in onnx.proto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    F32,
    U8,
    I8,
    I32,
    I64,
    Bool,
}

impl DataType {
    pub fn onnx_code(&self) -> i32 {
        match self {
            DataType::F32 => 1,
            DataType::U8 => 2,
            DataType::I8 => 3,
            DataType::I32 => 6,
            DataType::I64 => 7,
            DataType::Bool => 9,
        }
    }

    pub fn from_onnx_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(DataType::F32),
            2 => Some(DataType::U8),
            3 => Some(DataType::I8),
            6 => Some(DataType::I32),
            7 => Some(DataType::I64),
            9 => Some(DataType::Bool),
            _ => None,
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::U8 | DataType::I8 | DataType::Bool => 1,
            DataType::F32 | DataType::I32 => 4,
            DataType::I64 => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::F32 => "float32",
            DataType::U8 => "uint8",
            DataType::I8 => "int8",
            DataType::I32 => "int32",
            DataType::I64 => "int64",
            DataType::Bool => "bool",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    U8(Vec<u8>),
    I8(Vec<i8>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    Bool(Vec<bool>),
}

impl TensorData {
    pub fn dtype(&self) -> DataType {
        match self {
            TensorData::F32(_) => DataType::F32,
            TensorData::U8(_) => DataType::U8,
            TensorData::I8(_) => DataType::I8,
            TensorData::I32(_) => DataType::I32,
            TensorData::I64(_) => DataType::I64,
            TensorData::Bool(_) => DataType::Bool,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::U8(v) => v.len(),
            TensorData::I8(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::I64(v) => v.len(),
            TensorData::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A dense, row-major tensor placed on a device.
///
/// Placement is bookkeeping only: the exporter records ops, it never runs
/// kernels, so moving a tensor does not copy data anywhere.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
    device: Device,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: TensorData) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(ExportError::SignatureMismatch(format!(
                "tensor of shape {:?} needs {} elements, got {}",
                shape,
                expected,
                data.len()
            ))
            .into());
        }
        Ok(Self {
            shape,
            data,
            device: Device::Cpu,
        })
    }

    pub fn from_f32(shape: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        Self::new(shape, TensorData::F32(values))
    }

    pub fn from_i64(shape: Vec<usize>, values: Vec<i64>) -> Result<Self> {
        Self::new(shape, TensorData::I64(values))
    }

    pub fn zeros(shape: Vec<usize>, dtype: DataType) -> Self {
        let n: usize = shape.iter().product();
        let data = match dtype {
            DataType::F32 => TensorData::F32(vec![0.0; n]),
            DataType::U8 => TensorData::U8(vec![0; n]),
            DataType::I8 => TensorData::I8(vec![0; n]),
            DataType::I32 => TensorData::I32(vec![0; n]),
            DataType::I64 => TensorData::I64(vec![0; n]),
            DataType::Bool => TensorData::Bool(vec![false; n]),
        };
        Self {
            shape,
            data,
            device: Device::Cpu,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.data.dtype()
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn to_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Little-endian raw bytes, the layout of `TensorProto.raw_data`.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match &self.data {
            TensorData::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::U8(v) => v.clone(),
            TensorData::I8(v) => v.iter().map(|x| *x as u8).collect(),
            TensorData::I32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::I64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::Bool(v) => v.iter().map(|x| *x as u8).collect(),
        }
    }

    pub fn from_le_bytes(dtype: DataType, shape: Vec<usize>, bytes: &[u8]) -> Result<Self> {
        let width = dtype.size_in_bytes();
        if bytes.len() % width != 0 {
            return Err(ExportError::InvalidGraph(format!(
                "{} bytes is not a whole number of {} elements",
                bytes.len(),
                dtype.name()
            ))
            .into());
        }
        let data = match dtype {
            DataType::F32 => TensorData::F32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DataType::U8 => TensorData::U8(bytes.to_vec()),
            DataType::I8 => TensorData::I8(bytes.iter().map(|b| *b as i8).collect()),
            DataType::I32 => TensorData::I32(
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DataType::I64 => TensorData::I64(
                bytes
                    .chunks_exact(8)
                    .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            ),
            DataType::Bool => TensorData::Bool(bytes.iter().map(|b| *b != 0).collect()),
        };
        Self::new(shape, data)
    }
}

/// Placeholder input that drives graph capture: one tensor or a tuple.
#[derive(Debug, Clone, PartialEq)]
pub enum DummyInput {
    Single(Tensor),
    Tuple(Vec<Tensor>),
}

impl DummyInput {
    pub fn tensors(&self) -> Vec<&Tensor> {
        match self {
            DummyInput::Single(t) => vec![t],
            DummyInput::Tuple(ts) => ts.iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DummyInput::Single(_) => 1,
            DummyInput::Tuple(ts) => ts.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_device(self, device: Device) -> Self {
        match self {
            DummyInput::Single(t) => DummyInput::Single(t.to_device(device)),
            DummyInput::Tuple(ts) => {
                DummyInput::Tuple(ts.into_iter().map(|t| t.to_device(device)).collect())
            }
        }
    }
}

impl From<Tensor> for DummyInput {
    fn from(tensor: Tensor) -> Self {
        DummyInput::Single(tensor)
    }
}

impl From<Vec<Tensor>> for DummyInput {
    fn from(tensors: Vec<Tensor>) -> Self {
        DummyInput::Tuple(tensors)
    }
}
