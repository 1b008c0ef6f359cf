//! Op recorder driven by a model's `forward`.
//!
//! A [`Tracer`] does not evaluate anything. Each call appends a node to the
//! recording and returns a symbolic [`Value`] with a propagated dtype and
//! (when known) shape. Whatever Rust control flow the model runs while
//! recording is resolved on the host, so only the branch actually taken for
//! the dummy input ends up in the trace: a branch that would run for other
//! inputs is silently absent from both the ONNX graph and the program
//! archive.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::device::Device;
use crate::error::ExportError;
use crate::tensor::{DataType, Tensor};

/// Handle to a value recorded by a [`Tracer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Value(usize);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Attribute {
    Int(i64),
    Float(f32),
    Str(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueInfo {
    pub name: String,
    pub dtype: DataType,
    /// `None` when a custom op did not declare its output shape.
    pub shape: Option<Vec<usize>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracedOp {
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: BTreeMap<String, Attribute>,
}

/// Result of one recording pass.
#[derive(Debug, Clone)]
pub struct TracedGraph {
    pub device: Device,
    pub inputs: Vec<ValueInfo>,
    pub parameters: Vec<(String, Tensor)>,
    pub ops: Vec<TracedOp>,
    pub outputs: Vec<ValueInfo>,
}

impl TracedGraph {
    /// Rename graph inputs positionally. Names beyond the traced inputs are
    /// an error; fewer names leave the remaining inputs untouched.
    pub fn rename_inputs(&mut self, names: &[String]) -> Result<()> {
        if names.len() > self.inputs.len() {
            return Err(ExportError::SignatureMismatch(format!(
                "{} input names for {} traced inputs",
                names.len(),
                self.inputs.len()
            ))
            .into());
        }
        let current: Vec<String> = self.inputs[..names.len()].iter().map(|i| i.name.clone()).collect();
        self.check_declared_names("input", &current, names)?;
        for (old, name) in current.iter().zip(names) {
            self.rename_value(old, name);
        }
        Ok(())
    }

    /// Rename graph outputs positionally, with the same rules as inputs.
    pub fn rename_outputs(&mut self, names: &[String]) -> Result<()> {
        if names.len() > self.outputs.len() {
            return Err(ExportError::SignatureMismatch(format!(
                "{} output names for {} traced outputs",
                names.len(),
                self.outputs.len()
            ))
            .into());
        }
        let current: Vec<String> = self.outputs[..names.len()].iter().map(|o| o.name.clone()).collect();
        self.check_declared_names("output", &current, names)?;
        for (old, name) in current.iter().zip(names) {
            self.rename_value(old, name);
        }
        Ok(())
    }

    /// Declared names must be unique and must not already name a different
    /// value, or renaming would merge two values into one.
    fn check_declared_names(&self, kind: &str, current: &[String], names: &[String]) -> Result<()> {
        let mut taken: HashSet<&str> = self
            .inputs
            .iter()
            .chain(self.outputs.iter())
            .map(|i| i.name.as_str())
            .chain(self.parameters.iter().map(|(name, _)| name.as_str()))
            .chain(self.ops.iter().flat_map(|op| op.outputs.iter().map(|o| o.as_str())))
            .collect();
        for old in current {
            taken.remove(old.as_str());
        }
        let mut declared = HashSet::new();
        for name in names {
            if !declared.insert(name.as_str()) {
                return Err(ExportError::SignatureMismatch(format!("{} name `{}` is declared twice", kind, name)).into());
            }
            if taken.contains(name.as_str()) {
                return Err(ExportError::SignatureMismatch(format!(
                    "{} name `{}` collides with another traced value",
                    kind, name
                ))
                .into());
            }
        }
        Ok(())
    }

    fn rename_value(&mut self, old: &str, new: &str) {
        if old == new {
            return;
        }
        for info in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            if info.name == old {
                info.name = new.to_string();
            }
        }
        for op in &mut self.ops {
            for name in op.inputs.iter_mut().chain(op.outputs.iter_mut()) {
                if name == old {
                    *name = new.to_string();
                }
            }
        }
    }
}

enum Origin {
    Input,
    Parameter,
    Op,
}

struct Slot {
    info: ValueInfo,
    origin: Origin,
}

pub struct Tracer {
    device: Device,
    slots: Vec<Slot>,
    inputs: Vec<Value>,
    parameters: Vec<(String, Tensor)>,
    parameter_index: HashMap<String, Value>,
    ops: Vec<TracedOp>,
    scopes: Vec<String>,
    node_names: HashMap<String, usize>,
    constants: usize,
}

impl Tracer {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            slots: Vec::new(),
            inputs: Vec::new(),
            parameters: Vec::new(),
            parameter_index: HashMap::new(),
            ops: Vec::new(),
            scopes: Vec::new(),
            node_names: HashMap::new(),
            constants: 0,
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn shape(&self, value: Value) -> Option<&[usize]> {
        self.slots[value.0].info.shape.as_deref()
    }

    pub fn dtype(&self, value: Value) -> DataType {
        self.slots[value.0].info.dtype
    }

    pub fn name(&self, value: Value) -> &str {
        &self.slots[value.0].info.name
    }

    fn check_device(&self, tensor: &Tensor) -> Result<()> {
        if tensor.device() != self.device {
            return Err(ExportError::DeviceMismatch {
                expected: self.device,
                found: tensor.device(),
            }
            .into());
        }
        Ok(())
    }

    fn push(&mut self, info: ValueInfo, origin: Origin) -> Value {
        self.slots.push(Slot { info, origin });
        Value(self.slots.len() - 1)
    }

    /// Register a graph input. Inputs are named `input_<n>` until renamed.
    pub fn input(&mut self, tensor: &Tensor) -> Result<Value> {
        self.check_device(tensor)?;
        let info = ValueInfo {
            name: format!("input_{}", self.inputs.len()),
            dtype: tensor.dtype(),
            shape: Some(tensor.shape().to_vec()),
        };
        let value = self.push(info, Origin::Input);
        self.inputs.push(value);
        Ok(value)
    }

    /// Register a named weight. Registering the same name twice returns the
    /// first value, so shared weights are stored once.
    pub fn parameter(&mut self, name: &str, tensor: &Tensor) -> Result<Value> {
        if let Some(value) = self.parameter_index.get(name) {
            return Ok(*value);
        }
        self.check_device(tensor)?;
        let info = ValueInfo {
            name: name.to_string(),
            dtype: tensor.dtype(),
            shape: Some(tensor.shape().to_vec()),
        };
        let value = self.push(info, Origin::Parameter);
        self.parameters.push((name.to_string(), tensor.clone()));
        self.parameter_index.insert(name.to_string(), value);
        Ok(value)
    }

    /// Anonymous constant, stored alongside the parameters.
    pub fn constant(&mut self, tensor: Tensor) -> Result<Value> {
        let tensor = tensor.to_device(self.device);
        let name = format!("{}/Constant_{}", self.scope_prefix(), self.constants);
        self.constants += 1;
        self.parameter(&name, &tensor)
    }

    /// Run `f` with `name` appended to the node-name scope.
    pub fn scoped<R>(&mut self, name: &str, f: impl FnOnce(&mut Self) -> R) -> R {
        self.scopes.push(name.to_string());
        let result = f(self);
        self.scopes.pop();
        result
    }

    fn scope_prefix(&self) -> String {
        let mut prefix = String::new();
        for scope in &self.scopes {
            prefix.push('/');
            prefix.push_str(scope);
        }
        prefix
    }

    fn node_name(&mut self, op_type: &str) -> String {
        let base = format!("{}/{}", self.scope_prefix(), op_type);
        let seen = self.node_names.entry(base.clone()).or_insert(0);
        let name = if *seen == 0 {
            base
        } else {
            format!("{}_{}", base, seen)
        };
        *seen += 1;
        name
    }

    /// Record an op with explicitly declared outputs.
    pub fn custom_op(
        &mut self,
        op_type: &str,
        inputs: &[Value],
        attributes: BTreeMap<String, Attribute>,
        outputs: Vec<(DataType, Option<Vec<usize>>)>,
    ) -> Result<Vec<Value>> {
        let name = self.node_name(op_type);
        let input_names = inputs.iter().map(|v| self.name(*v).to_string()).collect();
        let mut values = Vec::with_capacity(outputs.len());
        let mut output_names = Vec::with_capacity(outputs.len());
        for (index, (dtype, shape)) in outputs.into_iter().enumerate() {
            let value_name = format!("{}_output_{}", name, index);
            output_names.push(value_name.clone());
            values.push(self.push(
                ValueInfo {
                    name: value_name,
                    dtype,
                    shape,
                },
                Origin::Op,
            ));
        }
        self.ops.push(TracedOp {
            name,
            op_type: op_type.to_string(),
            inputs: input_names,
            outputs: output_names,
            attributes,
        });
        Ok(values)
    }

    fn single(
        &mut self,
        op_type: &str,
        inputs: &[Value],
        attributes: BTreeMap<String, Attribute>,
        dtype: DataType,
        shape: Option<Vec<usize>>,
    ) -> Result<Value> {
        let mut outputs = self.custom_op(op_type, inputs, attributes, vec![(dtype, shape)])?;
        Ok(outputs.remove(0))
    }

    fn elementwise(&mut self, op_type: &str, a: Value, b: Value) -> Result<Value> {
        let shape = match (self.shape(a), self.shape(b)) {
            (Some(sa), Some(sb)) => Some(broadcast(sa, sb).ok_or_else(|| {
                ExportError::SignatureMismatch(format!(
                    "{}: shapes {:?} and {:?} do not broadcast",
                    op_type, sa, sb
                ))
            })?),
            _ => None,
        };
        let dtype = self.dtype(a);
        self.single(op_type, &[a, b], BTreeMap::new(), dtype, shape)
    }

    fn unary(&mut self, op_type: &str, x: Value, attributes: BTreeMap<String, Attribute>) -> Result<Value> {
        let shape = self.shape(x).map(|s| s.to_vec());
        let dtype = self.dtype(x);
        self.single(op_type, &[x], attributes, dtype, shape)
    }

    pub fn add(&mut self, a: Value, b: Value) -> Result<Value> {
        self.elementwise("Add", a, b)
    }

    pub fn mul(&mut self, a: Value, b: Value) -> Result<Value> {
        self.elementwise("Mul", a, b)
    }

    pub fn relu(&mut self, x: Value) -> Result<Value> {
        self.unary("Relu", x, BTreeMap::new())
    }

    pub fn tanh(&mut self, x: Value) -> Result<Value> {
        self.unary("Tanh", x, BTreeMap::new())
    }

    pub fn sigmoid(&mut self, x: Value) -> Result<Value> {
        self.unary("Sigmoid", x, BTreeMap::new())
    }

    pub fn softmax(&mut self, x: Value, axis: i64) -> Result<Value> {
        let mut attributes = BTreeMap::new();
        attributes.insert("axis".to_string(), Attribute::Int(axis));
        self.unary("Softmax", x, attributes)
    }

    pub fn matmul(&mut self, a: Value, b: Value) -> Result<Value> {
        let shape = match (self.shape(a), self.shape(b)) {
            (Some(sa), Some(sb)) => Some(matmul_shape(sa, sb).ok_or_else(|| {
                ExportError::SignatureMismatch(format!(
                    "MatMul: shapes {:?} and {:?} are incompatible",
                    sa, sb
                ))
            })?),
            _ => None,
        };
        let dtype = self.dtype(a);
        self.single("MatMul", &[a, b], BTreeMap::new(), dtype, shape)
    }

    pub fn gather(&mut self, data: Value, indices: Value, axis: i64) -> Result<Value> {
        let shape = match (self.shape(data), self.shape(indices)) {
            (Some(sd), Some(si)) => {
                let axis = normalize_axis(axis, sd.len()).ok_or_else(|| {
                    ExportError::SignatureMismatch(format!("Gather: axis {} out of range for {:?}", axis, sd))
                })?;
                let mut shape = sd[..axis].to_vec();
                shape.extend_from_slice(si);
                shape.extend_from_slice(&sd[axis + 1..]);
                Some(shape)
            }
            _ => None,
        };
        let mut attributes = BTreeMap::new();
        attributes.insert("axis".to_string(), Attribute::Int(axis));
        let dtype = self.dtype(data);
        self.single("Gather", &[data, indices], attributes, dtype, shape)
    }

    pub fn transpose(&mut self, x: Value, perm: &[usize]) -> Result<Value> {
        let shape = match self.shape(x) {
            Some(sx) => {
                if perm.len() != sx.len() || perm.iter().any(|p| *p >= sx.len()) {
                    return Err(ExportError::SignatureMismatch(format!(
                        "Transpose: perm {:?} does not fit shape {:?}",
                        perm, sx
                    ))
                    .into());
                }
                Some(perm.iter().map(|p| sx[*p]).collect())
            }
            None => None,
        };
        let mut attributes = BTreeMap::new();
        attributes.insert(
            "perm".to_string(),
            Attribute::Ints(perm.iter().map(|p| *p as i64).collect()),
        );
        let dtype = self.dtype(x);
        self.single("Transpose", &[x], attributes, dtype, shape)
    }

    /// `Reshape` with ONNX semantics: `0` copies the input dim, `-1` is
    /// inferred from the remaining elements.
    pub fn reshape(&mut self, x: Value, target: &[i64]) -> Result<Value> {
        let shape = match self.shape(x) {
            Some(sx) => Some(reshape_shape(sx, target).ok_or_else(|| {
                ExportError::SignatureMismatch(format!("Reshape: {:?} cannot become {:?}", sx, target))
            })?),
            None => None,
        };
        let target_tensor = Tensor::from_i64(vec![target.len()], target.to_vec())?;
        let target_value = self.constant(target_tensor)?;
        let dtype = self.dtype(x);
        self.single("Reshape", &[x, target_value], BTreeMap::new(), dtype, shape)
    }

    pub fn concat(&mut self, values: &[Value], axis: i64) -> Result<Value> {
        let first = values
            .first()
            .copied()
            .ok_or_else(|| ExportError::SignatureMismatch("Concat of no values".to_string()))?;
        let shapes: Option<Vec<Vec<usize>>> =
            values.iter().map(|v| self.shape(*v).map(|s| s.to_vec())).collect();
        let shape = match shapes {
            Some(shapes) => {
                let rank = shapes[0].len();
                let axis = normalize_axis(axis, rank).ok_or_else(|| {
                    ExportError::SignatureMismatch(format!("Concat: axis {} out of range", axis))
                })?;
                let mut out = shapes[0].clone();
                for s in &shapes[1..] {
                    let compatible = s.len() == rank
                        && s.iter().zip(&out).enumerate().all(|(i, (a, b))| i == axis || a == b);
                    if !compatible {
                        return Err(ExportError::SignatureMismatch(format!(
                            "Concat: {:?} does not line up with {:?} on axis {}",
                            s, out, axis
                        ))
                        .into());
                    }
                    out[axis] += s[axis];
                }
                Some(out)
            }
            None => None,
        };
        let mut attributes = BTreeMap::new();
        attributes.insert("axis".to_string(), Attribute::Int(axis));
        let dtype = self.dtype(first);
        self.single("Concat", values, attributes, dtype, shape)
    }

    /// Close the recording. Outputs that are not produced by an op (a
    /// passed-through input or weight) or that repeat get an `Identity`
    /// node so every graph output has a unique producer.
    pub fn finish(mut self, outputs: &[Value]) -> Result<TracedGraph> {
        if outputs.is_empty() {
            return Err(ExportError::SignatureMismatch("forward returned no outputs".to_string()).into());
        }
        let mut seen = Vec::with_capacity(outputs.len());
        let mut final_outputs = Vec::with_capacity(outputs.len());
        for value in outputs {
            let needs_identity =
                !matches!(self.slots[value.0].origin, Origin::Op) || seen.contains(value);
            seen.push(*value);
            let value = if needs_identity {
                let dtype = self.dtype(*value);
                let shape = self.shape(*value).map(|s| s.to_vec());
                self.single("Identity", &[*value], BTreeMap::new(), dtype, shape)?
            } else {
                *value
            };
            final_outputs.push(self.slots[value.0].info.clone());
        }
        let inputs = self.inputs.iter().map(|v| self.slots[v.0].info.clone()).collect();
        Ok(TracedGraph {
            device: self.device,
            inputs,
            parameters: self.parameters,
            ops: self.ops,
            outputs: final_outputs,
        })
    }
}

fn normalize_axis(axis: i64, rank: usize) -> Option<usize> {
    let rank = rank as i64;
    let axis = if axis < 0 { axis + rank } else { axis };
    (0..rank).contains(&axis).then_some(axis as usize)
}

fn broadcast(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

fn matmul_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    match (a.len(), b.len()) {
        (0, _) | (_, 0) => None,
        (1, 1) => (a[0] == b[0]).then(Vec::new),
        (1, nb) => {
            if a[0] != b[nb - 2] {
                return None;
            }
            let mut out = b[..nb - 2].to_vec();
            out.push(b[nb - 1]);
            Some(out)
        }
        (na, 1) => (a[na - 1] == b[0]).then(|| a[..na - 1].to_vec()),
        (na, nb) => {
            if a[na - 1] != b[nb - 2] {
                return None;
            }
            let mut out = broadcast(&a[..na - 2], &b[..nb - 2])?;
            out.push(a[na - 2]);
            out.push(b[nb - 1]);
            Some(out)
        }
    }
}

fn reshape_shape(input: &[usize], target: &[i64]) -> Option<Vec<usize>> {
    let total: usize = input.iter().product();
    let mut out = Vec::with_capacity(target.len());
    let mut inferred = None;
    for (i, dim) in target.iter().enumerate() {
        match *dim {
            -1 if inferred.is_none() => {
                inferred = Some(i);
                out.push(1);
            }
            0 => out.push(*input.get(i)?),
            d if d > 0 => out.push(d as usize),
            _ => return None,
        }
    }
    let known: usize = out.iter().product();
    match inferred {
        Some(i) => {
            if known == 0 || total % known != 0 {
                return None;
            }
            out[i] = total / known;
        }
        None if known != total => return None,
        None => {}
    }
    Some(out)
}
