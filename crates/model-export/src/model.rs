//! The model-side contract of the exporter.
//!
//! A model crate implements [`ExportSource`] on its top-level model and
//! [`ExportableModel`] on every sub-network it wants on disk (for example an
//! encoder and a decoder exported as two graphs).

use anyhow::Result;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use tracing::debug;

use crate::device::Device;
use crate::tensor::DummyInput;
use crate::tracer::{TracedGraph, Tracer, Value};

/// Input/output name -> (axis index -> symbolic dimension name).
pub type DynamicAxes = BTreeMap<String, BTreeMap<usize, String>>;

/// Options forwarded untouched to [`ExportSource::export`].
pub type PassthroughOptions = Map<String, JsonValue>;

pub trait ExportableModel {
    /// Base file name of the artifact, without extension.
    fn export_name(&self) -> &str;

    fn export_dummy_inputs(&self) -> Result<DummyInput>;

    fn export_input_names(&self) -> Vec<String>;

    fn export_output_names(&self) -> Vec<String>;

    fn export_dynamic_axes(&self) -> DynamicAxes {
        DynamicAxes::new()
    }

    /// Switch to inference behaviour (dropout off, frozen statistics).
    fn eval(&mut self);

    /// Move every parameter to `device`.
    fn to_device(&mut self, device: Device) -> Result<()>;

    /// Record the forward pass. `inputs` follow the order of the dummy
    /// input tuple.
    fn forward(&self, tracer: &mut Tracer, inputs: &[Value]) -> Result<Vec<Value>>;
}

/// What a top-level model hands the exporter: one network or several.
pub enum ModelScripts {
    Single(Box<dyn ExportableModel>),
    Many(Vec<Box<dyn ExportableModel>>),
}

impl ModelScripts {
    pub fn into_vec(self) -> Vec<Box<dyn ExportableModel>> {
        match self {
            ModelScripts::Single(model) => vec![model],
            ModelScripts::Many(models) => models,
        }
    }
}

pub trait ExportSource {
    fn export(&self, options: &PassthroughOptions) -> Result<ModelScripts>;
}

/// Record one forward pass of `model` over `inputs` on `device`.
pub fn trace_model(model: &dyn ExportableModel, inputs: &DummyInput, device: Device) -> Result<TracedGraph> {
    let mut tracer = Tracer::new(device);
    let values = inputs
        .tensors()
        .into_iter()
        .map(|t| tracer.input(t))
        .collect::<Result<Vec<_>>>()?;
    let outputs = model.forward(&mut tracer, &values)?;
    let graph = tracer.finish(&outputs)?;
    debug!(
        "Traced {}: {} inputs, {} ops, {} parameters, {} outputs",
        model.export_name(),
        graph.inputs.len(),
        graph.ops.len(),
        graph.parameters.len(),
        graph.outputs.len()
    );
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DataType, Tensor};

    struct Doubler;

    impl ExportableModel for Doubler {
        fn export_name(&self) -> &str {
            "doubler"
        }
        fn export_dummy_inputs(&self) -> Result<DummyInput> {
            Ok(Tensor::zeros(vec![1, 3], DataType::F32).into())
        }
        fn export_input_names(&self) -> Vec<String> {
            vec!["x".to_string()]
        }
        fn export_output_names(&self) -> Vec<String> {
            vec!["y".to_string()]
        }
        fn eval(&mut self) {}
        fn to_device(&mut self, _device: Device) -> Result<()> {
            Ok(())
        }
        fn forward(&self, tracer: &mut Tracer, inputs: &[Value]) -> Result<Vec<Value>> {
            Ok(vec![tracer.add(inputs[0], inputs[0])?])
        }
    }

    #[test]
    fn test_trace_model_records_forward() {
        let model = Doubler;
        let inputs = model.export_dummy_inputs().unwrap();
        let graph = trace_model(&model, &inputs, Device::Cpu).unwrap();
        assert_eq!(graph.inputs.len(), 1);
        assert_eq!(graph.ops.len(), 1);
        assert_eq!(graph.ops[0].op_type, "Add");
        assert_eq!(graph.outputs[0].shape, Some(vec![1, 3]));
    }

    #[test]
    fn test_model_scripts_normalize() {
        assert_eq!(ModelScripts::Single(Box::new(Doubler)).into_vec().len(), 1);
        let many = ModelScripts::Many(vec![Box::new(Doubler), Box::new(Doubler)]);
        assert_eq!(many.into_vec().len(), 2);
    }
}
