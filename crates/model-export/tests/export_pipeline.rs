use anyhow::{bail, Result};
use model_export::device::{NoAccelerator, StaticProbe};
use model_export::onnx::proto::load_model;
use model_export::script::load_script;
use model_export::{
    export_with_probe, DataType, Device, DeviceRequest, DummyInput, ExportConfig, ExportError, ExportFormat,
    ExportSource, ExportableModel, ModelScripts, PassthroughOptions, Tensor, Tracer, Value,
};
use serde_json::json;
use std::cell::Cell;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::rc::Rc;

/// Two projections: `/encoder/MatMul` is quantizable, `/output/MatMul`
/// and `/bias_decoder/MatMul` must stay in float.
struct Projector {
    name: String,
    hidden: Tensor,
    head: Tensor,
    bias: Tensor,
    moved_to: Rc<Cell<Option<Device>>>,
}

impl Projector {
    fn new(name: &str) -> Self {
        let values = |n: usize, k: f32| (0..n).map(|i| (i as f32 - 5.0) * k).collect::<Vec<_>>();
        Self {
            name: name.to_string(),
            hidden: Tensor::from_f32(vec![4, 3], values(12, 0.1)).unwrap(),
            head: Tensor::from_f32(vec![3, 2], values(6, 0.3)).unwrap(),
            bias: Tensor::from_f32(vec![2, 2], values(4, 0.5)).unwrap(),
            moved_to: Rc::new(Cell::new(None)),
        }
    }
}

impl ExportableModel for Projector {
    fn export_name(&self) -> &str {
        &self.name
    }
    fn export_dummy_inputs(&self) -> Result<DummyInput> {
        Ok(Tensor::zeros(vec![2, 4], DataType::F32).into())
    }
    fn export_input_names(&self) -> Vec<String> {
        vec!["feats".to_string()]
    }
    fn export_output_names(&self) -> Vec<String> {
        vec!["logits".to_string()]
    }
    fn eval(&mut self) {}
    fn to_device(&mut self, device: Device) -> Result<()> {
        self.hidden = self.hidden.clone().to_device(device);
        self.head = self.head.clone().to_device(device);
        self.bias = self.bias.clone().to_device(device);
        self.moved_to.set(Some(device));
        Ok(())
    }
    fn forward(&self, tracer: &mut Tracer, inputs: &[Value]) -> Result<Vec<Value>> {
        let h = tracer.scoped("encoder", |t| -> Result<Value> {
            let w = t.parameter("encoder.weight", &self.hidden)?;
            let h = t.matmul(inputs[0], w)?;
            t.relu(h)
        })?;
        let logits = tracer.scoped("output", |t| -> Result<Value> {
            let w = t.parameter("output.weight", &self.head)?;
            t.matmul(h, w)
        })?;
        let biased = tracer.scoped("bias_decoder", |t| -> Result<Value> {
            let w = t.parameter("bias_decoder.weight", &self.bias)?;
            t.matmul(logits, w)
        })?;
        Ok(vec![biased])
    }
}

struct Source<F: Fn() -> ModelScripts>(F);

impl<F: Fn() -> ModelScripts> ExportSource for Source<F> {
    fn export(&self, _options: &PassthroughOptions) -> Result<ModelScripts> {
        Ok((self.0)())
    }
}

fn boxed(model: impl ExportableModel + 'static) -> Box<dyn ExportableModel> {
    Box::new(model)
}

fn onnx_config(dir: &Path, quantize: bool) -> ExportConfig {
    ExportConfig {
        output_dir: Some(dir.to_path_buf()),
        quantize,
        ..Default::default()
    }
}

fn script_config(dir: &Path, device: DeviceRequest) -> ExportConfig {
    ExportConfig {
        format: ExportFormat::TorchScripts,
        output_dir: Some(dir.to_path_buf()),
        device,
        ..Default::default()
    }
}

fn listing(dir: &Path) -> BTreeSet<String> {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

#[test]
fn test_repeated_export_keeps_file_names() {
    let dir = tempfile::tempdir().unwrap();
    let source = Source(|| ModelScripts::Many(vec![boxed(Projector::new("encoder")), boxed(Projector::new("decoder"))]));

    export_with_probe(&source, &onnx_config(dir.path(), false), &NoAccelerator).unwrap();
    let first = listing(dir.path());
    export_with_probe(&source, &onnx_config(dir.path(), false), &NoAccelerator).unwrap();

    let expected: BTreeSet<String> = ["encoder.onnx", "decoder.onnx"].iter().map(|s| s.to_string()).collect();
    assert_eq!(first, expected);
    assert_eq!(listing(dir.path()), expected);
}

#[test]
fn test_graph_uses_declared_names() {
    let dir = tempfile::tempdir().unwrap();
    let source = Source(|| ModelScripts::Single(Box::new(Projector::new("asr"))));
    export_with_probe(&source, &onnx_config(dir.path(), false), &NoAccelerator).unwrap();

    let model = load_model(&dir.path().join("asr.onnx")).unwrap();
    let graph = model.graph.as_ref().unwrap();
    assert_eq!(model.opset_version(), Some(14));
    assert_eq!(graph.input[0].name, "feats");
    assert_eq!(graph.output[0].name, "logits");
    assert_eq!(graph.initializer.len(), 3);
}

#[test]
fn test_quantized_graph_skips_excluded_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let source = Source(|| ModelScripts::Single(Box::new(Projector::new("asr"))));
    export_with_probe(&source, &onnx_config(dir.path(), true), &NoAccelerator).unwrap();

    let quantized = load_model(&dir.path().join("asr_quant.onnx")).unwrap();
    let graph = quantized.graph.unwrap();
    let float_matmuls: BTreeSet<&str> = graph
        .node
        .iter()
        .filter(|n| n.op_type == "MatMul")
        .map(|n| n.name.as_str())
        .collect();
    assert_eq!(float_matmuls, ["/output/MatMul", "/bias_decoder/MatMul"].into_iter().collect());

    let integer: Vec<&str> = graph
        .node
        .iter()
        .filter(|n| n.op_type == "MatMulInteger")
        .map(|n| n.name.as_str())
        .collect();
    assert_eq!(integer, vec!["/encoder/MatMul_quant"]);
    assert!(graph.node.iter().any(|n| n.op_type == "DynamicQuantizeLinear"));
    assert!(!graph.initializer.iter().any(|t| t.name == "encoder.weight"));
    assert!(graph.initializer.iter().any(|t| t.name == "output.weight"));
}

#[test]
fn test_existing_quantized_graph_is_not_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    let source = Source(|| ModelScripts::Single(Box::new(Projector::new("asr"))));
    export_with_probe(&source, &onnx_config(dir.path(), true), &NoAccelerator).unwrap();

    let quant_path = dir.path().join("asr_quant.onnx");
    fs::write(&quant_path, b"previous run").unwrap();
    export_with_probe(&source, &onnx_config(dir.path(), true), &NoAccelerator).unwrap();

    assert_eq!(fs::read(&quant_path).unwrap(), b"previous run");
    assert!(load_model(&dir.path().join("asr.onnx")).is_ok());
}

#[test]
fn test_trace_without_accelerator_stays_on_cpu() {
    let dir = tempfile::tempdir().unwrap();
    let moved = Rc::new(Cell::new(None));
    let moved_in = moved.clone();
    let source = Source(move || {
        let mut model = Projector::new("asr");
        model.moved_to = moved_in.clone();
        ModelScripts::Single(Box::new(model))
    });

    export_with_probe(&source, &script_config(dir.path(), DeviceRequest::Cuda(0)), &NoAccelerator).unwrap();

    let module = load_script(&dir.path().join("asr.torchscripts")).unwrap();
    assert_eq!(module.program.device, Device::Cpu);
    assert_eq!(moved.get(), None);
}

#[test]
fn test_trace_moves_to_available_accelerator() {
    let dir = tempfile::tempdir().unwrap();
    let moved = Rc::new(Cell::new(None));
    let moved_in = moved.clone();
    let source = Source(move || {
        let mut model = Projector::new("asr");
        model.moved_to = moved_in.clone();
        ModelScripts::Single(Box::new(model))
    });

    export_with_probe(&source, &script_config(dir.path(), DeviceRequest::Auto), &StaticProbe(1)).unwrap();

    let module = load_script(&dir.path().join("asr.torchscripts")).unwrap();
    assert_eq!(module.program.device, Device::Cuda(0));
    assert_eq!(moved.get(), Some(Device::Cuda(0)));
    assert!(module.constants.iter().all(|t| t.device() == Device::Cuda(0)));
    assert_eq!(module.constants.len(), 3);
}

#[test]
fn test_unknown_type_rejected_before_any_output() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("never");
    let options = json!({ "type": "tflite", "output_dir": target.to_string_lossy() });
    let options = options.as_object().cloned().unwrap();

    let err = ExportConfig::from_options(options).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ExportError>(),
        Some(ExportError::UnsupportedFormat(_))
    ));
    assert!(!target.exists());
}

struct Broken;

impl ExportableModel for Broken {
    fn export_name(&self) -> &str {
        "broken"
    }
    fn export_dummy_inputs(&self) -> Result<DummyInput> {
        Ok(Tensor::zeros(vec![1], DataType::F32).into())
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
    fn forward(&self, _tracer: &mut Tracer, _inputs: &[Value]) -> Result<Vec<Value>> {
        bail!("unsupported layer")
    }
}

/// Counts how often the exporter asked it for dummy inputs.
struct Counted {
    calls: Rc<Cell<usize>>,
}

impl ExportableModel for Counted {
    fn export_name(&self) -> &str {
        "counted"
    }
    fn export_dummy_inputs(&self) -> Result<DummyInput> {
        self.calls.set(self.calls.get() + 1);
        Ok(Tensor::zeros(vec![1], DataType::F32).into())
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
        Ok(vec![tracer.relu(inputs[0])?])
    }
}

#[test]
fn test_failure_stops_remaining_models() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Rc::new(Cell::new(0));
    let calls_in = calls.clone();
    let source = Source(move || {
        ModelScripts::Many(vec![boxed(Broken), boxed(Counted { calls: calls_in.clone() })])
    });

    let err = export_with_probe(&source, &onnx_config(dir.path(), false), &NoAccelerator).unwrap_err();
    assert!(format!("{:#}", err).contains("unsupported layer"));
    assert_eq!(calls.get(), 0);
    assert!(!dir.path().join("counted.onnx").exists());
}

/// Host-side branch on the input length.
struct Gate;

impl ExportableModel for Gate {
    fn export_name(&self) -> &str {
        "gate"
    }
    fn export_dummy_inputs(&self) -> Result<DummyInput> {
        Ok(Tensor::zeros(vec![1, 8], DataType::F32).into())
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
        let long = tracer.shape(inputs[0]).map(|s| s[1] > 4).unwrap_or(false);
        let y = if long { tracer.tanh(inputs[0])? } else { tracer.sigmoid(inputs[0])? };
        Ok(vec![y])
    }
}

#[test]
fn test_trace_records_only_taken_branch() {
    let dir = tempfile::tempdir().unwrap();
    let source = Source(|| ModelScripts::Single(Box::new(Gate)));
    export_with_probe(&source, &script_config(dir.path(), DeviceRequest::Cpu), &NoAccelerator).unwrap();

    let module = load_script(&dir.path().join("gate.torchscripts")).unwrap();
    let op_types: Vec<&str> = module.program.ops.iter().map(|o| o.op_type.as_str()).collect();
    assert!(op_types.contains(&"Tanh"));
    assert!(!op_types.contains(&"Sigmoid"));
}

/// Takes a (tokens, mask) tuple.
struct Pair;

impl ExportableModel for Pair {
    fn export_name(&self) -> &str {
        "pair"
    }
    fn export_dummy_inputs(&self) -> Result<DummyInput> {
        Ok(vec![
            Tensor::zeros(vec![2, 3], DataType::F32),
            Tensor::zeros(vec![2, 3], DataType::F32),
        ]
        .into())
    }
    fn export_input_names(&self) -> Vec<String> {
        vec!["tokens".to_string(), "mask".to_string()]
    }
    fn export_output_names(&self) -> Vec<String> {
        vec!["masked".to_string()]
    }
    fn eval(&mut self) {}
    fn to_device(&mut self, _device: Device) -> Result<()> {
        Ok(())
    }
    fn forward(&self, tracer: &mut Tracer, inputs: &[Value]) -> Result<Vec<Value>> {
        Ok(vec![tracer.mul(inputs[0], inputs[1])?])
    }
}

#[test]
fn test_tuple_dummy_input() {
    let dir = tempfile::tempdir().unwrap();
    let source = Source(|| ModelScripts::Single(Box::new(Pair)));
    export_with_probe(&source, &onnx_config(dir.path(), false), &NoAccelerator).unwrap();

    let graph = load_model(&dir.path().join("pair.onnx")).unwrap().graph.unwrap();
    let inputs: Vec<&str> = graph.input.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(inputs, vec!["tokens", "mask"]);
    assert_eq!(graph.node.len(), 1);
    assert_eq!(graph.node[0].op_type, "Mul");
}
