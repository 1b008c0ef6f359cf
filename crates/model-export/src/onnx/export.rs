//! Static-graph export: trace a model and write `<export_name>.onnx`.

use anyhow::Result;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::proto::{
    tensor_shape_proto::dimension::Value as Dim, AttributeProto, GraphProto, ModelProto, NodeProto,
    OperatorSetIdProto, StringStringEntryProto, TensorProto, ValueInfoProto,
};
use super::quantize::{self, QuantizeReport};
use crate::error::ExportError;
use crate::format::ExportFormat;
use crate::model::{trace_model, DynamicAxes, ExportableModel};
use crate::tracer::{Attribute, TracedGraph, TracedOp, ValueInfo};

pub const PRODUCER_NAME: &str = "model-export";
pub const DEFAULT_OPSET_VERSION: i64 = 14;
/// Default-domain opsets a graph may be written at.
pub const SUPPORTED_OPSET_VERSIONS: RangeInclusive<i64> = 7..=21;

/// Files written for one model.
#[derive(Debug, Clone)]
pub struct GraphArtifacts {
    pub model_path: PathBuf,
    /// Set whenever quantization was requested, even if it was skipped.
    pub quantized_path: Option<PathBuf>,
    /// `None` when quantization was not requested or the file already existed.
    pub quantize_report: Option<QuantizeReport>,
}

#[derive(Debug, Clone)]
pub struct GraphExporter {
    opset_version: i64,
    quantize: bool,
    verbose: bool,
}

impl Default for GraphExporter {
    fn default() -> Self {
        Self::new(DEFAULT_OPSET_VERSION)
    }
}

impl GraphExporter {
    pub fn new(opset_version: i64) -> Self {
        Self {
            opset_version,
            quantize: false,
            verbose: false,
        }
    }

    pub fn with_quantize(mut self, quantize: bool) -> Self {
        self.quantize = quantize;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn export(&self, model: &dyn ExportableModel, export_dir: &Path) -> Result<GraphArtifacts> {
        let dummy_input = model.export_dummy_inputs()?;
        let device = dummy_input
            .tensors()
            .first()
            .map(|t| t.device())
            .unwrap_or_default();

        let graph = trace_model(model, &dummy_input, device)?;
        let proto = build_model_proto(
            graph,
            model.export_name(),
            &model.export_input_names(),
            &model.export_output_names(),
            &model.export_dynamic_axes(),
            self.opset_version,
        )?;

        if self.verbose {
            log_graph(&proto);
        }

        let model_path = export_dir.join(ExportFormat::Onnx.file_name(model.export_name()));
        super::proto::save_model(&proto, &model_path)?;
        info!("Exported ONNX graph: {}", model_path.display());

        if !self.quantize {
            return Ok(GraphArtifacts {
                model_path,
                quantized_path: None,
                quantize_report: None,
            });
        }

        let quantized_path = quantized_path_for(&model_path);
        let report = quantize::quantize_file(&model_path, &quantized_path, false)?;
        if let Some(report) = &report {
            info!(
                "Exported quantized graph: {} ({} MatMul quantized, {} excluded)",
                quantized_path.display(),
                report.quantized_nodes.len(),
                report.excluded_nodes.len()
            );
        }

        Ok(GraphArtifacts {
            model_path,
            quantized_path: Some(quantized_path),
            quantize_report: report,
        })
    }
}

/// `<dir>/<name>.onnx` -> `<dir>/<name>_quant.onnx`
pub fn quantized_path_for(model_path: &Path) -> PathBuf {
    let stem = model_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    model_path.with_file_name(format!("{}_quant.onnx", stem))
}

pub fn check_opset_version(opset: i64) -> Result<i64, ExportError> {
    if SUPPORTED_OPSET_VERSIONS.contains(&opset) {
        Ok(opset)
    } else {
        Err(ExportError::InvalidOption {
            key: "opset_version".to_string(),
            reason: format!(
                "{} is outside the supported range {}..={}",
                opset,
                SUPPORTED_OPSET_VERSIONS.start(),
                SUPPORTED_OPSET_VERSIONS.end()
            ),
        })
    }
}

/// IR version that runtimes expect alongside a default-domain opset.
pub fn ir_version_for_opset(opset: i64) -> i64 {
    match opset {
        i64::MIN..=8 => 3,
        9 => 4,
        10 => 5,
        11 => 6,
        12..=14 => 7,
        15..=18 => 8,
        19..=20 => 9,
        _ => 10,
    }
}

pub fn build_model_proto(
    mut graph: TracedGraph,
    export_name: &str,
    input_names: &[String],
    output_names: &[String],
    dynamic_axes: &DynamicAxes,
    opset_version: i64,
) -> Result<ModelProto> {
    check_opset_version(opset_version)?;
    graph.rename_inputs(input_names)?;
    graph.rename_outputs(output_names)?;

    for (name, axes) in dynamic_axes {
        let info = graph.inputs.iter().chain(graph.outputs.iter()).find(|i| &i.name == name);
        match info {
            None => warn!("Dynamic axes given for `{}`, which is not a graph input or output", name),
            Some(info) => {
                if let Some(shape) = &info.shape {
                    for axis in axes.keys().filter(|a| **a >= shape.len()) {
                        warn!("Dynamic axis {} is out of range for `{}` of rank {}", axis, name, shape.len());
                    }
                }
            }
        }
    }

    let input = graph.inputs.iter().map(|i| value_info(i, dynamic_axes)).collect();
    let output = graph.outputs.iter().map(|o| value_info(o, dynamic_axes)).collect();
    let initializer = graph
        .parameters
        .iter()
        .map(|(name, tensor)| TensorProto::from_tensor(name, tensor))
        .collect();
    let node = graph.ops.iter().map(node_proto).collect();

    Ok(ModelProto {
        ir_version: ir_version_for_opset(opset_version),
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: opset_version,
        }],
        producer_name: PRODUCER_NAME.to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        graph: Some(GraphProto {
            name: export_name.to_string(),
            node,
            initializer,
            input,
            output,
            ..Default::default()
        }),
        metadata_props: vec![StringStringEntryProto {
            key: "export_device".to_string(),
            value: graph.device.to_string(),
        }],
        ..Default::default()
    })
}

fn value_info(info: &ValueInfo, dynamic_axes: &DynamicAxes) -> ValueInfoProto {
    let axes = dynamic_axes.get(&info.name);
    let dims = info.shape.as_ref().map(|shape| {
        shape
            .iter()
            .enumerate()
            .map(|(axis, size)| match axes.and_then(|a| a.get(&axis)) {
                Some(label) => Dim::DimParam(label.clone()),
                None => Dim::DimValue(*size as i64),
            })
            .collect()
    });
    ValueInfoProto::tensor(&info.name, info.dtype, dims)
}

fn node_proto(op: &TracedOp) -> NodeProto {
    let attribute = op
        .attributes
        .iter()
        .map(|(name, value)| match value {
            Attribute::Int(i) => AttributeProto::int(name, *i),
            Attribute::Float(f) => AttributeProto::float(name, *f),
            Attribute::Str(s) => AttributeProto::string(name, s),
            Attribute::Ints(v) => AttributeProto::ints(name, v.clone()),
            Attribute::Floats(v) => AttributeProto::floats(name, v.clone()),
        })
        .collect();
    NodeProto {
        input: op.inputs.clone(),
        output: op.outputs.clone(),
        name: op.name.clone(),
        op_type: op.op_type.clone(),
        attribute,
        ..Default::default()
    }
}

fn log_graph(model: &ModelProto) {
    let Some(graph) = model.graph.as_ref() else {
        return;
    };
    info!("graph {} (opset {:?})", graph.name, model.opset_version());
    for input in &graph.input {
        info!("  input  {}", input.name);
    }
    for node in &graph.node {
        info!("  {:<12} {} {:?} -> {:?}", node.op_type, node.name, node.input, node.output);
    }
    for output in &graph.output {
        info!("  output {}", output.name);
    }
}
