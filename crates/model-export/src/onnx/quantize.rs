//! Dynamic (weight-only, activation-at-runtime) quantization of ONNX graphs.
//!
//! A float `MatMul(A, W)` with `W` a 2-D initializer becomes
//!
//! ```text
//! DynamicQuantizeLinear(A) -> A_q, A_scale, A_zp
//! MatMulInteger(A_q, W_q, A_zp, W_zp) -> int32
//! Cast(float) -> Mul(., A_scale * W_scale) -> original output
//! ```
//!
//! with `W_q` precomputed here. Per-channel scales are taken per output
//! column of `W`.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};

use super::proto::{self, AttributeProto, GraphProto, ModelProto, NodeProto, TensorProto};
use crate::error::ExportError;
use crate::tensor::{DataType, Tensor, TensorData};

/// Substrings that keep a node at full precision. Output projections and
/// the encoder/decoder bias layers lose too much accuracy at 8 bits.
pub const EXCLUDED_NODE_PATTERNS: [&str; 3] = ["output", "bias_encoder", "bias_decoder"];

/// First opset that has `DynamicQuantizeLinear`.
const MIN_QUANT_OPSET: i64 = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantType {
    QInt8,
    QUInt8,
}

impl QuantType {
    /// Integer range used for weights.
    pub fn range(&self, reduce_range: bool) -> (i32, i32) {
        match (self, reduce_range) {
            (QuantType::QUInt8, false) => (0, 255),
            (QuantType::QUInt8, true) => (0, 127),
            (QuantType::QInt8, false) => (-127, 127),
            (QuantType::QInt8, true) => (-64, 64),
        }
    }

    fn data_type(&self) -> DataType {
        match self {
            QuantType::QInt8 => DataType::I8,
            QuantType::QUInt8 => DataType::U8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuantizeOptions {
    pub op_types_to_quantize: Vec<String>,
    pub per_channel: bool,
    pub reduce_range: bool,
    pub weight_type: QuantType,
    pub nodes_to_exclude: Vec<String>,
}

impl Default for QuantizeOptions {
    fn default() -> Self {
        Self {
            op_types_to_quantize: vec!["MatMul".to_string()],
            per_channel: true,
            reduce_range: false,
            weight_type: QuantType::QUInt8,
            nodes_to_exclude: Vec::new(),
        }
    }
}

impl QuantizeOptions {
    /// Defaults plus the standard exclusion list for `graph`.
    pub fn for_graph(graph: &GraphProto) -> Self {
        Self {
            nodes_to_exclude: nodes_to_exclude_for(graph),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuantizeReport {
    pub quantized_nodes: Vec<String>,
    pub excluded_nodes: Vec<String>,
    /// Candidate ops left in float because their weight is not an inline
    /// 2-D float initializer.
    pub skipped_nodes: Vec<String>,
}

pub fn nodes_to_exclude_for(graph: &GraphProto) -> Vec<String> {
    graph
        .node
        .iter()
        .filter(|n| EXCLUDED_NODE_PATTERNS.iter().any(|p| n.name.contains(p)))
        .map(|n| n.name.clone())
        .collect()
}

/// Load `input`, quantize it and write the result to `output`.
pub fn quantize_dynamic(input: &Path, output: &Path, options: &QuantizeOptions) -> Result<QuantizeReport> {
    let mut model = proto::load_model(input)?;
    let report = quantize_model(&mut model, options)
        .with_context(|| format!("Failed to quantize {}", input.display()))?;
    proto::save_model(&model, output)?;
    Ok(report)
}

/// Quantize the graph at `input` into `output` with the standard exclusion
/// list. An existing `output` is kept as is unless `force` is set; `None`
/// means nothing was written.
pub fn quantize_file(input: &Path, output: &Path, force: bool) -> Result<Option<QuantizeReport>> {
    if output.exists() && !force {
        warn!(
            "Quantized model already exists, skipping: {} (delete it or force a rebuild)",
            output.display()
        );
        return Ok(None);
    }

    let model = proto::load_model(input)?;
    let graph = model
        .graph
        .as_ref()
        .ok_or_else(|| ExportError::InvalidGraph(format!("{} has no graph", input.display())))?;
    let options = QuantizeOptions::for_graph(graph);
    debug!("Nodes kept at full precision: {:?}", options.nodes_to_exclude);

    quantize_dynamic(input, output, &options).map(Some)
}

/// Per-tensor or per-column 8-bit weights. Values are widened to `i32` so
/// one struct covers both signed and unsigned targets.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedWeight {
    pub values: Vec<i32>,
    pub scales: Vec<f32>,
    pub zero_points: Vec<i32>,
}

impl QuantizedWeight {
    pub fn dequantize(&self, rows: usize, cols: usize) -> Vec<f32> {
        let per_channel = self.scales.len() == cols && cols > 1;
        let mut out = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                let k = if per_channel { c } else { 0 };
                let q = self.values[r * cols + c];
                out.push((q - self.zero_points[k]) as f32 * self.scales[k]);
            }
        }
        out
    }
}

fn scale_and_zero_point(rmin: f32, rmax: f32, weight_type: QuantType, reduce_range: bool) -> (f32, i32) {
    let (qmin, qmax) = weight_type.range(reduce_range);
    // the representable range must contain zero
    let rmin = rmin.min(0.0);
    let rmax = rmax.max(0.0);
    match weight_type {
        QuantType::QInt8 => {
            let absmax = rmin.abs().max(rmax.abs());
            let scale = 2.0 * absmax / (qmax - qmin) as f32;
            if !scale.is_normal() {
                return (1.0, 0);
            }
            (scale, 0)
        }
        QuantType::QUInt8 => {
            let scale = (rmax - rmin) / (qmax - qmin) as f32;
            if !scale.is_normal() {
                return (1.0, 0);
            }
            let zero_point = (qmin as f32 - rmin / scale).round() as i32;
            (scale, zero_point.clamp(qmin, qmax))
        }
    }
}

/// Quantize a row-major `[rows, cols]` weight.
pub fn quantize_weight(
    weights: &[f32],
    rows: usize,
    cols: usize,
    per_channel: bool,
    weight_type: QuantType,
    reduce_range: bool,
) -> QuantizedWeight {
    let (qmin, qmax) = weight_type.range(reduce_range);
    let channels = if per_channel { cols } else { 1 };
    let mut scales = Vec::with_capacity(channels);
    let mut zero_points = Vec::with_capacity(channels);

    for channel in 0..channels {
        let column = |r: usize| {
            if per_channel {
                weights[r * cols + channel]
            } else {
                weights[r]
            }
        };
        let len = if per_channel { rows } else { rows * cols };
        let (rmin, rmax) = (0..len)
            .map(column)
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), x| (lo.min(x), hi.max(x)));
        let (scale, zero_point) = scale_and_zero_point(rmin, rmax, weight_type, reduce_range);
        scales.push(scale);
        zero_points.push(zero_point);
    }

    let values = weights
        .iter()
        .enumerate()
        .map(|(i, x)| {
            let k = if per_channel { i % cols } else { 0 };
            let q = (x / scales[k]).round() as i32 + zero_points[k];
            q.clamp(qmin, qmax)
        })
        .collect();

    QuantizedWeight {
        values,
        scales,
        zero_points,
    }
}

fn integer_tensor(values: &[i32], shape: Vec<usize>, weight_type: QuantType) -> Result<Tensor> {
    let data = match weight_type.data_type() {
        DataType::I8 => TensorData::I8(values.iter().map(|v| *v as i8).collect()),
        _ => TensorData::U8(values.iter().map(|v| *v as u8).collect()),
    };
    Tensor::new(shape, data)
}

/// Names of the quantized value and its scale/zero point.
struct QuantizedNames {
    value: String,
    scale: String,
    zero_point: String,
}

impl QuantizedNames {
    fn for_value(name: &str) -> Self {
        Self {
            value: format!("{}_quantized", name),
            scale: format!("{}_scale", name),
            zero_point: format!("{}_zero_point", name),
        }
    }
}

pub fn quantize_model(model: &mut ModelProto, options: &QuantizeOptions) -> Result<QuantizeReport> {
    let graph = model
        .graph
        .as_mut()
        .ok_or_else(|| ExportError::InvalidGraph("model has no graph".to_string()))?;

    let excluded: HashSet<&str> = options.nodes_to_exclude.iter().map(|s| s.as_str()).collect();
    let op_types: HashSet<&str> = options.op_types_to_quantize.iter().map(|s| s.as_str()).collect();
    let initializers: HashMap<String, usize> = graph
        .initializer
        .iter()
        .enumerate()
        .map(|(i, t)| (t.name.clone(), i))
        .collect();

    let mut report = QuantizeReport::default();
    let mut activations: HashMap<String, QuantizedNames> = HashMap::new();
    let mut weights: HashMap<String, QuantizedNames> = HashMap::new();
    let mut new_initializers: Vec<TensorProto> = Vec::new();
    let mut nodes = Vec::with_capacity(graph.node.len());

    for node in std::mem::take(&mut graph.node) {
        if !op_types.contains(node.op_type.as_str()) {
            nodes.push(node);
            continue;
        }
        if excluded.contains(node.name.as_str()) {
            report.excluded_nodes.push(node.name.clone());
            nodes.push(node);
            continue;
        }
        let weight = node
            .input
            .get(1)
            .and_then(|name| initializers.get(name))
            .map(|i| &graph.initializer[*i])
            .filter(|t| t.data_type == DataType::F32.onnx_code() && t.dims.len() == 2 && !t.is_external());
        let Some(weight) = weight else {
            debug!("Leaving {} in float: weight is not an inline 2-D float initializer", node.name);
            report.skipped_nodes.push(node.name.clone());
            nodes.push(node);
            continue;
        };

        let activation_name = node.input[0].clone();
        let output_name = node
            .output
            .first()
            .cloned()
            .ok_or_else(|| ExportError::InvalidGraph(format!("node `{}` has no output", node.name)))?;
        let node_name = if node.name.is_empty() { output_name.clone() } else { node.name.clone() };

        if !weights.contains_key(&weight.name) {
            let tensor = weight.to_tensor()?;
            let (rows, cols) = (tensor.shape()[0], tensor.shape()[1]);
            let values = tensor.as_f32().unwrap_or_default();
            let q = quantize_weight(values, rows, cols, options.per_channel, options.weight_type, options.reduce_range);
            let channels = q.scales.len();
            let names = QuantizedNames::for_value(&weight.name);
            new_initializers.push(TensorProto::from_tensor(
                &names.value,
                &integer_tensor(&q.values, vec![rows, cols], options.weight_type)?,
            ));
            new_initializers.push(TensorProto::from_tensor(
                &names.scale,
                &Tensor::from_f32(vec![channels], q.scales)?,
            ));
            new_initializers.push(TensorProto::from_tensor(
                &names.zero_point,
                &integer_tensor(&q.zero_points, vec![channels], options.weight_type)?,
            ));
            weights.insert(weight.name.clone(), names);
        }
        let w = &weights[&weight.name];

        if !activations.contains_key(&activation_name) {
            let a = QuantizedNames::for_value(&activation_name);
            nodes.push(NodeProto {
                input: vec![activation_name.clone()],
                output: vec![a.value.clone(), a.scale.clone(), a.zero_point.clone()],
                name: format!("{}_QuantizeLinear", activation_name),
                op_type: "DynamicQuantizeLinear".to_string(),
                ..Default::default()
            });
            activations.insert(activation_name.clone(), a);
        }
        let a = &activations[&activation_name];

        let integer_output = format!("{}_output_quantized", output_name);
        let cast_output = format!("{}_output_quantized_cast_output", output_name);
        let scales_output = format!("{}_scales_mul:0", node_name);
        nodes.push(NodeProto {
            input: vec![a.value.clone(), w.value.clone(), a.zero_point.clone(), w.zero_point.clone()],
            output: vec![integer_output.clone()],
            name: format!("{}_quant", node_name),
            op_type: "MatMulInteger".to_string(),
            ..Default::default()
        });
        nodes.push(NodeProto {
            input: vec![integer_output.clone()],
            output: vec![cast_output.clone()],
            name: format!("{}_output_quantized_cast", output_name),
            op_type: "Cast".to_string(),
            attribute: vec![AttributeProto::int("to", DataType::F32.onnx_code() as i64)],
            ..Default::default()
        });
        nodes.push(NodeProto {
            input: vec![a.scale.clone(), w.scale.clone()],
            output: vec![scales_output.clone()],
            name: format!("{}_scales_mul", node_name),
            op_type: "Mul".to_string(),
            ..Default::default()
        });
        nodes.push(NodeProto {
            input: vec![cast_output, scales_output],
            output: vec![output_name],
            name: format!("{}_output_scale_mul", node_name),
            op_type: "Mul".to_string(),
            ..Default::default()
        });
        report.quantized_nodes.push(node.name.clone());
    }

    graph.node = nodes;
    graph.initializer.extend(new_initializers);

    // drop float weights whose every consumer was rewritten
    let mut referenced: HashSet<String> = graph.output.iter().map(|o| o.name.clone()).collect();
    collect_node_inputs(&graph.node, &mut referenced);
    graph
        .initializer
        .retain(|t| !weights.contains_key(&t.name) || referenced.contains(&t.name));

    if !report.quantized_nodes.is_empty() {
        match model.opset_import.iter_mut().find(|o| o.domain.is_empty() || o.domain == "ai.onnx") {
            Some(opset) if opset.version < MIN_QUANT_OPSET => {
                info!("Raising opset {} -> {} for DynamicQuantizeLinear", opset.version, MIN_QUANT_OPSET);
                opset.version = MIN_QUANT_OPSET;
            }
            Some(_) => {}
            None => model.opset_import.push(proto::OperatorSetIdProto {
                domain: String::new(),
                version: MIN_QUANT_OPSET,
            }),
        }
    }

    Ok(report)
}

/// Inputs of `nodes` and of every subgraph below them; subgraphs may
/// read outer-scope initializers by name.
fn collect_node_inputs(nodes: &[NodeProto], names: &mut HashSet<String>) {
    for node in nodes {
        names.extend(node.input.iter().cloned());
        for attribute in &node.attribute {
            for graph in attribute.g.iter().chain(attribute.graphs.iter()) {
                collect_node_inputs(&graph.node, names);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use proto::OperatorSetIdProto;

    fn matmul(name: &str, a: &str, w: &str, out: &str) -> NodeProto {
        NodeProto {
            input: vec![a.to_string(), w.to_string()],
            output: vec![out.to_string()],
            name: name.to_string(),
            op_type: "MatMul".to_string(),
            ..Default::default()
        }
    }

    fn weight(name: &str, rows: usize, cols: usize) -> TensorProto {
        let values = (0..rows * cols).map(|i| (i as f32 - 3.0) * 0.25).collect();
        TensorProto::from_tensor(name, &Tensor::from_f32(vec![rows, cols], values).unwrap())
    }

    fn model() -> ModelProto {
        ModelProto {
            ir_version: 7,
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: 14,
            }],
            graph: Some(GraphProto {
                name: "g".to_string(),
                node: vec![
                    matmul("/encoder/MatMul", "x", "enc.w", "h"),
                    matmul("/bias_encoder/MatMul", "h", "bias.w", "h2"),
                    matmul("/output_layer/MatMul", "h2", "out.w", "y"),
                    matmul("/attn/MatMul", "h2", "h", "z"),
                ],
                initializer: vec![weight("enc.w", 4, 3), weight("bias.w", 3, 3), weight("out.w", 3, 2)],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_exclusion_list_matches_patterns() {
        let m = model();
        let excluded = nodes_to_exclude_for(m.graph.as_ref().unwrap());
        assert_eq!(excluded, vec!["/bias_encoder/MatMul", "/output_layer/MatMul"]);
    }

    #[test]
    fn test_rewrites_only_eligible_matmuls() {
        let mut m = model();
        let options = QuantizeOptions::for_graph(m.graph.as_ref().unwrap());
        let report = quantize_model(&mut m, &options).unwrap();

        assert_eq!(report.quantized_nodes, vec!["/encoder/MatMul"]);
        assert_eq!(report.excluded_nodes, vec!["/bias_encoder/MatMul", "/output_layer/MatMul"]);
        assert_eq!(report.skipped_nodes, vec!["/attn/MatMul"]);

        let graph = m.graph.unwrap();
        let ops: Vec<_> = graph.node.iter().map(|n| n.op_type.as_str()).collect();
        assert_eq!(
            ops,
            vec!["DynamicQuantizeLinear", "MatMulInteger", "Cast", "Mul", "Mul", "MatMul", "MatMul", "MatMul"]
        );
        // the excluded nodes are untouched
        assert!(graph.node.iter().any(|n| n.name == "/output_layer/MatMul" && n.op_type == "MatMul"));
        // the rewritten chain still produces `h`
        assert_eq!(graph.node[4].output, vec!["h"]);

        let names: HashSet<_> = graph.initializer.iter().map(|t| t.name.as_str()).collect();
        assert!(!names.contains("enc.w"));
        assert!(names.contains("enc.w_quantized"));
        assert!(names.contains("bias.w"));
        let scale = graph.initializer.iter().find(|t| t.name == "enc.w_scale").unwrap();
        assert_eq!(scale.dims, vec![3]);
        let zp = graph.initializer.iter().find(|t| t.name == "enc.w_zero_point").unwrap();
        assert_eq!(zp.data_type, DataType::U8.onnx_code());
    }

    #[test]
    fn test_shared_activation_quantized_once() {
        let mut m = model();
        let graph = m.graph.as_mut().unwrap();
        graph.node = vec![matmul("/a/MatMul", "x", "enc.w", "p"), matmul("/b/MatMul", "x", "enc.w", "q")];
        let report = quantize_model(&mut m, &QuantizeOptions::default()).unwrap();
        assert_eq!(report.quantized_nodes.len(), 2);
        let graph = m.graph.unwrap();
        let dql = graph.node.iter().filter(|n| n.op_type == "DynamicQuantizeLinear").count();
        assert_eq!(dql, 1);
        let quantized = graph.initializer.iter().filter(|t| t.name == "enc.w_quantized").count();
        assert_eq!(quantized, 1);
    }

    /// `model()` plus an `If` whose then-branch reads `enc.w` from the
    /// outer scope.
    fn model_with_subgraph() -> ModelProto {
        let mut m = model();
        let branch = GraphProto {
            name: "then".to_string(),
            node: vec![matmul("/then/MatMul", "x", "enc.w", "t")],
            ..Default::default()
        };
        m.graph.as_mut().unwrap().node.push(NodeProto {
            input: vec!["cond".to_string()],
            output: vec!["branch_out".to_string()],
            name: "/If".to_string(),
            op_type: "If".to_string(),
            attribute: vec![AttributeProto {
                name: "then_branch".to_string(),
                r#type: proto::attribute_proto::AttributeType::Graph as i32,
                g: Some(branch),
                ..Default::default()
            }],
            ..Default::default()
        });
        m
    }

    #[test]
    fn test_subgraph_survives_quantize_dynamic() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("if.onnx");
        let output = dir.path().join("if_quant.onnx");
        proto::save_model(&model_with_subgraph(), &input).unwrap();

        quantize_dynamic(&input, &output, &QuantizeOptions::default()).unwrap();

        let quantized = proto::load_model(&output).unwrap();
        let graph = quantized.graph.unwrap();
        let if_node = graph.node.iter().find(|n| n.op_type == "If").unwrap();
        let branch = if_node.attribute[0].g.as_ref().unwrap();
        assert_eq!(branch.node[0].input, vec!["x", "enc.w"]);
        // still read by the branch, so the float weight stays
        assert!(graph.initializer.iter().any(|t| t.name == "enc.w"));
        assert!(graph.initializer.iter().any(|t| t.name == "enc.w_quantized"));
    }

    #[test]
    fn test_external_weight_stays_in_float() {
        let mut m = model();
        let graph = m.graph.as_mut().unwrap();
        graph.node.truncate(1);
        let w = &mut graph.initializer[0];
        w.raw_data.clear();
        w.data_location = proto::tensor_proto::DataLocation::External as i32;
        let report = quantize_model(&mut m, &QuantizeOptions::default()).unwrap();
        assert!(report.quantized_nodes.is_empty());
        assert_eq!(report.skipped_nodes, vec!["/encoder/MatMul"]);
    }

    #[test]
    fn test_quantize_file_keeps_existing_output_unless_forced() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("enc.onnx");
        let output = dir.path().join("enc_quant.onnx");
        proto::save_model(&model(), &input).unwrap();
        std::fs::write(&output, b"previous run").unwrap();

        assert_eq!(quantize_file(&input, &output, false).unwrap(), None);
        assert_eq!(std::fs::read(&output).unwrap(), b"previous run");

        let report = quantize_file(&input, &output, true).unwrap().unwrap();
        assert_eq!(report.quantized_nodes, vec!["/encoder/MatMul"]);
        assert_eq!(report.excluded_nodes, vec!["/bias_encoder/MatMul", "/output_layer/MatMul"]);
        let rebuilt = proto::load_model(&output).unwrap();
        assert!(rebuilt.graph.unwrap().node.iter().any(|n| n.op_type == "MatMulInteger"));
    }

    #[test]
    fn test_quantize_file_writes_missing_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("enc.onnx");
        let output = dir.path().join("enc_quant.onnx");
        proto::save_model(&model(), &input).unwrap();

        assert!(quantize_file(&input, &output, false).unwrap().is_some());
        assert!(output.is_file());
    }

    #[test]
    fn test_low_opset_is_raised() {
        let mut m = model();
        m.opset_import[0].version = 9;
        quantize_model(&mut m, &QuantizeOptions::default()).unwrap();
        assert_eq!(m.opset_version(), Some(MIN_QUANT_OPSET));
    }

    #[test]
    fn test_all_zero_weight_is_representable() {
        let q = quantize_weight(&[0.0; 6], 2, 3, true, QuantType::QUInt8, false);
        assert!(q.scales.iter().all(|s| *s == 1.0));
        assert!(q.dequantize(2, 3).iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_zero_is_exact() {
        let q = quantize_weight(&[-1.0, 0.0, 0.5, 2.0], 4, 1, false, QuantType::QUInt8, false);
        let d = q.dequantize(4, 1);
        assert_eq!(d[1], 0.0);
    }

    proptest! {
        #[test]
        fn prop_dequantized_within_one_step(
            values in prop::collection::vec(-8.0f32..8.0, 12),
            per_channel in any::<bool>(),
            signed in any::<bool>(),
            reduce_range in any::<bool>(),
        ) {
            let weight_type = if signed { QuantType::QInt8 } else { QuantType::QUInt8 };
            let q = quantize_weight(&values, 4, 3, per_channel, weight_type, reduce_range);
            let (qmin, qmax) = weight_type.range(reduce_range);
            prop_assert!(q.values.iter().all(|v| *v >= qmin && *v <= qmax));
            let restored = q.dequantize(4, 3);
            for (i, (orig, back)) in values.iter().zip(restored.iter()).enumerate() {
                let k = if per_channel { i % 3 } else { 0 };
                prop_assert!((orig - back).abs() <= q.scales[k] * 1.01);
            }
        }
    }
}
