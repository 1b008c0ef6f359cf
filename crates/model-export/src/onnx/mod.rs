//! ONNX static-graph export.
//!
//! - `proto`: prost messages for `onnx.proto3`
//! - `export`: trace a model and write `<export_name>.onnx`
//! - `quantize`: dynamic 8-bit MatMul quantization of a written graph
pub mod proto;
pub mod export;
pub mod quantize;
pub use export::{check_opset_version, GraphArtifacts, GraphExporter, DEFAULT_OPSET_VERSION, SUPPORTED_OPSET_VERSIONS};
pub use quantize::{quantize_dynamic, quantize_file, QuantType, QuantizeOptions, QuantizeReport};
