//! Error types for model export

use thiserror::Error;

use crate::device::Device;

/// Declared failure modes of the export pipeline.
///
/// Everything else (I/O, protobuf decoding, archive errors) propagates as
/// `anyhow::Error` with path context attached at the call site.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Unsupported export format: {0} (expected one of: onnx, torchscripts)")]
    UnsupportedFormat(String),

    #[error("No output directory: set `output_dir` or `init_param`")]
    MissingOutputDir,

    #[error("Signature mismatch: {0}")]
    SignatureMismatch(String),

    #[error("Tensor on {found} fed to a tracer running on {expected}")]
    DeviceMismatch { expected: Device, found: Device },

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Invalid program archive: {0}")]
    InvalidArchive(String),

    #[error("Invalid option `{key}`: {reason}")]
    InvalidOption { key: String, reason: String },
}
