//! Export formats and detection of exported artifacts from their path.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use crate::error::ExportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExportFormat {
    /// Static computation graph.
    Onnx,
    /// Traced execution program.
    TorchScripts,
}

impl ExportFormat {
    pub const ALL: [ExportFormat; 2] = [ExportFormat::Onnx, ExportFormat::TorchScripts];

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Onnx => "onnx",
            ExportFormat::TorchScripts => "torchscripts",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExportFormat::Onnx => "ONNX graph",
            ExportFormat::TorchScripts => "traced program archive",
        }
    }

    /// `<export_name>.<ext>`
    pub fn file_name(&self, export_name: &str) -> String {
        format!("{}.{}", export_name, self.extension())
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "onnx" => Ok(ExportFormat::Onnx),
            "torchscripts" | "torchscript" => Ok(ExportFormat::TorchScripts),
            _ => Err(ExportError::UnsupportedFormat(s.to_string())),
        }
    }
}

pub struct FormatDetector;

impl FormatDetector {
    pub fn detect_from_path(path: &Path) -> Option<ExportFormat> {
        let extension = path.extension()?.to_str()?.to_lowercase();
        let format = ExportFormat::ALL
            .into_iter()
            .find(|f| f.extension() == extension);
        if let Some(fmt) = format {
            info!("Detected artifact format: {} for file: {}", fmt.name(), path.display());
        }
        format
    }

    /// Quantized graphs carry a `_quant` suffix before the extension.
    pub fn is_quantized(path: &Path) -> bool {
        path.file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.ends_with("_quant"))
            .unwrap_or(false)
    }

    pub fn supported_extensions() -> Vec<String> {
        ExportFormat::ALL.iter().map(|f| f.extension().to_string()).collect()
    }
}
