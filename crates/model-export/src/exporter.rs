//! Export driver: one call, every sub-network of a model, one directory.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing::info;

use crate::config::ExportConfig;
use crate::device::{default_probe, resolve_device, AcceleratorProbe};
use crate::format::ExportFormat;
use crate::model::ExportSource;
use crate::onnx::GraphExporter;
use crate::script::ScriptExporter;

/// Export every model `source` yields and return the output directory.
///
/// Accelerator availability comes from [`default_probe`]; use
/// [`export_with_probe`] to supply it explicitly.
pub fn export(source: &dyn ExportSource, config: &ExportConfig) -> Result<PathBuf> {
    let probe = default_probe();
    export_with_probe(source, config, probe.as_ref())
}

/// Models are exported in order, each to completion (including
/// quantization) before the next starts. The first failure aborts the
/// remaining models; files already written stay on disk.
pub fn export_with_probe(
    source: &dyn ExportSource,
    config: &ExportConfig,
    probe: &dyn AcceleratorProbe,
) -> Result<PathBuf> {
    let model_scripts = source.export(&config.passthrough)?;

    let export_dir = config.resolve_output_dir()?;
    fs::create_dir_all(&export_dir)
        .with_context(|| format!("Failed to create export directory {}", export_dir.display()))?;

    let models = model_scripts.into_vec();
    info!("Exporting {} model(s) as {}", models.len(), config.format.name());

    for mut model in models {
        model.eval();
        match config.format {
            ExportFormat::Onnx => {
                GraphExporter::new(config.opset_version)
                    .with_quantize(config.quantize)
                    .with_verbose(config.verbose)
                    .export(&*model, &export_dir)
                    .with_context(|| format!("ONNX export of `{}` failed", model.export_name()))?;
            }
            ExportFormat::TorchScripts => {
                let device = resolve_device(config.device, probe);
                ScriptExporter::new(device)
                    .export(&mut *model, &export_dir)
                    .with_context(|| format!("Trace export of `{}` failed", model.export_name()))?;
            }
        }
        info!("output dir: {}", export_dir.display());
    }

    Ok(export_dir)
}
