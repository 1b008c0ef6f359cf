//! Trace export: record one forward pass and write `<export_name>.torchscripts`.

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::info;

use super::program::write_archive;
use crate::device::Device;
use crate::format::ExportFormat;
use crate::model::{trace_model, ExportableModel};

/// Writes traced program archives.
///
/// Tracing records the ops executed for the dummy input only. Branches the
/// model would take for other inputs are not in the archive, and nothing
/// warns about it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptExporter {
    device: Device,
}

impl ScriptExporter {
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn export(&self, model: &mut dyn ExportableModel, export_dir: &Path) -> Result<PathBuf> {
        let mut dummy_input = model.export_dummy_inputs()?;

        if self.device.is_accelerator() {
            info!("Moving {} and its {} input(s) to {}", model.export_name(), dummy_input.len(), self.device);
            model.to_device(self.device)?;
            dummy_input = dummy_input.to_device(self.device);
        }

        let graph = trace_model(&*model, &dummy_input, self.device)?;
        let path = export_dir.join(ExportFormat::TorchScripts.file_name(model.export_name()));
        write_archive(&path, model.export_name(), &graph)?;
        info!("Exported traced program: {} ({} ops)", path.display(), graph.ops.len());
        Ok(path)
    }
}
