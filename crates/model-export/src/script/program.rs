//! On-disk layout of a traced program archive.
//!
//! A `.torchscripts` file is a zip archive whose entries all live under an
//! `<export_name>/` prefix:
//!
//! ```text
//! <name>/version            archive format version, ASCII
//! <name>/program.bin        bincode ScriptProgram
//! <name>/constants/<index>  little-endian tensor bytes, one per constant
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::device::Device;
use crate::error::ExportError;
use crate::tensor::{DataType, Tensor};
use crate::tracer::{TracedGraph, TracedOp, ValueInfo};

pub const ARCHIVE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantEntry {
    pub name: String,
    pub dtype: DataType,
    pub shape: Vec<usize>,
}

/// The replayable op sequence recorded for one concrete input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptProgram {
    pub name: String,
    pub device: Device,
    pub inputs: Vec<ValueInfo>,
    pub ops: Vec<TracedOp>,
    pub outputs: Vec<ValueInfo>,
    pub constants: Vec<ConstantEntry>,
}

impl ScriptProgram {
    pub fn from_traced(name: &str, graph: &TracedGraph) -> Self {
        Self {
            name: name.to_string(),
            device: graph.device,
            inputs: graph.inputs.clone(),
            ops: graph.ops.clone(),
            outputs: graph.outputs.clone(),
            constants: graph
                .parameters
                .iter()
                .map(|(name, t)| ConstantEntry {
                    name: name.clone(),
                    dtype: t.dtype(),
                    shape: t.shape().to_vec(),
                })
                .collect(),
        }
    }
}

/// A program read back from disk together with its constant tensors.
#[derive(Debug, Clone)]
pub struct ScriptModule {
    pub program: ScriptProgram,
    pub constants: Vec<Tensor>,
}

impl ScriptModule {
    pub fn constant(&self, name: &str) -> Option<&Tensor> {
        self.program
            .constants
            .iter()
            .position(|c| c.name == name)
            .map(|i| &self.constants[i])
    }
}

fn entry_options(method: CompressionMethod) -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(method)
}

pub fn write_archive(path: &Path, name: &str, graph: &TracedGraph) -> Result<()> {
    let program = ScriptProgram::from_traced(name, graph);
    let encoded = bincode::serialize(&program).context("Failed to encode traced program")?;

    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut zip = ZipWriter::new(file);

    zip.start_file(format!("{}/version", name), entry_options(CompressionMethod::Stored))?;
    zip.write_all(ARCHIVE_VERSION.to_string().as_bytes())?;
    zip.start_file(format!("{}/program.bin", name), entry_options(CompressionMethod::Deflated))?;
    zip.write_all(&encoded)?;
    // constants stay uncompressed so they can be read in place
    for (index, (_, tensor)) in graph.parameters.iter().enumerate() {
        zip.start_file(format!("{}/constants/{}", name, index), entry_options(CompressionMethod::Stored))?;
        zip.write_all(&tensor.to_le_bytes())?;
    }
    zip.finish()
        .with_context(|| format!("Failed to finalize {}", path.display()))?;
    Ok(())
}

fn read_entry<R: Read + std::io::Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Vec<u8>> {
    let mut entry = archive
        .by_name(name)
        .map_err(|_| ExportError::InvalidArchive(format!("missing entry `{}`", name)))?;
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

pub fn load_script(path: &Path) -> Result<ScriptModule> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("{} is not a program archive", path.display()))?;

    let prefix = archive
        .file_names()
        .find_map(|n| n.strip_suffix("/program.bin"))
        .map(|p| p.to_string())
        .ok_or_else(|| ExportError::InvalidArchive("no program.bin entry".to_string()))?;

    let version = String::from_utf8(read_entry(&mut archive, &format!("{}/version", prefix))?)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .ok_or_else(|| ExportError::InvalidArchive("unreadable version entry".to_string()))?;
    if version != ARCHIVE_VERSION {
        return Err(ExportError::InvalidArchive(format!(
            "archive version {} (expected {})",
            version, ARCHIVE_VERSION
        ))
        .into());
    }

    let program: ScriptProgram = bincode::deserialize(&read_entry(&mut archive, &format!("{}/program.bin", prefix))?)
        .with_context(|| format!("Failed to decode program in {}", path.display()))?;

    let mut constants = Vec::with_capacity(program.constants.len());
    for (index, entry) in program.constants.iter().enumerate() {
        let bytes = read_entry(&mut archive, &format!("{}/constants/{}", prefix, index))?;
        let tensor = Tensor::from_le_bytes(entry.dtype, entry.shape.clone(), &bytes)
            .with_context(|| format!("constant `{}`", entry.name))?;
        constants.push(tensor.to_device(program.device));
    }

    Ok(ScriptModule { program, constants })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::Tracer;

    #[test]
    fn test_archive_preserves_program_and_constants() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enc.torchscripts");

        let mut t = Tracer::new(Device::Cpu);
        let x = t.input(&Tensor::zeros(vec![1, 2], DataType::F32)).unwrap();
        let w = Tensor::from_f32(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let wv = t.parameter("enc.weight", &w).unwrap();
        let y = t.matmul(x, wv).unwrap();
        let graph = t.finish(&[y]).unwrap();

        write_archive(&path, "enc", &graph).unwrap();
        let module = load_script(&path).unwrap();
        assert_eq!(module.program.name, "enc");
        assert_eq!(module.program.ops, graph.ops);
        assert_eq!(module.constant("enc.weight"), Some(&w));
    }

    #[test]
    fn test_rejects_non_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.torchscripts");
        std::fs::write(&path, b"not a zip").unwrap();
        assert!(load_script(&path).is_err());
    }
}
