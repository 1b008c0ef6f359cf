//! Device placement for exported models.
//!
//! Accelerator availability is never queried ambiently: callers pass an
//! [`AcceleratorProbe`] and [`resolve_device`] turns a [`DeviceRequest`]
//! into a concrete [`Device`]. Resolution always succeeds; a missing
//! accelerator falls back to the CPU.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

use crate::error::ExportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(u32),
}

impl Device {
    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(index) => write!(f, "cuda:{}", index),
        }
    }
}

/// What the caller asked for, before checking what the host has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceRequest {
    #[default]
    Auto,
    Cpu,
    Cuda(u32),
}

impl FromStr for DeviceRequest {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_lowercase();
        match value.as_str() {
            "auto" | "" => Ok(DeviceRequest::Auto),
            "cpu" => Ok(DeviceRequest::Cpu),
            "cuda" | "gpu" => Ok(DeviceRequest::Cuda(0)),
            other => {
                let index = other
                    .strip_prefix("cuda:")
                    .and_then(|i| i.parse::<u32>().ok())
                    .ok_or_else(|| ExportError::InvalidOption {
                        key: "device".to_string(),
                        reason: format!("unrecognized device `{}`", s),
                    })?;
                Ok(DeviceRequest::Cuda(index))
            }
        }
    }
}

/// Reports how many accelerators the host exposes.
pub trait AcceleratorProbe {
    fn device_count(&self) -> u32;
}

/// Probe for hosts (and tests) without any accelerator.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAccelerator;

impl AcceleratorProbe for NoAccelerator {
    fn device_count(&self) -> u32 {
        0
    }
}

/// Fixed device count, for tests that need an accelerator present.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub u32);

impl AcceleratorProbe for StaticProbe {
    fn device_count(&self) -> u32 {
        self.0
    }
}

/// NVML-backed probe. Any NVML failure counts as "no accelerator".
#[cfg(feature = "nvml")]
#[derive(Debug, Clone, Copy, Default)]
pub struct NvmlProbe;

#[cfg(feature = "nvml")]
impl AcceleratorProbe for NvmlProbe {
    fn device_count(&self) -> u32 {
        match nvml_wrapper::Nvml::init() {
            Ok(nvml) => nvml.device_count().unwrap_or(0),
            Err(e) => {
                warn!("NVML unavailable ({}), assuming no accelerator", e);
                0
            }
        }
    }
}

/// Probe used by [`crate::exporter::export`] when none is supplied.
pub fn default_probe() -> Box<dyn AcceleratorProbe> {
    #[cfg(feature = "nvml")]
    {
        Box::new(NvmlProbe)
    }
    #[cfg(not(feature = "nvml"))]
    {
        Box::new(NoAccelerator)
    }
}

pub fn resolve_device(request: DeviceRequest, probe: &dyn AcceleratorProbe) -> Device {
    let available = probe.device_count();
    let device = match request {
        DeviceRequest::Cpu => Device::Cpu,
        DeviceRequest::Auto if available > 0 => Device::Cuda(0),
        DeviceRequest::Auto => Device::Cpu,
        DeviceRequest::Cuda(index) if index < available => Device::Cuda(index),
        DeviceRequest::Cuda(index) => {
            warn!(
                "Requested cuda:{} but {} accelerator(s) available, falling back to cpu",
                index, available
            );
            Device::Cpu
        }
    };
    info!("Export device: {}", device);
    device
}
