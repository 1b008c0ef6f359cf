// model-export/crates/model-export/src/config.rs

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::env;
use std::path::PathBuf;
use tracing::info;

use crate::device::DeviceRequest;
use crate::error::ExportError;
use crate::format::ExportFormat;
use crate::model::PassthroughOptions;
use crate::onnx::{check_opset_version, DEFAULT_OPSET_VERSION};

/// Option keys consumed by the exporter itself. Everything else is
/// forwarded to the model's `export`.
const CONSUMED_KEYS: [&str; 4] = ["type", "quantize", "opset_version", "device"];

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub format: ExportFormat,
    pub quantize: bool,
    pub opset_version: i64,
    pub output_dir: Option<PathBuf>,
    /// Checkpoint path; its directory is the fallback output directory.
    pub init_param: Option<PathBuf>,
    pub verbose: bool,
    pub device: DeviceRequest,
    pub passthrough: PassthroughOptions,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            format: ExportFormat::Onnx,
            quantize: false,
            opset_version: DEFAULT_OPSET_VERSION,
            output_dir: None,
            init_param: None,
            verbose: false,
            device: DeviceRequest::Auto,
            passthrough: Map::new(),
        }
    }
}

impl ExportConfig {
    pub fn from_env() -> Result<Self> {
        let format = env::var("EXPORT_TYPE")
            .unwrap_or_else(|_| "onnx".into())
            .parse::<ExportFormat>()?;
        let quantize = parse_bool("EXPORT_QUANTIZE", &env::var("EXPORT_QUANTIZE").unwrap_or_else(|_| "false".into()))?;
        let verbose = parse_bool("EXPORT_VERBOSE", &env::var("EXPORT_VERBOSE").unwrap_or_else(|_| "false".into()))?;
        let opset_version = env::var("EXPORT_OPSET_VERSION")
            .unwrap_or_else(|_| DEFAULT_OPSET_VERSION.to_string())
            .parse()
            .context("EXPORT_OPSET_VERSION must be an integer")?;
        let opset_version = check_opset_version(opset_version)?;
        let device = env::var("EXPORT_DEVICE")
            .unwrap_or_else(|_| "auto".into())
            .parse::<DeviceRequest>()?;

        let output_dir = env::var("EXPORT_OUTPUT_DIR").ok().map(PathBuf::from);
        let init_param = env::var("EXPORT_INIT_PARAM").ok().map(PathBuf::from);

        let mut passthrough = Map::new();
        if let Some(dir) = &output_dir {
            passthrough.insert("output_dir".into(), Value::String(dir.to_string_lossy().into_owned()));
        }
        if let Some(path) = &init_param {
            passthrough.insert("init_param".into(), Value::String(path.to_string_lossy().into_owned()));
        }
        passthrough.insert("verbose".into(), Value::Bool(verbose));

        Ok(Self {
            format,
            quantize,
            opset_version,
            output_dir,
            init_param,
            verbose,
            device,
            passthrough,
        })
    }

    /// Build a configuration from a JSON option bag. `output_dir`,
    /// `init_param` and `verbose` are read and also forwarded; the other
    /// recognized keys are consumed.
    pub fn from_options(options: Map<String, Value>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = options.get("type") {
            config.format = string_option("type", value)?.parse()?;
        }
        if let Some(value) = options.get("quantize") {
            config.quantize = bool_option("quantize", value)?;
        }
        if let Some(value) = options.get("opset_version") {
            config.opset_version = check_opset_version(int_option("opset_version", value)?)?;
        }
        if let Some(value) = options.get("device") {
            config.device = string_option("device", value)?.parse()?;
        }
        if let Some(value) = options.get("verbose") {
            config.verbose = bool_option("verbose", value)?;
        }
        if let Some(value) = options.get("output_dir") {
            config.output_dir = Some(PathBuf::from(string_option("output_dir", value)?));
        }
        if let Some(value) = options.get("init_param") {
            config.init_param = Some(PathBuf::from(string_option("init_param", value)?));
        }

        config.passthrough = options
            .into_iter()
            .filter(|(key, _)| !CONSUMED_KEYS.contains(&key.as_str()))
            .collect();
        Ok(config)
    }

    /// `output_dir` if set, else the directory holding `init_param`.
    pub fn resolve_output_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.output_dir {
            return Ok(dir.clone());
        }
        let init_param = self.init_param.as_ref().ok_or(ExportError::MissingOutputDir)?;
        let parent = init_param.parent().ok_or(ExportError::MissingOutputDir)?;
        // a bare file name lives in the working directory
        if parent.as_os_str().is_empty() {
            return Ok(PathBuf::from("."));
        }
        Ok(parent.to_path_buf())
    }

    pub fn print_config(&self) {
        info!("Export Configuration:");
        info!("- Format: {}", self.format);
        info!("- Quantize: {}", self.quantize);
        info!("- Opset Version: {}", self.opset_version);
        info!("- Output Dir: {:?}", self.output_dir);
        info!("- Init Param: {:?}", self.init_param);
        info!("- Device: {:?}", self.device);
        info!("- Passthrough Keys: {:?}", self.passthrough.keys().collect::<Vec<_>>());
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> ExportError {
    ExportError::InvalidOption {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ExportError> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(invalid(key, format!("`{}` is not a boolean", other))),
    }
}

fn bool_option(key: &str, value: &Value) -> Result<bool, ExportError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => parse_bool(key, s),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(invalid(key, format!("{} is not a boolean", n))),
        },
        other => Err(invalid(key, format!("expected a boolean, got {}", other))),
    }
}

fn int_option(key: &str, value: &Value) -> Result<i64, ExportError> {
    match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| invalid(key, format!("{} is not an integer", n))),
        Value::String(s) => s.trim().parse().map_err(|_| invalid(key, format!("`{}` is not an integer", s))),
        other => Err(invalid(key, format!("expected an integer, got {}", other))),
    }
}

fn string_option<'a>(key: &str, value: &'a Value) -> Result<&'a str, ExportError> {
    value
        .as_str()
        .ok_or_else(|| invalid(key, format!("expected a string, got {}", value)))
}
