// model-export/crates/model-export/src/lib.rs

pub mod config;
pub mod device;
pub mod error;
pub mod exporter;
pub mod format;
pub mod model;
pub mod onnx;
pub mod script;
pub mod telemetry;
pub mod tensor;
pub mod tracer;

// Public API exports
pub use config::ExportConfig;
pub use device::{AcceleratorProbe, Device, DeviceRequest};
pub use error::ExportError;
pub use exporter::{export, export_with_probe};
pub use format::{ExportFormat, FormatDetector};
pub use model::{DynamicAxes, ExportSource, ExportableModel, ModelScripts, PassthroughOptions};
pub use tensor::{DataType, DummyInput, Tensor};
pub use tracer::{Tracer, Value};
