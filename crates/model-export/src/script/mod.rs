//! Traced program archives (`.torchscripts`).
pub mod program;
pub mod export;
pub use export::ScriptExporter;
pub use program::{load_script, ScriptModule, ScriptProgram, ARCHIVE_VERSION};
