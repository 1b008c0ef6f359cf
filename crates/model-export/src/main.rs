// model-export/crates/model-export/src/main.rs

#[cfg(feature = "cli")]
use anyhow::{bail, Context, Result};
#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use dotenvy::dotenv;
#[cfg(feature = "cli")]
use model_export::{
    config::ExportConfig,
    format::{ExportFormat, FormatDetector},
    onnx::{export::quantized_path_for, proto, quantize},
    script::load_script,
    telemetry::init_tracing,
};
#[cfg(feature = "cli")]
use std::path::{Path, PathBuf};
#[cfg(feature = "cli")]
use tracing::info;

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "model-export", version, about = "Inspect and post-process exported model artifacts")]
struct Cli {
    /// Debug logging for this crate (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Command {
    /// Print the export settings read from EXPORT_* environment variables
    Config,
    /// Summarize an exported .onnx graph or .torchscripts archive
    Inspect { path: PathBuf },
    /// Dynamically quantize an exported ONNX graph
    Quantize {
        path: PathBuf,
        /// Defaults to `<name>_quant.onnx` next to the input
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Overwrite an existing quantized graph
        #[arg(long)]
        force: bool,
    },
}

#[cfg(feature = "cli")]
fn main() -> Result<()> {
    dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Config => {
            let cfg = ExportConfig::from_env()?;
            cfg.print_config();
            Ok(())
        }
        Command::Inspect { path } => inspect(&path),
        Command::Quantize { path, output, force } => run_quantize(&path, output, force),
    }
}

#[cfg(feature = "cli")]
fn inspect(path: &Path) -> Result<()> {
    let format = FormatDetector::detect_from_path(path).with_context(|| {
        format!(
            "{} has no recognized extension (expected one of {:?})",
            path.display(),
            FormatDetector::supported_extensions()
        )
    })?;

    match format {
        ExportFormat::Onnx => {
            let model = proto::load_model(path)?;
            let graph = model
                .graph
                .as_ref()
                .with_context(|| format!("{} has no graph", path.display()))?;
            println!("{} ({})", path.display(), format.name());
            println!("  producer: {} {}", model.producer_name, model.producer_version);
            println!("  opset: {}", model.opset_version().unwrap_or_default());
            println!("  quantized: {}", FormatDetector::is_quantized(path));
            for input in &graph.input {
                println!("  input:  {}", input.name);
            }
            for output in &graph.output {
                println!("  output: {}", output.name);
            }
            println!("  nodes: {}", graph.node.len());
            println!("  initializers: {}", graph.initializer.len());
            let excluded = quantize::nodes_to_exclude_for(graph);
            if !excluded.is_empty() {
                println!("  kept at full precision when quantized: {}", excluded.join(", "));
            }
            for prop in &model.metadata_props {
                println!("  {}: {}", prop.key, prop.value);
            }
        }
        ExportFormat::TorchScripts => {
            let module = load_script(path)?;
            let program = &module.program;
            println!("{} ({})", path.display(), format.name());
            println!("  name: {}", program.name);
            println!("  device: {}", program.device);
            for input in &program.inputs {
                println!("  input:  {} {} {:?}", input.name, input.dtype.name(), input.shape);
            }
            for output in &program.outputs {
                println!("  output: {} {} {:?}", output.name, output.dtype.name(), output.shape);
            }
            println!("  constants: {}", module.constants.len());
            for op in &program.ops {
                println!("    {} {} {:?} -> {:?}", op.name, op.op_type, op.inputs, op.outputs);
            }
        }
    }
    Ok(())
}

#[cfg(feature = "cli")]
fn run_quantize(path: &Path, output: Option<PathBuf>, force: bool) -> Result<()> {
    if FormatDetector::detect_from_path(path) != Some(ExportFormat::Onnx) {
        bail!("{} is not an ONNX graph", path.display());
    }
    let output = output.unwrap_or_else(|| quantized_path_for(path));

    if let Some(report) = quantize::quantize_file(path, &output, force)? {
        info!(
            "Wrote {}: {} quantized, {} excluded, {} skipped",
            output.display(),
            report.quantized_nodes.len(),
            report.excluded_nodes.len(),
            report.skipped_nodes.len()
        );
    }
    Ok(())
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
