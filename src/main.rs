//! patchserve CLI - serve a graph over large rasters.

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueHint};
use patchserve::prelude::*;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Tiled, multi-source, patch-based inference over stacked rasters"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply a model to one or more sources and write a GeoTIFF
    Run(RunArgs),

    /// Print the inputs and outputs of a model as JSON
    Inspect(InspectArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Load the whole setup from a TOML file; flags below override it
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Model file, or directory containing `model.onnx`
    #[arg(long, value_hint = ValueHint::AnyPath)]
    model: Option<PathBuf>,

    /// Source as `PLACEHOLDER:WIDTHxHEIGHT:IMAGE[,IMAGE...]`; repeat for more sources
    #[arg(long = "source", value_parser = parse_source)]
    sources: Vec<SourceConfig>,

    /// Constant placeholder as `name=value`; repeat for more constants
    #[arg(long = "constant")]
    constants: Vec<String>,

    /// Output tensor name; repeat to stack several outputs as bands
    #[arg(long = "output-name")]
    output_names: Vec<String>,

    /// Output raster path
    #[arg(long, short, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,

    /// Output pixel size divided by input pixel size
    #[arg(long)]
    spacing_scale: Option<f64>,

    /// Field of expression as `WIDTHxHEIGHT`
    #[arg(long, value_parser = parse_size)]
    foe: Option<Size2D>,

    /// Run the graph once per tile instead of once per patch
    #[arg(long)]
    fully_convolutional: bool,

    /// Tile side in output pixels
    #[arg(long)]
    tile_size: Option<u32>,

    /// Process the whole output as a single tile
    #[arg(long = "no-tiling", action = ArgAction::SetFalse, default_value_t = true)]
    tiling: bool,

    /// Number of tiles computed concurrently
    #[arg(long)]
    tiles_in_flight: Option<usize>,

    /// Only validate the setup, do not compute any tile
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct InspectArgs {
    /// Model file, or directory containing `model.onnx`
    #[arg(long, value_hint = ValueHint::AnyPath)]
    model: PathBuf,
}

fn parse_size(text: &str) -> std::result::Result<Size2D, String> {
    let (w, h) = text
        .split_once(['x', 'X'])
        .unwrap_or((text, text));
    let width = w.trim().parse::<u32>().map_err(|e| format!("bad width '{}': {}", w, e))?;
    let height = h.trim().parse::<u32>().map_err(|e| format!("bad height '{}': {}", h, e))?;
    Ok(Size2D::new(width, height))
}

fn parse_source(text: &str) -> std::result::Result<SourceConfig, String> {
    let mut parts = text.splitn(3, ':');
    let (Some(placeholder), Some(patch), Some(images)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("expected PLACEHOLDER:WIDTHxHEIGHT:IMAGES, got '{}'", text));
    };
    let images: Vec<String> = images
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if images.is_empty() {
        return Err(format!("source '{}' lists no image", placeholder));
    }
    Ok(SourceConfig {
        images,
        patch: parse_size(patch)?,
        placeholder: placeholder.trim().to_string(),
    })
}

impl RunArgs {
    /// Merge the optional config file with command-line flags.
    fn into_config(self) -> Result<ServeConfig> {
        let mut config = match &self.config {
            Some(path) => ServeConfig::load(path)
                .with_context(|| format!("failed to load configuration {}", path.display()))?,
            None => {
                let model = self
                    .model
                    .clone()
                    .ok_or_else(|| anyhow!("either --config or --model is required"))?;
                ServeConfig::new(model)
            }
        };

        if let Some(model) = self.model {
            config.model = model;
        }
        if !self.sources.is_empty() {
            config.sources = self.sources;
        }
        config.constants.extend(self.constants);
        if !self.output_names.is_empty() {
            config.output.names = self.output_names;
        }
        if let Some(path) = self.output {
            config.output.path = path;
        }
        if let Some(scale) = self.spacing_scale {
            config.output.spacing_scale = scale;
        }
        if let Some(foe) = self.foe {
            config.output.foe = foe;
        }
        if self.fully_convolutional {
            config.output.fully_convolutional = true;
        }
        if let Some(size) = self.tile_size {
            config.tiling.tile_size = size;
        }
        if !self.tiling {
            config.tiling.enabled = false;
        }
        if let Some(n) = self.tiles_in_flight {
            config.tiling.tiles_in_flight = n;
        }
        Ok(config)
    }
}

fn run(args: RunArgs) -> Result<()> {
    let dry_run = args.dry_run;
    let config = args.into_config()?;
    config.check().context("invalid configuration")?;

    let host = default_host()?;
    let server = ModelServer::from_config(&config, host.as_ref()).context("failed to set up serving")?;

    let report = server.validate();
    for warning in &report.warnings {
        log::warn!("{}", warning.message);
    }
    if !report.can_execute() {
        for line in report.detailed_errors() {
            log::error!("{}", line);
        }
        bail!("{}", report.summary());
    }
    if dry_run {
        let geometry = server.geometry()?;
        println!("{}", report.summary());
        println!(
            "output {} at {}",
            geometry.output_region().size(),
            config.output.path.display()
        );
        return Ok(());
    }

    let options = server.options().clone().with_progress(|update| match update {
        ProgressUpdate::Started { total_tiles } => log::info!("Streaming {} tile(s)", total_tiles),
        ProgressUpdate::Progress {
            percent,
            estimated_remaining_ms,
            ..
        } => match estimated_remaining_ms {
            Some(ms) => log::info!("{:.1}% ({:.1}s remaining)", percent, ms as f64 / 1000.0),
            None => log::info!("{:.1}%", percent),
        },
        _ => {}
    });
    let server = server.with_options(options);

    let mut sink = TiffSink::new(&config.output.path);
    let stream = server
        .serve_unchecked(&mut sink)
        .with_context(|| format!("failed to produce {}", config.output.path.display()))?;

    log::info!(
        "Wrote {} ({}x{}, {} band(s)) from {} tile(s) in {:.2}s",
        config.output.path.display(),
        stream.output.width,
        stream.output.height,
        stream.output.bands,
        stream.tiles,
        stream.duration_ms as f64 / 1000.0
    );
    Ok(())
}

fn inspect(args: InspectArgs) -> Result<()> {
    let host = default_host()?;
    let session = host
        .load_model(&args.model)
        .with_context(|| format!("failed to load {}", args.model.display()))?;
    println!("{}", serde_json::to_string_pretty(session.info())?);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::debug!("{} v{}", patchserve::NAME, patchserve::VERSION);

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args),
        Command::Inspect(args) => inspect(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("16x8").unwrap(), Size2D::new(16, 8));
        assert_eq!(parse_size("5").unwrap(), Size2D::square(5));
        assert!(parse_size("ax2").is_err());
    }

    #[test]
    fn test_parse_source() {
        let source = parse_source("x1:16x16:a.tif, b.tif").unwrap();
        assert_eq!(source.placeholder, "x1");
        assert_eq!(source.patch, Size2D::square(16));
        assert_eq!(source.images, vec!["a.tif", "b.tif"]);
        assert!(parse_source("x1:16x16").is_err());
        assert!(parse_source("x1:16x16:").is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "patchserve",
            "run",
            "--model",
            "m.onnx",
            "--source",
            "x:4x4:in.tif",
            "--output-name",
            "y",
            "--foe",
            "2x2",
            "--no-tiling",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = args.into_config().unwrap();
        assert_eq!(config.model, PathBuf::from("m.onnx"));
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.output.names, vec!["y"]);
        assert_eq!(config.output.foe, Size2D::square(2));
        assert!(!config.tiling.enabled);
        config.check().unwrap();
    }
}
