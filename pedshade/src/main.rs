//! Command line entry point for the pedestrian shade pipeline.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;

use pedshade::{build_mask, run_zonal_statistics, PipelineConfig};

/// Shade and PET exposure along pedestrian streets.
#[derive(Parser)]
#[command(name = "pedshade")]
#[command(about = "Materialisation mask and zonal statistics of shade and PET")]
struct Cli {
    /// TOML file overriding the built-in configuration.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Filter the materialisation data into a walkable-surface mask.
    Mask,
    /// Zonal statistics of the shade/PET raster along the street network.
    Zonal,
    /// Run the mask, then the zonal statistics.
    All,
    /// Print the effective configuration as TOML.
    PrintConfig,
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(PipelineConfig::default()),
    }
}

fn run_mask(config: &PipelineConfig) -> Result<()> {
    let report = build_mask(&config.mask).context("Materialisation mask failed")?;
    println!(
        "Mask: {} of {} rows kept, {} polygons written to {}",
        report.input_rows - report.excluded_rows,
        report.input_rows,
        report.output_rows,
        report.output_path.display()
    );
    Ok(())
}

fn run_zonal(config: &PipelineConfig) -> Result<()> {
    let report = run_zonal_statistics(&config.zonal).context("Zonal statistics failed")?;
    println!(
        "Zonal statistics: {} bands, {} edges, {} zones",
        report.band_count, report.edges, report.zones
    );
    for output in &report.outputs {
        println!("  saved {}", output.display());
    }
    Ok(())
}

fn main() -> Result<()> {
    pretty_env_logger::formatted_builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Mask => run_mask(&config)?,
        Commands::Zonal => run_zonal(&config)?,
        Commands::All => {
            run_mask(&config)?;
            run_zonal(&config)?;
        }
        Commands::PrintConfig => print!("{}", config.to_toml_string()?),
    }

    Ok(())
}
