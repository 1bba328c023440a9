use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use modelvault::config::Config;
use modelvault::models::registry::{Refresh, RefreshOutcome};
use modelvault::models::{LoadedModel, ModelManager};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "modelvault")]
#[command(about = "Resolve, cache and activate diffusion model presets", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.config/modelvault/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the files a preset needs
    Resolve {
        /// Preset name or path to a preset JSON file
        preset: Option<String>,
        /// Print the manifest as JSON
        #[arg(long)]
        json: bool,
    },
    /// Download every missing file of a preset
    Download { preset: Option<String> },
    /// Detect the architecture of a checkpoint file
    Inspect { path: PathBuf },
    /// Download and load a preset's base and refiner models
    Activate { preset: Option<String> },
    /// List available presets
    Presets,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let manager = ModelManager::new(&config).context("Failed to initialize model manager")?;

    match cli.command {
        Commands::Resolve { preset, json } => {
            let manifest = manager.resolve(preset.as_deref())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&manifest)?);
                return Ok(());
            }

            println!("Model:   {}", manifest.default_model().file_name);
            match manifest.default_refiner() {
                Some(refiner) => println!(
                    "Refiner: {} (switch at {})",
                    refiner.file_name,
                    manifest.default_refiner_switch()
                ),
                None => println!("Refiner: None"),
            }
            println!("LoRAs:   {} active", manifest.active_adapter_count());
            println!("\nDownloads:");
            for artifact in manifest.downloads() {
                let cached = if manager.store().exists(artifact.class, &artifact.file_name)? {
                    "✓"
                } else {
                    " "
                };
                println!("  {cached} {:<10} {}", artifact.class, artifact.file_name);
            }
        }
        Commands::Download { preset } => {
            let manifest = manager.resolve(preset.as_deref())?;
            let paths = manager.download(&manifest).await?;
            println!("✓ {} file(s) ready", paths.len());
        }
        Commands::Inspect { path } => {
            let model = manager.inspect(&path)?;
            print_model(&model);
        }
        Commands::Activate { preset } => {
            let report = manager.activate(preset.as_deref()).await?;
            print_refresh("Base", &report.base);
            print_refresh("Refiner", &report.refiner);

            let active = manager.registry().begin_use().await;
            if let Some(model) = active.base() {
                print_model(model);
            }
            if let Some(model) = active.refiner() {
                print_model(model);
            }
        }
        Commands::Presets => {
            let names = manager.preset_names()?;
            if names.is_empty() {
                println!("No presets found in {}", config.paths.presets.display());
            }
            for name in names {
                let marker = if name == config.runtime.default_preset { "*" } else { " " };
                println!("{marker} {name}");
            }
        }
    }

    Ok(())
}

fn print_refresh(role: &str, refresh: &Refresh) {
    let outcome = match refresh.outcome {
        RefreshOutcome::Unchanged => "unchanged",
        RefreshOutcome::Loaded => "loaded",
        RefreshOutcome::Unloaded => "unloaded",
    };
    println!("{role}: {outcome}");
    for warning in &refresh.warnings {
        println!("  ⚠ {warning}");
    }
}

fn print_model(model: &LoadedModel) {
    println!("{} [{}]", model.path().display(), model.family());
    for component in model.sub_models().components() {
        println!(
            "  {:<10} {:>5} tensors, {} parameters",
            component.name(),
            component.len(),
            component.parameter_count()
        );
    }
    println!("  total      {} parameters", model.parameter_count());
}
