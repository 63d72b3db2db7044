use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use dossier_flow::{
    config, init_database, init_telemetry, shutdown_database, shutdown_telemetry, ProductCatalog,
};

#[derive(Parser)]
#[command(name = "dossier-flow")]
#[command(about = "Dossier workflow and validation engine for LLC formation")]
#[command(long_about = "Dossier Flow tracks client dossiers through review steps, from payment-driven \
                       provisioning to final approval. These commands inspect the catalog and \
                       configuration the engine runs with.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a product catalog and print its steps
    CheckCatalog {
        /// Catalog file to check
        #[arg(help = "Path to the catalog TOML file (defaults to the configured catalog)")]
        path: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
    /// Create the database and run migrations
    InitDb,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = config()?;
    init_telemetry(&settings.observability)?;

    let result = match cli.command {
        Commands::CheckCatalog { path } => {
            let path = path.unwrap_or_else(|| PathBuf::from(&settings.catalog.path));
            check_catalog(path)
        }
        Commands::ShowConfig => show_config(),
        Commands::InitDb => tokio::runtime::Runtime::new()?.block_on(async {
            init_database().await?;
            shutdown_database().await;
            Ok(())
        }),
    };

    shutdown_telemetry();
    result
}

fn check_catalog(path: PathBuf) -> Result<()> {
    let catalog = ProductCatalog::load(&path)
        .with_context(|| format!("Failed to load catalog from {}", path.display()))?;

    for product in catalog.products() {
        println!("{} ({})", product.name, product.id);
        for step in product.ordered_steps() {
            println!(
                "  {:>2}. {} [{}] fields={} documents={}",
                step.position,
                step.label,
                step.actor,
                step.fields.len(),
                step.required_document_types.len()
            );
        }
    }
    Ok(())
}

fn show_config() -> Result<()> {
    let settings = config()?;
    let rendered = toml::to_string_pretty(settings).context("Failed to render configuration")?;
    println!("{rendered}");
    Ok(())
}
