use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use geofull::normalizer::{Normalizer, RuleSet};
use geofull::{
    init_tracing, AddressId, AddressStatus, AppConfig, BatchOperation, BatchProgress,
    CancellationSignal, ManualCorrection, Orchestrator, ProgressObserver,
};

#[derive(Parser)]
#[command(name = "geofull")]
#[command(about = "Normalize and geocode postal addresses")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import addresses from a CSV file with a `direccion` or `address` column
    Import { path: PathBuf },
    /// Normalize every pending address
    Normalize,
    /// Geocode every normalized address
    Geocode,
    /// Normalize and geocode everything not yet verified
    Process,
    /// Reopen failed addresses and run them again
    RetryFailed,
    /// Write stored addresses to a CSV file
    Export {
        path: PathBuf,
        /// Only export addresses with this status
        #[arg(long)]
        status: Option<String>,
    },
    /// Print one stored address as JSON
    Show { id: String },
    /// Correct a verified address by hand
    Correct {
        id: String,
        /// Revision the correction was prepared against
        #[arg(long)]
        revision: u64,
        #[arg(long)]
        normalized: Option<String>,
        #[arg(long)]
        suggested: Option<String>,
        #[arg(long, allow_hyphen_values = true)]
        latitude: Option<f64>,
        #[arg(long, allow_hyphen_values = true)]
        longitude: Option<f64>,
        #[arg(long)]
        postal_code: Option<String>,
    },
    /// Normalize a single address without storing it
    NormalizeText { raw: String },
    /// Show provider health and the active configuration
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env();

    if let Commands::NormalizeText { raw } = &cli.command {
        let rules = match &config.normalizer_rules_path {
            Some(path) => RuleSet::load(path)?,
            None => RuleSet::colombian()?,
        };
        println!("{}", Normalizer::new(Arc::new(rules)).normalize(raw));
        return Ok(());
    }

    let orchestrator = Orchestrator::open(config).context("failed to start geofull")?;

    match cli.command {
        Commands::Import { path } => {
            let summary = orchestrator
                .import_csv(&path)
                .with_context(|| format!("failed to import {}", path.display()))?;
            print_json(&summary)?;
        }
        Commands::Normalize => run_batch(&orchestrator, BatchOperation::Normalize).await?,
        Commands::Geocode => run_batch(&orchestrator, BatchOperation::Geocode).await?,
        Commands::Process => run_batch(&orchestrator, BatchOperation::Full).await?,
        Commands::RetryFailed => {
            let cancel = cancel_on_interrupt();
            let report = orchestrator
                .retry_failed(Some(progress_logger()), Some(cancel))
                .await?;
            print_json(&report)?;
        }
        Commands::Export { path, status } => {
            let status = status.as_deref().map(AddressStatus::parse).transpose()?;
            let written = orchestrator.export_csv(&path, status)?;
            print_json(&json!({ "path": path, "rows": written }))?;
        }
        Commands::Show { id } => {
            let record = orchestrator.load(AddressId::parse(&id)?)?;
            print_json(&record)?;
        }
        Commands::Correct {
            id,
            revision,
            normalized,
            suggested,
            latitude,
            longitude,
            postal_code,
        } => {
            let correction = ManualCorrection {
                normalized_text: normalized,
                suggested_text: suggested,
                latitude,
                longitude,
                postal_code,
            };
            let record =
                orchestrator.apply_correction(AddressId::parse(&id)?, revision, correction)?;
            print_json(&record)?;
        }
        Commands::Health => {
            print_json(&json!({
                "config": orchestrator.config().public_profile(),
                "providers": orchestrator.provider_health(),
            }))?;
        }
        Commands::NormalizeText { .. } => {}
    }
    Ok(())
}

async fn run_batch(orchestrator: &Orchestrator, operation: BatchOperation) -> anyhow::Result<()> {
    let cancel = cancel_on_interrupt();
    let report = orchestrator
        .run_pending(operation, Some(progress_logger()), Some(cancel))
        .await?;
    print_json(&report)
}

fn cancel_on_interrupt() -> CancellationSignal {
    let cancel = CancellationSignal::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing addresses already in flight");
            trigger.cancel();
        }
    });
    cancel
}

fn progress_logger() -> ProgressObserver {
    Arc::new(|progress: BatchProgress| {
        debug!(
            operation = %progress.operation,
            processed = progress.processed,
            total = progress.total,
            failed = progress.failed,
            "batch progress"
        );
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
