use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fira-cli")]
#[command(about = "FIRA reconciliation pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import monthly reports from the configured source databases.
    Import,
    /// Reconcile the geospatial table into the location registry.
    SyncSites,
    /// Refresh admin levels, entities, and typed locations.
    RefreshLevels,
    /// Re-push stored locations whose name contains the fragment.
    PushStored { fragment: String },
}

#[tokio::main]
async fn main() {
    init_tracing();

    if let Err(err) = run().await {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Import) {
        Commands::Import => {
            let summary = fira_sync::run_import_from_env().await?;
            println!(
                "import complete: run_id={} databases={} created={} refreshed={} unresolved={} skipped_sites={}",
                summary.run_id,
                summary.databases,
                summary.reports_created,
                summary.reports_refreshed,
                summary.unresolved_locations,
                summary.skipped_sites
            );
        }
        Commands::SyncSites => {
            let summary = fira_sync::run_site_sync_from_env().await?;
            println!(
                "site sync complete: run_id={} created={} updated={} unchanged={} bad_rows={} bad_codes={} pushed={}",
                summary.run_id,
                summary.created,
                summary.updated,
                summary.unchanged,
                summary.bad_rows,
                summary.bad_codes.len(),
                summary.pushed
            );
        }
        Commands::RefreshLevels => {
            let summary = fira_sync::run_refresh_levels_from_env().await?;
            println!(
                "refresh complete: run_id={} levels={} entities={} location_types={} locations={}",
                summary.run_id,
                summary.levels,
                summary.entities,
                summary.location_types,
                summary.locations
            );
        }
        Commands::PushStored { fragment } => {
            let summary = fira_sync::run_push_stored_from_env(&fragment).await?;
            println!(
                "push complete: run_id={} matched={} pushed={} rejected={}",
                summary.run_id, summary.matched, summary.pushed, summary.rejected
            );
        }
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
