use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use taxoterm_pipeline::{maybe_build_scheduler, Pipeline, PipelineConfig};
use taxoterm_storage::{PgStore, Store};
use taxoterm_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "taxoterm")]
#[command(about = "Microbial taxonomy term aggregator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the JSON API (and the env-gated aggregation scheduler).
    Serve,
    /// Fetch raw records from the configured sources for the given taxa.
    Aggregate {
        #[arg(long = "taxon-id", required = true)]
        taxon_ids: Vec<i64>,
        #[arg(long = "web")]
        webs: Vec<String>,
    },
    /// Fold persisted raw records into term documents.
    Merge {
        #[arg(long = "taxon-id")]
        taxon_ids: Vec<i64>,
    },
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();
    let store = PgStore::connect(&config.database_url).await?;

    match cli.command {
        Commands::Migrate => {
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let pipeline = Arc::new(Pipeline::from_config(
                &config,
                Arc::new(store) as Arc<dyn Store>,
            )?);
            if let Some(scheduler) = maybe_build_scheduler(pipeline.clone(), &config).await? {
                scheduler.start().await?;
                tracing::info!(cron = %config.aggregate_cron, "aggregation scheduler started");
            }
            taxoterm_web::serve_from_env(AppState::new(pipeline)).await?;
        }
        Commands::Aggregate { taxon_ids, webs } => {
            let pipeline =
                Pipeline::from_config(&config, Arc::new(store) as Arc<dyn Store>)?;
            let webs = (!webs.is_empty()).then_some(webs);
            let results = pipeline
                .store_raw_from_portals(&taxon_ids, webs.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Commands::Merge { taxon_ids } => {
            let pipeline =
                Pipeline::from_config(&config, Arc::new(store) as Arc<dyn Store>)?;
            let results = pipeline.store_raw_to_terms(&taxon_ids).await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
    }

    Ok(())
}
