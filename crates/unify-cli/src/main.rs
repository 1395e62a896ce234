use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;
use unify_core::{Product, SourceId, Transaction, UserProfile};
use unify_pipeline::{enrich_transactions, IngestPipeline, PipelineConfig};
use unify_storage::{PgRepository, Repository};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "unify-cli")]
#[command(about = "Unified ingestion service command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, normalize and store every configured source, or one of them.
    Ingest {
        #[arg(long)]
        source: Option<String>,
    },
    /// Rebuild enriched transaction records from the relational rows.
    Enrich,
    /// Run the periodic ingestion scheduler in the foreground.
    Schedule,
    /// Apply pending database migrations.
    Migrate,
    /// Load a small demo dataset into the relational tables.
    Seed,
    /// Serve the JSON API.
    Serve,
}

fn init_tracing(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn connect(config: &PipelineConfig) -> Result<PgRepository> {
    PgRepository::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info");
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Ingest { source: None }) {
        Commands::Ingest { source } => {
            let repo = connect(&config).await?;
            let pipeline = IngestPipeline::new(config, Arc::new(repo))?;
            match source {
                Some(name) => match name.parse::<SourceId>() {
                    Ok(source) => {
                        let outcome = pipeline.run(source).await?;
                        println!("{}", outcome.message(source));
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "unrecognized source name");
                        println!("Failed to fetch data from {name}");
                    }
                },
                None => {
                    for (source, outcome) in pipeline.run_all().await {
                        println!("{}", outcome.message(source));
                    }
                }
            }
        }
        Commands::Enrich => {
            let repo = connect(&config).await?;
            let count = enrich_transactions(&repo).await?;
            println!("Successfully enriched {count} transaction records.");
        }
        Commands::Schedule => {
            let repo = connect(&config).await?;
            let mut config = config;
            // The command itself is the explicit opt-in.
            config.scheduler_enabled = true;
            let pipeline = Arc::new(IngestPipeline::new(config, Arc::new(repo))?);
            let scheduler = pipeline
                .maybe_build_scheduler()
                .await?
                .context("scheduler could not be built")?;
            scheduler.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
        Commands::Migrate => {
            let repo = connect(&config).await?;
            repo.migrate().await?;
            println!("migrations applied");
        }
        Commands::Seed => {
            let repo = connect(&config).await?;
            repo.migrate().await?;
            seed_demo_data(&repo).await?;
            println!("demo dataset loaded");
        }
        Commands::Serve => {
            unify_web::serve_from_env().await?;
        }
    }

    Ok(())
}

/// Relational rows are normally maintained outside this service; this demo
/// dataset exists so enrichment and insights have something to join locally.
async fn seed_demo_data(repo: &PgRepository) -> Result<()> {
    let ada = UserProfile {
        external_id: Uuid::new_v4(),
        name: "Ada Lovelace".to_string(),
        email: "ada@example.com".to_string(),
        phone: Some("+44 20 7946 0001".to_string()),
        country: "United Kingdom".to_string(),
        registered_at: Utc::now(),
    };
    let grace = UserProfile {
        external_id: Uuid::new_v4(),
        name: "Grace Hopper".to_string(),
        email: "grace@example.com".to_string(),
        phone: None,
        country: "United States".to_string(),
        registered_at: Utc::now(),
    };
    repo.insert_user(&ada).await?;
    repo.insert_user(&grace).await?;

    repo.insert_category("clothing").await?;
    repo.insert_category("electronics").await?;

    let shirt = Product {
        external_id: 1,
        title: "Shirt".to_string(),
        price: Decimal::new(999, 2),
        category: Some("clothing".to_string()),
        description: "A plain shirt.".to_string(),
        image_url: "https://example.com/shirt.png".to_string(),
    };
    let radio = Product {
        external_id: 2,
        title: "Radio".to_string(),
        price: Decimal::new(4950, 2),
        category: Some("electronics".to_string()),
        description: "A portable radio.".to_string(),
        image_url: "https://example.com/radio.png".to_string(),
    };
    repo.insert_product(&shirt).await?;
    repo.insert_product(&radio).await?;

    for (user, product, amount) in [
        (&ada, &shirt, Decimal::new(999, 2)),
        (&ada, &radio, Decimal::new(4950, 2)),
        (&grace, &shirt, Decimal::new(1998, 2)),
    ] {
        repo.insert_transaction(&Transaction {
            external_id: Uuid::new_v4(),
            user_external_id: user.external_id,
            product_external_id: product.external_id,
            amount,
            timestamp: Utc::now(),
        })
        .await?;
    }

    Ok(())
}
