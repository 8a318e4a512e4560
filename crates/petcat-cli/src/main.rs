use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use petcat_core::ProductIdentity;
use petcat_storage::{CatalogStore, EdgeOrder, PgStore, RelationshipStore};
use petcat_sync::{CrawlAborted, CrawlSummary, MergeAborted, ResolveAborted, SyncConfig, SyncPipeline};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "petcat")]
#[command(about = "Pet product price catalog: import, crawl, merge and cross-source matching")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Normalize and merge local JSON payload files for one source.
    Import {
        #[arg(long)]
        source: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Fetch every enabled target in sources.yaml and merge the results.
    Crawl,
    /// Rebuild similarity edges from the current catalog.
    Resolve,
    /// Recompute pet types with the current keyword table.
    Reclassify,
    /// List products similar to one product.
    Similar {
        #[arg(long)]
        source: String,
        #[arg(long)]
        id: String,
        #[arg(long, value_enum, default_value_t = OrderArg::Similarity)]
        order: OrderArg,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Print the recorded price history of one product.
    History {
        #[arg(long)]
        source: String,
        #[arg(long)]
        id: String,
        /// RFC 3339 lower bound, inclusive.
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        /// RFC 3339 upper bound, inclusive.
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },
    /// Delete one product with its history and edges.
    Remove {
        #[arg(long)]
        source: String,
        #[arg(long)]
        id: String,
    },
    /// Apply database migrations.
    Migrate,
    /// Run the resolver on PETCAT_RESOLVE_CRON until interrupted.
    Schedule,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OrderArg {
    Similarity,
    Savings,
}

impl From<OrderArg> for EdgeOrder {
    fn from(order: OrderArg) -> Self {
        match order {
            OrderArg::Similarity => EdgeOrder::Similarity,
            OrderArg::Savings => EdgeOrder::Savings,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let store = Arc::new(
        PgStore::connect(&config.database_url)
            .await
            .context("connecting to catalog database")?,
    );

    let result = run(cli.command, Arc::clone(&store), config).await;
    store.close().await;

    if let Err(err) = &result {
        if let Some(aborted) = err.downcast_ref::<CrawlAborted>() {
            print_crawl("crawl aborted", &aborted.summary);
        } else if let Some(aborted) = err.downcast_ref::<MergeAborted>() {
            println!("merge aborted: {}", aborted.stats);
        } else if let Some(aborted) = err.downcast_ref::<ResolveAborted>() {
            println!("resolve aborted: {}", aborted.stats);
        }
    }
    result
}

fn print_crawl(label: &str, summary: &CrawlSummary) {
    println!(
        "{label}: run_id={} sources={} units={} failed_units={} duplicates={} {}",
        summary.run_id,
        summary.enabled_sources,
        summary.units,
        summary.failed_units,
        summary.duplicate_payloads,
        summary.stats
    );
}

async fn run(command: Commands, store: Arc<PgStore>, config: SyncConfig) -> Result<()> {
    match command {
        Commands::Import { source, files } => {
            let pipeline = SyncPipeline::new(store, config)?;
            let summary = pipeline.import_files(&source, &files).await?;
            println!(
                "import complete: source={} files={} failed_files={} records={} {}",
                summary.source, summary.files, summary.failed_files, summary.records, summary.stats
            );
        }
        Commands::Crawl => {
            let pipeline = SyncPipeline::new(store, config)?;
            let summary = pipeline.crawl_once().await?;
            print_crawl("crawl complete", &summary);
        }
        Commands::Resolve => {
            let pipeline = SyncPipeline::new(store, config)?;
            let summary = pipeline.resolve_once().await?;
            println!(
                "resolve complete: run_id={} products={} compared={} retained={} unpriced={} edges={} manifest={}",
                summary.run_id,
                summary.stats.products,
                summary.stats.compared_pairs,
                summary.stats.retained_pairs,
                summary.stats.unpriced_pairs,
                summary.edges_written,
                summary.manifest.as_deref().unwrap_or("-")
            );
        }
        Commands::Reclassify => {
            let pipeline = SyncPipeline::new(store, config)?;
            let summary = pipeline.reclassify().await?;
            println!("reclassify complete: products={} changed={}", summary.products, summary.changed);
        }
        Commands::Similar {
            source,
            id,
            order,
            limit,
        } => {
            let identity = ProductIdentity::new(source, id);
            let product = store
                .find_product(&identity)
                .await?
                .with_context(|| format!("no product {identity}"))?;
            let names: HashMap<_, _> = store
                .snapshot()
                .await?
                .into_iter()
                .map(|p| (p.id, (p.identity(), p.name)))
                .collect();
            println!("{} ({}) {}", product.name, identity, product.pet_type);
            for edge in store.edges_for(product.id, order.into()).await?.into_iter().take(limit) {
                let (other, name) = names
                    .get(&edge.similar_product_id)
                    .map(|(identity, name)| (identity.to_string(), name.as_str()))
                    .unwrap_or_else(|| (edge.similar_product_id.to_string(), "?"));
                println!(
                    "  {:.3}  diff={:.2} ratio={:.2}  {}  {}",
                    edge.similarity, edge.price_difference, edge.price_ratio, other, name
                );
            }
        }
        Commands::History { source, id, from, to } => {
            let identity = ProductIdentity::new(source, id);
            let points = store.price_history(identity.product_id(), from, to).await?;
            if points.is_empty() {
                println!("no price history for {identity}");
            }
            for point in points {
                println!(
                    "{}  {:<16} {:>9.2} {}",
                    point.recorded_at.to_rfc3339(),
                    point.store,
                    point.amount,
                    point.currency
                );
            }
        }
        Commands::Remove { source, id } => {
            let identity = ProductIdentity::new(source, id);
            if store.remove_product(&identity).await? {
                println!("removed {identity}");
            } else {
                anyhow::bail!("no product {identity}");
            }
        }
        Commands::Migrate => {
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::new(store, config)?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler disabled; set PETCAT_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().resolve_cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }
    Ok(())
}
