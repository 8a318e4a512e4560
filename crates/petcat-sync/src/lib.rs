//! Pipeline orchestration: import, crawl, merge, resolve and scheduling.

pub mod classify;
pub mod config;
pub mod export;
pub mod merge;
pub mod resolve;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use petcat_adapters::{load_raw_records, normalizer_for_source, parse_raw_records};
use petcat_core::{CanonicalProduct, MergeStats};
use petcat_storage::{CatalogStore, Fetcher, PayloadArchive, RelationshipStore, StoreError};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use classify::{PetTypeClassifier, PetTypeRule};
pub use config::{CrawlTarget, SourceConfig, SourceRegistry, SyncConfig};
pub use export::{export_edges, ExportManifest, ExportManifestFile};
pub use merge::{normalize_batch, MergeAborted, MergeError, NormalizedBatch, UpsertMerger};
pub use resolve::{jaccard, ResolveAborted, ResolveStats, ResolverConfig, SimilarityResolver, TextNormalizer};

pub const CRATE_NAME: &str = "petcat-sync";

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub source: String,
    pub files: usize,
    pub failed_files: usize,
    pub records: usize,
    pub stats: MergeStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_sources: usize,
    pub units: usize,
    pub failed_units: usize,
    pub archived_payloads: usize,
    pub duplicate_payloads: usize,
    pub stats: MergeStats,
}

/// The store failed during a crawl. Carries the run summary reached so far.
#[derive(Debug, Error)]
#[error("crawl aborted after {} units ({}): {source}", .summary.units, .summary.stats)]
pub struct CrawlAborted {
    pub summary: CrawlSummary,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolveSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: ResolveStats,
    pub edges_written: usize,
    pub manifest: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReclassifySummary {
    pub products: usize,
    pub changed: usize,
}

/// Runs share one store handle; the caller owns its lifecycle.
pub struct SyncPipeline<S> {
    store: Arc<S>,
    config: SyncConfig,
    archive: PayloadArchive,
    fetcher: Fetcher,
    classifier: PetTypeClassifier,
    resolver: SimilarityResolver,
}

impl<S> SyncPipeline<S>
where
    S: CatalogStore + RelationshipStore + 'static,
{
    pub fn new(store: Arc<S>, config: SyncConfig) -> Result<Self> {
        let archive = PayloadArchive::new(config.artifacts_dir.clone());
        let fetcher = Fetcher::new(config.fetcher_config())?;
        let classifier = PetTypeClassifier::from_workspace_root(&config.workspace_root)?;
        let text = TextNormalizer::from_workspace_root(&config.workspace_root)?;
        let resolver = SimilarityResolver::new(
            ResolverConfig {
                threshold: config.similarity_threshold,
            },
            text,
        );
        Ok(Self {
            store,
            config,
            archive,
            fetcher,
            classifier,
            resolver,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn classifier(&self) -> &PetTypeClassifier {
        &self.classifier
    }

    fn merger(&self) -> UpsertMerger<'_, S> {
        UpsertMerger::new(self.store.as_ref(), &self.classifier, self.config.merge_batch_size)
    }

    pub async fn merge_products(&self, products: &[CanonicalProduct]) -> Result<MergeStats, MergeAborted> {
        self.merger().merge(products).await
    }

    /// Normalize and merge one unit of raw records. Records the normalizer
    /// rejects are counted as skipped.
    pub async fn import_records(
        &self,
        source_tag: &str,
        records: &[JsonValue],
        observed_at: DateTime<Utc>,
    ) -> Result<MergeStats> {
        let batch = normalize_batch(records, source_tag, observed_at)?;
        if batch.skipped > 0 {
            warn!(source = source_tag, skipped = batch.skipped, "raw records rejected by normalizer");
        }
        match self.merger().merge(&batch.products).await {
            Ok(mut stats) => {
                stats.skipped += batch.skipped;
                Ok(stats)
            }
            Err(mut aborted) => {
                aborted.stats.skipped += batch.skipped;
                Err(aborted.into())
            }
        }
    }

    /// Import local payload files for one source, one file per unit. A file
    /// that cannot be read fails only itself.
    pub async fn import_files(&self, source_tag: &str, paths: &[PathBuf]) -> Result<ImportSummary> {
        if normalizer_for_source(source_tag).is_none() {
            anyhow::bail!("no normalizer registered for source `{source_tag}`");
        }
        let mut summary = ImportSummary {
            source: source_tag.to_string(),
            files: paths.len(),
            failed_files: 0,
            records: 0,
            stats: MergeStats::default(),
        };

        for path in paths {
            let span = info_span!("import_unit", source = source_tag, path = %path.display());
            let records = match load_raw_records(path) {
                Ok(records) => records,
                Err(err) => {
                    warn!(parent: &span, error = %format!("{err:#}"), "skipping unreadable payload");
                    summary.failed_files += 1;
                    continue;
                }
            };
            summary.records += records.len();
            let stats = self
                .import_records(source_tag, &records, Utc::now())
                .instrument(span)
                .await
                .map_err(|err| with_partial_stats(err, summary.stats))?;
            summary.stats.absorb(stats);
        }

        info!(source = source_tag, files = summary.files, stats = %summary.stats, "import finished");
        Ok(summary)
    }

    /// Fetch every target of every enabled source, one unit at a time with a
    /// fixed pause between units.
    pub async fn crawl_once(&self) -> Result<CrawlSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = self.config.load_source_registry()?;
        let enabled: Vec<_> = registry.sources.into_iter().filter(|s| s.enabled).collect();

        let mut summary = CrawlSummary {
            run_id,
            started_at,
            finished_at: started_at,
            enabled_sources: enabled.len(),
            units: 0,
            failed_units: 0,
            archived_payloads: 0,
            duplicate_payloads: 0,
            stats: MergeStats::default(),
        };

        for source in &enabled {
            if normalizer_for_source(&source.source).is_none() {
                warn!(source = %source.source, "no normalizer registered; skipping source");
                summary.failed_units += source.targets.len();
                continue;
            }
            for target in &source.targets {
                if summary.units > 0 && !self.config.unit_pause.is_zero() {
                    tokio::time::sleep(self.config.unit_pause).await;
                }
                summary.units += 1;
                let span = info_span!("crawl_unit", %run_id, source = %source.source, category = %target.category);
                match self.crawl_unit(source, target).instrument(span).await {
                    Ok(UnitOutcome::Merged { stats, duplicate }) => {
                        summary.archived_payloads += 1;
                        if duplicate {
                            summary.duplicate_payloads += 1;
                        }
                        summary.stats.absorb(stats);
                    }
                    Ok(UnitOutcome::Failed) => summary.failed_units += 1,
                    Err(aborted) => {
                        summary.stats.absorb(aborted.stats);
                        summary.finished_at = Utc::now();
                        error!(
                            %run_id,
                            units = summary.units,
                            failed_units = summary.failed_units,
                            stats = %summary.stats,
                            "crawl aborted"
                        );
                        return Err(CrawlAborted {
                            summary,
                            source: aborted.source,
                        }
                        .into());
                    }
                }
            }
        }

        summary.finished_at = Utc::now();
        info!(
            %run_id,
            units = summary.units,
            failed_units = summary.failed_units,
            stats = %summary.stats,
            "crawl finished"
        );
        Ok(summary)
    }

    /// `Err` only for failures that end the run.
    async fn crawl_unit(&self, source: &SourceConfig, target: &CrawlTarget) -> Result<UnitOutcome, MergeAborted> {
        let response = match self.fetcher.fetch(&source.source, &target.url).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "fetch failed; moving to next unit");
                return Ok(UnitOutcome::Failed);
            }
        };
        let fetched_at = Utc::now();
        let archived = match self
            .archive
            .store_payload(fetched_at, &source.source, &target.category, &response.body)
            .await
        {
            Ok(archived) => archived,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "archiving payload failed");
                return Ok(UnitOutcome::Failed);
            }
        };
        let records = match parse_raw_records(&response.body) {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %format!("{err:#}"), path = %archived.relative_path.display(), "unparsable payload");
                return Ok(UnitOutcome::Failed);
            }
        };
        match self.import_records(&source.source, &records, fetched_at).await {
            Ok(stats) => Ok(UnitOutcome::Merged {
                stats,
                duplicate: archived.duplicate,
            }),
            Err(err) => match err.downcast::<MergeAborted>() {
                Ok(aborted) => Err(aborted),
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "import failed; moving to next unit");
                    Ok(UnitOutcome::Failed)
                }
            },
        }
    }

    /// Rebuild the whole relationship store from a fresh catalog snapshot.
    pub async fn resolve_once(&self) -> Result<ResolveSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("resolve", %run_id, threshold = self.resolver.threshold());
        async {
            let snapshot = self.store.snapshot().await.map_err(|source| ResolveAborted {
                stats: ResolveStats::default(),
                source,
            })?;
            let (edges, stats) = self.resolver.resolve_with_stats(&snapshot, started_at);
            let edges_written = match self.store.replace_all(&edges).await {
                Ok(written) => written,
                Err(source) => {
                    error!(%stats, error = %source, "replacing similarity edges failed");
                    return Err(anyhow::Error::from(ResolveAborted { stats, source }));
                }
            };

            let manifest = match self.config.reports_dir.clone() {
                Some(dir) => {
                    let export =
                        tokio::task::spawn_blocking(move || export_edges(&dir, run_id, started_at, &snapshot, &edges));
                    match export.await {
                        Ok(Ok(path)) => Some(path.display().to_string()),
                        Ok(Err(err)) => {
                            warn!(error = %format!("{err:#}"), "edge export failed");
                            None
                        }
                        Err(err) => {
                            warn!(error = %err, "edge export task failed");
                            None
                        }
                    }
                }
                None => None,
            };

            info!(
                products = stats.products,
                compared = stats.compared_pairs,
                retained = stats.retained_pairs,
                edges_written,
                "resolve finished"
            );
            Ok::<_, anyhow::Error>(ResolveSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                stats,
                edges_written,
                manifest,
            })
        }
        .instrument(span)
        .await
    }

    /// Recompute pet types with the current keyword table.
    pub async fn reclassify(&self) -> Result<ReclassifySummary> {
        let snapshot = self.store.snapshot().await.context("reading catalog snapshot")?;
        let mut summary = ReclassifySummary {
            products: snapshot.len(),
            changed: 0,
        };
        for product in &snapshot {
            let pet_type = self.classifier.classify(&product.name, product.category.as_deref());
            if pet_type == product.pet_type {
                continue;
            }
            if self
                .store
                .set_pet_type(product.id, pet_type)
                .await
                .with_context(|| format!("updating pet type of {}", product.identity()))?
            {
                info!(product = %product.identity(), from = %product.pet_type, to = %pet_type, "pet type changed");
                summary.changed += 1;
            }
        }
        Ok(summary)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.resolve_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.resolve_once().await {
                    Ok(summary) => info!(edges = summary.edges_written, "scheduled resolve finished"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled resolve failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

enum UnitOutcome {
    Merged { stats: MergeStats, duplicate: bool },
    Failed,
}

/// Fold counts gathered by earlier units into an aborted merge so the caller
/// still sees run totals.
fn with_partial_stats(err: anyhow::Error, earlier: MergeStats) -> anyhow::Error {
    match err.downcast::<MergeAborted>() {
        Ok(mut aborted) => {
            aborted.stats.absorb(earlier);
            aborted.into()
        }
        Err(err) => err,
    }
}
