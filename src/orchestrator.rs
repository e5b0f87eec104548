//! Run orchestration: credential check, stage sequencing, output merge,
//! and the final notification.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tracing::{Instrument, error, info, info_span, warn};

use crate::config::{HarvestConfig, PoolSettings};
use crate::dispatch::{
    BreakerBoard, RetryCoordinator, StageAction, StageReport, Task, TaskSink, WorkerPool,
    index_tasks,
};
use crate::error::PipelineError;
use crate::identity::{CredentialChecker, Identity};
use crate::notify::Notifier;
use crate::server::{JobRunner, IdentityStatus};
use crate::session::{DetachedSessions, SessionFactory};
use crate::stages::keywords::unique_titles;
use crate::stages::{
    Catalog, CatalogSearchAction, FieldLookupAction, KeywordEntry, KeywordFilter, LinkDiscovery,
    PageTimings, RecordField, RecordSink, TitleAction, TranslateAction, TurlAction,
};
use crate::store::{
    CsvSnapshotStore, FanoutStore, LibSqlSnapshotStore, OutputStore, PersistentStore,
};
use crate::translate::Translator;

/// How keywords are derived from listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeywordMode {
    /// Read this item-specific field from every listing.
    Field(String),
    /// Extract and translate a keyword from every listing title.
    Ai,
}

/// One submitted harvest job.
#[derive(Debug, Clone)]
pub struct Job {
    pub search_url: String,
    /// Research page used for TURL generation.
    pub base_url: String,
    pub mercari_url: String,
    pub yahoo_url: String,
    pub mode: KeywordMode,
    pub recipient: String,
    pub blacklist: Vec<String>,
}

/// What a finished run produced.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub links: usize,
    pub keywords: usize,
    pub records: usize,
    /// Unresolved task count per stage, for stages that left any.
    pub unresolved: BTreeMap<String, usize>,
    /// Identities whose breaker tripped during the run.
    pub broken: Vec<String>,
    pub output: Option<PathBuf>,
}

/// Runs jobs end to end.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<HarvestConfig>,
    factory: Arc<dyn SessionFactory>,
    notifier: Arc<dyn Notifier>,
    translator: Option<Arc<dyn Translator>>,
    timings: PageTimings,
    page_settle: Duration,
    check_backoff: Duration,
}

impl Orchestrator {
    pub fn new(
        config: Arc<HarvestConfig>,
        factory: Arc<dyn SessionFactory>,
        notifier: Arc<dyn Notifier>,
        translator: Option<Arc<dyn Translator>>,
    ) -> Self {
        Self {
            config,
            factory,
            notifier,
            translator,
            timings: PageTimings::default(),
            page_settle: Duration::from_secs(5),
            check_backoff: Duration::from_secs(2),
        }
    }

    /// Override page waits; `page_settle` is the pause before reading a results page.
    pub fn with_timings(mut self, timings: PageTimings, page_settle: Duration) -> Self {
        self.timings = timings;
        self.page_settle = page_settle;
        self
    }

    pub fn with_check_backoff(mut self, unit: Duration) -> Self {
        self.check_backoff = unit;
        self
    }

    /// Run `job` and notify the recipient of the outcome.
    ///
    /// A run-level failure sends the failure notification instead of the
    /// success one. Notification failures are logged only.
    pub async fn run(&self, job: Job) -> Result<RunSummary, PipelineError> {
        let started = Instant::now();
        let span = info_span!("run", run_id = %uuid::Uuid::new_v4());

        let result = self.execute(&job).instrument(span.clone()).await;

        let (succeeded, attachment) = match &result {
            Ok(summary) => {
                info!(
                    parent: &span,
                    links = summary.links,
                    keywords = summary.keywords,
                    records = summary.records,
                    broken = ?summary.broken,
                    "Run finished"
                );
                (true, summary.output.clone())
            }
            Err(e) => {
                error!(parent: &span, error = %e, "Run failed");
                (false, None)
            }
        };

        if let Err(e) = self
            .notifier
            .notify(&job.recipient, succeeded, attachment.as_deref())
            .instrument(span.clone())
            .await
        {
            error!(parent: &span, recipient = %job.recipient, error = %e, "Failed to notify");
        }

        info!(parent: &span, elapsed = %format_elapsed(started.elapsed()), "Total time");
        result
    }

    /// Identities whose saved cookies still log in.
    pub async fn healthy_identities(&self) -> Result<Vec<Identity>, PipelineError> {
        let identities = self.config.sources.load_identities()?;
        let checker =
            CredentialChecker::new(Arc::clone(&self.factory), self.config.check_url.clone())
                .with_backoff(self.check_backoff);
        Ok(checker.healthy(&identities).await)
    }

    async fn execute(&self, job: &Job) -> Result<RunSummary, PipelineError> {
        if job.mode == KeywordMode::Ai && self.translator.is_none() {
            return Err(PipelineError::TranslatorMissing);
        }

        let healthy = self.healthy_identities().await?;
        if healthy.is_empty() {
            return Err(PipelineError::NoHealthyIdentities);
        }
        info!(healthy = healthy.len(), "Identities ready");
        let catalog_identities = self.catalog_identities(&healthy);

        let breakers = Arc::new(BreakerBoard::new());
        let (store, output) = self.open_store().await;
        let mut summary = RunSummary {
            output: Some(output),
            ..RunSummary::default()
        };

        // Links
        let links = LinkDiscovery::new(Arc::clone(&self.factory), Arc::clone(&breakers))
            .with_timings(self.timings, self.page_settle)
            .with_results_retry(self.config.pool.local_retry)
            .discover(&job.search_url, &healthy)
            .await;
        if !links.is_complete() {
            summary.unresolved.insert("links".into(), links.cursor.page() as usize);
        }
        let links = links.links;
        summary.links = links.len();

        // Keywords
        let filter = KeywordFilter::new(&job.blacklist);
        let entries = match (&job.mode, &self.translator) {
            (KeywordMode::Field(field), _) => {
                let action = FieldLookupAction::new(field).with_timings(self.timings);
                let report = self
                    .stage(
                        action,
                        &self.config.pool,
                        index_tasks(links.clone()),
                        &healthy,
                        &breakers,
                        None,
                    )
                    .await;
                summary.record_unresolved("field-lookup", &report);
                filter.direct_entries(&report.resolved, &links)
            }
            (KeywordMode::Ai, Some(translator)) => {
                let report = self
                    .stage(
                        TitleAction::new(self.timings),
                        &self.config.pool,
                        index_tasks(links.clone()),
                        &healthy,
                        &breakers,
                        None,
                    )
                    .await;
                summary.record_unresolved("title", &report);
                let titles = unique_titles(&report.resolved, &links);
                info!(unique = titles.len(), "Titles to translate");

                let settings = PoolSettings {
                    workers_per_identity: 1,
                    pacing: self.config.translate_pacing,
                    ..self.config.pool.clone()
                };
                let action =
                    TranslateAction::new(Arc::clone(translator), self.config.translate_pacing);
                let pool = WorkerPool::new(
                    Arc::new(action),
                    Arc::new(DetachedSessions),
                    settings.clone(),
                );
                let report = RetryCoordinator::new(pool, Arc::clone(&breakers), settings.max_rounds)
                    .run(
                        index_tasks(titles.iter().map(|(title, _)| title.clone())),
                        &[Identity::new("translator")],
                    )
                    .await;
                summary.record_unresolved("translate", &report);
                filter.translated_entries(&report.resolved, &titles)
            }
            (KeywordMode::Ai, None) => return Err(PipelineError::TranslatorMissing),
        };
        summary.keywords = entries.len();
        info!(keywords = entries.len(), "Keywords ready");

        // TURL
        let turl = TurlAction::new(job.base_url.clone()).with_timings(self.timings);
        let sink: Arc<dyn TaskSink<KeywordEntry, String>> =
            Arc::new(RecordSink::new(Arc::clone(&store), RecordField::Turl));
        let report = self
            .stage(turl, &self.config.pool, index_tasks(entries), &healthy, &breakers, Some(sink))
            .await;
        summary.record_unresolved("turl", &report);

        // Enrichment only sees keywords whose TURL resolved.
        let resolved: Vec<Task<KeywordEntry>> = report
            .resolved
            .keys()
            .filter_map(|index| store.get(*index).map(|record| (*index, record)))
            .map(|(index, record)| {
                Task::new(
                    index,
                    KeywordEntry {
                        keyword: record.keyword,
                        native_keyword: record.native_keyword,
                        listing_link: record.listing_link,
                    },
                )
            })
            .collect();

        if !resolved.is_empty() {
            let (mercari, yahoo) = self
                .enrich_catalogs(job, resolved, &catalog_identities, &breakers, &store)
                .await;
            summary.record_unresolved(Catalog::Mercari.name(), &mercari);
            summary.record_unresolved(Catalog::Yahoo.name(), &yahoo);
        }

        store.flush().await;
        summary.records = store.len();
        summary.broken = breakers.tripped();
        Ok(summary)
    }

    /// Run one stage through the pool and retry rounds.
    async fn stage<A: StageAction>(
        &self,
        action: A,
        settings: &PoolSettings,
        tasks: Vec<Task<A::Payload>>,
        identities: &[Identity],
        breakers: &Arc<BreakerBoard>,
        sink: Option<Arc<dyn TaskSink<A::Payload, A::Output>>>,
    ) -> StageReport<A::Payload, A::Output> {
        if tasks.is_empty() {
            info!(stage = action.name(), "Nothing to do");
            return StageReport {
                resolved: BTreeMap::new(),
                unresolved: Vec::new(),
                rounds: 0,
                broken: Vec::new(),
            };
        }
        let mut pool =
            WorkerPool::new(Arc::new(action), Arc::clone(&self.factory), settings.clone());
        if let Some(sink) = sink {
            pool = pool.with_sink(sink);
        }
        RetryCoordinator::new(pool, Arc::clone(breakers), settings.max_rounds)
            .run(tasks, identities)
            .await
    }

    /// Both catalogs at once. They share `breakers`, so an identity told to
    /// stop by one catalog is dropped by the other as well.
    async fn enrich_catalogs(
        &self,
        job: &Job,
        tasks: Vec<Task<KeywordEntry>>,
        identities: &[Identity],
        breakers: &Arc<BreakerBoard>,
        store: &Arc<OutputStore>,
    ) -> (StageReport<KeywordEntry, String>, StageReport<KeywordEntry, String>) {
        let mercari = self.enrich(
            Catalog::Mercari,
            &job.mercari_url,
            self.config.mercari_workers,
            tasks.clone(),
            identities,
            breakers,
            store,
        );
        let yahoo = self.enrich(
            Catalog::Yahoo,
            &job.yahoo_url,
            self.config.yahoo_workers,
            tasks,
            identities,
            breakers,
            store,
        );
        tokio::join!(mercari, yahoo)
    }

    #[allow(clippy::too_many_arguments)]
    async fn enrich(
        &self,
        catalog: Catalog,
        base_url: &str,
        workers: usize,
        tasks: Vec<Task<KeywordEntry>>,
        identities: &[Identity],
        breakers: &Arc<BreakerBoard>,
        store: &Arc<OutputStore>,
    ) -> StageReport<KeywordEntry, String> {
        let action = CatalogSearchAction::new(catalog, base_url)
            .with_timeouts(self.timings.navigation, self.timings.element);
        let sink: Arc<dyn TaskSink<KeywordEntry, String>> =
            Arc::new(RecordSink::new(Arc::clone(store), catalog.field()));
        self.stage(
            action,
            &self.config.pool.with_workers(workers),
            tasks,
            identities,
            breakers,
            Some(sink),
        )
        .await
    }

    /// One random proxy identity, or the healthy identities without their
    /// cookies when no proxies are configured or the proxy file is unusable.
    fn catalog_identities(&self, healthy: &[Identity]) -> Vec<Identity> {
        let proxies = match self.config.sources.load_proxy_identities() {
            Ok(proxies) => proxies,
            Err(e) => {
                warn!(error = %e, "Ignoring proxy list");
                Vec::new()
            }
        };
        match proxies.choose(&mut rand::thread_rng()).cloned() {
            Some(proxy) => {
                info!(identity = %proxy.id, "Using proxy identity for catalogs");
                vec![proxy]
            }
            None => healthy.iter().map(Identity::without_cookies).collect(),
        }
    }

    /// CSV snapshot in the output directory, mirrored to libSQL when configured.
    async fn open_store(&self) -> (Arc<OutputStore>, PathBuf) {
        let csv = CsvSnapshotStore::timestamped(&self.config.output_dir, chrono::Utc::now());
        let path = csv.path().to_path_buf();
        let mut stores: Vec<Arc<dyn PersistentStore>> = vec![Arc::new(csv)];

        if let Some(db_path) = &self.config.db_path {
            match LibSqlSnapshotStore::new_local(db_path).await {
                Ok(db) => stores.push(Arc::new(db)),
                Err(e) => warn!(
                    path = %db_path.display(),
                    error = %e,
                    "Snapshot database unavailable"
                ),
            }
        }
        info!(path = %path.display(), "Writing output snapshots");
        (Arc::new(OutputStore::new(Arc::new(FanoutStore::new(stores)))), path)
    }
}

impl RunSummary {
    fn record_unresolved<P, O>(&mut self, stage: &str, report: &StageReport<P, O>) {
        if !report.is_complete() {
            self.unresolved.insert(stage.to_string(), report.unresolved.len());
        }
    }
}

/// `m:ss`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}", secs / 60, secs % 60)
}

// ── Server integration ──────────────────────────────────────────────

impl JobRunner for Orchestrator {
    fn submit(&self, job: Job) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            // Outcome is logged and notified inside `run`.
            let _ = orchestrator.run(job).await;
        });
    }
}

#[async_trait]
impl IdentityStatus for Orchestrator {
    async fn active_identities(&self) -> Result<usize, PipelineError> {
        Ok(self.healthy_identities().await?.len())
    }
}
