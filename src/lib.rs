pub mod address;
pub mod cache;
pub mod config;
pub mod db;
pub mod errors;
pub mod export;
pub mod health;
pub mod ingestion;
pub mod journal;
pub mod normalizer;
pub mod pipeline;
pub mod providers;
pub mod router;
pub mod scheduler;
pub mod store;

use std::path::Path;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::address::{
    AddressComponents, AddressId, AddressRecord, AddressStatus, ManualCorrection,
};
pub use crate::config::AppConfig;
pub use crate::errors::{AppError, AppResult};
pub use crate::scheduler::{
    BatchOperation, BatchProgress, BatchReport, CancellationSignal, ProgressObserver,
};

use crate::cache::{Fingerprint, QueryCache};
use crate::db::SqliteAddressStore;
use crate::errors::PersistenceConflict;
use crate::health::HealthSnapshot;
use crate::ingestion::ImportSummary;
use crate::journal::{EventJournal, JournalEvent};
use crate::normalizer::{Normalizer, RuleSet};
use crate::pipeline::{AddressPipeline, StepReport};
use crate::providers::{build_providers, GeocodeProvider};
use crate::router::{ProviderRouter, RouterSettings};
use crate::scheduler::BatchScheduler;
use crate::store::AddressStore;

/// Entry point for every operation: owns the shared rule set, cache and
/// provider health for the lifetime of the process.
pub struct Orchestrator {
    config: AppConfig,
    normalizer: Normalizer,
    router: Arc<ProviderRouter>,
    store: Arc<dyn AddressStore>,
    journal: EventJournal,
    pipeline: Arc<AddressPipeline>,
    scheduler: BatchScheduler,
}

impl Orchestrator {
    /// Opens the SQLite store and journal under the configured data
    /// directory and builds the provider chain.
    pub fn open(config: AppConfig) -> AppResult<Self> {
        init_tracing();
        let store = SqliteAddressStore::open(&config.data_dir, &config.database_file_name)?;
        let journal = EventJournal::new(&config.data_dir, &config)?;
        let providers = build_providers(&config)?;
        Self::with_parts(config, Arc::new(store), providers, journal)
    }

    pub fn with_parts(
        config: AppConfig,
        store: Arc<dyn AddressStore>,
        providers: Vec<Arc<dyn GeocodeProvider>>,
        journal: EventJournal,
    ) -> AppResult<Self> {
        let rules = match &config.normalizer_rules_path {
            Some(path) => RuleSet::load(path)?,
            None => RuleSet::colombian()?,
        };
        let normalizer = Normalizer::new(Arc::new(rules));
        let cache = Arc::new(QueryCache::new(config.cache_capacity));
        let router = Arc::new(ProviderRouter::new(
            providers,
            cache,
            RouterSettings::from_config(&config),
        ));
        let pipeline = Arc::new(AddressPipeline::new(
            normalizer.clone(),
            router.clone(),
            store.clone(),
            journal.clone(),
        ));
        let scheduler = BatchScheduler::new(pipeline.clone(), config.worker_concurrency);

        info!(
            providers = ?router.providers(),
            workers = scheduler.workers(),
            threshold = config.confidence_threshold,
            "orchestrator ready"
        );
        Ok(Self {
            config,
            normalizer,
            router,
            store,
            journal,
            pipeline,
            scheduler,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn AddressStore> {
        &self.store
    }

    pub fn normalize_text(&self, raw: &str) -> String {
        self.normalizer.normalize(raw)
    }

    pub fn load(&self, id: AddressId) -> AppResult<AddressRecord> {
        self.store.load(id)
    }

    pub async fn process_address(
        &self,
        id: AddressId,
        operation: BatchOperation,
    ) -> AppResult<StepReport> {
        let record = self.store.load(id)?;
        let report = self.pipeline.run(record, operation).await;
        self.flush_journal();
        Ok(report)
    }

    pub async fn run_batch(
        &self,
        records: Vec<AddressRecord>,
        operation: BatchOperation,
        observer: Option<ProgressObserver>,
        cancel: Option<CancellationSignal>,
    ) -> BatchReport {
        let report = self
            .scheduler
            .run(records, operation, observer, cancel)
            .await;
        self.journal.record(JournalEvent::BatchFinished {
            operation,
            succeeded: report.succeeded.len(),
            failed: report.failed.len(),
            skipped: report.skipped.len(),
            cancelled: report.cancelled,
            cache_hits: report.cache_hits,
            provider_calls: report.provider_calls,
        });
        self.flush_journal();
        report
    }

    /// Runs `operation` over every stored record it is eligible for.
    pub async fn run_pending(
        &self,
        operation: BatchOperation,
        observer: Option<ProgressObserver>,
        cancel: Option<CancellationSignal>,
    ) -> AppResult<BatchReport> {
        let mut records = Vec::new();
        for status in operation.eligible_statuses() {
            records.extend(self.store.list(Some(*status))?);
        }
        Ok(self.run_batch(records, operation, observer, cancel).await)
    }

    /// Reopens every failed record and runs the full pipeline over it again.
    /// Cached outcomes for those addresses are dropped first so providers
    /// are asked again.
    pub async fn retry_failed(
        &self,
        observer: Option<ProgressObserver>,
        cancel: Option<CancellationSignal>,
    ) -> AppResult<BatchReport> {
        let mut reopened = Vec::new();
        for mut record in self.store.list(Some(AddressStatus::Failed))? {
            record.reopen()?;
            match self.store.save(&record) {
                Ok(saved) => {
                    if let Some(normalized) = &saved.normalized_text {
                        self.router.cache().invalidate(&Fingerprint::of(normalized));
                    }
                    self.journal_transition(&saved, None);
                    reopened.push(saved);
                }
                Err(AppError::Conflict(conflict)) => {
                    warn!(id = %conflict.id, "skipping failed address edited concurrently");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(self
            .run_batch(reopened, BatchOperation::Full, observer, cancel)
            .await)
    }

    /// Applies an operator correction to a verified address. The caller must
    /// pass the revision it last saw; anything newer is rejected.
    pub fn apply_correction(
        &self,
        id: AddressId,
        expected_revision: u64,
        correction: ManualCorrection,
    ) -> AppResult<AddressRecord> {
        let mut record = self.store.load(id)?;
        if record.revision != expected_revision {
            return Err(PersistenceConflict {
                id,
                expected: expected_revision,
                found: record.revision,
            }
            .into());
        }

        let previous = record.normalized_text.clone();
        record.apply_correction(correction)?;
        if let Some(normalized) = &record.normalized_text {
            record.components = self.normalizer.components(normalized);
        }
        let saved = self.store.save(&record)?;

        for text in previous.iter().chain(saved.normalized_text.iter()) {
            self.router.cache().invalidate(&Fingerprint::of(text));
        }
        self.journal_transition(&saved, Some("manual correction".into()));
        self.flush_journal();
        Ok(saved)
    }

    pub fn import_csv(&self, path: &Path) -> AppResult<ImportSummary> {
        let bytes = std::fs::read(path)?;
        let upload = ingestion::parse_csv(&bytes)?;
        let summary =
            ingestion::persist_rows(self.store.as_ref(), &path.display().to_string(), upload)?;
        self.journal.record(JournalEvent::Imported {
            source: summary.source.clone(),
            rows: summary.rows_found,
            created: summary.created.len(),
            duplicates: summary.duplicates_skipped,
            rejected: summary.rejected.len(),
        });
        self.flush_journal();
        Ok(summary)
    }

    pub fn export_csv(&self, path: &Path, status: Option<AddressStatus>) -> AppResult<usize> {
        let records = self.store.list(status)?;
        let written = export::export_to_path(path, &records)?;
        info!(path = %path.display(), rows = written, "exported addresses");
        Ok(written)
    }

    pub fn provider_health(&self) -> Vec<HealthSnapshot> {
        self.router.health()
    }

    fn journal_transition(&self, record: &AddressRecord, detail: Option<String>) {
        if let Some(change) = record.history.last() {
            self.journal.record(JournalEvent::Transition {
                address_id: record.id,
                from: change.from,
                to: change.to,
                reason: change.reason,
                detail,
            });
        }
    }

    fn flush_journal(&self) {
        if let Err(err) = self.journal.flush() {
            warn!(?err, "failed to flush event journal");
        }
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,geofull=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init();
    });
}
