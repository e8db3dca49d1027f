use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::address::{AddressRecord, AddressStatus};
use crate::errors::{AppError, ProviderError, TransitionError};
use crate::journal::{EventJournal, JournalEvent};
use crate::normalizer::Normalizer;
use crate::router::{ProviderRouter, ResolutionSource};
use crate::scheduler::BatchOperation;
use crate::store::AddressStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Nothing usable was left after normalization; the record stays pending.
    NormalizationSkipped,
    NotEligible { status: AddressStatus },
    /// Every provider was rate limited; the record stays normalized.
    Deferred { retry_after_ms: Option<u64> },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    Resolution {
        summary: String,
        attempts: Vec<ProviderError>,
    },
    Conflict {
        expected: u64,
        found: u64,
    },
    Transition {
        from: AddressStatus,
        to: AddressStatus,
    },
    Storage {
        message: String,
    },
    /// The worker handling this address panicked.
    Panicked {
        message: String,
    },
}

impl From<TransitionError> for FailureKind {
    fn from(err: TransitionError) -> Self {
        FailureKind::Transition {
            from: err.from,
            to: err.to,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Succeeded,
    Skipped(SkipReason),
    Failed(FailureKind),
}

/// What happened to one address. `record` is the stored version when the
/// last save went through, otherwise the version the pipeline held.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub record: AddressRecord,
    pub disposition: Disposition,
    pub cache_hits: usize,
    pub provider_calls: usize,
}

impl StepReport {
    fn new(record: AddressRecord, disposition: Disposition) -> Self {
        Self {
            record,
            disposition,
            cache_hits: 0,
            provider_calls: 0,
        }
    }

    pub(crate) fn skipped(record: AddressRecord, reason: SkipReason) -> Self {
        Self::new(record, Disposition::Skipped(reason))
    }

    pub(crate) fn failed(record: AddressRecord, failure: FailureKind) -> Self {
        Self::new(record, Disposition::Failed(failure))
    }

    fn with_calls(mut self, cache_hits: usize, provider_calls: usize) -> Self {
        self.cache_hits = cache_hits;
        self.provider_calls = provider_calls;
        self
    }
}

/// Runs the strictly ordered steps for a single address:
/// normalize, resolve (cache then providers), transition, persist.
pub struct AddressPipeline {
    normalizer: Normalizer,
    router: Arc<ProviderRouter>,
    store: Arc<dyn AddressStore>,
    journal: EventJournal,
}

impl AddressPipeline {
    pub fn new(
        normalizer: Normalizer,
        router: Arc<ProviderRouter>,
        store: Arc<dyn AddressStore>,
        journal: EventJournal,
    ) -> Self {
        Self {
            normalizer,
            router,
            store,
            journal,
        }
    }

    pub fn router(&self) -> &Arc<ProviderRouter> {
        &self.router
    }

    pub async fn run(&self, record: AddressRecord, operation: BatchOperation) -> StepReport {
        let status = record.status;
        if !operation.admits(status) {
            return StepReport::skipped(record, SkipReason::NotEligible { status });
        }

        let record = if status == AddressStatus::Pending {
            match self.normalize(record).await {
                Ok(record) => record,
                Err(report) => return report,
            }
        } else {
            record
        };

        if operation == BatchOperation::Normalize {
            return StepReport::new(record, Disposition::Succeeded);
        }
        self.geocode(record).await
    }

    async fn normalize(&self, mut record: AddressRecord) -> Result<AddressRecord, StepReport> {
        let normalized = self.normalizer.normalize(&record.original_text);
        if normalized.is_empty() {
            debug!(id = %record.id, "address is empty after normalization");
            return Err(StepReport::skipped(record, SkipReason::NormalizationSkipped));
        }
        let components = self.normalizer.components(&normalized);
        if let Err(err) = record.mark_normalized(normalized) {
            return Err(StepReport::failed(record, err.into()));
        }
        record.components = components;
        self.persist(record, None).await
    }

    async fn geocode(&self, mut record: AddressRecord) -> StepReport {
        let Some(query) = record
            .normalized_text
            .clone()
            .filter(|text| !text.trim().is_empty())
        else {
            return StepReport::skipped(record, SkipReason::NormalizationSkipped);
        };

        match self.router.resolve(&query).await {
            Ok(resolution) => {
                let cache_hits = usize::from(resolution.source == ResolutionSource::Cache);
                let report = match record.mark_verified(&resolution.result) {
                    Ok(()) => match self.persist(record, None).await {
                        Ok(saved) => StepReport::new(saved, Disposition::Succeeded),
                        Err(report) => report,
                    },
                    Err(err) => StepReport::failed(record, err.into()),
                };
                report.with_calls(cache_hits, resolution.provider_calls)
            }
            Err(err) if err.is_deferrable() => {
                debug!(id = %record.id, "every provider is rate limited; deferring");
                let retry_after_ms = err
                    .retry_after()
                    .map(|wait| u64::try_from(wait.as_millis()).unwrap_or(u64::MAX));
                StepReport::skipped(record, SkipReason::Deferred { retry_after_ms })
                    .with_calls(0, err.provider_calls)
            }
            Err(err) => {
                let summary = err.summary();
                let failure = FailureKind::Resolution {
                    summary: summary.clone(),
                    attempts: err.attempts,
                };
                let report = match record.mark_failed(summary.clone()) {
                    Ok(()) => match self.persist(record, Some(summary)).await {
                        Ok(saved) => StepReport::failed(saved, failure),
                        Err(report) => report,
                    },
                    Err(transition) => StepReport::failed(record, transition.into()),
                };
                report.with_calls(0, err.provider_calls)
            }
        }
    }

    /// Saves on the blocking pool; the SQLite store holds a connection lock.
    async fn persist(
        &self,
        record: AddressRecord,
        detail: Option<String>,
    ) -> Result<AddressRecord, StepReport> {
        let store = self.store.clone();
        let pending = record.clone();
        let saved = match tokio::task::spawn_blocking(move || store.save(&pending)).await {
            Ok(saved) => saved,
            Err(join) => {
                warn!(?join, id = %record.id, "address save task did not complete");
                return Err(StepReport::failed(
                    record,
                    FailureKind::Storage {
                        message: join.to_string(),
                    },
                ));
            }
        };
        match saved {
            Ok(saved) => {
                if let Some(change) = saved.history.last() {
                    self.journal.record(JournalEvent::Transition {
                        address_id: saved.id,
                        from: change.from,
                        to: change.to,
                        reason: change.reason,
                        detail,
                    });
                }
                Ok(saved)
            }
            Err(AppError::Conflict(conflict)) => Err(StepReport::failed(
                record,
                FailureKind::Conflict {
                    expected: conflict.expected,
                    found: conflict.found,
                },
            )),
            Err(err) => {
                warn!(?err, id = %record.id, "failed to persist address");
                Err(StepReport::failed(
                    record,
                    FailureKind::Storage {
                        message: err.to_string(),
                    },
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::QueryCache;
    use crate::errors::ProviderErrorKind;
    use crate::normalizer::RuleSet;
    use crate::providers::{GeocodeProvider, ProviderId};
    use crate::router::tests::{settings, ScriptedProvider};
    use crate::store::MemoryAddressStore;

    fn pipeline(
        provider: Arc<ScriptedProvider>,
        store: Arc<MemoryAddressStore>,
    ) -> AddressPipeline {
        let router = ProviderRouter::new(
            vec![provider as Arc<dyn GeocodeProvider>],
            Arc::new(QueryCache::new(0)),
            settings(),
        );
        AddressPipeline::new(
            Normalizer::new(Arc::new(RuleSet::colombian().unwrap())),
            Arc::new(router),
            store,
            EventJournal::disabled(),
        )
    }

    fn seeded(store: &MemoryAddressStore, text: &str) -> AddressRecord {
        let record = AddressRecord::new(text);
        store.insert(&record).unwrap();
        record
    }

    #[tokio::test(start_paused = true)]
    async fn verifies_a_colombian_address() {
        let store = Arc::new(MemoryAddressStore::new());
        let provider = Arc::new(ScriptedProvider::new("mock", Ok(0.9)));
        let pipeline = pipeline(provider, store.clone());
        let record = seeded(&store, "Cra 7 # 45-10, Bogota");

        let report = pipeline.run(record.clone(), BatchOperation::Full).await;
        assert_eq!(report.disposition, Disposition::Succeeded);
        assert_eq!(report.provider_calls, 1);

        let stored = store.load(record.id).unwrap();
        assert_eq!(stored.status, AddressStatus::Verified);
        assert_eq!(
            stored.normalized_text.as_deref(),
            Some("Carrera 7 # 45-10, Bogota")
        );
        assert_eq!(stored.latitude, Some(4.6));
        assert_eq!(stored.longitude, Some(-74.07));
        assert_eq!(stored.postal_code.as_deref(), Some("110111"));
        assert_eq!(
            stored.components.street_info.as_deref(),
            Some("Carrera 7 # 45-10")
        );
        assert_eq!(stored.components.neighborhood.as_deref(), Some("Bogota"));
        assert_eq!(stored.provider, Some(ProviderId::new("mock")));
        assert_eq!(stored.revision, 2);
        assert!(stored.has_passed_through(AddressStatus::Normalized));
    }

    #[tokio::test]
    async fn blank_input_stays_pending() {
        let store = Arc::new(MemoryAddressStore::new());
        let provider = Arc::new(ScriptedProvider::new("mock", Ok(0.9)));
        let pipeline = pipeline(provider.clone(), store.clone());
        let record = seeded(&store, "   ");

        let report = pipeline.run(record.clone(), BatchOperation::Full).await;
        assert_eq!(
            report.disposition,
            Disposition::Skipped(SkipReason::NormalizationSkipped)
        );
        assert_eq!(store.load(record.id).unwrap().status, AddressStatus::Pending);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_marks_the_record_failed() {
        let store = Arc::new(MemoryAddressStore::new());
        let provider = Arc::new(ScriptedProvider::new(
            "mock",
            Err(ProviderErrorKind::NotFound),
        ));
        let pipeline = pipeline(provider, store.clone());
        let record = seeded(&store, "Calle 1 # 2-3");

        let report = pipeline.run(record.clone(), BatchOperation::Full).await;
        match report.disposition {
            Disposition::Failed(FailureKind::Resolution { summary, attempts }) => {
                assert_eq!(summary, "mock:not_found");
                assert_eq!(attempts.len(), 1);
            }
            other => panic!("unexpected disposition {other:?}"),
        }
        let stored = store.load(record.id).unwrap();
        assert_eq!(stored.status, AddressStatus::Failed);
        assert_eq!(stored.failure.as_deref(), Some("mock:not_found"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_chain_defers_instead_of_failing() {
        let store = Arc::new(MemoryAddressStore::new());
        let provider = Arc::new(ScriptedProvider::new(
            "mock",
            Err(ProviderErrorKind::RateLimited),
        ));
        let pipeline = pipeline(provider, store.clone());
        let record = seeded(&store, "Calle 1 # 2-3");

        let report = pipeline.run(record.clone(), BatchOperation::Full).await;
        assert!(matches!(
            report.disposition,
            Disposition::Skipped(SkipReason::Deferred { .. })
        ));
        assert_eq!(
            store.load(record.id).unwrap().status,
            AddressStatus::Normalized
        );
        assert_eq!(
            pipeline.router().admission_delay(),
            Some(Duration::from_secs(30))
        );
    }

    #[tokio::test]
    async fn operation_rejects_ineligible_status() {
        let store = Arc::new(MemoryAddressStore::new());
        let provider = Arc::new(ScriptedProvider::new("mock", Ok(0.9)));
        let pipeline = pipeline(provider.clone(), store.clone());
        let record = seeded(&store, "Calle 1 # 2-3");

        let report = pipeline.run(record, BatchOperation::Geocode).await;
        assert_eq!(
            report.disposition,
            Disposition::Skipped(SkipReason::NotEligible {
                status: AddressStatus::Pending
            })
        );
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_edit_surfaces_conflict() {
        let store = Arc::new(MemoryAddressStore::new());
        let provider = Arc::new(ScriptedProvider::new("mock", Ok(0.9)));
        let pipeline = pipeline(provider, store.clone());
        let record = seeded(&store, "Calle 1 # 2-3");

        let mut edited = store.load(record.id).unwrap();
        edited.mark_normalized("Calle 1 # 2-3".into()).unwrap();
        store.save(&edited).unwrap();

        let report = pipeline.run(record.clone(), BatchOperation::Normalize).await;
        assert_eq!(
            report.disposition,
            Disposition::Failed(FailureKind::Conflict {
                expected: 0,
                found: 1
            })
        );
        assert_eq!(store.load(record.id).unwrap().revision, 1);
    }
}
