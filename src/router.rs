use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::cache::{CachedOutcome, Fingerprint, QueryCache};
use crate::config::AppConfig;
use crate::errors::{ProviderError, ProviderErrorKind, ResolutionError};
use crate::health::{HealthSnapshot, ProviderHealth};
use crate::providers::{GeocodeProvider, GeocodeResult, ProviderId};

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub confidence_threshold: f64,
    pub cache_ttl: Duration,
    pub failure_cache_ttl: Duration,
    pub retry_backoff: Duration,
    pub provider_timeout: Duration,
    pub rate_limit_cooldown: Duration,
    pub rate_limits: HashMap<ProviderId, u32>,
}

impl RouterSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            cache_ttl: config.cache_ttl(),
            failure_cache_ttl: config.failure_cache_ttl(),
            retry_backoff: config.retry_backoff(),
            provider_timeout: config.provider_timeout(),
            rate_limit_cooldown: config.rate_limit_cooldown(),
            rate_limits: config.provider_rate_limits.clone(),
        }
    }

    fn rate_limit(&self, id: &ProviderId) -> u32 {
        self.rate_limits.get(id).copied().unwrap_or(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Cache,
    Provider,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub result: GeocodeResult,
    pub fingerprint: Fingerprint,
    pub source: ResolutionSource,
    pub provider_calls: usize,
}

struct Route {
    provider: Arc<dyn GeocodeProvider>,
    health: ProviderHealth,
}

/// Walks the provider chain in priority order for one normalized address.
/// Owns every provider's health state.
pub struct ProviderRouter {
    routes: HashMap<ProviderId, Route>,
    order: Vec<ProviderId>,
    cache: Arc<QueryCache>,
    settings: RouterSettings,
}

impl ProviderRouter {
    pub fn new(
        providers: Vec<Arc<dyn GeocodeProvider>>,
        cache: Arc<QueryCache>,
        settings: RouterSettings,
    ) -> Self {
        let mut routes = HashMap::new();
        let mut order = Vec::new();
        for provider in providers {
            let id = provider.id().clone();
            if routes.contains_key(&id) {
                warn!(provider = %id, "duplicate provider in chain; keeping the first");
                continue;
            }
            let health = ProviderHealth::new(
                id.clone(),
                settings.rate_limit(&id),
                settings.rate_limit_cooldown,
            );
            order.push(id.clone());
            routes.insert(id, Route { provider, health });
        }
        Self {
            routes,
            order,
            cache,
            settings,
        }
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn providers(&self) -> &[ProviderId] {
        &self.order
    }

    pub async fn resolve(&self, normalized: &str) -> Result<Resolution, ResolutionError> {
        let fingerprint = Fingerprint::of(normalized);

        for id in &self.order {
            if let Some(CachedOutcome::Found(result)) = self.cache.get(&fingerprint, id) {
                if self.accepts(&result) {
                    debug!(%fingerprint, provider = %id, "resolved from cache");
                    return Ok(Resolution {
                        result,
                        fingerprint,
                        source: ResolutionSource::Cache,
                        provider_calls: 0,
                    });
                }
            }
        }

        let mut attempts = Vec::new();
        let mut provider_calls = 0;
        for id in &self.order {
            let Some(route) = self.routes.get(id) else {
                continue;
            };
            match self
                .attempt(route, &fingerprint, normalized, &mut provider_calls)
                .await
            {
                Ok((result, source)) => {
                    return Ok(Resolution {
                        result,
                        fingerprint,
                        source,
                        provider_calls,
                    })
                }
                Err(err) => {
                    debug!(provider = %id, kind = %err.kind, "provider attempt failed");
                    attempts.push(err);
                }
            }
        }

        let error = ResolutionError {
            attempts,
            provider_calls,
        };
        warn!(
            %fingerprint,
            attempts = %error.summary(),
            deferrable = error.is_deferrable(),
            "geocoding providers exhausted"
        );
        Err(error)
    }

    async fn attempt(
        &self,
        route: &Route,
        fingerprint: &Fingerprint,
        query: &str,
        provider_calls: &mut usize,
    ) -> Result<(GeocodeResult, ResolutionSource), ProviderError> {
        let id = route.provider.id();
        let _inflight = self.cache.lock_key(fingerprint, id).await;

        // Another worker may have resolved this key while we waited.
        if let Some(outcome) = self.cache.get(fingerprint, id) {
            return match outcome {
                CachedOutcome::Found(result) => self
                    .accept(result)
                    .map(|result| (result, ResolutionSource::Cache)),
                CachedOutcome::Failed { kind, message } => {
                    Err(ProviderError::new(id.clone(), kind, message))
                }
            };
        }

        let mut retried = false;
        loop {
            backing_off(route)?;
            route.health.acquire_slot().await;
            // An earlier call may have been rate limited while this one waited.
            backing_off(route)?;
            let observed_at = Instant::now();
            *provider_calls += 1;
            debug!(provider = %id, retried, "querying geocoding provider");

            let outcome = match timeout(self.settings.provider_timeout, route.provider.geocode(query))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(ProviderError::new(
                    id.clone(),
                    ProviderErrorKind::Timeout,
                    format!(
                        "no response within {} ms",
                        self.settings.provider_timeout.as_millis()
                    ),
                )),
            };

            match outcome {
                Ok(result) => {
                    route.health.record_success();
                    self.cache.put(
                        fingerprint,
                        id,
                        CachedOutcome::Found(result.clone()),
                        observed_at,
                        self.settings.cache_ttl,
                    );
                    return self
                        .accept(result)
                        .map(|result| (result, ResolutionSource::Provider));
                }
                Err(err) if err.kind.is_retryable() && !retried => {
                    route.health.record_transient_failure();
                    warn!(
                        ?err,
                        provider = %id,
                        "provider call failed; retrying after {:?}",
                        self.settings.retry_backoff
                    );
                    retried = true;
                    sleep(self.settings.retry_backoff).await;
                }
                Err(mut err) => {
                    self.record_failure(route, fingerprint, &mut err, observed_at);
                    return Err(err);
                }
            }
        }
    }

    fn record_failure(
        &self,
        route: &Route,
        fingerprint: &Fingerprint,
        err: &mut ProviderError,
        observed_at: Instant,
    ) {
        let ttl = match err.kind {
            ProviderErrorKind::RateLimited => {
                err.retry_after = Some(route.health.record_rate_limited(err.retry_after));
                return;
            }
            kind if kind.is_definitive() => {
                route.health.record_definitive_failure();
                self.settings.cache_ttl
            }
            _ => {
                route.health.record_transient_failure();
                self.settings.failure_cache_ttl
            }
        };
        self.cache.put(
            fingerprint,
            route.provider.id(),
            CachedOutcome::Failed {
                kind: err.kind,
                message: err.message.clone(),
            },
            observed_at,
            ttl,
        );
    }

    fn accepts(&self, result: &GeocodeResult) -> bool {
        result.confidence >= self.settings.confidence_threshold
    }

    fn accept(&self, result: GeocodeResult) -> Result<GeocodeResult, ProviderError> {
        if self.accepts(&result) {
            return Ok(result);
        }
        Err(ProviderError::new(
            result.provider.clone(),
            ProviderErrorKind::NotFound,
            format!(
                "confidence {:.2} below threshold {:.2}",
                result.confidence, self.settings.confidence_threshold
            ),
        ))
    }

    /// When every provider is backing off, how long until the first one
    /// becomes available again.
    pub fn admission_delay(&self) -> Option<Duration> {
        self.order
            .iter()
            .filter_map(|id| self.routes.get(id))
            .map(|route| route.health.backoff_remaining())
            .collect::<Option<Vec<_>>>()
            .and_then(|remaining| remaining.into_iter().min())
    }

    pub fn health(&self) -> Vec<HealthSnapshot> {
        self.order
            .iter()
            .filter_map(|id| self.routes.get(id))
            .map(|route| route.health.snapshot())
            .collect()
    }
}

fn backing_off(route: &Route) -> Result<(), ProviderError> {
    match route.health.backoff_remaining() {
        Some(remaining) => Err(ProviderError::rate_limited(
            route.provider.id().clone(),
            format!("backing off for another {} ms", remaining.as_millis()),
            Some(remaining),
        )),
        None => Ok(()),
    }
}
