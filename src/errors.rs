use std::fmt;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::{AddressId, AddressStatus};
use crate::providers::ProviderId;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to resolve required path: {0}")]
    Path(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Regex(#[from] regex::Error),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    Parse(String),
    #[error("address {0} not found")]
    NotFound(AddressId),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Conflict(#[from] PersistenceConflict),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Timeout,
    RateLimited,
    NotFound,
    Malformed,
    Unavailable,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::RateLimited => "rate_limited",
            ProviderErrorKind::NotFound => "not_found",
            ProviderErrorKind::Malformed => "malformed",
            ProviderErrorKind::Unavailable => "unavailable",
        }
    }

    /// Worth one more attempt against the same provider.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderErrorKind::Timeout | ProviderErrorKind::Unavailable
        )
    }

    /// The provider answered and the answer will not change on a repeat query.
    pub fn is_definitive(&self) -> bool {
        matches!(
            self,
            ProviderErrorKind::NotFound | ProviderErrorKind::Malformed
        )
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{provider} {kind}: {message}")]
pub struct ProviderError {
    pub provider: ProviderId,
    pub kind: ProviderErrorKind,
    pub message: String,
    #[serde(skip)]
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn new(provider: ProviderId, kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            provider,
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(
        provider: ProviderId,
        message: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        Self {
            retry_after,
            ..Self::new(provider, ProviderErrorKind::RateLimited, message)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("all geocoding providers exhausted after {} attempt(s)", .attempts.len())]
pub struct ResolutionError {
    pub attempts: Vec<ProviderError>,
    #[serde(default)]
    pub provider_calls: usize,
}

impl ResolutionError {
    /// Every provider in the chain was only rate limited, so nothing was
    /// actually learned about the address.
    pub fn is_deferrable(&self) -> bool {
        !self.attempts.is_empty()
            && self
                .attempts
                .iter()
                .all(|attempt| attempt.kind == ProviderErrorKind::RateLimited)
    }

    /// Shortest wait any rate-limited provider asked for.
    pub fn retry_after(&self) -> Option<Duration> {
        self.attempts
            .iter()
            .filter_map(|attempt| attempt.retry_after)
            .min()
    }

    pub fn summary(&self) -> String {
        self.attempts
            .iter()
            .map(|attempt| format!("{}:{}", attempt.provider, attempt.kind))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("address {id} was modified concurrently (expected revision {expected}, found {found})")]
pub struct PersistenceConflict {
    pub id: AddressId,
    pub expected: u64,
    pub found: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[error("invalid status transition {from} -> {to}")]
pub struct TransitionError {
    pub from: AddressStatus,
    pub to: AddressStatus,
}
