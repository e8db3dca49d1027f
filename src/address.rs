use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{AppError, AppResult, TransitionError};
use crate::providers::{GeocodeResult, ProviderId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddressId(Uuid);

impl AddressId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        Uuid::parse_str(value.trim())
            .map(Self)
            .map_err(|err| AppError::Parse(format!("invalid address id {value:?}: {err}")))
    }
}

impl Default for AddressId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AddressId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressStatus {
    Pending,
    Normalized,
    Verified,
    Failed,
}

impl AddressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressStatus::Pending => "pending",
            AddressStatus::Normalized => "normalized",
            AddressStatus::Verified => "verified",
            AddressStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(AddressStatus::Pending),
            "normalized" => Ok(AddressStatus::Normalized),
            "verified" => Ok(AddressStatus::Verified),
            "failed" => Ok(AddressStatus::Failed),
            _ => Err(AppError::Parse(format!("invalid address status: {value}"))),
        }
    }

    fn permits(self, to: AddressStatus, reason: TransitionReason) -> bool {
        use AddressStatus::*;
        matches!(
            (self, to, reason),
            (Pending, Normalized, TransitionReason::Normalized)
                | (Normalized, Verified, TransitionReason::Geocoded)
                | (Pending | Normalized, Failed, TransitionReason::Exhausted)
                | (Verified, Normalized, TransitionReason::ManualCorrection)
                | (Failed, Pending | Normalized, TransitionReason::Reopened)
        )
    }
}

impl fmt::Display for AddressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    Normalized,
    Geocoded,
    Exhausted,
    ManualCorrection,
    Reopened,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: AddressStatus,
    pub to: AddressStatus,
    pub reason: TransitionReason,
    pub at: DateTime<Utc>,
}

/// Operator-supplied fix for a verified address. The suggested fields are
/// overwritten as given, so `None` clears a value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManualCorrection {
    pub normalized_text: Option<String>,
    pub suggested_text: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub postal_code: Option<String>,
}

/// A normalized address split into the street to geocode and the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressComponents {
    pub street_info: Option<String>,
    pub neighborhood: Option<String>,
    pub apartment_info: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub id: AddressId,
    pub original_text: String,
    pub normalized_text: Option<String>,
    #[serde(flatten)]
    pub components: AddressComponents,
    pub suggested_text: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub postal_code: Option<String>,
    pub provider: Option<ProviderId>,
    pub confidence: Option<f64>,
    pub status: AddressStatus,
    pub failure: Option<String>,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<StatusChange>,
}

impl AddressRecord {
    pub fn new(original_text: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: AddressId::new(),
            original_text: original_text.into(),
            normalized_text: None,
            components: AddressComponents::default(),
            suggested_text: None,
            latitude: None,
            longitude: None,
            postal_code: None,
            provider: None,
            confidence: None,
            status: AddressStatus::Pending,
            failure: None,
            revision: 0,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    pub fn mark_normalized(&mut self, normalized: String) -> Result<(), TransitionError> {
        self.transition(AddressStatus::Normalized, TransitionReason::Normalized)?;
        self.normalized_text = Some(normalized);
        self.failure = None;
        Ok(())
    }

    pub fn mark_verified(&mut self, result: &GeocodeResult) -> Result<(), TransitionError> {
        self.transition(AddressStatus::Verified, TransitionReason::Geocoded)?;
        self.suggested_text = Some(result.suggested_text.clone());
        self.latitude = Some(result.latitude);
        self.longitude = Some(result.longitude);
        self.postal_code = result.postal_code.clone();
        self.provider = Some(result.provider.clone());
        self.confidence = Some(result.confidence);
        self.failure = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(AddressStatus::Failed, TransitionReason::Exhausted)?;
        self.failure = Some(reason.into());
        Ok(())
    }

    /// Moves a verified record back to `normalized` without geocoding again.
    pub fn apply_correction(&mut self, correction: ManualCorrection) -> Result<(), TransitionError> {
        self.transition(AddressStatus::Normalized, TransitionReason::ManualCorrection)?;
        if let Some(normalized) = correction.normalized_text {
            self.normalized_text = Some(normalized);
        }
        self.suggested_text = correction.suggested_text;
        self.latitude = correction.latitude;
        self.longitude = correction.longitude;
        self.postal_code = correction.postal_code;
        self.provider = None;
        self.confidence = None;
        Ok(())
    }

    /// Returns a failed record to the last step it completed.
    pub fn reopen(&mut self) -> Result<(), TransitionError> {
        let target = if self.normalized_text.is_some() {
            AddressStatus::Normalized
        } else {
            AddressStatus::Pending
        };
        self.transition(target, TransitionReason::Reopened)
    }

    pub fn has_passed_through(&self, status: AddressStatus) -> bool {
        self.history.iter().any(|change| change.to == status)
    }

    fn transition(
        &mut self,
        to: AddressStatus,
        reason: TransitionReason,
    ) -> Result<(), TransitionError> {
        let from = self.status;
        if !from.permits(to, reason) {
            return Err(TransitionError { from, to });
        }
        let at = Utc::now();
        self.history.push(StatusChange {
            from,
            to,
            reason,
            at,
        });
        self.status = to;
        self.updated_at = at;
        Ok(())
    }
}
