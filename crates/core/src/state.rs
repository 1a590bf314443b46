//! Persisted judgement and rollout state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::{ResourceEvent, ResourceEventKind};
use crate::ResourceId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstraintStatus {
    Pending,
    Pass,
    Fail,
    OverridePass,
    OverrideFail,
    NotEvaluated,
}

impl ConstraintStatus {
    pub fn passes(self) -> bool {
        matches!(self, Self::Pass | Self::OverridePass)
    }

    pub fn failed(self) -> bool {
        matches!(self, Self::Fail | Self::OverrideFail)
    }

    /// Overrides are terminal: evaluators never re-derive a different
    /// status for an overridden key.
    pub fn overridden(self) -> bool {
        matches!(self, Self::OverridePass | Self::OverrideFail)
    }
}

/// Composite key for a persisted constraint judgement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConstraintStateKey {
    pub delivery_config: String,
    pub environment: String,
    pub artifact_reference: String,
    pub version: String,
    pub constraint_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConstraintState {
    pub key: ConstraintStateKey,
    pub status: ConstraintStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judged_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judged_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ConstraintState {
    pub fn pending(key: ConstraintStateKey) -> Self {
        Self {
            key,
            status: ConstraintStatus::Pending,
            created_at: Utc::now(),
            judged_by: None,
            judged_at: None,
            comment: None,
        }
    }

    pub fn judged(mut self, status: ConstraintStatus, by: &str, comment: Option<String>) -> Self {
        self.status = status;
        self.judged_by = Some(by.to_string());
        self.judged_at = Some(Utc::now());
        self.comment = comment;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RolloutStatus {
    NotStarted,
    InProgress,
    Successful,
    Failed,
    Skipped,
}

/// Rollout record per `(feature, resource)`. A resource that reaches
/// `Successful` is never silently reverted by the resolver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureRollout {
    pub feature: String,
    pub resource: ResourceId,
    pub status: RolloutStatus,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl FeatureRollout {
    pub fn new(feature: &str, resource: ResourceId) -> Self {
        Self {
            feature: feature.to_string(),
            resource,
            status: RolloutStatus::NotStarted,
            attempts: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Coarse per-resource status derived from the most recent history event,
/// used to judge upstream-environment stability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResourceState {
    Ok,
    Diff,
    Missing,
    Error,
    Paused,
    Unknown,
}

impl ResourceState {
    pub fn from_last_event(event: Option<&ResourceEvent>) -> Self {
        use ResourceEventKind as E;
        match event.map(|e| &e.data) {
            Some(E::Created | E::Valid | E::DeltaResolved) => Self::Ok,
            Some(E::DeltaDetected { .. } | E::ActuationLaunched { .. }) => Self::Diff,
            Some(E::Missing) => Self::Missing,
            Some(E::CheckError { .. } | E::CheckUnresolvable { .. } | E::CheckTimedOut) => Self::Error,
            Some(E::ActuationPaused { .. } | E::CheckSkipped) => Self::Paused,
            Some(E::ActuationResumed) | None => Self::Unknown,
        }
    }
}
