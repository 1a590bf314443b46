//! Repository contracts the engine depends on, plus reference
//! implementations: in-memory stores for tests and single-process runs,
//! and a SQLite-backed event log.
//!
//! All writes are atomic per key; no cross-resource transaction spans a
//! check cycle. Idempotent upserts make a retried tick re-derive the same
//! answer instead of corrupting state.

#![forbid(unsafe_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use rudder_core::{
    ConstraintState, ConstraintStateKey, DeliveryArtifact, DeliveryConfig, FeatureRollout,
    ResourceEvent, ResourceId, RolloutStatus,
};

pub mod mem;
pub mod sqlite;

pub use mem::{
    InMemoryArtifactRepository, InMemoryConstraintStateRepository, InMemoryDiffFingerprintRepository,
    InMemoryEventLog, InMemoryFeatureRolloutRepository, InMemoryHealthRepository,
    InMemoryPauseRepository, InMemoryUnhappyVetoRepository,
};
pub use sqlite::SqliteEventLog;

/// Append-only resource history with an efficient most-recent-event query.
/// This log is the only source of truth for "what happened last".
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: ResourceEvent) -> Result<()>;

    async fn last_event(&self, id: &ResourceId) -> Result<Option<ResourceEvent>>;

    /// Most recent events first.
    async fn history(&self, id: &ResourceId, limit: usize) -> Result<Vec<ResourceEvent>>;
}

#[async_trait]
pub trait ArtifactRepository: Send + Sync {
    /// Returns `false` if the version was already known.
    async fn register_version(&self, artifact: &DeliveryArtifact, version: &str) -> Result<bool>;

    /// All known versions, newest first per the artifact's strategy.
    async fn versions(&self, artifact: &DeliveryArtifact) -> Result<Vec<String>>;

    /// Records approval of `version` for the environment. Idempotent:
    /// returns `true` only if the stored approval actually changed.
    async fn approve_version_for(
        &self,
        config: &DeliveryConfig,
        artifact: &DeliveryArtifact,
        version: &str,
        environment: &str,
    ) -> Result<bool>;

    async fn latest_approved_in(
        &self,
        config: &DeliveryConfig,
        artifact: &DeliveryArtifact,
        environment: &str,
    ) -> Result<Option<String>>;

    async fn mark_deployed_to(
        &self,
        config: &DeliveryConfig,
        artifact: &DeliveryArtifact,
        version: &str,
        environment: &str,
    ) -> Result<()>;

    async fn was_successfully_deployed_to(
        &self,
        config: &DeliveryConfig,
        artifact: &DeliveryArtifact,
        version: &str,
        environment: &str,
    ) -> Result<bool>;
}

#[async_trait]
pub trait ConstraintStateRepository: Send + Sync {
    async fn get_state(&self, key: &ConstraintStateKey) -> Result<Option<ConstraintState>>;

    /// Single-key upsert; never recreates an existing key's record from
    /// scratch, only replaces its value.
    async fn store_state(&self, state: ConstraintState) -> Result<()>;
}

#[async_trait]
pub trait FeatureRolloutRepository: Send + Sync {
    async fn rollout(&self, feature: &str, id: &ResourceId) -> Result<Option<FeatureRollout>>;

    /// Creates the record on first attempt; increments the attempt counter.
    async fn mark_started(&self, feature: &str, id: &ResourceId) -> Result<()>;

    async fn mark_status(&self, feature: &str, id: &ResourceId, status: RolloutStatus) -> Result<()>;
}

/// Counters for "how many times have we acted on this same diff", feeding
/// the unhappy veto.
#[async_trait]
pub trait DiffFingerprintRepository: Send + Sync {
    /// Bumps the counter if `fingerprint` matches the stored one, otherwise
    /// resets to a count of one for the new fingerprint.
    async fn record_action(&self, id: &ResourceId, fingerprint: u64) -> Result<()>;

    async fn action_count(&self, id: &ResourceId) -> Result<u32>;

    async fn clear(&self, id: &ResourceId) -> Result<()>;
}

#[async_trait]
pub trait UnhappyVetoRepository: Send + Sync {
    async fn mark_unhappy(&self, id: &ResourceId, recheck_at: DateTime<Utc>) -> Result<()>;

    /// `None` means the resource is not currently marked unhappy.
    async fn recheck_time(&self, id: &ResourceId) -> Result<Option<DateTime<Utc>>>;

    async fn clear(&self, id: &ResourceId) -> Result<()>;
}

#[async_trait]
pub trait PauseRepository: Send + Sync {
    async fn pause_application(&self, application: &str) -> Result<()>;
    async fn resume_application(&self, application: &str) -> Result<()>;
    async fn pause_resource(&self, id: &ResourceId) -> Result<()>;
    async fn resume_resource(&self, id: &ResourceId) -> Result<()>;
    async fn is_paused(&self, application: &str, id: &ResourceId) -> Result<bool>;
}

#[async_trait]
pub trait HealthRepository: Send + Sync {
    async fn set_healthy(&self, id: &ResourceId, healthy: bool) -> Result<()>;

    /// `None` means no health signal has been reported yet.
    async fn is_healthy(&self, id: &ResourceId) -> Result<Option<bool>>;
}
