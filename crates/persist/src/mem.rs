//! In-memory repositories. Used by unit tests and by single-process runs
//! where durability is not needed.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::RwLock;

use rudder_core::{
    ConstraintState, ConstraintStateKey, DeliveryArtifact, DeliveryConfig, FeatureRollout,
    ResourceEvent, ResourceId, RolloutStatus,
};

use crate::{
    ArtifactRepository, ConstraintStateRepository, DiffFingerprintRepository, EventLog,
    FeatureRolloutRepository, HealthRepository, PauseRepository, UnhappyVetoRepository,
};

#[derive(Default)]
pub struct InMemoryEventLog {
    // newest last; queries walk from the back
    events: RwLock<FxHashMap<ResourceId, Vec<ResourceEvent>>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, event: ResourceEvent) -> Result<()> {
        let mut events = self.events.write().await;
        events.entry(event.id.clone()).or_default().push(event);
        Ok(())
    }

    async fn last_event(&self, id: &ResourceId) -> Result<Option<ResourceEvent>> {
        let events = self.events.read().await;
        Ok(events.get(id).and_then(|v| v.last().cloned()))
    }

    async fn history(&self, id: &ResourceId, limit: usize) -> Result<Vec<ResourceEvent>> {
        let events = self.events.read().await;
        Ok(events
            .get(id)
            .map(|v| v.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

fn artifact_key(artifact: &DeliveryArtifact) -> String {
    format!("{:?}:{}", artifact.artifact_type, artifact.name)
}

fn approval_key(config: &DeliveryConfig, reference: &str, environment: &str) -> String {
    format!("{}/{}/{}", config.name, environment, reference)
}

#[derive(Default)]
pub struct InMemoryArtifactRepository {
    versions: RwLock<FxHashMap<String, FxHashSet<String>>>,
    // approval order preserved; the back of the vec is the latest approval
    approvals: RwLock<FxHashMap<String, Vec<String>>>,
    deployed: RwLock<FxHashSet<String>>,
}

impl InMemoryArtifactRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactRepository for InMemoryArtifactRepository {
    async fn register_version(&self, artifact: &DeliveryArtifact, version: &str) -> Result<bool> {
        let mut versions = self.versions.write().await;
        Ok(versions
            .entry(artifact_key(artifact))
            .or_default()
            .insert(version.to_string()))
    }

    async fn versions(&self, artifact: &DeliveryArtifact) -> Result<Vec<String>> {
        let versions = self.versions.read().await;
        let mut out: Vec<String> = versions
            .get(&artifact_key(artifact))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        artifact.versioning.sort_newest_first(&mut out);
        Ok(out)
    }

    async fn approve_version_for(
        &self,
        config: &DeliveryConfig,
        artifact: &DeliveryArtifact,
        version: &str,
        environment: &str,
    ) -> Result<bool> {
        let mut approvals = self.approvals.write().await;
        let list = approvals
            .entry(approval_key(config, &artifact.reference, environment))
            .or_default();
        if list.iter().any(|v| v == version) {
            return Ok(false);
        }
        list.push(version.to_string());
        Ok(true)
    }

    async fn latest_approved_in(
        &self,
        config: &DeliveryConfig,
        artifact: &DeliveryArtifact,
        environment: &str,
    ) -> Result<Option<String>> {
        let approvals = self.approvals.read().await;
        Ok(approvals
            .get(&approval_key(config, &artifact.reference, environment))
            .and_then(|list| list.last().cloned()))
    }

    async fn mark_deployed_to(
        &self,
        config: &DeliveryConfig,
        artifact: &DeliveryArtifact,
        version: &str,
        environment: &str,
    ) -> Result<()> {
        let key = format!(
            "{}/{}",
            approval_key(config, &artifact.reference, environment),
            version
        );
        self.deployed.write().await.insert(key);
        Ok(())
    }

    async fn was_successfully_deployed_to(
        &self,
        config: &DeliveryConfig,
        artifact: &DeliveryArtifact,
        version: &str,
        environment: &str,
    ) -> Result<bool> {
        let key = format!(
            "{}/{}",
            approval_key(config, &artifact.reference, environment),
            version
        );
        Ok(self.deployed.read().await.contains(&key))
    }
}

#[derive(Default)]
pub struct InMemoryConstraintStateRepository {
    states: RwLock<FxHashMap<ConstraintStateKey, ConstraintState>>,
}

impl InMemoryConstraintStateRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConstraintStateRepository for InMemoryConstraintStateRepository {
    async fn get_state(&self, key: &ConstraintStateKey) -> Result<Option<ConstraintState>> {
        Ok(self.states.read().await.get(key).cloned())
    }

    async fn store_state(&self, state: ConstraintState) -> Result<()> {
        self.states.write().await.insert(state.key.clone(), state);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryFeatureRolloutRepository {
    rollouts: RwLock<FxHashMap<(String, ResourceId), FeatureRollout>>,
}

impl InMemoryFeatureRolloutRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FeatureRolloutRepository for InMemoryFeatureRolloutRepository {
    async fn rollout(&self, feature: &str, id: &ResourceId) -> Result<Option<FeatureRollout>> {
        let rollouts = self.rollouts.read().await;
        Ok(rollouts.get(&(feature.to_string(), id.clone())).cloned())
    }

    async fn mark_started(&self, feature: &str, id: &ResourceId) -> Result<()> {
        let mut rollouts = self.rollouts.write().await;
        let entry = rollouts
            .entry((feature.to_string(), id.clone()))
            .or_insert_with(|| FeatureRollout::new(feature, id.clone()));
        entry.status = RolloutStatus::InProgress;
        entry.attempts += 1;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_status(&self, feature: &str, id: &ResourceId, status: RolloutStatus) -> Result<()> {
        let mut rollouts = self.rollouts.write().await;
        let entry = rollouts
            .entry((feature.to_string(), id.clone()))
            .or_insert_with(|| FeatureRollout::new(feature, id.clone()));
        entry.status = status;
        entry.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryDiffFingerprintRepository {
    actions: RwLock<FxHashMap<ResourceId, (u64, u32)>>,
}

impl InMemoryDiffFingerprintRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DiffFingerprintRepository for InMemoryDiffFingerprintRepository {
    async fn record_action(&self, id: &ResourceId, fingerprint: u64) -> Result<()> {
        let mut actions = self.actions.write().await;
        match actions.get_mut(id) {
            Some((fp, count)) if *fp == fingerprint => *count += 1,
            _ => {
                actions.insert(id.clone(), (fingerprint, 1));
            }
        }
        Ok(())
    }

    async fn action_count(&self, id: &ResourceId) -> Result<u32> {
        Ok(self.actions.read().await.get(id).map(|(_, c)| *c).unwrap_or(0))
    }

    async fn clear(&self, id: &ResourceId) -> Result<()> {
        self.actions.write().await.remove(id);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryUnhappyVetoRepository {
    rechecks: RwLock<FxHashMap<ResourceId, DateTime<Utc>>>,
}

impl InMemoryUnhappyVetoRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UnhappyVetoRepository for InMemoryUnhappyVetoRepository {
    async fn mark_unhappy(&self, id: &ResourceId, recheck_at: DateTime<Utc>) -> Result<()> {
        self.rechecks.write().await.insert(id.clone(), recheck_at);
        Ok(())
    }

    async fn recheck_time(&self, id: &ResourceId) -> Result<Option<DateTime<Utc>>> {
        Ok(self.rechecks.read().await.get(id).copied())
    }

    async fn clear(&self, id: &ResourceId) -> Result<()> {
        self.rechecks.write().await.remove(id);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryPauseRepository {
    applications: RwLock<FxHashSet<String>>,
    resources: RwLock<FxHashSet<ResourceId>>,
}

impl InMemoryPauseRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PauseRepository for InMemoryPauseRepository {
    async fn pause_application(&self, application: &str) -> Result<()> {
        self.applications.write().await.insert(application.to_string());
        Ok(())
    }

    async fn resume_application(&self, application: &str) -> Result<()> {
        self.applications.write().await.remove(application);
        Ok(())
    }

    async fn pause_resource(&self, id: &ResourceId) -> Result<()> {
        self.resources.write().await.insert(id.clone());
        Ok(())
    }

    async fn resume_resource(&self, id: &ResourceId) -> Result<()> {
        self.resources.write().await.remove(id);
        Ok(())
    }

    async fn is_paused(&self, application: &str, id: &ResourceId) -> Result<bool> {
        if self.applications.read().await.contains(application) {
            return Ok(true);
        }
        Ok(self.resources.read().await.contains(id))
    }
}

#[derive(Default)]
pub struct InMemoryHealthRepository {
    health: RwLock<FxHashMap<ResourceId, bool>>,
}

impl InMemoryHealthRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HealthRepository for InMemoryHealthRepository {
    async fn set_healthy(&self, id: &ResourceId, healthy: bool) -> Result<()> {
        self.health.write().await.insert(id.clone(), healthy);
        Ok(())
    }

    async fn is_healthy(&self, id: &ResourceId) -> Result<Option<bool>> {
        Ok(self.health.read().await.get(id).copied())
    }
}
