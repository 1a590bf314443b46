//! Rollout-aware desired-state resolution. A latent feature flag is
//! activated environment by environment: only once every upstream
//! environment is stable and has the feature active does the resolver
//! switch it on here. The decision precedence is fixed; see
//! `RolloutAwareResolver::resolve`.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::try_join_all;
use rustc_hash::FxHashSet;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use rudder_actuator::EventRecorder;
use rudder_core::{
    Constraint, DeliveryConfig, EngineEvent, Environment, Resolver, Resource, ResourceState,
    RolloutStatus,
};
use rudder_persist::{EventLog, FeatureRolloutRepository};

/// One latent feature gate. Implementations know where the flag lives in
/// the spec and how to read it off live state.
pub trait RolloutFeature: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Some` when the spec explicitly pins the feature; the resolver then
    /// respects the declaration verbatim.
    fn declared(&self, resource: &Resource) -> Option<bool>;

    /// Whether live current state already has the feature active.
    fn is_active(&self, state: &Json) -> bool;

    fn activate(&self, resource: &mut Resource);

    fn deactivate(&self, resource: &mut Resource);

    /// When true, a suspected failed rollout is terminal: the feature is
    /// never retried for that resource. Default is to retry.
    fn stop_on_failure(&self) -> bool {
        false
    }
}

/// Observes live state for a resource, independent of the actuator's own
/// check cycle. `None` means the resource does not exist yet.
#[async_trait]
pub trait CurrentStateLookup: Send + Sync {
    async fn current(&self, resource: &Resource) -> Result<Option<Json>>;
}

/// Walks the depends-on chain to find the environments upstream of a
/// resource and judge their stability from resource history.
pub struct DependentEnvironmentFinder {
    log: Arc<dyn EventLog>,
}

impl DependentEnvironmentFinder {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self { log }
    }

    /// Transitive upstream environments, nearest first.
    pub fn upstream_environments<'a>(
        &self,
        config: &'a DeliveryConfig,
        resource: &Resource,
    ) -> Vec<&'a Environment> {
        let mut out = Vec::new();
        let mut seen: FxHashSet<&str> = FxHashSet::default();
        let Some(home) = config.environment_for(resource.id()) else {
            return out;
        };
        let mut cursor = Some(home);
        while let Some(env) = cursor.take() {
            if let Some(Constraint::DependsOn { environment }) = env.constraint("depends-on") {
                if seen.insert(environment.as_str()) {
                    if let Some(upstream) = config.environment_named(environment) {
                        out.push(upstream);
                        cursor = Some(upstream);
                    }
                }
            }
        }
        out
    }

    /// Stable means every resource in every upstream environment has `Ok`
    /// as its latest-event-derived state. History lookups are fanned out
    /// and joined before judging.
    pub async fn environments_stable(&self, config: &DeliveryConfig, resource: &Resource) -> Result<bool> {
        let lookups = self
            .upstream_environments(config, resource)
            .into_iter()
            .flat_map(|e| e.resources.iter())
            .map(|r| self.log.last_event(r.id()));
        let events = try_join_all(lookups).await?;
        Ok(events
            .iter()
            .all(|e| ResourceState::from_last_event(e.as_ref()) == ResourceState::Ok))
    }

    /// Upstream resources of the same kind as `resource`, the ones whose
    /// feature state gates this rollout.
    pub fn same_kind_upstream<'a>(
        &self,
        config: &'a DeliveryConfig,
        resource: &Resource,
    ) -> Vec<&'a Resource> {
        self.upstream_environments(config, resource)
            .into_iter()
            .flat_map(|e| e.resources.iter())
            .filter(|r| r.kind.select_key() == resource.kind.select_key())
            .collect()
    }
}

pub struct RolloutAwareResolver<F: RolloutFeature> {
    feature: F,
    rollouts: Arc<dyn FeatureRolloutRepository>,
    finder: DependentEnvironmentFinder,
    lookup: Arc<dyn CurrentStateLookup>,
    recorder: EventRecorder,
}

impl<F: RolloutFeature> RolloutAwareResolver<F> {
    pub fn new(
        feature: F,
        rollouts: Arc<dyn FeatureRolloutRepository>,
        finder: DependentEnvironmentFinder,
        lookup: Arc<dyn CurrentStateLookup>,
        recorder: EventRecorder,
    ) -> Self {
        Self { feature, rollouts, finder, lookup, recorder }
    }

    async fn attempt(&self, mut resource: Resource) -> Result<Resource> {
        self.feature.activate(&mut resource);
        self.rollouts.mark_started(self.feature.name(), resource.id()).await?;
        info!(resource = %resource.id(), feature = self.feature.name(), "attempting rollout");
        self.recorder.publish(EngineEvent::FeatureRolloutAttempted {
            feature: self.feature.name().to_string(),
            resource: resource.id().clone(),
        });
        Ok(resource)
    }

    async fn hold(&self, mut resource: Resource) -> Result<Resource> {
        self.feature.deactivate(&mut resource);
        self.rollouts
            .mark_status(self.feature.name(), resource.id(), RolloutStatus::NotStarted)
            .await?;
        Ok(resource)
    }

    /// All upstream same-kind resources already run with the feature.
    /// Vacuously true when there are none.
    async fn upstream_feature_active(&self, config: &DeliveryConfig, resource: &Resource) -> Result<bool> {
        let peers = self.finder.same_kind_upstream(config, resource);
        let states = try_join_all(peers.iter().map(|r| self.lookup.current(r))).await?;
        Ok(states
            .iter()
            .all(|s| s.as_ref().is_some_and(|state| self.feature.is_active(state))))
    }
}

#[async_trait]
impl<F: RolloutFeature> Resolver for RolloutAwareResolver<F> {
    fn name(&self) -> &'static str {
        self.feature.name()
    }

    async fn resolve(&self, config: &DeliveryConfig, mut resource: Resource) -> Result<Resource> {
        let feature = self.feature.name();

        // An explicit declaration in the spec wins outright.
        if self.feature.declared(&resource).is_some() {
            self.rollouts
                .mark_status(feature, resource.id(), RolloutStatus::Skipped)
                .await?;
            return Ok(resource);
        }

        let record = self.rollouts.rollout(feature, resource.id()).await?;
        match record.as_ref().map(|r| r.status) {
            // Trust the record over live state to avoid a flapping
            // decision; pure confirmation, no writes, no events.
            Some(RolloutStatus::Successful) => {
                self.feature.activate(&mut resource);
                return Ok(resource);
            }
            Some(RolloutStatus::Failed) => {
                self.feature.deactivate(&mut resource);
                return Ok(resource);
            }
            _ => {}
        }

        match self.lookup.current(&resource).await? {
            Some(state) if self.feature.is_active(&state) => {
                // Already live with the feature: confirmation, not a new
                // rollout.
                self.feature.activate(&mut resource);
                self.rollouts
                    .mark_status(feature, resource.id(), RolloutStatus::Successful)
                    .await?;
                return Ok(resource);
            }
            None => {
                // Brand-new resource carries no migration risk.
                debug!(resource = %resource.id(), feature, "new resource; activating from the start");
                return self.attempt(resource).await;
            }
            Some(_) => {}
        }

        if !self.finder.environments_stable(config, &resource).await? {
            debug!(resource = %resource.id(), feature, "upstream environments not stable; holding");
            return self.hold(resource).await;
        }
        if !self.upstream_feature_active(config, &resource).await? {
            debug!(resource = %resource.id(), feature, "upstream resources not rolled out yet; holding");
            return self.hold(resource).await;
        }

        // Everything upstream looks fine, yet an earlier attempt did not
        // stick: suspected failed rollout.
        if record.as_ref().is_some_and(|r| r.attempts > 0) {
            warn!(resource = %resource.id(), feature, "previous rollout attempt did not take effect");
            self.recorder.publish(EngineEvent::FeatureRolloutFailed {
                feature: feature.to_string(),
                resource: resource.id().clone(),
            });
            if self.feature.stop_on_failure() {
                self.feature.deactivate(&mut resource);
                self.rollouts
                    .mark_status(feature, resource.id(), RolloutStatus::Failed)
                    .await?;
                return Ok(resource);
            }
        }

        self.attempt(resource).await
    }
}
