//! Simulated cloud for local runs: an in-process state map stands in for
//! the external system, and launched tasks converge it immediately so a
//! delta detected on one tick reads as resolved on the next.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::RwLock;

use rudder_actuator::{ResourceHandler, TaskLauncher};
use rudder_core::{DeliveryConfig, HandlerError, Resource, ResourceId, ResourceKind, Task};
use rudder_diff::ResourceDiff;
use rudder_rollout::{CurrentStateLookup, RolloutFeature};

#[derive(Default)]
pub struct SimulatedCloud {
    states: RwLock<FxHashMap<ResourceId, Json>>,
}

impl SimulatedCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &ResourceId) -> Option<Json> {
        self.states.read().await.get(id).cloned()
    }

    pub async fn put(&self, id: ResourceId, state: Json) {
        self.states.write().await.insert(id, state);
    }
}

pub struct InProcessTaskLauncher {
    counter: AtomicU64,
}

impl InProcessTaskLauncher {
    pub fn new() -> Self {
        Self { counter: AtomicU64::new(0) }
    }
}

#[async_trait]
impl TaskLauncher for InProcessTaskLauncher {
    async fn launch(&self, resource: &Resource, name: &str, _payload: Json) -> Result<Task> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Task { id: format!("task-{n}"), name: format!("{name} {}", resource.id()) })
    }
}

/// Handles one resource kind against the simulated cloud. Desired state is
/// the (resolver-adjusted) spec verbatim.
pub struct SimulatedHandler {
    kind: ResourceKind,
    cloud: Arc<SimulatedCloud>,
    launcher: Arc<dyn TaskLauncher>,
}

impl SimulatedHandler {
    pub fn new(kind: ResourceKind, cloud: Arc<SimulatedCloud>, launcher: Arc<dyn TaskLauncher>) -> Self {
        Self { kind, cloud, launcher }
    }
}

#[async_trait]
impl ResourceHandler for SimulatedHandler {
    fn kind(&self) -> ResourceKind {
        self.kind.clone()
    }

    async fn desired(&self, _config: &DeliveryConfig, resource: &Resource) -> Result<Json, HandlerError> {
        Ok(resource.spec.clone())
    }

    async fn current(&self, resource: &Resource) -> Result<Option<Json>, HandlerError> {
        Ok(self.cloud.get(resource.id()).await)
    }

    async fn create(&self, resource: &Resource, diff: &ResourceDiff) -> Result<Vec<Task>, HandlerError> {
        let task = self
            .launcher
            .launch(resource, "create", diff.desired().clone())
            .await?;
        self.cloud.put(resource.id().clone(), diff.desired().clone()).await;
        Ok(vec![task])
    }

    async fn update(&self, resource: &Resource, diff: &ResourceDiff) -> Result<Vec<Task>, HandlerError> {
        let task = self
            .launcher
            .launch(resource, "update", diff.to_delta_json())
            .await?;
        self.cloud.put(resource.id().clone(), diff.desired().clone()).await;
        Ok(vec![task])
    }

    async fn actuation_in_progress(&self, _resource: &Resource) -> Result<bool, HandlerError> {
        // in-process tasks converge immediately
        Ok(false)
    }
}

pub struct CloudStateLookup(pub Arc<SimulatedCloud>);

#[async_trait]
impl CurrentStateLookup for CloudStateLookup {
    async fn current(&self, resource: &Resource) -> Result<Option<Json>> {
        Ok(self.0.get(resource.id()).await)
    }
}

/// Demo rollout feature: a boolean `launchTemplate` flag in the spec.
pub struct LaunchTemplateFeature;

impl RolloutFeature for LaunchTemplateFeature {
    fn name(&self) -> &'static str {
        "launch-template"
    }

    fn declared(&self, resource: &Resource) -> Option<bool> {
        resource.spec.get("launchTemplate").and_then(Json::as_bool)
    }

    fn is_active(&self, state: &Json) -> bool {
        state.get("launchTemplate").and_then(Json::as_bool).unwrap_or(false)
    }

    fn activate(&self, resource: &mut Resource) {
        if resource.spec.is_object() {
            resource.spec["launchTemplate"] = Json::Bool(true);
        }
    }

    fn deactivate(&self, resource: &mut Resource) {
        if resource.spec.is_object() {
            resource.spec["launchTemplate"] = Json::Bool(false);
        }
    }
}
