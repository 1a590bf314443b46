//! The append-only event model. History is the only source of truth for
//! "what happened last"; the actuator infers transitions from it rather
//! than from mutable status fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::artifact::ArtifactType;
use crate::{Resource, ResourceId, ResourceKind};

/// Opaque handle to a unit of infrastructure work submitted to the task
/// launcher, usable for later "is this still running" polling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ResourceEventKind {
    Created,
    Missing,
    DeltaDetected { delta: Json },
    DeltaResolved,
    Valid,
    ActuationLaunched { tasks: Vec<Task> },
    ActuationPaused { reason: Option<String> },
    ActuationResumed,
    CheckError { error: String, message: String },
    CheckUnresolvable { message: String },
    CheckSkipped,
    CheckTimedOut,
}

impl ResourceEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Missing => "missing",
            Self::DeltaDetected { .. } => "delta-detected",
            Self::DeltaResolved => "delta-resolved",
            Self::Valid => "valid",
            Self::ActuationLaunched { .. } => "actuation-launched",
            Self::ActuationPaused { .. } => "actuation-paused",
            Self::ActuationResumed => "actuation-resumed",
            Self::CheckError { .. } => "check-error",
            Self::CheckUnresolvable { .. } => "check-unresolvable",
            Self::CheckSkipped => "check-skipped",
            Self::CheckTimedOut => "check-timed-out",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceEvent {
    pub id: ResourceId,
    pub application: String,
    pub kind: ResourceKind,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub data: ResourceEventKind,
}

impl ResourceEvent {
    pub fn new(resource: &Resource, data: ResourceEventKind) -> Self {
        Self {
            id: resource.id().clone(),
            application: resource.application().to_string(),
            kind: resource.kind.clone(),
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Everything published on the engine's event sink. Subscribers are never
/// awaited; publishing is fire-and-forget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum EngineEvent {
    Resource(ResourceEvent),
    ArtifactVersionApproved {
        application: String,
        delivery_config: String,
        environment: String,
        artifact_name: String,
        artifact_type: ArtifactType,
        version: String,
    },
    FeatureRolloutAttempted {
        feature: String,
        resource: ResourceId,
    },
    FeatureRolloutFailed {
        feature: String,
        resource: ResourceId,
    },
}
