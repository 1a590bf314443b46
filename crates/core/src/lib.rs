//! Rudder core types: resources, delivery configs, events, errors.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod artifact;
pub mod config;
pub mod errors;
pub mod events;
pub mod state;

pub use artifact::{ArtifactType, DeliveryArtifact, VersioningStrategy};
pub use config::{Constraint, DeliveryConfig, Environment, TimeWindow};
pub use errors::{HandlerError, InvalidResource, ParseKindError, ResolveError};
pub use events::{EngineEvent, ResourceEvent, ResourceEventKind, Task};
pub use state::{ConstraintState, ConstraintStateKey, ConstraintStatus, FeatureRollout, ResourceState, RolloutStatus};

pub type Uid = uuid::Uuid;

/// A resource kind, e.g. `ec2/cluster@v1`. Handlers are selected by exact
/// `(group, name)` match; `version` tracks the spec schema revision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    pub group: String,
    pub name: String,
    pub version: u32,
}

impl ResourceKind {
    pub fn new(group: impl Into<String>, name: impl Into<String>, version: u32) -> Self {
        Self { group: group.into(), name: name.into(), version }
    }

    /// The key handlers register under.
    pub fn select_key(&self) -> (&str, &str) {
        (&self.group, &self.name)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@v{}", self.group, self.name, self.version)
    }
}

impl FromStr for ResourceKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (group, rest) = s.split_once('/').ok_or_else(|| ParseKindError(s.to_string()))?;
        let (name, version) = rest.split_once("@v").ok_or_else(|| ParseKindError(s.to_string()))?;
        if group.is_empty() || name.is_empty() {
            return Err(ParseKindError(s.to_string()));
        }
        let version = version.parse::<u32>().map_err(|_| ParseKindError(s.to_string()))?;
        Ok(Self::new(group, name, version))
    }
}

/// Opaque resource identifier, unique within a delivery config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    pub id: ResourceId,
    /// Assigned on first store; declared configs may omit it.
    #[serde(default = "uuid::Uuid::new_v4")]
    pub uid: Uid,
    /// Monotonic counter bumped on every stored revision of the declaration.
    #[serde(default)]
    pub version: u64,
    pub application: String,
    /// Defaults to the delivery config's account when left empty.
    #[serde(default)]
    pub service_account: String,
}

/// A declaratively managed resource. The `spec` payload is polymorphic per
/// kind; only the matching handler interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub kind: ResourceKind,
    pub metadata: ResourceMetadata,
    pub spec: Json,
}

impl Resource {
    /// Fails immediately on blank `id` or `application`.
    pub fn new(kind: ResourceKind, metadata: ResourceMetadata, spec: Json) -> Result<Self, InvalidResource> {
        if metadata.id.as_str().trim().is_empty() {
            return Err(InvalidResource::BlankId);
        }
        if metadata.application.trim().is_empty() {
            return Err(InvalidResource::BlankApplication);
        }
        Ok(Self { kind, metadata, spec })
    }

    pub fn id(&self) -> &ResourceId {
        &self.metadata.id
    }

    pub fn application(&self) -> &str {
        &self.metadata.application
    }
}

// Storage-assigned metadata (uid, version counter) must not affect equality:
// two declarations with identical intent are equal regardless of persistence
// history.
impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.spec == other.spec
    }
}

impl Eq for Resource {}

/// A desired-state resolver consulted before diffing; its decision becomes
/// part of the desired state for the cycle.
#[async_trait::async_trait]
pub trait Resolver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn resolve(&self, config: &DeliveryConfig, resource: Resource) -> anyhow::Result<Resource>;
}
