//! Resource-type handler seam. One handler per kind, selected by exact
//! `(group, name)` match; the `@vN` schema revision does not participate
//! in selection.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;

use rudder_core::{DeliveryConfig, HandlerError, Resource, ResourceKind, Task};
use rudder_diff::ResourceDiff;

/// Plugin contract for a resource kind. `desired` materializes the target
/// configuration from the declared spec; `current` observes the external
/// system (`None` means the resource does not exist yet).
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    fn kind(&self) -> ResourceKind;

    async fn desired(&self, config: &DeliveryConfig, resource: &Resource) -> Result<Json, HandlerError>;

    async fn current(&self, resource: &Resource) -> Result<Option<Json>, HandlerError>;

    async fn create(&self, resource: &Resource, diff: &ResourceDiff) -> Result<Vec<Task>, HandlerError>;

    async fn update(&self, resource: &Resource, diff: &ResourceDiff) -> Result<Vec<Task>, HandlerError>;

    /// Whether a previously launched create/update is still outstanding.
    async fn actuation_in_progress(&self, resource: &Resource) -> Result<bool, HandlerError>;
}

/// Submits a unit of infrastructure work and returns an opaque handle.
/// Handlers use this for their create/update jobs; the engine never treats
/// launches as synchronous operations.
#[async_trait]
pub trait TaskLauncher: Send + Sync {
    async fn launch(&self, resource: &Resource, name: &str, payload: Json) -> Result<Task>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: FxHashMap<(String, String), Arc<dyn ResourceHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last registration wins for a duplicate `(group, name)`.
    pub fn register(&mut self, handler: Arc<dyn ResourceHandler>) {
        let kind = handler.kind();
        self.handlers.insert((kind.group, kind.name), handler);
    }

    pub fn supporting(&self, kind: &ResourceKind) -> Option<Arc<dyn ResourceHandler>> {
        self.handlers.get(&(kind.group.clone(), kind.name.clone())).cloned()
    }
}
