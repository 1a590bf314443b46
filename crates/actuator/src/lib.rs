//! The per-resource check cycle. States are never stored; they are
//! inferred from the latest history event plus a fresh resolve/diff, so
//! the log can never drift from a parallel status field.

#![forbid(unsafe_code)]

use std::sync::Arc;

use metrics::{counter, histogram};
use serde_json::Value as Json;
use tracing::{debug, warn};

use rudder_core::{
    DeliveryConfig, HandlerError, Resolver, ResolveError, Resource, ResourceEvent,
    ResourceEventKind, ResourceId,
};
use rudder_diff::ResourceDiff;
use rudder_persist::{DiffFingerprintRepository, EventLog};
use rudder_veto::VetoEnforcer;

pub mod handler;
pub mod recorder;

pub use handler::{HandlerRegistry, ResourceHandler, TaskLauncher};
pub use recorder::EventRecorder;

/// Why a single check cycle stopped early. Never escapes `check_resource`;
/// every variant becomes a history event.
enum CheckFailure {
    Resolve(ResolveError),
    Other(anyhow::Error),
}

pub struct ResourceActuator {
    handlers: HandlerRegistry,
    resolvers: Vec<Arc<dyn Resolver>>,
    enforcer: VetoEnforcer,
    recorder: EventRecorder,
    log: Arc<dyn EventLog>,
    fingerprints: Arc<dyn DiffFingerprintRepository>,
}

impl ResourceActuator {
    pub fn new(
        handlers: HandlerRegistry,
        resolvers: Vec<Arc<dyn Resolver>>,
        enforcer: VetoEnforcer,
        recorder: EventRecorder,
        log: Arc<dyn EventLog>,
        fingerprints: Arc<dyn DiffFingerprintRepository>,
    ) -> Self {
        Self { handlers, resolvers, enforcer, recorder, log, fingerprints }
    }

    pub fn recorder(&self) -> &EventRecorder {
        &self.recorder
    }

    /// Runs one check cycle. Never fails: every outcome, error included,
    /// lands in the resource's history so operators can reconstruct why a
    /// resource is not converging from the log alone.
    pub async fn check_resource(&self, config: &DeliveryConfig, resource: &Resource) {
        let started = std::time::Instant::now();
        counter!("actuator_checks_total", 1u64);
        match self.run_check(config, resource).await {
            Ok(()) => {}
            Err(CheckFailure::Resolve(ResolveError::CurrentlyUnresolvable { message, .. })) => {
                debug!(resource = %resource.id(), %message, "currently unresolvable; will retry");
                self.record(resource, ResourceEventKind::CheckUnresolvable { message }).await;
            }
            Err(CheckFailure::Resolve(e)) => {
                warn!(resource = %resource.id(), error = %e, "resolution failed");
                counter!("actuator_check_errors_total", 1u64);
                self.record(
                    resource,
                    ResourceEventKind::CheckError {
                        error: e.kind_name().to_string(),
                        message: format!("{e:#}"),
                    },
                )
                .await;
            }
            Err(CheckFailure::Other(e)) => {
                warn!(resource = %resource.id(), error = %e, "check failed");
                counter!("actuator_check_errors_total", 1u64);
                self.record(
                    resource,
                    ResourceEventKind::CheckError {
                        error: "check-failed".to_string(),
                        message: format!("{e:#}"),
                    },
                )
                .await;
            }
        }
        histogram!("actuator_check_ms", started.elapsed().as_secs_f64() * 1000.0);
    }

    /// Recorded by the scheduler when the whole check exceeded its budget.
    pub async fn record_timeout(&self, resource: &Resource) {
        counter!("actuator_check_timeouts_total", 1u64);
        self.record(resource, ResourceEventKind::CheckTimedOut).await;
    }

    async fn run_check(&self, config: &DeliveryConfig, resource: &Resource) -> Result<(), CheckFailure> {
        // Veto runs before any handler I/O so a denied check costs nothing
        // against the external system.
        if let Some(denial) = self
            .enforcer
            .can_check(resource)
            .await
            .map_err(CheckFailure::Other)?
        {
            counter!("actuator_checks_vetoed_total", 1u64);
            self.record(resource, ResourceEventKind::CheckSkipped).await;
            self.record(resource, ResourceEventKind::ActuationPaused { reason: denial.message }).await;
            return Ok(());
        }

        let handler = self
            .handlers
            .supporting(&resource.kind)
            .ok_or_else(|| CheckFailure::Other(anyhow::anyhow!("no handler for kind {}", resource.kind)))?;

        // Never launch overlapping actuations for the same resource.
        if handler
            .actuation_in_progress(resource)
            .await
            .map_err(|e| self.actuate_failure(resource.id(), e))?
        {
            debug!(resource = %resource.id(), "actuation still in progress");
            self.record(resource, ResourceEventKind::CheckSkipped).await;
            return Ok(());
        }

        let last = self
            .log
            .last_event(resource.id())
            .await
            .map_err(CheckFailure::Other)?;
        if matches!(last.as_ref().map(|e| &e.data), Some(ResourceEventKind::ActuationPaused { .. })) {
            self.record(resource, ResourceEventKind::ActuationResumed).await;
        }

        // Both branches always run to completion; the caller needs the
        // specific failing side reported, so no fail-fast.
        let (desired, current) = tokio::join!(
            self.resolve_desired(config, resource, handler.as_ref()),
            self.resolve_current(resource, handler.as_ref()),
        );
        let desired = desired.map_err(CheckFailure::Resolve)?;
        let current = current.map_err(CheckFailure::Resolve)?;

        let diff = ResourceDiff::new(desired, current);
        match diff.current() {
            None => {
                debug!(resource = %resource.id(), "missing; creating");
                self.record(resource, ResourceEventKind::Missing).await;
                let tasks = handler
                    .create(resource, &diff)
                    .await
                    .map_err(|e| self.actuate_failure(resource.id(), e))?;
                self.record_action(resource, &diff).await?;
                counter!("actuator_actuations_total", 1u64);
                self.record(resource, ResourceEventKind::ActuationLaunched { tasks }).await;
            }
            Some(_) if diff.has_changes() => {
                debug!(resource = %resource.id(), "delta detected; updating");
                self.record(resource, ResourceEventKind::DeltaDetected { delta: diff.to_delta_json() }).await;
                let tasks = handler
                    .update(resource, &diff)
                    .await
                    .map_err(|e| self.actuate_failure(resource.id(), e))?;
                self.record_action(resource, &diff).await?;
                counter!("actuator_actuations_total", 1u64);
                self.record(resource, ResourceEventKind::ActuationLaunched { tasks }).await;
            }
            Some(_) => {
                self.fingerprints
                    .clear(resource.id())
                    .await
                    .map_err(CheckFailure::Other)?;
                let recovering = matches!(
                    last.as_ref().map(|e| &e.data),
                    Some(ResourceEventKind::DeltaDetected { .. } | ResourceEventKind::ActuationLaunched { .. })
                );
                if recovering {
                    self.record(resource, ResourceEventKind::DeltaResolved).await;
                } else {
                    self.record(resource, ResourceEventKind::Valid).await;
                }
            }
        }
        Ok(())
    }

    /// Desired state: the declared spec run through every registered
    /// resolver in order, then materialized by the handler.
    async fn resolve_desired(
        &self,
        config: &DeliveryConfig,
        resource: &Resource,
        handler: &dyn ResourceHandler,
    ) -> Result<Json, ResolveError> {
        let id = resource.id().clone();
        let mut resolved = resource.clone();
        for resolver in &self.resolvers {
            resolved = resolver
                .resolve(config, resolved)
                .await
                .map_err(|e| classify_desired(&id, e))?;
        }
        handler.desired(config, &resolved).await.map_err(|e| match e {
            HandlerError::CurrentlyUnresolvable(message) => {
                ResolveError::CurrentlyUnresolvable { id: id.clone(), message }
            }
            HandlerError::Other(cause) => ResolveError::CannotResolveDesiredState { id: id.clone(), cause },
        })
    }

    async fn resolve_current(
        &self,
        resource: &Resource,
        handler: &dyn ResourceHandler,
    ) -> Result<Option<Json>, ResolveError> {
        let id = resource.id();
        handler.current(resource).await.map_err(|e| match e {
            HandlerError::CurrentlyUnresolvable(message) => {
                ResolveError::CurrentlyUnresolvable { id: id.clone(), message }
            }
            HandlerError::Other(cause) => ResolveError::CannotResolveCurrentState { id: id.clone(), cause },
        })
    }

    /// Feeds the unhappy veto: same fingerprint increments, a different
    /// diff resets the counter.
    async fn record_action(&self, resource: &Resource, diff: &ResourceDiff) -> Result<(), CheckFailure> {
        self.fingerprints
            .record_action(resource.id(), diff.fingerprint())
            .await
            .map_err(CheckFailure::Other)
    }

    fn actuate_failure(&self, id: &ResourceId, e: HandlerError) -> CheckFailure {
        match e {
            HandlerError::CurrentlyUnresolvable(message) => {
                CheckFailure::Resolve(ResolveError::CurrentlyUnresolvable { id: id.clone(), message })
            }
            HandlerError::Other(cause) => CheckFailure::Other(cause),
        }
    }

    async fn record(&self, resource: &Resource, data: ResourceEventKind) {
        self.recorder.record(ResourceEvent::new(resource, data)).await;
    }
}

fn classify_desired(id: &ResourceId, e: anyhow::Error) -> ResolveError {
    match e.downcast::<HandlerError>() {
        Ok(HandlerError::CurrentlyUnresolvable(message)) => {
            ResolveError::CurrentlyUnresolvable { id: id.clone(), message }
        }
        Ok(HandlerError::Other(cause)) => ResolveError::CannotResolveDesiredState { id: id.clone(), cause },
        Err(cause) => ResolveError::CannotResolveDesiredState { id: id.clone(), cause },
    }
}
