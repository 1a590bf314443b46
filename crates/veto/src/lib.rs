//! Veto policies. The actuator asks the enforcer before any handler I/O;
//! a single denial skips the whole check for this cycle. Policies are
//! independent of the actuator, so adding one never touches check logic.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::debug;

use rudder_core::Resource;
use rudder_persist::{DiffFingerprintRepository, HealthRepository, PauseRepository, UnhappyVetoRepository};

/// Outcome of a single veto check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VetoResponse {
    pub allowed: bool,
    pub veto_name: &'static str,
    pub message: Option<String>,
}

impl VetoResponse {
    pub fn allowed(veto_name: &'static str) -> Self {
        Self { allowed: true, veto_name, message: None }
    }

    pub fn denied(veto_name: &'static str, message: impl Into<String>) -> Self {
        Self { allowed: false, veto_name, message: Some(message.into()) }
    }
}

#[async_trait]
pub trait Veto: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self, resource: &Resource) -> Result<VetoResponse>;
}

/// Runs vetos in registration order and stops at the first denial.
#[derive(Default)]
pub struct VetoEnforcer {
    vetos: Vec<Arc<dyn Veto>>,
}

impl VetoEnforcer {
    pub fn new(vetos: Vec<Arc<dyn Veto>>) -> Self {
        Self { vetos }
    }

    /// `None` means every veto allowed the check.
    pub async fn can_check(&self, resource: &Resource) -> Result<Option<VetoResponse>> {
        for veto in &self.vetos {
            let response = veto.check(resource).await?;
            if !response.allowed {
                debug!(resource = %resource.id(), veto = response.veto_name, "check vetoed");
                return Ok(Some(response));
            }
        }
        Ok(None)
    }
}

/// Denies checks for resources whose application, or the resource itself,
/// has been paused by an operator.
pub struct PauseVeto {
    pause: Arc<dyn PauseRepository>,
}

impl PauseVeto {
    pub fn new(pause: Arc<dyn PauseRepository>) -> Self {
        Self { pause }
    }
}

#[async_trait]
impl Veto for PauseVeto {
    fn name(&self) -> &'static str {
        "pause"
    }

    async fn check(&self, resource: &Resource) -> Result<VetoResponse> {
        if self.pause.is_paused(resource.application(), resource.id()).await? {
            return Ok(VetoResponse::denied(
                self.name(),
                format!("actuation for {} is paused", resource.id()),
            ));
        }
        Ok(VetoResponse::allowed(self.name()))
    }
}

/// Denies checks for resources the health store has flagged unhealthy.
/// Resources with no health signal yet are allowed through.
pub struct UnhealthyVeto {
    health: Arc<dyn HealthRepository>,
}

impl UnhealthyVeto {
    pub fn new(health: Arc<dyn HealthRepository>) -> Self {
        Self { health }
    }
}

#[async_trait]
impl Veto for UnhealthyVeto {
    fn name(&self) -> &'static str {
        "unhealthy"
    }

    async fn check(&self, resource: &Resource) -> Result<VetoResponse> {
        if self.health.is_healthy(resource.id()).await? == Some(false) {
            return Ok(VetoResponse::denied(
                self.name(),
                format!("{} is reported unhealthy", resource.id()),
            ));
        }
        Ok(VetoResponse::allowed(self.name()))
    }
}

/// Backs off resources the actuator keeps acting on without convergence.
/// Once the same diff has been acted on `max_diff_count` times the resource
/// is parked until a recheck window elapses; the counter resets whenever
/// the diff fingerprint changes.
pub struct UnhappyVeto {
    fingerprints: Arc<dyn DiffFingerprintRepository>,
    unhappy: Arc<dyn UnhappyVetoRepository>,
    max_diff_count: u32,
    waiting_time: Duration,
}

impl UnhappyVeto {
    pub const DEFAULT_MAX_DIFF_COUNT: u32 = 5;

    pub fn new(
        fingerprints: Arc<dyn DiffFingerprintRepository>,
        unhappy: Arc<dyn UnhappyVetoRepository>,
        max_diff_count: u32,
        waiting_time: Duration,
    ) -> Self {
        Self { fingerprints, unhappy, max_diff_count, waiting_time }
    }

    pub fn with_defaults(
        fingerprints: Arc<dyn DiffFingerprintRepository>,
        unhappy: Arc<dyn UnhappyVetoRepository>,
    ) -> Self {
        Self::new(fingerprints, unhappy, Self::DEFAULT_MAX_DIFF_COUNT, Duration::minutes(10))
    }
}

#[async_trait]
impl Veto for UnhappyVeto {
    fn name(&self) -> &'static str {
        "unhappy"
    }

    async fn check(&self, resource: &Resource) -> Result<VetoResponse> {
        let id = resource.id();
        if let Some(recheck_at) = self.unhappy.recheck_time(id).await? {
            if Utc::now() < recheck_at {
                return Ok(VetoResponse::denied(
                    self.name(),
                    format!("{} is not converging; waiting until {}", id, recheck_at),
                ));
            }
            // Window elapsed: clear the mark and allow one recheck. A still
            // diverging resource trips the counter again.
            self.unhappy.clear(id).await?;
            return Ok(VetoResponse::allowed(self.name()));
        }
        if self.fingerprints.action_count(id).await? >= self.max_diff_count {
            let recheck_at = Utc::now() + self.waiting_time;
            self.unhappy.mark_unhappy(id, recheck_at).await?;
            return Ok(VetoResponse::denied(
                self.name(),
                format!("{} acted on the same diff {} times", id, self.max_diff_count),
            ));
        }
        Ok(VetoResponse::allowed(self.name()))
    }
}
