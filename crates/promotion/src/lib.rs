//! Artifact promotion: constraint evaluators gate which versions are
//! approved into which environments, and the checker scans newest-first
//! looking for the first version every applicable gate lets through.

#![forbid(unsafe_code)]

use anyhow::Result;
use async_trait::async_trait;

use rudder_core::{ConstraintState, ConstraintStateKey, DeliveryArtifact, DeliveryConfig, Environment};
use rudder_persist::ConstraintStateRepository;

pub mod allowed_times;
pub mod checker;
pub mod depends_on;
pub mod manual_judgement;

pub use allowed_times::AllowedTimesEvaluator;
pub use checker::EnvironmentPromotionChecker;
pub use depends_on::DependsOnEvaluator;
pub use manual_judgement::ManualJudgementEvaluator;

/// One gate type. An evaluator only applies to an environment that
/// declares a constraint of its type; otherwise it passes vacuously.
#[async_trait]
pub trait ConstraintEvaluator: Send + Sync {
    fn constraint_type(&self) -> &'static str;

    async fn can_promote(
        &self,
        artifact: &DeliveryArtifact,
        version: &str,
        config: &DeliveryConfig,
        environment: &Environment,
    ) -> Result<bool>;
}

pub(crate) fn state_key(
    constraint_type: &str,
    config: &DeliveryConfig,
    artifact: &DeliveryArtifact,
    version: &str,
    environment: &str,
) -> ConstraintStateKey {
    ConstraintStateKey {
        delivery_config: config.name.clone(),
        environment: environment.to_string(),
        artifact_reference: artifact.reference.clone(),
        version: version.to_string(),
        constraint_type: constraint_type.to_string(),
    }
}

/// Stateful evaluators start every key as PENDING and read-then-update
/// from there.
pub(crate) async fn load_or_create_state(
    repo: &dyn ConstraintStateRepository,
    key: ConstraintStateKey,
) -> Result<ConstraintState> {
    if let Some(state) = repo.get_state(&key).await? {
        return Ok(state);
    }
    let state = ConstraintState::pending(key);
    repo.store_state(state.clone()).await?;
    Ok(state)
}
