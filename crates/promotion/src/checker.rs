//! Newest-first, first-match promotion. Evaluation always restarts from
//! the newest version; a version failing any single applicable constraint
//! is skipped entirely.

use std::sync::Arc;

use anyhow::Result;
use metrics::counter;
use tracing::{debug, info, warn};

use rudder_actuator::EventRecorder;
use rudder_core::{DeliveryArtifact, DeliveryConfig, EngineEvent, Environment};
use rudder_persist::ArtifactRepository;

use crate::ConstraintEvaluator;

pub struct EnvironmentPromotionChecker {
    artifacts: Arc<dyn ArtifactRepository>,
    evaluators: Vec<Arc<dyn ConstraintEvaluator>>,
    recorder: EventRecorder,
}

impl EnvironmentPromotionChecker {
    pub fn new(
        artifacts: Arc<dyn ArtifactRepository>,
        evaluators: Vec<Arc<dyn ConstraintEvaluator>>,
        recorder: EventRecorder,
    ) -> Self {
        Self { artifacts, evaluators, recorder }
    }

    /// Runs once per delivery config per tick, before per-resource
    /// actuation. Artifact checks are isolated: one artifact failing never
    /// aborts its siblings.
    pub async fn check_environments(&self, config: &DeliveryConfig) {
        for artifact in &config.artifacts {
            if let Err(e) = self.check_artifact(config, artifact).await {
                counter!("promotion_check_errors_total", 1u64);
                warn!(artifact = %artifact.reference, error = %e, "promotion check failed");
            }
        }
    }

    async fn check_artifact(&self, config: &DeliveryConfig, artifact: &DeliveryArtifact) -> Result<()> {
        let versions = self.artifacts.versions(artifact).await?;
        if versions.is_empty() {
            warn!(artifact = %artifact.reference, "no versions known; nothing to promote");
            return Ok(());
        }
        for environment in &config.environments {
            match self.select_version(config, artifact, environment, &versions).await {
                Some(version) => {
                    let is_new = self
                        .artifacts
                        .approve_version_for(config, artifact, &version, &environment.name)
                        .await?;
                    // Re-approving the same version every tick is the
                    // steady state; only a changed approval is news.
                    if is_new {
                        counter!("promotion_approvals_total", 1u64);
                        info!(
                            artifact = %artifact.reference,
                            %version,
                            environment = %environment.name,
                            "approved version"
                        );
                        self.recorder.publish(EngineEvent::ArtifactVersionApproved {
                            application: config.application.clone(),
                            delivery_config: config.name.clone(),
                            environment: environment.name.clone(),
                            artifact_name: artifact.name.clone(),
                            artifact_type: artifact.artifact_type,
                            version,
                        });
                    }
                }
                None => {
                    // Expected while constraints are pending, not an error.
                    warn!(
                        artifact = %artifact.reference,
                        environment = %environment.name,
                        "no version currently satisfies all constraints"
                    );
                }
            }
        }
        Ok(())
    }

    /// First version, newest first, for which every applicable evaluator
    /// says yes. An evaluator whose type the environment does not declare
    /// passes vacuously.
    async fn select_version(
        &self,
        config: &DeliveryConfig,
        artifact: &DeliveryArtifact,
        environment: &Environment,
        versions: &[String],
    ) -> Option<String> {
        'versions: for version in versions {
            for evaluator in &self.evaluators {
                if !environment.declares_constraint(evaluator.constraint_type()) {
                    continue;
                }
                match evaluator.can_promote(artifact, version, config, environment).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(
                            %version,
                            constraint = evaluator.constraint_type(),
                            environment = %environment.name,
                            "version blocked by constraint"
                        );
                        continue 'versions;
                    }
                    Err(e) => {
                        // Evaluation errors make the version not promotable
                        // this tick; the next tick re-evaluates.
                        warn!(
                            %version,
                            constraint = evaluator.constraint_type(),
                            error = %e,
                            "constraint evaluation failed"
                        );
                        continue 'versions;
                    }
                }
            }
            return Some(version.clone());
        }
        None
    }
}
