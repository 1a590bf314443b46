//! Stateless gate: a version may only enter this environment after it has
//! been successfully deployed to the upstream environment it depends on.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;

use rudder_core::{Constraint, DeliveryArtifact, DeliveryConfig, Environment};
use rudder_persist::ArtifactRepository;

use crate::ConstraintEvaluator;

pub const CONSTRAINT_TYPE: &str = "depends-on";

pub struct DependsOnEvaluator {
    artifacts: Arc<dyn ArtifactRepository>,
}

impl DependsOnEvaluator {
    pub fn new(artifacts: Arc<dyn ArtifactRepository>) -> Self {
        Self { artifacts }
    }
}

#[async_trait]
impl ConstraintEvaluator for DependsOnEvaluator {
    fn constraint_type(&self) -> &'static str {
        CONSTRAINT_TYPE
    }

    async fn can_promote(
        &self,
        artifact: &DeliveryArtifact,
        version: &str,
        config: &DeliveryConfig,
        environment: &Environment,
    ) -> Result<bool> {
        let upstream = match environment.constraint(CONSTRAINT_TYPE) {
            Some(Constraint::DependsOn { environment }) => environment,
            _ => return Ok(true),
        };
        if config.environment_named(upstream).is_none() {
            bail!(
                "environment {} depends on {}, which is not declared in {}",
                environment.name,
                upstream,
                config.name
            );
        }
        self.artifacts
            .was_successfully_deployed_to(config, artifact, version, upstream)
            .await
    }
}
