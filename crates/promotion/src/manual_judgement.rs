//! Stateful gate: a human (or an out-of-band system) must judge each
//! version before it enters the environment. Overrides stored on the key
//! are terminal; the evaluator never re-derives a different status for an
//! overridden key.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::info;

use rudder_core::{Constraint, ConstraintStatus, DeliveryArtifact, DeliveryConfig, Environment};
use rudder_persist::ConstraintStateRepository;

use crate::{load_or_create_state, state_key, ConstraintEvaluator};

pub const CONSTRAINT_TYPE: &str = "manual-judgement";

pub struct ManualJudgementEvaluator {
    states: Arc<dyn ConstraintStateRepository>,
}

impl ManualJudgementEvaluator {
    pub fn new(states: Arc<dyn ConstraintStateRepository>) -> Self {
        Self { states }
    }

    /// Records an operator's judgement for a pending version.
    pub async fn judge(
        &self,
        config: &DeliveryConfig,
        artifact: &DeliveryArtifact,
        version: &str,
        environment: &str,
        status: ConstraintStatus,
        judged_by: &str,
        comment: Option<String>,
    ) -> Result<()> {
        let key = state_key(CONSTRAINT_TYPE, config, artifact, version, environment);
        let state = load_or_create_state(self.states.as_ref(), key).await?;
        info!(%version, %environment, %judged_by, "recording manual judgement");
        self.states.store_state(state.judged(status, judged_by, comment)).await
    }
}

#[async_trait]
impl ConstraintEvaluator for ManualJudgementEvaluator {
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
        let timeout_secs = match environment.constraint(CONSTRAINT_TYPE) {
            Some(Constraint::ManualJudgement { timeout_secs }) => *timeout_secs,
            _ => return Ok(true),
        };
        let key = state_key(CONSTRAINT_TYPE, config, artifact, version, &environment.name);
        let state = load_or_create_state(self.states.as_ref(), key).await?;

        if state.status.overridden() {
            return Ok(state.status.passes());
        }
        match state.status {
            ConstraintStatus::Pass => Ok(true),
            ConstraintStatus::Fail => Ok(false),
            _ => {
                if let Some(secs) = timeout_secs {
                    let deadline = state.created_at + Duration::seconds(secs as i64);
                    if Utc::now() > deadline {
                        info!(%version, environment = %environment.name, "judgement timed out");
                        self.states
                            .store_state(state.judged(
                                ConstraintStatus::Fail,
                                "system",
                                Some(format!("no judgement within {secs}s")),
                            ))
                            .await?;
                        return Ok(false);
                    }
                }
                // Still awaiting judgement.
                Ok(false)
            }
        }
    }
}
