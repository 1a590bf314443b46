//! Delivery configs: the declared artifacts and environments for one application.

use serde::{Deserialize, Serialize};

use crate::artifact::DeliveryArtifact;
use crate::{Resource, ResourceId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryConfig {
    pub name: String,
    pub application: String,
    pub service_account: String,
    #[serde(default)]
    pub artifacts: Vec<DeliveryArtifact>,
    #[serde(default)]
    pub environments: Vec<Environment>,
}

impl DeliveryConfig {
    /// Resources are derived: the union of every environment's resource set.
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.environments.iter().flat_map(|e| e.resources.iter())
    }

    pub fn matching_artifact_by_reference(&self, reference: &str) -> Option<&DeliveryArtifact> {
        self.artifacts.iter().find(|a| a.reference == reference)
    }

    pub fn environment_named(&self, name: &str) -> Option<&Environment> {
        self.environments.iter().find(|e| e.name == name)
    }

    pub fn environment_for(&self, id: &ResourceId) -> Option<&Environment> {
        self.environments
            .iter()
            .find(|e| e.resources.iter().any(|r| r.id() == id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Environment {
    pub name: String,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub verifications: Vec<Verification>,
    #[serde(default)]
    pub notifications: Vec<NotificationConfig>,
}

impl Environment {
    pub fn declares_constraint(&self, type_name: &str) -> bool {
        self.constraints.iter().any(|c| c.type_name() == type_name)
    }

    pub fn constraint(&self, type_name: &str) -> Option<&Constraint> {
        self.constraints.iter().find(|c| c.type_name() == type_name)
    }
}

/// A named post-deployment check declared on an environment. Carried on the
/// model; running verifications is outside the engine core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Verification {
    pub id: String,
}

/// Opaque notification declaration, forwarded to the notification layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationConfig {
    pub target: String,
}

/// Promotion gates declared on an environment. Stateful constraints persist
/// a judgement; stateless ones are recomputed every evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Constraint {
    #[serde(rename_all = "camelCase")]
    ManualJudgement {
        /// Pending judgements older than this are failed automatically.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    DependsOn {
        environment: String,
    },
    AllowedTimes {
        windows: Vec<TimeWindow>,
        /// `utc` (default) or a fixed offset such as `+02:00`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
}

impl Constraint {
    /// Stable tag used for evaluator dispatch and constraint-state keys.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ManualJudgement { .. } => "manual-judgement",
            Self::DependsOn { .. } => "depends-on",
            Self::AllowedTimes { .. } => "allowed-times",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeWindow {
    /// e.g. `monday-friday`, `weekdays`, or `monday,wednesday`.
    pub days: String,
    /// e.g. `9-17` (end exclusive) or `6,12,18`.
    pub hours: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_tags_are_stable() {
        let c = Constraint::DependsOn { environment: "test".into() };
        assert_eq!(c.type_name(), "depends-on");
        let yaml = "type: manual-judgement\ntimeoutSecs: 3600\n";
        let parsed: Constraint = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed.type_name(), "manual-judgement");
    }
}
