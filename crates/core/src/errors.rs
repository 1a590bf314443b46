//! Error taxonomy shared across the engine.

use thiserror::Error;

use crate::ResourceId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidResource {
    #[error("resource id must be a non-blank string")]
    BlankId,
    #[error("resource application must be a non-blank string")]
    BlankApplication,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid resource kind {0:?}, expected group/name@vVERSION")]
pub struct ParseKindError(pub String);

/// Errors a resource handler may surface from its resolve/actuate calls.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Transient: an external dependency is not ready yet. Reported as an
    /// informational event and retried next tick, never escalated.
    #[error("resource currently unresolvable: {0}")]
    CurrentlyUnresolvable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Outcome of the actuator's concurrent desired/current resolution. Each
/// side wraps its own failure so callers can report which branch failed.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("cannot resolve desired state of {id}")]
    CannotResolveDesiredState {
        id: ResourceId,
        #[source]
        cause: anyhow::Error,
    },
    #[error("cannot resolve current state of {id}")]
    CannotResolveCurrentState {
        id: ResourceId,
        #[source]
        cause: anyhow::Error,
    },
    /// Passed through unwrapped from either side; retried next cycle.
    #[error("resource {id} currently unresolvable: {message}")]
    CurrentlyUnresolvable { id: ResourceId, message: String },
}

impl ResolveError {
    /// Stable name recorded in check-error events.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::CannotResolveDesiredState { .. } => "cannot-resolve-desired-state",
            Self::CannotResolveCurrentState { .. } => "cannot-resolve-current-state",
            Self::CurrentlyUnresolvable { .. } => "currently-unresolvable",
        }
    }
}
