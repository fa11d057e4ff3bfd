//! Typed error hierarchy for the build orchestrator's HTTP-facing surface.

use thiserror::Error;

/// Errors from the build orchestrator.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("build {id} not found")]
    BuildNotFound { id: uuid::Uuid },

    #[error("cannot transition build from {from:?} to {to:?}")]
    InvalidTransition {
        from: crate::factory::models::BuildStatus,
        to: crate::factory::models::BuildStatus,
    },

    #[error("sandbox for build {id} is no longer reachable")]
    SandboxLost { id: uuid::Uuid },

    #[error("build {id} has no artifact to download")]
    NoArtifact { id: uuid::Uuid },

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("database error: {0}")]
    Database(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::models::BuildStatus;

    #[test]
    fn build_not_found_carries_id() {
        let id = uuid::Uuid::new_v4();
        let err = BuildError::BuildNotFound { id };
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn invalid_transition_names_both_states() {
        let err = BuildError::InvalidTransition {
            from: BuildStatus::Completed,
            to: BuildStatus::Running,
        };
        let message = err.to_string();
        assert!(message.contains("Completed"));
        assert!(message.contains("Running"));
    }

    #[test]
    fn database_error_wraps_anyhow() {
        let inner = anyhow::anyhow!("connection refused");
        let err: BuildError = inner.into();
        assert!(matches!(err, BuildError::Database(_)));
        assert!(err.to_string().contains("connection refused"));
    }
}
