use thiserror::Error;

use crate::health::ObservedService;
use crate::probe::ToolName;
use crate::stage::Stage;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("installing {tool} failed (exit {exit_code}): {detail}")]
    InstallFailed {
        tool: ToolName,
        exit_code: i32,
        detail: String,
    },
    #[error("{tool} is missing and installation is disabled")]
    InstallDisabled { tool: ToolName },
    #[error("{tool} still missing after installation")]
    StillMissing { tool: ToolName },
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
#[error("git {step} failed (exit {exit_code}): {detail}")]
pub struct SyncError {
    pub step: String,
    pub exit_code: i32,
    pub detail: String,
}

#[derive(Debug, Error)]
pub enum SyncFailure {
    #[error(transparent)]
    Git(#[from] SyncError),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("compose file not found at {path}")]
    ConfigMissing { path: String },
    #[error("image pull failed (exit {exit_code}): {detail}")]
    Pull { exit_code: i32, detail: String },
    #[error("{stage} failed (exit {exit_code}): {detail}")]
    Stage {
        stage: Stage,
        exit_code: i32,
        detail: String,
    },
    #[error("{stage}: {source:#}")]
    Transport {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },
}

impl ReconcileError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::ConfigMissing { .. } => Stage::Precondition,
            Self::Pull { .. } => Stage::Pull,
            Self::Stage { stage, .. } | Self::Transport { stage, .. } => *stage,
        }
    }

    fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Pull { exit_code, .. } | Self::Stage { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("unhealthy services: {}", names(.services))]
    UnhealthyServices { services: Vec<ObservedService> },
    #[error("incomplete rollout: {actual} of {expected} containers running")]
    IncompleteRollout {
        expected: usize,
        actual: usize,
        services: Vec<ObservedService>,
    },
    #[error("failed to query container status: {0}")]
    Query(String),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

fn names(services: &[ObservedService]) -> String {
    services
        .iter()
        .map(|s| s.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl HealthError {
    /// Services implicated in the failure, with their log tails when collected.
    pub fn failing_services(&self) -> &[ObservedService] {
        match self {
            Self::UnhealthyServices { services } | Self::IncompleteRollout { services, .. } => {
                services
            }
            _ => &[],
        }
    }
}

/// First failure of a pipeline run.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("provision: {0}")]
    Provision(#[from] ProvisionError),
    #[error("sync: {0}")]
    Sync(#[from] SyncFailure),
    #[error("reconcile: {0}")]
    Reconcile(#[from] ReconcileError),
    #[error("verify: {0}")]
    Health(#[from] HealthError),
}

impl DeployError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Provision(_) => Stage::Provision,
            Self::Sync(_) => Stage::Sync,
            Self::Reconcile(err) => err.stage(),
            Self::Health(_) => Stage::Verify,
        }
    }

    /// Exit code of the failing external command when usable, else a per-stage default.
    pub fn exit_code(&self) -> i32 {
        let propagated = match self {
            Self::Provision(ProvisionError::InstallFailed { exit_code, .. }) => Some(*exit_code),
            Self::Sync(SyncFailure::Git(err)) => Some(err.exit_code),
            Self::Reconcile(err) => err.exit_code(),
            _ => None,
        };
        if let Some(code) = propagated.filter(|code| (1..=255).contains(code)) {
            return code;
        }
        match self {
            Self::Provision(_) => 10,
            Self::Sync(_) => 20,
            Self::Reconcile(ReconcileError::ConfigMissing { .. }) => 30,
            Self::Reconcile(ReconcileError::Pull { .. }) => 31,
            Self::Reconcile(_) => 32,
            Self::Health(HealthError::IncompleteRollout { .. }) => 41,
            Self::Health(_) => 40,
        }
    }

    pub fn failing_services(&self) -> &[ObservedService] {
        match self {
            Self::Health(err) => err.failing_services(),
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_prefers_the_failing_command() {
        let err = DeployError::from(ReconcileError::Pull {
            exit_code: 18,
            detail: "manifest unknown".to_string(),
        });
        assert_eq!(err.exit_code(), 18);
        assert_eq!(err.stage(), Stage::Pull);

        let err = DeployError::from(ReconcileError::Stage {
            stage: Stage::Up,
            exit_code: -1,
            detail: "signal".to_string(),
        });
        assert_eq!(err.exit_code(), 32);
        assert_eq!(err.stage(), Stage::Up);
    }

    #[test]
    fn health_errors_map_to_verify() {
        let err = DeployError::from(HealthError::IncompleteRollout {
            expected: 3,
            actual: 2,
            services: Vec::new(),
        });
        assert_eq!(err.stage(), Stage::Verify);
        assert_eq!(err.exit_code(), 41);
        assert_eq!(
            err.to_string(),
            "verify: incomplete rollout: 2 of 3 containers running"
        );
    }
}
