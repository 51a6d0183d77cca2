use std::fmt;

use lessor_common::Network;

/// User-facing message when no provider signs within the creation timeout.
pub const NO_PROVIDER_ACCEPTED: &str = "No providers accepted the proposal. please check the configuration validity or modify the size. For example: number of threads, memory, price per hour.";

/// Teardown phases of an instance, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPhase {
    Stop,
    CloseServices,
    DeleteNode,
}

impl CleanupPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupPhase::Stop => "stop",
            CleanupPhase::CloseServices => "close_services",
            CleanupPhase::DeleteNode => "delete_node",
        }
    }
}

impl fmt::Display for CleanupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("{0}")]
    Validation(String),

    #[error("{}", NO_PROVIDER_ACCEPTED)]
    AcquisitionTimeout,

    #[error("{0}")]
    Acquisition(String),

    #[error("{0}")]
    ServiceSetup(String),

    #[error("{0}")]
    Invalidation(String),

    #[error("cleanup of {agreement_id} failed in phase(s): {}", join_phases(.phases))]
    CleanupPhase {
        agreement_id: String,
        phases: Vec<CleanupPhase>,
    },

    #[error("{0}")]
    SshSession(String),

    #[error("{entity} {id} not found on {network}")]
    NotFound {
        entity: &'static str,
        id: String,
        network: Network,
    },

    #[error("{0}")]
    Store(String),

    #[error("{0}")]
    Marketplace(String),

    #[error("failed to terminate: {}", join_failures(.failures))]
    Aggregate { failures: Vec<(String, String)> },
}

fn join_phases(phases: &[CleanupPhase]) -> String {
    phases
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(id, reason)| format!("{id} ({reason})"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl LifecycleError {
    /// Short machine-readable class, rendered as `error` in API responses.
    pub fn classification(&self) -> &'static str {
        match self {
            LifecycleError::Validation(_) => "validation_error",
            LifecycleError::AcquisitionTimeout => "acquisition_timeout",
            LifecycleError::Acquisition(_) => "acquisition_error",
            LifecycleError::ServiceSetup(_) => "service_setup_error",
            LifecycleError::Invalidation(_) => "invalidation",
            LifecycleError::CleanupPhase { .. } => "cleanup_phase_failure",
            LifecycleError::SshSession(_) => "ssh_session_error",
            LifecycleError::NotFound { .. } => "not_found",
            LifecycleError::Store(_) => "store_error",
            LifecycleError::Marketplace(_) => "marketplace_error",
            LifecycleError::Aggregate { .. } => "aggregate_failure",
        }
    }

    pub fn store(err: anyhow::Error) -> Self {
        LifecycleError::Store(format!("{err:#}"))
    }

    pub fn marketplace(err: anyhow::Error) -> Self {
        LifecycleError::Marketplace(format!("{err:#}"))
    }
}
