//! Provisioning error taxonomy.

use cirrus_id::InstanceId;
use cirrus_reconcile::ReconcileError;
use thiserror::Error;

use crate::provider::ApiError;
use crate::ssh::SshError;
use crate::types::Role;

/// Provisioning result type.
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Errors surfaced by the provisioning engine.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Preflight failure; nothing was changed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A single provider call failed.
    #[error("{action} failed in region {region}: {source}")]
    Api {
        action: &'static str,
        region: String,
        #[source]
        source: ApiError,
    },

    /// A polled task resolved to a terminal failure.
    #[error("async task failed: {0}")]
    TaskFailed(#[source] ReconcileError),

    /// The wait budget ran out before the target state was observed.
    #[error("convergence timeout: {0}")]
    ConvergenceTimeout(#[source] ReconcileError),

    /// Fewer resources were created than requested.
    #[error(
        "partial provisioning of {role} instances: requested {requested}, created {} ({})",
        .created.len(),
        join_ids(.created)
    )]
    PartialProvisioning {
        role: Role,
        requested: usize,
        created: Vec<InstanceId>,
    },

    /// Rollback or delete sub-steps failed.
    #[error(
        "compensation incomplete{}: {}",
        describe_original(.original),
        .failures.join("; ")
    )]
    Compensation {
        original: Option<Box<ProvisionError>>,
        failures: Vec<String>,
    },

    /// Installing the public key on a node failed.
    #[error("failed to upload public key to instance {instance_id}: {source}")]
    KeyUpload {
        instance_id: InstanceId,
        #[source]
        source: SshError,
    },
}

impl ProvisionError {
    /// Wrap a provider call failure.
    pub fn api(action: &'static str, region: &str, source: ApiError) -> Self {
        Self::Api {
            action,
            region: region.to_string(),
            source,
        }
    }

    /// Returns true if this is a preflight failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Resource identifiers worth following up on manually.
    pub fn resources(&self) -> Vec<String> {
        match self {
            Self::TaskFailed(err) | Self::ConvergenceTimeout(err) => err.resources().to_vec(),
            Self::PartialProvisioning { created, .. } => {
                created.iter().map(ToString::to_string).collect()
            }
            Self::KeyUpload { instance_id, .. } => vec![instance_id.to_string()],
            Self::Compensation {
                original: Some(original),
                ..
            } => original.resources(),
            _ => Vec::new(),
        }
    }
}

impl From<ReconcileError> for ProvisionError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Timeout { .. } => Self::ConvergenceTimeout(err),
            ReconcileError::TerminalFailure { .. } => Self::TaskFailed(err),
        }
    }
}

fn join_ids(ids: &[InstanceId]) -> String {
    ids.iter()
        .map(InstanceId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_original(original: &Option<Box<ProvisionError>>) -> String {
    match original {
        Some(err) => format!(" after \"{err}\""),
        None => String::new(),
    }
}
