//! Error taxonomy for deployment runs.

use alloy_core::primitives::{Address, B256, Selector};

/// Result alias used throughout the library.
pub type Result<T, E = DeployError> = std::result::Result<T, E>;

/// Errors surfaced by the deployment control plane.
///
/// Configuration errors are raised before any transaction is sent and are never
/// retried. Chain-side errors carry the step name and the verbatim reason so a
/// failed run can be diagnosed from the error alone.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("missing required parameter `{key}`")]
    MissingParameter { key: String },

    #[error("invalid value for parameter `{key}`: {reason}")]
    InvalidParameter { key: String, reason: String },

    #[error("selector {selector} is claimed by both `{first}` and `{second}`")]
    SelectorConflict {
        selector: Selector,
        first: String,
        second: String,
    },

    #[error(
        "salt {salt} was already used for `{name}` with different init code \
         (recorded hash {recorded}, requested hash {requested})"
    )]
    SaltReuse {
        name: String,
        salt: B256,
        recorded: B256,
        requested: B256,
    },

    #[error("dependency cycle between steps: {}", .steps.join(" -> "))]
    DependencyCycle { steps: Vec<String> },

    #[error("step `{step}` depends on unknown step `{dependency}`")]
    UnknownDependency { step: String, dependency: String },

    #[error("duplicate step `{0}` in deployment plan")]
    DuplicateStep(String),

    #[error("deployment of `{name}` failed: {reason}")]
    DeploymentFailed { name: String, reason: String },

    #[error("transaction for `{step}` rejected: {reason}")]
    TransactionRejected { step: String, reason: String },

    #[error("`{name}` expected at {predicted} but {actual}")]
    AddressMismatch {
        name: String,
        predicted: Address,
        actual: String,
    },

    #[error("`{name}` is recorded at {recorded}, refusing to overwrite with {attempted}")]
    RegistryConflict {
        name: String,
        recorded: Address,
        attempted: Address,
    },

    #[error("no address recorded for `{0}`")]
    NotFound(String),

    #[error(
        "group {group} failed ({} failed, {} confirmed, {} not started): {}",
        .failed.len(),
        .confirmed.len(),
        .not_started.len(),
        summarize(.failed)
    )]
    PartialGroupFailure {
        group: usize,
        failed: Vec<(String, DeployError)>,
        confirmed: Vec<String>,
        not_started: Vec<String>,
    },

    #[error("rpc `{method}` failed: {message}")]
    Rpc { method: String, message: String },

    #[error("artifact `{contract}`: {reason}")]
    Artifact { contract: String, reason: String },

    #[error("persistence error: {0:#}")]
    Persistence(#[from] anyhow::Error),
}

impl DeployError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn rpc(method: &str, message: impl std::fmt::Display) -> Self {
        Self::Rpc {
            method: method.to_string(),
            message: message.to_string(),
        }
    }

    /// Whether the error is a configuration problem that must be fixed before
    /// any transaction is attempted.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::MissingParameter { .. }
                | Self::InvalidParameter { .. }
                | Self::SelectorConflict { .. }
                | Self::SaltReuse { .. }
                | Self::DependencyCycle { .. }
                | Self::UnknownDependency { .. }
                | Self::DuplicateStep(_)
                | Self::Artifact { .. }
        )
    }

    /// Whether the error must abort the run instead of being reported as a
    /// step failure.
    pub fn is_fatal(&self) -> bool {
        self.is_configuration()
            || matches!(
                self,
                Self::AddressMismatch { .. } | Self::RegistryConflict { .. }
            )
    }
}

fn summarize(failed: &[(String, DeployError)]) -> String {
    failed
        .iter()
        .map(|(step, err)| format!("{step}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors_are_fatal() {
        let err = DeployError::MissingParameter {
            key: "CONTRACTS_GENESIS_ROOT".to_string(),
        };
        assert!(err.is_configuration());
        assert!(err.is_fatal());

        let err = DeployError::TransactionRejected {
            step: "AllowList".to_string(),
            reason: "execution reverted".to_string(),
        };
        assert!(!err.is_configuration());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_group_failure_message_lists_failed_steps() {
        let err = DeployError::PartialGroupFailure {
            group: 2,
            failed: vec![(
                "ProofSystem.Verifier".to_string(),
                DeployError::DeploymentFailed {
                    name: "ProofSystem.Verifier".to_string(),
                    reason: "out of gas".to_string(),
                },
            )],
            confirmed: vec!["ProofSystem.GettersFacet".to_string()],
            not_started: vec![],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("group 2 failed (1 failed, 1 confirmed, 0 not started)"));
        assert!(msg.contains("out of gas"));
    }
}
