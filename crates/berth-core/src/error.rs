use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::instance::{Kind, ServiceClass};

/// Failure reported by a container runtime adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("runtime rejected request: {0}")]
    Rejected(String),
    #[error("{op} did not finish within {after:?}")]
    Timeout { op: &'static str, after: Duration },
}

/// Failure reported by a metadata store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("metadata backend error: {0}")]
    Backend(String),
    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("corrupt record {id}: {reason}")]
    CorruptRecord { id: u64, reason: String },
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("service directory error: {0}")]
    Backend(String),
}

/// Pipeline step a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Validate,
    Image,
    Bootstrap,
    Container,
    Setup,
    Persist,
    Publish,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::Validate => "validate",
            Step::Image => "image",
            Step::Bootstrap => "bootstrap",
            Step::Container => "container",
            Step::Setup => "setup",
            Step::Persist => "persist",
            Step::Publish => "publish",
        };
        f.write_str(s)
    }
}

/// Which write failed after the container was already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistStage {
    Metadata,
    Directory,
}

impl fmt::Display for PersistStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistStage::Metadata => f.write_str("metadata store"),
            PersistStage::Directory => f.write_str("service directory"),
        }
    }
}

/// Coarse classification handed to the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    RuntimeUnavailable,
    Timeout,
    ResourceConflict,
    DependencyInstallFailed,
    LaunchFailed,
    MetadataUnavailable,
    PersistenceFailed,
    BootstrapFailed,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation_error",
            ErrorClass::RuntimeUnavailable => "runtime_unavailable",
            ErrorClass::Timeout => "timeout",
            ErrorClass::ResourceConflict => "resource_conflict",
            ErrorClass::DependencyInstallFailed => "dependency_install_failed",
            ErrorClass::LaunchFailed => "launch_failed",
            ErrorClass::MetadataUnavailable => "metadata_unavailable",
            ErrorClass::PersistenceFailed => "persistence_failed",
            ErrorClass::BootstrapFailed => "bootstrap_failed",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("container runtime failed during {step}: {source}")]
    RuntimeUnavailable {
        step: Step,
        #[source]
        source: RuntimeError,
    },
    #[error("deadline expired during {step}: {source}")]
    Timeout {
        step: Step,
        #[source]
        source: RuntimeError,
    },
    #[error(
        "'{name}' is already registered as {existing_kind} ({existing_class}) on {existing_host}, requested {requested}"
    )]
    ResourceConflict {
        name: String,
        existing_kind: Kind,
        existing_class: ServiceClass,
        existing_host: String,
        requested: Kind,
    },
    #[error("failed to start dependency step '{label}' for '{name}': {source}")]
    DependencyInstallFailed {
        name: String,
        label: String,
        #[source]
        source: RuntimeError,
    },
    #[error("failed to launch '{label}' for '{name}': {source}")]
    LaunchFailed {
        name: String,
        label: String,
        #[source]
        source: RuntimeError,
    },
    #[error("metadata store unavailable before provisioning '{name}': {source}")]
    MetadataUnavailable {
        name: String,
        #[source]
        source: StoreError,
    },
    #[error(
        "container {container_id} for '{name}' is running but the {stage} write failed: {reason}"
    )]
    PersistenceFailed {
        name: String,
        container_id: String,
        stage: PersistStage,
        reason: String,
    },
    #[error("volume plugin bootstrap failed: {0}")]
    BootstrapFailed(String),
}

impl ProvisionError {
    /// Attribute a runtime failure to a step, keeping deadline expiry distinct.
    pub fn runtime(step: Step, source: RuntimeError) -> Self {
        match source {
            RuntimeError::Timeout { .. } => ProvisionError::Timeout { step, source },
            other => ProvisionError::RuntimeUnavailable {
                step,
                source: other,
            },
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ProvisionError::Validation(_) => ErrorClass::Validation,
            ProvisionError::RuntimeUnavailable { .. } => ErrorClass::RuntimeUnavailable,
            ProvisionError::Timeout { .. } => ErrorClass::Timeout,
            ProvisionError::ResourceConflict { .. } => ErrorClass::ResourceConflict,
            ProvisionError::DependencyInstallFailed { .. } => ErrorClass::DependencyInstallFailed,
            ProvisionError::LaunchFailed { .. } => ErrorClass::LaunchFailed,
            ProvisionError::MetadataUnavailable { .. } => ErrorClass::MetadataUnavailable,
            ProvisionError::PersistenceFailed { .. } => ErrorClass::PersistenceFailed,
            ProvisionError::BootstrapFailed(_) => ErrorClass::BootstrapFailed,
        }
    }

    /// The step the failure happened in, when one applies.
    pub fn step(&self) -> Step {
        match self {
            ProvisionError::Validation(_) | ProvisionError::ResourceConflict { .. } => {
                Step::Validate
            }
            ProvisionError::MetadataUnavailable { .. } => Step::Validate,
            ProvisionError::RuntimeUnavailable { step, .. } | ProvisionError::Timeout { step, .. } => {
                *step
            }
            ProvisionError::DependencyInstallFailed { .. } | ProvisionError::LaunchFailed { .. } => {
                Step::Setup
            }
            ProvisionError::PersistenceFailed { stage, .. } => match stage {
                PersistStage::Metadata => Step::Persist,
                PersistStage::Directory => Step::Publish,
            },
            ProvisionError::BootstrapFailed(_) => Step::Bootstrap,
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ProvisionError::Validation(_) | ProvisionError::ResourceConflict { .. }
        )
    }

    /// True when a container was left running without a complete registration.
    pub fn leaves_inconsistency(&self) -> bool {
        matches!(self, ProvisionError::PersistenceFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_classified_separately() {
        let err = ProvisionError::runtime(
            Step::Image,
            RuntimeError::Timeout {
                op: "pull",
                after: Duration::from_secs(5),
            },
        );
        assert_eq!(err.class(), ErrorClass::Timeout);
        assert_eq!(err.step(), Step::Image);

        let err = ProvisionError::runtime(Step::Container, RuntimeError::Unavailable("down".into()));
        assert_eq!(err.class(), ErrorClass::RuntimeUnavailable);
        assert!(!err.is_client_error());
    }

    #[test]
    fn persistence_failure_flags_inconsistency() {
        let err = ProvisionError::PersistenceFailed {
            name: "alpha".into(),
            container_id: "c-1".into(),
            stage: PersistStage::Directory,
            reason: "gone".into(),
        };
        assert!(err.leaves_inconsistency());
        assert_eq!(err.step(), Step::Publish);
        assert!(err.to_string().contains("c-1"));
        assert_eq!(err.class().as_str(), "persistence_failed");
    }
}
