//! Error types shared by the control loops

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the agent's internal operations.
///
/// None of these are fatal to a control loop: callers log them and either
/// end the current cycle or requeue the work item.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("not enough stats to detect shortage")]
    InsufficientData,

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("no metrics available for pod {0}")]
    NoMetrics(String),

    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not resolve cgroup path: {0}")]
    CgroupPath(String),

    #[error("container runtime call failed: {0}")]
    Runtime(String),

    #[error("invalid quantity {0:?}")]
    Quantity(String),

    #[error("{0}")]
    Other(String),
}

impl AgentError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AgentError::Io {
            path: path.into(),
            source,
        }
    }

    /// True when the referenced object no longer exists
    pub fn is_not_found(&self) -> bool {
        match self {
            AgentError::NotFound { .. } => true,
            AgentError::Kube(kube::Error::Api(resp)) => resp.code == 404,
            AgentError::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<tonic::Status> for AgentError {
    fn from(status: tonic::Status) -> Self {
        AgentError::Runtime(status.to_string())
    }
}

impl From<tonic::transport::Error> for AgentError {
    fn from(err: tonic::transport::Error) -> Self {
        AgentError::Runtime(err.to_string())
    }
}

pub type Result<T, E = AgentError> = std::result::Result<T, E>;
