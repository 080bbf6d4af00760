use std::path::PathBuf;

use shared::error::{Fault, FaultKind};
use thiserror::Error;

/// Failures reported synchronously to the caller of `start()`.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("worker executable not found: {}", path.display())]
    ExecutableNotFound { path: PathBuf },
    #[error("failed to spawn worker {}: {source}", path.display())]
    SpawnFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SupervisorError {
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::ExecutableNotFound { .. } => FaultKind::ExecutableNotFound,
            Self::SpawnFailure { .. } => FaultKind::SpawnFailure,
        }
    }
}

impl From<&SupervisorError> for Fault {
    fn from(value: &SupervisorError) -> Self {
        Fault::new(value.kind(), value.to_string())
    }
}
