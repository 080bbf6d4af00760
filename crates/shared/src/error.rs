use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of every fault the control plane absorbs or reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    ExecutableNotFound,
    SpawnFailure,
    CrashExit,
    CleanExit,
    RestartBudgetExhausted,
    ChannelParseFailure,
    SendWhileClosed,
    TransportError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind:?}: {message}")]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_displays_kind_and_message() {
        let fault = Fault::new(FaultKind::SendWhileClosed, "channel is not open");
        assert_eq!(fault.to_string(), "SendWhileClosed: channel is not open");
        let err: Box<dyn std::error::Error> = Box::new(fault);
        assert!(err.source().is_none());
    }
}
