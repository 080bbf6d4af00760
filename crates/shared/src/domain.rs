use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fine-grained transaction phase reported by the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    #[default]
    Idle,
    Sending,
    WaitAck,
    WaitResponse,
    Parsing,
    Success,
    Error,
    Timeout,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Sending => "SENDING",
            Self::WaitAck => "WAIT_ACK",
            Self::WaitResponse => "WAIT_RESPONSE",
            Self::Parsing => "PARSING",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Timeout => "TIMEOUT",
        }
    }

    /// Parses a worker state string, falling back to `Idle` for anything unknown.
    pub fn parse_lenient(raw: &str) -> Self {
        raw.parse().unwrap_or_default()
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown worker state: {0}")]
pub struct UnknownWorkerState(pub String);

impl FromStr for WorkerState {
    type Err = UnknownWorkerState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IDLE" => Ok(Self::Idle),
            "SENDING" => Ok(Self::Sending),
            "WAIT_ACK" => Ok(Self::WaitAck),
            "WAIT_RESPONSE" => Ok(Self::WaitResponse),
            "PARSING" => Ok(Self::Parsing),
            "SUCCESS" => Ok(Self::Success),
            "ERROR" => Ok(Self::Error),
            "TIMEOUT" => Ok(Self::Timeout),
            other => Err(UnknownWorkerState(other.to_string())),
        }
    }
}

/// UI-facing application state; worker sub-states collapse into `Processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppState {
    #[default]
    Disconnected,
    Idle,
    Processing,
    Success,
    Error,
    Timeout,
}

impl AppState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Idle => "IDLE",
            Self::Processing => "PROCESSING",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<WorkerState> for AppState {
    fn from(value: WorkerState) -> Self {
        match value {
            WorkerState::Idle => Self::Idle,
            WorkerState::Sending
            | WorkerState::WaitAck
            | WorkerState::WaitResponse
            | WorkerState::Parsing => Self::Processing,
            WorkerState::Success => Self::Success,
            WorkerState::Error => Self::Error,
            WorkerState::Timeout => Self::Timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FormTab {
    #[default]
    Sale,
    Refund,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        })
    }
}
