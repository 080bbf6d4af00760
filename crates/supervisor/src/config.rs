use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

/// Bounded auto-restart budget for crash exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(3000),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Ordered executable locations; the first existing file wins.
    pub candidates: Vec<PathBuf>,
    pub args: Vec<String>,
    pub ready_host: String,
    pub ready_port: u16,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,
    pub restart: RestartPolicy,
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub restart_pause: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            candidates: Vec::new(),
            args: Vec::new(),
            ready_host: "127.0.0.1".into(),
            ready_port: 8989,
            poll_interval: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(500),
            startup_timeout: Duration::from_millis(10_000),
            restart: RestartPolicy::default(),
            stop_grace: Duration::from_millis(5000),
            restart_pause: Duration::from_millis(1000),
        }
    }
}

impl SupervisorConfig {
    pub fn with_candidates(mut self, candidates: impl IntoIterator<Item = PathBuf>) -> Self {
        self.candidates = candidates.into_iter().collect();
        self
    }

    pub fn ready_addr(&self) -> String {
        format!("{}:{}", self.ready_host, self.ready_port)
    }
}

/// Picks the first candidate that exists on disk. When none exists the first
/// candidate is returned so the caller reports a stable path.
pub fn resolve_executable(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates
        .iter()
        .find(|candidate| candidate.is_file())
        .or_else(|| candidates.first())
        .cloned()
}

/// Default candidate list for `name` relative to `base_dir` (normally the
/// directory holding the host binary).
pub fn default_candidates(base_dir: &Path, name: &str) -> Vec<PathBuf> {
    let binary = format!("{name}{}", std::env::consts::EXE_SUFFIX);
    vec![
        base_dir.join("resources").join("bin").join(&binary),
        base_dir.join("..").join("resources").join("bin").join(&binary),
        base_dir.join("..").join("server").join(&binary),
    ]
}
