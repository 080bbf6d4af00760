use std::path::{Path, PathBuf};

use anyhow::Context;
use client_core::BridgeConfig;
use config::{Config, Environment, File};
use serde::Deserialize;
use supervisor::{default_candidates, SupervisorConfig};

pub const DEFAULT_CONFIG_FILE: &str = "pos-terminal.toml";
const WORKER_BINARY: &str = "pos-server";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Explicit worker executable, tried before the default locations.
    pub executable: Option<PathBuf>,
    /// Launch and supervise the worker; when false the host only connects.
    pub spawn: bool,
    pub worker: SupervisorConfig,
    pub channel: BridgeConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            executable: None,
            spawn: true,
            worker: SupervisorConfig::default(),
            channel: BridgeConfig::default(),
        }
    }
}

impl Settings {
    /// Defaults, then the TOML file, then `APP__*` environment variables.
    /// An explicit `path` must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        Self::load_with(path, app_environment())
    }

    fn load_with(path: Option<&Path>, environment: Environment) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        Config::builder()
            .add_source(file)
            .add_source(environment)
            .build()
            .context("failed to read settings")?
            .try_deserialize()
            .context("invalid settings")
    }

    /// Supervisor settings with the executable candidates filled in.
    pub fn supervisor_config(&self, base_dir: &Path) -> SupervisorConfig {
        let mut candidates = Vec::new();
        candidates.extend(self.executable.clone());
        if self.worker.candidates.is_empty() {
            candidates.extend(default_candidates(base_dir, WORKER_BINARY));
        } else {
            candidates.extend(self.worker.candidates.iter().cloned());
        }
        self.worker.clone().with_candidates(candidates)
    }
}

fn app_environment() -> Environment {
    Environment::with_prefix("APP")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, fs, time::Duration};

    use super::*;

    fn environment(vars: &[(&str, &str)]) -> Environment {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        app_environment().source(Some(vars))
    }

    #[test]
    fn defaults_match_the_worker_contract() {
        let settings = Settings::load_with(None, environment(&[])).expect("load");
        assert!(settings.spawn);
        assert_eq!(settings.worker.ready_addr(), "127.0.0.1:8989");
        assert_eq!(settings.worker.restart.max_attempts, 5);
        assert_eq!(settings.channel.url, "ws://127.0.0.1:8989/ws");
        assert_eq!(settings.channel.reconnect_delay, Duration::from_secs(3));
    }

    #[test]
    fn file_then_environment_override_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pos-terminal.toml");
        fs::write(
            &path,
            "spawn = false\n\n[worker]\nready_port = 9000\nstop_grace = \"2s\"\n\n[worker.restart]\nmax_attempts = 2\n\n[channel]\nurl = \"ws://127.0.0.1:9000/ws\"\nreconnect_delay = \"750ms\"\n",
        )
        .expect("write settings");

        let settings = Settings::load_with(
            Some(&path),
            environment(&[
                ("APP__WORKER__READY_PORT", "9100"),
                ("APP__WORKER__RESTART__DELAY", "1s 500ms"),
            ]),
        )
        .expect("load");
        assert!(!settings.spawn);
        assert_eq!(settings.worker.ready_port, 9100);
        assert_eq!(settings.worker.restart.max_attempts, 2);
        assert_eq!(settings.worker.restart.delay, Duration::from_millis(1500));
        assert_eq!(settings.worker.stop_grace, Duration::from_secs(2));
        assert_eq!(settings.worker.startup_timeout, Duration::from_secs(10));
        assert_eq!(settings.channel.url, "ws://127.0.0.1:9000/ws");
        assert_eq!(settings.channel.reconnect_delay, Duration::from_millis(750));
    }

    #[test]
    fn explicit_file_must_exist() {
        let missing = Path::new("/nonexistent/pos-terminal.toml");
        assert!(Settings::load_with(Some(missing), environment(&[])).is_err());
    }

    #[test]
    fn configured_executable_is_tried_first() {
        let settings = Settings {
            executable: Some(PathBuf::from("/opt/worker/pos-server")),
            ..Settings::default()
        };
        let config = settings.supervisor_config(Path::new("/opt/pos"));
        assert_eq!(config.candidates.len(), 4);
        assert_eq!(config.candidates[0], PathBuf::from("/opt/worker/pos-server"));
        assert!(config.candidates[1].starts_with("/opt/pos/resources/bin"));
    }
}
