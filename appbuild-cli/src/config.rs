//! Persistent configuration for the appbuild CLI.
//!
//! Config file lives at `~/.config/appbuild/cli.toml`.
//! Session state (last application and trace) at `~/.config/appbuild/session.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use appbuild_sdk::TraceId;
use appbuild_sdk::client::{ClientConfig, DEFAULT_SERVER, DEFAULT_TIMEOUT, Environment};
use appbuild_sdk::conversation::Thread;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

/// User configuration (persisted in cli.toml).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Backend URL. Default: http://127.0.0.1:4444
    pub server: Option<String>,
    /// Bearer token sent with every request.
    pub token: Option<String>,
    /// Deployment environment for generated apps.
    pub environment: Option<Environment>,
    /// Request timeout in seconds.
    pub timeout_secs: Option<u64>,
}

/// Where the last conversation left off.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Session {
    pub app_id: Option<String>,
    pub trace_id: Option<String>,
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("appbuild")
}

fn config_path() -> PathBuf {
    config_dir().join("cli.toml")
}

fn session_path() -> PathBuf {
    config_dir().join("session.toml")
}

fn load_toml<T: DeserializeOwned + Default>(path: &Path, what: &str) -> T {
    if path.exists() {
        match std::fs::read_to_string(path) {
            Ok(s) => match toml::from_str(&s) {
                Ok(c) => return c,
                Err(e) => eprintln!("Warning: bad {what} file {}: {e}", path.display()),
            },
            Err(e) => eprintln!("Warning: can't read {}: {e}", path.display()),
        }
    }
    T::default()
}

fn save_toml<T: Serialize>(value: &T, path: &Path, what: &str) {
    if let Some(dir) = path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    match toml::to_string_pretty(value) {
        Ok(s) => {
            if let Err(e) = std::fs::write(path, s) {
                eprintln!("Warning: can't save {what}: {e}");
            }
        }
        Err(e) => eprintln!("Warning: can't serialize {what}: {e}"),
    }
}

impl Config {
    pub fn load() -> Self {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        load_toml(path, "config")
    }
}

impl Session {
    pub fn load() -> Self {
        Self::load_from(&session_path())
    }

    pub fn load_from(path: &Path) -> Self {
        load_toml(path, "session")
    }

    pub fn save(&self) {
        self.save_to(&session_path());
    }

    pub fn save_to(&self, path: &Path) {
        save_toml(self, path, "session");
    }

    /// The saved thread, if both ids were recorded.
    pub fn thread(&self) -> Option<Thread> {
        Some(Thread {
            application_id: self.app_id.clone()?,
            trace_id: TraceId::from(self.trace_id.clone()?),
        })
    }

    pub fn remember(&mut self, thread: &Thread) {
        self.app_id = Some(thread.application_id.clone());
        self.trace_id = Some(thread.trace_id.to_string());
    }
}

/// Merge: CLI overrides > config file > defaults.
pub fn resolve(cli: &super::Cli, config: &Config) -> ClientConfig {
    let base_url = cli
        .server
        .clone()
        .or_else(|| config.server.clone())
        .unwrap_or_else(|| DEFAULT_SERVER.to_string());
    let token = cli.token.clone().or_else(|| config.token.clone());
    let environment = cli.environment.or(config.environment);
    let timeout = cli
        .timeout_secs
        .or(config.timeout_secs)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TIMEOUT);

    ClientConfig {
        base_url,
        token,
        environment,
        timeout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Config::load_from(&dir.path().join("cli.toml")), Config::default());
        assert_eq!(Session::load_from(&dir.path().join("session.toml")), Session::default());
    }

    #[test]
    fn corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cli.toml");
        std::fs::write(&path, "server = [not toml").unwrap();
        assert_eq!(Config::load_from(&path), Config::default());
    }

    #[test]
    fn parses_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cli.toml");
        std::fs::write(
            &path,
            "server = \"https://api.example.dev\"\nenvironment = \"production\"\ntimeout_secs = 30\n",
        )
        .unwrap();
        let config = Config::load_from(&path);
        assert_eq!(config.server.as_deref(), Some("https://api.example.dev"));
        assert_eq!(config.environment, Some(Environment::Production));
        assert_eq!(config.timeout_secs, Some(30));
        assert_eq!(config.token, None);
    }

    #[test]
    fn session_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.toml");
        let thread = Thread {
            application_id: "42".into(),
            trace_id: TraceId::new("42", "9"),
        };
        let mut session = Session::default();
        assert!(session.thread().is_none());
        session.remember(&thread);
        session.save_to(&path);

        let loaded = Session::load_from(&path);
        assert_eq!(loaded.thread(), Some(thread));
    }
}
