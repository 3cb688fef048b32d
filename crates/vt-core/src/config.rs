use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::process::{RunOptions, DEFAULT_MAX_CAPTURE_BYTES};

pub const DEFAULT_VIRTUALENV: &str = "virtualenv";
pub const DEFAULT_GET_PIP_URL: &str = "https://bootstrap.pypa.io/get-pip.py";
pub const DEFAULT_INSTALL_TEMPLATE: &str = "{python} -m pip install {package}";

#[derive(Debug, Clone)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars_os()
                .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
                .collect(),
        }
    }

    /// Unset and empty values read the same.
    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

/// Knobs shared by builders and activated environments.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Settings {
    /// Base interpreter for new environments; detected on `PATH` when unset.
    pub runtime_python: Option<PathBuf>,
    pub virtualenv_command: PathBuf,
    pub get_pip_url: String,
    pub install_template: String,
    /// Per-subprocess limit; `None` waits forever.
    pub timeout_ms: Option<u64>,
    pub max_capture_bytes: usize,
    pub temp_root: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            runtime_python: None,
            virtualenv_command: PathBuf::from(DEFAULT_VIRTUALENV),
            get_pip_url: DEFAULT_GET_PIP_URL.to_string(),
            install_template: DEFAULT_INSTALL_TEMPLATE.to_string(),
            timeout_ms: None,
            max_capture_bytes: DEFAULT_MAX_CAPTURE_BYTES,
            temp_root: None,
        }
    }
}

impl Settings {
    /// Builds settings from the current process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    pub(crate) fn from_snapshot(snapshot: &EnvSnapshot) -> Self {
        let defaults = Self::default();
        Self {
            runtime_python: snapshot.var(vt_python::RUNTIME_PYTHON_ENV).map(PathBuf::from),
            virtualenv_command: snapshot
                .var("VT_VIRTUALENV")
                .map_or(defaults.virtualenv_command, PathBuf::from),
            get_pip_url: snapshot
                .var("VT_GET_PIP_URL")
                .map_or(defaults.get_pip_url, ToOwned::to_owned),
            install_template: snapshot
                .var("VT_INSTALL_TEMPLATE")
                .map_or(defaults.install_template, ToOwned::to_owned),
            timeout_ms: snapshot
                .var("VT_SUBPROCESS_TIMEOUT")
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(|secs| secs.saturating_mul(1000)),
            max_capture_bytes: snapshot
                .var("VT_MAX_CAPTURE_BYTES")
                .and_then(|raw| raw.trim().parse::<usize>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(defaults.max_capture_bytes),
            temp_root: snapshot.var("VT_TEMP_ROOT").map(PathBuf::from),
        }
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            cwd: None,
            timeout: self.timeout(),
            max_capture_bytes: self.max_capture_bytes,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_ms = timeout.filter(|value| !value.is_zero()).map(|value| {
            // Sub-millisecond limits round up rather than disappearing.
            u64::try_from(value.as_millis()).unwrap_or(u64::MAX).max(1)
        });
        self
    }
}
