//! On-disk recognition of virtual environments.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

pub const BIN_DIR: &str = if cfg!(windows) { "Scripts" } else { "bin" };
pub const PYTHON_EXE: &str = if cfg!(windows) { "python.exe" } else { "python" };
pub const PYVENV_FILENAME: &str = "pyvenv.cfg";
pub const ACTIVATE_FILENAMES: [&str; 6] = [
    "activate",
    "activate.csh",
    "activate.fish",
    "activate_this.py",
    "activate.bat",
    "activate.ps1",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvKind {
    NotAnEnvironment,
    /// PEP 405 layout: `pyvenv.cfg` with a `home` key.
    Modern,
    /// virtualenv layout: an interpreter plus an activation script.
    Legacy,
}

impl EnvKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotAnEnvironment => "not-an-environment",
            Self::Modern => "modern",
            Self::Legacy => "legacy",
        }
    }
}

/// Classifies `path`. Reads the filesystem and nothing else.
///
/// A legacy-built environment that also carries a PEP 405 `pyvenv.cfg` is
/// reported as [`EnvKind::Modern`].
#[must_use]
pub fn classify(path: &Path) -> EnvKind {
    if is_pep_405_venv(path) {
        EnvKind::Modern
    } else if is_virtualenv(path) {
        EnvKind::Legacy
    } else {
        EnvKind::NotAnEnvironment
    }
}

#[must_use]
pub fn is_environment(path: &Path) -> bool {
    classify(path) != EnvKind::NotAnEnvironment
}

#[must_use]
pub fn bin_dir(env_dir: &Path) -> PathBuf {
    env_dir.join(BIN_DIR)
}

#[must_use]
pub fn interpreter_path(env_dir: &Path) -> PathBuf {
    bin_dir(env_dir).join(PYTHON_EXE)
}

fn is_pep_405_venv(path: &Path) -> bool {
    read_pyvenv_cfg(path).is_some_and(|cfg| cfg.home().is_some())
}

// `/usr` has `bin/python` too, so an activation script is required as well.
fn is_virtualenv(path: &Path) -> bool {
    let bin = bin_dir(path);
    bin.join(PYTHON_EXE).exists() && ACTIVATE_FILENAMES.iter().any(|name| bin.join(name).exists())
}

/// Parsed `pyvenv.cfg`, in file order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PyvenvCfg {
    entries: Vec<(String, String)>,
}

impl PyvenvCfg {
    #[must_use]
    pub fn parse(contents: &str) -> Self {
        let entries = contents
            .lines()
            .filter_map(|line| {
                // A line without `=` is a bare key.
                let (key, value) = line.split_once('=').unwrap_or((line, ""));
                let key = key.trim();
                (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
            })
            .collect();
        Self { entries }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn home(&self) -> Option<&str> {
        self.get("home")
    }

    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.get("version").or_else(|| self.get("version_info"))
    }

    #[must_use]
    pub fn include_system_site_packages(&self) -> Option<bool> {
        self.get("include-system-site-packages")
            .map(|value| value.eq_ignore_ascii_case("true"))
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Reads `env_dir/pyvenv.cfg`, returning `None` when it is missing or unreadable.
#[must_use]
pub fn read_pyvenv_cfg(env_dir: &Path) -> Option<PyvenvCfg> {
    let contents = fs::read_to_string(env_dir.join(PYVENV_FILENAME)).ok()?;
    Some(PyvenvCfg::parse(&contents))
}
