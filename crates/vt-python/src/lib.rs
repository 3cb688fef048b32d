#![deny(clippy::all)]

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use pep440_rs::Version;
use tracing::debug;

pub const RUNTIME_PYTHON_ENV: &str = "VT_RUNTIME_PYTHON";

const NATIVE_VENV_PROBE: &str = "import platform, venv; print(platform.python_version())";

/// Detects the interpreter environments are built from.
///
/// # Errors
///
/// Returns an error when no interpreter can be found on `PATH` and
/// `VT_RUNTIME_PYTHON` is unset.
pub fn detect_interpreter() -> Result<PathBuf> {
    if let Some(explicit) = env::var_os(RUNTIME_PYTHON_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(explicit));
    }

    for candidate in ["python3", "python"] {
        if let Ok(path) = which::which(candidate) {
            return Ok(path);
        }
    }

    bail!("no python interpreter found; set {RUNTIME_PYTHON_ENV}")
}

/// Resolves a caller-supplied interpreter to an executable on disk.
///
/// An existing executable file is returned untouched; anything else is looked
/// up on `PATH` (so bare names like `python3.12` work).
#[must_use]
pub fn resolve_executable(requested: &Path) -> Option<PathBuf> {
    if is_executable_file(requested) {
        return Some(requested.to_path_buf());
    }
    which::which(requested).ok()
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}

/// Whether an interpreter ships the stdlib `venv` module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NativeVenv {
    Unavailable,
    Available { version: Version },
}

impl NativeVenv {
    /// The 3.3 series shipped `venv` without the post-setup hook pip
    /// bootstrapping relies on.
    #[must_use]
    pub fn is_defective(&self) -> bool {
        match self {
            Self::Unavailable => false,
            Self::Available { version } => version.release().starts_with(&[3, 3]),
        }
    }

    #[must_use]
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Available { .. }) && !self.is_defective()
    }

    #[must_use]
    pub fn version(&self) -> Option<&Version> {
        match self {
            Self::Unavailable => None,
            Self::Available { version } => Some(version),
        }
    }
}

/// Asks `python` whether it can `import venv`, reporting its version.
///
/// Any failure to run the interpreter or parse its answer counts as
/// [`NativeVenv::Unavailable`].
#[must_use]
pub fn probe_native_venv(python: &Path) -> NativeVenv {
    match run_probe(python) {
        Ok(version) => {
            debug!(python = %python.display(), %version, "stdlib venv available");
            NativeVenv::Available { version }
        }
        Err(err) => {
            debug!(python = %python.display(), %err, "stdlib venv unavailable");
            NativeVenv::Unavailable
        }
    }
}

fn run_probe(python: &Path) -> Result<Version> {
    let output = Command::new(python)
        .arg("-c")
        .arg(NATIVE_VENV_PROBE)
        .output()
        .with_context(|| format!("failed to probe {}", python.display()))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("venv probe failed: {}", stderr.trim());
    }
    parse_version(&String::from_utf8_lossy(&output.stdout))
}

fn parse_version(raw: &str) -> Result<Version> {
    let trimmed = raw.trim();
    Version::from_str(trimmed).map_err(|err| anyhow!("invalid python version `{trimmed}`: {err}"))
}
