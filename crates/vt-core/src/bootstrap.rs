//! Downloading and running `get-pip.py` against a fresh environment.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::VenvError;
use crate::process::{run_command, EnvOverride};

const USER_AGENT: &str = concat!("vt/", env!("CARGO_PKG_VERSION"));
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
const GET_PIP_FILENAME: &str = "get-pip.py";

/// Outcome of the pip bootstrap hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipBootstrap {
    Installed,
    /// `get-pip.py` ran but failed; the environment itself is usable.
    Failed { code: Option<i32>, output: String },
}

pub(crate) fn http_client() -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("failed to build http client")
}

/// The downloaded script, deleted together with its directory on drop.
pub(crate) struct BootstrapScript {
    _dir: TempDir,
    path: PathBuf,
}

impl BootstrapScript {
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

pub(crate) fn download_get_pip(client: &Client, url: &str) -> Result<BootstrapScript> {
    let dir = tempfile::Builder::new()
        .prefix("vt-get-pip-")
        .tempdir()
        .context("failed to create temp dir for get-pip.py")?;
    let path = dir.path().join(GET_PIP_FILENAME);
    debug!(%url, "downloading pip bootstrap");
    let response = client
        .get(url)
        .send()
        .with_context(|| format!("failed to download {url}"))?
        .error_for_status()
        .with_context(|| format!("failed to download {url}"))?;
    let body = response
        .bytes()
        .with_context(|| format!("failed to read response from {url}"))?;
    fs::write(&path, &body).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(BootstrapScript { _dir: dir, path })
}

/// Installs pip into the environment whose interpreter is `python`.
///
/// A failed download is fatal. A failing `get-pip.py` is logged and reported
/// as [`PipBootstrap::Failed`].
pub(crate) fn bootstrap_pip(
    python: &Path,
    env_dir: &Path,
    settings: &Settings,
) -> Result<PipBootstrap, VenvError> {
    let script = http_client()
        .and_then(|client| download_get_pip(&client, &settings.get_pip_url))
        .map_err(|err| VenvError::ConstructionFailure {
            builder: "get-pip",
            output: format!("{err:#}"),
        })?;
    let envs = [
        EnvOverride::Set("VIRTUAL_ENV".into(), env_dir.as_os_str().to_os_string()),
        EnvOverride::Remove("PYTHONHOME".into()),
    ];
    let args: [OsString; 1] = [script.path().as_os_str().to_os_string()];
    let output = run_command(python, &args, &envs, &settings.run_options()).map_err(|err| {
        VenvError::ConstructionFailure {
            builder: "get-pip",
            output: format!("{err:#}"),
        }
    })?;
    if output.success() {
        return Ok(PipBootstrap::Installed);
    }
    let combined = output.combined();
    warn!(
        code = ?output.code,
        env = %env_dir.display(),
        "get-pip.py failed; environment left without pip\n{combined}"
    );
    Ok(PipBootstrap::Failed {
        code: output.code,
        output: combined,
    })
}
