use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::bootstrap::bootstrap_pip;
use crate::config::Settings;
use crate::error::VenvError;
use crate::layout::interpreter_path;
use crate::process::{run_command, EnvOverride};

use super::{BuildOptions, EnvBuilder};

/// Builds environments with the interpreter's own `venv` module.
///
/// pip is never installed by `venv` itself. With `with_pip`, `get-pip.py` is
/// downloaded and run against the new environment afterwards; a failure of
/// that script is logged and does not fail `create`.
#[derive(Clone, Debug)]
pub struct StdlibVenvBuilder {
    python: PathBuf,
    settings: Settings,
}

impl StdlibVenvBuilder {
    #[must_use]
    pub fn new(python: PathBuf, settings: Settings) -> Self {
        Self { python, settings }
    }

    pub(crate) fn args(env_dir: &Path, options: &BuildOptions) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-m".into(), "venv".into()];
        if options.system_site_packages {
            args.push("--system-site-packages".into());
        }
        if options.clear {
            args.push("--clear".into());
        }
        if options.symlinks {
            args.push("--symlinks".into());
        }
        if options.upgrade {
            args.push("--upgrade".into());
        }
        args.push("--without-pip".into());
        args.push(env_dir.as_os_str().to_os_string());
        args
    }

    fn post_setup(&self, env_dir: &Path, options: &BuildOptions) -> Result<(), VenvError> {
        if !options.with_pip {
            return Ok(());
        }
        bootstrap_pip(&interpreter_path(env_dir), env_dir, &self.settings).map(|_| ())
    }
}

impl EnvBuilder for StdlibVenvBuilder {
    fn name(&self) -> &'static str {
        "venv"
    }

    fn create(&self, env_dir: &Path, options: &BuildOptions) -> Result<(), VenvError> {
        let args = Self::args(env_dir, options);
        // a PYTHONHOME inherited from the caller would redirect the new env's stdlib
        let envs = [EnvOverride::Remove("PYTHONHOME".into())];
        let output = run_command(&self.python, &args, &envs, &self.settings.run_options())
            .map_err(|err| VenvError::ConstructionFailure {
                builder: self.name(),
                output: format!("{err:#}"),
            })?;
        if !output.success() {
            return Err(VenvError::ConstructionFailure {
                builder: self.name(),
                output: output.combined(),
            });
        }
        self.post_setup(env_dir, options)
    }
}
