//! Capabilities that materialize a new environment on disk, and the rules for
//! picking one.

use std::path::{Path, PathBuf};

use tracing::debug;
use vt_python::NativeVenv;

use crate::config::Settings;
use crate::error::VenvError;

mod stdlib;
mod virtualenv;

pub use stdlib::StdlibVenvBuilder;
pub use virtualenv::VirtualenvBuilder;

/// Something that can lay out an environment at a path.
pub trait EnvBuilder {
    fn name(&self) -> &'static str;

    /// Creates the environment at `env_dir`, blocking until done.
    ///
    /// # Errors
    ///
    /// Returns [`VenvError::ConstructionFailure`] when the underlying tool fails.
    fn create(&self, env_dir: &Path, options: &BuildOptions) -> Result<(), VenvError>;
}

impl<T: EnvBuilder + ?Sized> EnvBuilder for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn create(&self, env_dir: &Path, options: &BuildOptions) -> Result<(), VenvError> {
        (**self).create(env_dir, options)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BuildOptions {
    pub system_site_packages: bool,
    /// Wipe anything already at the target.
    pub clear: bool,
    pub with_pip: bool,
    /// stdlib `venv` only.
    pub symlinks: bool,
    /// stdlib `venv` only.
    pub upgrade: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuilderKind {
    Virtualenv,
    StdlibVenv,
}

/// Decides which builder to use. Pure over its inputs.
#[must_use]
pub fn select_builder(
    use_virtualenv: bool,
    explicit_python: Option<&Path>,
    native: &NativeVenv,
) -> BuilderKind {
    // stdlib venv can only clone the interpreter running it
    if explicit_python.is_some() || use_virtualenv {
        return BuilderKind::Virtualenv;
    }
    if native.is_usable() {
        BuilderKind::StdlibVenv
    } else {
        BuilderKind::Virtualenv
    }
}

/// Resolves an explicitly requested interpreter.
///
/// # Errors
///
/// Returns [`VenvError::ExecutableNotFound`] when `requested` is neither an
/// executable file nor found on `PATH`.
pub fn resolve_python(requested: &Path) -> Result<PathBuf, VenvError> {
    vt_python::resolve_executable(requested).ok_or_else(|| VenvError::ExecutableNotFound {
        requested: requested.to_path_buf(),
    })
}

/// Picks and instantiates the default builder for the given overrides.
///
/// The explicit interpreter is resolved first, so a bad path fails before
/// anything touches the filesystem.
///
/// # Errors
///
/// Returns [`VenvError::ExecutableNotFound`] for an unresolvable `python`.
pub fn default_builder(
    use_virtualenv: bool,
    python: Option<&Path>,
    settings: &Settings,
) -> Result<Box<dyn EnvBuilder>, VenvError> {
    let explicit = python.map(resolve_python).transpose()?;
    let host = host_interpreter(settings);
    let native = match (&explicit, use_virtualenv, &host) {
        (None, false, Some(host)) => vt_python::probe_native_venv(host),
        _ => NativeVenv::Unavailable,
    };
    let kind = select_builder(use_virtualenv, explicit.as_deref(), &native);
    debug!(?kind, ?explicit, ?native, "selected environment builder");
    Ok(match (kind, host) {
        (BuilderKind::StdlibVenv, Some(host)) => {
            Box::new(StdlibVenvBuilder::new(host, settings.clone()))
        }
        _ => Box::new(VirtualenvBuilder::new(explicit, settings.clone())),
    })
}

fn host_interpreter(settings: &Settings) -> Option<PathBuf> {
    settings
        .runtime_python
        .clone()
        .or_else(|| vt_python::detect_interpreter().ok())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::fs;
    use std::path::Path;

    use anyhow::Result;

    /// Writes an executable shell script.
    #[cfg(unix)]
    pub(crate) fn write_script(path: &Path, body: &str) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::write(path, format!("#!/bin/sh\n{body}"))?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
        Ok(())
    }

    /// A stand-in for `virtualenv`/`python -m venv` that lays out a PEP 405
    /// environment at its last argument.
    pub(crate) const FAKE_BUILDER: &str = r#"for target; do :; done
mkdir -p "$target/bin"
printf 'home = /usr/bin\n' > "$target/pyvenv.cfg"
printf '#!/bin/sh\n' > "$target/bin/python"
chmod +x "$target/bin/python"
echo "$@" > "$target/args.txt"
"#;
}
