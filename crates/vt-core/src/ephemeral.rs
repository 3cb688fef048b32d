//! Throwaway environments: built in a fresh temp dir, activated, deleted.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};

use crate::activate::{ActiveVenv, Venv};
use crate::builder::{default_builder, BuildOptions, EnvBuilder};
use crate::config::Settings;
use crate::env::ProcessEnv;
use crate::error::VenvError;

const TEMP_PREFIX: &str = "vt-venv-";

#[derive(Clone, Debug, Default)]
pub struct TemporaryVenvOptions {
    /// Build with `virtualenv` even when stdlib `venv` is usable.
    pub use_virtualenv: bool,
    /// Base interpreter; implies `virtualenv`.
    pub python: Option<PathBuf>,
    pub build: BuildOptions,
}

/// Factory for throwaway environments.
pub struct TemporaryVenv {
    builder: Box<dyn EnvBuilder>,
    build: BuildOptions,
    settings: Settings,
}

impl std::fmt::Debug for TemporaryVenv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemporaryVenv")
            .field("builder", &self.builder.name())
            .field("build", &self.build)
            .finish_non_exhaustive()
    }
}

impl TemporaryVenv {
    /// Selects a builder for `options`. Nothing is created on disk yet.
    ///
    /// # Errors
    ///
    /// [`VenvError::ExecutableNotFound`] when `options.python` cannot be resolved.
    pub fn new(options: TemporaryVenvOptions, settings: Settings) -> Result<Self, VenvError> {
        let builder = default_builder(options.use_virtualenv, options.python.as_deref(), &settings)?;
        Ok(Self::with_builder(builder, options.build, settings))
    }

    /// Uses `builder` regardless of any selection rule.
    #[must_use]
    pub fn with_builder(builder: Box<dyn EnvBuilder>, build: BuildOptions, settings: Settings) -> Self {
        Self {
            builder,
            build,
            settings,
        }
    }

    #[must_use]
    pub fn builder_name(&self) -> &'static str {
        self.builder.name()
    }

    /// Creates and activates a new environment in a unique temporary directory.
    ///
    /// `clear` is always passed to the builder: the directory already exists
    /// and stdlib `venv` refuses to populate a non-empty target otherwise.
    ///
    /// # Errors
    ///
    /// Builder and activation errors. The directory is removed before they
    /// are returned.
    pub fn enter<'e>(
        &self,
        env: &'e mut dyn ProcessEnv,
    ) -> Result<ActiveTemporaryVenv<'e>, VenvError> {
        let path = allocate_dir(self.settings.temp_root.as_deref())?;
        debug!(path = %path.display(), builder = self.builder.name(), "creating temporary environment");
        let options = BuildOptions {
            clear: true,
            ..self.build.clone()
        };
        let activated = self.builder.create(&path, &options).and_then(|()| {
            Venv::new(&path)
                .with_settings(self.settings.clone())
                .activate(env)
        });
        match activated {
            Ok(active) => Ok(ActiveTemporaryVenv {
                active: Some(active),
                path,
                removed: false,
            }),
            Err(err) => {
                if let Err(cleanup) = remove_env_dir(&path) {
                    warn!(%cleanup, "failed to clean up after temporary environment error");
                }
                Err(err)
            }
        }
    }

    /// Runs `work` inside a fresh environment, then deactivates and deletes it.
    ///
    /// # Errors
    ///
    /// Creation errors, the error returned by `work`, or a cleanup failure
    /// when `work` itself succeeded.
    pub fn scope<T, E, F>(&self, env: &mut dyn ProcessEnv, work: F) -> Result<T, E>
    where
        E: From<VenvError>,
        F: FnOnce(&ActiveTemporaryVenv<'_>) -> Result<T, E>,
    {
        let active = self.enter(env)?;
        let result = work(&active);
        let closed = active.close();
        let value = result?;
        closed?;
        Ok(value)
    }
}

fn allocate_dir(root: Option<&Path>) -> Result<PathBuf, VenvError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(TEMP_PREFIX);
    let dir = match root {
        Some(root) => {
            fs::create_dir_all(root)
                .with_context(|| format!("failed to create {}", root.display()))?;
            builder.tempdir_in(root)
        }
        None => builder.tempdir(),
    }
    .context("failed to allocate temporary environment directory")?;
    Ok(dir.keep())
}

fn remove_env_dir(path: &Path) -> Result<(), VenvError> {
    fs::remove_dir_all(path).map_err(|source| VenvError::Cleanup {
        path: path.to_path_buf(),
        source,
    })
}

/// A live throwaway environment. Deactivates, then deletes the directory,
/// on [`close`](Self::close) or drop.
pub struct ActiveTemporaryVenv<'e> {
    active: Option<ActiveVenv<'e>>,
    path: PathBuf,
    removed: bool,
}

impl std::fmt::Debug for ActiveTemporaryVenv<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveTemporaryVenv")
            .field("path", &self.path)
            .field("active", &self.active.is_some())
            .finish_non_exhaustive()
    }
}

impl<'e> ActiveTemporaryVenv<'e> {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The activation guard.
    ///
    /// # Panics
    ///
    /// Never while `self` is alive; the guard is only taken during teardown.
    #[must_use]
    pub fn venv(&self) -> &ActiveVenv<'e> {
        self.active
            .as_ref()
            .unwrap_or_else(|| unreachable!("temporary environment already torn down"))
    }

    /// Deactivates and deletes the directory.
    ///
    /// # Errors
    ///
    /// [`VenvError::Cleanup`] when the directory cannot be removed, including
    /// when something else already removed it.
    pub fn close(mut self) -> Result<(), VenvError> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<(), VenvError> {
        if let Some(active) = self.active.take() {
            active.deactivate();
        }
        if self.removed {
            return Ok(());
        }
        self.removed = true;
        remove_env_dir(&self.path)?;
        debug!(path = %self.path.display(), "removed temporary environment");
        Ok(())
    }
}

impl<'e> std::ops::Deref for ActiveTemporaryVenv<'e> {
    type Target = ActiveVenv<'e>;

    fn deref(&self) -> &Self::Target {
        self.venv()
    }
}

impl Drop for ActiveTemporaryVenv<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            warn!(%err, "temporary environment cleanup failed");
        }
    }
}
