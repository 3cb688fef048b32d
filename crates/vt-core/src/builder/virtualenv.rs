use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::config::Settings;
use crate::error::VenvError;
use crate::process::run_command;

use super::{BuildOptions, EnvBuilder};

/// Builds environments by shelling out to `virtualenv`.
#[derive(Clone, Debug)]
pub struct VirtualenvBuilder {
    python: Option<PathBuf>,
    settings: Settings,
}

impl VirtualenvBuilder {
    /// `python` is the interpreter to base environments on; `None` uses the
    /// detected runtime interpreter, or lets `virtualenv` choose.
    #[must_use]
    pub fn new(python: Option<PathBuf>, settings: Settings) -> Self {
        Self { python, settings }
    }

    fn base_python(&self) -> Option<PathBuf> {
        self.python
            .clone()
            .or_else(|| self.settings.runtime_python.clone())
            .or_else(|| vt_python::detect_interpreter().ok())
    }

    pub(crate) fn args(&self, env_dir: &Path, options: &BuildOptions) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        if options.system_site_packages {
            args.push("--system-site-packages".into());
        }
        if options.clear {
            args.push("--clear".into());
        }
        if let Some(python) = self.base_python() {
            args.push("--python".into());
            args.push(python.into_os_string());
        }
        if !options.with_pip {
            args.push("--no-setuptools".into());
            args.push("--no-pip".into());
        }
        args.push(env_dir.as_os_str().to_os_string());
        args
    }
}

impl EnvBuilder for VirtualenvBuilder {
    fn name(&self) -> &'static str {
        "virtualenv"
    }

    fn create(&self, env_dir: &Path, options: &BuildOptions) -> Result<(), VenvError> {
        let args = self.args(env_dir, options);
        let output = run_command(
            &self.settings.virtualenv_command,
            &args,
            &[],
            &self.settings.run_options(),
        )
        .map_err(|err| VenvError::ConstructionFailure {
            builder: self.name(),
            output: format!("{err:#}"),
        })?;
        if output.success() {
            Ok(())
        } else {
            Err(VenvError::ConstructionFailure {
                builder: self.name(),
                output: output.combined(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn args_encode_every_option() {
        let builder = VirtualenvBuilder::new(
            Some(PathBuf::from("/opt/py/bin/python3")),
            Settings::default(),
        );
        let options = BuildOptions {
            system_site_packages: true,
            clear: true,
            ..BuildOptions::default()
        };
        assert_eq!(
            strings(&builder.args(Path::new("/tmp/env"), &options)),
            [
                "--system-site-packages",
                "--clear",
                "--python",
                "/opt/py/bin/python3",
                "--no-setuptools",
                "--no-pip",
                "/tmp/env",
            ]
        );
    }

    #[test]
    fn with_pip_drops_suppression_flags() {
        let builder = VirtualenvBuilder::new(
            Some(PathBuf::from("/opt/py/bin/python3")),
            Settings::default(),
        );
        let options = BuildOptions {
            with_pip: true,
            ..BuildOptions::default()
        };
        let args = strings(&builder.args(Path::new("/tmp/env"), &options));
        assert!(!args.iter().any(|arg| arg == "--no-pip"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/env"));
    }

    #[test]
    fn runtime_python_setting_is_the_fallback_base() {
        let settings = Settings {
            runtime_python: Some(PathBuf::from("/usr/bin/python3.11")),
            ..Settings::default()
        };
        let builder = VirtualenvBuilder::new(None, settings);
        let args = strings(&builder.args(Path::new("/tmp/env"), &BuildOptions::default()));
        assert_eq!(args[0..2], ["--python", "/usr/bin/python3.11"]);
    }

    #[cfg(unix)]
    #[test]
    fn create_runs_configured_tool() -> Result<()> {
        use crate::builder::testing::{write_script, FAKE_BUILDER};
        use crate::layout::{classify, EnvKind};

        let temp = tempfile::tempdir()?;
        let tool = temp.path().join("fake-virtualenv");
        write_script(&tool, FAKE_BUILDER)?;
        let settings = Settings {
            virtualenv_command: tool,
            runtime_python: Some(PathBuf::from("/usr/bin/python3")),
            ..Settings::default()
        };
        let env_dir = temp.path().join("env");
        VirtualenvBuilder::new(None, settings).create(
            &env_dir,
            &BuildOptions {
                clear: true,
                ..BuildOptions::default()
            },
        )?;
        assert_eq!(classify(&env_dir), EnvKind::Modern);
        let recorded = std::fs::read_to_string(env_dir.join("args.txt"))?;
        assert!(recorded.contains("--clear --python /usr/bin/python3 --no-setuptools --no-pip"));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_construction_failure() -> Result<()> {
        use crate::builder::testing::write_script;

        let temp = tempfile::tempdir()?;
        let tool = temp.path().join("broken-virtualenv");
        write_script(&tool, "echo 'RuntimeError: failed to find interpreter' >&2\nexit 1\n")?;
        let settings = Settings {
            virtualenv_command: tool,
            ..Settings::default()
        };
        let err = VirtualenvBuilder::new(None, settings)
            .create(&temp.path().join("env"), &BuildOptions::default())
            .expect_err("tool exits non-zero");
        match err {
            VenvError::ConstructionFailure { builder, output } => {
                assert_eq!(builder, "virtualenv");
                assert!(output.contains("failed to find interpreter"));
            }
            other => panic!("unexpected error: {other}"),
        }
        Ok(())
    }

    #[test]
    fn missing_tool_is_construction_failure() {
        let settings = Settings {
            virtualenv_command: PathBuf::from("/definitely/not/virtualenv"),
            ..Settings::default()
        };
        let err = VirtualenvBuilder::new(None, settings)
            .create(Path::new("/tmp/never-created"), &BuildOptions::default())
            .expect_err("spawn should fail");
        assert_eq!(err.code(), "VT200");
    }
}
