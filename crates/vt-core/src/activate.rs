//! Scoped activation of an environment in a [`ProcessEnv`].
//!
//! [`Venv`] describes what to activate; [`Venv::activate`] validates, records
//! the variables it is about to touch and hands back an [`ActiveVenv`] guard.
//! Dropping the guard (normal return, `?`, or a panic unwinding through it)
//! puts `PATH`, `PYTHONHOME` and `VIRTUAL_ENV` back exactly as recorded.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use tracing::{debug, warn};

use crate::builder::{BuildOptions, EnvBuilder};
use crate::config::Settings;
use crate::env::{ProcessEnv, PATH_VAR, PYTHONHOME_VAR, VIRTUAL_ENV_VAR};
use crate::error::VenvError;
use crate::layout::{bin_dir, interpreter_path, is_environment};
use crate::pathlist;
use crate::process::{run_command, run_command_passthrough, EnvOverride, RunOutput};

/// An environment to activate, optionally built first.
pub struct Venv {
    env_dir: PathBuf,
    builder: Option<(Box<dyn EnvBuilder>, BuildOptions)>,
    settings: Settings,
}

impl std::fmt::Debug for Venv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Venv")
            .field("env_dir", &self.env_dir)
            .field("builder", &self.builder.as_ref().map(|(b, _)| b.name()))
            .finish_non_exhaustive()
    }
}

impl Venv {
    #[must_use]
    pub fn new(env_dir: impl Into<PathBuf>) -> Self {
        Self {
            env_dir: env_dir.into(),
            builder: None,
            settings: Settings::default(),
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Builds the environment with `builder` on activation, before validating it.
    #[must_use]
    pub fn with_builder(mut self, builder: Box<dyn EnvBuilder>, options: BuildOptions) -> Self {
        self.builder = Some((builder, options));
        self
    }

    #[must_use]
    pub fn env_dir(&self) -> &Path {
        &self.env_dir
    }

    /// Activates the environment in `env`.
    ///
    /// Nothing in `env` is modified unless the directory is a recognized
    /// environment. Activating while `VIRTUAL_ENV` is already set logs a
    /// warning and proceeds.
    ///
    /// # Errors
    ///
    /// [`VenvError::ConstructionFailure`] when the configured builder fails,
    /// [`VenvError::NotAnEnvironment`] when the directory is not an environment.
    pub fn activate<'e>(&self, env: &'e mut dyn ProcessEnv) -> Result<ActiveVenv<'e>, VenvError> {
        let env_dir = std::path::absolute(&self.env_dir)
            .with_context(|| format!("failed to resolve {}", self.env_dir.display()))?;
        if let Some((builder, options)) = &self.builder {
            debug!(builder = builder.name(), env = %env_dir.display(), "building environment");
            builder.create(&env_dir, options)?;
        }
        if !is_environment(&env_dir) {
            return Err(VenvError::NotAnEnvironment { path: env_dir });
        }

        let record = ActivationRecord::capture(&*env);
        if let Some(outer) = &record.virtual_env {
            warn!(
                outer = %Path::new(outer).display(),
                env = %env_dir.display(),
                "activating inside another virtualenv; interpreter resolution may be surprising"
            );
        }

        let mut active = ActiveVenv {
            env,
            env_dir,
            record: Some(record),
            settings: self.settings.clone(),
        };
        active.apply()?;
        debug!(env = %active.env_dir.display(), "activated");
        Ok(active)
    }

    /// Runs `work` with the environment active, restoring the variables
    /// before returning whatever `work` returned.
    ///
    /// # Errors
    ///
    /// Activation errors, or the error returned by `work`.
    pub fn scope<T, E, F>(&self, env: &mut dyn ProcessEnv, work: F) -> Result<T, E>
    where
        E: From<VenvError>,
        F: FnOnce(&ActiveVenv<'_>) -> Result<T, E>,
    {
        let active = self.activate(env)?;
        let result = work(&active);
        active.deactivate();
        result
    }
}

/// Variable state captured before activation; the only input to restoration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivationRecord {
    pub path: Option<OsString>,
    pub python_home: Option<OsString>,
    pub virtual_env: Option<OsString>,
}

impl ActivationRecord {
    fn capture(env: &dyn ProcessEnv) -> Self {
        Self {
            path: env.get(PATH_VAR),
            python_home: env.get(PYTHONHOME_VAR),
            virtual_env: env.get(VIRTUAL_ENV_VAR),
        }
    }

    #[must_use]
    pub fn is_nested(&self) -> bool {
        self.virtual_env.is_some()
    }
}

/// What to run through the environment's interpreter: exactly one of a
/// module, a code string or a script, followed by `args`.
#[derive(Clone, Debug, Default)]
pub struct PythonArgs {
    pub module: Option<String>,
    pub code: Option<String>,
    pub script: Option<PathBuf>,
    pub args: Vec<OsString>,
}

impl PythonArgs {
    #[must_use]
    pub fn module(module: impl Into<String>) -> Self {
        Self {
            module: Some(module.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn script(script: impl Into<PathBuf>) -> Self {
        Self {
            script: Some(script.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub(crate) fn argv(&self) -> Result<Vec<OsString>, VenvError> {
        let supplied = usize::from(self.module.is_some())
            + usize::from(self.code.is_some())
            + usize::from(self.script.is_some());
        if supplied != 1 {
            return Err(VenvError::AmbiguousBuilderArguments { supplied });
        }
        let mut argv: Vec<OsString> = Vec::with_capacity(self.args.len() + 2);
        if let Some(module) = &self.module {
            argv.push("-m".into());
            argv.push(module.into());
        } else if let Some(code) = &self.code {
            argv.push("-c".into());
            argv.push(code.into());
        } else if let Some(script) = &self.script {
            argv.push(script.as_os_str().to_os_string());
        }
        argv.extend(self.args.iter().cloned());
        Ok(argv)
    }
}

/// An activated environment. Restores the recorded variables when dropped.
pub struct ActiveVenv<'e> {
    env: &'e mut dyn ProcessEnv,
    env_dir: PathBuf,
    record: Option<ActivationRecord>,
    settings: Settings,
}

impl std::fmt::Debug for ActiveVenv<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveVenv")
            .field("env_dir", &self.env_dir)
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

impl ActiveVenv<'_> {
    fn apply(&mut self) -> Result<(), VenvError> {
        pathlist::prepend(self.env, &bin_dir(&self.env_dir), PATH_VAR)?;
        if self.env.contains(PYTHONHOME_VAR) {
            self.env.unset(PYTHONHOME_VAR);
        }
        self.env.set(VIRTUAL_ENV_VAR, self.env_dir.as_os_str());
        Ok(())
    }

    fn restore(&mut self) {
        let Some(record) = self.record.take() else {
            return;
        };
        restore_var(self.env, PATH_VAR, record.path.as_deref());
        restore_var(self.env, PYTHONHOME_VAR, record.python_home.as_deref());
        self.env.unset(VIRTUAL_ENV_VAR);
        if let Some(outer) = &record.virtual_env {
            self.env.set(VIRTUAL_ENV_VAR, outer);
        }
        debug!(env = %self.env_dir.display(), "deactivated");
    }

    /// Restores the recorded variables now instead of at drop.
    pub fn deactivate(mut self) {
        self.restore();
    }

    #[must_use]
    pub fn env_dir(&self) -> &Path {
        &self.env_dir
    }

    #[must_use]
    pub fn record(&self) -> Option<&ActivationRecord> {
        self.record.as_ref()
    }

    /// Current value of `key` in the activated environment table.
    #[must_use]
    pub fn var(&self, key: &str) -> Option<OsString> {
        self.env.get(key)
    }

    #[must_use]
    pub fn python(&self) -> PathBuf {
        interpreter_path(&self.env_dir)
    }

    /// The activated variables, spelled out for a child process. Needed when
    /// the [`ProcessEnv`] is not the real process environment.
    #[must_use]
    pub fn child_env(&self) -> Vec<EnvOverride> {
        let mut envs = Vec::with_capacity(3);
        if let Some(path) = self.env.get(PATH_VAR) {
            envs.push(EnvOverride::Set(PATH_VAR.to_string(), path));
        }
        envs.push(EnvOverride::Set(
            VIRTUAL_ENV_VAR.to_string(),
            self.env_dir.as_os_str().to_os_string(),
        ));
        envs.push(EnvOverride::Remove(PYTHONHOME_VAR.to_string()));
        envs
    }

    /// Runs a module, code string or script through the environment's
    /// interpreter, capturing output.
    ///
    /// # Errors
    ///
    /// [`VenvError::AmbiguousBuilderArguments`] unless exactly one target is
    /// given; [`VenvError::SubprocessFailure`] on a non-zero exit or timeout.
    pub fn run_python(&self, args: &PythonArgs) -> Result<RunOutput, VenvError> {
        let argv = args.argv()?;
        self.run(&self.python(), &argv)
    }

    /// Installs `package` with the configured install command template.
    ///
    /// # Errors
    ///
    /// [`VenvError::SubprocessFailure`] when the installer fails.
    pub fn install(&self, package: &str) -> Result<RunOutput, VenvError> {
        let (program, args) = render_install_command(
            &self.settings.install_template,
            &self.python(),
            package,
        )?;
        self.run(&program, &args)
    }

    /// Runs any program with the environment's variables, capturing output.
    ///
    /// # Errors
    ///
    /// [`VenvError::SubprocessFailure`] on a non-zero exit or timeout.
    pub fn run(&self, program: &Path, args: &[OsString]) -> Result<RunOutput, VenvError> {
        let output = run_command(program, args, &self.child_env(), &self.settings.run_options())?;
        if output.success() {
            Ok(output)
        } else {
            Err(VenvError::SubprocessFailure {
                program: program.display().to_string(),
                code: output.code,
                output: output.combined(),
            })
        }
    }

    /// Runs a program with inherited stdio, returning its exit code.
    ///
    /// # Errors
    ///
    /// Returns an error when the program cannot be spawned.
    pub fn run_passthrough(
        &self,
        program: &Path,
        args: &[OsString],
    ) -> Result<Option<i32>, VenvError> {
        Ok(run_command_passthrough(
            program,
            args,
            &self.child_env(),
            &self.settings.run_options(),
        )?)
    }
}

impl Drop for ActiveVenv<'_> {
    fn drop(&mut self) {
        self.restore();
    }
}

fn restore_var(env: &mut dyn ProcessEnv, key: &str, value: Option<&OsStr>) {
    match value {
        Some(value) => env.set(key, value),
        None => env.unset(key),
    }
}

/// Expands `{python}` and `{package}` in a whitespace-separated template.
/// A token that is exactly a placeholder becomes one argument even if the
/// value has spaces.
fn render_install_command(
    template: &str,
    python: &Path,
    package: &str,
) -> Result<(PathBuf, Vec<OsString>), VenvError> {
    let python_text = python.to_string_lossy();
    let mut tokens = template.split_whitespace().map(|token| match token {
        "{python}" => python.as_os_str().to_os_string(),
        "{package}" => OsString::from(package),
        other => OsString::from(
            other
                .replace("{python}", &python_text)
                .replace("{package}", package),
        ),
    });
    let program = tokens
        .next()
        .ok_or_else(|| anyhow!("install template is empty"))?;
    Ok((PathBuf::from(program), tokens.collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::MemoryEnv;
    use crate::layout::{BIN_DIR, PYVENV_FILENAME};
    use anyhow::Result;
    use std::cell::RefCell;
    use std::fs;
    use std::panic::{self, AssertUnwindSafe};
    use std::rc::Rc;

    fn make_venv(root: &Path) -> Result<PathBuf> {
        let env_dir = root.join("e");
        fs::create_dir_all(env_dir.join(BIN_DIR))?;
        fs::write(env_dir.join(PYVENV_FILENAME), "home = /usr/bin\n")?;
        Ok(env_dir)
    }

    fn sep() -> &'static str {
        if cfg!(windows) {
            ";"
        } else {
            ":"
        }
    }

    fn tracked(env: &MemoryEnv) -> [Option<OsString>; 3] {
        [
            env.get(PATH_VAR),
            env.get(PYTHONHOME_VAR),
            env.get(VIRTUAL_ENV_VAR),
        ]
    }

    #[test]
    fn activation_prepends_bin_and_restores_exactly() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let env_dir = make_venv(temp.path())?;
        let original_path = format!("/a{}/b", sep());
        let mut env = MemoryEnv::with_vars(&[("PATH", original_path.as_str())]);

        {
            let active = Venv::new(&env_dir).activate(&mut env)?;
            let expected = format!(
                "{}{}{}",
                env_dir.join(BIN_DIR).display(),
                sep(),
                original_path
            );
            assert_eq!(active.var(PATH_VAR), Some(OsString::from(expected)));
            assert_eq!(
                active.var(VIRTUAL_ENV_VAR),
                Some(env_dir.as_os_str().to_os_string())
            );
            assert!(!active.record().is_some_and(ActivationRecord::is_nested));
        }

        assert_eq!(env.get(PATH_VAR), Some(OsString::from(original_path)));
        assert_eq!(env.get(VIRTUAL_ENV_VAR), None);
        Ok(())
    }

    #[test]
    fn restores_every_prior_state_combination() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let env_dir = make_venv(temp.path())?;
        let states: [&[(&str, &str)]; 5] = [
            &[],
            &[("PATH", "")],
            &[("PATH", "/usr/bin"), ("PYTHONHOME", "/opt/py")],
            &[("PYTHONHOME", "")],
            &[
                ("PATH", "/x"),
                ("PYTHONHOME", "/opt/py"),
                ("VIRTUAL_ENV", "/outer"),
            ],
        ];
        for pairs in states {
            let mut env = MemoryEnv::with_vars(pairs);
            let before = env.clone();
            {
                let active = Venv::new(&env_dir).activate(&mut env)?;
                assert_eq!(active.var(PYTHONHOME_VAR), None);
            }
            assert_eq!(env, before, "state {pairs:?}");
        }
        Ok(())
    }

    #[test]
    fn non_environment_fails_without_touching_variables() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let mut env = MemoryEnv::with_vars(&[
            ("PATH", "/a"),
            ("PYTHONHOME", "/opt/py"),
            ("VIRTUAL_ENV", "/outer"),
        ]);
        let before = tracked(&env);
        let err = Venv::new(temp.path())
            .activate(&mut env)
            .expect_err("empty dir is not an environment");
        assert!(matches!(err, VenvError::NotAnEnvironment { .. }));
        assert_eq!(tracked(&env), before);
        Ok(())
    }

    #[test]
    fn nested_activation_restores_outer_env() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let env_dir = make_venv(temp.path())?;
        let mut env = MemoryEnv::with_vars(&[("PATH", "/a"), ("VIRTUAL_ENV", "/outer")]);
        {
            let active = Venv::new(&env_dir).activate(&mut env)?;
            assert!(active.record().is_some_and(ActivationRecord::is_nested));
            assert_eq!(
                active.var(VIRTUAL_ENV_VAR),
                Some(env_dir.as_os_str().to_os_string())
            );
        }
        assert_eq!(env.get(VIRTUAL_ENV_VAR), Some(OsString::from("/outer")));
        Ok(())
    }

    #[test]
    fn scope_restores_when_work_fails() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let env_dir = make_venv(temp.path())?;
        let mut env = MemoryEnv::with_vars(&[("PATH", "/a")]);
        let before = env.clone();
        let result: Result<(), VenvError> = Venv::new(&env_dir).scope(&mut env, |active| {
            assert!(active.var(VIRTUAL_ENV_VAR).is_some());
            Err(VenvError::AmbiguousBuilderArguments { supplied: 0 })
        });
        assert!(result.is_err());
        assert_eq!(env, before);
        Ok(())
    }

    #[test]
    fn restores_when_a_panic_unwinds_through_the_guard() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let env_dir = make_venv(temp.path())?;
        let mut env = MemoryEnv::with_vars(&[("PATH", "/a"), ("PYTHONHOME", "/opt/py")]);
        let before = env.clone();
        let venv = Venv::new(&env_dir);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let _active = venv.activate(&mut env).expect("activation succeeds");
            panic!("work failed");
        }));
        assert!(outcome.is_err());
        assert_eq!(env, before);
        Ok(())
    }

    #[test]
    fn tolerates_variables_changed_during_the_scope() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let env_dir = make_venv(temp.path())?;
        let mut env = MemoryEnv::with_vars(&[("PATH", "/a")]);
        let before = env.clone();
        {
            let active = Venv::new(&env_dir).activate(&mut env)?;
            active.env.set(PATH_VAR, OsStr::new("/clobbered"));
            active.env.set(PYTHONHOME_VAR, OsStr::new("/late"));
        }
        assert_eq!(env, before);
        Ok(())
    }

    #[derive(Clone, Default)]
    struct RecordingBuilder {
        calls: Rc<RefCell<Vec<(PathBuf, BuildOptions)>>>,
    }

    impl EnvBuilder for RecordingBuilder {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn create(&self, env_dir: &Path, options: &BuildOptions) -> Result<(), VenvError> {
            fs::create_dir_all(env_dir.join(BIN_DIR))?;
            fs::write(env_dir.join(PYVENV_FILENAME), "home = /usr/bin\n")?;
            self.calls
                .borrow_mut()
                .push((env_dir.to_path_buf(), options.clone()));
            Ok(())
        }
    }

    #[test]
    fn builder_runs_before_validation() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let env_dir = temp.path().join("fresh");
        let builder = RecordingBuilder::default();
        let options = BuildOptions {
            system_site_packages: true,
            ..BuildOptions::default()
        };
        let mut env = MemoryEnv::new();
        {
            let venv = Venv::new(&env_dir).with_builder(Box::new(builder.clone()), options.clone());
            let active = venv.activate(&mut env)?;
            assert_eq!(active.env_dir(), env_dir.as_path());
        }
        let calls = builder.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (env_dir, options));
        assert_eq!(env, MemoryEnv::new());
        Ok(())
    }

    #[test]
    fn python_args_require_exactly_one_target() {
        let err = PythonArgs::default().argv().expect_err("nothing supplied");
        assert!(matches!(
            err,
            VenvError::AmbiguousBuilderArguments { supplied: 0 }
        ));

        let both = PythonArgs {
            module: Some("pip".into()),
            code: Some("print(1)".into()),
            ..PythonArgs::default()
        };
        assert!(matches!(
            both.argv(),
            Err(VenvError::AmbiguousBuilderArguments { supplied: 2 })
        ));
    }

    #[test]
    fn python_args_render_argv() -> Result<()> {
        assert_eq!(
            PythonArgs::module("pip").arg("--version").argv()?,
            [OsString::from("-m"), "pip".into(), "--version".into()]
        );
        assert_eq!(
            PythonArgs::code("print(1)").argv()?,
            [OsString::from("-c"), "print(1)".into()]
        );
        assert_eq!(
            PythonArgs::script("/tmp/s.py").arg("x").argv()?,
            [OsString::from("/tmp/s.py"), "x".into()]
        );
        Ok(())
    }

    #[test]
    fn install_template_expands_placeholders() -> Result<()> {
        let python = Path::new("/envs/my env/bin/python");
        let (program, args) =
            render_install_command("{python} -m pip install {package}", python, "requests")?;
        assert_eq!(program, python);
        assert_eq!(args, ["-m", "pip", "install", "requests"]);

        let (program, args) =
            render_install_command("uv pip install --python={python} {package}", python, "attrs")?;
        assert_eq!(program, PathBuf::from("uv"));
        assert_eq!(
            args,
            ["pip", "install", "--python=/envs/my env/bin/python", "attrs"]
        );

        assert!(render_install_command("   ", python, "attrs").is_err());
        Ok(())
    }

    #[test]
    fn child_env_carries_activation() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let env_dir = make_venv(temp.path())?;
        let mut env = MemoryEnv::with_vars(&[("PATH", "/a"), ("PYTHONHOME", "/opt/py")]);
        let active = Venv::new(&env_dir).activate(&mut env)?;
        let envs = active.child_env();
        assert!(envs.contains(&EnvOverride::Remove(PYTHONHOME_VAR.to_string())));
        assert!(envs.contains(&EnvOverride::Set(
            VIRTUAL_ENV_VAR.to_string(),
            env_dir.as_os_str().to_os_string()
        )));
        assert_eq!(active.python(), env_dir.join(BIN_DIR).join(crate::layout::PYTHON_EXE));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn run_python_uses_environment_interpreter() -> Result<()> {
        use crate::builder::testing::write_script;

        let temp = tempfile::tempdir()?;
        let env_dir = make_venv(temp.path())?;
        write_script(
            &env_dir.join(BIN_DIR).join("python"),
            "printf '%s|%s|%s' \"$VIRTUAL_ENV\" \"${PYTHONHOME-unset}\" \"$*\"\n",
        )?;
        let mut env = MemoryEnv::with_vars(&[("PATH", "/usr/bin:/bin"), ("PYTHONHOME", "/opt")]);
        let active = Venv::new(&env_dir).activate(&mut env)?;
        let output = active.run_python(&PythonArgs::code("print(1)"))?;
        assert_eq!(
            output.stdout,
            format!("{}|unset|-c print(1)", env_dir.display())
        );
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn failing_interpreter_call_is_subprocess_failure() -> Result<()> {
        use crate::builder::testing::write_script;

        let temp = tempfile::tempdir()?;
        let env_dir = make_venv(temp.path())?;
        write_script(
            &env_dir.join(BIN_DIR).join("python"),
            "echo 'ERROR: No matching distribution found' >&2\nexit 1\n",
        )?;
        let mut env = MemoryEnv::with_vars(&[("PATH", "/usr/bin:/bin")]);
        let active = Venv::new(&env_dir).activate(&mut env)?;
        let err = active
            .install("definitely-not-a-package")
            .expect_err("installer exits non-zero");
        match err {
            VenvError::SubprocessFailure { code, output, .. } => {
                assert_eq!(code, Some(1));
                assert!(output.contains("No matching distribution"));
            }
            other => panic!("unexpected error: {other}"),
        }
        Ok(())
    }
}
