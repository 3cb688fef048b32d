use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use serde::Serialize;
use serde_json::json;
use tracing::debug;
use vt_core::{
    classify, read_pyvenv_cfg, BuildOptions, EnvKind, PyvenvCfg, Settings, SystemEnv,
    TemporaryVenv, TemporaryVenvOptions, Venv, VenvError,
};

mod cli;
mod style;

use cli::{CommandCli, ExecArgs, InspectArgs, ScratchArgs, VtCli};
use style::{Status, Style};

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = VtCli::parse();
    init_tracing(cli.trace, cli.verbose);

    let style = Style::new(cli.no_color, std::io::stdout().is_terminal());
    let settings = Settings::from_env();
    let outcome = match &cli.command {
        CommandCli::Inspect(args) => inspect(&cli, &style, args),
        CommandCli::Exec(args) => exec(args, settings),
        CommandCli::Scratch(args) => scratch(args, settings),
        CommandCli::Config => print_config(&settings),
    };
    let code = match outcome {
        Ok(code) => code,
        Err(err) => report_error(&cli, &style, &err)?,
    };

    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}

fn init_tracing(trace: bool, verbose: u8) {
    let level = if trace {
        "trace"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("vt_core={level},vt_python={level},vt_cli={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Exit status for an error that escaped a command.
fn exit_code(err: &VenvError) -> i32 {
    if err.is_user_error() {
        1
    } else {
        2
    }
}

fn report_error(cli: &VtCli, style: &Style, err: &VenvError) -> Result<i32> {
    let code = exit_code(err);
    if cli.json {
        let payload = json!({
            "status": if code == 1 { "user-error" } else { "failure" },
            "code": err.code(),
            "message": err.to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        let status = if code == 1 {
            Status::UserError
        } else {
            Status::Failure
        };
        eprintln!("{}", style.status(status, &err.to_string()));
    }
    Ok(code)
}

#[derive(Serialize)]
struct InspectReport<'a> {
    path: &'a Path,
    kind: EnvKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    home: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    include_system_site_packages: Option<bool>,
}

impl<'a> InspectReport<'a> {
    fn new(path: &'a Path, kind: EnvKind, cfg: Option<&'a PyvenvCfg>) -> Self {
        Self {
            path,
            kind,
            home: cfg.and_then(PyvenvCfg::home),
            version: cfg.and_then(PyvenvCfg::version),
            include_system_site_packages: cfg.and_then(PyvenvCfg::include_system_site_packages),
        }
    }
}

fn inspect(cli: &VtCli, style: &Style, args: &InspectArgs) -> Result<i32, VenvError> {
    let kind = classify(&args.path);
    let cfg = match kind {
        EnvKind::Modern => read_pyvenv_cfg(&args.path),
        _ => None,
    };
    let report = InspectReport::new(&args.path, kind, cfg.as_ref());

    if cli.json {
        let rendered = serde_json::to_string_pretty(&report).map_err(anyhow::Error::from)?;
        println!("{rendered}");
        return Ok(0);
    }

    let summary = format!("{}: {}", args.path.display(), describe_kind(kind));
    let status = match kind {
        EnvKind::NotAnEnvironment => Status::UserError,
        _ => Status::Ok,
    };
    println!("{}", style.status(status, &summary));
    if let Some(home) = report.home {
        println!("{}", style.info(&format!("  home: {home}")));
    }
    if let Some(version) = report.version {
        println!("{}", style.info(&format!("  version: {version}")));
    }
    if let Some(system) = report.include_system_site_packages {
        println!("{}", style.info(&format!("  system site-packages: {system}")));
    }
    Ok(0)
}

fn describe_kind(kind: EnvKind) -> &'static str {
    match kind {
        EnvKind::Modern => "venv (pyvenv.cfg)",
        EnvKind::Legacy => "virtualenv (activation scripts)",
        EnvKind::NotAnEnvironment => "not a venv/virtualenv",
    }
}

fn exec(args: &ExecArgs, settings: Settings) -> Result<i32, VenvError> {
    let (program, rest) = split_command(&args.command)?;
    let mut env = SystemEnv;
    let active = Venv::new(&args.path)
        .with_settings(settings)
        .activate(&mut env)?;
    debug!(env = %active.env_dir().display(), program = %program.display(), "exec");
    let code = active.run_passthrough(&program, rest)?;
    Ok(child_exit_code(code))
}

fn scratch(args: &ScratchArgs, settings: Settings) -> Result<i32, VenvError> {
    let settings = match args.timeout {
        Some(secs) => settings.with_timeout(Some(Duration::from_secs(secs))),
        None => settings,
    };
    let options = TemporaryVenvOptions {
        use_virtualenv: args.virtualenv,
        python: args.python.clone(),
        build: BuildOptions {
            system_site_packages: args.system_site_packages,
            with_pip: args.with_pip,
            ..BuildOptions::default()
        },
    };
    let (program, rest) = split_command(&args.command)?;
    let factory = TemporaryVenv::new(options, settings)?;
    debug!(builder = factory.builder_name(), "scratch environment");

    let mut env = SystemEnv;
    factory.scope(&mut env, |active| {
        for package in &args.install {
            active.venv().install(package)?;
        }
        let code = active.venv().run_passthrough(&program, rest)?;
        Ok(child_exit_code(code))
    })
}

fn split_command(command: &[OsString]) -> Result<(PathBuf, &[OsString]), VenvError> {
    match command.split_first() {
        Some((program, rest)) => Ok((PathBuf::from(program), rest)),
        None => Err(anyhow::anyhow!("no command given").into()),
    }
}

// Killed by a signal: no status to forward.
fn child_exit_code(code: Option<i32>) -> i32 {
    code.unwrap_or(2)
}

fn print_config(settings: &Settings) -> Result<i32, VenvError> {
    let rendered = serde_json::to_string_pretty(settings).map_err(anyhow::Error::from)?;
    println!("{rendered}");
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_errors_exit_with_one() {
        let err = VenvError::NotAnEnvironment {
            path: PathBuf::from("/nowhere"),
        };
        assert_eq!(exit_code(&err), 1);
        let err = VenvError::AmbiguousBuilderArguments { supplied: 0 };
        assert_eq!(exit_code(&err), 1);
    }

    #[test]
    fn other_errors_exit_with_two() {
        let err = VenvError::ConstructionFailure {
            builder: "virtualenv",
            output: String::new(),
        };
        assert_eq!(exit_code(&err), 2);
        assert_eq!(child_exit_code(None), 2);
        assert_eq!(child_exit_code(Some(7)), 7);
    }

    #[test]
    fn split_command_separates_program() {
        let command = vec![OsString::from("python"), OsString::from("-V")];
        let (program, rest) = split_command(&command).expect("non-empty");
        assert_eq!(program, PathBuf::from("python"));
        assert_eq!(rest, [OsString::from("-V")]);
        assert!(split_command(&[]).is_err());
    }
}
