use std::ffi::OsString;
use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

pub const VT_BEFORE_HELP: &str = concat!(
    "vt ",
    env!("CARGO_PKG_VERSION"),
    " – Python virtual environment toolkit\n\n",
    "  inspect          Classify a directory and summarise its pyvenv.cfg.\n",
    "  exec             Run a command with an existing environment activated.\n",
    "  scratch          Run a command in a throwaway environment.\n",
    "  config           Print the effective settings as JSON.\n",
);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    propagate_version = false,
    disable_help_subcommand = true,
    before_help = VT_BEFORE_HELP
)]
pub struct VtCli {
    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)", global = true)]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v", global = true)]
    pub trace: bool,
    #[arg(long, help = "Emit machine-readable JSON", global = true)]
    pub json: bool,
    #[arg(long, help = "Disable colored human output", global = true)]
    pub no_color: bool,
    #[command(subcommand)]
    pub command: CommandCli,
}

#[derive(Subcommand, Debug)]
pub enum CommandCli {
    #[command(about = "Classify a directory as venv, virtualenv or neither.")]
    Inspect(InspectArgs),
    #[command(
        about = "Run a command with an existing environment activated.",
        override_usage = "vt exec <PATH> -- <CMD> [ARGS...]"
    )]
    Exec(ExecArgs),
    #[command(
        about = "Run a command in a throwaway environment that is deleted afterwards.",
        override_usage = "vt scratch [OPTIONS] -- <CMD> [ARGS...]"
    )]
    Scratch(ScratchArgs),
    #[command(about = "Print the effective settings as JSON.")]
    Config,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    pub path: PathBuf,
}

#[derive(Args, Debug)]
pub struct ExecArgs {
    pub path: PathBuf,
    #[arg(last = true, required = true, num_args = 1..)]
    pub command: Vec<OsString>,
}

#[derive(Args, Debug)]
#[allow(clippy::struct_excessive_bools)]
pub struct ScratchArgs {
    #[arg(long, help = "Build with virtualenv even when python -m venv works")]
    pub virtualenv: bool,
    #[arg(long, value_name = "PYTHON", help = "Base interpreter (implies --virtualenv)")]
    pub python: Option<PathBuf>,
    #[arg(long, help = "Bootstrap pip into the environment")]
    pub with_pip: bool,
    #[arg(long, help = "Give the environment access to the system site-packages")]
    pub system_site_packages: bool,
    #[arg(long = "install", value_name = "PKG", help = "Install a package before running")]
    pub install: Vec<String>,
    #[arg(long, value_name = "SECS", help = "Per-subprocess timeout for builders and installs")]
    pub timeout: Option<u64>,
    #[arg(last = true, required = true, num_args = 1..)]
    pub command: Vec<OsString>,
}
