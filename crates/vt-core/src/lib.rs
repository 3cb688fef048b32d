#![deny(clippy::all)]

//! Activation, classification and construction of Python virtual environments.

mod activate;
mod bootstrap;
mod builder;
mod config;
mod env;
mod ephemeral;
mod error;
mod layout;
pub mod pathlist;
mod process;

pub use crate::activate::{ActivationRecord, ActiveVenv, PythonArgs, Venv};
pub use crate::bootstrap::PipBootstrap;
pub use crate::builder::{
    default_builder, resolve_python, select_builder, BuildOptions, BuilderKind, EnvBuilder,
    StdlibVenvBuilder, VirtualenvBuilder,
};
pub use crate::config::{
    Settings, DEFAULT_GET_PIP_URL, DEFAULT_INSTALL_TEMPLATE, DEFAULT_VIRTUALENV,
};
pub use crate::env::{
    MemoryEnv, ProcessEnv, SystemEnv, PATH_VAR, PYTHONHOME_VAR, VIRTUAL_ENV_VAR,
};
pub use crate::ephemeral::{ActiveTemporaryVenv, TemporaryVenv, TemporaryVenvOptions};
pub use crate::error::VenvError;
pub use crate::layout::{
    bin_dir, classify, interpreter_path, is_environment, read_pyvenv_cfg, EnvKind, PyvenvCfg,
    ACTIVATE_FILENAMES, BIN_DIR, PYTHON_EXE, PYVENV_FILENAME,
};
pub use crate::process::{EnvOverride, RunOptions, RunOutput, DEFAULT_MAX_CAPTURE_BYTES};
pub use vt_python::{probe_native_venv, NativeVenv};
