use std::collections::BTreeMap;
use std::env;
use std::ffi::{OsStr, OsString};

pub const PATH_VAR: &str = "PATH";
pub const PYTHONHOME_VAR: &str = "PYTHONHOME";
pub const VIRTUAL_ENV_VAR: &str = "VIRTUAL_ENV";

/// Read/write access to a set of environment variables.
///
/// Activation goes through this seam instead of `std::env` so the save/restore
/// sequence can run against an in-memory table.
pub trait ProcessEnv {
    fn get(&self, key: &str) -> Option<OsString>;
    fn set(&mut self, key: &str, value: &OsStr);
    fn unset(&mut self, key: &str);

    fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

/// The real process environment. Not synchronized: two threads activating
/// environments at once will clobber each other.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEnv;

impl ProcessEnv for SystemEnv {
    fn get(&self, key: &str) -> Option<OsString> {
        env::var_os(key)
    }

    fn set(&mut self, key: &str, value: &OsStr) {
        env::set_var(key, value);
    }

    fn unset(&mut self, key: &str) {
        env::remove_var(key);
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemoryEnv {
    vars: BTreeMap<String, OsString>,
}

impl MemoryEnv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the current process environment.
    #[must_use]
    pub fn capture() -> Self {
        Self {
            vars: env::vars_os()
                .filter_map(|(key, value)| key.into_string().ok().map(|key| (key, value)))
                .collect(),
        }
    }

    #[must_use]
    pub fn with_vars(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), OsString::from(*v)))
            .collect();
        Self { vars }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OsStr)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_os_str()))
    }
}

impl ProcessEnv for MemoryEnv {
    fn get(&self, key: &str) -> Option<OsString> {
        self.vars.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &OsStr) {
        self.vars.insert(key.to_string(), value.to_os_string());
    }

    fn unset(&mut self, key: &str) {
        self.vars.remove(key);
    }
}
