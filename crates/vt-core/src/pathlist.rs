//! Edits to `pathsep`-delimited search-path variables such as `PATH`.

use std::env;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::env::ProcessEnv;

/// Removes every occurrence of `entry` from `var`. An unset variable stays unset.
///
/// # Errors
///
/// Returns an error when a remaining entry contains the path separator and the
/// list cannot be joined back together.
pub fn remove(env: &mut dyn ProcessEnv, entry: &Path, var: &str) -> Result<()> {
    let Some(current) = env.get(var) else {
        return Ok(());
    };
    let remaining = entries_without(&current, entry);
    store(env, var, remaining)
}

/// Moves `entry` to the front of `var`, dropping any other occurrence.
///
/// # Errors
///
/// Returns an error when `entry` contains the path separator.
pub fn prepend(env: &mut dyn ProcessEnv, entry: &Path, var: &str) -> Result<()> {
    let mut entries = env
        .get(var)
        .map(|current| entries_without(&current, entry))
        .unwrap_or_default();
    entries.insert(0, entry.to_path_buf());
    store(env, var, entries)
}

/// Moves `entry` to the end of `var`, dropping any other occurrence.
///
/// # Errors
///
/// Returns an error when `entry` contains the path separator.
pub fn append(env: &mut dyn ProcessEnv, entry: &Path, var: &str) -> Result<()> {
    let mut entries = env
        .get(var)
        .map(|current| entries_without(&current, entry))
        .unwrap_or_default();
    entries.push(entry.to_path_buf());
    store(env, var, entries)
}

// An empty value is the empty list; `split_paths` would report one empty entry,
// which means "current directory" to most shells.
fn entries_without(current: &OsStr, entry: &Path) -> Vec<PathBuf> {
    if current.is_empty() {
        return Vec::new();
    }
    env::split_paths(current)
        .filter(|existing| existing.as_path() != entry)
        .collect()
}

fn store(env: &mut dyn ProcessEnv, var: &str, entries: Vec<PathBuf>) -> Result<()> {
    let joined: OsString =
        env::join_paths(entries).with_context(|| format!("failed to rebuild {var}"))?;
    env.set(var, &joined);
    Ok(())
}
