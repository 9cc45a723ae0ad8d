//! Path resolution for sshframe
//!
//! Follows XDG Base Directory Specification with env var overrides.
//!
//! ```text
//! ~/.local/share/sshframe/     (XDG_DATA_HOME)
//! └── host_key
//!
//! ~/.config/sshframe/          (XDG_CONFIG_HOME)
//! └── sshframe.toml
//! ```
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `SSHFRAME_CONFIG` | Config file | `~/.config/sshframe/sshframe.toml` |
//! | `SSHFRAME_HOST_KEY` | Host key path | `~/.local/share/sshframe/host_key` |

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

/// `$XDG_*/sshframe`, else `$HOME/<fallback>/sshframe`, else the
/// working directory.
fn xdg_dir(var: &str, fallback: &str) -> PathBuf {
    match (std::env::var_os(var), std::env::var_os("HOME")) {
        (Some(xdg), _) if !xdg.is_empty() => PathBuf::from(xdg).join("sshframe"),
        (_, Some(home)) => PathBuf::from(home).join(fallback).join("sshframe"),
        _ => PathBuf::from("."),
    }
}

pub fn data_dir() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", ".local/share")
}

pub fn config_dir() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config")
}

pub fn config_path() -> PathBuf {
    std::env::var_os("SSHFRAME_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| config_dir().join("sshframe.toml"))
}

pub fn host_key_path() -> PathBuf {
    std::env::var_os("SSHFRAME_HOST_KEY")
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir().join("host_key"))
}

/// Create the parent directory of `path` if needed.
pub fn ensure_parent(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() || parent.exists() {
        return Ok(());
    }
    debug!("creating directory: {}", parent.display());
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory: {}", parent.display()))
}

pub fn log_paths() {
    info!(
        config = %config_path().display(),
        host_key = %host_key_path().display(),
        "resolved paths"
    );
}
