//! User configuration discovery for crosspulse.
//!
//! User config location: $XDG_CONFIG_HOME/crosspulse/crosspulse.toml
//! Fallback: the platform config directory reported by `dirs`.

use std::path::PathBuf;

const APP_DIR: &str = "crosspulse";
const CONFIG_FILE: &str = "crosspulse.toml";

/// Returns the path to the user configuration file.
///
/// The path is determined by:
/// 1. If $XDG_CONFIG_HOME is set and non-empty: $XDG_CONFIG_HOME/crosspulse/crosspulse.toml
/// 2. Otherwise: `dirs::config_dir()`/crosspulse/crosspulse.toml
///
/// Returns None if no config directory can be determined.
pub fn user_config_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::config_dir)?;

    Some(base.join(APP_DIR).join(CONFIG_FILE))
}
