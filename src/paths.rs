//! Filesystem locations for the host.
//!
//! Uses the [`dirs`] crate for platform-appropriate directories.
//!
//! | Purpose | Linux | Override |
//! |---------|-------|----------|
//! | Data (SQLite store) | `~/.local/share/cadence/` | `CADENCE_DATA_DIR` |
//! | Config | `~/.config/cadence/` | `CADENCE_CONFIG_DIR` |

use std::path::PathBuf;

/// Data root. Holds the state database.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("CADENCE_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("cadence"))
        .unwrap_or_else(|| PathBuf::from("/tmp/cadence-data"))
}

/// Config directory.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("CADENCE_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("cadence"))
        .unwrap_or_else(|| PathBuf::from("/tmp/cadence-config"))
}

/// `config_dir()/config.toml`.
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// `data_dir()/cadence.db`.
#[must_use]
pub fn database_file() -> PathBuf {
    data_dir().join("cadence.db")
}
