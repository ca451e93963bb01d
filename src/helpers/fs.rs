//! File System Utilities
//!
//! Configuration directory management.

use crate::constants::CONFIG_FILE_NAME;
use crate::error::{Error, Result};
use directories::ProjectDirs;
use std::path::PathBuf;

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "suite", "suite-core").ok_or_else(|| Error::Invalid {
        message: "Could not determine project directories".to_string(),
    })
}

/// Default location of the configuration file
///
/// Platform-specific locations:
/// - **Linux**: `~/.config/suite-core/suite.toml` or `$XDG_CONFIG_HOME/suite-core/suite.toml`
/// - **macOS**: `~/Library/Application Support/com.suite.suite-core/suite.toml`
/// - **Windows**: `C:\Users\<User>\AppData\Roaming\suite\suite-core\config\suite.toml`
pub fn default_config_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join(CONFIG_FILE_NAME))
}
