use std::path::PathBuf;

use anyhow::{Context, Result};

/// Returns the config directory: ~/.config/shellmux
pub fn config_dir() -> Result<PathBuf> {
    let config = dirs::config_dir().context("Could not determine config directory")?;
    Ok(config.join("shellmux"))
}

/// Returns the default settings path: ~/.config/shellmux/config.toml
pub fn settings_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Returns the fallback working directory for new sessions: the home directory
pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("Could not determine home directory")
}

/// Ensures all required directories exist
pub fn ensure_dirs() -> Result<()> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    Ok(())
}
