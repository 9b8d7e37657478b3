use std::{fs, path::PathBuf};

use colored::Colorize;

use crate::{IS_DEV, error::PolygateError};

pub mod stream;

pub const LOG_DIR: &str = "log";

/// Gets and sets up the configuration directory for the application
///
/// In dev, uses the cargo manifest directory; in production, the directory
/// of the executable. Also creates the log directory if missing.
pub fn set_polygate_dir() -> Result<PathBuf, PolygateError> {
    let dir = if *IS_DEV {
        let cargo_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        cargo_dir.canonicalize()?
    } else {
        std::env::current_exe()?
            .parent()
            .ok_or(PolygateError::UnexpectedNone {
                msg: "executable has no parent directory",
            })?
            .canonicalize()?
            .to_path_buf()
    };
    std::env::set_current_dir(&dir)?;
    let log_dir = dir.join(LOG_DIR);
    if !log_dir.exists() {
        fs::create_dir_all(&log_dir)?;
    }
    Ok(dir)
}

/// Renders a boolean as a coloured on/off marker for log lines.
pub fn enabled(value: bool) -> String {
    if value {
        "on".green().to_string()
    } else {
        "off".red().to_string()
    }
}

/// Shortens a client API key for log output; keys never appear whole.
pub fn hide_api_key(key: &str) -> String {
    let key = key.trim();
    if key.is_empty() {
        return String::new();
    }
    if key.len() <= 8 {
        return "***".to_string();
    }
    format!("{}...{}", &key[..4], &key[key.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_keys_keep_only_edges() {
        assert_eq!(hide_api_key("sk-polygate-0123456789"), "sk-p...6789");
        assert_eq!(hide_api_key("short"), "***");
        assert_eq!(hide_api_key("  "), "");
    }
}
