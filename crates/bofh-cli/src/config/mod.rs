//! Configuration loading and resolution.

use std::path::PathBuf;
use std::time::Duration;

use bofh::ConnectorConfig;

pub const DEFAULT_URL: &str = "https://cerebrum-uio.uio.no:8000";

const URL_ENV: &str = "BOFH_URL";
const CA_FILE_ENV: &str = "BOFH_CA_FILE";

/// Resolved connection settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub url: String,
    pub user: String,
    pub ca_file: Option<PathBuf>,
    pub validate_hostname: bool,
    pub timeout: Duration,
}

impl Settings {
    pub fn connector_config(&self) -> ConnectorConfig {
        ConnectorConfig {
            ca_file: self.ca_file.clone(),
            validate_hostname: self.validate_hostname,
            timeout: self.timeout,
        }
    }
}

/// Resolve the bofhd URL.
pub fn resolve_url(explicit: Option<&str>) -> String {
    first_of(explicit, std::env::var(URL_ENV).ok()).unwrap_or_else(|| DEFAULT_URL.to_string())
}

/// Resolve the trust anchor file. `None` means the bundled roots.
pub fn resolve_ca_file(explicit: Option<&str>) -> Option<PathBuf> {
    first_of(explicit, std::env::var(CA_FILE_ENV).ok()).map(PathBuf::from)
}

/// Resolve the user to log in as.
pub fn resolve_user(explicit: Option<&str>) -> anyhow::Result<String> {
    let from_env = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok();
    first_of(explicit, from_env)
        .ok_or_else(|| anyhow::anyhow!("No user name given and $USER is not set, use --user"))
}

/// REPL history file.
pub fn history_path() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".bofh_history")
}

fn first_of(explicit: Option<&str>, env: Option<String>) -> Option<String> {
    explicit
        .map(str::to_string)
        .or(env)
        .filter(|value| !value.is_empty())
}
