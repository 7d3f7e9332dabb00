use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{AppError, Result};

const GITHUB_TOKEN_VAR: &str = "GITHUB_ACCESS_TOKEN";

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub daemon: DaemonConfig,
    pub github: GitHubConfig,
    pub repo: RepoConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Seconds to sleep between flow iterations.
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
}

#[derive(Deserialize, Clone)]
pub struct GitHubConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub token: String,
}

// Manual Debug impl to avoid leaking the access token
impl std::fmt::Debug for GitHubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubConfig")
            .field("api_url", &self.api_url)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RepoConfig {
    pub owner: String,
    pub name: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Command executed for each pull request, argv form.
    #[serde(default = "default_check_command")]
    pub check_command: Vec<String>,
    /// Seconds the check command may run before it is terminated.
    #[serde(default = "default_check_timeout_secs")]
    pub check_timeout_secs: u64,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("hypha-workdir")
}

fn default_delay_secs() -> u64 {
    60
}

fn default_api_url() -> String {
    "https://api.github.com/graphql".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_check_command() -> Vec<String> {
    vec!["make".to_string(), "check".to_string()]
}

fn default_check_timeout_secs() -> u64 {
    1800
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Load from file if specified
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        } else {
            // Try default paths
            builder = builder.add_source(config::File::with_name("hypha").required(false));
        }

        // Environment variable overrides with HYPHA_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("HYPHA")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        let mut config: AppConfig = config
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))?;

        // The bearer credential may also come from the conventional variable.
        if config.github.token.is_empty() {
            if let Ok(token) = std::env::var(GITHUB_TOKEN_VAR) {
                config.github.token = token;
            }
        }

        Ok(config)
    }

    pub fn github_token(&self) -> &str {
        &self.github.token
    }

    pub fn delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.daemon.delay_secs)
    }
}
