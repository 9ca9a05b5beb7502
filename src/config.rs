use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

pub const DEFAULT_KEYWORDS: &[&str] = &[
    "invoice",
    "subscription",
    "renewal",
    "payment",
    "receipt",
    "billing",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_client_secret_path")]
    pub client_secret_path: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    /// Extra catalog entries, matched before the built-in vendor list.
    #[serde(default)]
    pub vendors: Vec<VendorDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub keywords: Vec<String>,
    pub max_results: u32,
    pub page_size: u32,
    pub min_confidence: u8,
    pub fetch_concurrency: usize,
    pub request_timeout_secs: u64,
    pub batch_timeout_secs: u64,
    pub rate_limit_retries: u32,
    pub backoff_initial_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub refresh_buffer_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Base64-encoded 32-byte key. Falls back to the environment, then the
    /// OS keyring.
    pub key: Option<String>,
    pub use_keyring: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorDefinition {
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    pub patterns: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            keywords: DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            max_results: 50,
            page_size: 50,
            min_confidence: 50,
            fetch_concurrency: 8,
            request_timeout_secs: 20,
            batch_timeout_secs: 300,
            rate_limit_retries: 3,
            backoff_initial_ms: 500,
        }
    }
}

impl ScanConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs.max(1))
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_initial_ms.saturating_mul(exponent).min(30_000))
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_buffer_secs: 5 * 60,
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            key: None,
            use_keyring: true,
        }
    }
}

fn default_database_url() -> String {
    "sqlite:subscout.db?mode=rwc".to_string()
}

fn default_client_secret_path() -> String {
    "credentials.json".to_string()
}

fn default_redirect_uri() -> String {
    "http://localhost:8080/oauth/callback".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            client_secret_path: default_client_secret_path(),
            redirect_uri: default_redirect_uri(),
            scan: ScanConfig::default(),
            tokens: TokenConfig::default(),
            encryption: EncryptionConfig::default(),
            vendors: Vec::new(),
        }
    }
}

impl Config {
    /// Reads `settings.toml` from the working directory, falling back to
    /// defaults when it is missing or unreadable.
    pub fn load() -> Self {
        match Self::load_from("settings.toml") {
            Ok(Some(config)) => config,
            Ok(None) => Self::default(),
            Err(e) => {
                tracing::warn!("Ignoring settings.toml: {}", e);
                Self::default()
            }
        }
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Option<Self>, PipelineError> {
        let content = match std::fs::read_to_string(path.as_ref()) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PipelineError::Config(e.to_string())),
        };
        Self::parse(&content).map(Some)
    }

    pub fn parse(content: &str) -> Result<Self, PipelineError> {
        toml::from_str(content).map_err(|e| PipelineError::Config(e.to_string()))
    }
}
