use anyhow::Result;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::utils::RetryPolicy;

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub llm: LLMConfig,
    pub jobs: JobConfig,
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub cors_allowed_origins: Vec<String>,
}

#[derive(Clone, Deserialize)]
pub struct LLMConfig {
    pub gemini_api_key: String,
    pub gemini_api_base: String,
    pub default_model: String,
}

// Keeps the API key out of startup logs.
impl std::fmt::Debug for LLMConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LLMConfig")
            .field("gemini_api_key", &if self.gemini_api_key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("gemini_api_base", &self.gemini_api_base)
            .field("default_model", &self.default_model)
            .finish()
    }
}

/// Tuning for the background job engine.
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    /// Retries allowed after the first attempt fails transiently.
    pub retry_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub attempt_timeout_secs: u64,
    /// How long a finished job stays queryable.
    pub retention_secs: u64,
    pub gc_interval_secs: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
            attempt_timeout_secs: 120,
            retention_secs: 300,
            gc_interval_secs: 60,
        }
    }
}

impl JobConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    pub dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let job_defaults = JobConfig::default();

        Ok(Self {
            server: ServerConfig {
                port: env::var("PORT")
                    .unwrap_or_else(|_| "3001".to_string())
                    .parse()?,
                host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                cors_allowed_origins: env::var("ALLOWED_ORIGINS")
                    .unwrap_or_default()
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            llm: LLMConfig {
                gemini_api_key: env::var("GEMINI_API_KEY").unwrap_or_default(),
                gemini_api_base: env::var("GEMINI_API_BASE")
                    .unwrap_or_else(|_| DEFAULT_GEMINI_API_BASE.to_string()),
                default_model: env::var("GEMINI_MODEL")
                    .unwrap_or_else(|_| DEFAULT_GEMINI_MODEL.to_string()),
            },
            jobs: JobConfig {
                retry_attempts: env_or("JOB_RETRY_ATTEMPTS", job_defaults.retry_attempts)?,
                backoff_base_ms: env_or("JOB_BACKOFF_BASE_MS", job_defaults.backoff_base_ms)?,
                backoff_max_ms: env_or("JOB_BACKOFF_MAX_MS", job_defaults.backoff_max_ms)?,
                attempt_timeout_secs: env_or(
                    "JOB_ATTEMPT_TIMEOUT_SECS",
                    job_defaults.attempt_timeout_secs,
                )?,
                retention_secs: env_or("JOB_RETENTION_SECS", job_defaults.retention_secs)?,
                gc_interval_secs: env_or("JOB_GC_INTERVAL_SECS", job_defaults.gc_interval_secs)?,
            },
            history: HistoryConfig {
                dir: env::var("HISTORIES_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("histories")),
            },
        })
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => Ok(raw.trim().parse()?),
        Err(_) => Ok(default),
    }
}
