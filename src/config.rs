//! Process configuration loaded from the environment (and `.env`).

use crate::error::{AgentError, Result};
use std::time::Duration;

pub const DEFAULT_SCHEMA: &str = "public";
pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";
pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:5000";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub database_url: String,
    /// Schema whose tables ground the prompts.
    pub schema: String,
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub llm_timeout: Duration,
    pub connect_timeout: Duration,
    pub statement_timeout: Duration,
    pub bind_addr: String,
    /// Server sessions idle longer than this are dropped.
    pub session_idle_timeout: Duration,
}

impl AgentConfig {
    /// Read configuration from the process environment.
    ///
    /// Call `dotenv::dotenv()` first if a `.env` file should be honoured.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| AgentError::Config("DATABASE_URL is not set".to_string()))?;

        let api_key = lookup("OPENROUTER_API_KEY")
            .or_else(|| lookup("LLM_API_KEY"))
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                AgentError::Config("OPENROUTER_API_KEY (or LLM_API_KEY) is not set".to_string())
            })?;

        Ok(Self {
            database_url,
            schema: lookup("DB_SCHEMA").unwrap_or_else(|| DEFAULT_SCHEMA.to_string()),
            api_key,
            model: lookup("LLM_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: lookup("LLM_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            llm_timeout: secs(&lookup, "LLM_TIMEOUT_SECS", 60)?,
            connect_timeout: secs(&lookup, "DB_CONNECT_TIMEOUT_SECS", 10)?,
            statement_timeout: secs(&lookup, "DB_STATEMENT_TIMEOUT_SECS", 30)?,
            bind_addr: lookup("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            session_idle_timeout: secs(&lookup, "SESSION_IDLE_SECS", 1800)?,
        })
    }
}

fn secs<F>(lookup: &F, key: &str, default: u64) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| AgentError::Config(format!("{} must be a number of seconds: {}", key, e))),
        None => Ok(Duration::from_secs(default)),
    }
}
