//! Environment-driven configuration.
//!
//! Consolidates the scattered `env::var` reads the teacher's `main.rs` and
//! `LlmConfig::from_env()` each do separately into one struct, since this
//! crate has more configuration surface (registry TTL, truncation limits,
//! per-call timeouts) than the teacher's IDE process did.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub port: u16,
    pub anthropic_api_key: Option<String>,
    pub anthropic_model: String,
    pub redis_url: Option<String>,
    pub history_max_messages: usize,
    pub history_max_tokens: usize,
    pub llm_timeout: Duration,
    pub retrieval_timeout: Duration,
    pub registry_ttl: Duration,
    pub partial_upsert_every_n_events: usize,
    pub partial_upsert_every: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            db_path: env::var("CHAT_DB_PATH").unwrap_or_else(|_| "chat_core.db".to_string()),
            port: env::var("CHAT_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            anthropic_api_key: env::var("ANTHROPIC_API_KEY").ok(),
            anthropic_model: env::var("CHAT_ANTHROPIC_MODEL")
                .unwrap_or_else(|_| "claude-3-5-sonnet-20241022".to_string()),
            redis_url: env::var("CHAT_REDIS_URL").ok(),
            history_max_messages: env::var("CHAT_HISTORY_MAX_MESSAGES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            history_max_tokens: env::var("CHAT_HISTORY_MAX_TOKENS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            llm_timeout: Duration::from_secs(
                env::var("CHAT_LLM_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(120),
            ),
            retrieval_timeout: Duration::from_secs(
                env::var("CHAT_RETRIEVAL_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            ),
            registry_ttl: Duration::from_secs(
                env::var("CHAT_REGISTRY_TTL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(3600),
            ),
            partial_upsert_every_n_events: 8,
            partial_upsert_every: Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_env_absent() {
        env::remove_var("CHAT_DB_PATH");
        env::remove_var("CHAT_PORT");
        let cfg = Config::from_env();
        assert_eq!(cfg.db_path, "chat_core.db");
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.history_max_messages, 30);
        assert_eq!(cfg.history_max_tokens, 8000);
    }
}
