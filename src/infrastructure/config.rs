//! Application configuration
//!
//! Configuration merges three sources, lowest priority first: built-in
//! defaults, optional `lamrelay.toml` / `lamrelay.local.toml` files, and
//! `LAMRELAY_`-prefixed environment variables (`__` separates nesting,
//! e.g. `LAMRELAY_SERVER__PORT=3000`).

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError as ConfigCrateError, Environment, File};
use serde::Deserialize;

use crate::domain::value_objects::GenerationParams;

/// Configuration file names, searched in the working directory; the local
/// file overrides the checked-in one
const CONFIG_FILE_NAMES: &[&str] = &["lamrelay", "lamrelay.local"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

impl From<ConfigCrateError> for ConfigError {
    fn from(err: ConfigCrateError) -> Self {
        ConfigError::Load(err.to_string())
    }
}

/// Which wire carries inference traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Synchronous HTTP calls against an OpenAI-compatible server
    Direct,
    /// Request/reply channels over a message broker
    Broker,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    pub mode: TransportMode,
}

/// Direct transport: an OpenAI-compatible chat completion endpoint
/// (llama.cpp server, vLLM, and friends)
#[derive(Debug, Clone, Deserialize)]
pub struct DirectConfig {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    /// In-flight request cap toward the backend
    pub max_concurrent: usize,
    /// Disable deep thinking mode on backends that support it
    pub skip_thinking: bool,
}

impl DirectConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub addr: String,
    pub request_channel: String,
    pub reply_channel: String,
    /// A pending request older than this is failed as timed out
    pub stale_timeout_secs: u64,
    pub monitor_interval_secs: u64,
    /// Probe the link after this long without any inbound frame
    pub idle_probe_secs: u64,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    /// Consecutive failed reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
}

impl BrokerConfig {
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn idle_probe(&self) -> Duration {
        Duration::from_secs(self.idle_probe_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.initial_backoff_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub capacity: usize,
    pub workers: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub max_sessions: usize,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Retained exchange pairs per session; 0 keeps the full history
    pub max_history_pairs: usize,
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn history_pairs(&self) -> Option<usize> {
        if self.max_history_pairs == 0 {
            None
        } else {
            Some(self.max_history_pairs)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub max_requests: usize,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Generation defaults applied when a request leaves a knob unset
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub system_prompt: String,
}

impl GenerationConfig {
    pub fn params(&self) -> GenerationParams {
        GenerationParams {
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
        }
    }
}

/// Application configuration assembled from defaults, file, and environment
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub transport: TransportConfig,
    pub direct: DirectConfig,
    pub broker: BrokerConfig,
    pub queue: QueueConfig,
    pub session: SessionConfig,
    pub rate_limit: RateLimitConfig,
    pub generation: GenerationConfig,
}

impl AppConfig {
    /// Load configuration from the default search path
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration, optionally from an explicit file
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("transport.mode", "direct")?
            .set_default("direct.base_url", "http://localhost:8080/v1")?
            .set_default("direct.model", "default")?
            .set_default("direct.timeout_secs", 300)?
            .set_default("direct.max_concurrent", 8)?
            .set_default("direct.skip_thinking", true)?
            .set_default("broker.addr", "127.0.0.1:1883")?
            .set_default("broker.request_channel", "llm/request")?
            .set_default("broker.reply_channel", "llm/reply")?
            .set_default("broker.stale_timeout_secs", 120)?
            .set_default("broker.monitor_interval_secs", 30)?
            .set_default("broker.idle_probe_secs", 300)?
            .set_default("broker.initial_backoff_secs", 5)?
            .set_default("broker.max_backoff_secs", 300)?
            .set_default("broker.max_reconnect_attempts", 10)?
            .set_default("queue.capacity", 1000)?
            .set_default("queue.workers", 12)?
            .set_default("session.max_sessions", 100)?
            .set_default("session.idle_timeout_secs", 3600)?
            .set_default("session.sweep_interval_secs", 300)?
            .set_default("session.max_history_pairs", 3)?
            .set_default("rate_limit.window_secs", 60)?
            .set_default("rate_limit.max_requests", 30)?
            .set_default("generation.temperature", 0.6)?
            .set_default("generation.top_p", 0.9)?
            .set_default("generation.max_tokens", 512)?
            .set_default(
                "generation.system_prompt",
                "You are a helpful AI assistant. Provide clear, concise, and accurate responses.",
            )?;

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path).required(true));
        } else {
            for name in CONFIG_FILE_NAMES {
                builder = builder.add_source(File::with_name(name).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("LAMRELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()?
            .try_deserialize()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Validation(
                "Server port cannot be 0".to_string(),
            ));
        }
        if self.queue.capacity == 0 {
            return Err(ConfigError::Validation(
                "Queue capacity cannot be 0".to_string(),
            ));
        }
        if self.queue.workers == 0 {
            return Err(ConfigError::Validation(
                "Worker count cannot be 0".to_string(),
            ));
        }
        if self.rate_limit.max_requests == 0 || self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Validation(
                "Rate limit window and request count cannot be 0".to_string(),
            ));
        }
        match self.transport.mode {
            TransportMode::Direct => {
                if self.direct.base_url.is_empty() {
                    return Err(ConfigError::Validation(
                        "Direct transport requires a base URL".to_string(),
                    ));
                }
                if self.direct.max_concurrent == 0 {
                    return Err(ConfigError::Validation(
                        "Direct transport concurrency cannot be 0".to_string(),
                    ));
                }
            }
            TransportMode::Broker => {
                if self.broker.addr.is_empty() {
                    return Err(ConfigError::Validation(
                        "Broker transport requires a broker address".to_string(),
                    ));
                }
                if self.broker.initial_backoff_secs > self.broker.max_backoff_secs {
                    return Err(ConfigError::Validation(
                        "Initial backoff cannot exceed the backoff cap".to_string(),
                    ));
                }
                if self.broker.request_channel == self.broker.reply_channel {
                    return Err(ConfigError::Validation(
                        "Request and reply channels must differ".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}
