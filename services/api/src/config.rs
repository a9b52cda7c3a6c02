use assessor_core::orchestrator::OrchestratorConfig;
use assessor_core::retry::RetryPolicy;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// The OpenAI-compatible endpoint used for the language model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Gemini,
}

impl Provider {
    pub fn api_base(&self) -> &'static str {
        match self {
            Provider::OpenAI => "https://api.openai.com/v1/",
            Provider::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub provider: Provider,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub chat_model: String,
    pub log_level: Level,
    pub prompts_path: PathBuf,
    pub data_path: PathBuf,
    pub public_base_url: String,
    pub max_tool_calls: usize,
    pub llm_max_attempts: u32,
    pub llm_base_delay: Duration,
    pub llm_backoff_factor: f64,
    pub llm_max_delay: Duration,
    pub llm_timeout: Duration,
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:5000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://assessor.db?mode=rwc".to_string());

        let provider_str = std::env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let provider = match provider_str.to_lowercase().as_str() {
            "openai" => Provider::OpenAI,
            "gemini" => Provider::Gemini,
            other => {
                return Err(ConfigError::InvalidValue(
                    "LLM_PROVIDER".to_string(),
                    format!("'{other}' is not one of 'openai', 'gemini'"),
                ));
            }
        };

        let openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        let gemini_api_key = std::env::var("GEMINI_API_KEY").ok();

        let chat_model = std::env::var("CHAT_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let prompts_path = std::env::var("PROMPTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./prompts"));
        let data_path = std::env::var("DATA_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let public_base_url = std::env::var("PUBLIC_BASE_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|_| default_public_base_url(&bind_address));

        let max_tool_calls = parse_var("MAX_TOOL_CALLS", 8usize)?;
        if max_tool_calls == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_TOOL_CALLS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let llm_max_attempts = parse_var("LLM_MAX_ATTEMPTS", 3u32)?;
        if llm_max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "LLM_MAX_ATTEMPTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let llm_base_delay = Duration::from_millis(parse_var("LLM_BASE_DELAY_MS", 1000u64)?);
        let llm_backoff_factor = parse_var("LLM_BACKOFF_FACTOR", 2.0f64)?;
        if !llm_backoff_factor.is_finite() || llm_backoff_factor < 1.0 {
            return Err(ConfigError::InvalidValue(
                "LLM_BACKOFF_FACTOR".to_string(),
                "must be a number >= 1.0".to_string(),
            ));
        }
        let llm_max_delay = Duration::from_millis(parse_var("LLM_MAX_DELAY_MS", 30_000u64)?);
        if llm_max_delay.is_zero() {
            return Err(ConfigError::InvalidValue(
                "LLM_MAX_DELAY_MS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let llm_timeout = Duration::from_secs(parse_var("LLM_TIMEOUT_SECS", 30u64)?);
        if llm_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "LLM_TIMEOUT_SECS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        match provider {
            Provider::OpenAI => {
                if openai_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "OPENAI_API_KEY must be set for 'openai' provider".to_string(),
                    ));
                }
            }
            Provider::Gemini => {
                if gemini_api_key.is_none() {
                    return Err(ConfigError::MissingVar(
                        "GEMINI_API_KEY must be set for 'gemini' provider".to_string(),
                    ));
                }
            }
        }

        Ok(Self {
            bind_address,
            database_url,
            provider,
            openai_api_key,
            gemini_api_key,
            chat_model,
            log_level,
            prompts_path,
            data_path,
            public_base_url,
            max_tool_calls,
            llm_max_attempts,
            llm_base_delay,
            llm_backoff_factor,
            llm_max_delay,
            llm_timeout,
        })
    }

    /// The API key for the configured provider.
    pub fn api_key(&self) -> Option<&str> {
        match self.provider {
            Provider::OpenAI => self.openai_api_key.as_deref(),
            Provider::Gemini => self.gemini_api_key.as_deref(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.llm_max_attempts,
            base_delay: self.llm_base_delay,
            factor: self.llm_backoff_factor,
            max_delay: self.llm_max_delay,
            call_timeout: self.llm_timeout,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_tool_calls: self.max_tool_calls,
            retry: self.retry_policy(),
            ..OrchestratorConfig::default()
        }
    }
}

fn default_public_base_url(bind_address: &SocketAddr) -> String {
    if bind_address.ip().is_unspecified() {
        format!("http://localhost:{}", bind_address.port())
    } else {
        format!("http://{bind_address}")
    }
}
