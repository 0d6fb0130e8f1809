use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to read configuration: {0}")]
    Source(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}

#[derive(Debug, Deserialize, Validate, Clone)]
pub struct Config {
    pub data_dir: PathBuf,

    #[validate(length(min = 1))]
    pub storage_key: String,

    #[validate(length(min = 1))]
    pub default_model: String,

    pub gateway_url: Option<String>,

    pub api_key: Option<String>,

    pub vision_model: String,

    pub speech_model: String,

    pub voice: String,

    pub test_mode: bool,

    #[validate(range(min = 1, max = 600))]
    pub request_timeout_secs: u64,

    pub log_level: String,

    pub log_json: bool,
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".monica")
}

impl Config {
    pub fn load() -> Result<Self, ConfigLoadError> {
        let _ = dotenvy::dotenv();
        let user_file = default_data_dir().join("config");
        let builder = Self::defaults()?
            // ~/.monica/config.{toml,yaml,json}, if present
            .add_source(
                config::File::with_name(&user_file.to_string_lossy()).required(false),
            )
            // MONICA__GATEWAY_URL, MONICA__API_KEY, ...
            .add_source(config::Environment::with_prefix("MONICA").separator("__"));
        Self::from_builder(builder)
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigLoadError> {
        Ok(config::Config::builder()
            .set_default("data_dir", default_data_dir().to_string_lossy().to_string())?
            .set_default("storage_key", "ai-chat-history")?
            .set_default("default_model", crate::models::DEFAULT_MODEL)?
            .set_default("vision_model", "gpt-4o-mini")?
            .set_default("speech_model", "tts-1")?
            .set_default("voice", "alloy")?
            .set_default("test_mode", false)?
            .set_default("request_timeout_secs", 60i64)?
            .set_default("log_level", "info")?
            .set_default("log_json", false)?)
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigLoadError> {
        let cfg: Config = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn speech_dir(&self) -> PathBuf {
        self.data_dir.join("speech")
    }
}
