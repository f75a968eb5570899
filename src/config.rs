use std::time::Duration;

use config::{Config, ConfigError, File, FileFormat};
use serde::Deserialize;

use crate::delivery::SenderConfig;

/// Process configuration, loaded once at startup from a TOML file. Mutable
/// SMTP relay settings live in the store instead, so they survive edits
/// without a restart.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub auth: AuthSettings,
    #[serde(default)]
    pub sending: SendingSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// External base URL, used to build verify/unsubscribe capability links.
    pub public_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSettings {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SendingSettings {
    pub rate_limit: u32,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub batch_size: u32,
}

impl Default for SendingSettings {
    fn default() -> Self {
        Self {
            rate_limit: 10,
            max_retries: 2,
            retry_delay_secs: 5,
            batch_size: 10,
        }
    }
}

impl Settings {
    pub fn sender_config(&self) -> SenderConfig {
        SenderConfig {
            rate_limit: self.sending.rate_limit.max(1),
            max_retries: self.sending.max_retries,
            retry_delay: Duration::from_secs(self.sending.retry_delay_secs),
            batch_size: self.sending.batch_size.max(1),
            public_url: self.server.public_url.clone(),
        }
    }
}

pub fn load(path: &str) -> Result<Settings, ConfigError> {
    let settings: Settings = Config::builder()
        .add_source(File::new(path, FileFormat::Toml))
        .build()?
        .try_deserialize()?;

    if settings.auth.username.is_empty() || settings.auth.password.is_empty() {
        return Err(ConfigError::Message(
            "auth.username and auth.password must both be set".to_string(),
        ));
    }
    if settings.sending.rate_limit == 0 {
        return Err(ConfigError::Message(
            "sending.rate_limit must be at least 1".to_string(),
        ));
    }

    Ok(settings)
}
