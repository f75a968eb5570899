use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::models::Error;

#[derive(Debug, Clone)]
pub struct SettingsRepository {
    pool: SqlitePool,
}

impl SettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(
            sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_all(&self) -> Result<HashMap<String, String>, Error> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().collect())
    }
}

/// Mutable SMTP relay configuration, persisted as individual settings rows so
/// an admin can reconfigure the transport without a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_email: String,
    pub from_name: String,
    pub tls: bool,
}

impl SmtpSettings {
    const KEYS: [&'static str; 7] = [
        "smtp_host",
        "smtp_port",
        "smtp_username",
        "smtp_password",
        "smtp_from_email",
        "smtp_from_name",
        "smtp_tls",
    ];

    pub fn is_configured(&self) -> bool {
        !self.host.is_empty() && !self.from_email.is_empty()
    }

    pub async fn load(repo: &SettingsRepository) -> Result<Self, Error> {
        let mut all = repo.get_all().await?;
        let mut take = |key: &str| all.remove(key).unwrap_or_default();

        Ok(Self {
            host: take("smtp_host"),
            port: take("smtp_port").parse().unwrap_or(587),
            username: take("smtp_username"),
            password: take("smtp_password"),
            from_email: take("smtp_from_email"),
            from_name: take("smtp_from_name"),
            tls: take("smtp_tls") == "true",
        })
    }

    pub async fn persist(&self, repo: &SettingsRepository) -> Result<(), Error> {
        let port = self.port.to_string();
        let tls = if self.tls { "true" } else { "false" };
        let values = [
            self.host.as_str(),
            &port,
            &self.username,
            &self.password,
            &self.from_email,
            &self.from_name,
            tls,
        ];

        for (key, value) in Self::KEYS.iter().zip(values) {
            repo.set(key, value).await?;
        }

        Ok(())
    }
}
