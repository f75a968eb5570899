use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tinylist::{
    api::{ApiServer, ApiState},
    config,
    delivery::CampaignSender,
    enrollment::Enrollment,
    init_tracing,
    mailer::{Mailer, SmtpMailer},
    models::{SettingsRepository, SmtpSettings},
    shutdown_signal,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_path =
        std::env::var("TINYLIST_CONFIG").unwrap_or_else(|_| "tinylist.toml".to_string());
    let settings = config::load(&config_path)
        .with_context(|| format!("failed to load configuration from {config_path}"))?;

    let options = SqliteConnectOptions::new()
        .filename(&settings.database.path)
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .connect_with(options)
        .await
        .context("failed to open database")?;
    sqlx::migrate!()
        .run(&pool)
        .await
        .context("failed to run database migrations")?;

    let mailer: Arc<dyn Mailer> = Arc::new(SmtpMailer::new());
    let smtp = SmtpSettings::load(&SettingsRepository::new(pool.clone())).await?;
    if smtp.is_configured() {
        mailer.configure(smtp);
    } else {
        warn!("SMTP transport not configured; set it up via the admin settings endpoint");
    }

    let sender = CampaignSender::new(pool.clone(), mailer.clone(), settings.sender_config());
    let enrollment = Enrollment::new(
        pool.clone(),
        mailer.clone(),
        settings.server.public_url.clone(),
    );

    let shutdown = CancellationToken::new();
    let state = ApiState::new(pool, settings.auth.clone(), mailer, sender, enrollment);
    let socket: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .context("invalid server.host/server.port")?;

    let handle = ApiServer::new(socket, state, shutdown.clone()).spawn();

    shutdown_signal(shutdown.clone()).await;
    shutdown.cancel();
    info!("shutting down, waiting up to 30s for in-flight requests");
    if tokio::time::timeout(Duration::from_secs(30), handle)
        .await
        .is_err()
    {
        warn!("graceful shutdown timed out, exiting");
    }

    Ok(())
}
