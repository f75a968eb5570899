use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{FromRef, State},
    routing::{get, post},
};
use serde::Serialize;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::{
    config::AuthSettings,
    delivery::CampaignSender,
    enrollment::Enrollment,
    mailer::Mailer,
    models::{
        CampaignLogRepository, CampaignRepository, JournalRepository, SettingsRepository,
        SubscriberRepository,
    },
};

mod auth;
mod campaigns;
mod error;
mod public;
mod settings;
mod stats;
mod subscribers;
mod validation;

pub use error::{ApiError, BASIC_REALM};

#[derive(Debug, Error)]
pub enum ApiServerError {
    #[error("failed to bind to address: {0}")]
    Bind(std::io::Error),
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

#[derive(Clone)]
pub struct ApiState {
    pool: SqlitePool,
    auth: AuthSettings,
    mailer: Arc<dyn Mailer>,
    sender: CampaignSender,
    enrollment: Enrollment,
}

impl ApiState {
    pub fn new(
        pool: SqlitePool,
        auth: AuthSettings,
        mailer: Arc<dyn Mailer>,
        sender: CampaignSender,
        enrollment: Enrollment,
    ) -> Self {
        Self {
            pool,
            auth,
            mailer,
            sender,
            enrollment,
        }
    }
}

impl FromRef<ApiState> for SqlitePool {
    fn from_ref(state: &ApiState) -> Self {
        state.pool.clone()
    }
}

impl FromRef<ApiState> for AuthSettings {
    fn from_ref(state: &ApiState) -> Self {
        state.auth.clone()
    }
}

impl FromRef<ApiState> for Arc<dyn Mailer> {
    fn from_ref(state: &ApiState) -> Self {
        state.mailer.clone()
    }
}

impl FromRef<ApiState> for CampaignSender {
    fn from_ref(state: &ApiState) -> Self {
        state.sender.clone()
    }
}

impl FromRef<ApiState> for Enrollment {
    fn from_ref(state: &ApiState) -> Self {
        state.enrollment.clone()
    }
}

impl FromRef<ApiState> for SubscriberRepository {
    fn from_ref(state: &ApiState) -> Self {
        SubscriberRepository::new(state.pool.clone())
    }
}

impl FromRef<ApiState> for CampaignRepository {
    fn from_ref(state: &ApiState) -> Self {
        CampaignRepository::new(state.pool.clone())
    }
}

impl FromRef<ApiState> for CampaignLogRepository {
    fn from_ref(state: &ApiState) -> Self {
        CampaignLogRepository::new(state.pool.clone())
    }
}

impl FromRef<ApiState> for JournalRepository {
    fn from_ref(state: &ApiState) -> Self {
        JournalRepository::new(state.pool.clone())
    }
}

impl FromRef<ApiState> for SettingsRepository {
    fn from_ref(state: &ApiState) -> Self {
        SettingsRepository::new(state.pool.clone())
    }
}

pub struct ApiServer {
    router: Router,
    socket: SocketAddr,
    shutdown: CancellationToken,
}

impl ApiServer {
    pub fn new(socket: SocketAddr, state: ApiState, shutdown: CancellationToken) -> ApiServer {
        let private = Router::new()
            .route(
                "/subscribers",
                get(subscribers::list).post(subscribers::create),
            )
            .route(
                "/subscribers/{id}",
                get(subscribers::get).delete(subscribers::remove),
            )
            .route(
                "/subscribers/{id}/send-verification",
                post(subscribers::send_verification),
            )
            .route("/campaigns", get(campaigns::list).post(campaigns::create))
            .route(
                "/campaigns/{id}",
                get(campaigns::get)
                    .put(campaigns::update)
                    .delete(campaigns::remove),
            )
            .route("/campaigns/{id}/send", post(campaigns::send))
            .route("/campaigns/{id}/cancel", post(campaigns::cancel))
            .route("/campaigns/{id}/journal", get(campaigns::journal))
            .route(
                "/settings/smtp",
                get(settings::get_smtp).put(settings::update_smtp),
            )
            .route("/settings/smtp/test", post(settings::test_smtp))
            .route("/stats", get(stats::stats));

        let router = Router::new()
            .route("/health", get(healthy))
            .route("/subscribe", post(public::subscribe))
            .route("/verify/{token}", get(public::verify))
            .route("/unsubscribe/{token}", get(public::unsubscribe))
            .nest("/private", private)
            .layer((
                TraceLayer::new_for_http(),
                TimeoutLayer::new(Duration::from_secs(60)),
            ))
            .with_state(state);

        ApiServer {
            socket,
            router: Router::new().nest("/api", router),
            shutdown,
        }
    }

    pub async fn serve(self) -> Result<(), ApiServerError> {
        let listener = TcpListener::bind(self.socket)
            .await
            .map_err(ApiServerError::Bind)?;

        info!("API server listening on {}", self.socket);

        axum::serve(listener, self.router)
            .with_graceful_shutdown(wait_for_shutdown(self.shutdown))
            .await
            .map_err(ApiServerError::Serve)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async {
            let token = self.shutdown.clone();
            if let Err(err) = self.serve().await {
                error!("server error: {err:?}");
                token.cancel();
                error!("shutting down API server")
            }
        })
    }
}

async fn wait_for_shutdown(token: CancellationToken) {
    token.cancelled().await;
}

#[derive(Debug, Serialize)]
struct HealthyResponse {
    healthy: bool,
    status: &'static str,
}

async fn healthy(State(pool): State<SqlitePool>) -> Json<HealthyResponse> {
    match sqlx::query("SELECT 1").execute(&pool).await {
        Ok(_) => Json(HealthyResponse {
            healthy: true,
            status: "OK",
        }),
        Err(err) => {
            error!("database error: {err:?}");

            Json(HealthyResponse {
                healthy: false,
                status: "database error",
            })
        }
    }
}
