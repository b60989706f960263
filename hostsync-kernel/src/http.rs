/**
 * HTTP - endpoint de supervision (optionnel, `http.listen`)
 *
 * ROUTES :
 * - GET /        : "ok" tant que le process tourne
 * - GET /health  : même document que le fichier health ;
 *                  200 si tous les workers sont ok, 503 sinon
 *
 * Lecture seule : aucune route ne déclenche d'action sur la plateforme.
 */

use crate::health::{HealthReport, HealthTracker};
use crate::state::{is_shutting_down, ShutdownRx};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub health: HealthTracker,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "ok" }))
        .route("/health", get(get_health))
        .with_state(app_state)
}

// GET /health
async fn get_health(State(app): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = app.health.report();
    let status = if report.all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

/// Sert l'API jusqu'au signal d'arrêt
pub async fn serve(addr: SocketAddr, health: HealthTracker, mut shutdown: ShutdownRx) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("health endpoint listening on http://{}", listener.local_addr()?);
    axum::serve(listener, build_router(AppState { health }))
        .with_graceful_shutdown(async move {
            while !is_shutting_down(&shutdown) {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
}
