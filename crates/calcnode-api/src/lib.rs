pub mod handlers;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

/// Routes under `/api`, without CORS.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(handlers::handle_status))
        .route("/functions", get(handlers::handle_functions))
        .route(
            "/jobs",
            get(handlers::handle_running_jobs)
                .post(handlers::handle_submit_job)
                .layer(DefaultBodyLimit::max(64 * 1024 * 1024)),
        )
        .route("/jobs/{id}/cancel", post(handlers::handle_cancel_job))
        .route("/statistics", get(handlers::handle_statistics))
        .route("/statistics/reset", post(handlers::handle_statistics_reset))
        .route("/blacklist", get(handlers::handle_blacklist))
        .route("/blacklist/purge", post(handlers::handle_blacklist_purge))
        .route("/daemon/shutdown", post(handlers::handle_shutdown))
        .with_state(state)
}

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new().nest("/api", router(state)).layer(cors);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, app).await?;
    Ok(())
}
