pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/status", get(handlers::handle_status))
        .route("/sessions", get(handlers::handle_sessions))
        .route("/subtasks", get(handlers::handle_subtasks))
        .route("/subtasks/{id}", get(handlers::handle_subtask_inspect))
        .route("/escalations", get(handlers::handle_escalations))
        .route(
            "/tasks",
            get(handlers::handle_tasks).post(handlers::handle_task_create),
        )
        .route("/tasks/{id}", get(handlers::handle_task_inspect))
        .route("/offers", post(handlers::handle_offer))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(cors)
}

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, app).await?;
    Ok(())
}
