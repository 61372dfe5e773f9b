use axum::{
    http::{header, HeaderName, Method},
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub mod config;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod metrics;
pub mod middlewares;
pub mod models;
pub mod sandbox;
pub mod services;
pub mod utils;

pub use config::Config;
pub use error::{PlayerError, PlayerResult};
pub use services::AppState;

pub fn create_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(middlewares::trace::TRACE_ID_HEADER),
        ])
        .allow_origin(tower_http::cors::Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/metrics",
            get(handlers::metrics_handler)
                .layer(middleware::from_fn(handlers::metrics_auth_middleware)),
        )
        .nest("/player", player_routes(app_state.clone()))
        .with_state(app_state)
        .layer(cors)
        .layer(middleware::from_fn(middlewares::metrics::metrics_middleware))
        .layer(middleware::from_fn(
            middlewares::trace::trace_context_middleware,
        ))
        .layer(TraceLayer::new_for_http())
}

fn player_routes(app_state: Arc<AppState>) -> Router<Arc<AppState>> {
    // Learner routes need an identified caller.
    let learner_routes = Router::new()
        .route("/play/activity", post(handlers::player::play_activity))
        .route("/play/exercises", post(handlers::player::play_exercises))
        .route(
            "/terminate/{session_id}",
            post(handlers::player::terminate),
        )
        .route_layer(middleware::from_fn_with_state(
            app_state.clone(),
            middlewares::auth::auth_middleware,
        ));

    // Preview and evaluation also serve anonymous previews.
    let open_routes = Router::new()
        .route("/evaluate", post(handlers::player::evaluate))
        .route("/preview", post(handlers::player::preview))
        .route_layer(middleware::from_fn_with_state(
            app_state,
            middlewares::auth::optional_auth_middleware,
        ));

    learner_routes.merge(open_routes)
}
