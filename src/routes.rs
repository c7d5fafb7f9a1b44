// src/routes.rs

use std::any::Any;

use axum::{
    Router,
    http::Method,
    middleware,
    response::{IntoResponse, Response},
    routing::post,
};
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};

use crate::{
    error::AppError,
    handlers::{assessment, auth, logging},
    state::AppState,
    utils::jwt::{auth_middleware, identity_middleware},
};

/// Assembles the main application router.
///
/// * `/logger`: event ingestion. The identity is optional at the HTTP layer;
///   the pipeline rejects anonymous events itself.
/// * `/assessment`: stored results, token required.
/// * `/auth`: login.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
        ]);

    let logger_routes = Router::new()
        .route("/bookevent", post(logging::log_book_event))
        .layer(middleware::from_fn_with_state(state.clone(), identity_middleware));

    let assessment_routes = Router::new()
        .route("/results", post(assessment::get_assessment_results))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let auth_routes = Router::new().route("/validate", post(auth::login));

    Router::new()
        .nest("/logger", logger_routes)
        .nest("/assessment", assessment_routes)
        .nest("/auth", auth_routes)
        // Global Middleware (applied from outside in)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Turns a handler panic into the generic 500 body.
fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let message = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");

    AppError::InternalServerError(format!("Handler panicked: {}", message)).into_response()
}
