// src/handlers/logging.rs

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::State,
};
use serde_json::Value;

use crate::{
    error::AppError,
    pipeline::{self, FeedbackResponse},
    registry::AnswerTableRegistry,
    store::{EventStore, record_traceback},
    utils::jwt::MaybeClaims,
};

/// Logs one book event.
///
/// Called for nearly every click on a book page. Anonymous requests are
/// rejected with 401 before anything is written.
pub async fn log_book_event(
    State(store): State<Arc<dyn EventStore>>,
    State(registry): State<Arc<AnswerTableRegistry>>,
    Extension(MaybeClaims(claims)): Extension<MaybeClaims>,
    Json(payload): Json<Value>,
) -> Result<Json<FeedbackResponse>, AppError> {
    match pipeline::log_event(store.as_ref(), &registry, payload, claims.as_ref()).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            if e.is_internal() {
                record_traceback(store.as_ref(), pipeline::ROUTE, &e.to_string()).await;
            }
            Err(e.into())
        }
    }
}
