// src/pipeline.rs

//! The event ingestion pipeline behind `POST /logger/bookevent`.
//!
//! Order of work for one event:
//! 1. validate the payload (nothing is written on failure),
//! 2. stamp server time and write the audit (`useinfo`) row,
//! 3. for events with an answer table: check the row against the table's
//!    schema, grade it when the question has server-side feedback, and write it.
//!
//! The audit and answer writes are separate statements. A failed answer write
//! leaves the audit row in place and is reported as `"status": "FAIL"`.

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value, json};
use validator::{ValidationError, ValidationErrors};

use crate::{
    error::AppError,
    grading::{GradingContext, GradingError},
    models::{answer::AnswerRow, event::LogItemIncoming},
    registry::{AnswerTableRegistry, RegistryError},
    store::{EventStore, record_traceback},
    utils::jwt::Claims,
};

pub const ROUTE: &str = "/logger/bookevent";

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("invalid event: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("unknown event type '{0}'")]
    UnknownEventType(String),

    #[error("not authenticated")]
    Unauthenticated,

    #[error("storage failure: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("grading failure: {0}")]
    Grading(GradingError),
}

impl IngestError {
    /// Errors the client cannot fix. These are persisted as tracebacks.
    pub fn is_internal(&self) -> bool {
        matches!(self, IngestError::Storage(_) | IngestError::Grading(_))
    }
}

impl From<RegistryError> for IngestError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownEventType(event) | RegistryError::DuplicateEventType(event) => {
                IngestError::UnknownEventType(event)
            }
        }
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Validation(errors) => AppError::from(errors),
            IngestError::UnknownEventType(event) => AppError::Unprocessable(json!({
                "event": [format!("unknown event type '{}'", event)]
            })),
            IngestError::Unauthenticated => AppError::AuthError("Not authenticated".to_string()),
            IngestError::Storage(e) => AppError::InternalServerError(e.to_string()),
            IngestError::Grading(e) => AppError::InternalServerError(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Fail,
}

/// Body returned to the page: status, audit-row id and grader feedback.
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackResponse {
    pub status: Status,
    pub idx: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(flatten)]
    pub feedback: Map<String, Value>,
}

impl FeedbackResponse {
    fn ok(idx: i64, feedback: Map<String, Value>) -> Self {
        Self {
            status: Status::Ok,
            idx,
            detail: None,
            feedback,
        }
    }

    fn fail(idx: i64, detail: impl Into<String>) -> Self {
        Self {
            status: Status::Fail,
            idx,
            detail: Some(detail.into()),
            feedback: Map::new(),
        }
    }
}

fn malformed(err: serde_json::Error) -> ValidationErrors {
    let mut error = ValidationError::new("malformed");
    error.message = Some(err.to_string().into());
    let mut errors = ValidationErrors::new();
    errors.add("body", error);
    errors
}

/// Logs one event and returns the feedback for the page.
pub async fn log_event(
    store: &dyn EventStore,
    registry: &AnswerTableRegistry,
    raw: Value,
    identity: Option<&Claims>,
) -> Result<FeedbackResponse, IngestError> {
    let claims = identity.ok_or(IngestError::Unauthenticated)?;

    let incoming: LogItemIncoming = serde_json::from_value(raw).map_err(malformed)?;
    let registered = registry.is_registered(&incoming.event);
    if !registered && !AnswerTableRegistry::is_log_only(&incoming.event) {
        return Err(IngestError::UnknownEventType(incoming.event));
    }

    let record = incoming.into_record(registered, &claims.sub, Utc::now())?;
    tracing::debug!(
        event = %record.event_type,
        div_id = %record.component_id,
        sid = %record.student_id,
        "Logging event"
    );

    let idx = store.insert_useinfo(&record.useinfo_row()).await.map_err(|e| {
        tracing::error!("Failed to write useinfo row: {:?}", e);
        e
    })?;

    let Some(mut row) = record.answer_row() else {
        return Ok(FeedbackResponse::ok(idx, Map::new()));
    };

    let table = registry.lookup(&record.event_type)?;
    table.schema.validate(&row)?;

    let mut feedback = Map::new();
    if let Some(grader) = &table.grader {
        let config = match store
            .fetch_server_feedback(&row.div_id, &row.course_name)
            .await
        {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(div_id = %row.div_id, "Failed to load question feedback: {:?}", e);
                record_traceback(store, ROUTE, &e.to_string()).await;
                return Ok(FeedbackResponse::fail(idx, "Unable to load grading configuration."));
            }
        };

        // Without server-side feedback the client's own grading is stored.
        if let Some(config) = config {
            let submitted = row.clone();
            let outcome = grader
                .grade(GradingContext {
                    row: &mut row,
                    feedback: &config.feedback,
                    base_course: &config.base_course,
                    seed: record.seed,
                })
                .await;

            match outcome {
                Ok(result) => feedback = result,
                Err(e) if e.is_fatal() => {
                    tracing::error!(div_id = %row.div_id, "Grader misconfigured: {}", e);
                    return Err(IngestError::Grading(e));
                }
                Err(e) => {
                    tracing::info!(div_id = %row.div_id, sid = %row.sid, "Grading failed: {}", e);
                    row.correct = Some(false);
                    row.percent = Some(0.0);
                    feedback = e.to_feedback();
                }
            }

            // Graders rewrite the answer, so the row is checked again.
            if let Err(errors) = table.schema.validate(&row) {
                tracing::warn!(
                    table = table.table_name,
                    div_id = %row.div_id,
                    "Graded row does not fit its table, storing the submitted answer ungraded: {}",
                    errors
                );
                row = AnswerRow {
                    correct: None,
                    percent: None,
                    ..submitted
                };
            }
        }
    }

    match store
        .insert_answer(table.table_name, table.schema.shape, &row)
        .await
    {
        Ok(_) => Ok(FeedbackResponse::ok(idx, feedback)),
        Err(e) => {
            tracing::error!(table = table.table_name, "Failed to write answer row: {:?}", e);
            record_traceback(store, ROUTE, &e.to_string()).await;
            Ok(FeedbackResponse::fail(idx, "The answer could not be saved."))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grading::Grader;
    use crate::models::question::ServerFeedback;
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Marks every answer correct and echoes a fixed message.
    struct AlwaysRight;

    #[async_trait]
    impl Grader for AlwaysRight {
        async fn grade(&self, ctx: GradingContext<'_>) -> Result<Map<String, Value>, GradingError> {
            ctx.row.correct = Some(true);
            ctx.row.percent = Some(1.0);
            let mut out = Map::new();
            out.insert("message".into(), json!("graded"));
            Ok(out)
        }
    }

    /// Rewrites the answer into something longer than the table allows.
    struct Inflating;

    #[async_trait]
    impl Grader for Inflating {
        async fn grade(&self, ctx: GradingContext<'_>) -> Result<Map<String, Value>, GradingError> {
            ctx.row.answer = Some("x".repeat(600));
            ctx.row.correct = Some(true);
            ctx.row.percent = Some(1.0);
            let mut out = Map::new();
            out.insert("correct".into(), json!(true));
            Ok(out)
        }
    }

    struct Broken(GradingError);

    #[async_trait]
    impl Grader for Broken {
        async fn grade(&self, _ctx: GradingContext<'_>) -> Result<Map<String, Value>, GradingError> {
            Err(match &self.0 {
                GradingError::Failure(m) => GradingError::Failure(m.clone()),
                GradingError::Config(m) => GradingError::Config(m.clone()),
            })
        }
    }

    fn registry_with(fitb: Arc<dyn Grader>) -> AnswerTableRegistry {
        AnswerTableRegistry::standard(fitb, Arc::new(AlwaysRight)).unwrap()
    }

    fn alice() -> Claims {
        Claims {
            sub: "alice".into(),
            course: Some("fopp".into()),
            role: "student".into(),
            exp: usize::MAX,
        }
    }

    fn fillb(answer: &str) -> Value {
        json!({
            "event": "fillb",
            "act": answer,
            "div_id": "q1",
            "course_name": "fopp",
            "answer": answer,
            "correct": false,
            "sid": "mallory"
        })
    }

    #[tokio::test]
    async fn test_unauthenticated_writes_nothing() {
        let store = MemoryStore::new();
        let err = log_event(&store, &registry_with(Arc::new(AlwaysRight)), fillb("x"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Unauthenticated));
        assert!(store.useinfo_rows().is_empty());
    }

    #[tokio::test]
    async fn test_identity_overrides_client_sid() {
        let store = MemoryStore::new();
        let registry = registry_with(Arc::new(AlwaysRight));
        log_event(&store, &registry, fillb("x"), Some(&alice())).await.unwrap();

        assert_eq!(store.useinfo_rows()[0].1.sid, "alice");
        assert_eq!(store.answer_rows("fitb_answers")[0].1.sid, "alice");
    }

    #[tokio::test]
    async fn test_client_grading_kept_without_feedback() {
        let store = MemoryStore::new();
        let registry = registry_with(Arc::new(AlwaysRight));
        let response = log_event(&store, &registry, fillb("x"), Some(&alice())).await.unwrap();

        assert_eq!(response.status, Status::Ok);
        assert!(response.feedback.is_empty());
        assert_eq!(store.answer_rows("fitb_answers")[0].1.correct, Some(false));
    }

    #[tokio::test]
    async fn test_server_grading_overrides_client() {
        let store = MemoryStore::new();
        store.add_question(
            "fopp",
            "q1",
            ServerFeedback {
                feedback: json!({}),
                base_course: "fopp".into(),
            },
        );
        let registry = registry_with(Arc::new(AlwaysRight));
        let response = log_event(&store, &registry, fillb("x"), Some(&alice())).await.unwrap();

        assert_eq!(response.feedback["message"], "graded");
        let (_, row) = &store.answer_rows("fitb_answers")[0];
        assert_eq!(row.correct, Some(true));
        assert_eq!(row.percent, Some(1.0));
    }

    #[tokio::test]
    async fn test_recoverable_grading_failure_is_stored_incorrect() {
        let store = MemoryStore::new();
        store.add_question(
            "fopp",
            "q1",
            ServerFeedback {
                feedback: json!({}),
                base_course: "fopp".into(),
            },
        );
        let registry = registry_with(Arc::new(Broken(GradingError::Failure("nope".into()))));
        let response = log_event(&store, &registry, fillb("x"), Some(&alice())).await.unwrap();

        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.feedback["errors"], json!(["nope"]));
        let (_, row) = &store.answer_rows("fitb_answers")[0];
        assert_eq!(row.correct, Some(false));
    }

    #[tokio::test]
    async fn test_fatal_grading_failure_keeps_audit_row() {
        let store = MemoryStore::new();
        store.add_question(
            "fopp",
            "q1",
            ServerFeedback {
                feedback: json!({}),
                base_course: "fopp".into(),
            },
        );
        let registry = registry_with(Arc::new(Broken(GradingError::Config("bad".into()))));
        let err = log_event(&store, &registry, fillb("x"), Some(&alice())).await.unwrap_err();

        assert!(err.is_internal());
        assert_eq!(store.useinfo_rows().len(), 1);
        assert!(store.answer_rows("fitb_answers").is_empty());
    }

    #[tokio::test]
    async fn test_schema_rejection_after_audit() {
        let store = MemoryStore::new();
        let registry = registry_with(Arc::new(AlwaysRight));
        let long = json!({
            "event": "mChoice",
            "act": "answer",
            "div_id": "mc1",
            "course_name": "fopp",
            "answer": "x".repeat(51)
        });
        let err = log_event(&store, &registry, long, Some(&alice())).await.unwrap_err();

        assert!(matches!(err, IngestError::Validation(_)));
        assert_eq!(store.useinfo_rows().len(), 1);
        assert!(store.answer_rows("mchoice_answers").is_empty());
    }

    #[tokio::test]
    async fn test_oversized_graded_row_is_stored_ungraded() {
        let store = MemoryStore::new();
        store.add_question(
            "fopp",
            "q1",
            ServerFeedback {
                feedback: json!({}),
                base_course: "fopp".into(),
            },
        );
        let registry = registry_with(Arc::new(Inflating));
        let response = log_event(&store, &registry, fillb("red,away"), Some(&alice()))
            .await
            .unwrap();

        assert_eq!(response.status, Status::Ok);
        let (_, row) = &store.answer_rows("fitb_answers")[0];
        assert_eq!(row.answer.as_deref(), Some("red,away"));
        assert_eq!(row.correct, None);
        assert_eq!(row.percent, None);
        let table = registry.lookup("fillb").unwrap();
        assert!(table.schema.validate(row).is_ok());
    }

    #[tokio::test]
    async fn test_timed_exam_start_is_zeroed() {
        let store = MemoryStore::new();
        let registry = registry_with(Arc::new(AlwaysRight));
        let start = json!({"event": "timedExam", "act": "start", "div_id": "exam1", "course_name": "fopp"});
        log_event(&store, &registry, start, Some(&alice())).await.unwrap();

        let (_, row) = &store.answer_rows("timed_exam")[0];
        assert_eq!(
            row.extra,
            crate::models::answer::AnswerExtra::TimedExam(Default::default())
        );
    }

    #[test]
    fn test_response_shape() {
        let mut feedback = Map::new();
        feedback.insert("correct".into(), json!(true));
        let body = serde_json::to_value(FeedbackResponse::ok(7, feedback)).unwrap();
        assert_eq!(body, json!({"status": "OK", "idx": 7, "correct": true}));

        let body = serde_json::to_value(FeedbackResponse::fail(7, "x")).unwrap();
        assert_eq!(body, json!({"status": "FAIL", "idx": 7, "detail": "x"}));
    }
}
