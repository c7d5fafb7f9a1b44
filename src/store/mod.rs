// src/store/mod.rs

//! Persistence boundary for the logging and grading pipeline.
//!
//! Every database access of the request path goes through [`EventStore`], so
//! the pipeline can be exercised against [`memory::MemoryStore`] in tests and
//! against Postgres ([`postgres::PgStore`]) in production.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::models::{
    answer::{AnswerRow, RowShape},
    event::UseinfoRow,
    question::ServerFeedback,
    user::AuthUser,
};

/// Filter for the most recent answer of one student to one component.
#[derive(Debug, Clone)]
pub struct AnswerQuery<'a> {
    pub div_id: &'a str,
    pub course_name: &'a str,
    pub sid: &'a str,
    pub deadline: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends an audit-log row and returns its id.
    async fn insert_useinfo(&self, row: &UseinfoRow) -> Result<i64, sqlx::Error>;

    /// Appends a row to `table` and returns its id.
    /// `table` always comes from the answer-table registry, never from a client.
    async fn insert_answer(
        &self,
        table: &'static str,
        shape: RowShape,
        row: &AnswerRow,
    ) -> Result<i64, sqlx::Error>;

    /// Returns the newest matching row as a column-name keyed object.
    async fn fetch_last_answer(
        &self,
        table: &'static str,
        shape: RowShape,
        query: &AnswerQuery<'_>,
    ) -> Result<Option<Value>, sqlx::Error>;

    /// Looks up the server-side grading configuration of `div_id` as seen from `course_name`.
    async fn fetch_server_feedback(
        &self,
        div_id: &str,
        course_name: &str,
    ) -> Result<Option<ServerFeedback>, sqlx::Error>;

    async fn fetch_user(&self, username: &str) -> Result<Option<AuthUser>, sqlx::Error>;

    async fn is_instructor(&self, username: &str, course_name: &str) -> Result<bool, sqlx::Error>;

    /// Records an internal failure for later inspection.
    async fn insert_traceback(&self, route: &str, message: &str) -> Result<(), sqlx::Error>;
}

/// Persists an internal error, logging (not propagating) any failure to do so.
pub async fn record_traceback(store: &dyn EventStore, route: &str, message: &str) {
    if let Err(e) = store.insert_traceback(route, message).await {
        tracing::error!("Failed to persist traceback for {}: {:?}", route, e);
    }
}
