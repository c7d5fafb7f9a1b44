// src/grading/mod.rs

//! Server-side graders.
//!
//! A grader receives the answer row before it is stored, rewrites its
//! `correct` / `percent` / `answer` fields, and returns the feedback that is
//! sent back to the page. Feedback never contains answer-key data.

pub mod builders;
pub mod fitb;
pub mod lp;
pub mod server_side;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::models::answer::AnswerRow;

/// Everything a grader may look at for one submission.
/// Owned by a single request and dropped once the row is stored.
pub struct GradingContext<'a> {
    /// The row about to be stored. Graders update it in place.
    pub row: &'a mut AnswerRow,
    /// The question's `feedback` configuration.
    pub feedback: &'a Value,
    /// Locates on-disk grading resources.
    pub base_course: &'a str,
    /// Seed of a dynamic problem, if the page sent one.
    pub seed: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum GradingError {
    /// Bad submission or a failed build step. Stored as an incorrect answer,
    /// and the message is shown to the student.
    #[error("{0}")]
    Failure(String),

    /// The question or the server is set up wrong. Not the student's problem.
    #[error("grader misconfigured: {0}")]
    Config(String),
}

impl GradingError {
    /// The feedback shape the pages understand for a failed grade.
    pub fn to_feedback(&self) -> Map<String, Value> {
        let mut feedback = Map::new();
        feedback.insert("errors".into(), json!([self.to_string()]));
        feedback
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, GradingError::Config(_))
    }
}

#[async_trait]
pub trait Grader: Send + Sync {
    async fn grade(&self, ctx: GradingContext<'_>) -> Result<Map<String, Value>, GradingError>;

    /// Whether grading is cheap enough to be re-run when a stored answer is
    /// fetched, to rebuild the feedback the page shows next to it. `seed` is
    /// the one the page sent with the fetch, if any.
    fn replays_on_fetch(&self, _feedback: &Value, _seed: Option<u64>) -> bool {
        false
    }
}
