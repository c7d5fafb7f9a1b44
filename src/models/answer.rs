// src/models/answer.rs

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use validator::Validate;

use crate::models::event::TimedExamResult;

/// A row for one of the `xxx_answers` tables.
///
/// Produced from a validated [`EventRecord`](crate::models::event::EventRecord),
/// possibly rewritten by a grader, then checked against the table's schema.
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerRow {
    pub timestamp: DateTime<Utc>,
    pub div_id: String,
    pub sid: String,
    pub course_name: String,
    pub answer: Option<String>,
    pub correct: Option<bool>,
    pub percent: Option<f64>,
    /// Only kept by tables that have a `source` column.
    pub source: Option<String>,
    pub extra: AnswerExtra,
}

/// Columns specific to a family of answer tables.
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerExtra {
    None,
    Unittest { passed: i32, failed: i32 },
    TimedExam(TimedExamResult),
}

/// Which columns an answer table has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowShape {
    /// answer, correct, percent
    Scored,
    /// answer, correct, percent, source
    ScoredWithSource,
    /// answer only
    Unscored,
    /// answer, correct, percent, passed, failed
    Unittest,
    /// correct, incorrect, skipped, time_taken, reset
    TimedExam,
}

impl AnswerRow {
    /// The row as it reads back from storage, keyed by column name.
    pub fn to_stored(&self, id: i64, shape: RowShape) -> Value {
        let mut row = Map::new();
        row.insert("id".into(), json!(id));
        row.insert("timestamp".into(), json!(self.timestamp));
        row.insert("div_id".into(), json!(self.div_id));
        row.insert("sid".into(), json!(self.sid));
        row.insert("course_name".into(), json!(self.course_name));

        if let (RowShape::TimedExam, AnswerExtra::TimedExam(t)) = (shape, &self.extra) {
            row.insert("correct".into(), json!(t.correct));
            row.insert("incorrect".into(), json!(t.incorrect));
            row.insert("skipped".into(), json!(t.skipped));
            row.insert("time_taken".into(), json!(t.time_taken));
            row.insert("reset".into(), json!(t.reset));
            return Value::Object(row);
        }

        row.insert("answer".into(), json!(self.answer));
        if shape != RowShape::Unscored {
            row.insert("correct".into(), json!(self.correct));
            row.insert("percent".into(), json!(self.percent));
        }
        if shape == RowShape::ScoredWithSource {
            row.insert("source".into(), json!(self.source));
        }
        if let AnswerExtra::Unittest { passed, failed } = self.extra {
            row.insert("passed".into(), json!(passed));
            row.insert("failed".into(), json!(failed));
        }

        Value::Object(row)
    }
}

/// DTO for `POST /assessment/results`.
#[derive(Debug, Deserialize, Validate)]
pub struct AssessmentRequest {
    #[validate(length(min = 1, max = 512))]
    pub course: String,
    #[validate(length(min = 1, max = 512))]
    pub div_id: String,
    #[validate(length(min = 1, max = 512))]
    pub event: String,
    pub sid: Option<String>,
    pub deadline: Option<String>,
    /// Seed of a dynamic problem, used when feedback is rebuilt.
    pub seed: Option<u64>,
}

impl AssessmentRequest {
    /// Parses `deadline` as RFC 3339 or `YYYY-MM-DD HH:MM:SS` (UTC).
    /// An empty string means no deadline.
    pub fn deadline(&self) -> Result<Option<DateTime<Utc>>, String> {
        let Some(raw) = self.deadline.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(None);
        };

        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Ok(Some(dt.with_timezone(&Utc)));
        }

        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
            .map(|naive| Some(naive.and_utc()))
            .map_err(|_| format!("Unrecognized deadline '{}'", raw))
    }
}
