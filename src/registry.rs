// src/registry.rs

//! Maps an event name to the answer table that stores it.
//!
//! Built once at startup and shared read-only (behind an `Arc`) afterwards.

use std::{collections::HashMap, fmt, sync::Arc};

use validator::{ValidationError, ValidationErrors};

use crate::{
    grading::Grader,
    models::answer::{AnswerExtra, AnswerRow, RowShape},
};

/// Events that are audited but never produce an answer row.
pub const LOG_ONLY_EVENTS: &[&str] = &[
    "page",
    "activecode",
    "video",
    "poll",
    "reveal",
    "showeval",
    "selectquestion",
    "hparsons",
    "codelens",
];

const SHORT_COLUMN: usize = 512;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("event type '{0}' is registered twice")]
    DuplicateEventType(String),
    #[error("unknown event type '{0}'")]
    UnknownEventType(String),
}

/// Validation rules for a row of one answer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowSchema {
    pub shape: RowShape,
    /// `None` for text columns without a length limit.
    pub answer_max_len: Option<usize>,
}

impl RowSchema {
    pub const fn new(shape: RowShape, answer_max_len: Option<usize>) -> Self {
        Self { shape, answer_max_len }
    }

    /// Checks a row right before it is written.
    pub fn validate(&self, row: &AnswerRow) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        for (field, value) in [
            ("div_id", row.div_id.as_str()),
            ("sid", row.sid.as_str()),
            ("course_name", row.course_name.as_str()),
        ] {
            if value.is_empty() || value.chars().count() > SHORT_COLUMN {
                errors.add(field, length_error(SHORT_COLUMN));
            }
        }

        if let (Some(max), Some(answer)) = (self.answer_max_len, &row.answer) {
            if answer.chars().count() > max {
                errors.add("answer", length_error(max));
            }
        }

        if let Some(percent) = row.percent {
            if !percent.is_finite() || percent < 0.0 {
                errors.add("percent", ValidationError::new("range"));
            }
        }

        match (self.shape, &row.extra) {
            (RowShape::TimedExam, AnswerExtra::TimedExam(t)) => {
                if t.correct < 0 || t.incorrect < 0 || t.skipped < 0 || t.time_taken < 0 {
                    errors.add("correct", ValidationError::new("range"));
                }
            }
            (RowShape::Unittest, AnswerExtra::Unittest { passed, failed }) => {
                if *passed < 0 || *failed < 0 {
                    errors.add("act", ValidationError::new("range"));
                }
            }
            (RowShape::TimedExam, _) | (RowShape::Unittest, _) => {
                errors.add("event", ValidationError::new("shape"));
            }
            (_, AnswerExtra::None) => {}
            (_, _) => errors.add("event", ValidationError::new("shape")),
        }

        if self.shape == RowShape::ScoredWithSource {
            if let Some(source) = &row.source {
                if source.chars().count() > SHORT_COLUMN {
                    errors.add("source", length_error(SHORT_COLUMN));
                }
            }
        }

        if errors.errors().is_empty() { Ok(()) } else { Err(errors) }
    }
}

fn length_error(max: usize) -> ValidationError {
    let mut err = ValidationError::new("length");
    err.add_param("max".into(), &max);
    err
}

/// One registered answer table.
pub struct AnswerTable {
    pub event_type: String,
    pub table_name: &'static str,
    pub schema: RowSchema,
    pub grader: Option<Arc<dyn Grader>>,
}

impl fmt::Debug for AnswerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnswerTable")
            .field("event_type", &self.event_type)
            .field("table_name", &self.table_name)
            .field("schema", &self.schema)
            .field("graded", &self.grader.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct AnswerTableRegistry {
    tables: HashMap<String, AnswerTable>,
}

impl AnswerTableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry. Registering the same event twice is an error.
    pub fn register(
        &mut self,
        event_type: &str,
        table_name: &'static str,
        schema: RowSchema,
        grader: Option<Arc<dyn Grader>>,
    ) -> Result<(), RegistryError> {
        if self.tables.contains_key(event_type) {
            return Err(RegistryError::DuplicateEventType(event_type.to_string()));
        }

        self.tables.insert(
            event_type.to_string(),
            AnswerTable {
                event_type: event_type.to_string(),
                table_name,
                schema,
                grader,
            },
        );
        Ok(())
    }

    pub fn lookup(&self, event_type: &str) -> Result<&AnswerTable, RegistryError> {
        self.tables
            .get(event_type)
            .ok_or_else(|| RegistryError::UnknownEventType(event_type.to_string()))
    }

    pub fn is_registered(&self, event_type: &str) -> bool {
        self.tables.contains_key(event_type)
    }

    pub fn is_log_only(event_type: &str) -> bool {
        LOG_ONLY_EVENTS.contains(&event_type)
    }

    /// The tables used by the book components, with the FITB and linked-program graders attached.
    pub fn standard(
        fitb: Arc<dyn Grader>,
        lp: Arc<dyn Grader>,
    ) -> Result<Self, RegistryError> {
        let short = Some(SHORT_COLUMN);
        let mut registry = Self::new();

        registry.register("mChoice", "mchoice_answers", RowSchema::new(RowShape::Scored, Some(50)), None)?;
        registry.register("fillb", "fitb_answers", RowSchema::new(RowShape::Scored, short), Some(fitb))?;
        registry.register("dragNdrop", "dragndrop_answers", RowSchema::new(RowShape::Scored, short), None)?;
        registry.register("clickableArea", "clickablearea_answers", RowSchema::new(RowShape::Scored, short), None)?;
        registry.register("parsons", "parsons_answers", RowSchema::new(RowShape::ScoredWithSource, short), None)?;
        registry.register("codelens1", "codelens_answers", RowSchema::new(RowShape::ScoredWithSource, short), None)?;
        registry.register("shortanswer", "shortanswer_answers", RowSchema::new(RowShape::Unscored, short), None)?;
        registry.register("unittest", "unittest_answers", RowSchema::new(RowShape::Unittest, None), None)?;
        registry.register("lp_build", "lp_answers", RowSchema::new(RowShape::Scored, None), Some(lp))?;
        registry.register("timedExam", "timed_exam", RowSchema::new(RowShape::TimedExam, None), None)?;

        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grading::{GradingContext, GradingError};
    use crate::models::event::TimedExamResult;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{Map, Value};

    struct NoopGrader;

    #[async_trait]
    impl Grader for NoopGrader {
        async fn grade(&self, _ctx: GradingContext<'_>) -> Result<Map<String, Value>, GradingError> {
            Ok(Map::new())
        }
    }

    fn standard() -> AnswerTableRegistry {
        AnswerTableRegistry::standard(Arc::new(NoopGrader), Arc::new(NoopGrader)).unwrap()
    }

    fn row(answer: &str) -> AnswerRow {
        AnswerRow {
            timestamp: Utc::now(),
            div_id: "q1".into(),
            sid: "alice".into(),
            course_name: "fopp".into(),
            answer: Some(answer.into()),
            correct: Some(true),
            percent: Some(1.0),
            source: None,
            extra: AnswerExtra::None,
        }
    }

    #[test]
    fn test_lookup_is_stable() {
        let registry = standard();
        let first = registry.lookup("fillb").unwrap() as *const AnswerTable;
        for _ in 0..3 {
            let again = registry.lookup("fillb").unwrap();
            assert!(std::ptr::eq(first, again));
            assert_eq!(again.table_name, "fitb_answers");
            assert!(again.grader.is_some());
        }
        assert!(registry.lookup("mChoice").unwrap().grader.is_none());
    }

    #[test]
    fn test_lookup_unknown_fails_the_same_way() {
        let registry = standard();
        for _ in 0..2 {
            assert_eq!(
                registry.lookup("nope").unwrap_err(),
                RegistryError::UnknownEventType("nope".into())
            );
        }
        // Log-only events have no table either.
        assert!(registry.lookup("page").is_err());
        assert!(AnswerTableRegistry::is_log_only("page"));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = AnswerTableRegistry::new();
        let schema = RowSchema::new(RowShape::Scored, Some(10));
        registry.register("mChoice", "mchoice_answers", schema, None).unwrap();
        let err = registry
            .register("mChoice", "other_answers", schema, None)
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateEventType("mChoice".into()));
        // The first entry is untouched.
        assert_eq!(registry.lookup("mChoice").unwrap().table_name, "mchoice_answers");
    }

    #[test]
    fn test_schema_enforces_answer_length() {
        let schema = RowSchema::new(RowShape::Scored, Some(50));
        assert!(schema.validate(&row("0,2")).is_ok());

        let err = schema.validate(&row(&"x".repeat(51))).unwrap_err();
        assert!(err.field_errors().contains_key("answer"));

        let unbounded = RowSchema::new(RowShape::Scored, None);
        assert!(unbounded.validate(&row(&"x".repeat(10_000))).is_ok());
    }

    #[test]
    fn test_schema_enforces_shape() {
        let mut timed = row("");
        timed.extra = AnswerExtra::TimedExam(TimedExamResult::default());
        assert!(RowSchema::new(RowShape::TimedExam, None).validate(&timed).is_ok());
        assert!(RowSchema::new(RowShape::Scored, None).validate(&timed).is_err());
        assert!(RowSchema::new(RowShape::TimedExam, None).validate(&row("a")).is_err());
    }
}
