// src/models/event.rs

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::models::answer::{AnswerExtra, AnswerRow};

/// The JSON payload a book page sends for (nearly) every click.
///
/// This is the untrusted wire shape. It is validated and turned into an
/// [`EventRecord`] before anything is written.
#[derive(Debug, Deserialize, Validate)]
pub struct LogItemIncoming {
    #[validate(length(min = 1, max = 512))]
    pub event: String,

    #[validate(length(max = 512))]
    pub act: String,

    #[validate(length(min = 1, max = 512))]
    pub div_id: String,

    #[serde(alias = "course_id")]
    #[validate(length(min = 1, max = 512))]
    pub course_name: String,

    /// Client-supplied student id. Ignored: the authenticated identity wins.
    #[serde(default)]
    pub sid: Option<String>,

    /// Free-form answer. Strings are stored as-is, any other JSON value as its JSON text.
    #[serde(default)]
    pub answer: Option<Value>,

    #[serde(default)]
    pub correct: Option<CorrectField>,

    #[serde(default)]
    #[validate(range(min = 0.0, max = 100.0))]
    pub percent: Option<f64>,

    // Timed exam counters.
    #[serde(default)]
    pub incorrect: Option<i32>,
    #[serde(default)]
    pub skipped: Option<i32>,
    #[serde(default)]
    pub time: Option<i32>,

    /// Used by parsons and codelens.
    #[serde(default)]
    #[validate(length(max = 512))]
    pub source: Option<String>,

    #[serde(default)]
    #[validate(length(max = 512))]
    pub chapter: Option<String>,

    #[serde(default)]
    #[validate(length(max = 512))]
    pub subchapter: Option<String>,

    /// Per-student seed of a dynamic problem.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Hours from UTC, as `getTimezoneOffset() / 60`. Half-hour zones send fractions.
    #[serde(default)]
    pub timezoneoffset: Option<f64>,

    #[serde(default, rename = "clientLoginStatus")]
    pub client_login_status: Option<bool>,

    /// Client clock. Never trusted; the server stamps its own time.
    #[serde(default)]
    pub timestamp: Option<Value>,
}

/// `correct` is a flag for most questions and a count for timed exams.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum CorrectField {
    Flag(bool),
    Count(i64),
}

/// One validated student interaction. Immutable once built.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub event_type: String,
    pub action: String,
    pub component_id: String,
    pub student_id: String,
    pub course_name: String,
    pub timestamp: DateTime<Utc>,
    pub answer: Option<String>,
    pub correct: Option<bool>,
    pub percent: Option<f64>,
    pub source: Option<String>,
    pub chapter: Option<String>,
    pub subchapter: Option<String>,
    pub seed: Option<u64>,
    pub payload: EventPayload,
}

/// What kind of answer row (if any) an event produces.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// Only the audit row is written.
    LogOnly,
    /// A plain answer-table row built from the common fields.
    Answer,
    Unittest(UnittestResult),
    TimedExam(TimedExamResult),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnittestResult {
    pub percent: f64,
    pub passed: i32,
    pub failed: i32,
}

static UNITTEST_ACT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^percent:(\d+(?:\.\d+)?):passed:(\d+):failed:(\d+)$").expect("valid regex")
});

impl UnittestResult {
    /// Parses `percent:<p>:passed:<n>:failed:<m>`. Anything else is rejected.
    pub fn parse(act: &str) -> Result<Self, ValidationError> {
        let invalid = || {
            let mut err = ValidationError::new("unittest_action");
            err.message = Some("expected percent:<p>:passed:<n>:failed:<m>".into());
            err
        };

        let caps = UNITTEST_ACT.captures(act.trim()).ok_or_else(invalid)?;
        let percent: f64 = caps[1].parse().map_err(|_| invalid())?;
        let passed: i32 = caps[2].parse().map_err(|_| invalid())?;
        let failed: i32 = caps[3].parse().map_err(|_| invalid())?;

        if !(0.0..=100.0).contains(&percent) {
            return Err(invalid());
        }

        Ok(Self { percent, passed, failed })
    }

    pub fn correct(&self) -> bool {
        self.percent == 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct TimedExamResult {
    pub correct: i32,
    pub incorrect: i32,
    pub skipped: i32,
    pub time_taken: i32,
    pub reset: bool,
}

/// The generic audit-log (`useinfo`) row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UseinfoRow {
    pub timestamp: DateTime<Utc>,
    pub sid: String,
    pub event: String,
    pub act: String,
    pub div_id: String,
    pub course_id: String,
    pub chapter: Option<String>,
    pub subchapter: Option<String>,
}

impl LogItemIncoming {
    /// Validates the payload and produces an [`EventRecord`].
    ///
    /// * `registered`: whether `event` has an answer table.
    /// * `student_id`: the authenticated identity (overrides `sid`).
    /// * `now`: server time (overrides `timestamp`).
    pub fn into_record(
        self,
        registered: bool,
        student_id: &str,
        now: DateTime<Utc>,
    ) -> Result<EventRecord, ValidationErrors> {
        self.validate()?;

        let answer = self.answer.and_then(|value| match value {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        });

        let mut record = EventRecord {
            event_type: self.event,
            action: self.act,
            component_id: self.div_id,
            student_id: student_id.to_string(),
            course_name: self.course_name,
            timestamp: now,
            answer,
            correct: match self.correct {
                Some(CorrectField::Flag(flag)) => Some(flag),
                _ => None,
            },
            percent: self.percent,
            source: self.source,
            chapter: self.chapter,
            subchapter: self.subchapter,
            seed: self.seed,
            payload: EventPayload::LogOnly,
        };

        if !registered {
            return Ok(record);
        }

        record.payload = match record.event_type.as_str() {
            "unittest" => {
                let result = UnittestResult::parse(&record.action).map_err(|e| {
                    let mut errors = ValidationErrors::new();
                    errors.add("act", e);
                    errors
                })?;
                record.correct = Some(result.correct());
                record.percent = Some(result.percent);
                EventPayload::Unittest(result)
            }
            "timedExam" => match record.action.as_str() {
                "start" => EventPayload::TimedExam(TimedExamResult::default()),
                "reset" => EventPayload::TimedExam(TimedExamResult {
                    reset: true,
                    ..Default::default()
                }),
                "finish" => {
                    let correct = match self.correct {
                        Some(CorrectField::Count(n)) => i32::try_from(n).unwrap_or(0),
                        _ => 0,
                    };
                    EventPayload::TimedExam(TimedExamResult {
                        correct,
                        incorrect: self.incorrect.unwrap_or(0),
                        skipped: self.skipped.unwrap_or(0),
                        time_taken: self.time.unwrap_or(0),
                        reset: false,
                    })
                }
                // Pauses, navigation, etc. are only audited.
                _ => EventPayload::LogOnly,
            },
            "mChoice" => {
                if record.answer.is_none() {
                    if let Some((answer, correct)) = parse_mchoice_act(&record.action) {
                        record.answer = Some(answer);
                        record.correct = record.correct.or(Some(correct));
                    }
                }
                EventPayload::Answer
            }
            _ => EventPayload::Answer,
        };

        Ok(record)
    }
}

/// Older multiple-choice clients encode the answer in `act`: `answer:0,2:correct`.
fn parse_mchoice_act(act: &str) -> Option<(String, bool)> {
    let mut parts = act.splitn(3, ':');
    if parts.next()? != "answer" {
        return None;
    }
    let answer = parts.next()?.to_string();
    let correct = parts.next()? == "correct";
    Some((answer, correct))
}

impl EventRecord {
    pub fn useinfo_row(&self) -> UseinfoRow {
        UseinfoRow {
            timestamp: self.timestamp,
            sid: self.student_id.clone(),
            event: self.event_type.clone(),
            act: self.action.clone(),
            div_id: self.component_id.clone(),
            course_id: self.course_name.clone(),
            chapter: self.chapter.clone(),
            subchapter: self.subchapter.clone(),
        }
    }

    /// Builds the storage row for the answer table, or `None` for log-only events.
    /// The row still has to pass the table's schema check before it is written.
    pub fn answer_row(&self) -> Option<AnswerRow> {
        let extra = match &self.payload {
            EventPayload::LogOnly => return None,
            EventPayload::Answer => AnswerExtra::None,
            EventPayload::Unittest(result) => AnswerExtra::Unittest {
                passed: result.passed,
                failed: result.failed,
            },
            EventPayload::TimedExam(result) => AnswerExtra::TimedExam(*result),
        };

        let is_timed = matches!(extra, AnswerExtra::TimedExam(_));

        Some(AnswerRow {
            timestamp: self.timestamp,
            div_id: self.component_id.clone(),
            sid: self.student_id.clone(),
            course_name: self.course_name.clone(),
            answer: if is_timed { None } else { self.answer.clone() },
            correct: if is_timed { None } else { self.correct },
            percent: if is_timed { None } else { self.percent },
            source: self.source.clone(),
            extra,
        })
    }
}
