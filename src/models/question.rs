// src/models/question.rs

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{prelude::FromRow, types::Json};

/// Represents the 'questions' table in the database.
/// Questions belong to a base course; derived courses share them.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Question {
    pub id: i64,

    /// The `div_id` of the component on the page.
    pub name: String,

    pub base_course: String,

    pub question_type: Option<String>,

    /// Grading configuration for server-side feedback (answer keys, dynamic
    /// variables, template paths). `NULL` means the client grades itself.
    pub feedback: Option<Json<Value>>,
}

impl Question {
    /// `None` when the component grades itself in the browser.
    pub fn into_server_feedback(self) -> Option<ServerFeedback> {
        let base_course = self.base_course;
        self.feedback.map(|Json(feedback)| ServerFeedback {
            feedback,
            base_course,
        })
    }
}

/// The grading configuration for one component, resolved for a course.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerFeedback {
    pub feedback: Value,
    pub base_course: String,
}
