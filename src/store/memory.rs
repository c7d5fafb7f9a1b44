// src/store/memory.rs

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use serde_json::Value;

use super::{AnswerQuery, EventStore};
use crate::models::{
    answer::{AnswerRow, RowShape},
    event::UseinfoRow,
    question::ServerFeedback,
    user::AuthUser,
};

/// In-process [`EventStore`] with switches to make writes fail.
///
/// Used by the test suites to observe exactly what the pipeline persisted.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_useinfo: AtomicBool,
    fail_answers: AtomicBool,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    useinfo: Vec<(i64, UseinfoRow)>,
    answers: HashMap<&'static str, Vec<(i64, AnswerRow)>>,
    // (course_name, div_id) -> feedback
    questions: HashMap<(String, String), ServerFeedback>,
    users: HashMap<String, AuthUser>,
    // (username, course_name)
    instructors: HashSet<(String, String)>,
    tracebacks: Vec<(String, String)>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every audit-log write fail with a storage error.
    pub fn fail_useinfo_writes(&self, fail: bool) {
        self.fail_useinfo.store(fail, Ordering::SeqCst);
    }

    /// Makes every answer-table write fail with a storage error.
    pub fn fail_answer_writes(&self, fail: bool) {
        self.fail_answers.store(fail, Ordering::SeqCst);
    }

    pub fn add_question(&self, course_name: &str, div_id: &str, feedback: ServerFeedback) {
        self.lock()
            .questions
            .insert((course_name.to_string(), div_id.to_string()), feedback);
    }

    pub fn add_user(&self, username: &str, password_hash: &str, course_name: &str) {
        let mut inner = self.lock();
        let id = inner.next_id();
        inner.users.insert(
            username.to_string(),
            AuthUser {
                id,
                username: username.to_string(),
                password: password_hash.to_string(),
                course_name: Some(course_name.to_string()),
                created_on: Some(chrono::Utc::now()),
            },
        );
    }

    pub fn add_instructor(&self, username: &str, course_name: &str) {
        self.lock()
            .instructors
            .insert((username.to_string(), course_name.to_string()));
    }

    pub fn useinfo_rows(&self) -> Vec<(i64, UseinfoRow)> {
        self.lock().useinfo.clone()
    }

    pub fn answer_rows(&self, table: &str) -> Vec<(i64, AnswerRow)> {
        self.lock().answers.get(table).cloned().unwrap_or_default()
    }

    pub fn tracebacks(&self) -> Vec<(String, String)> {
        self.lock().tracebacks.clone()
    }
}

fn injected_failure(what: &str) -> sqlx::Error {
    sqlx::Error::Protocol(format!("injected {} write failure", what))
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_useinfo(&self, row: &UseinfoRow) -> Result<i64, sqlx::Error> {
        if self.fail_useinfo.load(Ordering::SeqCst) {
            return Err(injected_failure("useinfo"));
        }
        let mut inner = self.lock();
        let id = inner.next_id();
        inner.useinfo.push((id, row.clone()));
        Ok(id)
    }

    async fn insert_answer(
        &self,
        table: &'static str,
        _shape: RowShape,
        row: &AnswerRow,
    ) -> Result<i64, sqlx::Error> {
        if self.fail_answers.load(Ordering::SeqCst) {
            return Err(injected_failure(table));
        }
        let mut inner = self.lock();
        let id = inner.next_id();
        inner.answers.entry(table).or_default().push((id, row.clone()));
        Ok(id)
    }

    async fn fetch_last_answer(
        &self,
        table: &'static str,
        shape: RowShape,
        query: &AnswerQuery<'_>,
    ) -> Result<Option<Value>, sqlx::Error> {
        let inner = self.lock();
        let newest = inner
            .answers
            .get(table)
            .into_iter()
            .flatten()
            .filter(|(_, row)| {
                row.div_id == query.div_id
                    && row.course_name == query.course_name
                    && row.sid == query.sid
                    && query.deadline.is_none_or(|deadline| row.timestamp <= deadline)
            })
            .max_by_key(|(id, row)| (row.timestamp, *id));

        Ok(newest.map(|(id, row)| row.to_stored(*id, shape)))
    }

    async fn fetch_server_feedback(
        &self,
        div_id: &str,
        course_name: &str,
    ) -> Result<Option<ServerFeedback>, sqlx::Error> {
        Ok(self
            .lock()
            .questions
            .get(&(course_name.to_string(), div_id.to_string()))
            .cloned())
    }

    async fn fetch_user(&self, username: &str) -> Result<Option<AuthUser>, sqlx::Error> {
        Ok(self.lock().users.get(username).cloned())
    }

    async fn is_instructor(&self, username: &str, course_name: &str) -> Result<bool, sqlx::Error> {
        Ok(self
            .lock()
            .instructors
            .contains(&(username.to_string(), course_name.to_string())))
    }

    async fn insert_traceback(&self, route: &str, message: &str) -> Result<(), sqlx::Error> {
        self.lock()
            .tracebacks
            .push((route.to_string(), message.to_string()));
        Ok(())
    }
}
