// src/store/postgres.rs

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder, types::Json};

use super::{AnswerQuery, EventStore};
use crate::models::{
    answer::{AnswerExtra, AnswerRow, RowShape},
    event::UseinfoRow,
    question::{Question, ServerFeedback},
    user::AuthUser,
};

/// Postgres-backed [`EventStore`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn insert_useinfo(&self, row: &UseinfoRow) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            INSERT INTO useinfo (timestamp, sid, event, act, div_id, course_id, chapter, sub_chapter)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(row.timestamp)
        .bind(&row.sid)
        .bind(&row.event)
        .bind(&row.act)
        .bind(&row.div_id)
        .bind(&row.course_id)
        .bind(&row.chapter)
        .bind(&row.subchapter)
        .fetch_one(&self.pool)
        .await
    }

    async fn insert_answer(
        &self,
        table: &'static str,
        shape: RowShape,
        row: &AnswerRow,
    ) -> Result<i64, sqlx::Error> {
        let mut query_builder = QueryBuilder::<Postgres>::new("INSERT INTO ");
        query_builder.push(table);

        let columns = match shape {
            RowShape::Scored => "answer, correct, percent",
            RowShape::ScoredWithSource => "answer, correct, percent, source",
            RowShape::Unscored => "answer",
            RowShape::Unittest => "answer, correct, percent, passed, failed",
            RowShape::TimedExam => "correct, incorrect, skipped, time_taken, reset",
        };
        query_builder.push(" (timestamp, div_id, sid, course_name, ");
        query_builder.push(columns);
        query_builder.push(") VALUES (");

        let mut separated = query_builder.separated(", ");
        separated.push_bind(row.timestamp);
        separated.push_bind(row.div_id.clone());
        separated.push_bind(row.sid.clone());
        separated.push_bind(row.course_name.clone());

        match (shape, &row.extra) {
            (RowShape::TimedExam, AnswerExtra::TimedExam(t)) => {
                separated.push_bind(t.correct);
                separated.push_bind(t.incorrect);
                separated.push_bind(t.skipped);
                separated.push_bind(t.time_taken);
                separated.push_bind(t.reset);
            }
            (RowShape::TimedExam, _) => {
                return Err(sqlx::Error::Protocol(format!(
                    "{} requires timed exam columns",
                    table
                )));
            }
            _ => {
                separated.push_bind(row.answer.clone());
                if shape != RowShape::Unscored {
                    separated.push_bind(row.correct);
                    separated.push_bind(row.percent);
                }
                if shape == RowShape::ScoredWithSource {
                    separated.push_bind(row.source.clone());
                }
                if shape == RowShape::Unittest {
                    let (passed, failed) = match row.extra {
                        AnswerExtra::Unittest { passed, failed } => (passed, failed),
                        _ => (0, 0),
                    };
                    separated.push_bind(passed);
                    separated.push_bind(failed);
                }
            }
        }
        separated.push_unseparated(") RETURNING id");

        query_builder
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
    }

    async fn fetch_last_answer(
        &self,
        table: &'static str,
        _shape: RowShape,
        query: &AnswerQuery<'_>,
    ) -> Result<Option<Value>, sqlx::Error> {
        let mut query_builder = QueryBuilder::<Postgres>::new("SELECT row_to_json(t)::jsonb FROM ");
        query_builder.push(table);
        query_builder.push(" t WHERE t.div_id = ");
        query_builder.push_bind(query.div_id);
        query_builder.push(" AND t.course_name = ");
        query_builder.push_bind(query.course_name);
        query_builder.push(" AND t.sid = ");
        query_builder.push_bind(query.sid);
        if let Some(deadline) = query.deadline {
            query_builder.push(" AND t.timestamp <= ");
            query_builder.push_bind(deadline);
        }
        query_builder.push(" ORDER BY t.timestamp DESC, t.id DESC LIMIT 1");

        let row: Option<Json<Value>> = query_builder
            .build_query_scalar()
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|Json(value)| value))
    }

    async fn fetch_server_feedback(
        &self,
        div_id: &str,
        course_name: &str,
    ) -> Result<Option<ServerFeedback>, sqlx::Error> {
        let question: Option<Question> = sqlx::query_as(
            r#"
            SELECT q.id, q.name, q.base_course, q.question_type, q.feedback
            FROM courses c
            JOIN questions q ON q.base_course = COALESCE(c.base_course, c.course_name)
            WHERE c.course_name = $1
              AND q.name = $2
              AND q.feedback IS NOT NULL
            "#,
        )
        .bind(course_name)
        .bind(div_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(question.and_then(Question::into_server_feedback))
    }

    async fn fetch_user(&self, username: &str) -> Result<Option<AuthUser>, sqlx::Error> {
        sqlx::query_as::<_, AuthUser>(
            r#"
            SELECT id, username, password, course_name, created_on
            FROM auth_user
            WHERE username = $1
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
    }

    async fn is_instructor(&self, username: &str, course_name: &str) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM course_instructor ci
                JOIN courses c ON c.id = ci.course
                JOIN auth_user u ON u.id = ci.instructor
                WHERE u.username = $1 AND c.course_name = $2
            )
            "#,
        )
        .bind(username)
        .bind(course_name)
        .fetch_one(&self.pool)
        .await
    }

    async fn insert_traceback(&self, route: &str, message: &str) -> Result<(), sqlx::Error> {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());

        sqlx::query(
            r#"
            INSERT INTO traceback (timestamp, route, err_message, hostname)
            VALUES (NOW(), $1, $2, $3)
            "#,
        )
        .bind(route)
        .bind(message)
        .bind(hostname)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
