// src/models/user.rs

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

/// Represents the 'auth_user' table in the database.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: i64,

    /// Unique username. Also the `sid` stamped on every logged event.
    pub username: String,

    /// Argon2 password hash.
    /// Skipped during serialization to prevent leaking sensitive data.
    #[serde(skip)]
    pub password: String,

    /// The course the student is currently working in.
    pub course_name: Option<String>,

    pub created_on: Option<chrono::DateTime<chrono::Utc>>,
}

/// DTO for user login.
#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(length(min = 1, max = 512))]
    pub username: String,
    #[validate(length(min = 1, max = 128))]
    pub password: String,
}
