// src/handlers/auth.rs

use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::{HeaderValue, header},
    response::IntoResponse,
};
use serde_json::json;
use validator::Validate;

use crate::{
    config::Config,
    error::AppError,
    models::user::LoginRequest,
    store::EventStore,
    utils::{
        hash::verify_password,
        jwt::{TOKEN_COOKIE, sign_jwt},
    },
};

/// Authenticates a user and returns a JWT token.
///
/// Verifies the username and password against `auth_user`. The token is
/// returned in the body and also set as the `access_token` cookie the book
/// pages send back.
pub async fn login(
    State(store): State<Arc<dyn EventStore>>,
    State(config): State<Config>,
    Json(payload): Json<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    if let Err(validation_errors) = payload.validate() {
        return Err(AppError::BadRequest(validation_errors.to_string()));
    }

    let user = store.fetch_user(&payload.username).await.map_err(|e| {
        tracing::error!("Login DB error: {:?}", e);
        AppError::InternalServerError(e.to_string())
    })?;

    let user = user.ok_or(AppError::AuthError("Invalid username or password".to_string()))?;

    if !verify_password(&payload.password, &user.password) {
        return Err(AppError::AuthError("Invalid username or password".to_string()));
    }

    let course = user.course_name.as_deref();
    let is_instructor = match course {
        Some(course) => store.is_instructor(&user.username, course).await?,
        None => false,
    };
    let role = if is_instructor { "instructor" } else { "student" };

    let token = sign_jwt(
        &user.username,
        course,
        role,
        &config.jwt_secret,
        config.jwt_expiration,
    )?;

    let cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        TOKEN_COOKIE, token, config.jwt_expiration
    );
    let cookie = HeaderValue::from_str(&cookie)
        .map_err(|e| AppError::InternalServerError(e.to_string()))?;

    tracing::info!(user = %user.username, role, "User logged in");

    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(json!({
            "access_token": token,
            "token_type": "Bearer"
        })),
    ))
}
