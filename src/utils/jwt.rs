// src/utils/jwt.rs

use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode, header},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::{config::Config, error::AppError};

/// Name of the cookie the book pages send the token in.
pub const TOKEN_COOKIE: &str = "access_token";

/// JWT Claims structure.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Claims {
    /// Subject - the username, stamped as `sid` on logged events.
    pub sub: String,
    /// The course the user is currently working in.
    pub course: Option<String>,
    /// 'student' or 'instructor'.
    pub role: String,
    /// Expiration time as Unix timestamp.
    pub exp: usize,
}

/// The identity of a request, if it carried a valid token.
/// Inserted by [`identity_middleware`].
#[derive(Debug, Clone, Default)]
pub struct MaybeClaims(pub Option<Claims>);

/// Signs a new JWT for the user.
pub fn sign_jwt(
    username: &str,
    course: Option<&str>,
    role: &str,
    secret: &str,
    expiration_seconds: u64,
) -> Result<String, AppError> {
    // Calculate expiration: current time + expiration_seconds
    let expiration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| AppError::InternalServerError(e.to_string()))?
        .as_secs() as usize
        + expiration_seconds as usize;

    let claims = Claims {
        sub: username.to_owned(),
        course: course.map(str::to_owned),
        role: role.to_owned(),
        exp: expiration,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::InternalServerError(e.to_string()))
}

/// Verifies and decodes a JWT string.
///
/// Returns the `Claims` if valid, otherwise returns an `AppError`.
pub fn verify_jwt(token: &str, secret: &str) -> Result<Claims, AppError> {
    let token_data = decode(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AppError::AuthError("Invalid token".to_string()))?;

    Ok(token_data.claims)
}

/// Finds the token in `Authorization: Bearer <token>` or the `access_token` cookie.
pub fn extract_token(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if bearer.is_some() {
        return bearer;
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == TOKEN_COOKIE && !value.is_empty()).then_some(value)
        })
}

/// Axum Middleware: Authentication.
///
/// Validates the token. If valid, injects `Claims` into the request
/// extensions for handlers to use. If invalid, returns 401 Unauthorized.
pub async fn auth_middleware(
    State(config): State<Config>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = extract_token(req.headers()).ok_or(StatusCode::UNAUTHORIZED)?;

    match verify_jwt(token, &config.jwt_secret) {
        Ok(claims) => {
            req.extensions_mut().insert(MaybeClaims(Some(claims.clone())));
            req.extensions_mut().insert(claims);
            Ok(next.run(req).await)
        }
        Err(_) => Err(StatusCode::UNAUTHORIZED),
    }
}

/// Axum Middleware: Optional identity.
///
/// Never rejects. Attaches [`MaybeClaims`] so the handler decides what an
/// anonymous request means.
pub async fn identity_middleware(
    State(config): State<Config>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let claims = extract_token(req.headers()).and_then(|token| {
        verify_jwt(token, &config.jwt_secret)
            .map_err(|_| tracing::debug!("Ignoring invalid access token"))
            .ok()
    });

    req.extensions_mut().insert(MaybeClaims(claims));
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_sign_and_verify() {
        let token = sign_jwt("alice", Some("fopp"), "student", "secret", 60).unwrap();
        let claims = verify_jwt(&token, "secret").unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.course.as_deref(), Some("fopp"));
        assert!(verify_jwt(&token, "other").is_err());
    }

    #[test]
    fn test_extract_token_sources() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_token(&headers), None);

        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("session=x; access_token=abc; theme=dark"),
        );
        assert_eq!(extract_token(&headers), Some("abc"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer xyz"));
        assert_eq!(extract_token(&headers), Some("xyz"));
    }
}
