// src/middleware/auth.rs
//
// Cookie-based session authentication for the HTTP routes. The same
// token-to-user resolution is reused by the websocket handshake in
// handlers/chat.rs; both share `resolve_user`.
use crate::models::auth::{ErrorResponse, User};
use crate::AppState;
use axum::{
    extract::{Extension, Request},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use uuid::Uuid;

/// The resolved request identity, attached to request extensions for
/// downstream handlers.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

impl From<User> for CurrentUser {
    fn from(user: User) -> Self {
        CurrentUser {
            id: user.id,
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
        }
    }
}

fn unauthorized() -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            message: "Unauthorized".to_string(),
        }),
    )
}

/// Extracts the session token from the `token` cookie, if present.
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    for value in headers.get_all(header::COOKIE) {
        let Ok(cookies) = value.to_str() else {
            continue;
        };
        for pair in cookies.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            if parts.next() != Some("token") {
                continue;
            }
            // A bare `token` pair without a value must not mask a valid
            // pair in a later header.
            if let Some(token) = parts.next() {
                let token = token.trim();
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }
    None
}

/// Validates a token and resolves it to a live user row. Returns None
/// for any failure: bad signature, expired token, or unknown user.
pub async fn resolve_user(state: &AppState, token: &str) -> Option<User> {
    let user_id = match state.credentials.validate_token(token) {
        Ok(user_id) => user_id,
        Err(e) => {
            tracing::warn!("Token validation failed: {}", e);
            return None;
        }
    };

    let user = sqlx::query_as::<_, User>(
        "SELECT id, first_name, last_name, email, password_hash, created_at
         FROM users WHERE id = $1",
    )
    .bind(user_id)
    .fetch_optional(&state.db_pool)
    .await;

    match user {
        Ok(Some(user)) => Some(user),
        Ok(None) => {
            tracing::warn!("Token subject {} has no user row", user_id);
            None
        }
        Err(e) => {
            tracing::error!("Database error resolving user: {}", e);
            None
        }
    }
}

pub async fn auth_middleware(
    Extension(state): Extension<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, impl IntoResponse> {
    let Some(token) = token_from_headers(request.headers()) else {
        return Err(unauthorized());
    };

    let Some(user) = resolve_user(&state, &token).await else {
        return Err(unauthorized());
    };

    request.extensions_mut().insert(CurrentUser::from(user));

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_token_from_headers_finds_token_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; token=abc.def.ghi; lang=en"),
        );
        assert_eq!(token_from_headers(&headers).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn test_token_from_headers_missing_or_empty() {
        let mut headers = HeaderMap::new();
        assert!(token_from_headers(&headers).is_none());

        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark"));
        assert!(token_from_headers(&headers).is_none());

        headers.insert(header::COOKIE, HeaderValue::from_static("token="));
        assert!(token_from_headers(&headers).is_none());
    }

    #[test]
    fn test_token_from_headers_skips_valueless_token_pair() {
        // A bare `token` cookie in one header must not shadow a real
        // token carried in a later header.
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, HeaderValue::from_static("token"));
        headers.append(header::COOKIE, HeaderValue::from_static("token=abc.def.ghi"));
        assert_eq!(token_from_headers(&headers).as_deref(), Some("abc.def.ghi"));

        // Same within a single header.
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("token; token=abc.def.ghi"),
        );
        assert_eq!(token_from_headers(&headers).as_deref(), Some("abc.def.ghi"));
    }
}
