use crate::credentials::{CredentialService, TOKEN_TTL_SECONDS};
use crate::models::auth::*;
use crate::AppState;
use axum::{
    extract::Extension,
    http::{header, StatusCode},
    response::Json,
    routing::{post, Router},
};
use std::sync::Arc;

pub fn auth_routes() -> Router {
    Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
}

/// Session cookie carrying the signed token. HTTP-only and
/// cross-site-sendable so the SPA can be hosted on another origin.
fn session_cookie(token: &str) -> String {
    format!(
        "token={}; HttpOnly; Secure; SameSite=None; Path=/; Max-Age={}",
        token, TOKEN_TTL_SECONDS
    )
}

fn internal_error() -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            message: "Internal server error".to_string(),
        }),
    )
}

// One generic message for unknown email and wrong password: no hint
// about whether the email exists.
fn invalid_credentials() -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            message: "Invalid email or password".to_string(),
        }),
    )
}

fn duplicate_user() -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            message: "User already exists".to_string(),
        }),
    )
}

/// Login decision for a looked-up user row. `None` (unknown email) and a
/// password mismatch take the same rejection path.
fn authenticate_user(
    credentials: &CredentialService,
    user: Option<User>,
    password: &str,
) -> Result<User, (StatusCode, Json<ErrorResponse>)> {
    let Some(user) = user else {
        return Err(invalid_credentials());
    };

    match credentials.verify_password(password, &user.password_hash) {
        Ok(true) => Ok(user),
        Ok(false) => Err(invalid_credentials()),
        Err(e) => {
            tracing::error!("Error verifying password: {}", e);
            Err(internal_error())
        }
    }
}

/// A duplicate email that slipped past the existence check (concurrent
/// registration) hits the unique index; surface it as the same 400 the
/// check produces, not a 500.
fn map_registration_error(e: sqlx::Error) -> (StatusCode, Json<ErrorResponse>) {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.is_unique_violation() {
            return duplicate_user();
        }
    }
    tracing::error!("Error creating user: {}", e);
    internal_error()
}

async fn register(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, [(header::HeaderName, String); 1], Json<AuthResponse>), (StatusCode, Json<ErrorResponse>)>
{
    // Validate input
    if payload.email.is_empty()
        || payload.password.is_empty()
        || payload.full_name.first_name.is_empty()
    {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                message: "Name, email, and password are required".to_string(),
            }),
        ));
    }

    if payload.password.len() < 6 {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                message: "Password must be at least 6 characters long".to_string(),
            }),
        ));
    }

    // Email uniqueness is checked before creation (and backed by a
    // unique index in the schema).
    let existing_user = sqlx::query("SELECT id FROM users WHERE email = $1")
        .bind(&payload.email)
        .fetch_optional(&state.db_pool)
        .await;

    match existing_user {
        Ok(Some(_)) => {
            return Err(duplicate_user());
        }
        Ok(None) => {}
        Err(e) => {
            tracing::error!("Database error checking existing user: {}", e);
            return Err(internal_error());
        }
    }

    let password_hash = match state.credentials.hash_password(&payload.password) {
        Ok(hash) => hash,
        Err(e) => {
            tracing::error!("Error hashing password: {}", e);
            return Err(internal_error());
        }
    };

    let user = sqlx::query_as::<_, User>(
        "INSERT INTO users (first_name, last_name, email, password_hash)
         VALUES ($1, $2, $3, $4)
         RETURNING id, first_name, last_name, email, password_hash, created_at",
    )
    .bind(&payload.full_name.first_name)
    .bind(&payload.full_name.last_name)
    .bind(&payload.email)
    .bind(&password_hash)
    .fetch_one(&state.db_pool)
    .await
    .map_err(map_registration_error)?;

    let token = state.credentials.issue_token(user.id).map_err(|e| {
        tracing::error!("Error issuing session token: {}", e);
        internal_error()
    })?;

    tracing::info!("Registered new user: {}", user.email);

    Ok((
        StatusCode::CREATED,
        [(header::SET_COOKIE, session_cookie(&token))],
        Json(AuthResponse {
            message: "User registered successfully".to_string(),
            user: UserResponse::from(user),
        }),
    ))
}

async fn login(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<(StatusCode, [(header::HeaderName, String); 1], Json<AuthResponse>), (StatusCode, Json<ErrorResponse>)>
{
    if payload.email.is_empty() || payload.password.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                message: "Email and password are required".to_string(),
            }),
        ));
    }

    let user = sqlx::query_as::<_, User>(
        "SELECT id, first_name, last_name, email, password_hash, created_at
         FROM users WHERE email = $1",
    )
    .bind(&payload.email)
    .fetch_optional(&state.db_pool)
    .await
    .map_err(|e| {
        tracing::error!("Database error finding user: {}", e);
        internal_error()
    })?;

    let user = authenticate_user(&state.credentials, user, &payload.password)?;

    let token = state.credentials.issue_token(user.id).map_err(|e| {
        tracing::error!("Error issuing session token: {}", e);
        internal_error()
    })?;

    tracing::info!("User logged in: {}", user.email);

    Ok((
        StatusCode::OK,
        [(header::SET_COOKIE, session_cookie(&token))],
        Json(AuthResponse {
            message: "User logged in successfully".to_string(),
            user: UserResponse::from(user),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_session_cookie_attributes() {
        let cookie = session_cookie("abc.def.ghi");
        assert!(cookie.starts_with("token=abc.def.ghi;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Secure"));
        assert!(cookie.contains("SameSite=None"));
        assert!(cookie.contains("Path=/"));
    }

    fn user_with_password(credentials: &CredentialService, password: &str) -> User {
        User {
            id: Uuid::new_v4(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            email: "ada@example.com".to_string(),
            password_hash: credentials.hash_password(password).unwrap(),
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_login_rejection_is_uniform_for_unknown_email_and_wrong_password() {
        let credentials = CredentialService::new("test_secret");
        let user = user_with_password(&credentials, "correct horse");

        let (unknown_status, Json(unknown_body)) =
            authenticate_user(&credentials, None, "correct horse").unwrap_err();
        let (wrong_status, Json(wrong_body)) =
            authenticate_user(&credentials, Some(user), "battery staple").unwrap_err();

        assert_eq!(unknown_status, StatusCode::BAD_REQUEST);
        assert_eq!(wrong_status, StatusCode::BAD_REQUEST);
        assert_eq!(unknown_body.message, wrong_body.message);
        assert_eq!(wrong_body.message, "Invalid email or password");
    }

    #[test]
    fn test_login_accepts_matching_password() {
        let credentials = CredentialService::new("test_secret");
        let user = user_with_password(&credentials, "correct horse");
        let id = user.id;

        let authenticated = authenticate_user(&credentials, Some(user), "correct horse").unwrap();
        assert_eq!(authenticated.id, id);
    }

    #[derive(Debug)]
    struct StubDbError {
        unique: bool,
    }

    impl std::fmt::Display for StubDbError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "duplicate key value violates unique constraint")
        }
    }

    impl std::error::Error for StubDbError {}

    impl sqlx::error::DatabaseError for StubDbError {
        fn message(&self) -> &str {
            "duplicate key value violates unique constraint"
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            if self.unique {
                sqlx::error::ErrorKind::UniqueViolation
            } else {
                sqlx::error::ErrorKind::Other
            }
        }
    }

    #[test]
    fn test_concurrent_duplicate_registration_maps_to_bad_request() {
        // A duplicate email racing past the existence check surfaces as
        // a unique violation on the insert; it must not become a 500.
        let e = sqlx::Error::Database(Box::new(StubDbError { unique: true }));
        let (status, Json(body)) = map_registration_error(e);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.message, "User already exists");
    }

    #[test]
    fn test_other_insert_errors_stay_internal() {
        let e = sqlx::Error::Database(Box::new(StubDbError { unique: false }));
        let (status, _) = map_registration_error(e);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let (status, _) = map_registration_error(sqlx::Error::RowNotFound);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
