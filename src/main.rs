use axum::{http::HeaderValue, Extension, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

mod credentials;
mod db;
mod error;
mod gemini_client;
mod handlers;
mod memory;
mod message_store;
mod middleware;
mod models;
mod orchestrator;

// AppState holds the database connection pool, the credential service,
// and the turn orchestrator (which owns the AI and vector store clients).
pub struct AppState {
    pub db_pool: sqlx::PgPool,
    pub credentials: credentials::CredentialService,
    pub orchestrator: orchestrator::TurnOrchestrator,
}

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    init_logging().expect("Failed to initialize logging");

    // Create the database connection pool and run migrations
    let db_pool = db::create_pool()
        .await
        .expect("Failed to create database pool.");

    let jwt_secret = std::env::var("JWT_SECRET").expect("JWT_SECRET must be set");
    let credential_service = credentials::CredentialService::new(jwt_secret);

    let gemini_api_key = std::env::var("GEMINI_API_KEY").expect("GEMINI_API_KEY must be set");
    let gemini_client = gemini_client::GeminiClient::new(gemini_api_key);

    // Qdrant holds the long-term memory; the turn pipeline cannot run
    // without it, so initialization failures are fatal.
    let qdrant_url =
        std::env::var("QDRANT_URL").unwrap_or_else(|_| "http://localhost:6334".to_string());
    let qdrant_api_key = std::env::var("QDRANT_API_KEY").ok();

    tracing::info!("Connecting to Qdrant at {}", qdrant_url);
    let memory_index = memory::QdrantMemoryIndex::new(&qdrant_url, qdrant_api_key)
        .expect("Failed to create Qdrant client");
    memory_index
        .ensure_collection()
        .await
        .expect("Failed to initialize Qdrant collection");
    tracing::info!("Qdrant memory index ready");

    let message_store = message_store::PgMessageStore::new(db_pool.clone());

    // The Gemini client serves as both the embedder and the generator.
    let turn_orchestrator = orchestrator::TurnOrchestrator::new(
        Arc::new(message_store),
        Arc::new(gemini_client.clone()),
        Arc::new(gemini_client),
        Arc::new(memory_index),
    );

    let shared_state = Arc::new(AppState {
        db_pool,
        credentials: credential_service,
        orchestrator: turn_orchestrator,
    });

    // Build our application with all routes and shared state
    let app = Router::new()
        .merge(handlers::auth::auth_routes())
        .merge(handlers::chat::chat_routes())
        .route("/api/status", axum::routing::get(api_status))
        .merge(handlers::ui::ui_routes())
        .layer(axum::middleware::from_fn(
            middleware::logging::request_logging_middleware,
        ))
        .layer(cors_layer())
        .layer(Extension(shared_state));

    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .expect("Failed to bind listener");
    tracing::info!("listening on {}", listener.local_addr().unwrap());
    axum::serve(listener, app).await.unwrap();
}

/// CORS for the cross-origin SPA: explicit origin allowlist because the
/// session cookie requires credentialed requests (a wildcard origin
/// cannot be combined with credentials).
fn cors_layer() -> CorsLayer {
    let origins = std::env::var("CORS_ALLOWED_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:5173".to_string());
    let origins: Vec<HeaderValue> = origins
        .split(',')
        .filter_map(|origin| origin.trim().parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([axum::http::header::CONTENT_TYPE])
        .allow_credentials(true)
}

// Production-grade logging configuration
fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug,chat_backend=trace,sqlx=info,reqwest=info,hyper=info,tower=info".to_string()
        } else {
            "info,chat_backend=info,sqlx=warn,reqwest=warn,hyper=warn,tower=warn".to_string()
        }
    });

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log_level))?;

    // JSON logging for production log aggregation, human-readable otherwise
    let fmt_layer = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!("Chat backend starting up...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Build mode: {}",
        if cfg!(debug_assertions) {
            "development"
        } else {
            "production"
        }
    );

    Ok(())
}

// API Status endpoint
async fn api_status(
    Extension(state): Extension<Arc<AppState>>,
) -> axum::response::Json<serde_json::Value> {
    use serde_json::json;

    let db_status = match sqlx::query("SELECT 1").fetch_one(&state.db_pool).await {
        Ok(_) => "healthy",
        Err(_) => "unhealthy",
    };

    axum::response::Json(json!({
        "status": "operational",
        "version": env!("CARGO_PKG_VERSION"),
        "services": {
            "database": db_status,
        },
        "endpoints": {
            "status": "/api/status",
            "websocket": "/ws",
            "auth": "/api/auth/*",
            "chat": "/api/chat/*"
        }
    }))
}
