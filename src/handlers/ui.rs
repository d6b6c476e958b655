// src/handlers/ui.rs
use axum::Router;
use tower_http::services::{ServeDir, ServeFile};

/// Static assets with an SPA fallback: unmatched routes serve the app
/// shell and let the client-side router take over.
pub fn ui_routes() -> Router {
    Router::new().fallback_service(
        ServeDir::new("public").not_found_service(ServeFile::new("public/index.html")),
    )
}
