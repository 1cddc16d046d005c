//! Local HTTP server for the revision dashboard.
//!
//! Serves the static dashboard assets and the processed data files
//! with caching disabled, so a re-run of the pipeline is visible on
//! the next browser refresh.

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{info, warn};

/// Files the dashboard expects; startup warns about any that are
/// absent but still serves.
const EXPECTED_FILES: &[&str] = &[
    "dashboard.html",
    "dashboard.css",
    "dashboard.js",
    "data_processed/nfp_revisions.csv",
    "data_processed/summary_report.json",
];

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub open_browser: bool,
    /// Directory holding dashboard.html and the data_processed/ tree.
    pub root_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            open_browser: false,
            root_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("dashboard root not found: {0}")]
    RootNotFound(PathBuf),

    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Start the HTTP server. Runs until the process is stopped.
pub async fn run_server(config: ServerConfig) -> Result<(), ServerError> {
    if !config.root_dir.is_dir() {
        return Err(ServerError::RootNotFound(config.root_dir.clone()));
    }
    check_expected_files(&config);

    let root = config.root_dir.clone();
    let app = Router::new()
        .route("/", get(move || index_handler(root)))
        .route("/api/health", get(health_handler))
        .nest_service("/data_processed", ServeDir::new(config.root_dir.join("data_processed")))
        .fallback_service(ServeDir::new(&config.root_dir))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-store, must-revalidate"),
        ))
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            port: config.port,
            source,
        })?;

    let url = format!("http://localhost:{}/dashboard.html", config.port);
    info!(%url, root = %config.root_dir.display(), "Dashboard server running");
    eprintln!("Dashboard at {url}");
    eprintln!("Press Ctrl+C to stop\n");

    if config.open_browser {
        let _ = std::process::Command::new("xdg-open").arg(&url).spawn();
    }

    axum::serve(listener, app).await?;
    Ok(())
}

fn check_expected_files(config: &ServerConfig) {
    for file in EXPECTED_FILES {
        let path = config.root_dir.join(file);
        if !path.exists() {
            warn!(file, "Expected dashboard file is missing");
        }
    }
}

/// Serve dashboard.html at the root so a bare URL works.
async fn index_handler(root: PathBuf) -> Response {
    match std::fs::read_to_string(root.join("dashboard.html")) {
        Ok(content) => Html(content).into_response(),
        Err(_) => (
            StatusCode::NOT_FOUND,
            "dashboard.html not found; run the pipeline first",
        )
            .into_response(),
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert!(!config.open_browser);
    }

    #[tokio::test]
    async fn missing_root_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let config = ServerConfig {
            root_dir: tmp.path().join("absent"),
            ..ServerConfig::default()
        };
        assert!(matches!(
            run_server(config).await,
            Err(ServerError::RootNotFound(_))
        ));
    }

    #[tokio::test]
    async fn index_serves_dashboard_html() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("dashboard.html"), "<html>ok</html>").unwrap();
        let response = index_handler(tmp.path().to_path_buf()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn index_404s_without_dashboard() {
        let tmp = TempDir::new().unwrap();
        let response = index_handler(tmp.path().to_path_buf()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
