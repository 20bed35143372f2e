//! HTTP surface: health endpoint, WebSocket upgrade (on `/ws` and on `/`
//! when the peer asks for one) and static files with conservative cache
//! headers.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Request, State};
use axum::http::header::{HeaderName, HeaderValue, CACHE_CONTROL};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::services::ServeDir;

use crate::gateway::supervisor::handle_peer;
use crate::gateway::GatewayContext;

pub fn router(ctx: Arc<GatewayContext>) -> Router {
    let static_files = ServeDir::new(&ctx.config.web_root);
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .route("/", get(root_handler))
        .fallback_service(static_files)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&ctx),
            response_headers,
        ))
        .with_state(ctx)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true}))
}

async fn ws_handler(State(ctx): State<Arc<GatewayContext>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_peer(socket, ctx))
        .into_response()
}

/// `/` doubles as a WebSocket endpoint when the peer sends an upgrade;
/// otherwise it serves the app shell.
async fn root_handler(
    State(ctx): State<Arc<GatewayContext>>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if let Some(ws) = ws {
        return ws
            .on_upgrade(move |socket| handle_peer(socket, ctx))
            .into_response();
    }
    match tokio::fs::read(ctx.config.web_root.join("index.html")).await {
        Ok(contents) => Html(contents).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn response_headers(
    State(ctx): State<Arc<GatewayContext>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_owned();
    let mut response = next.run(request).await;

    if path == "/healthz" || path == "/ws" {
        return response;
    }
    if ctx.config.coop_coep {
        let headers = response.headers_mut();
        headers.insert(
            HeaderName::from_static("cross-origin-opener-policy"),
            HeaderValue::from_static("same-origin"),
        );
        headers.insert(
            HeaderName::from_static("cross-origin-embedder-policy"),
            HeaderValue::from_static("require-corp"),
        );
    }
    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        return response;
    }

    // Hashed build assets are immutable; everything else revalidates.
    let cache = if path.starts_with("/_next/static/") || path.starts_with("/assets/") {
        "public, max-age=31536000, immutable"
    } else {
        "public, max-age=0, must-revalidate"
    };
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static(cache));
    response
}

#[cfg(test)]
mod tests {
    use super::router;
    use crate::gateway::pacer::PacerConfig;
    use crate::gateway::whitelist::Whitelist;
    use crate::gateway::{GatewayConfig, GatewayContext};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tower::ServiceExt;

    /// A disposable web root with an app shell and hashed build assets.
    fn web_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("gateway-web-{}-{tag}", std::process::id()));
        std::fs::create_dir_all(root.join("assets")).expect("create assets dir");
        std::fs::create_dir_all(root.join("_next/static")).expect("create build dir");
        std::fs::write(root.join("index.html"), "<!doctype html><title>voice</title>")
            .expect("write index");
        std::fs::write(root.join("assets/app.js"), "console.log('voice')")
            .expect("write asset");
        std::fs::write(root.join("_next/static/chunk.js"), "export {}").expect("write chunk");
        root
    }

    fn ctx(tag: &str, coop_coep: bool) -> Arc<GatewayContext> {
        Arc::new(GatewayContext {
            whitelist: Whitelist::default(),
            config: GatewayConfig {
                port: 0,
                web_root: web_root(tag),
                coop_coep,
                pacer: PacerConfig::default(),
            },
        })
    }

    async fn get(ctx: Arc<GatewayContext>, path: &str) -> Response {
        let request = Request::builder()
            .uri(path)
            .body(Body::empty())
            .expect("request");
        router(ctx).oneshot(request).await.expect("infallible")
    }

    /// The health endpoint answers its fixed body and stays outside the
    /// cache policy.
    #[tokio::test]
    async fn healthz_reports_ok() {
        // Arrange
        let ctx = ctx("healthz", false);
        // Act
        let response = get(ctx, "/healthz").await;
        // Assert
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("cache-control").is_none());
        let body = to_bytes(response.into_body(), 1024).await.expect("body");
        assert_eq!(&body[..], br#"{"ok":true}"#);
    }

    /// The app shell revalidates while hashed build assets are immutable.
    #[tokio::test]
    async fn cache_policy_follows_path() {
        // Arrange
        let ctx = ctx("cache", false);
        // Act
        let index = get(Arc::clone(&ctx), "/").await;
        let asset = get(Arc::clone(&ctx), "/assets/app.js").await;
        let chunk = get(Arc::clone(&ctx), "/_next/static/chunk.js").await;
        // Assert
        assert_eq!(index.status(), StatusCode::OK);
        assert_eq!(
            index.headers()["cache-control"],
            "public, max-age=0, must-revalidate"
        );
        assert_eq!(asset.status(), StatusCode::OK);
        assert_eq!(
            asset.headers()["cache-control"],
            "public, max-age=31536000, immutable"
        );
        assert_eq!(
            chunk.headers()["cache-control"],
            "public, max-age=31536000, immutable"
        );
        let body = to_bytes(index.into_body(), 4096).await.expect("body");
        assert!(body.starts_with(b"<!doctype html>"));
    }

    /// A path the web root cannot serve is a 404, not a fallthrough.
    #[tokio::test]
    async fn missing_files_are_not_found() {
        // Arrange
        let ctx = ctx("missing", false);
        // Act
        let response = get(ctx, "/nowhere.txt").await;
        // Assert
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    /// COOP/COEP headers appear on served content only when the flag is on.
    #[tokio::test]
    async fn coop_coep_follows_flag() {
        // Arrange
        let enabled = ctx("coop-on", true);
        let disabled = ctx("coop-off", false);
        // Act
        let with = get(enabled, "/").await;
        let without = get(disabled, "/").await;
        // Assert
        assert_eq!(with.headers()["cross-origin-opener-policy"], "same-origin");
        assert_eq!(
            with.headers()["cross-origin-embedder-policy"],
            "require-corp"
        );
        assert!(without
            .headers()
            .get("cross-origin-opener-policy")
            .is_none());
        assert!(without
            .headers()
            .get("cross-origin-embedder-policy")
            .is_none());
    }
}
