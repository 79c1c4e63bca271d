use anyhow::{Context, Result};
use askama::Template;
use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::lifecycle::Lifecycle;
use crate::models::StateEvent;
use crate::notify::Sink;

/// Latest known state per check id. Entries are overwritten, never removed.
#[derive(Default)]
pub struct StatusBoard {
    states: RwLock<BTreeMap<String, StateEvent>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, event: &StateEvent) {
        self.states
            .write()
            .await
            .insert(event.identity.id.clone(), event.clone());
    }

    /// All entries, ordered by id path.
    pub async fn snapshot(&self) -> Vec<StateEvent> {
        self.states.read().await.values().cloned().collect()
    }

    /// True when every recorded check is healthy, including when none are.
    pub async fn all_ok(&self) -> bool {
        self.states.read().await.values().all(|e| e.ok)
    }
}

#[async_trait]
impl Sink for StatusBoard {
    fn name(&self) -> &'static str {
        "status"
    }

    async fn notify(&self, event: &StateEvent) -> Result<()> {
        self.record(event).await;
        Ok(())
    }

    async fn baseline(&self, event: &StateEvent) -> Result<()> {
        self.record(event).await;
        Ok(())
    }
}

struct StatusRow {
    id: String,
    name: String,
    indent_em: usize,
    nested: bool,
    color: &'static str,
    label: &'static str,
    since: String,
    reason: String,
}

impl From<StateEvent> for StatusRow {
    fn from(event: StateEvent) -> Self {
        let depth = event.identity.depth();
        Self {
            indent_em: 2 * depth,
            nested: depth > 0,
            color: if event.ok { "green" } else { "red" },
            label: if event.ok { "OK" } else { "Failed" },
            since: event.timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            id: event.identity.id,
            name: event.identity.name,
            reason: event.reason,
        }
    }
}

#[derive(Template)]
#[template(path = "status.html")]
struct StatusPage {
    rows: Vec<StatusRow>,
}

async fn status_overview(State(board): State<Arc<StatusBoard>>) -> Response {
    let rows = board.snapshot().await.into_iter().map(StatusRow::from).collect();
    match (StatusPage { rows }).render() {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            error!(error = %e, "Cannot render status page.");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health(State(board): State<Arc<StatusBoard>>) -> StatusCode {
    if board.all_ok().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn get_status(State(board): State<Arc<StatusBoard>>) -> Json<Vec<StateEvent>> {
    Json(board.snapshot().await)
}

pub fn create_router(board: Arc<StatusBoard>) -> Router {
    Router::new()
        .route("/", get(status_overview))
        .route("/health", get(health))
        .route("/api/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(board)
}

/// Binds `listen` and serves the status router as two lifecycle tasks: the
/// listener itself and a watcher that stops it on shutdown. In-flight
/// requests get `grace` to finish before the listener is aborted.
///
/// Returns the bound address. A bind failure is returned, not logged.
pub async fn start_server(
    listen: &str,
    board: Arc<StatusBoard>,
    grace: Duration,
    lifecycle: &mut Lifecycle,
) -> Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Cannot start web listener on {}", listen))?;
    let addr = listener.local_addr()?;
    let app = create_router(board);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let (done_tx, done_rx) = oneshot::channel::<()>();

    let listener_task = lifecycle.spawn("status-listener", async move {
        info!(listen_address = %addr, "Start web listener.");
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .await;
        if let Err(e) = served {
            error!(listen_address = %addr, error = %e, "Web listener failed.");
        }
        let _ = done_tx.send(());
    });

    let mut signal = lifecycle.signal();
    lifecycle.spawn("status-listener-watcher", async move {
        signal.cancelled().await;
        let _ = stop_tx.send(());
        match tokio::time::timeout(grace, done_rx).await {
            Ok(_) => info!(listen_address = %addr, "Web listener has been stopped."),
            Err(_) => {
                error!(
                    listen_address = %addr,
                    grace = ?grace,
                    "Cannot shutdown web listener within grace period, aborting."
                );
                listener_task.abort();
            }
        }
    });

    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CheckIdentity;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use tokio::io::AsyncWriteExt;
    use tower::ServiceExt;

    fn event(name: &str, parent: Option<&str>, ok: bool) -> StateEvent {
        StateEvent {
            identity: CheckIdentity::new(name, parent),
            timestamp: Utc::now(),
            ok,
            reason: if ok { String::new() } else { format!("{name} is down") },
        }
    }

    async fn get(board: Arc<StatusBoard>, uri: &str) -> (StatusCode, String, String) {
        let response = create_router(board)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .map(|v| v.to_str().unwrap().to_string())
            .unwrap_or_default();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, content_type, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn board_keeps_latest_state_per_check() {
        let board = StatusBoard::new();
        board.record(&event("mail", None, true)).await;
        board.record(&event("mail", None, false)).await;

        let snapshot = board.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[0].ok);
    }

    #[tokio::test]
    async fn health_is_vacuously_ok_when_empty() {
        let (status, _, body) = get(Arc::new(StatusBoard::new()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn health_reflects_every_entry() {
        let board = Arc::new(StatusBoard::new());
        board.record(&event("web", None, true)).await;
        board.record(&event("mail", None, false)).await;
        assert_eq!(get(board.clone(), "/health").await.0, StatusCode::SERVICE_UNAVAILABLE);

        board.record(&event("mail", None, true)).await;
        assert_eq!(get(board, "/health").await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn overview_lists_checks_in_tree_order() {
        let board = Arc::new(StatusBoard::new());
        board.record(&event("webx", None, true)).await;
        board.record(&event("backend", Some("web"), false)).await;
        board.record(&event("web", None, false)).await;

        let (status, content_type, html) = get(board, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(content_type.starts_with("text/html"), "{content_type}");

        let web = html.find(r#"id="web""#).unwrap();
        let backend = html.find(r#"id="web.backend""#).unwrap();
        let webx = html.find(r#"id="webx""#).unwrap();
        assert!(web < backend && backend < webx);
        assert!(html.contains("padding-left: 2em"));
        assert!(html.contains("| backend"));
        assert!(html.contains("backend is down"));
        assert!(html.contains("Failed"));
        assert!(html.contains("background-color: green"));
    }

    #[tokio::test]
    async fn api_status_returns_json_snapshot() {
        let board = Arc::new(StatusBoard::new());
        board.record(&event("mail", None, false)).await;

        let (status, content_type, body) = get(board, "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert!(content_type.starts_with("application/json"));
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value[0]["id"], "mail");
        assert_eq!(value[0]["ok"], false);
    }

    #[tokio::test]
    async fn board_is_a_sink() {
        let board = Arc::new(StatusBoard::new());
        let mut hub = crate::notify::NotificationHub::new();
        hub.register(board.clone());

        hub.baseline(&event("mail", None, false)).await.unwrap();
        assert!(!board.all_ok().await);
        hub.notify(&event("mail", None, true)).await.unwrap();
        assert!(board.all_ok().await);
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let mut lifecycle = Lifecycle::new();

        let result = start_server(
            &addr,
            Arc::new(StatusBoard::new()),
            Duration::from_secs(1),
            &mut lifecycle,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(lifecycle.active(), 0);
    }

    #[tokio::test]
    async fn server_serves_until_shutdown() {
        let board = Arc::new(StatusBoard::new());
        board.record(&event("mail", None, false)).await;
        let mut lifecycle = Lifecycle::new();
        let addr = start_server("127.0.0.1:0", board, Duration::from_secs(5), &mut lifecycle)
            .await
            .unwrap();
        assert_eq!(lifecycle.active(), 2);

        let response = reqwest::get(format!("http://{addr}/health")).await.unwrap();
        assert_eq!(response.status().as_u16(), 503);
        drop(response);

        lifecycle.shutdown().await;
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn shutdown_is_bounded_by_grace_period() {
        let mut lifecycle = Lifecycle::new();
        let addr = start_server(
            "127.0.0.1:0",
            Arc::new(StatusBoard::new()),
            Duration::from_millis(200),
            &mut lifecycle,
        )
        .await
        .unwrap();

        // Half-sent request keeps a connection busy.
        let mut stalled = tokio::net::TcpStream::connect(addr).await.unwrap();
        stalled.write_all(b"GET /health HTTP/1.1\r\nHost: x\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(3), lifecycle.shutdown())
            .await
            .expect("shutdown must not outlive the grace period");
        drop(stalled);
    }
}
