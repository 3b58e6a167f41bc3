//! In-process stand-in for a running query engine's HTTP server

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const OPEN_TRANSACTION: &str = "tx-1";
pub const ELAPSED_MICROS: &str = "1500";
/// Queries containing `slow` are answered after this delay
pub const SLOW_QUERY_DELAY: Duration = Duration::from_millis(400);

#[derive(Default)]
struct MockState {
    bodies: Mutex<Vec<Value>>,
    transaction_headers: Mutex<Vec<Option<String>>>,
}

pub struct MockEngine {
    pub url: String,
    state: Arc<MockState>,
    server: JoinHandle<()>,
}

impl MockEngine {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/status", get(status))
            .route("/", post(query))
            .route("/transaction/start", post(start_transaction))
            .route("/transaction/:id/commit", post(commit_transaction))
            .route("/transaction/:id/rollback", post(rollback_transaction))
            .route("/metrics", post(metrics))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock engine");
        let addr = listener.local_addr().expect("mock engine address");
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            url: format!("http://{addr}"),
            state,
            server,
        }
    }

    /// Query bodies received so far
    pub fn bodies(&self) -> Vec<Value> {
        self.state.bodies.lock().clone()
    }

    /// `x-transaction-id` header of every query received so far
    pub fn transaction_headers(&self) -> Vec<Option<String>> {
        self.state.transaction_headers.lock().clone()
    }
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn status() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

fn answer(query: &str) -> Value {
    if query.contains("missing") {
        json!({
            "errors": [{
                "error": "Record to update not found.",
                "user_facing_error": {
                    "is_panic": false,
                    "message": "An operation failed because it depends on one or more records that were required but not found. Record to update not found.",
                    "meta": { "cause": "Record to update not found." },
                    "error_code": "P2025"
                }
            }]
        })
    } else {
        json!({ "data": { "echo": query } })
    }
}

async fn query(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.bodies.lock().push(body.clone());
    state.transaction_headers.lock().push(
        headers
            .get("x-transaction-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
    );

    let slow = body
        .get("query")
        .and_then(Value::as_str)
        .is_some_and(|query| query.contains("slow"));
    if slow {
        tokio::time::sleep(SLOW_QUERY_DELAY).await;
    }

    let reply = match body.get("batch").and_then(Value::as_array) {
        Some(batch) => {
            let results: Vec<Value> = batch
                .iter()
                .map(|item| answer(item.get("query").and_then(Value::as_str).unwrap_or_default()))
                .collect();
            json!({ "batchResult": results })
        }
        None => answer(body.get("query").and_then(Value::as_str).unwrap_or_default()),
    };

    ([("x-elapsed", ELAPSED_MICROS)], Json(reply)).into_response()
}

async fn start_transaction(Json(options): Json<Value>) -> Json<Value> {
    Json(json!({ "id": OPEN_TRANSACTION, "options": options }))
}

fn transaction_not_found() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error_code": "P2028",
            "message": "Transaction API error: Transaction not found.",
            "meta": { "error": "Transaction not found." }
        })),
    )
        .into_response()
}

async fn commit_transaction(Path(id): Path<String>) -> Response {
    if id == OPEN_TRANSACTION {
        Json(json!({})).into_response()
    } else {
        transaction_not_found()
    }
}

async fn rollback_transaction(Path(id): Path<String>) -> Response {
    if id == OPEN_TRANSACTION {
        Json(json!({})).into_response()
    } else {
        transaction_not_found()
    }
}

async fn metrics(Query(params): Query<HashMap<String, String>>) -> Response {
    match params.get("format").map(String::as_str) {
        Some("prometheus") => "# TYPE prisma_client_queries_total counter\nprisma_client_queries_total 3\n"
            .into_response(),
        _ => Json(json!({
            "counters": [{ "key": "prisma_client_queries_total", "labels": {}, "value": 3 }],
            "gauges": [],
            "histograms": []
        }))
        .into_response(),
    }
}

/// Engine speaking just enough HTTP/1.1 to answer `GET /status`. The first
/// `drops` queries are read and then the connection is closed without a reply.
pub struct FlakyEngine {
    pub url: String,
    posts: Arc<AtomicUsize>,
    server: JoinHandle<()>,
}

impl FlakyEngine {
    pub async fn start(drops: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind flaky engine");
        let addr = listener.local_addr().expect("flaky engine address");
        let posts = Arc::new(AtomicUsize::new(0));
        let counter = posts.clone();

        let server = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let counter = counter.clone();
                tokio::spawn(async move {
                    let _ = serve_flaky(socket, counter, drops).await;
                });
            }
        });

        Self {
            url: format!("http://{addr}"),
            posts,
            server,
        }
    }

    /// Queries received so far, answered or dropped
    pub fn posts(&self) -> usize {
        self.posts.load(Ordering::SeqCst)
    }
}

impl Drop for FlakyEngine {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn serve_flaky(
    socket: TcpStream,
    posts: Arc<AtomicUsize>,
    drops: usize,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;

    let reply = if request_line.starts_with("POST") {
        if posts.fetch_add(1, Ordering::SeqCst) < drops {
            return Ok(());
        }
        r#"{"data":{"ok":true}}"#
    } else {
        r#"{"status":"ok"}"#
    };

    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{reply}",
        reply.len()
    );
    write_half.write_all(response.as_bytes()).await?;
    write_half.shutdown().await
}
