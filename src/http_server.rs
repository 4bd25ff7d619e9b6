/**
 * HTTP front of the bridge: health, the JSON-RPC relay, an SSE liveness stream and
 * a stub that turns WebSocket clients away.
 */
use std::{
    convert::Infallible,
    error::Error as StdError,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use axum::{
    body::Bytes,
    extract::State,
    http::{Method, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use futures::{stream, stream::BoxStream, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::time::{interval_at, Instant};
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::{BridgeConfig, HttpServerSettings},
    error::BridgeError,
    protocol::JsonRpcMessage,
    session::BridgeSession,
};

#[derive(Clone)]
struct AppState {
    session: Arc<BridgeSession>,
    sse_ping_interval: Duration,
}

/// Build the router around an existing session.
pub fn router(session: Arc<BridgeSession>, settings: &HttpServerSettings) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let state = AppState {
        session,
        sse_ping_interval: settings.sse_ping_interval,
    };

    Router::new()
        .route("/health", get(health))
        .route("/sse", get(sse))
        .route("/mcp", post(relay))
        .route("/ws", get(websocket_unsupported))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the bridge until SIGINT/SIGTERM.
///
/// Connecting to MATLAB happens before the listener binds; failing to connect only
/// puts the bridge in simulation mode, failing to bind is fatal.
pub async fn run_http_server(config: BridgeConfig) -> Result<(), Box<dyn StdError>> {
    let session = BridgeSession::connect(&config).await;

    let listener = tokio::net::TcpListener::bind(config.http.bind_addr).await?;
    let local_addr = listener.local_addr()?;
    info!("MATLAB MCP Bridge listening on {}", local_addr);
    info!("Health check: http://{}/health", local_addr);
    info!("SSE endpoint: http://{}/sse", local_addr);
    info!("MCP endpoint: http://{}/mcp", local_addr);
    info!("Connected to MATLAB: {}", session.is_connected());

    let app = router(session.clone(), &config.http);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_on_signal(session))
        .await?;

    Ok(())
}

async fn shutdown_on_signal(session: Arc<BridgeSession>) {
    let signal_name = wait_for_signal().await;

    let signal_log = json!({
        "event": "signal_received",
        "signal": signal_name,
        "action": "shutting_down",
        "timestamp": Utc::now().to_rfc3339()
    });
    info!("{}", signal_log);

    session.shutdown().await;
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = term.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connected": state.session.is_connected(),
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}

async fn relay(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, RelayError> {
    let request = JsonRpcMessage::from_slice(&body)?;
    info!(
        id = ?request.id,
        method = request.method_name(),
        connected = state.session.is_connected(),
        "Received MCP request"
    );

    let response = state.session.dispatch(request).await?;
    debug!("MCP response: {}", response);
    Ok(Json(response))
}

/// Any failure on the relay endpoint is reported as a 500 with the error text.
struct RelayError(BridgeError);

impl From<BridgeError> for RelayError {
    fn from(err: BridgeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        if self.0.is_per_request() {
            warn!("Error processing MCP request: {}", self.0);
        } else {
            error!("Error processing MCP request: {}", self.0);
        }

        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "Internal server error",
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}

async fn websocket_unsupported() -> impl IntoResponse {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": "WebSocket upgrade not supported",
            "message": "This bridge does not accept WebSocket connections; POST JSON-RPC requests to /mcp instead",
        })),
    )
}

/// One server-sent event before it is rendered.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: &'static str,
    pub data: Value,
}

impl SseFrame {
    fn into_event(self) -> Event {
        Event::default().event(self.event).data(self.data.to_string())
    }
}

/// `connected` right away, then a `ping` every `ping_interval` until `shutdown`.
pub fn sse_frames(
    ping_interval: Duration,
    shutdown: CancellationToken,
) -> impl Stream<Item = SseFrame> {
    let connected = stream::once(async {
        SseFrame {
            event: "connected",
            data: json!({ "status": "ready" }),
        }
    });

    let ticks = interval_at(Instant::now() + ping_interval, ping_interval);
    let pings = IntervalStream::new(ticks).map(|_| SseFrame {
        event: "ping",
        data: json!({ "timestamp": Utc::now().timestamp_millis() }),
    });

    connected
        .chain(pings)
        .take_until(shutdown.cancelled_owned())
}

/// The event stream of one SSE client. Dropped when the client goes away.
struct SseConnection {
    frames: BoxStream<'static, SseFrame>,
}

impl SseConnection {
    fn open(ping_interval: Duration, shutdown: CancellationToken) -> Self {
        info!("SSE connection established");
        Self {
            frames: sse_frames(ping_interval, shutdown).boxed(),
        }
    }
}

impl Stream for SseConnection {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.frames
            .poll_next_unpin(cx)
            .map(|frame| frame.map(|frame| Ok(frame.into_event())))
    }
}

impl Drop for SseConnection {
    fn drop(&mut self) {
        info!("SSE client disconnected");
    }
}

async fn sse(State(state): State<AppState>) -> Sse<SseConnection> {
    Sse::new(SseConnection::open(
        state.sse_ping_interval,
        state.session.shutdown_token(),
    ))
}
