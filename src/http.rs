//! Stateless request/response surface plus the websocket push channel.
//!
//! Every route resolves the session by name on each call; nothing is
//! negotiated per-connection except the websocket subscription itself.

use crate::error::{ApiError, BridgeError, ErrorCode, BridgeResult};
use crate::fanout::SessionEvent;
use crate::session::{
    Encoding, SessionInfo, SessionRegistry, SessionSpec, Snapshot, decode_payload, wait_for_exit,
    wait_for_pattern, wait_for_text,
};
use axum::{
    Json, Router,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{
        HeaderValue, StatusCode,
        header::{AUTHORIZATION, WWW_AUTHENTICATE},
    },
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    /// Observer connections drain on this token; without it graceful
    /// shutdown would wait forever on idle websockets.
    pub shutdown: CancellationToken,
}

/// Binds the listener and serves until the shutdown token fires.
pub async fn serve(
    listen: &str,
    auth_token: &str,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
) -> BridgeResult<()> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|_| ApiError::new(ErrorCode::InvalidArgument, "Invalid HTTP listen address"))?;
    let state = Arc::new(AppState {
        registry,
        shutdown: shutdown.clone(),
    });
    let app = router(state, auth_token.to_string());

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|err| {
        ApiError::new(ErrorCode::IoError, "HTTP bind failed").with_details(err.to_string())
    })?;
    tracing::info!(listen = %addr, "HTTP server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|err| {
            ApiError::new(ErrorCode::IoError, "HTTP server failed")
                .with_details(err.to_string())
                .into()
        })
}

pub fn router(state: Arc<AppState>, auth_token: String) -> Router {
    Router::new()
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/:name", axum::routing::delete(close_session))
        .route("/sessions/:name/write", post(write_session))
        .route("/sessions/:name/resize", post(resize_session))
        .route("/sessions/:name/snapshot", get(snapshot_session))
        .route("/sessions/:name/clear", post(clear_session))
        .route("/sessions/:name/wait", post(wait_session))
        .route("/ws", get(ws_upgrade))
        .layer(middleware::from_fn(
            move |req: axum::http::Request<axum::body::Body>, next: axum::middleware::Next| {
                let auth_token = auth_token.clone();
                async move {
                    if auth_token.is_empty() {
                        return next.run(req).await;
                    }
                    let expected = format!("Bearer {}", auth_token);
                    let authorized = req
                        .headers()
                        .get(AUTHORIZATION)
                        .and_then(|value| value.to_str().ok())
                        .is_some_and(|value| value == expected);
                    if authorized {
                        next.run(req).await
                    } else {
                        let mut response =
                            (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
                        response
                            .headers_mut()
                            .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
                        response
                    }
                }
            },
        ))
        .with_state(state)
}

/// Maps the error taxonomy onto HTTP statuses; the JSON body is the
/// structured error itself.
struct HttpError(BridgeError);

impl From<BridgeError> for HttpError {
    fn from(err: BridgeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let status = match code {
            ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::InvalidState => StatusCode::CONFLICT,
            ErrorCode::ConnectTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::ConnectFailed | ErrorCode::AuthFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::SpawnFailed | ErrorCode::IoError | ErrorCode::RenderFailed => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = match self.0 {
            BridgeError::Api(api) => api,
            other => ApiError::new(code, other.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

type HttpResult<T> = Result<Json<T>, HttpError>;

#[derive(Debug, Serialize)]
struct SessionListResponse {
    sessions: Vec<SessionInfo>,
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<SessionListResponse> {
    let mut sessions = state.registry.list().await;
    sessions.sort_by(|a, b| a.name.cmp(&b.name));
    Json(SessionListResponse { sessions })
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    name: String,
    #[serde(flatten)]
    spec: SessionSpec,
}

#[derive(Debug, Serialize)]
struct CreateSessionResponse {
    created: bool,
    session: SessionInfo,
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> HttpResult<CreateSessionResponse> {
    let (session, created) = state.registry.get_or_create(&req.name, req.spec).await?;
    Ok(Json(CreateSessionResponse {
        created,
        session: session.info(),
    }))
}

#[derive(Debug, Serialize)]
struct ClosedResponse {
    closed: bool,
}

async fn close_session(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> HttpResult<ClosedResponse> {
    state.registry.close(&name).await?;
    Ok(Json(ClosedResponse { closed: true }))
}

#[derive(Debug, Deserialize)]
struct WriteRequest {
    data: Option<String>,
    #[serde(default)]
    encoding: Encoding,
    key: Option<String>,
}

#[derive(Debug, Serialize)]
struct WriteResponse {
    written: usize,
}

async fn write_session(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<WriteRequest>,
) -> HttpResult<WriteResponse> {
    let written = match (req.data, req.key) {
        (Some(data), None) => {
            let bytes = decode_payload(&data, req.encoding)?;
            state.registry.write(&name, &bytes).await?
        }
        (None, Some(key)) => state.registry.send_key(&name, &key).await?,
        _ => {
            return Err(HttpError(
                ApiError::new(
                    ErrorCode::InvalidArgument,
                    "Exactly one of data or key is required",
                )
                .into(),
            ));
        }
    };
    Ok(Json(WriteResponse { written }))
}

#[derive(Debug, Deserialize)]
struct ResizeRequest {
    cols: u16,
    rows: u16,
}

#[derive(Debug, Serialize)]
struct ResizeResponse {
    cols: u16,
    rows: u16,
}

async fn resize_session(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> HttpResult<ResizeResponse> {
    state.registry.resize(&name, req.cols, req.rows).await?;
    Ok(Json(ResizeResponse {
        cols: req.cols,
        rows: req.rows,
    }))
}

#[derive(Debug, Deserialize)]
struct SnapshotQuery {
    view: Option<String>,
}

async fn snapshot_session(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<SnapshotQuery>,
) -> HttpResult<Snapshot> {
    let include_image = match query.view.as_deref() {
        None | Some("text") => false,
        Some("image") => true,
        Some(other) => {
            return Err(HttpError(
                ApiError::new(
                    ErrorCode::InvalidArgument,
                    format!("Unknown snapshot view: {other}"),
                )
                .into(),
            ));
        }
    };
    let snapshot = state.registry.snapshot(&name, include_image).await?;
    Ok(Json(snapshot))
}

#[derive(Debug, Serialize)]
struct ClearedResponse {
    cleared: bool,
}

async fn clear_session(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> HttpResult<ClearedResponse> {
    state.registry.clear(&name).await?;
    Ok(Json(ClearedResponse { cleared: true }))
}

const DEFAULT_WAIT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Deserialize)]
struct WaitRequest {
    text: Option<String>,
    pattern: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct WaitResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    found: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exited: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
}

/// Waits for output (`text` substring or `pattern` regex) when given,
/// otherwise for process exit. Expiry is not an error; the response says
/// what was (not) observed.
async fn wait_session(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<WaitRequest>,
) -> HttpResult<WaitResponse> {
    let timeout_ms = req.timeout_ms.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS);
    match (req.text, req.pattern) {
        (Some(_), Some(_)) => {
            return Err(HttpError(
                ApiError::new(
                    ErrorCode::InvalidArgument,
                    "text and pattern are mutually exclusive",
                )
                .into(),
            ));
        }
        (Some(text), None) => {
            let found = wait_for_text(&state.registry, &name, &text, timeout_ms).await?;
            return Ok(Json(WaitResponse {
                found: Some(found),
                exited: None,
                exit_code: None,
            }));
        }
        (None, Some(pattern)) => {
            let found = wait_for_pattern(&state.registry, &name, &pattern, timeout_ms).await?;
            return Ok(Json(WaitResponse {
                found: Some(found),
                exited: None,
                exit_code: None,
            }));
        }
        (None, None) => {}
    }

    let code = wait_for_exit(&state.registry, &name, timeout_ms).await?;
    let session = state.registry.get(&name).await?;
    Ok(Json(WaitResponse {
        found: None,
        exited: Some(!session.is_alive()),
        exit_code: code,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsInbound {
    Input {
        name: String,
        data: String,
        #[serde(default)]
        encoding: Encoding,
    },
    Key {
        name: String,
        key: String,
    },
}

#[derive(Debug, Serialize)]
struct WsHello {
    r#type: &'static str,
    sessions: Vec<SessionInfo>,
}

#[derive(Debug, Serialize)]
struct WsError {
    r#type: &'static str,
    error_code: ErrorCode,
    message: String,
}

async fn ws_upgrade(State(state): State<Arc<AppState>>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| ws_connection(state, socket))
}

/// One observer connection. Subscribes before seeding so no event emitted
/// during the seed is lost; there is no replay of anything older — new
/// observers get the current full buffer as a synthetic data event per live
/// session instead.
async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    let mut events = state.registry.fanout().subscribe();
    let (mut sink, mut stream) = socket.split();

    let mut sessions = state.registry.list().await;
    sessions.sort_by(|a, b| a.name.cmp(&b.name));
    let hello = WsHello {
        r#type: "hello",
        sessions,
    };
    if send_json(&mut sink, &hello).await.is_err() {
        return;
    }
    // Events already queued at this point describe buffer state the seed
    // below will carry (the buffer is appended before its event is
    // published), so forwarding them after the seed would duplicate data.
    let stale = events.len();
    for info in &hello.sessions {
        if !info.alive {
            continue;
        }
        let Ok(session) = state.registry.get(&info.name).await else {
            continue;
        };
        let seed = SessionEvent::Data {
            name: info.name.clone(),
            data: session.buffer_contents(),
        };
        if send_json(&mut sink, &seed).await.is_err() {
            return;
        }
    }
    drain_stale(&mut events, stale);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if send_json(&mut sink, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Websocket observer lagged; events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if let Err(err) = handle_ws_inbound(&state, &text).await {
                        let frame = WsError {
                            r#type: "error",
                            error_code: err.code(),
                            message: err.to_string(),
                        };
                        if send_json(&mut sink, &frame).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(error = %err, "Websocket receive failed");
                    break;
                }
            },
        }
    }
}

async fn handle_ws_inbound(state: &AppState, text: &str) -> BridgeResult<()> {
    let inbound: WsInbound = serde_json::from_str(text).map_err(|err| {
        ApiError::new(ErrorCode::InvalidArgument, "Invalid websocket frame")
            .with_details(err.to_string())
    })?;
    match inbound {
        WsInbound::Input {
            name,
            data,
            encoding,
        } => {
            let bytes = decode_payload(&data, encoding)?;
            state.registry.write(&name, &bytes).await?;
        }
        WsInbound::Key { name, key } => {
            state.registry.send_key(&name, &key).await?;
        }
    }
    Ok(())
}

/// Discards the first `stale` queued events, leaving later ones for the
/// forward loop.
fn drain_stale(events: &mut broadcast::Receiver<SessionEvent>, stale: usize) {
    for _ in 0..stale {
        if events.try_recv().is_err() {
            break;
        }
    }
}

async fn send_json<T: Serialize>(
    sink: &mut (impl futures_util::Sink<Message, Error = axum::Error> + Unpin),
    value: &T,
) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(value).map_err(axum::Error::new)?;
    sink.send(Message::Text(payload)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SessionConfig, SshConfig};
    use crate::fanout::FanOut;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_router(auth_token: &str) -> Router {
        let registry = SessionRegistry::new(
            SessionConfig::default(),
            SshConfig::default(),
            FanOut::new(64),
        );
        router(
            Arc::new(AppState {
                registry,
                shutdown: CancellationToken::new(),
            }),
            auth_token.to_string(),
        )
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let app = test_router("secret");
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/sessions")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(WWW_AUTHENTICATE).map(|v| v.to_str().unwrap()),
            Some("Bearer")
        );
    }

    #[tokio::test]
    async fn bearer_token_grants_access() {
        let app = test_router("secret");
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/sessions")
                    .header(AUTHORIZATION, "Bearer secret")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn empty_token_disables_auth() {
        let app = test_router("");
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/sessions")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_session_maps_to_not_found() {
        let app = test_router("");
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/sessions/ghost/snapshot")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .expect("body");
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["error_code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn bad_snapshot_view_is_rejected() {
        let app = test_router("");
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/sessions/ghost/snapshot?view=hologram")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stale_backlog_is_discarded_without_touching_later_events() {
        let fanout = FanOut::new(64);
        let mut events = fanout.subscribe();

        // Queued before the buffer snapshot is taken: its data is already
        // part of the seed and must not be forwarded again.
        fanout.publish(SessionEvent::Data {
            name: "t1".to_string(),
            data: "seeded".to_string(),
        });
        let stale = events.len();
        fanout.publish(SessionEvent::Data {
            name: "t1".to_string(),
            data: "fresh".to_string(),
        });

        drain_stale(&mut events, stale);
        match events.try_recv().expect("later event survives") {
            SessionEvent::Data { data, .. } => assert_eq!(data, "fresh"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn write_requires_exactly_one_payload_kind() {
        let app = test_router("");
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/sessions/ghost/write")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"data":"ls","key":"enter"}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
