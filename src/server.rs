use crate::auth::{self, Principal, TokenVerifier};
use crate::codec::{self, Outbound};
use crate::config::Config;
use crate::error::{ApiError, BridgeResult, ErrorCode};
use crate::session::{Session, SessionInfo, SessionListResponse, SessionManager};
use crate::transport::{Connector, Protocol, RemoteConnector};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub connector: Arc<dyn Connector>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub outbound_queue: usize,
    pub login_url: Option<String>,
}

impl AppState {
    pub fn from_config(config: &Config) -> BridgeResult<Self> {
        Ok(Self {
            sessions: SessionManager::new(&config.session),
            connector: Arc::new(RemoteConnector::new(
                config.ssh.clone(),
                config.telnet.clone(),
            )),
            verifier: auth::build_verifier(&config.auth)?,
            outbound_queue: config.session.outbound_queue.max(1),
            login_url: Some(config.auth.login_url.trim().to_string())
                .filter(|url| !url.is_empty()),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.error_code {
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::TooManySessions => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::InvalidArgument => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/sessions", get(list_sessions))
        .route("/ws/terminal", get(terminal_socket))
        .route("/ws/ssh", get(ssh_socket))
        .layer(cors_layer(allowed_origins))
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_credentials(true)
}

pub async fn serve(config: Config) -> BridgeResult<()> {
    let addr: SocketAddr = config.server.listen.parse().map_err(|_| {
        ApiError::new(ErrorCode::InvalidArgument, "Invalid listen address")
            .with_details(config.server.listen.clone())
    })?;
    let state = AppState::from_config(&config)?;
    let app = router(state, &config.server.allowed_origins);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|err| {
        ApiError::new(ErrorCode::IoError, "HTTP bind failed").with_details(err.to_string())
    })?;
    tracing::info!(listen = %addr, auth_mode = ?config.auth.mode, "Terminal bridge listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| {
            ApiError::new(ErrorCode::IoError, "HTTP server failed").with_details(err.to_string())
        })?;
    tracing::info!("Terminal bridge stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({ "message": "termbridge" }))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<SessionListResponse>, Response> {
    authorize(&state, &query, &headers).await?;
    Ok(Json(state.sessions.list_sessions().await))
}

async fn terminal_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    open_socket(ws, state, query, headers, Protocol::Telnet).await
}

async fn ssh_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    open_socket(ws, state, query, headers, Protocol::Ssh).await
}

async fn authorize(
    state: &AppState,
    query: &TokenQuery,
    headers: &HeaderMap,
) -> Result<Principal, Response> {
    let token = auth::extract_token(query.token.as_deref(), headers);
    state.verifier.verify(token.as_deref()).await.map_err(|err| {
        tracing::warn!(error = %err.user_message(), "Rejected unauthenticated request");
        reject(state, headers, err)
    })
}

// Browsers asking for a page are sent to the portal login instead of a bare 401.
fn reject(state: &AppState, headers: &HeaderMap, err: ApiError) -> Response {
    if let Some(login_url) = &state.login_url
        && wants_html(headers)
    {
        return Redirect::temporary(login_url).into_response();
    }
    err.into_response()
}

fn wants_html(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html"))
}

async fn open_socket(
    ws: WebSocketUpgrade,
    state: AppState,
    query: TokenQuery,
    headers: HeaderMap,
    default_protocol: Protocol,
) -> Result<Response, Response> {
    let principal = authorize(&state, &query, &headers).await?;
    let info = match state.sessions.register(&principal.subject).await {
        Ok(info) => info,
        Err(err) => {
            tracing::warn!(principal = %principal.subject, error = %err, "Refusing socket");
            return Err(err.into_api().into_response());
        }
    };
    let sessions = state.sessions.clone();
    let failed_id = info.id.clone();
    Ok(ws
        .on_failed_upgrade(move |err| {
            tracing::warn!(session_id = %failed_id, error = %err, "WebSocket upgrade failed");
            tokio::spawn(async move { sessions.unregister(&failed_id).await });
        })
        .on_upgrade(move |socket| run_socket(socket, state, info, default_protocol)))
}

async fn run_socket(
    socket: WebSocket,
    state: AppState,
    info: Arc<SessionInfo>,
    default_protocol: Protocol,
) {
    let session_id = info.id.clone();
    tracing::info!(
        session_id = %session_id,
        principal = %info.principal,
        default_protocol = %default_protocol,
        "Client socket opened"
    );

    let (sink, mut stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(state.outbound_queue);
    let writer = tokio::spawn(write_frames(session_id.clone(), sink, outbound_rx));
    let mut session = Session::new(info, default_protocol, state.connector.clone(), outbound_tx);

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match codec::decode(&text) {
                    Ok(message) => session.dispatch(message).await,
                    Err(err) => {
                        tracing::warn!(
                            session_id = %session_id,
                            error = %err.user_message(),
                            "Dropping malformed client frame"
                        );
                    }
                },
                Some(Ok(Message::Binary(bytes))) => session.write(&bytes).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(session_id = %session_id, error = %err, "Client socket error");
                    break;
                }
            },
            exit = session.pump_exit() => session.on_pump_exit(exit).await,
        }
    }

    session.shutdown().await;
    drop(session);
    if let Err(err) = writer.await {
        tracing::warn!(session_id = %session_id, error = %err, "Socket writer task failed");
    }
    state.sessions.unregister(&session_id).await;
    tracing::info!(session_id = %session_id, "Client socket closed");
}

// Sole owner of the socket's sending half.
async fn write_frames(
    session_id: String,
    mut sink: SplitSink<WebSocket, Message>,
    mut frames: mpsc::Receiver<Outbound>,
) {
    while let Some(frame) = frames.recv().await {
        let message = match frame.into_message() {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "Failed to encode frame");
                continue;
            }
        };
        if let Err(err) = sink.send(message).await {
            tracing::debug!(session_id = %session_id, error = %err, "Client socket write failed");
            return;
        }
    }
    let _ = sink.close().await;
}
