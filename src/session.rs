use crate::codec::{ClientMessage, ConnectParams, Outbound, OutboundSender, ServerMessage};
use crate::config::SessionConfig;
use crate::error::{ApiError, BridgeResult, ErrorCode};
use crate::pump::{PumpExit, ReadPump};
use crate::transport::{ConnectRequest, Connector, Protocol, Transport};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    fn from_u64(value: u64) -> Self {
        match value {
            x if x == SessionState::Connecting as u64 => SessionState::Connecting,
            x if x == SessionState::Active as u64 => SessionState::Active,
            x if x == SessionState::Closing as u64 => SessionState::Closing,
            x if x == SessionState::Closed as u64 => SessionState::Closed,
            _ => SessionState::Idle,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionTarget {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
}

#[derive(Debug)]
pub struct SessionInfo {
    pub id: String,
    pub principal: String,
    pub created_at: u64,
    state: AtomicU64,
    target: Mutex<Option<SessionTarget>>,
}

impl SessionInfo {
    pub fn new(id: impl Into<String>, principal: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            principal: principal.into(),
            created_at: now_ms(),
            state: AtomicU64::new(SessionState::Idle as u64),
            target: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u64(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u64, Ordering::SeqCst);
    }

    pub fn target(&self) -> Option<SessionTarget> {
        self.target.lock().expect("target mutex poisoned").clone()
    }

    fn set_target(&self, target: SessionTarget) {
        *self.target.lock().expect("target mutex poisoned") = Some(target);
    }
}

pub struct Session {
    info: Arc<SessionInfo>,
    default_protocol: Protocol,
    connector: Arc<dyn Connector>,
    outbound: OutboundSender,
    transport: Option<Arc<dyn Transport>>,
    pump: Option<ReadPump>,
}

impl Session {
    pub fn new(
        info: Arc<SessionInfo>,
        default_protocol: Protocol,
        connector: Arc<dyn Connector>,
        outbound: OutboundSender,
    ) -> Self {
        Self {
            info,
            default_protocol,
            connector,
            outbound,
            transport: None,
            pump: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn state(&self) -> SessionState {
        self.info.state()
    }

    pub async fn dispatch(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Connect { protocol, data } => {
                self.connect(protocol.as_deref(), data).await;
            }
            ClientMessage::Data { data } => self.write(data.as_bytes()).await,
            ClientMessage::Resize { data } => self.resize(data.cols, data.rows).await,
        }
    }

    pub async fn connect(&mut self, protocol: Option<&str>, params: ConnectParams) {
        let state = self.state();
        if matches!(state, SessionState::Connecting | SessionState::Active) {
            tracing::warn!(
                session_id = %self.id(),
                state = ?state,
                "Ignoring connect request; a remote session is already attached"
            );
            return;
        }

        let request = match self.build_request(protocol, params) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(session_id = %self.id(), error = %err, "Rejected connect request");
                self.send_error(format!("Connection failed: {}", err.user_message()))
                    .await;
                return;
            }
        };
        let protocol = request.protocol;

        self.info.set_target(SessionTarget {
            protocol,
            host: request.host.clone(),
            port: request.port,
        });
        self.info.set_state(SessionState::Connecting);
        tracing::info!(
            session_id = %self.id(),
            protocol = %protocol,
            host = %request.host,
            port = request.port,
            "Connecting to remote host"
        );

        match self.connector.connect(&self.info.id, &request).await {
            Ok(transport) => {
                self.transport = Some(transport.clone());
                self.info.set_state(SessionState::Active);
                tracing::info!(
                    session_id = %self.id(),
                    protocol = %protocol,
                    host = %request.host,
                    port = request.port,
                    "Remote session established"
                );
                self.send(Outbound::Envelope(ServerMessage::connected(protocol)))
                    .await;
                self.pump = Some(ReadPump::spawn(
                    self.info.id.clone(),
                    transport,
                    self.outbound.clone(),
                ));
            }
            Err(err) => {
                tracing::warn!(
                    session_id = %self.id(),
                    protocol = %protocol,
                    host = %request.host,
                    port = request.port,
                    code = %err.code(),
                    error = %err.user_message(),
                    "Connection attempt failed"
                );
                self.info.set_state(SessionState::Idle);
                self.send_error(format!("Connection failed: {}", err.user_message()))
                    .await;
            }
        }
    }

    fn build_request(
        &self,
        protocol: Option<&str>,
        params: ConnectParams,
    ) -> BridgeResult<ConnectRequest> {
        let protocol = match protocol {
            Some(name) => name.parse::<Protocol>()?,
            None => self.default_protocol,
        };
        let host = params.host.trim().to_string();
        if host.is_empty() {
            return Err(ApiError::new(ErrorCode::InvalidArgument, "Host is required").into());
        }
        Ok(ConnectRequest {
            protocol,
            host,
            port: params.port.unwrap_or_else(|| protocol.default_port()),
            username: params.username.filter(|value| !value.is_empty()),
            password: params.password.filter(|value| !value.is_empty()),
        })
    }

    pub async fn write(&mut self, data: &[u8]) {
        let Some(transport) = self.active_transport() else {
            tracing::debug!(
                session_id = %self.id(),
                bytes = data.len(),
                "Dropping input; no remote session attached"
            );
            return;
        };
        if let Err(err) = transport.write_chunk(data).await {
            tracing::warn!(session_id = %self.id(), error = %err, "Transport write failed");
            self.send_error(format!("Write error: {}", err.user_message()))
                .await;
            self.shutdown().await;
        }
    }

    pub async fn resize(&mut self, cols: u16, rows: u16) {
        let Some(transport) = self.active_transport() else {
            tracing::debug!(session_id = %self.id(), cols, rows, "Ignoring resize; no remote session attached");
            return;
        };
        tracing::debug!(session_id = %self.id(), cols, rows, "Resizing remote terminal");
        if let Err(err) = transport.resize(cols, rows).await {
            tracing::warn!(session_id = %self.id(), error = %err, cols, rows, "Resize failed");
        }
    }

    /// Never resolves while no pump is running, so it can sit in a
    /// `select!` next to the socket.
    pub async fn pump_exit(&mut self) -> PumpExit {
        let Some(pump) = self.pump.as_mut() else {
            return std::future::pending().await;
        };
        let exit = pump.finished().await;
        self.pump = None;
        exit
    }

    pub async fn on_pump_exit(&mut self, exit: PumpExit) {
        tracing::info!(session_id = %self.id(), exit = ?exit, "Read pump stopped");
        self.shutdown().await;
    }

    // The pump is cancelled and awaited before the transport is closed.
    pub async fn shutdown(&mut self) {
        let pump = self.pump.take();
        let transport = self.transport.take();
        if pump.is_none() && transport.is_none() {
            return;
        }

        self.info.set_state(SessionState::Closing);
        if let Some(pump) = pump {
            pump.cancel().await;
        }
        if let Some(transport) = transport {
            transport.close().await;
        }
        self.info.set_state(SessionState::Closed);
        tracing::info!(session_id = %self.id(), "Remote session released");
    }

    fn active_transport(&self) -> Option<Arc<dyn Transport>> {
        if self.state() != SessionState::Active {
            return None;
        }
        self.transport.clone()
    }

    async fn send_error(&self, message: String) {
        self.send(Outbound::Envelope(ServerMessage::error(message)))
            .await;
    }

    async fn send(&self, frame: Outbound) {
        if self.outbound.send(frame).await.is_err() {
            tracing::debug!(session_id = %self.id(), "Client socket gone; frame dropped");
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionListEntry {
    pub session_id: String,
    pub principal: String,
    pub state: SessionState,
    pub protocol: Option<Protocol>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionListEntry>,
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<SessionInfo>>>,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(config: &SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions: config.max_sessions,
        })
    }

    pub async fn register(&self, principal: &str) -> BridgeResult<Arc<SessionInfo>> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            return Err(ApiError::new(ErrorCode::TooManySessions, "Too many sessions")
                .with_details(format!("limit is {}", self.max_sessions))
                .into());
        }
        let info = Arc::new(SessionInfo::new(Uuid::new_v4().to_string(), principal));
        sessions.insert(info.id.clone(), info.clone());
        Ok(info)
    }

    pub async fn unregister(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn list_sessions(&self) -> SessionListResponse {
        let sessions = self.sessions.read().await;
        let mut entries: Vec<SessionListEntry> = sessions
            .values()
            .map(|info| {
                let target = info.target();
                SessionListEntry {
                    session_id: info.id.clone(),
                    principal: info.principal.clone(),
                    state: info.state(),
                    protocol: target.as_ref().map(|target| target.protocol),
                    host: target.as_ref().map(|target| target.host.clone()),
                    port: target.as_ref().map(|target| target.port),
                    created_at: info.created_at,
                }
            })
            .collect();
        entries.sort_by_key(|entry| entry.created_at);
        SessionListResponse { sessions: entries }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
