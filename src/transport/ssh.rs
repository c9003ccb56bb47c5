use crate::config::SshConfig;
use crate::error::{ApiError, BridgeResult, ErrorCode};
use crate::transport::{Protocol, ReadChunk, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};

const READ_QUEUE: usize = 256;
const CLOSE_GRACE: Duration = Duration::from_millis(500);

enum ChannelCommand {
    Data(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    Close,
}

struct ClientHandler {
    session_id: String,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(session_id = %self.session_id, "Accepting SSH host key");
        Ok(true)
    }
}

pub struct SshConnectParams<'a> {
    pub session_id: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub config: &'a SshConfig,
}

pub struct SshTransport {
    session_id: String,
    handle: AsyncMutex<Option<Handle<ClientHandler>>>,
    commands: mpsc::Sender<ChannelCommand>,
    output: AsyncMutex<mpsc::Receiver<Bytes>>,
    closed: Arc<AtomicBool>,
    driver: Mutex<Option<JoinHandle<()>>>,
    poll_interval: Duration,
    pty_cols: AtomicU64,
    pty_rows: AtomicU64,
}

impl SshTransport {
    // Password auth only; agent and key discovery are never consulted.
    pub async fn connect(params: SshConnectParams<'_>) -> BridgeResult<Self> {
        let config = params.config;
        let (handle, channel) = timeout(config.connect_timeout(), open_shell(&params))
            .await
            .map_err(|_| {
                ApiError::new(ErrorCode::ConnectTimeout, "Connection error").with_details(format!(
                    "timed out after {} ms",
                    config.connect_timeout_ms
                ))
            })??;

        let (command_tx, command_rx) = mpsc::channel(config.write_queue.max(1));
        let (output_tx, output_rx) = mpsc::channel(READ_QUEUE);
        let closed = Arc::new(AtomicBool::new(false));
        let driver = tokio::spawn(drive_channel(
            params.session_id.to_string(),
            channel,
            command_rx,
            output_tx,
            closed.clone(),
        ));

        Ok(Self {
            session_id: params.session_id.to_string(),
            handle: AsyncMutex::new(Some(handle)),
            commands: command_tx,
            output: AsyncMutex::new(output_rx),
            closed,
            driver: Mutex::new(Some(driver)),
            poll_interval: config.poll_interval(),
            pty_cols: AtomicU64::new(config.cols as u64),
            pty_rows: AtomicU64::new(config.rows as u64),
        })
    }

    pub fn pty_size(&self) -> (u16, u16) {
        (
            self.pty_cols.load(Ordering::SeqCst) as u16,
            self.pty_rows.load(Ordering::SeqCst) as u16,
        )
    }
}

async fn open_shell(
    params: &SshConnectParams<'_>,
) -> BridgeResult<(Handle<ClientHandler>, Channel<Msg>)> {
    let config = params.config;
    let keepalive = (config.keepalive_interval_ms > 0)
        .then(|| Duration::from_millis(config.keepalive_interval_ms));
    let client_config = Arc::new(client::Config {
        keepalive_interval: keepalive,
        ..Default::default()
    });
    let handler = ClientHandler {
        session_id: params.session_id.to_string(),
    };

    let mut handle = client::connect(client_config, (params.host, params.port), handler)
        .await
        .map_err(classify_ssh_error)?;

    let accepted = handle
        .authenticate_password(params.username.clone(), params.password.clone())
        .await
        .map_err(classify_ssh_error)?;
    if !accepted {
        let _ = handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await;
        return Err(ApiError::new(ErrorCode::AuthFailed, "Authentication failed")
            .with_details(format!("password rejected for user {}", params.username))
            .into());
    }

    let channel = handle
        .channel_open_session()
        .await
        .map_err(classify_ssh_error)?;
    channel
        .request_pty(
            false,
            &config.term,
            config.cols as u32,
            config.rows as u32,
            0,
            0,
            &[],
        )
        .await
        .map_err(classify_ssh_error)?;
    channel
        .request_shell(false)
        .await
        .map_err(classify_ssh_error)?;

    Ok((handle, channel))
}

fn classify_ssh_error(err: russh::Error) -> ApiError {
    match err {
        russh::Error::IO(io) => {
            ApiError::new(ErrorCode::ConnectFailed, "Connection error").with_details(io.to_string())
        }
        russh::Error::Disconnect => ApiError::new(ErrorCode::ConnectFailed, "Connection error")
            .with_details("remote host closed the connection"),
        other => ApiError::new(ErrorCode::ProtocolError, "SSH error").with_details(other.to_string()),
    }
}

// Dropping `output` on exit is what signals end-of-stream to `read_chunk`.
async fn drive_channel(
    session_id: String,
    mut channel: Channel<Msg>,
    mut commands: mpsc::Receiver<ChannelCommand>,
    output: mpsc::Sender<Bytes>,
    closed: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            message = channel.wait() => match message {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if output.send(Bytes::copy_from_slice(&data)).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    tracing::debug!(session_id = %session_id, exit_status, "Remote shell exited");
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    tracing::debug!(session_id = %session_id, "SSH channel closed by remote");
                    break;
                }
                Some(_) => {}
            },
            command = commands.recv() => match command {
                Some(ChannelCommand::Data(data)) => {
                    if let Err(err) = channel.data(&data[..]).await {
                        tracing::warn!(session_id = %session_id, error = %err, "SSH write failed");
                        break;
                    }
                }
                Some(ChannelCommand::Resize { cols, rows }) => {
                    if let Err(err) = channel.window_change(cols as u32, rows as u32, 0, 0).await {
                        tracing::warn!(
                            session_id = %session_id,
                            error = %err,
                            cols,
                            rows,
                            "Failed to resize SSH PTY"
                        );
                    }
                }
                Some(ChannelCommand::Close) | None => {
                    let _ = channel.eof().await;
                    let _ = channel.close().await;
                    break;
                }
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
}

#[async_trait]
impl Transport for SshTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Ssh
    }

    async fn read_chunk(&self) -> BridgeResult<ReadChunk> {
        let mut output = self.output.lock().await;
        match output.try_recv() {
            Ok(data) => Ok(ReadChunk::Data(data)),
            Err(TryRecvError::Empty) => Ok(ReadChunk::Empty),
            Err(TryRecvError::Disconnected) => Ok(ReadChunk::Eof),
        }
    }

    async fn write_chunk(&self, data: &[u8]) -> BridgeResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        match self.commands.try_send(ChannelCommand::Data(data.to_vec())) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::debug!(
                    session_id = %self.session_id,
                    bytes = data.len(),
                    "SSH channel not writable; dropping input"
                );
            }
            Err(TrySendError::Closed(_)) => {
                self.closed.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> BridgeResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self
            .commands
            .send(ChannelCommand::Resize { cols, rows })
            .await
            .is_err()
        {
            tracing::warn!(session_id = %self.session_id, "SSH channel gone; resize ignored");
            return Ok(());
        }
        self.pty_cols.store(cols as u64, Ordering::SeqCst);
        self.pty_rows.store(rows as u64, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.commands.try_send(ChannelCommand::Close);

        let driver = self.driver.lock().expect("driver mutex poisoned").take();
        if let Some(mut driver) = driver
            && timeout(CLOSE_GRACE, &mut driver).await.is_err()
        {
            driver.abort();
        }

        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
            {
                tracing::debug!(
                    session_id = %self.session_id,
                    error = %err,
                    "SSH disconnect on a torn-down session"
                );
            }
            tracing::info!(session_id = %self.session_id, "SSH transport closed");
        }
    }

    fn idle_backoff(&self) -> Duration {
        self.poll_interval
    }
}
