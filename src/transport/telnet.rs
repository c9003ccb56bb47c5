use crate::config::{TelnetConfig, TelnetLineEnding};
use crate::error::{ApiError, BridgeResult, ErrorCode};
use crate::transport::{Protocol, ReadChunk, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep, sleep_until, timeout};

const IAC: u8 = 0xff;
const DONT: u8 = 0xfe;
const DO: u8 = 0xfd;
const WONT: u8 = 0xfc;
const WILL: u8 = 0xfb;
const SB: u8 = 0xfa;
const SE: u8 = 0xf0;

const OPT_BINARY: u8 = 0;
const OPT_ECHO: u8 = 1;
const OPT_SGA: u8 = 3;
const OPT_TTYPE: u8 = 24;
const OPT_NAWS: u8 = 31;

const TTYPE_IS: u8 = 0;
const TTYPE_SEND: u8 = 1;

const MAX_SUBNEGOTIATION: usize = 1024;
const READ_QUEUE: usize = 256;
const WRITE_QUEUE: usize = 128;
const CLOSE_GRACE: Duration = Duration::from_millis(500);

enum WriteItem {
    Data(Vec<u8>),
    Raw(Vec<u8>),
    Close,
}

pub struct TelnetConnectParams<'a> {
    pub session_id: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub config: &'a TelnetConfig,
}

pub struct TelnetTransport {
    session_id: String,
    sender: mpsc::Sender<WriteItem>,
    output: AsyncMutex<mpsc::Receiver<Bytes>>,
    connected: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    read_timeout: Duration,
    line_ending: TelnetLineEnding,
}

impl TelnetTransport {
    pub async fn connect(params: TelnetConnectParams<'_>) -> BridgeResult<Self> {
        let config = params.config;
        let started = Instant::now();
        let addr = format!("{}:{}", params.host, params.port);
        let stream = timeout(config.max_wait(), TcpStream::connect(addr))
            .await
            .map_err(|_| {
                telnet_error(
                    ErrorCode::ConnectTimeout,
                    format!("timed out after {} ms", config.connect_max_wait_ms),
                )
            })?
            .map_err(|err| telnet_error(ErrorCode::ConnectFailed, err.to_string()))?;

        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel::<WriteItem>(WRITE_QUEUE);
        let (output_tx, output_rx) = mpsc::channel::<Bytes>(READ_QUEUE);
        let connected = Arc::new(AtomicBool::new(true));
        let last_negotiation = Arc::new(Mutex::new(None::<Instant>));

        tokio::spawn(run_writer(
            params.session_id.to_string(),
            writer,
            rx,
            connected.clone(),
        ));

        let negotiator = Negotiator::new(config.term.clone(), config.cols, config.rows);
        let reader_task = tokio::spawn(run_reader(
            params.session_id.to_string(),
            reader,
            negotiator,
            tx.clone(),
            output_tx,
            last_negotiation.clone(),
        ));

        let transport = Self {
            session_id: params.session_id.to_string(),
            sender: tx,
            output: AsyncMutex::new(output_rx),
            connected,
            reader: Mutex::new(Some(reader_task)),
            read_timeout: config.read_timeout(),
            line_ending: config.line_ending.clone(),
        };

        await_negotiation(
            started,
            &last_negotiation,
            config.min_wait(),
            config.max_wait(),
        )
        .await;

        if let (Some(username), Some(password)) = (&params.username, &params.password)
            && let Err(err) = transport
                .push_credentials(username, password, config.settle_delay())
                .await
        {
            transport.close().await;
            return Err(err);
        }

        Ok(transport)
    }

    async fn push_credentials(
        &self,
        username: &str,
        password: &str,
        settle_delay: Duration,
    ) -> BridgeResult<()> {
        let lines = [format!("{username}\r\n"), format!("{password}\r\n"), "\r\n".to_string()];
        for line in lines {
            sleep(settle_delay).await;
            if !self.connected.load(Ordering::SeqCst) {
                return Err(telnet_error(
                    ErrorCode::ConnectFailed,
                    "connection closed during login",
                )
                .into());
            }
            self.sender
                .send(WriteItem::Data(line.into_bytes()))
                .await
                .map_err(|_| telnet_error(ErrorCode::ConnectFailed, "failed to send credentials"))?;
        }
        tracing::debug!(session_id = %self.session_id, "Telnet credentials sent");
        Ok(())
    }
}

impl Drop for TelnetTransport {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.reader.lock()
            && let Some(reader) = slot.take()
        {
            reader.abort();
        }
    }
}

fn telnet_error(code: ErrorCode, details: impl Into<String>) -> ApiError {
    ApiError::new(code, "Telnet connection error").with_details(details)
}

async fn run_writer(
    session_id: String,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::Receiver<WriteItem>,
    connected: Arc<AtomicBool>,
) {
    while let Some(item) = rx.recv().await {
        let payload = match item {
            WriteItem::Close => {
                let _ = writer.shutdown().await;
                break;
            }
            WriteItem::Data(data) => escape_iac(&data),
            WriteItem::Raw(data) => data,
        };
        let written = match writer.write_all(&payload).await {
            Ok(()) => writer.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            tracing::warn!(session_id = %session_id, error = %err, "Telnet write failed");
            connected.store(false, Ordering::SeqCst);
            break;
        }
    }
}

async fn run_reader(
    session_id: String,
    mut reader: tokio::net::tcp::OwnedReadHalf,
    mut negotiator: Negotiator,
    responses: mpsc::Sender<WriteItem>,
    output: mpsc::Sender<Bytes>,
    last_negotiation: Arc<Mutex<Option<Instant>>>,
) {
    let mut parser = TelnetParser::default();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let result = parser.process(&buf[..n]);
                if !result.events.is_empty() {
                    *last_negotiation.lock().expect("negotiation clock poisoned") =
                        Some(Instant::now());
                }
                for event in result.events {
                    for response in negotiator.handle_event(event) {
                        let _ = responses.send(WriteItem::Raw(response)).await;
                    }
                }
                if !result.data.is_empty()
                    && output.send(Bytes::from(result.data)).await.is_err()
                {
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "Telnet read failed");
                break;
            }
        }
    }
    tracing::debug!(session_id = %session_id, "Telnet stream reached end-of-file");
}

async fn await_negotiation(
    started: Instant,
    last_negotiation: &Mutex<Option<Instant>>,
    min_wait: Duration,
    max_wait: Duration,
) {
    let deadline = started + max_wait;
    sleep_until(started + min_wait).await;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        let last = *last_negotiation.lock().expect("negotiation clock poisoned");
        let Some(last) = last else {
            return;
        };
        let quiet_at = last + min_wait;
        if quiet_at <= now {
            return;
        }
        sleep_until(quiet_at.min(deadline)).await;
    }
}

#[async_trait]
impl Transport for TelnetTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Telnet
    }

    async fn read_chunk(&self) -> BridgeResult<ReadChunk> {
        let mut output = self.output.lock().await;
        match timeout(self.read_timeout, output.recv()).await {
            Ok(Some(data)) => Ok(ReadChunk::Data(data)),
            Ok(None) => {
                self.connected.store(false, Ordering::SeqCst);
                Ok(ReadChunk::Eof)
            }
            Err(_) => Ok(ReadChunk::Empty),
        }
    }

    async fn write_chunk(&self, data: &[u8]) -> BridgeResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let payload = normalize_line_endings(data, &self.line_ending);
        if self.sender.send(WriteItem::Data(payload)).await.is_err() {
            self.connected.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> BridgeResult<()> {
        tracing::debug!(
            session_id = %self.session_id,
            cols,
            rows,
            "Telnet resize requested; not supported"
        );
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let reader = self.reader.lock().expect("reader mutex poisoned").take();
        let Some(reader) = reader else {
            return;
        };
        let _ = timeout(CLOSE_GRACE, self.sender.send(WriteItem::Close)).await;
        reader.abort();
        let _ = reader.await;
        tracing::info!(session_id = %self.session_id, "Telnet transport closed");
    }
}

fn normalize_line_endings(bytes: &[u8], mode: &TelnetLineEnding) -> Vec<u8> {
    let newline: &[u8] = match mode {
        TelnetLineEnding::PassThrough => return bytes.to_vec(),
        TelnetLineEnding::Cr => b"\r",
        TelnetLineEnding::Crlf => b"\r\n",
        TelnetLineEnding::Lf => b"\n",
    };
    let mut out = Vec::with_capacity(bytes.len() + 4);
    let mut iter = bytes.iter().peekable();
    while let Some(&b) = iter.next() {
        match b {
            b'\r' => {
                if iter.peek() == Some(&&b'\n') {
                    iter.next();
                }
                out.extend_from_slice(newline);
            }
            b'\n' => out.extend_from_slice(newline),
            other => out.push(other),
        }
    }
    out
}

struct ParseResult {
    data: Vec<u8>,
    events: Vec<TelnetEvent>,
}

#[derive(Debug)]
enum TelnetEvent {
    Negotiation { command: u8, option: u8 },
    Subnegotiation { option: u8, data: Vec<u8> },
}

#[derive(Default)]
struct TelnetParser {
    state: ParserState,
    sb_option: Option<u8>,
    sb_data: Vec<u8>,
    sb_overflow: bool,
}

#[derive(Debug, Default)]
enum ParserState {
    #[default]
    Data,
    Iac,
    Command(u8),
    Subnegotiation,
    SubIac,
}

impl TelnetParser {
    // State carries across calls so sequences split between reads are handled.
    fn process(&mut self, input: &[u8]) -> ParseResult {
        let mut data = Vec::with_capacity(input.len());
        let mut events = Vec::new();

        for &byte in input {
            self.state = match self.state {
                ParserState::Data if byte == IAC => ParserState::Iac,
                ParserState::Data => {
                    data.push(byte);
                    ParserState::Data
                }
                ParserState::Iac => match byte {
                    IAC => {
                        data.push(IAC);
                        ParserState::Data
                    }
                    DO | DONT | WILL | WONT => ParserState::Command(byte),
                    SB => {
                        self.sb_option = None;
                        self.sb_data.clear();
                        self.sb_overflow = false;
                        ParserState::Subnegotiation
                    }
                    _ => ParserState::Data,
                },
                ParserState::Command(command) => {
                    events.push(TelnetEvent::Negotiation {
                        command,
                        option: byte,
                    });
                    ParserState::Data
                }
                ParserState::Subnegotiation if byte == IAC => ParserState::SubIac,
                ParserState::Subnegotiation => {
                    if self.sb_option.is_none() {
                        self.sb_option = Some(byte);
                    } else {
                        self.push_sb(byte);
                    }
                    ParserState::Subnegotiation
                }
                ParserState::SubIac => match byte {
                    SE => {
                        let option = self.sb_option.take();
                        if self.sb_overflow {
                            tracing::debug!(?option, "Dropping oversized Telnet subnegotiation");
                        } else if let Some(option) = option {
                            events.push(TelnetEvent::Subnegotiation {
                                option,
                                data: std::mem::take(&mut self.sb_data),
                            });
                        }
                        self.sb_data.clear();
                        self.sb_overflow = false;
                        ParserState::Data
                    }
                    IAC => {
                        self.push_sb(IAC);
                        ParserState::Subnegotiation
                    }
                    _ => ParserState::Subnegotiation,
                },
            };
        }

        ParseResult { data, events }
    }

    fn push_sb(&mut self, byte: u8) {
        if self.sb_overflow {
            return;
        }
        if self.sb_data.len() < MAX_SUBNEGOTIATION {
            self.sb_data.push(byte);
        } else {
            self.sb_overflow = true;
            self.sb_data = Vec::new();
        }
    }
}

// Later resizes are not renegotiated.
struct Negotiator {
    local_enabled: HashMap<u8, bool>,
    remote_enabled: HashMap<u8, bool>,
    term: String,
    cols: u16,
    rows: u16,
}

impl Negotiator {
    fn new(term: String, cols: u16, rows: u16) -> Self {
        Self {
            local_enabled: HashMap::new(),
            remote_enabled: HashMap::new(),
            term,
            cols,
            rows,
        }
    }

    fn handle_event(&mut self, event: TelnetEvent) -> Vec<Vec<u8>> {
        match event {
            TelnetEvent::Negotiation { command, option } => self.handle_negotiation(command, option),
            TelnetEvent::Subnegotiation { option, data } => {
                if option == OPT_TTYPE && data.first().copied() == Some(TTYPE_SEND) {
                    vec![self.build_ttype()]
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn handle_negotiation(&mut self, command: u8, option: u8) -> Vec<Vec<u8>> {
        let mut responses = Vec::new();
        match command {
            DO if allow_local(option) => {
                if !self.is_enabled(&self.local_enabled, option) {
                    self.local_enabled.insert(option, true);
                    responses.push(iac_command(WILL, option));
                    if option == OPT_NAWS {
                        responses.push(self.build_naws());
                    }
                }
            }
            DO => {
                self.local_enabled.insert(option, false);
                responses.push(iac_command(WONT, option));
            }
            DONT => {
                if self.is_enabled(&self.local_enabled, option) {
                    self.local_enabled.insert(option, false);
                    responses.push(iac_command(WONT, option));
                }
            }
            WILL if allow_remote(option) => {
                if !self.is_enabled(&self.remote_enabled, option) {
                    self.remote_enabled.insert(option, true);
                    responses.push(iac_command(DO, option));
                }
            }
            WILL => {
                self.remote_enabled.insert(option, false);
                responses.push(iac_command(DONT, option));
            }
            WONT => {
                if self.is_enabled(&self.remote_enabled, option) {
                    self.remote_enabled.insert(option, false);
                    responses.push(iac_command(DONT, option));
                }
            }
            _ => {}
        }
        responses
    }

    fn is_enabled(&self, table: &HashMap<u8, bool>, option: u8) -> bool {
        table.get(&option).copied().unwrap_or(false)
    }

    fn build_naws(&self) -> Vec<u8> {
        let mut payload = vec![IAC, SB, OPT_NAWS];
        payload.extend_from_slice(&escape_iac(&self.cols.to_be_bytes()));
        payload.extend_from_slice(&escape_iac(&self.rows.to_be_bytes()));
        payload.extend_from_slice(&[IAC, SE]);
        payload
    }

    fn build_ttype(&self) -> Vec<u8> {
        let mut payload = vec![IAC, SB, OPT_TTYPE, TTYPE_IS];
        payload.extend_from_slice(&escape_iac(self.term.as_bytes()));
        payload.extend_from_slice(&[IAC, SE]);
        payload
    }
}

fn allow_local(option: u8) -> bool {
    matches!(option, OPT_BINARY | OPT_SGA | OPT_TTYPE | OPT_NAWS)
}

fn allow_remote(option: u8) -> bool {
    matches!(option, OPT_BINARY | OPT_ECHO | OPT_SGA)
}

fn iac_command(cmd: u8, option: u8) -> Vec<u8> {
    vec![IAC, cmd, option]
}

fn escape_iac(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    for &b in bytes {
        if b == IAC {
            out.push(IAC);
        }
        out.push(b);
    }
    out
}
