use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use termbridge::config::{AuthMode, Config, TelnetConfig};
use termbridge::server::{self, AppState};
use termbridge::session::SessionManager;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config() -> Config {
    let mut config = Config::default();
    config.telnet = TelnetConfig {
        connect_min_wait_ms: 20,
        connect_max_wait_ms: 500,
        settle_delay_ms: 20,
        read_timeout_ms: 20,
        ..TelnetConfig::default()
    };
    config.ssh.connect_timeout_ms = 2_000;
    config
}

async fn spawn_bridge(config: Config) -> SocketAddr {
    spawn_bridge_with_sessions(config).await.0
}

async fn spawn_bridge_with_sessions(config: Config) -> (SocketAddr, Arc<SessionManager>) {
    let state = AppState::from_config(&config).expect("state");
    let sessions = state.sessions.clone();
    let app = server::router(state, &config.server.allowed_origins);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, sessions)
}

async fn spawn_echo_host() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

async fn refused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    port
}

async fn open(addr: SocketAddr, path: &str) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}{path}"))
        .await
        .expect("websocket connect");
    client
}

async fn send_json(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string().into()))
        .await
        .expect("send");
}

async fn next_envelope(client: &mut Client) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("frame in time")
            .expect("socket open")
            .expect("frame");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).expect("json envelope"),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("expected envelope, got {other:?}"),
        }
    }
}

async fn read_output(client: &mut Client, want: usize) -> Vec<u8> {
    let mut collected = Vec::new();
    while collected.len() < want {
        let frame = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("output in time")
            .expect("socket open")
            .expect("frame");
        match frame {
            Message::Binary(bytes) => collected.extend_from_slice(&bytes),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("expected terminal output, got {other:?}"),
        }
    }
    collected
}

#[tokio::test]
async fn telnet_session_round_trips_keystrokes() {
    let host_port = spawn_echo_host().await;
    let addr = spawn_bridge(test_config()).await;
    let mut client = open(addr, "/ws/terminal").await;

    send_json(
        &mut client,
        json!({"type": "connect", "data": {"host": "127.0.0.1", "port": host_port}}),
    )
    .await;
    assert_eq!(
        next_envelope(&mut client).await,
        json!({"type": "connected", "data": "Successfully connected", "protocol": "telnet"})
    );

    send_json(&mut client, json!({"type": "data", "data": "ls\n"})).await;
    assert_eq!(read_output(&mut client, 3).await, b"ls\n".to_vec());

    // Malformed frames are dropped without ending the session.
    client
        .send(Message::Text("not json".to_string().into()))
        .await
        .expect("send");
    send_json(&mut client, json!({"type": "resize", "data": {"cols": 120, "rows": 40}})).await;

    client
        .send(Message::Binary(b"pwd\r".to_vec().into()))
        .await
        .expect("send");
    assert_eq!(read_output(&mut client, 4).await, b"pwd\r".to_vec());

    client.close(None).await.expect("close");
}

#[tokio::test]
async fn closing_client_socket_releases_remote_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let host_port = listener.local_addr().expect("addr").port();
    let (eof_tx, eof_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut buf = [0u8; 256];
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = eof_tx.send(());
    });

    let (addr, sessions) = spawn_bridge_with_sessions(test_config()).await;
    let mut client = open(addr, "/ws/terminal").await;
    send_json(
        &mut client,
        json!({"type": "connect", "data": {"host": "127.0.0.1", "port": host_port}}),
    )
    .await;
    assert_eq!(next_envelope(&mut client).await["type"], "connected");
    assert_eq!(sessions.len().await, 1);

    client.close(None).await.expect("close");
    timeout(Duration::from_secs(3), eof_rx)
        .await
        .expect("remote saw the connection close")
        .expect("remote host task");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while sessions.len().await > 0 {
        assert!(tokio::time::Instant::now() < deadline, "session still registered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn failed_connect_can_be_retried_on_same_socket() {
    let host_port = spawn_echo_host().await;
    let dead_port = refused_port().await;
    let addr = spawn_bridge(test_config()).await;
    let mut client = open(addr, "/ws/terminal").await;

    send_json(
        &mut client,
        json!({"type": "connect", "protocol": "telnet", "data": {"host": "127.0.0.1", "port": dead_port}}),
    )
    .await;
    let error = next_envelope(&mut client).await;
    assert_eq!(error["type"], "error");
    let message = error["data"].as_str().expect("message");
    assert!(
        message.starts_with("Connection failed: Telnet connection error"),
        "{message}"
    );

    send_json(
        &mut client,
        json!({"type": "connect", "protocol": "telnet", "data": {"host": "127.0.0.1", "port": host_port.to_string()}}),
    )
    .await;
    assert_eq!(next_envelope(&mut client).await["type"], "connected");
}

#[tokio::test]
async fn unsupported_protocol_is_reported() {
    let addr = spawn_bridge(test_config()).await;
    let mut client = open(addr, "/ws/terminal").await;

    send_json(
        &mut client,
        json!({"type": "connect", "protocol": "rlogin", "data": {"host": "127.0.0.1"}}),
    )
    .await;
    assert_eq!(
        next_envelope(&mut client).await,
        json!({"type": "error", "data": "Connection failed: Unsupported protocol: rlogin"})
    );
}

#[tokio::test]
async fn ssh_endpoint_reports_unreachable_host() {
    let dead_port = refused_port().await;
    let addr = spawn_bridge(test_config()).await;
    let mut client = open(addr, "/ws/ssh").await;

    send_json(
        &mut client,
        json!({"type": "connect", "data": {"host": "127.0.0.1", "port": dead_port, "username": "a", "password": "b"}}),
    )
    .await;
    let error = next_envelope(&mut client).await;
    assert_eq!(error["type"], "error");
    let message = error["data"].as_str().expect("message");
    assert!(message.starts_with("Connection failed: Connection error"), "{message}");

    // Still idle: input is silently ignored and the socket stays usable.
    send_json(&mut client, json!({"type": "data", "data": "ls\n"})).await;
    send_json(
        &mut client,
        json!({"type": "connect", "data": {"host": "127.0.0.1", "port": dead_port, "username": "a", "password": "b"}}),
    )
    .await;
    assert_eq!(next_envelope(&mut client).await["type"], "error");
}

#[tokio::test]
async fn remote_hang_up_reports_closed_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let host_port = listener.local_addr().expect("addr").port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        socket.write_all(b"bye\r\n").await.expect("write");
    });

    let addr = spawn_bridge(test_config()).await;
    let mut client = open(addr, "/ws/terminal").await;
    send_json(
        &mut client,
        json!({"type": "connect", "data": {"host": "127.0.0.1", "port": host_port}}),
    )
    .await;
    assert_eq!(next_envelope(&mut client).await["type"], "connected");
    assert_eq!(read_output(&mut client, 5).await, b"bye\r\n".to_vec());
    assert_eq!(
        next_envelope(&mut client).await,
        json!({"type": "error", "data": "Telnet connection closed"})
    );
}

#[tokio::test]
async fn jwt_mode_gates_sockets_and_listing() {
    let mut config = test_config();
    config.auth.mode = AuthMode::Jwt;
    config.auth.jwt_secret = "s3cret".to_string();
    let addr = spawn_bridge(config).await;

    let err = connect_async(format!("ws://{addr}/ws/terminal"))
        .await
        .err()
        .expect("rejected");
    match err {
        tungstenite::Error::Http(response) => assert_eq!(response.status(), 401),
        other => panic!("expected HTTP rejection, got {other:?}"),
    }

    let token = encode(
        &Header::default(),
        &json!({"sub": "alice"}),
        &EncodingKey::from_secret(b"s3cret"),
    )
    .expect("token");
    let _client = open(addr, &format!("/ws/terminal?token={token}")).await;

    let http = reqwest::Client::new();
    let health = http
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .expect("health");
    assert_eq!(health.status(), 200);

    let unauthorized = http
        .get(format!("http://{addr}/sessions"))
        .send()
        .await
        .expect("sessions");
    assert_eq!(unauthorized.status(), 401);

    let listing: Value = http
        .get(format!("http://{addr}/sessions"))
        .bearer_auth(&token)
        .send()
        .await
        .expect("sessions")
        .json()
        .await
        .expect("json");
    let sessions = listing["sessions"].as_array().expect("array");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["principal"], "alice");
    assert_eq!(sessions[0]["state"], "idle");
}
