use crate::codec::{Outbound, OutboundSender, ServerMessage};
use crate::error::{ApiError, ErrorCode};
use crate::transport::{Protocol, ReadChunk, Transport};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpExit {
    RemoteClosed,
    ReadFailed(String),
    ClientGone,
}

pub struct ReadPump {
    session_id: String,
    handle: JoinHandle<PumpExit>,
}

impl ReadPump {
    pub fn spawn(
        session_id: String,
        transport: Arc<dyn Transport>,
        outbound: OutboundSender,
    ) -> Self {
        let handle = tokio::spawn(run_pump(session_id.clone(), transport, outbound));
        Self { session_id, handle }
    }

    // Must not be polled again after it has resolved.
    pub async fn finished(&mut self) -> PumpExit {
        match (&mut self.handle).await {
            Ok(exit) => exit,
            Err(err) => {
                tracing::error!(session_id = %self.session_id, error = %err, "Read pump panicked");
                PumpExit::ReadFailed(err.to_string())
            }
        }
    }

    pub async fn cancel(self) {
        self.handle.abort();
        match self.handle.await {
            Ok(exit) => {
                tracing::debug!(session_id = %self.session_id, ?exit, "Read pump ended before cancel");
            }
            Err(err) if err.is_cancelled() => {
                tracing::debug!(session_id = %self.session_id, "Read pump cancelled");
            }
            Err(err) => {
                tracing::warn!(session_id = %self.session_id, error = %err, "Read pump failed during cancel");
            }
        }
    }
}

async fn run_pump(
    session_id: String,
    transport: Arc<dyn Transport>,
    outbound: OutboundSender,
) -> PumpExit {
    loop {
        match transport.read_chunk().await {
            Ok(ReadChunk::Data(bytes)) => {
                if outbound.send(Outbound::Output(bytes)).await.is_err() {
                    return PumpExit::ClientGone;
                }
            }
            Ok(ReadChunk::Empty) => {
                let backoff = transport.idle_backoff();
                if backoff.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    sleep(backoff).await;
                }
            }
            Ok(ReadChunk::Eof) => {
                let closed = remote_closed(transport.protocol());
                tracing::info!(
                    session_id = %session_id,
                    protocol = %transport.protocol(),
                    code = %closed.error_code,
                    "Remote closed the connection"
                );
                let message = ServerMessage::error(closed.user_message());
                let _ = outbound.send(Outbound::Envelope(message)).await;
                return PumpExit::RemoteClosed;
            }
            Err(err) => {
                let message = err.user_message();
                tracing::warn!(session_id = %session_id, error = %message, "Transport read failed");
                let envelope = ServerMessage::error(format!("Read error: {message}"));
                let _ = outbound.send(Outbound::Envelope(envelope)).await;
                return PumpExit::ReadFailed(message);
            }
        }
    }
}

fn remote_closed(protocol: Protocol) -> ApiError {
    ApiError::new(
        ErrorCode::RemoteClosed,
        format!("{} connection closed", protocol.label()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeResult;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    // Replays a fixed script of reads, then reports `Empty` forever.
    struct ScriptedTransport {
        reads: Mutex<VecDeque<BridgeResult<ReadChunk>>>,
    }

    impl ScriptedTransport {
        fn new(reads: Vec<BridgeResult<ReadChunk>>) -> Arc<Self> {
            Arc::new(Self {
                reads: Mutex::new(reads.into()),
            })
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn protocol(&self) -> Protocol {
            Protocol::Ssh
        }

        async fn read_chunk(&self) -> BridgeResult<ReadChunk> {
            let next = self.reads.lock().expect("reads mutex poisoned").pop_front();
            next.unwrap_or(Ok(ReadChunk::Empty))
        }

        async fn write_chunk(&self, _data: &[u8]) -> BridgeResult<()> {
            Ok(())
        }

        async fn resize(&self, _cols: u16, _rows: u16) -> BridgeResult<()> {
            Ok(())
        }

        async fn close(&self) {}

        fn idle_backoff(&self) -> Duration {
            Duration::from_millis(5)
        }
    }

    #[tokio::test]
    async fn forwards_output_in_order_then_reports_close() {
        let transport = ScriptedTransport::new(vec![
            Ok(ReadChunk::Data(Bytes::from_static(b"login: "))),
            Ok(ReadChunk::Empty),
            Ok(ReadChunk::Data(Bytes::from_static(b"\x1b[1mwelcome"))),
            Ok(ReadChunk::Eof),
        ]);
        let (tx, mut rx) = mpsc::channel(8);
        let mut pump = ReadPump::spawn("s1".to_string(), transport, tx);

        let exit = timeout(Duration::from_secs(2), pump.finished())
            .await
            .expect("pump exit");
        assert_eq!(exit, PumpExit::RemoteClosed);
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Output(Bytes::from_static(b"login: ")))
        );
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Output(Bytes::from_static(b"\x1b[1mwelcome")))
        );
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Envelope(ServerMessage::error("SSH connection closed")))
        );
    }

    #[test]
    fn end_of_stream_is_a_remote_closed_error() {
        let closed = remote_closed(Protocol::Telnet);
        assert_eq!(closed.error_code, ErrorCode::RemoteClosed);
        assert_eq!(closed.user_message(), "Telnet connection closed");
    }

    #[tokio::test]
    async fn read_errors_surface_as_envelope() {
        let transport = ScriptedTransport::new(vec![Err(ApiError::new(
            ErrorCode::IoError,
            "socket reset",
        )
        .into())]);
        let (tx, mut rx) = mpsc::channel(8);
        let mut pump = ReadPump::spawn("s1".to_string(), transport, tx);

        let exit = pump.finished().await;
        assert_eq!(exit, PumpExit::ReadFailed("socket reset".to_string()));
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Envelope(ServerMessage::error("Read error: socket reset")))
        );
    }

    #[tokio::test]
    async fn stops_when_client_is_gone() {
        let transport =
            ScriptedTransport::new(vec![Ok(ReadChunk::Data(Bytes::from_static(b"x")))]);
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let mut pump = ReadPump::spawn("s1".to_string(), transport, tx);
        assert_eq!(pump.finished().await, PumpExit::ClientGone);
    }

    #[tokio::test]
    async fn cancel_stops_an_idle_pump() {
        let transport = ScriptedTransport::new(Vec::new());
        let (tx, mut rx) = mpsc::channel(8);
        let pump = ReadPump::spawn("s1".to_string(), transport, tx);

        timeout(Duration::from_secs(2), pump.cancel())
            .await
            .expect("cancel completes");
        // The sender lived inside the task; once it is gone the queue closes.
        assert_eq!(rx.recv().await, None);
    }
}
