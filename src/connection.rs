//! Per-connection handler
//!
//! Each accepted socket gets one [`ConnectionHandler`] running in its own
//! task. The handler loops through
//!
//! ```text
//! Connected -> ReadingHeader -> ReadingBody -> Dispatching -> WritingResponse -> ReadingHeader
//! ```
//!
//! and leaves the loop for `Closing` on peer close, truncated frames,
//! malformed headers, I/O errors, idle timeout or server shutdown. The
//! handler owns the session's [`Registration`], so the registry entry is
//! removed exactly once when the handler is dropped.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::FrameError;
use crate::frame::{format_hex_packet, read_body, read_header, Frame, MbapHeader, ReadOutcome};
use crate::registry::{Registration, SessionId, SessionState};
use crate::stats::ServerStats;

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed between frames
    PeerClosed,
    /// Peer closed in the middle of a frame
    Truncated { consumed: usize },
    /// Read failed (connection reset and friends)
    Reset(io::ErrorKind),
    /// Header or body violated MBAP framing
    Malformed(FrameError),
    /// Response could not be written
    WriteFailed(io::ErrorKind),
    /// No request arrived within the idle timeout
    IdleTimeout,
    /// Server is stopping
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed"),
            Self::Truncated { consumed } => {
                write!(f, "peer closed mid-frame after {} bytes", consumed)
            }
            Self::Reset(kind) => write!(f, "read failed: {}", kind),
            Self::Malformed(e) => write!(f, "malformed frame: {}", e),
            Self::WriteFailed(kind) => write!(f, "write failed: {}", kind),
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// Settings a handler copies from the server configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerOptions {
    pub idle_timeout: Option<Duration>,
    pub packet_logging: bool,
}

/// Serves one master connection
pub struct ConnectionHandler<S> {
    stream: S,
    peer: SocketAddr,
    registration: Registration,
    dispatcher: Dispatcher,
    stats: Arc<ServerStats>,
    shutdown: watch::Receiver<bool>,
    options: HandlerOptions,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        peer: SocketAddr,
        registration: Registration,
        dispatcher: Dispatcher,
        stats: Arc<ServerStats>,
        shutdown: watch::Receiver<bool>,
        options: HandlerOptions,
    ) -> Self {
        Self {
            stream,
            peer,
            registration,
            dispatcher,
            stats,
            shutdown,
            options,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.registration.id()
    }

    /// Run until the session ends. Consumes the handler, which closes the
    /// socket and deregisters the session.
    pub async fn run(mut self) -> CloseReason {
        let reason = self.serve().await;
        self.registration.set_state(SessionState::Closing);

        match &reason {
            CloseReason::PeerClosed | CloseReason::Shutdown => {
                info!("Master {} ({}) disconnected: {}", self.session_id(), self.peer, reason)
            }
            CloseReason::Malformed(_) => {
                warn!("Master {} ({}) dropped: {}", self.session_id(), self.peer, reason)
            }
            _ => info!("Master {} ({}) lost: {}", self.session_id(), self.peer, reason),
        }
        reason
    }

    async fn serve(&mut self) -> CloseReason {
        loop {
            if let Err(reason) = self.transact().await {
                return reason;
            }
        }
    }

    /// Serve one request/response exchange
    async fn transact(&mut self) -> Result<(), CloseReason> {
        let header = self.next_header().await?;
        let frame = self.next_body(header).await?;

        self.stats.record_request(frame.wire_len());
        if self.options.packet_logging {
            log_packet("recv", self.peer, &frame.encode());
        }

        self.registration.set_state(SessionState::Dispatching);
        let pdu = self.dispatcher.dispatch(
            frame.function_code,
            &frame.payload,
            frame.header.unit_id,
        );
        let response = Frame::response_to(&frame.header, pdu.as_slice()).map_err(|e| {
            error!("Cannot frame response for {}: {}", self.peer, e);
            CloseReason::Malformed(e)
        })?;

        self.registration.set_state(SessionState::WritingResponse);
        let bytes = response.encode();
        self.write(&bytes).await?;
        self.stats.record_response(bytes.len(), pdu.is_exception());
        if self.options.packet_logging {
            log_packet("send", self.peer, &bytes);
        }
        Ok(())
    }

    async fn next_header(&mut self) -> Result<MbapHeader, CloseReason> {
        self.registration.set_state(SessionState::ReadingHeader);
        let outcome = tokio::select! {
            biased;
            _ = shutdown_signalled(&mut self.shutdown) => return Err(CloseReason::Shutdown),
            outcome = within(self.options.idle_timeout, read_header(&mut self.stream)) => outcome,
        };
        match outcome {
            Some(outcome) => classify(outcome),
            None => Err(CloseReason::IdleTimeout),
        }
    }

    async fn next_body(&mut self, header: MbapHeader) -> Result<Frame, CloseReason> {
        self.registration.set_state(SessionState::ReadingBody);
        let outcome = tokio::select! {
            biased;
            _ = shutdown_signalled(&mut self.shutdown) => return Err(CloseReason::Shutdown),
            outcome = read_body(&mut self.stream, header) => outcome,
        };
        classify(outcome)
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), CloseReason> {
        let stream = &mut self.stream;
        let result = tokio::select! {
            biased;
            _ = shutdown_signalled(&mut self.shutdown) => return Err(CloseReason::Shutdown),
            result = async {
                stream.write_all(bytes).await?;
                stream.flush().await
            } => result,
        };
        result.map_err(|e| {
            debug!("Write to {} failed: {}", self.peer, e);
            CloseReason::WriteFailed(e.kind())
        })
    }
}

fn classify<T>(outcome: ReadOutcome<T>) -> Result<T, CloseReason> {
    match outcome {
        ReadOutcome::Ok(value) => Ok(value),
        ReadOutcome::EndOfStream => Err(CloseReason::PeerClosed),
        ReadOutcome::Truncated { consumed } => Err(CloseReason::Truncated { consumed }),
        ReadOutcome::Malformed(e) => Err(CloseReason::Malformed(e)),
        ReadOutcome::Error(e) => Err(CloseReason::Reset(e.kind())),
    }
}

/// Resolves once the server asks sessions to close (or the server is gone)
pub(crate) async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn within<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

fn log_packet(direction: &str, peer: SocketAddr, data: &[u8]) {
    debug!("[MODBUS-TCP] {} {} {}", direction, peer, format_hex_packet(data));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MasterRegistry, MasterSession};
    use crate::store::{DataStore, RegisterBank, StoreResult, Table};
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio::task::JoinHandle;

    struct Harness {
        client: DuplexStream,
        registry: MasterRegistry,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<CloseReason>,
    }

    /// Handler over an arbitrary stream: (registry, shutdown sender, task)
    fn spawn_on<S>(
        stream: S,
        store: Arc<dyn DataStore>,
        options: HandlerOptions,
    ) -> (MasterRegistry, watch::Sender<bool>, JoinHandle<CloseReason>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let registry = MasterRegistry::new();
        let peer = SocketAddr::from(([127, 0, 0, 1], 40000));
        let id = registry.next_session_id();
        let registration = registry.register(MasterSession::new(id, peer)).unwrap();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let handler = ConnectionHandler::new(
            stream,
            peer,
            registration,
            Dispatcher::new(store),
            Arc::new(ServerStats::new()),
            shutdown_rx,
            options,
        );
        (registry, shutdown, tokio::spawn(handler.run()))
    }

    fn spawn_handler(store: Arc<dyn DataStore>, options: HandlerOptions) -> Harness {
        let (client, server) = duplex(1024);
        let (registry, shutdown, task) = spawn_on(server, store, options);

        Harness {
            client,
            registry,
            shutdown,
            task,
        }
    }

    fn bank() -> Arc<dyn DataStore> {
        let bank = RegisterBank::with_capacity(32);
        bank.set_coil(1, true).unwrap();
        Arc::new(bank)
    }

    fn read_coils_request(tid: u16, start: u16, count: u16) -> Vec<u8> {
        let mut frame = vec![];
        frame.extend_from_slice(&tid.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x06, 0x01, 0x01]);
        frame.extend_from_slice(&start.to_be_bytes());
        frame.extend_from_slice(&count.to_be_bytes());
        frame
    }

    #[tokio::test]
    async fn test_request_response_then_graceful_close() {
        let mut h = spawn_handler(bank(), HandlerOptions::default());
        assert_eq!(h.registry.count(), 1);

        h.client.write_all(&read_coils_request(0x0102, 1, 1)).await.unwrap();
        let mut response = [0u8; 10];
        h.client.read_exact(&mut response).await.unwrap();
        assert_eq!(
            response,
            [0x01, 0x02, 0x00, 0x00, 0x00, 0x04, 0x01, 0x01, 0x01, 0x01]
        );

        drop(h.client);
        assert_eq!(h.task.await.unwrap(), CloseReason::PeerClosed);
        assert_eq!(h.registry.count(), 0);
    }

    #[tokio::test]
    async fn test_exception_keeps_connection_open() {
        let mut h = spawn_handler(bank(), HandlerOptions::default());

        h.client.write_all(&read_coils_request(7, 0, 0)).await.unwrap();
        let mut response = [0u8; 9];
        h.client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response[..2], &[0x00, 0x07]);
        assert_eq!(&response[7..], &[0x81, 0x03]);

        h.client.write_all(&read_coils_request(8, 1, 1)).await.unwrap();
        let mut response = [0u8; 10];
        h.client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response[..2], &[0x00, 0x08]);
        assert_eq!(&response[7..], &[0x01, 0x01, 0x01]);
        assert_eq!(h.registry.count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_header_closes_without_response() {
        let mut h = spawn_handler(bank(), HandlerOptions::default());

        let mut request = read_coils_request(1, 1, 1);
        request[3] = 0x01;
        h.client.write_all(&request).await.unwrap();

        assert_eq!(
            h.task.await.unwrap(),
            CloseReason::Malformed(FrameError::InvalidProtocolId(1))
        );
        let mut buf = Vec::new();
        assert_eq!(h.client.read_to_end(&mut buf).await.unwrap(), 0);
        assert_eq!(h.registry.count(), 0);
    }

    #[tokio::test]
    async fn test_close_mid_body_is_truncated() {
        let mut h = spawn_handler(bank(), HandlerOptions::default());

        let request = read_coils_request(1, 1, 1);
        h.client.write_all(&request[..9]).await.unwrap();
        drop(h.client);

        assert_eq!(
            h.task.await.unwrap(),
            CloseReason::Truncated { consumed: 9 }
        );
        assert_eq!(h.registry.count(), 0);
    }

    #[tokio::test]
    async fn test_write_failure_closes_session() {
        let mut h = spawn_handler(bank(), HandlerOptions::default());

        // Full request buffered, then the master vanishes before the reply
        h.client.write_all(&read_coils_request(1, 1, 1)).await.unwrap();
        drop(h.client);

        assert_eq!(
            h.task.await.unwrap(),
            CloseReason::WriteFailed(io::ErrorKind::BrokenPipe)
        );
        assert_eq!(h.registry.count(), 0);
    }

    #[tokio::test]
    async fn test_read_error_closes_session() {
        let stream = tokio_test::io::Builder::new()
            .read_error(io::Error::from(io::ErrorKind::ConnectionReset))
            .build();
        let (registry, _shutdown, task) = spawn_on(stream, bank(), HandlerOptions::default());

        assert_eq!(
            task.await.unwrap(),
            CloseReason::Reset(io::ErrorKind::ConnectionReset)
        );
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_signal_closes_session() {
        let h = spawn_handler(bank(), HandlerOptions::default());
        h.shutdown.send(true).unwrap();
        assert_eq!(h.task.await.unwrap(), CloseReason::Shutdown);
        assert_eq!(h.registry.count(), 0);
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let h = spawn_handler(
            bank(),
            HandlerOptions {
                idle_timeout: Some(Duration::from_millis(50)),
                packet_logging: true,
            },
        );
        assert_eq!(h.task.await.unwrap(), CloseReason::IdleTimeout);
        assert_eq!(h.registry.count(), 0);
    }

    struct PanickingStore;

    impl DataStore for PanickingStore {
        fn table_size(&self, _table: Table) -> usize {
            10
        }
        fn read_coils(&self, _start: u16, _count: u16) -> StoreResult<Vec<bool>> {
            panic!("store corrupted")
        }
        fn read_discrete_inputs(&self, _start: u16, _count: u16) -> StoreResult<Vec<bool>> {
            unreachable!()
        }
        fn read_holding_registers(&self, _start: u16, _count: u16) -> StoreResult<Vec<u16>> {
            unreachable!()
        }
        fn read_input_registers(&self, _start: u16, _count: u16) -> StoreResult<Vec<u16>> {
            unreachable!()
        }
        fn write_single_coil(&self, _address: u16, _value: bool) -> StoreResult<()> {
            unreachable!()
        }
        fn write_single_register(&self, _address: u16, _value: u16) -> StoreResult<()> {
            unreachable!()
        }
        fn write_multiple_coils(&self, _start: u16, _values: &[bool]) -> StoreResult<()> {
            unreachable!()
        }
        fn write_multiple_registers(&self, _start: u16, _values: &[u16]) -> StoreResult<()> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn test_panic_during_dispatch_still_deregisters() {
        let mut h = spawn_handler(Arc::new(PanickingStore), HandlerOptions::default());
        h.client.write_all(&read_coils_request(1, 1, 1)).await.unwrap();

        let result = h.task.await;
        assert!(result.unwrap_err().is_panic());
        assert_eq!(h.registry.count(), 0);
    }
}
