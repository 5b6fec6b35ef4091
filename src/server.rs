//! Modbus TCP slave listener
//!
//! The server binds one listening socket and runs the accept loop in its own
//! task. Every accepted socket is registered in the [`MasterRegistry`]
//! before its [`ConnectionHandler`] task is spawned, so observers never
//! under-count connected masters.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_modbus_slave::{ModbusTcpServer, RegisterBank, ServerConfig, ModbusResult};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let config = ServerConfig::from_address("0.0.0.0:502")?;
//!     let bank = Arc::new(RegisterBank::default());
//!
//!     let mut server = ModbusTcpServer::new(config, bank)?;
//!     let addr = server.start().await?;
//!     println!("listening on {}, {} masters", addr, server.registry().count());
//!
//!     server.stop().await
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::{shutdown_signalled, ConnectionHandler, HandlerOptions};
use crate::dispatcher::Dispatcher;
use crate::error::{ModbusError, ModbusResult};
use crate::registry::{MasterRegistry, MasterSession};
use crate::stats::{ServerStats, StatsSnapshot};
use crate::store::DataStore;

/// Modbus TCP slave
pub struct ModbusTcpServer {
    config: ServerConfig,
    dispatcher: Dispatcher,
    registry: MasterRegistry,
    stats: Arc<ServerStats>,
    shutdown_tx: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<ModbusResult<()>>>,
    local_addr: Option<SocketAddr>,
}

impl ModbusTcpServer {
    /// Create a server over `store`. Nothing is bound until [`start`](Self::start).
    pub fn new(config: ServerConfig, store: Arc<dyn DataStore>) -> ModbusResult<Self> {
        config.validate()?;
        let dispatcher = Dispatcher::new(store).with_unit_id(config.unit_id);

        Ok(Self {
            config,
            dispatcher,
            registry: MasterRegistry::new(),
            stats: Arc::new(ServerStats::new()),
            shutdown_tx: None,
            accept_task: None,
            local_addr: None,
        })
    }

    /// Bind and start accepting masters. Returns the bound address.
    ///
    /// After the accept loop ends on its own, sessions may still be open:
    /// call [`stop`](Self::stop) before starting again.
    pub async fn start(&mut self) -> ModbusResult<SocketAddr> {
        if self.is_running() {
            return Err(ModbusError::protocol("Server is already running"));
        }
        if self.shutdown_tx.is_some() {
            return Err(ModbusError::protocol(
                "Listener stopped but sessions are still attached; call stop() before restarting",
            ));
        }

        let listener = TcpListener::bind(self.config.bind_address)
            .await
            .map_err(|e| {
                ModbusError::connection(format!(
                    "Failed to bind to {}: {}",
                    self.config.bind_address, e
                ))
            })?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            "Modbus TCP slave listening on {} (unit={:?}, max_connections={}, idle_timeout={:?})",
            local_addr, self.config.unit_id, self.config.max_connections, self.config.idle_timeout
        );

        let accept_loop = AcceptLoop {
            listener,
            dispatcher: self.dispatcher.clone(),
            registry: self.registry.clone(),
            stats: self.stats.clone(),
            shutdown: shutdown_rx,
            max_connections: self.config.max_connections,
            options: HandlerOptions {
                idle_timeout: self.config.idle_timeout,
                packet_logging: self.config.packet_logging,
            },
        };
        self.accept_task = Some(tokio::spawn(accept_loop.run()));
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);

        Ok(local_addr)
    }

    /// Stop accepting and tell every session to close.
    ///
    /// Returns once the listening socket is closed. Sessions deregister on
    /// their own shortly after.
    pub async fn stop(&mut self) -> ModbusResult<()> {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return Ok(());
        };
        shutdown_tx.send_replace(true);
        info!(
            "Stopping Modbus TCP slave, closing {} master session(s)",
            self.registry.count()
        );

        self.wait().await
    }

    /// Wait for the accept loop to end. Resolves with the accept error that
    /// stopped it, or `Ok` after [`stop`](Self::stop).
    ///
    /// Cancel safe: dropping the future keeps the accept loop attached.
    pub async fn wait(&mut self) -> ModbusResult<()> {
        let Some(task) = self.accept_task.as_mut() else {
            return Ok(());
        };
        let joined = task.await;
        self.accept_task = None;
        match joined {
            Ok(result) => result,
            Err(e) => Err(ModbusError::protocol(format!("Accept loop aborted: {}", e))),
        }
    }

    /// Whether the accept loop is still taking connections
    pub fn is_running(&self) -> bool {
        self.accept_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Bound address once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Live registry of connected masters
    pub fn registry(&self) -> &MasterRegistry {
        &self.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

struct AcceptLoop {
    listener: TcpListener,
    dispatcher: Dispatcher,
    registry: MasterRegistry,
    stats: Arc<ServerStats>,
    shutdown: watch::Receiver<bool>,
    max_connections: usize,
    options: HandlerOptions,
}

impl AcceptLoop {
    async fn run(mut self) -> ModbusResult<()> {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown_signalled(&mut self.shutdown) => {
                    debug!("Accept loop received shutdown");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    return Err(ModbusError::connection(format!("Accept failed: {}", e)));
                }
            };

            if self.registry.count() >= self.max_connections {
                warn!(
                    "Rejecting master {}: {} connections already open",
                    peer, self.max_connections
                );
                self.stats.record_reject();
                drop(stream);
                continue;
            }

            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
            }

            let id = self.registry.next_session_id();
            let Some(registration) = self.registry.register(MasterSession::new(id, peer)) else {
                warn!("Session id {} already registered, dropping master {}", id, peer);
                continue;
            };
            self.stats.record_accept();
            info!(
                "Master {} connected from {} ({} active)",
                id,
                peer,
                self.registry.count()
            );

            let handler = ConnectionHandler::new(
                stream,
                peer,
                registration,
                self.dispatcher.clone(),
                self.stats.clone(),
                self.shutdown.clone(),
                self.options,
            );
            tokio::spawn(handler.run());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RegisterBank;

    fn local_config() -> ServerConfig {
        ServerConfig::from_address("127.0.0.1:0").unwrap()
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let mut server =
            ModbusTcpServer::new(local_config(), Arc::new(RegisterBank::with_capacity(8))).unwrap();
        assert!(!server.is_running());

        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
        assert!(server.is_running());

        assert!(matches!(
            server.start().await,
            Err(ModbusError::Protocol { .. })
        ));

        server.stop().await.unwrap();
        assert!(!server.is_running());

        // Listening socket is gone
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());

        // Stopping twice is harmless
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_after_accept_loop_ends() {
        let mut server =
            ModbusTcpServer::new(local_config(), Arc::new(RegisterBank::with_capacity(8))).unwrap();
        server.start().await.unwrap();

        // Accept loop dies without stop()
        server.accept_task.as_ref().unwrap().abort();
        assert!(server.wait().await.is_err());
        assert!(!server.is_running());

        match server.start().await {
            Err(ModbusError::Protocol { message }) => assert!(message.contains("stop()")),
            other => panic!("unexpected start result: {:?}", other),
        }

        server.stop().await.unwrap();
        let addr = server.start().await.unwrap();
        assert!(server.is_running());
        assert!(tokio::net::TcpStream::connect(addr).await.is_ok());

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_surfaced() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig::new(taken.local_addr().unwrap());

        let mut server = ModbusTcpServer::new(config, Arc::new(RegisterBank::with_capacity(8))).unwrap();
        assert!(matches!(
            server.start().await,
            Err(ModbusError::Connection { .. })
        ));
        assert!(!server.is_running());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = local_config().with_max_connections(0);
        assert!(ModbusTcpServer::new(config, Arc::new(RegisterBank::with_capacity(8))).is_err());
    }
}
