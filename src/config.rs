//! # Server Configuration
//!
//! Settings for a [`ModbusTcpServer`](crate::server::ModbusTcpServer).
//!
//! ```rust
//! use std::time::Duration;
//! use voltage_modbus_slave::ServerConfig;
//!
//! let config = ServerConfig::new("127.0.0.1:5020".parse().unwrap())
//!     .with_unit_id(Some(1))
//!     .with_max_connections(16)
//!     .with_idle_timeout(Some(Duration::from_secs(60)));
//!
//! assert!(config.validate().is_ok());
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::constants::{DEFAULT_MAX_CONNECTIONS, DEFAULT_TCP_PORT};
use crate::error::{ModbusError, ModbusResult};

/// Modbus TCP slave configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to listen on. Port 0 picks a free port.
    pub bind_address: SocketAddr,
    /// Answer only this unit id (plus 0 and 255). `None` answers every unit.
    pub unit_id: Option<u8>,
    /// Connections beyond this count are closed right after accept.
    pub max_connections: usize,
    /// Close a session that sends no header for this long.
    pub idle_timeout: Option<Duration>,
    /// Log every received and sent frame as hex.
    pub packet_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_TCP_PORT)),
            unit_id: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout: None,
            packet_logging: false,
        }
    }
}

impl ServerConfig {
    /// Default configuration bound to `bind_address`
    pub fn new(bind_address: SocketAddr) -> Self {
        Self {
            bind_address,
            ..Self::default()
        }
    }

    /// Parse the bind address from a string
    pub fn from_address(addr: &str) -> ModbusResult<Self> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| ModbusError::configuration(format!("Invalid address: {}", e)))?;
        Ok(Self::new(addr))
    }

    pub fn with_unit_id(mut self, unit_id: Option<u8>) -> Self {
        self.unit_id = unit_id;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> ModbusResult<()> {
        if self.max_connections == 0 {
            return Err(ModbusError::configuration(
                "max_connections must be at least 1",
            ));
        }
        if self.idle_timeout == Some(Duration::ZERO) {
            return Err(ModbusError::configuration(
                "idle_timeout must be non-zero when set",
            ));
        }
        if matches!(self.unit_id, Some(0) | Some(0xFF)) {
            return Err(ModbusError::configuration(
                "unit_id 0 and 255 are reserved for broadcast",
            ));
        }
        Ok(())
    }
}
