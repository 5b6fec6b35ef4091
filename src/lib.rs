//! # Voltage Modbus Slave - Async Modbus TCP Slave Stack
//!
//! **Author:** Evan Liu <liuyifanz.1996@gmail.com>
//! **Version:** 0.1.0
//! **License:** MIT
//!
//! A Modbus TCP slave (server) in pure Rust on top of Tokio. It accepts any
//! number of concurrent masters, serves requests against a pluggable
//! [`DataStore`] and keeps a live registry of connected masters that stays
//! accurate through graceful closes, resets and mid-frame disconnects.
//!
//! ## Features
//!
//! - **One task per master**: sessions never block each other
//! - **Strict MBAP framing**: malformed frames close the connection, protocol
//!   errors are answered with exception PDUs
//! - **Accurate master registry**: entries are removed exactly once on every
//!   exit path, including panics in a data store
//! - **Graceful shutdown**: `stop()` closes the listener and every session
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Slave |
//! |------|----------|-------|
//! | 0x01 | Read Coils | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ |
//! | 0x03 | Read Holding Registers | ✅ |
//! | 0x04 | Read Input Registers | ✅ |
//! | 0x05 | Write Single Coil | ✅ |
//! | 0x06 | Write Single Register | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ |
//! | 0x17 | Read/Write Multiple Registers | ✅ |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_modbus_slave::{ModbusResult, ModbusTcpServer, RegisterBank, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let bank = Arc::new(RegisterBank::with_capacity(1000));
//!     bank.set_holding_register(0, 0x1234).ok();
//!
//!     let config = ServerConfig::from_address("0.0.0.0:502")?.with_unit_id(Some(1));
//!     let mut server = ModbusTcpServer::new(config, bank)?;
//!     server.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     println!("{} masters connected at shutdown", server.registry().count());
//!     server.stop().await
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Modbus protocol constants based on official specification
pub mod constants;

/// High-performance PDU with stack-allocated fixed array
pub mod pdu;

/// MBAP framing and frame readers
pub mod frame;

// ============================================================================
// Slave modules
// ============================================================================

/// Register tables served to masters
pub mod store;

/// Request validation and execution
pub mod dispatcher;

/// Registry of connected masters
pub mod registry;

/// Per-connection state machine
pub mod connection;

/// Server configuration
pub mod config;

/// Server counters
pub mod stats;

/// TCP listener and accept loop
pub mod server;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use voltage_modbus_slave::tokio) ===
pub use tokio;

// === Core server API ===
pub use config::ServerConfig;
pub use server::ModbusTcpServer;

// === Error handling ===
pub use error::{FrameError, ModbusError, ModbusException, ModbusResult};

// === Data model ===
pub use dispatcher::Dispatcher;
pub use store::{BankSizes, DataStore, RegisterBank, StoreError, StoreResult, Table};

// === Sessions ===
pub use connection::{CloseReason, ConnectionHandler, HandlerOptions};
pub use registry::{MasterRegistry, MasterSession, Registration, SessionId, SessionState};

// === Framing ===
pub use frame::{Frame, MbapHeader, ReadOutcome};

// === Monitoring ===
pub use stats::{ServerStats, StatsSnapshot};

// === Protocol limits (commonly needed constants) ===
pub use constants::{
    DEFAULT_TCP_PORT, MAX_PDU_SIZE, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS,
    MAX_WRITE_REGISTERS,
};

// === PDU (advanced usage) ===
pub use pdu::{ModbusPdu, PduBuilder};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!(
        "Voltage Modbus Slave v{} - Async Modbus TCP slave stack by Evan Liu",
        VERSION
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_mentions_version() {
        assert!(info().contains(VERSION));
    }
}
