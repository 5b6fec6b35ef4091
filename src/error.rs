//! Error types for the Modbus slave stack
//!
//! Three layers of failure exist in a slave:
//!
//! - [`ModbusError`]: server-level failures surfaced to the operator (bind,
//!   configuration, I/O).
//! - [`FrameError`]: MBAP framing violations. These close the offending
//!   connection without a response.
//! - [`ModbusException`]: protocol-level exception codes sent back to the
//!   master inside an exception PDU. The connection stays open.

use std::fmt;

use thiserror::Error;

use crate::constants::{
    EXCEPTION_ACKNOWLEDGE, EXCEPTION_GATEWAY_PATH_UNAVAILABLE, EXCEPTION_GATEWAY_TARGET_FAILED,
    EXCEPTION_ILLEGAL_DATA_ADDRESS, EXCEPTION_ILLEGAL_DATA_VALUE, EXCEPTION_ILLEGAL_FUNCTION,
    EXCEPTION_MEMORY_PARITY_ERROR, EXCEPTION_SERVER_DEVICE_BUSY, EXCEPTION_SERVER_DEVICE_FAILURE,
};

/// Result type used across the crate
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Server-level errors
#[derive(Debug, Error)]
pub enum ModbusError {
    /// Underlying socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bind/accept failures
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Protocol misuse that is not a framing error
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Malformed MBAP frame
    #[error("Invalid frame: {0}")]
    InvalidFrame(#[from] FrameError),

    /// Invalid server configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl ModbusError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

/// MBAP framing violations
///
/// Any of these makes the transaction id untrustworthy, so the connection is
/// closed instead of answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("protocol id must be 0, got {0}")]
    InvalidProtocolId(u16),

    #[error("length field is zero")]
    ZeroLength,

    #[error("frame carries no function code")]
    EmptyPdu,

    #[error("declared PDU of {declared} bytes exceeds the {max} byte maximum")]
    PduTooLarge { declared: usize, max: usize },

    #[error("body is {actual} bytes, header declared {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Modbus exception codes carried in exception responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = EXCEPTION_ILLEGAL_FUNCTION,
    IllegalDataAddress = EXCEPTION_ILLEGAL_DATA_ADDRESS,
    IllegalDataValue = EXCEPTION_ILLEGAL_DATA_VALUE,
    SlaveDeviceFailure = EXCEPTION_SERVER_DEVICE_FAILURE,
    Acknowledge = EXCEPTION_ACKNOWLEDGE,
    SlaveDeviceBusy = EXCEPTION_SERVER_DEVICE_BUSY,
    MemoryParityError = EXCEPTION_MEMORY_PARITY_ERROR,
    GatewayPathUnavailable = EXCEPTION_GATEWAY_PATH_UNAVAILABLE,
    GatewayTargetFailed = EXCEPTION_GATEWAY_TARGET_FAILED,
}

impl ModbusException {
    /// Wire value of the exception code
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parse a wire exception code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            EXCEPTION_ILLEGAL_FUNCTION => Some(Self::IllegalFunction),
            EXCEPTION_ILLEGAL_DATA_ADDRESS => Some(Self::IllegalDataAddress),
            EXCEPTION_ILLEGAL_DATA_VALUE => Some(Self::IllegalDataValue),
            EXCEPTION_SERVER_DEVICE_FAILURE => Some(Self::SlaveDeviceFailure),
            EXCEPTION_ACKNOWLEDGE => Some(Self::Acknowledge),
            EXCEPTION_SERVER_DEVICE_BUSY => Some(Self::SlaveDeviceBusy),
            EXCEPTION_MEMORY_PARITY_ERROR => Some(Self::MemoryParityError),
            EXCEPTION_GATEWAY_PATH_UNAVAILABLE => Some(Self::GatewayPathUnavailable),
            EXCEPTION_GATEWAY_TARGET_FAILED => Some(Self::GatewayTargetFailed),
            _ => None,
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::IllegalFunction => "Illegal Function",
            Self::IllegalDataAddress => "Illegal Data Address",
            Self::IllegalDataValue => "Illegal Data Value",
            Self::SlaveDeviceFailure => "Slave Device Failure",
            Self::Acknowledge => "Acknowledge",
            Self::SlaveDeviceBusy => "Slave Device Busy",
            Self::MemoryParityError => "Memory Parity Error",
            Self::GatewayPathUnavailable => "Gateway Path Unavailable",
            Self::GatewayTargetFailed => "Gateway Target Device Failed To Respond",
        };
        write!(f, "{} (0x{:02X})", name, self.code())
    }
}
