//! Request dispatcher
//!
//! Turns a decoded request PDU into a response PDU. Every failure here is a
//! protocol-level failure answered with an exception PDU; nothing in this
//! module can close a connection.
//!
//! Validation runs in a fixed order:
//!
//! 1. unit id filter (only when the server is bound to one unit)
//! 2. function code known
//! 3. payload shape (length, byte count, coil value)
//! 4. address range inside the store table
//! 5. quantity inside protocol limits
//! 6. store call, whose errors map to exception 2 or 4

use std::sync::Arc;

use bytes::Buf;
use tracing::{debug, warn};

use crate::constants::{
    COIL_OFF, COIL_ON, FC_READ_COILS, FC_READ_DISCRETE_INPUTS, FC_READ_HOLDING_REGISTERS,
    FC_READ_INPUT_REGISTERS, FC_READ_WRITE_MULTIPLE_REGISTERS, FC_WRITE_MULTIPLE_COILS,
    FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER, MAX_READ_COILS,
    MAX_READ_REGISTERS, MAX_RW_WRITE_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};
use crate::error::ModbusException;
use crate::pdu::{unpack_bits, ModbusPdu, PduBuilder};
use crate::store::{DataStore, StoreError, Table};

/// Unit ids every TCP slave answers regardless of its configured unit
const BROADCAST_UNIT_IDS: [u8; 2] = [0x00, 0xFF];

/// A request whose payload matched its function's parameter shape
#[derive(Debug, Clone, PartialEq, Eq)]
enum Request {
    ReadBits {
        table: Table,
        start: u16,
        quantity: u16,
    },
    ReadRegisters {
        table: Table,
        start: u16,
        quantity: u16,
    },
    WriteSingleCoil {
        address: u16,
        raw: u16,
    },
    WriteSingleRegister {
        address: u16,
        value: u16,
    },
    WriteMultipleCoils {
        start: u16,
        values: Vec<bool>,
    },
    WriteMultipleRegisters {
        start: u16,
        values: Vec<u16>,
    },
    ReadWriteMultipleRegisters {
        read_start: u16,
        read_quantity: u16,
        write_start: u16,
        values: Vec<u16>,
    },
}

type Outcome<T> = Result<T, ModbusException>;

/// Dispatches requests against a [`DataStore`]
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn DataStore>,
    unit_id: Option<u8>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("unit_id", &self.unit_id)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Dispatcher answering every unit id
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self {
            store,
            unit_id: None,
        }
    }

    /// Only answer `unit_id` (plus the broadcast ids 0 and 255)
    pub fn with_unit_id(mut self, unit_id: Option<u8>) -> Self {
        self.unit_id = unit_id;
        self
    }

    /// Whether `function_code` has a handler
    pub fn supports(function_code: u8) -> bool {
        matches!(
            function_code,
            FC_READ_COILS
                | FC_READ_DISCRETE_INPUTS
                | FC_READ_HOLDING_REGISTERS
                | FC_READ_INPUT_REGISTERS
                | FC_WRITE_SINGLE_COIL
                | FC_WRITE_SINGLE_REGISTER
                | FC_WRITE_MULTIPLE_COILS
                | FC_WRITE_MULTIPLE_REGISTERS
                | FC_READ_WRITE_MULTIPLE_REGISTERS
        )
    }

    /// Produce the response PDU for one request
    pub fn dispatch(&self, function_code: u8, payload: &[u8], unit_id: u8) -> ModbusPdu {
        match self.handle(function_code, payload, unit_id) {
            Ok(pdu) => pdu,
            Err(exception) => {
                debug!(
                    "FC={:02X} ({}) unit={} answered with exception {}",
                    function_code,
                    ModbusPdu::function_code_description(function_code),
                    unit_id,
                    exception
                );
                ModbusPdu::exception(function_code, exception)
            }
        }
    }

    fn handle(&self, function_code: u8, payload: &[u8], unit_id: u8) -> Outcome<ModbusPdu> {
        if let Some(own) = self.unit_id {
            if unit_id != own && !BROADCAST_UNIT_IDS.contains(&unit_id) {
                return Err(ModbusException::GatewayTargetFailed);
            }
        }

        let request = parse_request(function_code, payload)?;
        self.validate(&request)?;
        self.execute(function_code, request)
    }

    fn check_address(&self, table: Table, start: u16, quantity: usize) -> Outcome<()> {
        let size = self.store.table_size(table);
        if start as usize + quantity.max(1) > size {
            return Err(ModbusException::IllegalDataAddress);
        }
        Ok(())
    }

    fn validate(&self, request: &Request) -> Outcome<()> {
        match request {
            Request::ReadBits {
                table,
                start,
                quantity,
            } => {
                self.check_address(*table, *start, *quantity as usize)?;
                check_quantity(*quantity as usize, MAX_READ_COILS)
            }
            Request::ReadRegisters {
                table,
                start,
                quantity,
            } => {
                self.check_address(*table, *start, *quantity as usize)?;
                check_quantity(*quantity as usize, MAX_READ_REGISTERS)
            }
            Request::WriteSingleCoil { address, .. } => {
                self.check_address(Table::Coils, *address, 1)
            }
            Request::WriteSingleRegister { address, .. } => {
                self.check_address(Table::HoldingRegisters, *address, 1)
            }
            Request::WriteMultipleCoils { start, values } => {
                self.check_address(Table::Coils, *start, values.len())?;
                check_quantity(values.len(), MAX_WRITE_COILS)
            }
            Request::WriteMultipleRegisters { start, values } => {
                self.check_address(Table::HoldingRegisters, *start, values.len())?;
                check_quantity(values.len(), MAX_WRITE_REGISTERS)
            }
            Request::ReadWriteMultipleRegisters {
                read_start,
                read_quantity,
                write_start,
                values,
            } => {
                self.check_address(Table::HoldingRegisters, *read_start, *read_quantity as usize)?;
                self.check_address(Table::HoldingRegisters, *write_start, values.len())?;
                check_quantity(*read_quantity as usize, MAX_READ_REGISTERS)?;
                check_quantity(values.len(), MAX_RW_WRITE_REGISTERS)
            }
        }
    }

    fn execute(&self, fc: u8, request: Request) -> Outcome<ModbusPdu> {
        let store = self.store.as_ref();
        let pdu = match request {
            Request::ReadBits {
                table,
                start,
                quantity,
            } => {
                let bits = match table {
                    Table::DiscreteInputs => store.read_discrete_inputs(start, quantity),
                    _ => store.read_coils(start, quantity),
                }
                .map_err(store_exception)
                .and_then(|bits| expect_len(fc, bits, quantity))?;
                PduBuilder::build_read_bits_response(fc, &bits)
            }
            Request::ReadRegisters {
                table,
                start,
                quantity,
            } => {
                let values = match table {
                    Table::InputRegisters => store.read_input_registers(start, quantity),
                    _ => store.read_holding_registers(start, quantity),
                }
                .map_err(store_exception)
                .and_then(|values| expect_len(fc, values, quantity))?;
                PduBuilder::build_read_registers_response(fc, &values)
            }
            Request::WriteSingleCoil { address, raw } => {
                store
                    .write_single_coil(address, raw == COIL_ON)
                    .map_err(store_exception)?;
                PduBuilder::build_write_response(fc, address, raw)
            }
            Request::WriteSingleRegister { address, value } => {
                store
                    .write_single_register(address, value)
                    .map_err(store_exception)?;
                PduBuilder::build_write_response(fc, address, value)
            }
            Request::WriteMultipleCoils { start, values } => {
                store
                    .write_multiple_coils(start, &values)
                    .map_err(store_exception)?;
                PduBuilder::build_write_response(fc, start, values.len() as u16)
            }
            Request::WriteMultipleRegisters { start, values } => {
                store
                    .write_multiple_registers(start, &values)
                    .map_err(store_exception)?;
                PduBuilder::build_write_response(fc, start, values.len() as u16)
            }
            Request::ReadWriteMultipleRegisters {
                read_start,
                read_quantity,
                write_start,
                values,
            } => {
                // The write is applied before the read
                store
                    .write_multiple_registers(write_start, &values)
                    .map_err(store_exception)?;
                let read = store
                    .read_holding_registers(read_start, read_quantity)
                    .map_err(store_exception)
                    .and_then(|values| expect_len(fc, values, read_quantity))?;
                PduBuilder::build_read_registers_response(fc, &read)
            }
        };

        pdu.map_err(|e| {
            warn!("Failed to build response PDU for FC={:02X}: {}", fc, e);
            ModbusException::SlaveDeviceFailure
        })
    }
}

fn check_quantity(quantity: usize, max: usize) -> Outcome<()> {
    if quantity == 0 || quantity > max {
        return Err(ModbusException::IllegalDataValue);
    }
    Ok(())
}

fn store_exception(err: StoreError) -> ModbusException {
    match err {
        StoreError::AddressOutOfRange { .. } => {
            debug!("Store rejected address range: {}", err);
            ModbusException::IllegalDataAddress
        }
        StoreError::DeviceFailure(ref reason) => {
            warn!("Data store failure: {}", reason);
            ModbusException::SlaveDeviceFailure
        }
    }
}

/// A store that returns the wrong number of values has failed
fn expect_len<T>(fc: u8, values: Vec<T>, quantity: u16) -> Outcome<Vec<T>> {
    if values.len() != quantity as usize {
        warn!(
            "Data store returned {} values for FC={:02X} quantity {}",
            values.len(),
            fc,
            quantity
        );
        return Err(ModbusException::SlaveDeviceFailure);
    }
    Ok(values)
}

fn take_u16(buf: &mut &[u8]) -> Outcome<u16> {
    if buf.remaining() < 2 {
        return Err(ModbusException::IllegalDataValue);
    }
    Ok(buf.get_u16())
}

/// Take the byte count and exactly that many data bytes
fn take_counted<'a>(buf: &mut &'a [u8], expected: usize) -> Outcome<&'a [u8]> {
    if buf.remaining() < 1 {
        return Err(ModbusException::IllegalDataValue);
    }
    let byte_count = buf.get_u8() as usize;
    if byte_count != expected || buf.remaining() < byte_count {
        return Err(ModbusException::IllegalDataValue);
    }
    let slice: &'a [u8] = *buf;
    let (data, rest) = slice.split_at(byte_count);
    *buf = rest;
    Ok(data)
}

fn parse_words(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2)
        .map(|w| u16::from_be_bytes([w[0], w[1]]))
        .collect()
}

fn parse_request(fc: u8, payload: &[u8]) -> Outcome<Request> {
    if !Dispatcher::supports(fc) {
        return Err(ModbusException::IllegalFunction);
    }

    let mut buf = payload;
    let request = match fc {
        FC_READ_COILS | FC_READ_DISCRETE_INPUTS => Request::ReadBits {
            table: if fc == FC_READ_COILS {
                Table::Coils
            } else {
                Table::DiscreteInputs
            },
            start: take_u16(&mut buf)?,
            quantity: take_u16(&mut buf)?,
        },
        FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => Request::ReadRegisters {
            table: if fc == FC_READ_HOLDING_REGISTERS {
                Table::HoldingRegisters
            } else {
                Table::InputRegisters
            },
            start: take_u16(&mut buf)?,
            quantity: take_u16(&mut buf)?,
        },
        FC_WRITE_SINGLE_COIL => {
            let address = take_u16(&mut buf)?;
            let raw = take_u16(&mut buf)?;
            if raw != COIL_ON && raw != COIL_OFF {
                return Err(ModbusException::IllegalDataValue);
            }
            Request::WriteSingleCoil { address, raw }
        }
        FC_WRITE_SINGLE_REGISTER => Request::WriteSingleRegister {
            address: take_u16(&mut buf)?,
            value: take_u16(&mut buf)?,
        },
        FC_WRITE_MULTIPLE_COILS => {
            let start = take_u16(&mut buf)?;
            let quantity = take_u16(&mut buf)? as usize;
            let data = take_counted(&mut buf, quantity.div_ceil(8))?;
            Request::WriteMultipleCoils {
                start,
                values: unpack_bits(data, quantity),
            }
        }
        FC_WRITE_MULTIPLE_REGISTERS => {
            let start = take_u16(&mut buf)?;
            let quantity = take_u16(&mut buf)? as usize;
            let data = take_counted(&mut buf, quantity * 2)?;
            Request::WriteMultipleRegisters {
                start,
                values: parse_words(data),
            }
        }
        FC_READ_WRITE_MULTIPLE_REGISTERS => {
            let read_start = take_u16(&mut buf)?;
            let read_quantity = take_u16(&mut buf)?;
            let write_start = take_u16(&mut buf)?;
            let write_quantity = take_u16(&mut buf)? as usize;
            let data = take_counted(&mut buf, write_quantity * 2)?;
            Request::ReadWriteMultipleRegisters {
                read_start,
                read_quantity,
                write_start,
                values: parse_words(data),
            }
        }
        _ => return Err(ModbusException::IllegalFunction),
    };

    Ok(request)
}
