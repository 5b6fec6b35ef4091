//! Data store collaborator
//!
//! The dispatcher talks to storage only through [`DataStore`]. A store owns
//! its own locking; calls may contend but never hold any server-side lock.
//!
//! [`RegisterBank`] is the in-memory implementation used by the binary and
//! the tests.

use parking_lot::RwLock;
use thiserror::Error;

/// The four Modbus data tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

/// Storage level failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("address range {start}..{end} outside {table:?} (size {size})")]
    AddressOutOfRange {
        table: Table,
        start: usize,
        end: usize,
        size: usize,
    },

    #[error("device failure: {0}")]
    DeviceFailure(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Register/coil storage consumed by the dispatcher.
///
/// Addresses are zero-based PDU addresses. Implementations must be safe to
/// call from many connection tasks at once.
pub trait DataStore: Send + Sync {
    /// Number of addressable entries in `table`
    fn table_size(&self, table: Table) -> usize;

    fn read_coils(&self, start: u16, count: u16) -> StoreResult<Vec<bool>>;

    fn read_discrete_inputs(&self, start: u16, count: u16) -> StoreResult<Vec<bool>>;

    fn read_holding_registers(&self, start: u16, count: u16) -> StoreResult<Vec<u16>>;

    fn read_input_registers(&self, start: u16, count: u16) -> StoreResult<Vec<u16>>;

    fn write_single_coil(&self, address: u16, value: bool) -> StoreResult<()>;

    fn write_single_register(&self, address: u16, value: u16) -> StoreResult<()>;

    fn write_multiple_coils(&self, start: u16, values: &[bool]) -> StoreResult<()>;

    fn write_multiple_registers(&self, start: u16, values: &[u16]) -> StoreResult<()>;
}

/// Table sizes for a [`RegisterBank`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BankSizes {
    pub coils: usize,
    pub discrete_inputs: usize,
    pub holding_registers: usize,
    pub input_registers: usize,
}

impl BankSizes {
    /// Same size for every table
    pub fn uniform(size: usize) -> Self {
        Self {
            coils: size,
            discrete_inputs: size,
            holding_registers: size,
            input_registers: size,
        }
    }
}

impl Default for BankSizes {
    fn default() -> Self {
        Self::uniform(u16::MAX as usize + 1)
    }
}

/// In-memory register bank
#[derive(Debug)]
pub struct RegisterBank {
    coils: RwLock<Vec<bool>>,
    discrete_inputs: RwLock<Vec<bool>>,
    holding_registers: RwLock<Vec<u16>>,
    input_registers: RwLock<Vec<u16>>,
}

impl RegisterBank {
    pub fn new(sizes: BankSizes) -> Self {
        Self {
            coils: RwLock::new(vec![false; sizes.coils]),
            discrete_inputs: RwLock::new(vec![false; sizes.discrete_inputs]),
            holding_registers: RwLock::new(vec![0; sizes.holding_registers]),
            input_registers: RwLock::new(vec![0; sizes.input_registers]),
        }
    }

    /// Bank where every table holds `size` entries
    pub fn with_capacity(size: usize) -> Self {
        Self::new(BankSizes::uniform(size))
    }

    pub fn set_coil(&self, address: u16, value: bool) -> StoreResult<()> {
        write_range(&self.coils, Table::Coils, address, &[value])
    }

    pub fn set_discrete_input(&self, address: u16, value: bool) -> StoreResult<()> {
        write_range(&self.discrete_inputs, Table::DiscreteInputs, address, &[value])
    }

    pub fn set_holding_register(&self, address: u16, value: u16) -> StoreResult<()> {
        write_range(&self.holding_registers, Table::HoldingRegisters, address, &[value])
    }

    pub fn set_input_register(&self, address: u16, value: u16) -> StoreResult<()> {
        write_range(&self.input_registers, Table::InputRegisters, address, &[value])
    }

    pub fn coil(&self, address: u16) -> Option<bool> {
        self.coils.read().get(address as usize).copied()
    }

    pub fn holding_register(&self, address: u16) -> Option<u16> {
        self.holding_registers.read().get(address as usize).copied()
    }
}

impl Default for RegisterBank {
    fn default() -> Self {
        Self::new(BankSizes::default())
    }
}

fn check_range(
    table: Table,
    start: u16,
    count: usize,
    size: usize,
) -> StoreResult<std::ops::Range<usize>> {
    let start = start as usize;
    let end = start + count;
    if end > size {
        return Err(StoreError::AddressOutOfRange {
            table,
            start,
            end,
            size,
        });
    }
    Ok(start..end)
}

fn read_range<T: Copy>(
    lock: &RwLock<Vec<T>>,
    table: Table,
    start: u16,
    count: u16,
) -> StoreResult<Vec<T>> {
    let data = lock.read();
    let range = check_range(table, start, count as usize, data.len())?;
    Ok(data[range].to_vec())
}

fn write_range<T: Copy>(
    lock: &RwLock<Vec<T>>,
    table: Table,
    start: u16,
    values: &[T],
) -> StoreResult<()> {
    let mut data = lock.write();
    let size = data.len();
    let range = check_range(table, start, values.len(), size)?;
    data[range].copy_from_slice(values);
    Ok(())
}

impl DataStore for RegisterBank {
    fn table_size(&self, table: Table) -> usize {
        match table {
            Table::Coils => self.coils.read().len(),
            Table::DiscreteInputs => self.discrete_inputs.read().len(),
            Table::HoldingRegisters => self.holding_registers.read().len(),
            Table::InputRegisters => self.input_registers.read().len(),
        }
    }

    fn read_coils(&self, start: u16, count: u16) -> StoreResult<Vec<bool>> {
        read_range(&self.coils, Table::Coils, start, count)
    }

    fn read_discrete_inputs(&self, start: u16, count: u16) -> StoreResult<Vec<bool>> {
        read_range(&self.discrete_inputs, Table::DiscreteInputs, start, count)
    }

    fn read_holding_registers(&self, start: u16, count: u16) -> StoreResult<Vec<u16>> {
        read_range(&self.holding_registers, Table::HoldingRegisters, start, count)
    }

    fn read_input_registers(&self, start: u16, count: u16) -> StoreResult<Vec<u16>> {
        read_range(&self.input_registers, Table::InputRegisters, start, count)
    }

    fn write_single_coil(&self, address: u16, value: bool) -> StoreResult<()> {
        write_range(&self.coils, Table::Coils, address, &[value])
    }

    fn write_single_register(&self, address: u16, value: u16) -> StoreResult<()> {
        write_range(&self.holding_registers, Table::HoldingRegisters, address, &[value])
    }

    fn write_multiple_coils(&self, start: u16, values: &[bool]) -> StoreResult<()> {
        write_range(&self.coils, Table::Coils, start, values)
    }

    fn write_multiple_registers(&self, start: u16, values: &[u16]) -> StoreResult<()> {
        write_range(&self.holding_registers, Table::HoldingRegisters, start, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_bank_read_write() {
        let bank = RegisterBank::with_capacity(16);
        bank.write_multiple_registers(2, &[10, 20, 30]).unwrap();
        assert_eq!(bank.read_holding_registers(1, 5).unwrap(), vec![0, 10, 20, 30, 0]);

        bank.write_single_coil(15, true).unwrap();
        assert_eq!(bank.read_coils(14, 2).unwrap(), vec![false, true]);
        assert_eq!(bank.coil(15), Some(true));
        assert_eq!(bank.coil(16), None);
    }

    #[test]
    fn test_register_bank_bounds() {
        let bank = RegisterBank::new(BankSizes {
            coils: 8,
            discrete_inputs: 4,
            holding_registers: 2,
            input_registers: 1,
        });

        assert_eq!(bank.table_size(Table::DiscreteInputs), 4);
        assert!(bank.read_coils(0, 8).is_ok());
        assert_eq!(
            bank.read_coils(4, 5),
            Err(StoreError::AddressOutOfRange {
                table: Table::Coils,
                start: 4,
                end: 9,
                size: 8
            })
        );
        assert!(bank.write_multiple_registers(1, &[1, 2]).is_err());
        // Failed writes leave the table untouched
        assert_eq!(bank.holding_register(1), Some(0));
        assert!(bank.set_input_register(1, 5).is_err());
    }

    #[test]
    fn test_default_bank_covers_full_address_space() {
        let bank = RegisterBank::default();
        assert_eq!(bank.table_size(Table::Coils), 65536);
        bank.set_holding_register(u16::MAX, 0xABCD).unwrap();
        assert_eq!(bank.read_holding_registers(u16::MAX, 1).unwrap(), vec![0xABCD]);
    }
}
