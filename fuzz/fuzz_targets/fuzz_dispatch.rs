#![no_main]

use std::sync::Arc;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use voltage_modbus_slave::{Dispatcher, RegisterBank, MAX_PDU_SIZE};

#[derive(Debug, Arbitrary)]
struct Input {
    function_code: u8,
    unit_id: u8,
    filter_unit: Option<u8>,
    payload: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let filter = input.filter_unit.filter(|unit| *unit != 0 && *unit != 0xFF);
    let dispatcher = Dispatcher::new(Arc::new(RegisterBank::with_capacity(512))).with_unit_id(filter);

    let pdu = dispatcher.dispatch(input.function_code, &input.payload, input.unit_id);
    assert!(!pdu.is_empty());
    assert!(pdu.len() <= MAX_PDU_SIZE);

    if pdu.is_exception() {
        assert_eq!(pdu.as_slice()[0], input.function_code | 0x80);
        assert_eq!(pdu.len(), 2);
    } else {
        assert_eq!(pdu.as_slice()[0], input.function_code);
    }
});
