#![no_main]

use libfuzzer_sys::fuzz_target;
use voltage_modbus_slave::{Frame, MbapHeader, MAX_PDU_SIZE};

fuzz_target!(|data: &[u8]| {
    let Some(header) = data.get(..7) else {
        return;
    };
    let header: [u8; 7] = match header.try_into() {
        Ok(header) => header,
        Err(_) => return,
    };

    let Ok(header) = MbapHeader::decode(&header) else {
        return;
    };
    assert_eq!(header.protocol_id, 0);
    assert!(header.pdu_len() >= 1 && header.pdu_len() <= MAX_PDU_SIZE);

    let Some(body) = data[7..].get(..header.pdu_len()) else {
        return;
    };
    let frame = Frame::decode_body(header, body).expect("length already matches header");
    assert_eq!(frame.wire_len(), 7 + header.pdu_len());
    assert_eq!(&frame.encode()[..], &data[..frame.wire_len()]);
});
