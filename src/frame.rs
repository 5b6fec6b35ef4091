//! MBAP frame codec
//!
//! Every Modbus TCP message is a 7 byte MBAP header followed by the PDU:
//!
//! ```text
//! byte 0-1: transaction id (big-endian)
//! byte 2-3: protocol id    (always 0)
//! byte 4-5: length         (unit id + PDU byte count)
//! byte 6  : unit id
//! byte 7..: function code + payload
//! ```
//!
//! Reading is split into a header read and a body read so the connection
//! handler can track which state it is in. Both reads report through the same
//! [`ReadOutcome`] so that disconnects are handled identically wherever they
//! are observed.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::constants::{MAX_PDU_SIZE, MBAP_HEADER_LEN, MODBUS_PROTOCOL_ID};
use crate::error::FrameError;

/// MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    /// Decode and validate a header
    pub fn decode(bytes: &[u8; MBAP_HEADER_LEN]) -> Result<Self, FrameError> {
        let mut buf = &bytes[..];
        let header = Self {
            transaction_id: buf.get_u16(),
            protocol_id: buf.get_u16(),
            length: buf.get_u16(),
            unit_id: buf.get_u8(),
        };

        if header.protocol_id != MODBUS_PROTOCOL_ID {
            return Err(FrameError::InvalidProtocolId(header.protocol_id));
        }
        if header.length == 0 {
            return Err(FrameError::ZeroLength);
        }
        if header.length == 1 {
            return Err(FrameError::EmptyPdu);
        }
        if header.pdu_len() > MAX_PDU_SIZE {
            return Err(FrameError::PduTooLarge {
                declared: header.pdu_len(),
                max: MAX_PDU_SIZE,
            });
        }

        Ok(header)
    }

    /// Number of PDU bytes that follow the header
    #[inline]
    pub fn pdu_len(&self) -> usize {
        (self.length as usize).saturating_sub(1)
    }

    fn encode_into(&self, dst: &mut BytesMut) {
        dst.put_u16(self.transaction_id);
        dst.put_u16(self.protocol_id);
        dst.put_u16(self.length);
        dst.put_u8(self.unit_id);
    }
}

/// A complete Modbus TCP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: MbapHeader,
    pub function_code: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame, computing the length field from the PDU
    pub fn new(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Result<Self, FrameError> {
        let Some((&function_code, payload)) = pdu.split_first() else {
            return Err(FrameError::EmptyPdu);
        };
        if pdu.len() > MAX_PDU_SIZE {
            return Err(FrameError::PduTooLarge {
                declared: pdu.len(),
                max: MAX_PDU_SIZE,
            });
        }

        Ok(Self {
            header: MbapHeader {
                transaction_id,
                protocol_id: MODBUS_PROTOCOL_ID,
                length: (pdu.len() + 1) as u16,
                unit_id,
            },
            function_code,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Response to `request`, echoing its transaction id and unit id
    pub fn response_to(request: &MbapHeader, pdu: &[u8]) -> Result<Self, FrameError> {
        Self::new(request.transaction_id, request.unit_id, pdu)
    }

    /// Decode the body that follows `header`
    pub fn decode_body(header: MbapHeader, body: &[u8]) -> Result<Self, FrameError> {
        if body.len() != header.pdu_len() {
            return Err(FrameError::LengthMismatch {
                expected: header.pdu_len(),
                actual: body.len(),
            });
        }
        let Some((&function_code, payload)) = body.split_first() else {
            return Err(FrameError::EmptyPdu);
        };

        Ok(Self {
            header,
            function_code,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Total frame size on the wire
    #[inline]
    pub fn wire_len(&self) -> usize {
        MBAP_HEADER_LEN + 1 + self.payload.len()
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.wire_len());
        self.header.encode_into(&mut dst);
        dst.put_u8(self.function_code);
        dst.put_slice(&self.payload);
        dst.freeze()
    }
}

/// Result of a single framed read
///
/// `EndOfStream` means the peer closed cleanly before sending any byte of the
/// next frame. `Truncated` means it closed after at least one byte; this is
/// treated the same as a reset.
#[derive(Debug)]
pub enum ReadOutcome<T> {
    Ok(T),
    EndOfStream,
    Truncated { consumed: usize },
    Malformed(FrameError),
    Error(io::Error),
}

enum Fill {
    Complete,
    Eof { read: usize },
    Error(io::Error),
}

async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> Fill
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => return Fill::Eof { read: filled },
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Fill::Error(e),
        }
    }
    Fill::Complete
}

/// Read and validate the next MBAP header
pub async fn read_header<R>(reader: &mut R) -> ReadOutcome<MbapHeader>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; MBAP_HEADER_LEN];
    match fill(reader, &mut buf).await {
        Fill::Complete => {}
        Fill::Eof { read: 0 } => return ReadOutcome::EndOfStream,
        Fill::Eof { read } => return ReadOutcome::Truncated { consumed: read },
        Fill::Error(e) => return ReadOutcome::Error(e),
    }

    match MbapHeader::decode(&buf) {
        Ok(header) => ReadOutcome::Ok(header),
        Err(e) => ReadOutcome::Malformed(e),
    }
}

/// Read exactly the body declared by `header`
pub async fn read_body<R>(reader: &mut R, header: MbapHeader) -> ReadOutcome<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut body = vec![0u8; header.pdu_len()];
    match fill(reader, &mut body).await {
        Fill::Complete => {}
        Fill::Eof { read } => {
            return ReadOutcome::Truncated {
                consumed: MBAP_HEADER_LEN + read,
            }
        }
        Fill::Error(e) => return ReadOutcome::Error(e),
    }

    match Frame::decode_body(header, &body) {
        Ok(frame) => ReadOutcome::Ok(frame),
        Err(e) => ReadOutcome::Malformed(e),
    }
}

/// Read a complete frame (header then body)
pub async fn read_frame<R>(reader: &mut R) -> ReadOutcome<Frame>
where
    R: AsyncRead + Unpin,
{
    match read_header(reader).await {
        ReadOutcome::Ok(header) => read_body(reader, header).await,
        ReadOutcome::EndOfStream => ReadOutcome::EndOfStream,
        ReadOutcome::Truncated { consumed } => ReadOutcome::Truncated { consumed },
        ReadOutcome::Malformed(e) => ReadOutcome::Malformed(e),
        ReadOutcome::Error(e) => ReadOutcome::Error(e),
    }
}

/// Format raw bytes as hex string for packet logging
pub fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
