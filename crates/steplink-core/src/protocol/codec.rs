//! Frame encoding/decoding
//!
//! Implements the checksum-protected frame format used on the firmware link.
//!
//! Frame format:
//! - 1 byte: length (opcode byte + payload, i.e. `payload.len() + 1`)
//! - 1 byte: opcode, high bit carries the sequence flag
//! - N bytes: payload
//! - `ceil(length / 3)` bytes: one checksum byte per 3-byte block of opcode + payload
//!
//! Each checksum byte holds the block index (mod 8) in its low 3 bits and five
//! parity bits in its high bits. Blocks are zero padded for the computation
//! only; padding is never transmitted.

use super::TransportError;

/// Largest payload the codec can represent (the length byte is a `u8`).
pub const MAX_ENCODED_PAYLOAD: usize = 254;

/// Parity masks, one row per checksum bit. Columns 0-2 cover the block's data
/// bytes, column 3 covers the checksum byte itself.
const MASK: [[u8; 4]; 5] = [
    [0xc0, 0xc3, 0xff, 0x09],
    [0x38, 0x3a, 0x7e, 0x13],
    [0x26, 0xb5, 0xb9, 0x23],
    [0x95, 0x6c, 0xd5, 0x43],
    [0x4b, 0xdc, 0xe2, 0x83],
];

const FLAG_BIT: u8 = 0x80;

/// A logical protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Alternating sequence flag
    pub flag: bool,
    /// Opcode (7 bits)
    pub opcode: u8,
    /// Opcode-specific payload
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame
    pub fn new(flag: bool, opcode: u8, payload: Vec<u8>) -> Self {
        Self {
            flag,
            opcode,
            payload,
        }
    }

    /// Encode the frame to wire bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        encode(self.flag, self.opcode, &self.payload)
    }

    /// Decode a frame from a complete wire buffer
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        decode(buf)
    }
}

/// Total number of wire bytes for a frame whose length byte is `length`.
pub fn encoded_len(length: u8) -> usize {
    let length = length as usize;
    1 + length + checksum_count(length)
}

fn checksum_count(length: usize) -> usize {
    (length + 2) / 3
}

/// Encode a frame into a checksum-protected buffer.
pub fn encode(flag: bool, opcode: u8, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    if opcode & FLAG_BIT != 0 {
        return Err(TransportError::InvalidOpcode(opcode));
    }
    if payload.len() > MAX_ENCODED_PAYLOAD {
        return Err(TransportError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_ENCODED_PAYLOAD,
        });
    }

    let length = payload.len() + 1;
    let mut bytes = Vec::with_capacity(1 + length + checksum_count(length));
    bytes.push(length as u8);
    bytes.push(if flag { opcode | FLAG_BIT } else { opcode });
    bytes.extend_from_slice(payload);

    let checks: Vec<u8> = bytes[1..]
        .chunks(3)
        .enumerate()
        .map(|(index, chunk)| block_checksum(&pad_block(chunk), index))
        .collect();
    bytes.extend_from_slice(&checks);

    Ok(bytes)
}

/// Decode a complete buffer. Returns `None` on any length or checksum
/// mismatch; never panics on truncated or garbage input.
pub fn decode(buf: &[u8]) -> Option<Frame> {
    let length = *buf.first()? as usize;
    if length == 0 || buf.len() != 1 + length + checksum_count(length) {
        return None;
    }

    let (data, checks) = buf[1..].split_at(length);
    for (index, (chunk, &check)) in data.chunks(3).zip(checks).enumerate() {
        if check & 0x07 != (index & 0x07) as u8 {
            return None;
        }
        let block = pad_block(chunk);
        if MASK.iter().any(|mask| row_parity(&block, check, mask) != 0) {
            return None;
        }
    }

    Some(Frame {
        flag: data[0] & FLAG_BIT != 0,
        opcode: data[0] & !FLAG_BIT,
        payload: data[1..].to_vec(),
    })
}

fn pad_block(chunk: &[u8]) -> [u8; 3] {
    let mut block = [0u8; 3];
    block[..chunk.len()].copy_from_slice(chunk);
    block
}

fn block_checksum(block: &[u8; 3], index: usize) -> u8 {
    let mut check = (index & 0x07) as u8;
    for (row, mask) in MASK.iter().enumerate() {
        if row_parity(block, check, mask) != 0 {
            check |= 1 << (row + 3);
        }
    }
    check
}

fn row_parity(block: &[u8; 3], check: u8, mask: &[u8; 4]) -> u8 {
    let mut v =
        (block[0] & mask[0]) ^ (block[1] & mask[1]) ^ (block[2] & mask[2]) ^ (check & mask[3]);
    v ^= v >> 4;
    v ^= v >> 2;
    v ^= v >> 1;
    v & 1
}
