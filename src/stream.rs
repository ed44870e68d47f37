//! Primitive encodings used by the snapshot index.
//!
//! Sizes are stored as packed numbers: little-endian groups of 7 bits, with the
//! high bit of every byte marking a continuation. Position deltas are signed
//! and stored as packed numbers whose lowest bit is the sign and whose
//! remaining bits are the magnitude.

use std::io::{self, Read, Write};

use crate::read_const;

/// A `u64` never needs more than this many 7-bit groups.
pub const MAX_PACKED_LEN: usize = 10;

pub fn read_packed_num(mut reader: impl Read) -> io::Result<u64> {
    let mut value = 0u64;
    for i in 0..MAX_PACKED_LEN {
        let [byte] = read_const(&mut reader)?;
        value |= u64::from(byte & 0x7F) << (i * 7);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "packed number is longer than 10 bytes",
    ))
}

pub fn write_packed_num(mut writer: impl Write, mut value: u64) -> io::Result<()> {
    let mut buf = [0u8; MAX_PACKED_LEN];
    let mut len = 0;
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf[len] = byte;
            len += 1;
            break;
        }
        buf[len] = byte | 0x80;
        len += 1;
    }
    writer.write_all(&buf[..len])
}

/// Sign lives in bit 0, magnitude in the rest.
pub fn decode_delta(num: u64) -> i64 {
    let magnitude = (num >> 1) as i64;
    if num & 1 == 1 { -magnitude } else { magnitude }
}

/// Inverse of [`decode_delta`]. `i64::MIN` has no representation.
pub fn encode_delta(delta: i64) -> u64 {
    debug_assert_ne!(delta, i64::MIN);
    if delta < 0 {
        delta.unsigned_abs() << 1 | 1
    } else {
        (delta as u64) << 1
    }
}

pub fn read_delta(reader: impl Read) -> io::Result<i64> {
    read_packed_num(reader).map(decode_delta)
}

pub fn write_delta(writer: impl Write, delta: i64) -> io::Result<()> {
    write_packed_num(writer, encode_delta(delta))
}
