//! Register codec: pure conversions between raw PLC bytes and typed values.
//!
//! The PLC delivers REAL values in a word-swapped big-endian layout: the two
//! 16-bit words of the float arrive in reverse order. [`decode_float`] undoes
//! the swap before the IEEE-754 conversion and [`encode_float`] applies it.
//!
//! Single-bit writes are read-modify-write on a whole byte; [`encode_bit_write`]
//! computes the new byte so that the other 7 bits are preserved.
//!
//! # Example
//!
//! ```
//! use plcwatch::codec::{decode_bits, decode_float, encode_bit_write, encode_float};
//!
//! let bits = decode_bits(0b0000_0101);
//! assert!(bits[0]);
//! assert!(!bits[1]);
//! assert!(bits[2]);
//!
//! let raw = encode_float(12.5);
//! assert_eq!(decode_float(raw), 12.5);
//!
//! assert_eq!(encode_bit_write(0b0000_0001, 7, true), 0b1000_0001);
//! ```

use crate::error::{PlcError, Result};

/// Number of bytes occupied by a REAL value.
pub const FLOAT_WIDTH: usize = 4;

/// Returns whether bit `bit` (0 = LSB) of `value` is set.
///
/// # Example
///
/// ```
/// use plcwatch::codec::get_bit;
///
/// assert!(get_bit(0b0000_0100, 2));
/// assert!(!get_bit(0b0000_0100, 1));
/// ```
#[inline]
pub fn get_bit(value: u8, bit: u8) -> bool {
    (value >> bit) & 1 == 1
}

/// Decodes a byte into 8 booleans; index `i` holds bit `i`.
pub fn decode_bits(value: u8) -> [bool; 8] {
    let mut bits = [false; 8];
    for (i, slot) in bits.iter_mut().enumerate() {
        *slot = get_bit(value, i as u8);
    }
    bits
}

/// Encodes 8 booleans back into a byte; index `i` becomes bit `i`.
///
/// # Example
///
/// ```
/// use plcwatch::codec::{bits_to_byte, decode_bits};
///
/// assert_eq!(bits_to_byte(&decode_bits(0xA5)), 0xA5);
/// ```
pub fn bits_to_byte(bits: &[bool; 8]) -> u8 {
    bits.iter()
        .enumerate()
        .fold(0u8, |acc, (i, &bit)| if bit { acc | (1 << i) } else { acc })
}

/// Decodes a raw byte value. Identity, kept for symmetry with the other decoders.
#[inline]
pub fn decode_byte(value: u8) -> u8 {
    value
}

/// Decodes 4 raw bytes in word-swapped layout into an `f32`.
///
/// Input `[b0, b1, b2, b3]` is reinterpreted as `[b2, b3, b0, b1]` and then
/// decoded as big-endian IEEE-754.
///
/// # Example
///
/// ```
/// use plcwatch::codec::decode_float;
///
/// // 1.0f32 is 0x3F800000 big-endian; words swapped on the wire
/// assert_eq!(decode_float([0x00, 0x00, 0x3F, 0x80]), 1.0);
/// ```
#[inline]
pub fn decode_float(raw: [u8; 4]) -> f32 {
    f32::from_be_bytes([raw[2], raw[3], raw[0], raw[1]])
}

/// Encodes an `f32` into the word-swapped layout understood by [`decode_float`].
#[inline]
pub fn encode_float(value: f32) -> [u8; 4] {
    let bytes = value.to_be_bytes();
    [bytes[2], bytes[3], bytes[0], bytes[1]]
}

/// Decodes a float from a slice, checking its length.
///
/// # Errors
///
/// Returns [`PlcError::Decode`] if `raw` is not exactly 4 bytes long.
pub fn decode_float_slice(offset: u32, raw: &[u8]) -> Result<f32> {
    let bytes: [u8; 4] = raw
        .try_into()
        .map_err(|_| PlcError::decode(offset, FLOAT_WIDTH, raw.len()))?;
    Ok(decode_float(bytes))
}

/// Sets or clears exactly one bit of `current`, leaving the other 7 unchanged.
///
/// Callers validate `bit` (0-7) beforehand; higher indices are masked to 0-7.
///
/// # Example
///
/// ```
/// use plcwatch::codec::encode_bit_write;
///
/// let byte = 0b1010_1010;
/// assert_eq!(encode_bit_write(byte, 0, true), 0b1010_1011);
/// assert_eq!(encode_bit_write(byte, 7, false), 0b0010_1010);
/// ```
#[inline]
pub fn encode_bit_write(current: u8, bit: u8, value: bool) -> u8 {
    let mask = 1u8 << (bit & 0x07);
    if value {
        current | mask
    } else {
        current & !mask
    }
}

/// Formats a byte as an 8-digit binary string, MSB first.
///
/// # Example
///
/// ```
/// use plcwatch::codec::format_binary;
///
/// assert_eq!(format_binary(0x81), "10000001");
/// ```
pub fn format_binary(value: u8) -> String {
    format!("{:08b}", value)
}

/// Formats a byte as ON/OFF labels, MSB first, separated by spaces.
///
/// # Example
///
/// ```
/// use plcwatch::codec::format_bit_states;
///
/// assert_eq!(format_bit_states(0x01), "OFF OFF OFF OFF OFF OFF OFF ON");
/// ```
pub fn format_bit_states(value: u8) -> String {
    (0..8u8)
        .rev()
        .map(|i| if get_bit(value, i) { "ON" } else { "OFF" })
        .collect::<Vec<_>>()
        .join(" ")
}
