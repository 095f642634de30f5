//! Advertisement Field Decoder
//!
//! Pure functions that pull typed values out of arbitrary bit ranges of a
//! broadcast payload. No state, no I/O.
//!
//! Extraction follows a fixed recipe: take the covering byte window, shift
//! out the trailing bits past `end_bit`, keep the `ceil(width / 8)` low bytes,
//! clear the leading bits before `start_bit`, then optionally reverse the
//! byte order before interpretation.

mod field;

pub use field::{FieldKind, FieldSpec, FieldUnit};

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised while building specs or decoding fields
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid field range [{start}, {end})")]
    InvalidRange { start: u32, end: u32 },

    #[error("Field needs {needed} bytes but the buffer holds {len}")]
    OutOfBounds { needed: usize, len: usize },

    #[error("Integer field is {width} bits wide (max 64)")]
    TooWide { width: u32 },
}

// ─────────────────────────────────────────────────────────────────────────────
// Values
// ─────────────────────────────────────────────────────────────────────────────

/// A decoded field value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Unsigned(u64),
    Signed(i64),
    Bool(bool),
    Text(String),
    Raw(Vec<u8>),
}

impl FieldValue {
    /// Integer view of the value, if it is one
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Signed(v) => Some(*v),
            FieldValue::Unsigned(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::Unsigned(v) => Some(*v),
            FieldValue::Signed(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────────────────────────

/// Extract the raw bytes of a field, after masking and optional flip
pub fn extract(buffer: &[u8], spec: &FieldSpec) -> Result<Vec<u8>, DecodeError> {
    let window = spec.byte_window();
    if window.end > buffer.len() {
        return Err(DecodeError::OutOfBounds {
            needed: window.end,
            len: buffer.len(),
        });
    }

    let shifted = shift_right(&buffer[window], spec.shift());
    let len = spec.value_len();
    let mut data = shifted[shifted.len() - len..].to_vec();

    let clip = spec.clip();
    if clip > 0 {
        data[0] &= 0xFF >> clip;
    }

    if spec.is_flipped() {
        data.reverse();
    }

    Ok(data)
}

/// Decode one field into a value of the requested kind
pub fn decode(buffer: &[u8], spec: &FieldSpec, kind: FieldKind) -> Result<FieldValue, DecodeError> {
    if kind == FieldKind::Integer && spec.width() > 64 {
        return Err(DecodeError::TooWide { width: spec.width() });
    }

    let data = extract(buffer, spec)?;

    let value = match kind {
        FieldKind::Integer => {
            let raw = data.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
            if spec.is_signed() {
                // A flipped value's top bit sits at the top of its last byte.
                let bits = if spec.is_flipped() {
                    (data.len() * 8) as u32
                } else {
                    spec.width()
                };
                FieldValue::Signed(sign_extend(raw, bits))
            } else {
                FieldValue::Unsigned(raw)
            }
        }
        FieldKind::Boolean => FieldValue::Bool(data.iter().any(|b| *b != 0)),
        FieldKind::Text => FieldValue::Text(String::from_utf8_lossy(&data).into_owned()),
        FieldKind::Raw => FieldValue::Raw(data),
    };

    Ok(value)
}

/// Write an integer into a field's bit range, the inverse of [`decode`]
///
/// Bits of `buffer` outside the field are left untouched.
pub fn encode(buffer: &mut [u8], spec: &FieldSpec, value: u64) -> Result<(), DecodeError> {
    let width = spec.width();
    if width > 64 {
        return Err(DecodeError::TooWide { width });
    }
    let window = spec.byte_window();
    if window.end > buffer.len() {
        return Err(DecodeError::OutOfBounds {
            needed: window.end,
            len: buffer.len(),
        });
    }

    let value = if spec.is_flipped() {
        let len = spec.value_len();
        let be = value.to_be_bytes();
        let mut data = be[8 - len..].to_vec();
        data.reverse();
        data.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    } else {
        value
    };

    for i in 0..width {
        let bit = (value >> (width - 1 - i)) & 1;
        let pos = (spec.start_bit() + i) as usize;
        let mask = 0x80u8 >> (pos % 8);
        if bit == 1 {
            buffer[pos / 8] |= mask;
        } else {
            buffer[pos / 8] &= !mask;
        }
    }

    Ok(())
}

fn shift_right(bytes: &[u8], shift: u32) -> Vec<u8> {
    if shift == 0 {
        return bytes.to_vec();
    }
    let mut out = vec![0u8; bytes.len()];
    for i in (0..bytes.len()).rev() {
        let carry = if i > 0 { bytes[i - 1] << (8 - shift) } else { 0 };
        out[i] = (bytes[i] >> shift) | carry;
    }
    out
}

fn sign_extend(raw: u64, bits: u32) -> i64 {
    if bits == 0 || bits >= 64 {
        return raw as i64;
    }
    let unused = 64 - bits;
    ((raw << unused) as i64) >> unused
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoded Field
// ─────────────────────────────────────────────────────────────────────────────

/// One field spec bound to a named destination slot on a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedField {
    pub slot: String,
    pub spec: FieldSpec,
    pub kind: FieldKind,
}

impl DecodedField {
    pub fn new(slot: impl Into<String>, spec: FieldSpec, kind: FieldKind) -> Self {
        Self {
            slot: slot.into(),
            spec,
            kind,
        }
    }

    /// Decode this field from an advertisement
    pub fn decode(&self, buffer: &[u8]) -> Result<FieldValue, DecodeError> {
        decode(buffer, &self.spec, self.kind)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
