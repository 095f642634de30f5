//! Field Specifications
//!
//! A field spec names a bit range inside an advertisement payload. The payload
//! is treated as one big-endian bit string: bit 0 is the most significant bit
//! of byte 0.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use super::DecodeError;

/// Unit in which a field's start and end offsets are expressed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldUnit {
    #[default]
    Bit,
    Byte,
}

/// How the extracted bytes of a field are interpreted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// Signed or unsigned integer, per the spec's `signed` flag
    #[default]
    Integer,
    /// Nonzero means true
    Boolean,
    /// Lossy UTF-8 text
    Text,
    /// Bytes handed to the device untouched
    Raw,
}

/// Immutable description of one bit range in an advertisement
///
/// Offsets are stored normalised to bits; a byte-unit spec is the bit-unit
/// spec scaled by 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    start_bit: u32,
    end_bit: u32,
    signed: bool,
    flip: bool,
    unit: FieldUnit,
}

impl FieldSpec {
    /// Create a spec covering `[start, end)` in the given unit
    pub fn new(start: u32, end: u32, unit: FieldUnit) -> Result<Self, DecodeError> {
        let scale = match unit {
            FieldUnit::Bit => 1,
            FieldUnit::Byte => 8,
        };
        let (start_bit, end_bit) = match (start.checked_mul(scale), end.checked_mul(scale)) {
            (Some(s), Some(e)) => (s, e),
            _ => return Err(DecodeError::InvalidRange { start, end }),
        };
        if start_bit >= end_bit {
            return Err(DecodeError::InvalidRange { start, end });
        }

        Ok(Self {
            start_bit,
            end_bit,
            signed: false,
            flip: false,
            unit,
        })
    }

    /// Bit-unit spec
    pub fn bits(start: u32, end: u32) -> Result<Self, DecodeError> {
        Self::new(start, end, FieldUnit::Bit)
    }

    /// Byte-unit spec
    pub fn bytes(start: u32, end: u32) -> Result<Self, DecodeError> {
        Self::new(start, end, FieldUnit::Byte)
    }

    /// Interpret integers as two's complement
    pub fn signed(mut self, signed: bool) -> Self {
        self.signed = signed;
        self
    }

    /// Reverse the byte order of the extracted value (little-endian fields)
    pub fn flipped(mut self, flip: bool) -> Self {
        self.flip = flip;
        self
    }

    pub fn start_bit(&self) -> u32 {
        self.start_bit
    }

    pub fn end_bit(&self) -> u32 {
        self.end_bit
    }

    pub fn unit(&self) -> FieldUnit {
        self.unit
    }

    pub fn is_signed(&self) -> bool {
        self.signed
    }

    pub fn is_flipped(&self) -> bool {
        self.flip
    }

    /// Number of bits covered by the field
    pub fn width(&self) -> u32 {
        self.end_bit - self.start_bit
    }

    /// Byte range of the buffer that contains the field
    pub fn byte_window(&self) -> Range<usize> {
        let first = (self.start_bit / 8) as usize;
        let last = self.end_bit.div_ceil(8) as usize;
        first..last
    }

    /// Number of bytes the extracted value occupies
    pub fn value_len(&self) -> usize {
        self.width().div_ceil(8) as usize
    }

    /// Trailing bits dropped from the last byte of the window
    pub(crate) fn shift(&self) -> u32 {
        (8 - self.end_bit % 8) % 8
    }

    /// Leading bits cleared from the first byte of the extracted value
    pub(crate) fn clip(&self) -> u32 {
        (self.start_bit % 8 + self.shift()) % 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_unit_scales_to_bits() {
        let spec = FieldSpec::bytes(2, 4).unwrap();
        assert_eq!(spec.start_bit(), 16);
        assert_eq!(spec.end_bit(), 32);
        assert_eq!(spec.unit(), FieldUnit::Byte);
        assert_eq!(spec.byte_window(), 2..4);
        assert_eq!(spec.width(), FieldSpec::bits(16, 32).unwrap().width());
    }

    #[test]
    fn test_zero_width_rejected() {
        assert!(matches!(
            FieldSpec::bits(12, 12),
            Err(DecodeError::InvalidRange { start: 12, end: 12 })
        ));
        assert!(FieldSpec::bits(9, 3).is_err());
        assert!(FieldSpec::bytes(u32::MAX / 2, u32::MAX).is_err());
    }

    #[test]
    fn test_window_geometry() {
        let spec = FieldSpec::bits(4, 12).unwrap();
        assert_eq!(spec.byte_window(), 0..2);
        assert_eq!(spec.value_len(), 1);
        assert_eq!(spec.shift(), 4);
        assert_eq!(spec.clip(), 0);

        let spec = FieldSpec::bits(3, 7).unwrap();
        assert_eq!(spec.byte_window(), 0..1);
        assert_eq!(spec.shift(), 1);
        assert_eq!(spec.clip(), 4);
    }
}
