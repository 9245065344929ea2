//! Fragmentation and packing subheaders
//!
//! Short forms carry a 3-bit FSN, the extended (ARQ) forms an 11-bit BSN.

use serde::{Deserialize, Serialize};

use crate::constants::FSN_MODULUS;
use crate::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FragmentControl {
    Unfragmented = 0x00,
    Last = 0x40,
    First = 0x80,
    Middle = 0xC0,
}

impl FragmentControl {
    pub fn from_bits(b: u8) -> Self {
        match b & 0xC0 {
            0x00 => Self::Unfragmented,
            0x40 => Self::Last,
            0x80 => Self::First,
            _ => Self::Middle,
        }
    }

    pub fn starts_sdu(self) -> bool {
        matches!(self, Self::Unfragmented | Self::First)
    }

    pub fn ends_sdu(self) -> bool {
        matches!(self, Self::Unfragmented | Self::Last)
    }

    /// FC for a run of fragments given whether it opens and closes the SDU.
    pub fn for_span(starts: bool, ends: bool) -> Self {
        match (starts, ends) {
            (true, true) => Self::Unfragmented,
            (true, false) => Self::First,
            (false, true) => Self::Last,
            (false, false) => Self::Middle,
        }
    }
}

fn put_11bit(b1: &mut u8, b2: &mut u8, v: u16) {
    *b1 &= 0xC0;
    *b1 |= (((v >> 8) & 0x07) as u8) << 3;
    *b1 |= ((v & 0xFF) as u8) >> 5;
    *b2 &= 0x07;
    *b2 |= ((v & 0x1F) as u8) << 3;
}

fn get_11bit(b1: u8, b2: u8) -> u16 {
    let hi = ((b1 & 0x38) >> 3) as u16;
    let lo = ((b1 & 0x07) << 5) | (b2 >> 3);
    hi * 256 + lo as u16
}

fn need(buf: &[u8], n: usize) -> Result<(), CodecError> {
    if buf.len() < n {
        return Err(CodecError::Truncated { needed: n, available: buf.len() });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragSubheader {
    pub fc: FragmentControl,
    /// FSN (short form) or BSN (extended form)
    pub sequence: u16,
}

impl FragSubheader {
    pub const SHORT_SIZE: usize = 1;
    pub const EXTENDED_SIZE: usize = 2;

    pub fn new(fc: FragmentControl, sequence: u16) -> Self {
        Self { fc, sequence }
    }

    pub fn encode_short(&self) -> u8 {
        self.fc as u8 | (((self.sequence % FSN_MODULUS as u16) as u8) << 3)
    }

    pub fn decode_short(b: u8) -> Self {
        Self { fc: FragmentControl::from_bits(b), sequence: ((b >> 3) & 0x07) as u16 }
    }

    pub fn encode_extended(&self) -> [u8; 2] {
        let mut b = [self.fc as u8, 0];
        let (b1, b2) = b.split_at_mut(1);
        put_11bit(&mut b1[0], &mut b2[0], self.sequence);
        b
    }

    pub fn decode_extended(buf: &[u8]) -> Result<Self, CodecError> {
        need(buf, Self::EXTENDED_SIZE)?;
        Ok(Self { fc: FragmentControl::from_bits(buf[0]), sequence: get_11bit(buf[0], buf[1]) })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackSubheader {
    pub fc: FragmentControl,
    pub sequence: u16,
    /// 11 bits, includes the subheader itself
    pub length: u16,
}

impl PackSubheader {
    pub const SHORT_SIZE: usize = 2;
    pub const EXTENDED_SIZE: usize = 3;

    pub fn encode_short(&self) -> [u8; 2] {
        [
            self.fc as u8 | (((self.sequence % FSN_MODULUS as u16) as u8) << 3) | ((self.length >> 8) as u8 & 0x07),
            (self.length & 0xFF) as u8,
        ]
    }

    pub fn decode_short(buf: &[u8]) -> Result<Self, CodecError> {
        need(buf, Self::SHORT_SIZE)?;
        Ok(Self {
            fc: FragmentControl::from_bits(buf[0]),
            sequence: ((buf[0] >> 3) & 0x07) as u16,
            length: (((buf[0] & 0x07) as u16) << 8) | buf[1] as u16,
        })
    }

    pub fn encode_extended(&self) -> [u8; 3] {
        let mut b = [self.fc as u8, 0, 0];
        let (b1, rest) = b.split_at_mut(1);
        put_11bit(&mut b1[0], &mut rest[0], self.sequence);
        rest[0] |= (self.length >> 8) as u8 & 0x07;
        rest[1] = (self.length & 0xFF) as u8;
        b
    }

    pub fn decode_extended(buf: &[u8]) -> Result<Self, CodecError> {
        need(buf, Self::EXTENDED_SIZE)?;
        Ok(Self {
            fc: FragmentControl::from_bits(buf[0]),
            sequence: get_11bit(buf[0], buf[1]),
            length: (((buf[1] & 0x07) as u16) << 8) | buf[2] as u16,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_bsn_bits() {
        let sh = FragSubheader::new(FragmentControl::First, 0x5A3);
        let b = sh.encode_extended();
        // FC in the top two bits, BSN[10:8] in bits 5..3, BSN[7:5] in bits 2..0
        assert_eq!(b[0], 0x80 | (0x5 << 3) | (0xA3 >> 5));
        assert_eq!(b[1], (0xA3 & 0x1F) << 3);
        assert_eq!(FragSubheader::decode_extended(&b).unwrap(), sh);
    }

    #[test]
    fn test_short_fsn_wraps() {
        let sh = FragSubheader::new(FragmentControl::Middle, 9);
        let decoded = FragSubheader::decode_short(sh.encode_short());
        assert_eq!(decoded.fc, FragmentControl::Middle);
        assert_eq!(decoded.sequence, 1);
    }

    #[test]
    fn test_pack_subheader_length_shares_bsn_byte() {
        let sh = PackSubheader { fc: FragmentControl::Last, sequence: 2047, length: 0x7FF };
        let b = sh.encode_extended();
        assert_eq!(b, [0x40 | 0x3F, 0xFF, 0xFF]);
        assert_eq!(PackSubheader::decode_extended(&b).unwrap(), sh);

        let short = PackSubheader { fc: FragmentControl::First, sequence: 3, length: 300 };
        assert_eq!(PackSubheader::decode_short(&short.encode_short()).unwrap(), short);
    }
}
