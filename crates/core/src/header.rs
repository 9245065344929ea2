//! Generic MAC header (6 bytes)

use crate::constants::{MAC_HEADER_SIZE, MAX_PDU_SIZE};
use crate::types::Cid;
use crate::CodecError;

// bits of the 6-bit type field
pub const TYPE_MESH_SUBHEADER: u8 = 0x20;
pub const TYPE_ARQ_FEEDBACK_PAYLOAD: u8 = 0x10;
pub const TYPE_EXTENDED: u8 = 0x08;
pub const TYPE_FRAGMENTATION_SUBHEADER: u8 = 0x04;
pub const TYPE_PACKING_SUBHEADER: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MacHeader {
    pub header_type: u8,
    pub encrypted: bool,
    pub crc_indicator: bool,
    pub eks: u8,
    pub len: u16,
    pub cid: Cid,
}

impl MacHeader {
    pub const SIZE: usize = MAC_HEADER_SIZE;

    pub fn new(cid: Cid) -> Self {
        Self { cid, ..Default::default() }
    }

    pub fn with_type(mut self, bits: u8) -> Self {
        self.header_type |= bits & 0x3F;
        self
    }

    pub fn has(&self, bits: u8) -> bool {
        self.header_type & bits == bits
    }

    /// HCS is left zero.
    pub fn encode(&self) -> [u8; MAC_HEADER_SIZE] {
        let mut b = [0u8; MAC_HEADER_SIZE];
        b[0] = ((self.encrypted as u8) << 6) | (self.header_type & 0x3F);
        b[1] = ((self.crc_indicator as u8) << 6) | ((self.eks & 0x03) << 4) | ((self.len >> 8) as u8 & 0x07);
        b[2] = (self.len & 0xFF) as u8;
        b[3..5].copy_from_slice(&self.cid.to_be_bytes());
        b
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < MAC_HEADER_SIZE {
            return Err(CodecError::Truncated { needed: MAC_HEADER_SIZE, available: buf.len() });
        }
        if buf[0] & 0x80 != 0 {
            return Err(CodecError::NotGenericHeader);
        }
        Ok(Self {
            header_type: buf[0] & 0x3F,
            encrypted: buf[0] & 0x40 != 0,
            crc_indicator: buf[1] & 0x40 != 0,
            eks: (buf[1] >> 4) & 0x03,
            len: (((buf[1] & 0x07) as u16) << 8) | buf[2] as u16,
            cid: u16::from_be_bytes([buf[3], buf[4]]),
        })
    }
}

/// Rewrites the LEN field of an already encoded header in place.
pub fn patch_len(buf: &mut [u8], len: usize) -> Result<(), CodecError> {
    if len > MAX_PDU_SIZE {
        return Err(CodecError::LengthOverflow(len));
    }
    if buf.len() < MAC_HEADER_SIZE {
        return Err(CodecError::Truncated { needed: MAC_HEADER_SIZE, available: buf.len() });
    }
    buf[1] = (buf[1] & 0xF8) | ((len >> 8) as u8 & 0x07);
    buf[2] = (len & 0xFF) as u8;
    Ok(())
}
