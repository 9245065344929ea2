//! TLV encoding for management messages
//!
//! Nested TLVs (service flow, CS specification, classifier rule) are written
//! by reserving the length byte and patching it once the children are in
//! place. Each nested TLV carries one pad byte right after its length.

use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::{tlv, HMAC_DIGEST_LEN, HMAC_TUPLE_LEN, MAC_HEADER_SIZE, MAX_MGMT_MSG_SIZE};
use crate::header::{patch_len, MacHeader};
use crate::types::Cid;
use crate::CodecError;

/// Position of a reserved length byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthSlot(usize);

pub struct TlvWriter {
    buf: BytesMut,
    framed: bool,
}

impl TlvWriter {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(128), framed: false }
    }

    /// Starts a management PDU: generic MAC header on `cid` followed by the
    /// message type byte. LEN is filled in by `finish`.
    pub fn management(cid: Cid, msg_type: u8) -> Self {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_slice(&MacHeader::new(cid).encode());
        buf.put_u8(msg_type);
        Self { buf, framed: true }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_byte(&mut self, b: u8) -> &mut Self {
        self.buf.put_u8(b);
        self
    }

    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    pub fn put_bytes(&mut self, b: &[u8]) -> &mut Self {
        self.buf.put_slice(b);
        self
    }

    pub fn put_tlv(&mut self, ty: u8, value: &[u8]) -> &mut Self {
        self.buf.put_u8(ty);
        self.buf.put_u8(value.len() as u8);
        self.buf.put_slice(value);
        self
    }

    pub fn put_tlv_u8(&mut self, ty: u8, v: u8) -> &mut Self {
        self.put_tlv(ty, &[v])
    }

    pub fn put_tlv_u16(&mut self, ty: u8, v: u16) -> &mut Self {
        self.put_tlv(ty, &v.to_be_bytes())
    }

    pub fn put_tlv_u32(&mut self, ty: u8, v: u32) -> &mut Self {
        self.put_tlv(ty, &v.to_be_bytes())
    }

    /// Writes `ty`, a placeholder length and the pad byte.
    pub fn reserve_length(&mut self, ty: u8) -> LengthSlot {
        self.buf.put_u8(ty);
        let slot = LengthSlot(self.buf.len());
        self.buf.put_u8(0);
        self.buf.put_u8(0);
        slot
    }

    /// Length counts every byte written after the length byte itself.
    pub fn patch_length(&mut self, slot: LengthSlot) -> Result<(), CodecError> {
        let len = self.buf.len() - slot.0 - 1;
        if len > u8::MAX as usize {
            return Err(CodecError::LengthOverflow(len));
        }
        self.buf[slot.0] = len as u8;
        Ok(())
    }

    /// Placeholder HMAC tuple: key sequence plus a zeroed digest.
    pub fn put_hmac_tuple(&mut self, key_seq: u8) -> &mut Self {
        self.buf.put_u8(tlv::COMMON_HMAC_TUPLE);
        self.buf.put_u8(HMAC_TUPLE_LEN);
        self.buf.put_u8(key_seq);
        self.buf.put_bytes(0, HMAC_DIGEST_LEN);
        self
    }

    pub fn finish(mut self) -> Result<Bytes, CodecError> {
        if self.buf.len() > MAX_MGMT_MSG_SIZE {
            return Err(CodecError::LengthOverflow(self.buf.len()));
        }
        if self.framed {
            let len = self.buf.len();
            patch_len(&mut self.buf[..MAC_HEADER_SIZE], len)?;
        }
        Ok(self.buf.freeze())
    }
}

impl Default for TlvWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub ty: u8,
    pub value: &'a [u8],
}

impl<'a> Tlv<'a> {
    pub fn as_u8(&self) -> Result<u8, CodecError> {
        match self.value {
            [v] => Ok(*v),
            _ => Err(CodecError::TlvLength { ty: self.ty, len: self.value.len() }),
        }
    }

    pub fn as_u16(&self) -> Result<u16, CodecError> {
        let arr: [u8; 2] = self
            .value
            .try_into()
            .map_err(|_| CodecError::TlvLength { ty: self.ty, len: self.value.len() })?;
        Ok(u16::from_be_bytes(arr))
    }

    pub fn as_u32(&self) -> Result<u32, CodecError> {
        let arr: [u8; 4] = self
            .value
            .try_into()
            .map_err(|_| CodecError::TlvLength { ty: self.ty, len: self.value.len() })?;
        Ok(u32::from_be_bytes(arr))
    }

    /// Children of a nested TLV, skipping its pad byte.
    pub fn nested(&self) -> TlvReader<'a> {
        TlvReader::new(self.value.get(1..).unwrap_or(&[]))
    }
}

pub struct TlvReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> TlvReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
}

impl<'a> Iterator for TlvReader<'a> {
    type Item = Result<Tlv<'a>, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let rest = &self.buf[self.pos..];
        if rest.len() < 2 {
            self.pos = self.buf.len();
            return Some(Err(CodecError::Truncated { needed: 2, available: rest.len() }));
        }
        let ty = rest[0];
        let len = rest[1] as usize;
        if rest.len() < 2 + len {
            self.pos = self.buf.len();
            return Some(Err(CodecError::TlvOverrun { ty, len }));
        }
        self.pos += 2 + len;
        Some(Ok(Tlv { ty, value: &rest[2..2 + len] }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_length_patch() {
        let mut w = TlvWriter::new();
        let outer = w.reserve_length(145);
        w.put_tlv_u32(1, 0xDEADBEEF);
        let inner = w.reserve_length(100);
        w.put_tlv_u8(3, 17);
        w.patch_length(inner).unwrap();
        w.patch_length(outer).unwrap();
        let bytes = w.finish().unwrap();

        assert_eq!(
            bytes.as_ref(),
            &[145, 13, 0, 1, 4, 0xDE, 0xAD, 0xBE, 0xEF, 100, 4, 0, 3, 1, 17]
        );

        let sf = TlvReader::new(&bytes).next().unwrap().unwrap();
        let children: Vec<_> = sf.nested().collect::<Result<_, _>>().unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].as_u32().unwrap(), 0xDEADBEEF);
        let rule = children[1].nested().next().unwrap().unwrap();
        assert_eq!(rule.as_u8().unwrap(), 17);
    }

    #[test]
    fn test_management_frame_len() {
        let mut w = TlvWriter::management(0x00C9, 13);
        w.put_u16(0x8001).put_byte(0).put_hmac_tuple(0);
        let bytes = w.finish().unwrap();
        assert_eq!(bytes.len(), 6 + 4 + 23);
        let header = MacHeader::decode(&bytes).unwrap();
        assert_eq!(header.len as usize, bytes.len());
        assert_eq!(header.cid, 0x00C9);
    }

    #[test]
    fn test_reader_overrun() {
        let buf = [7u8, 4, 1, 2];
        let mut r = TlvReader::new(&buf);
        assert!(matches!(r.next(), Some(Err(CodecError::TlvOverrun { ty: 7, len: 4 }))));
        assert!(r.next().is_none());
    }
}
