//! Data PDUs: fragmentation and packing on the way out, reassembly on the
//! way in.
//!
//! A PDU carries one or more units. Without packing there is exactly one,
//! preceded by a fragmentation subheader whenever it is a fragment (or
//! always, for ARQ connections, where the subheader carries the BSN). With
//! packing every unit gets its own packing subheader. The CRC trailer is
//! framed but left zero, like the HCS.

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, trace};
use wimax_core::constants::{CRC_SIZE, FSN_MODULUS, MAC_HEADER_SIZE, MAX_PDU_SIZE};
use wimax_core::header::{TYPE_EXTENDED, TYPE_FRAGMENTATION_SUBHEADER, TYPE_PACKING_SUBHEADER};
use wimax_core::{Cid, CodecError, FragSubheader, FragmentControl, MacHeader, PackSubheader, PduTag};

use crate::packet::Sdu;

/// One SDU or fragment inside a data PDU. `sequence` is the FSN, or the
/// BSN of the first block on ARQ connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PduUnit {
    pub fc: FragmentControl,
    pub sequence: u16,
    pub payload: Bytes,
    pub tag: PduTag,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPdu {
    pub cid: Cid,
    /// Extended (ARQ) subheaders.
    pub extended: bool,
    pub packed: bool,
    pub units: Vec<PduUnit>,
}

impl DataPdu {
    pub fn subheader_size(extended: bool, packed: bool) -> usize {
        match (packed, extended) {
            (true, true) => PackSubheader::EXTENDED_SIZE,
            (true, false) => PackSubheader::SHORT_SIZE,
            (false, true) => FragSubheader::EXTENDED_SIZE,
            (false, false) => FragSubheader::SHORT_SIZE,
        }
    }

    fn needs_frag_subheader(&self) -> bool {
        !self.packed && (self.extended || self.units.iter().any(|u| u.fc != FragmentControl::Unfragmented))
    }

    pub fn encoded_len(&self, crc: bool) -> usize {
        let sub = Self::subheader_size(self.extended, self.packed);
        let payload: usize = self.units.iter().map(|u| u.payload.len()).sum();
        let subheaders = if self.packed {
            sub * self.units.len()
        } else if self.needs_frag_subheader() {
            sub
        } else {
            0
        };
        MAC_HEADER_SIZE + subheaders + payload + if crc { CRC_SIZE } else { 0 }
    }

    pub fn encode(&self, crc: bool) -> Result<Bytes, CodecError> {
        let len = self.encoded_len(crc);
        if len > MAX_PDU_SIZE {
            return Err(CodecError::LengthOverflow(len));
        }
        let mut header = MacHeader::new(self.cid);
        if self.packed {
            header = header.with_type(TYPE_PACKING_SUBHEADER);
        } else if self.needs_frag_subheader() {
            header = header.with_type(TYPE_FRAGMENTATION_SUBHEADER);
        }
        if self.extended {
            header = header.with_type(TYPE_EXTENDED);
        }
        header.crc_indicator = crc;
        header.len = len as u16;

        let mut buf = BytesMut::with_capacity(len);
        buf.put_slice(&header.encode());
        let sub = Self::subheader_size(self.extended, true);
        for unit in &self.units {
            if self.packed {
                let sh = PackSubheader { fc: unit.fc, sequence: unit.sequence, length: (sub + unit.payload.len()) as u16 };
                if self.extended {
                    buf.put_slice(&sh.encode_extended());
                } else {
                    buf.put_slice(&sh.encode_short());
                }
            } else if self.needs_frag_subheader() {
                let sh = FragSubheader::new(unit.fc, unit.sequence);
                if self.extended {
                    buf.put_slice(&sh.encode_extended());
                } else {
                    buf.put_u8(sh.encode_short());
                }
            }
            buf.put_slice(&unit.payload);
        }
        if crc {
            buf.put_bytes(0, CRC_SIZE);
        }
        Ok(buf.freeze())
    }

    /// Parses a data PDU. Tags travel outside the bytes and are attached
    /// with [`DataPdu::attach_tags`].
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let header = MacHeader::decode(buf)?;
        let len = header.len as usize;
        let crc = if header.crc_indicator { CRC_SIZE } else { 0 };
        if len > buf.len() || len < MAC_HEADER_SIZE + crc {
            return Err(CodecError::Truncated { needed: len.max(MAC_HEADER_SIZE + crc), available: buf.len() });
        }
        let body = Bytes::copy_from_slice(&buf[MAC_HEADER_SIZE..len - crc]);
        let extended = header.has(TYPE_EXTENDED);
        let packed = header.has(TYPE_PACKING_SUBHEADER);
        let mut units = Vec::new();

        if packed {
            let sub = Self::subheader_size(extended, true);
            let mut at = 0;
            while at < body.len() {
                let sh = if extended {
                    PackSubheader::decode_extended(&body[at..])?
                } else {
                    PackSubheader::decode_short(&body[at..])?
                };
                let end = at + sh.length as usize;
                if (sh.length as usize) < sub || end > body.len() {
                    return Err(CodecError::Truncated { needed: end, available: body.len() });
                }
                units.push(PduUnit {
                    fc: sh.fc,
                    sequence: sh.sequence,
                    payload: body.slice(at + sub..end),
                    tag: PduTag::default(),
                });
                at = end;
            }
        } else if header.has(TYPE_FRAGMENTATION_SUBHEADER) {
            let (sh, sub) = if extended {
                (FragSubheader::decode_extended(&body)?, FragSubheader::EXTENDED_SIZE)
            } else {
                let b = *body.first().ok_or(CodecError::Truncated { needed: 1, available: 0 })?;
                (FragSubheader::decode_short(b), FragSubheader::SHORT_SIZE)
            };
            units.push(PduUnit { fc: sh.fc, sequence: sh.sequence, payload: body.slice(sub..), tag: PduTag::default() });
        } else {
            units.push(PduUnit { fc: FragmentControl::Unfragmented, sequence: 0, payload: body, tag: PduTag::default() });
        }

        Ok(Self { cid: header.cid, extended, packed, units })
    }

    pub fn tags(&self) -> Vec<PduTag> {
        self.units.iter().map(|u| u.tag).collect()
    }

    pub fn attach_tags(&mut self, tags: &[PduTag]) {
        for (unit, tag) in self.units.iter_mut().zip(tags) {
            unit.tag = *tag;
        }
    }
}

/// Transmit-side state of a non-ARQ connection: the fragment sequence
/// counter and the SDU currently being sent in pieces.
#[derive(Debug, Default)]
pub struct Fragmenter {
    fsn: u8,
    partial: Option<(Sdu, usize)>,
}

impl Fragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_partial(&self) -> bool {
        self.partial.is_some()
    }

    /// Bytes of the SDU in progress still to be sent.
    pub fn partial_bytes(&self) -> usize {
        self.partial.as_ref().map_or(0, |(sdu, off)| sdu.len() - off)
    }

    pub fn reset(&mut self) {
        self.fsn = 0;
        self.partial = None;
    }

    fn next_fsn(&mut self) -> u16 {
        let fsn = self.fsn;
        self.fsn = (self.fsn + 1) % FSN_MODULUS;
        fsn as u16
    }

    fn take_next(&mut self, queue: &mut VecDeque<Sdu>) -> Option<(Sdu, usize)> {
        self.partial.take().or_else(|| queue.pop_front().map(|sdu| (sdu, 0)))
    }

    fn put_back(&mut self, queue: &mut VecDeque<Sdu>, sdu: Sdu, offset: usize) {
        if offset == 0 {
            queue.push_front(sdu);
        } else {
            self.partial = Some((sdu, offset));
        }
    }

    fn cut(&mut self, sdu: &Sdu, offset: usize, take: usize) -> PduUnit {
        let end = offset + take;
        let mut tag = sdu.tag;
        // virtual size is accounted once per SDU
        if offset > 0 {
            tag.virtual_size = 0;
        }
        let fc = FragmentControl::for_span(offset == 0, end == sdu.len());
        let sequence = if fc == FragmentControl::Unfragmented { self.fsn as u16 } else { self.next_fsn() };
        PduUnit { fc, sequence, payload: sdu.payload.slice(offset..end), tag }
    }

    /// Builds the next PDU for a burst of `burst` bytes, or nothing if no
    /// payload byte fits.
    pub fn build(
        &mut self,
        cid: Cid,
        queue: &mut VecDeque<Sdu>,
        burst: usize,
        packing: bool,
        crc_size: usize,
    ) -> Option<DataPdu> {
        let avail = burst.min(MAX_PDU_SIZE).checked_sub(MAC_HEADER_SIZE + crc_size)?;
        let mut units = Vec::new();

        if !packing {
            let (sdu, offset) = self.take_next(queue)?;
            let remaining = sdu.len() - offset;
            if offset == 0 && remaining <= avail {
                units.push(self.cut(&sdu, 0, remaining));
            } else {
                let room = avail.saturating_sub(FragSubheader::SHORT_SIZE);
                if room == 0 {
                    self.put_back(queue, sdu, offset);
                    return None;
                }
                let take = remaining.min(room);
                units.push(self.cut(&sdu, offset, take));
                if offset + take < sdu.len() {
                    self.partial = Some((sdu, offset + take));
                }
            }
        } else {
            let mut room = avail;
            while room > PackSubheader::SHORT_SIZE {
                let Some((sdu, offset)) = self.take_next(queue) else { break };
                let take = (sdu.len() - offset).min(room - PackSubheader::SHORT_SIZE);
                units.push(self.cut(&sdu, offset, take));
                room -= PackSubheader::SHORT_SIZE + take;
                if offset + take < sdu.len() {
                    self.partial = Some((sdu, offset + take));
                    break;
                }
            }
        }

        if units.is_empty() {
            return None;
        }
        trace!("cid {} built PDU with {} units", cid, units.len());
        Some(DataPdu { cid, extended: false, packed: packing, units })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub reassembled: u64,
    pub fragments_dropped: u64,
}

impl ReassemblyStats {
    pub fn merge(&mut self, other: &ReassemblyStats) {
        self.reassembled += other.reassembled;
        self.fragments_dropped += other.fragments_dropped;
    }
}

/// Receive-side buffer of one connection's fragmented SDU.
#[derive(Debug, Default)]
pub struct Reassembler {
    fragments: Vec<PduUnit>,
    pub stats: ReassemblyStats,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffered(&self) -> usize {
        self.fragments.len()
    }

    fn drop_buffer(&mut self, why: &str) {
        if !self.fragments.is_empty() {
            debug!("dropping {} buffered fragments: {}", self.fragments.len(), why);
            self.stats.fragments_dropped += self.fragments.len() as u64;
            self.fragments.clear();
        }
    }

    /// Feeds one unit; returns the SDU it completes, if any.
    pub fn accept(&mut self, unit: PduUnit) -> Option<Sdu> {
        match unit.fc {
            FragmentControl::Unfragmented => Some(Sdu { payload: unit.payload, tag: unit.tag }),
            FragmentControl::First => {
                self.drop_buffer("new first fragment");
                self.fragments.push(unit);
                None
            }
            FragmentControl::Middle => {
                if self.fragments.is_empty() {
                    debug!("continuation fragment FSN {} without a first fragment", unit.sequence);
                    self.stats.fragments_dropped += 1;
                } else {
                    self.fragments.push(unit);
                }
                None
            }
            FragmentControl::Last => {
                if self.fragments.is_empty() {
                    debug!("last fragment FSN {} without a first fragment", unit.sequence);
                    self.stats.fragments_dropped += 1;
                    return None;
                }
                self.fragments.push(unit);
                self.complete()
            }
        }
    }

    fn complete(&mut self) -> Option<Sdu> {
        let first = &self.fragments[0];
        let origin = (first.tag.origin, first.tag.sequence);
        let contiguous = self
            .fragments
            .iter()
            .enumerate()
            .all(|(i, f)| f.sequence == (first.sequence + i as u16) % FSN_MODULUS as u16);
        if !contiguous {
            self.drop_buffer("FSN sequence broken");
            return None;
        }
        if self.fragments.iter().any(|f| (f.tag.origin, f.tag.sequence) != origin) {
            self.drop_buffer("fragments of different SDUs");
            return None;
        }

        let mut tag = first.tag;
        tag.virtual_size = self.fragments.iter().map(|f| f.tag.virtual_size).sum();
        let mut payload = BytesMut::with_capacity(self.fragments.iter().map(|f| f.payload.len()).sum());
        for f in self.fragments.drain(..) {
            payload.extend_from_slice(&f.payload);
        }
        self.stats.reassembled += 1;
        Some(Sdu { payload: payload.freeze(), tag })
    }
}
