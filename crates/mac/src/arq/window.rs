//! Circular block store behind the ARQ sliding window
//!
//! Slots are addressed from one anchor: the BSN of the block at `front`.
//! Every other slot is derived from it, so a BSN and its slot can never
//! disagree.

use bytes::Bytes;
use wimax_core::constants::ARQ_BSN_MODULUS;
use wimax_core::{Bsn, FragmentControl, PduTag};

use crate::timer::TimerHandle;

pub fn bsn_add(bsn: Bsn, n: u16) -> Bsn {
    ((bsn as u32 + n as u32) % ARQ_BSN_MODULUS as u32) as Bsn
}

/// Distance from `from` forward to `to`, modulo the BSN space.
pub fn bsn_offset(from: Bsn, to: Bsn) -> u16 {
    ((to as u32 + ARQ_BSN_MODULUS as u32 - from as u32) % ARQ_BSN_MODULUS as u32) as u16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockState {
    #[default]
    Invalid,
    NotSent,
    Outstanding,
    WaitForRetransmission,
    Discarded,
    Received,
}

impl BlockState {
    /// Eligible for (re)transmission.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::NotSent | Self::WaitForRetransmission)
    }
}

#[derive(Debug, Clone)]
pub struct ArqBlock {
    pub state: BlockState,
    pub bsn: Bsn,
    pub fc: FragmentControl,
    pub payload: Option<Bytes>,
    pub tag: PduTag,
    pub purge_timer: Option<TimerHandle>,
}

impl Default for ArqBlock {
    fn default() -> Self {
        Self {
            state: BlockState::Invalid,
            bsn: 0,
            fc: FragmentControl::Unfragmented,
            payload: None,
            tag: PduTag::default(),
            purge_timer: None,
        }
    }
}

impl ArqBlock {
    pub fn len(&self) -> usize {
        self.payload.as_ref().map_or(0, |p| p.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct ArqWindow {
    blocks: Vec<ArqBlock>,
    front: usize,
    front_bsn: Bsn,
    len: usize,
    /// TX: oldest unacknowledged BSN. RX: next BSN expected in order.
    start: Bsn,
    size: u16,
}

impl ArqWindow {
    pub fn new(size: u16) -> Self {
        assert!(size > 0 && size <= ARQ_BSN_MODULUS / 2, "ARQ window size {size} out of range");
        Self {
            blocks: vec![ArqBlock::default(); size as usize],
            front: 0,
            front_bsn: 0,
            len: 0,
            start: 0,
            size,
        }
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn free_space(&self) -> usize {
        self.blocks.len() - self.len
    }

    pub fn start(&self) -> Bsn {
        self.start
    }

    pub fn set_start(&mut self, bsn: Bsn) {
        self.start = bsn;
    }

    pub fn front_bsn(&self) -> Bsn {
        self.front_bsn
    }

    /// BSN one past the last occupied slot.
    pub fn rear_bsn(&self) -> Bsn {
        bsn_add(self.front_bsn, self.len as u16)
    }

    pub fn contains(&self, bsn: Bsn) -> bool {
        bsn_offset(self.start, bsn) < self.size
    }

    fn slot_for(&self, bsn: Bsn) -> Option<usize> {
        let off = bsn_offset(self.front_bsn, bsn) as usize;
        (off < self.blocks.len()).then(|| (self.front + off) % self.blocks.len())
    }

    /// Slot of an in-window BSN that also fits in the store.
    pub fn bsn_in_window(&self, bsn: Bsn) -> Option<usize> {
        if !self.contains(bsn) {
            return None;
        }
        self.slot_for(bsn)
    }

    fn occupied_slot(&self, bsn: Bsn) -> Option<usize> {
        let off = bsn_offset(self.front_bsn, bsn) as usize;
        (off < self.len).then(|| (self.front + off) % self.blocks.len())
    }

    pub fn block(&self, bsn: Bsn) -> Option<&ArqBlock> {
        self.occupied_slot(bsn).map(|s| &self.blocks[s])
    }

    pub fn block_mut(&mut self, bsn: Bsn) -> Option<&mut ArqBlock> {
        self.occupied_slot(bsn).map(|s| &mut self.blocks[s])
    }

    pub fn front(&self) -> Option<&ArqBlock> {
        (self.len > 0).then(|| &self.blocks[self.front])
    }

    /// Locates a timer's block range: the first of `count` BSNs starting at
    /// `bsn` still inside the window, and how many of the range remain from
    /// there.
    pub fn find_range(&self, bsn: Bsn, count: u16) -> Option<(Bsn, u16)> {
        (0..count).map(|i| (i, bsn_add(bsn, i))).find_map(|(i, b)| {
            self.bsn_in_window(b)?;
            Some((b, count - i))
        })
    }

    /// Appends at the rear, returning the BSN assigned.
    pub fn push_back(&mut self, mut block: ArqBlock) -> Option<Bsn> {
        if self.free_space() == 0 {
            return None;
        }
        let bsn = self.rear_bsn();
        let slot = (self.front + self.len) % self.blocks.len();
        block.bsn = bsn;
        self.blocks[slot] = block;
        self.len += 1;
        Some(bsn)
    }

    /// Grows the occupied range so it covers `bsn`, filling any gap with
    /// empty slots. Returns false if the store cannot reach it.
    pub fn extend_to(&mut self, bsn: Bsn) -> bool {
        let off = bsn_offset(self.front_bsn, bsn) as usize;
        if off >= self.blocks.len() {
            return false;
        }
        while self.len <= off {
            let b = self.rear_bsn();
            let slot = (self.front + self.len) % self.blocks.len();
            self.blocks[slot] = ArqBlock { bsn: b, ..ArqBlock::default() };
            self.len += 1;
        }
        true
    }

    pub fn pop_front(&mut self) -> Option<ArqBlock> {
        if self.len == 0 {
            return None;
        }
        let block = std::mem::take(&mut self.blocks[self.front]);
        self.front = (self.front + 1) % self.blocks.len();
        self.front_bsn = bsn_add(self.front_bsn, 1);
        self.len -= 1;
        Some(block)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ArqBlock> {
        (0..self.len).map(move |i| &self.blocks[(self.front + i) % self.blocks.len()])
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ArqBlock> {
        let cap = self.blocks.len();
        let (front, len) = (self.front, self.len);
        self.blocks.iter_mut().enumerate().filter(move |(i, _)| (i + cap - front) % cap < len).map(|(_, b)| b)
    }

    /// Empties the store and moves every anchor back to BSN 0.
    pub fn reset(&mut self) -> Vec<ArqBlock> {
        let mut dropped = Vec::with_capacity(self.len);
        while let Some(b) = self.pop_front() {
            dropped.push(b);
        }
        self.front = 0;
        self.front_bsn = 0;
        self.start = 0;
        dropped
    }
}
