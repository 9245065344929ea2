//! Automatic repeat request over a sliding window of fixed-size blocks
//!
//! One [`ArqControl`] serves one direction of one connection. The transmit
//! side cuts SDUs into blocks, hands out runs of pending blocks, and learns
//! about delivery from cumulative feedback. The receive side stores blocks
//! by BSN, answers with feedback, and rebuilds SDUs from the front of its
//! window. Both sides recover from a stuck window with the three-way reset
//! handshake guarded by T22.

use std::collections::{HashSet, VecDeque};

use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};
use wimax_core::constants::{ARQ_BSN_MODULUS, ARQ_MAX_RESET_RETRY, MAC_HEADER_SIZE};
use wimax_core::{ArqParameters, Bsn, Cid, FragSubheader, FragmentControl, PackSubheader, PduTag};

use crate::packet::Sdu;
use crate::timer::{disarm, MacTimer, Scheduler, TimerHandle};

pub mod messages;
pub mod params;
pub mod window;

pub use messages::{ArqMessage, ArqResetType, FeedbackIe};
pub use params::convert_param;
pub use window::{bsn_add, bsn_offset, ArqBlock, ArqWindow, BlockState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArqDirection {
    Tx,
    Rx,
}

/// What a call produced for the station to act on.
#[derive(Debug, Default)]
pub struct ArqOutput {
    pub messages: Vec<ArqMessage>,
    pub delivered: Vec<Sdu>,
}

/// A run of contiguous blocks ready to go out in one PDU (or one packed
/// unit of a PDU).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArqSegment {
    pub bsn: Bsn,
    pub fc: FragmentControl,
    pub payload: Bytes,
    pub tag: PduTag,
    pub blocks: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArqStats {
    pub blocks_sent: u64,
    pub blocks_retransmitted: u64,
    pub blocks_acked: u64,
    pub blocks_discarded: u64,
    pub blocks_received: u64,
    pub blocks_dropped: u64,
    pub sdus_delivered: u64,
    pub sdus_broken: u64,
    pub feedback_sent: u64,
    pub discards_sent: u64,
    pub resets_started: u64,
    pub resets_completed: u64,
}

impl ArqStats {
    pub fn merge(&mut self, other: &ArqStats) {
        self.blocks_sent += other.blocks_sent;
        self.blocks_retransmitted += other.blocks_retransmitted;
        self.blocks_acked += other.blocks_acked;
        self.blocks_discarded += other.blocks_discarded;
        self.blocks_received += other.blocks_received;
        self.blocks_dropped += other.blocks_dropped;
        self.sdus_delivered += other.sdus_delivered;
        self.sdus_broken += other.sdus_broken;
        self.feedback_sent += other.feedback_sent;
        self.discards_sent += other.discards_sent;
        self.resets_started += other.resets_started;
        self.resets_completed += other.resets_completed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingDiscard {
    /// Last BSN the peer is asked to skip past.
    bsn: Bsn,
    timer: TimerHandle,
}

#[derive(Debug)]
pub struct ArqControl {
    cid: Cid,
    direction: ArqDirection,
    params: ArqParameters,
    window: ArqWindow,
    /// RX: one past the highest BSN received so far.
    highest_bsn: Bsn,
    transmission_enabled: bool,
    wait_for_reset: Option<ArqResetType>,
    reset_retries: u8,
    t22: Option<TimerHandle>,
    /// Retry and lifetime timers of the runs handed out, shared by every
    /// block of a run.
    run_timers: HashSet<TimerHandle>,
    discard: Option<PendingDiscard>,
    sync_loss: Option<TimerHandle>,
    stats: ArqStats,
}

impl ArqControl {
    pub fn new(cid: Cid, direction: ArqDirection, params: ArqParameters) -> Self {
        Self {
            cid,
            direction,
            params,
            window: ArqWindow::new(params.window_size),
            highest_bsn: 0,
            transmission_enabled: true,
            wait_for_reset: None,
            reset_retries: 0,
            t22: None,
            run_timers: HashSet::new(),
            discard: None,
            sync_loss: None,
            stats: ArqStats::default(),
        }
    }

    pub fn cid(&self) -> Cid {
        self.cid
    }

    pub fn direction(&self) -> ArqDirection {
        self.direction
    }

    pub fn params(&self) -> &ArqParameters {
        &self.params
    }

    pub fn window(&self) -> &ArqWindow {
        &self.window
    }

    pub fn start_bsn(&self) -> Bsn {
        self.window.start()
    }

    pub fn highest_bsn(&self) -> Bsn {
        self.highest_bsn
    }

    pub fn transmission_enabled(&self) -> bool {
        self.transmission_enabled
    }

    pub fn wait_for_reset(&self) -> Option<ArqResetType> {
        self.wait_for_reset
    }

    pub fn reset_retries(&self) -> u8 {
        self.reset_retries
    }

    /// BSN carried by the discard still being repeated, if any.
    pub fn pending_discard(&self) -> Option<Bsn> {
        self.discard.map(|d| d.bsn)
    }

    pub fn stats(&self) -> &ArqStats {
        &self.stats
    }

    pub fn block_state(&self, bsn: Bsn) -> Option<BlockState> {
        self.window.block(bsn).map(|b| b.state)
    }

    fn block_size(&self) -> usize {
        self.params.block_size as usize
    }

    /// Number of blocks an SDU of `len` bytes occupies.
    pub fn blocks_for(&self, len: usize) -> usize {
        len.div_ceil(self.block_size()).max(1)
    }

    fn restart_sync_loss(&mut self, sched: &mut dyn Scheduler) {
        disarm(sched, &mut self.sync_loss);
        if !self.params.sync_loss_timeout.is_zero() {
            self.sync_loss = Some(sched.schedule(self.params.sync_loss_timeout, MacTimer::ArqSyncLoss { cid: self.cid }));
        }
    }

    // ---- transmit side ----

    /// Moves whole SDUs from `queue` into the window while they fit.
    /// Returns how many were taken.
    pub fn fill_window(&mut self, queue: &mut VecDeque<Sdu>) -> usize {
        if !self.transmission_enabled {
            return 0;
        }
        let bs = self.block_size();
        let mut taken = 0;
        while let Some(sdu) = queue.front() {
            let n = self.blocks_for(sdu.len());
            if n > self.window.free_space() {
                break;
            }
            let Some(sdu) = queue.pop_front() else { break };
            for i in 0..n {
                let from = (i * bs).min(sdu.payload.len());
                let to = ((i + 1) * bs).min(sdu.payload.len());
                let block = ArqBlock {
                    state: BlockState::NotSent,
                    fc: FragmentControl::for_span(i == 0, i == n - 1),
                    payload: Some(sdu.payload.slice(from..to)),
                    tag: sdu.tag,
                    ..ArqBlock::default()
                };
                // room was checked above
                let _ = self.window.push_back(block);
            }
            taken += 1;
        }
        if taken > 0 {
            trace!("ARQ cid {} queued {} SDUs, window holds {} blocks", self.cid, taken, self.window.len());
        }
        taken
    }

    pub fn has_pending(&self) -> bool {
        self.transmission_enabled && self.window.iter().any(|b| b.state.is_pending())
    }

    /// Hands out the oldest run of pending blocks whose payload fits in
    /// `capacity` bytes. A run never crosses an SDU boundary.
    pub fn next_segment(&mut self, capacity: usize, sched: &mut dyn Scheduler) -> Option<ArqSegment> {
        if !self.transmission_enabled {
            return None;
        }

        let mut run: Vec<Bsn> = Vec::new();
        let mut used = 0;
        for b in self.window.iter() {
            if !b.state.is_pending() {
                if run.is_empty() {
                    continue;
                }
                break;
            }
            if used + b.len() > capacity {
                break;
            }
            used += b.len();
            run.push(b.bsn);
            if b.fc.ends_sdu() {
                break;
            }
        }
        let (&first, &last) = (run.first()?, run.last()?);

        let mut payload = BytesMut::with_capacity(used);
        let mut tag = PduTag::default();
        let mut starts = false;
        let mut ends = false;
        let mut not_sent: Option<(Bsn, u16)> = None;
        for &bsn in &run {
            let Some(block) = self.window.block_mut(bsn) else { continue };
            if bsn == first {
                starts = block.fc.starts_sdu();
                tag = block.tag;
            }
            if bsn == last {
                ends = block.fc.ends_sdu();
            }
            if block.state == BlockState::NotSent {
                self.stats.blocks_sent += 1;
                not_sent = Some(not_sent.map_or((bsn, 1), |(b, n)| (b, n + 1)));
            } else {
                self.stats.blocks_retransmitted += 1;
            }
            if let Some(p) = &block.payload {
                payload.extend_from_slice(p);
            }
            block.state = BlockState::Outstanding;
        }

        let count = run.len() as u16;
        let retry = sched.schedule(self.params.retry_timeout(), MacTimer::ArqRetry { cid: self.cid, bsn: first, count });
        self.run_timers.insert(retry);
        if let Some((bsn, count)) = not_sent {
            let lifetime =
                sched.schedule(self.params.block_lifetime, MacTimer::ArqBlockLifetime { cid: self.cid, bsn, count });
            self.run_timers.insert(lifetime);
        }
        if self.sync_loss.is_none() {
            self.restart_sync_loss(sched);
        }

        trace!("ARQ cid {} sending BSN {}..={} ({} bytes)", self.cid, first, last, used);
        Some(ArqSegment {
            bsn: first,
            fc: FragmentControl::for_span(starts, ends),
            payload: payload.freeze(),
            tag,
            blocks: count,
        })
    }

    /// Cumulative acknowledgement up to and including `ie.bsn`.
    pub fn handle_feedback(&mut self, ie: &FeedbackIe, sched: &mut dyn Scheduler) -> usize {
        let start = self.window.start();
        if bsn_offset(start, ie.bsn) >= bsn_offset(start, self.window.rear_bsn()) {
            trace!("ARQ cid {} ignoring stale feedback for BSN {}", self.cid, ie.bsn);
            return 0;
        }
        let new_start = bsn_add(ie.bsn, 1);
        let freed = bsn_offset(start, new_start) as usize;
        for _ in 0..freed {
            self.window.pop_front();
        }
        self.window.set_start(new_start);
        self.stats.blocks_acked += freed as u64;
        self.restart_sync_loss(sched);
        trace!("ARQ cid {} acked through BSN {}, {} blocks left", self.cid, ie.bsn, self.window.len());
        freed
    }

    /// Bytes to ask for so everything pending leaves in one grant.
    pub fn bandwidth_request(&self, packing: bool, crc_size: usize) -> usize {
        if !self.transmission_enabled {
            return 0;
        }
        let (bytes, mut pdus) = self
            .window
            .iter()
            .filter(|b| b.state.is_pending())
            .fold((0, 0), |(bytes, pdus), b| (bytes + b.len(), pdus + (b.fc != FragmentControl::Middle) as usize));
        if bytes == 0 {
            return 0;
        }
        pdus = pdus.max(1);
        if packing && pdus > 1 {
            bytes + crc_size + MAC_HEADER_SIZE + pdus * PackSubheader::EXTENDED_SIZE
        } else {
            let sub = if packing { PackSubheader::EXTENDED_SIZE } else { FragSubheader::EXTENDED_SIZE };
            bytes + (sub + crc_size + MAC_HEADER_SIZE) * pdus
        }
    }

    // ---- receive side ----

    /// Stores the blocks of one received run starting at `first`, then
    /// acknowledges and delivers whatever became complete.
    pub fn receive(
        &mut self,
        first: Bsn,
        fc: FragmentControl,
        payload: Bytes,
        tag: PduTag,
        sched: &mut dyn Scheduler,
        out: &mut ArqOutput,
    ) {
        let bs = self.block_size();
        let n = self.blocks_for(payload.len());
        let mut added = 0;

        for k in 0..n {
            let bsn = bsn_add(first, k as u16);
            if !self.transmission_enabled || !self.window.contains(bsn) || !self.window.extend_to(bsn) {
                continue;
            }
            let start = self.window.start();
            let purge_timeout = self.params.rx_purge_timeout;
            let cid = self.cid;
            let Some(block) = self.window.block_mut(bsn) else { continue };
            if block.state == BlockState::Received && block.payload.is_some() {
                // duplicate
                disarm(sched, &mut block.purge_timer);
                block.purge_timer = Some(sched.schedule(purge_timeout, MacTimer::ArqRxPurge { cid, bsn }));
                continue;
            }
            let from = (k * bs).min(payload.len());
            let to = ((k + 1) * bs).min(payload.len());
            block.state = BlockState::Received;
            block.payload = Some(payload.slice(from..to));
            block.fc = FragmentControl::for_span(fc.starts_sdu() && k == 0, fc.ends_sdu() && k == n - 1);
            block.tag = tag;
            if bsn != start {
                disarm(sched, &mut block.purge_timer);
                block.purge_timer = Some(sched.schedule(purge_timeout, MacTimer::ArqRxPurge { cid, bsn }));
            }
            added += 1;

            if bsn_offset(start, bsn) >= bsn_offset(start, self.highest_bsn) {
                self.highest_bsn = bsn_add(bsn, 1);
            }
            self.advance_rx_start(sched);
        }

        self.stats.blocks_received += added as u64;
        self.stats.blocks_dropped += (n - added) as u64;
        if added < n {
            debug!("ARQ cid {} dropped {} of {} blocks from BSN {}", self.cid, n - added, n, first);
        }
        self.send_feedback(out);
        self.build_sdus(sched, out);
    }

    /// Slides the in-order point over contiguous received blocks.
    fn advance_rx_start(&mut self, sched: &mut dyn Scheduler) {
        let before = self.window.start();
        loop {
            let start = self.window.start();
            match self.window.block_mut(start) {
                Some(b) if b.state == BlockState::Received => {
                    disarm(sched, &mut b.purge_timer);
                    self.window.set_start(bsn_add(start, 1));
                }
                _ => break,
            }
        }
        if self.window.start() != before {
            self.restart_sync_loss(sched);
        }
    }

    /// Acks up to the in-order point. Nothing goes out while the window is
    /// empty, so if the last feedback is lost the sender's sync-loss timer
    /// resets the connection.
    fn send_feedback(&mut self, out: &mut ArqOutput) {
        if self.window.is_empty() {
            return;
        }
        let bsn = bsn_add(self.window.start(), ARQ_BSN_MODULUS - 1);
        out.messages.push(ArqMessage::Feedback(FeedbackIe::cumulative(self.cid, bsn)));
        self.stats.feedback_sent += 1;
    }

    /// Marks every block from the in-order point through `bsn` as received
    /// (empty where nothing arrived) and moves the point past it.
    fn skip_through(&mut self, bsn: Bsn, sched: &mut dyn Scheduler) -> bool {
        if !self.window.extend_to(bsn) {
            return false;
        }
        let start = self.window.start();
        for i in 0..=bsn_offset(start, bsn) {
            if let Some(b) = self.window.block_mut(bsn_add(start, i)) {
                disarm(sched, &mut b.purge_timer);
                if b.state != BlockState::Received {
                    b.state = BlockState::Received;
                    b.payload = None;
                }
            }
        }
        let new_start = bsn_add(bsn, 1);
        if bsn_offset(start, bsn) >= bsn_offset(start, self.highest_bsn) {
            self.highest_bsn = new_start;
        }
        self.window.set_start(new_start);
        self.advance_rx_start(sched);
        self.restart_sync_loss(sched);
        true
    }

    /// The transmitter gave up on everything through `bsn`.
    pub fn handle_discard(&mut self, bsn: Bsn, sched: &mut dyn Scheduler, out: &mut ArqOutput) {
        self.build_sdus(sched, out);
        if !self.window.contains(bsn) {
            trace!("ARQ cid {} discard for BSN {} outside the window", self.cid, bsn);
            return;
        }
        if self.skip_through(bsn, sched) {
            debug!("ARQ cid {} skipped to BSN {} on discard", self.cid, self.window.start());
            self.send_feedback(out);
            self.build_sdus(sched, out);
        }
    }

    /// Rebuilds SDUs from the front of the receive window. Blocks are
    /// released as soon as they are delivered or known to be useless.
    pub fn build_sdus(&mut self, sched: &mut dyn Scheduler, out: &mut ArqOutput) {
        loop {
            let Some(front) = self.window.front() else { break };
            if front.state != BlockState::Received {
                break;
            }
            if front.payload.is_none() || !front.fc.starts_sdu() {
                // skipped slot, or the tail of an SDU whose head is gone
                self.release_front(1, sched);
                continue;
            }
            if front.fc == FragmentControl::Unfragmented {
                self.deliver_front(1, sched, out);
                continue;
            }

            let mut end = None;
            let mut broken = None;
            for (i, b) in self.window.iter().enumerate().skip(1) {
                if b.state != BlockState::Received {
                    break;
                }
                if b.payload.is_none() || b.fc.starts_sdu() {
                    broken = Some(i);
                    break;
                }
                if b.fc == FragmentControl::Last {
                    end = Some(i);
                    break;
                }
            }
            match (end, broken) {
                (Some(i), _) => self.deliver_front(i + 1, sched, out),
                (None, Some(i)) => {
                    debug!("ARQ cid {} dropping incomplete SDU at BSN {}", self.cid, self.window.front_bsn());
                    self.stats.sdus_broken += 1;
                    self.release_front(i, sched);
                }
                (None, None) => break,
            }
        }
    }

    fn release_front(&mut self, n: usize, sched: &mut dyn Scheduler) {
        for _ in 0..n {
            if let Some(mut b) = self.window.pop_front() {
                disarm(sched, &mut b.purge_timer);
            }
        }
    }

    fn deliver_front(&mut self, n: usize, sched: &mut dyn Scheduler, out: &mut ArqOutput) {
        let mut payload = BytesMut::new();
        let mut tag = None;
        for _ in 0..n {
            let Some(mut b) = self.window.pop_front() else { break };
            disarm(sched, &mut b.purge_timer);
            tag.get_or_insert(b.tag);
            if let Some(p) = b.payload {
                payload.extend_from_slice(&p);
            }
        }
        self.stats.sdus_delivered += 1;
        out.delivered.push(Sdu { payload: payload.freeze(), tag: tag.unwrap_or_default() });
    }

    // ---- timers ----

    pub fn handle_timer(
        &mut self,
        handle: TimerHandle,
        timer: MacTimer,
        sched: &mut dyn Scheduler,
        out: &mut ArqOutput,
    ) {
        match timer {
            MacTimer::ArqRetry { bsn, count, .. } => {
                if !self.run_timers.remove(&handle) {
                    return;
                }
                let Some((from, remaining)) = self.window.find_range(bsn, count) else { return };
                for i in 0..remaining {
                    if let Some(b) = self.window.block_mut(bsn_add(from, i)) {
                        if b.state == BlockState::Outstanding {
                            b.state = BlockState::WaitForRetransmission;
                        }
                    }
                }
            }
            MacTimer::ArqBlockLifetime { bsn, count, .. } => {
                if !self.run_timers.remove(&handle) {
                    return;
                }
                let Some((from, remaining)) = self.window.find_range(bsn, count) else { return };
                self.expire_blocks(from, remaining, sched, out);
            }
            MacTimer::ArqDiscardRetry { .. } => {
                if self.discard.map(|d| d.timer) != Some(handle) {
                    return;
                }
                self.repeat_discard(sched, out);
            }
            MacTimer::ArqRxPurge { bsn, .. } => {
                let owned = self.window.block(bsn).is_some_and(|b| b.purge_timer == Some(handle));
                if !owned {
                    return;
                }
                if let Some(b) = self.window.block_mut(bsn) {
                    b.purge_timer = None;
                }
                if !self.window.contains(bsn) {
                    return;
                }
                debug!("ARQ cid {} purge timeout, skipping to BSN {}", self.cid, bsn_add(bsn, 1));
                if self.skip_through(bsn, sched) {
                    self.send_feedback(out);
                }
                self.build_sdus(sched, out);
            }
            MacTimer::ArqSyncLoss { .. } => {
                if self.sync_loss != Some(handle) {
                    return;
                }
                self.sync_loss = None;
                let stuck = match self.direction {
                    ArqDirection::Tx => !self.window.is_empty(),
                    ArqDirection::Rx => self.highest_bsn != self.window.start(),
                };
                if stuck {
                    warn!("ARQ cid {} lost synchronisation, resetting", self.cid);
                    self.start_reset(sched, out);
                }
            }
            MacTimer::ArqResetRetry { reset, .. } => {
                if self.t22 != Some(handle) {
                    return;
                }
                self.t22 = None;
                if self.reset_retries < ARQ_MAX_RESET_RETRY {
                    self.reset_retries += 1;
                    debug!("ARQ cid {} T22 expired, resending {:?} ({})", self.cid, reset, self.reset_retries);
                    self.send_reset(reset, sched, out);
                } else {
                    warn!("ARQ cid {} reset unanswered after {} retries, giving up", self.cid, ARQ_MAX_RESET_RETRY);
                    self.reset_retries = 0;
                }
            }
            _ => {}
        }
    }

    fn expire_blocks(&mut self, from: Bsn, count: u16, sched: &mut dyn Scheduler, out: &mut ArqOutput) {
        for i in 0..count {
            if let Some(b) = self.window.block_mut(bsn_add(from, i)) {
                b.state = BlockState::Discarded;
            }
        }
        self.stats.blocks_discarded += count as u64;
        let last = bsn_add(from, count - 1);
        debug!("ARQ cid {} block lifetime expired for BSN {}..={}", self.cid, from, last);

        if let Some(pending) = self.discard.as_mut() {
            pending.bsn = last;
            return;
        }
        self.push_discard(from, out);
        let timer = sched.schedule(self.params.retry_timeout(), MacTimer::ArqDiscardRetry { cid: self.cid, bsn: last });
        self.discard = Some(PendingDiscard { bsn: last, timer });
    }

    fn push_discard(&mut self, bsn: Bsn, out: &mut ArqOutput) {
        out.messages.push(ArqMessage::Discard { cid: self.cid, bsn });
        self.stats.discards_sent += 1;
    }

    /// Repeats the discard until feedback moves the window past it. Once
    /// it has, any later discarded run still in the window takes over.
    fn repeat_discard(&mut self, sched: &mut dyn Scheduler, out: &mut ArqOutput) {
        let Some(pending) = self.discard.take() else { return };
        let target = if self.window.bsn_in_window(pending.bsn).is_some() && self.window.block(pending.bsn).is_some() {
            Some(pending.bsn)
        } else {
            let mut run_end = None;
            for b in self.window.iter() {
                match (b.state == BlockState::Discarded, run_end) {
                    (true, _) => run_end = Some(b.bsn),
                    (false, Some(_)) => break,
                    (false, None) => {}
                }
            }
            run_end
        };
        let Some(bsn) = target else {
            trace!("ARQ cid {} discard acknowledged", self.cid);
            return;
        };
        self.push_discard(bsn, out);
        let timer = sched.schedule(self.params.retry_timeout(), MacTimer::ArqDiscardRetry { cid: self.cid, bsn });
        self.discard = Some(PendingDiscard { bsn, timer });
    }

    // ---- reset ----

    fn send_reset(&mut self, reset: ArqResetType, sched: &mut dyn Scheduler, out: &mut ArqOutput) {
        out.messages.push(ArqMessage::Reset { cid: self.cid, reset });
        let guarded = reset == ArqResetType::Initiator
            || (self.direction == ArqDirection::Tx && reset == ArqResetType::AckRsp);
        if guarded {
            disarm(sched, &mut self.t22);
            let interval = self.params.retry_timeout() * 2;
            self.t22 = Some(sched.schedule(interval, MacTimer::ArqResetRetry { cid: self.cid, reset }));
        }
    }

    /// Opens the reset handshake from this side.
    pub fn start_reset(&mut self, sched: &mut dyn Scheduler, out: &mut ArqOutput) {
        self.transmission_enabled = false;
        self.wait_for_reset = Some(ArqResetType::AckRsp);
        self.stats.resets_started += 1;
        self.send_reset(ArqResetType::Initiator, sched, out);
    }

    pub fn handle_reset(&mut self, reset: ArqResetType, sched: &mut dyn Scheduler, out: &mut ArqOutput) {
        debug!("ARQ cid {} ({:?}) got reset {:?}", self.cid, self.direction, reset);
        match (self.direction, reset) {
            (ArqDirection::Rx, ArqResetType::Initiator) => {
                self.build_sdus(sched, out);
                self.reset_window(sched);
                self.send_reset(ArqResetType::AckRsp, sched, out);
            }
            (ArqDirection::Tx, ArqResetType::Initiator) => {
                if self.wait_for_reset != Some(ArqResetType::AckRsp) {
                    self.transmission_enabled = false;
                    self.send_reset(ArqResetType::AckRsp, sched, out);
                }
            }
            (ArqDirection::Tx, ArqResetType::AckRsp) | (ArqDirection::Tx, ArqResetType::ConfirmInitiator) => {
                self.reset_window(sched);
                self.stats.resets_completed += 1;
            }
            (ArqDirection::Rx, ArqResetType::AckRsp) => {
                self.build_sdus(sched, out);
                self.reset_window(sched);
                self.stats.resets_completed += 1;
                self.send_reset(ArqResetType::ConfirmInitiator, sched, out);
            }
            (ArqDirection::Rx, ArqResetType::ConfirmInitiator) => {}
        }
    }

    /// Drops every block and timer and puts all anchors back to BSN 0.
    pub fn reset_window(&mut self, sched: &mut dyn Scheduler) {
        disarm(sched, &mut self.t22);
        disarm(sched, &mut self.sync_loss);
        if let Some(d) = self.discard.take() {
            sched.cancel(d.timer);
        }
        for handle in self.run_timers.drain() {
            sched.cancel(handle);
        }
        for mut b in self.window.reset() {
            disarm(sched, &mut b.purge_timer);
        }
        self.highest_bsn = 0;
        self.reset_retries = 0;
        self.transmission_enabled = true;
        self.wait_for_reset = None;
    }

    /// Tears the connection's ARQ state down for good.
    pub fn shutdown(&mut self, sched: &mut dyn Scheduler) {
        self.reset_window(sched);
        self.transmission_enabled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::EventQueue;
    use std::time::Duration;

    const CID: Cid = 450;

    fn params(window: u16, block: u16) -> ArqParameters {
        ArqParameters {
            window_size: window,
            retry_timeout_tx_delay: Duration::from_millis(10),
            retry_timeout_rx_delay: Duration::from_millis(10),
            block_lifetime: Duration::from_millis(50),
            sync_loss_timeout: Duration::from_millis(200),
            rx_purge_timeout: Duration::from_millis(100),
            block_size: block,
            deliver_in_order: true,
        }
    }

    fn sdu(data: &[u8], sequence: u64) -> Sdu {
        Sdu { payload: Bytes::copy_from_slice(data), tag: PduTag { sequence, ..PduTag::default() } }
    }

    fn fire(arq: &mut ArqControl, q: &mut EventQueue, due: Vec<(TimerHandle, MacTimer)>) -> ArqOutput {
        let mut out = ArqOutput::default();
        for (h, t) in due {
            arq.handle_timer(h, t, q, &mut out);
        }
        out
    }

    #[test]
    fn test_lifetime_expiry_discards_only_its_run() {
        let mut q = EventQueue::new();
        let mut tx = ArqControl::new(CID, ArqDirection::Tx, params(16, 1));
        let mut queue: VecDeque<Sdu> = [sdu(b"abc", 1), sdu(b"def", 2), sdu(b"ghij", 3)].into();
        assert_eq!(tx.fill_window(&mut queue), 3);
        assert_eq!(tx.window().len(), 10);

        let runs: Vec<_> = std::iter::from_fn(|| tx.next_segment(100, &mut q)).collect();
        assert_eq!(runs.iter().map(|s| (s.bsn, s.blocks)).collect::<Vec<_>>(), vec![(0, 3), (3, 3), (6, 4)]);
        assert!(runs.iter().all(|s| s.fc == FragmentControl::Unfragmented));
        assert_eq!(&runs[2].payload[..], b"ghij");

        // only the lifetime timer of the second run fires
        let due: Vec<_> = q
            .drain_until(Duration::from_millis(50))
            .into_iter()
            .filter(|(_, t)| matches!(t, MacTimer::ArqBlockLifetime { bsn: 3, .. }))
            .collect();
        assert_eq!(due.len(), 1);
        let out = fire(&mut tx, &mut q, due);

        for bsn in 0..10 {
            let expected = if (3..=5).contains(&bsn) { BlockState::Discarded } else { BlockState::Outstanding };
            assert_eq!(tx.block_state(bsn), Some(expected), "BSN {bsn}");
        }
        assert_eq!(out.messages, vec![ArqMessage::Discard { cid: CID, bsn: 3 }]);
        assert_eq!(tx.pending_discard(), Some(5));

        let freed = tx.handle_feedback(&FeedbackIe::cumulative(CID, 9), &mut q);
        assert_eq!(freed, 10);
        assert!(tx.window().is_empty());
        assert_eq!(tx.start_bsn(), 10);
        assert_eq!(tx.reset_retries(), 0);

        // the repeat finds nothing left to discard and stops
        let due: Vec<_> = q
            .drain_until(Duration::from_millis(80))
            .into_iter()
            .filter(|(_, t)| matches!(t, MacTimer::ArqDiscardRetry { .. }))
            .collect();
        let out = fire(&mut tx, &mut q, due);
        assert!(out.messages.is_empty());
        assert_eq!(tx.pending_discard(), None);
    }

    #[test]
    fn test_retry_marks_outstanding_for_retransmission() {
        let mut q = EventQueue::new();
        let mut tx = ArqControl::new(CID, ArqDirection::Tx, params(16, 4));
        let mut queue: VecDeque<Sdu> = [sdu(&[7u8; 10], 1)].into();
        tx.fill_window(&mut queue);

        // capacity for two blocks only
        let s = tx.next_segment(8, &mut q).unwrap();
        assert_eq!((s.bsn, s.blocks, s.fc), (0, 2, FragmentControl::First));
        assert_eq!(tx.block_state(2), Some(BlockState::NotSent));

        let due: Vec<_> = q
            .drain_until(Duration::from_millis(20))
            .into_iter()
            .filter(|(_, t)| matches!(t, MacTimer::ArqRetry { .. }))
            .collect();
        fire(&mut tx, &mut q, due);
        assert_eq!(tx.block_state(0), Some(BlockState::WaitForRetransmission));
        assert_eq!(tx.block_state(1), Some(BlockState::WaitForRetransmission));

        let s = tx.next_segment(100, &mut q).unwrap();
        assert_eq!((s.bsn, s.blocks, s.fc), (0, 3, FragmentControl::Unfragmented));
        assert_eq!(s.payload.len(), 10);
        assert_eq!(tx.stats().blocks_retransmitted, 2);
        assert_eq!(tx.stats().blocks_sent, 3);
    }

    #[test]
    fn test_receive_out_of_order_then_deliver() {
        let mut q = EventQueue::new();
        let mut rx = ArqControl::new(CID, ArqDirection::Rx, params(16, 2));
        let mut out = ArqOutput::default();

        // the tail of a 6-byte SDU arrives first
        rx.receive(1, FragmentControl::Last, Bytes::from_static(b"cdef"), PduTag::default(), &mut q, &mut out);
        assert!(out.delivered.is_empty());
        assert_eq!(rx.highest_bsn(), 3);
        assert_eq!(rx.start_bsn(), 0);
        assert_eq!(out.messages.len(), 1);

        let mut out = ArqOutput::default();
        rx.receive(0, FragmentControl::First, Bytes::from_static(b"ab"), PduTag::default(), &mut q, &mut out);
        assert_eq!(out.delivered.len(), 1);
        assert_eq!(&out.delivered[0].payload[..], b"abcdef");
        assert_eq!(out.messages, vec![ArqMessage::Feedback(FeedbackIe::cumulative(CID, 2))]);
        assert_eq!(rx.start_bsn(), 3);
        assert!(rx.window().is_empty());

        // a late duplicate below the window is dropped
        let mut out = ArqOutput::default();
        rx.receive(1, FragmentControl::Middle, Bytes::from_static(b"ab"), PduTag::default(), &mut q, &mut out);
        assert_eq!(rx.stats().blocks_dropped, 1);
        assert!(out.delivered.is_empty());
    }

    #[test]
    fn test_purge_skips_hole_and_drops_orphans() {
        let mut q = EventQueue::new();
        let mut rx = ArqControl::new(CID, ArqDirection::Rx, params(16, 1));
        let mut out = ArqOutput::default();

        // BSN 0..1 (head of an SDU) is lost, its tail and a whole SDU arrive
        rx.receive(2, FragmentControl::Last, Bytes::from_static(b"c"), PduTag::default(), &mut q, &mut out);
        rx.receive(3, FragmentControl::Unfragmented, Bytes::from_static(b"xy"), PduTag::default(), &mut q, &mut out);
        assert!(out.delivered.is_empty());

        let due: Vec<_> = q
            .drain_until(Duration::from_millis(100))
            .into_iter()
            .filter(|(_, t)| matches!(t, MacTimer::ArqRxPurge { bsn: 4, .. }))
            .collect();
        assert_eq!(due.len(), 1);
        let out = fire(&mut rx, &mut q, due);
        assert_eq!(out.delivered.len(), 1);
        assert_eq!(&out.delivered[0].payload[..], b"xy");
        assert_eq!(rx.start_bsn(), 5);
        assert!(rx.window().is_empty());
    }

    #[test]
    fn test_discard_moves_receiver_past_gap() {
        let mut q = EventQueue::new();
        let mut rx = ArqControl::new(CID, ArqDirection::Rx, params(16, 1));
        let mut out = ArqOutput::default();
        rx.receive(4, FragmentControl::Unfragmented, Bytes::from_static(b"z"), PduTag::default(), &mut q, &mut out);

        let mut out = ArqOutput::default();
        rx.handle_discard(3, &mut q, &mut out);
        assert_eq!(rx.start_bsn(), 5);
        assert_eq!(out.delivered.len(), 1);
        assert_eq!(out.messages, vec![ArqMessage::Feedback(FeedbackIe::cumulative(CID, 4))]);

        // outside the window: nothing happens
        let mut out = ArqOutput::default();
        rx.handle_discard(1000, &mut q, &mut out);
        assert_eq!(rx.start_bsn(), 5);
        assert!(out.messages.is_empty());
    }

    #[test]
    fn test_transmitter_initiated_reset() {
        let mut tq = EventQueue::new();
        let mut rq = EventQueue::new();
        let mut tx = ArqControl::new(CID, ArqDirection::Tx, params(8, 2));
        let mut rx = ArqControl::new(CID, ArqDirection::Rx, params(8, 2));
        let mut queue: VecDeque<Sdu> = [sdu(b"hello", 1), sdu(b"world", 2)].into();
        tx.fill_window(&mut queue);
        let s = tx.next_segment(100, &mut tq).unwrap();
        let mut sink = ArqOutput::default();
        rx.receive(s.bsn + 1, FragmentControl::Middle, s.payload.slice(2..4), s.tag, &mut rq, &mut sink);

        let mut out = ArqOutput::default();
        tx.start_reset(&mut tq, &mut out);
        assert!(!tx.transmission_enabled());
        assert!(tx.next_segment(100, &mut tq).is_none());
        assert_eq!(out.messages, vec![ArqMessage::Reset { cid: CID, reset: ArqResetType::Initiator }]);

        let mut reply = ArqOutput::default();
        rx.handle_reset(ArqResetType::Initiator, &mut rq, &mut reply);
        assert_eq!(reply.messages, vec![ArqMessage::Reset { cid: CID, reset: ArqResetType::AckRsp }]);

        tx.handle_reset(ArqResetType::AckRsp, &mut tq, &mut ArqOutput::default());
        for side in [&tx, &rx] {
            assert!(side.window().is_empty());
            assert_eq!((side.start_bsn(), side.highest_bsn(), side.window().rear_bsn()), (0, 0, 0));
            assert!(side.transmission_enabled());
            assert_eq!(side.wait_for_reset(), None);
        }
        // nothing left armed on the transmitter
        assert_eq!(tq.pending(), 0);
    }

    #[test]
    fn test_lost_final_feedback_ends_in_sync_loss_reset() {
        let mut tq = EventQueue::new();
        let mut rq = EventQueue::new();
        let mut tx = ArqControl::new(CID, ArqDirection::Tx, params(8, 2));
        let mut rx = ArqControl::new(CID, ArqDirection::Rx, params(8, 2));
        let mut queue: VecDeque<Sdu> = [sdu(b"hello", 1)].into();
        tx.fill_window(&mut queue);
        let s = tx.next_segment(100, &mut tq).unwrap();

        // the feedback for this never reaches the transmitter
        let mut dropped = ArqOutput::default();
        rx.receive(s.bsn, s.fc, s.payload.clone(), s.tag, &mut rq, &mut dropped);
        assert_eq!(dropped.delivered.len(), 1);
        assert_eq!(dropped.messages.len(), 1);

        // a retransmission lands below the receive window and draws no feedback
        let mut out = ArqOutput::default();
        rx.receive(s.bsn, s.fc, s.payload, s.tag, &mut rq, &mut out);
        assert!(out.messages.is_empty() && out.delivered.is_empty());

        let due: Vec<_> = tq
            .drain_until(Duration::from_millis(250))
            .into_iter()
            .filter(|(_, t)| matches!(t, MacTimer::ArqSyncLoss { .. }))
            .collect();
        assert_eq!(due.len(), 1);
        let out = fire(&mut tx, &mut tq, due);
        assert_eq!(out.messages, vec![ArqMessage::Reset { cid: CID, reset: ArqResetType::Initiator }]);
    }

    #[test]
    fn test_receiver_initiated_reset_and_t22_limit() {
        let mut tq = EventQueue::new();
        let mut rq = EventQueue::new();
        let mut tx = ArqControl::new(CID, ArqDirection::Tx, params(8, 2));
        let mut rx = ArqControl::new(CID, ArqDirection::Rx, params(8, 2));

        let mut out = ArqOutput::default();
        rx.start_reset(&mut rq, &mut out);
        let mut ack = ArqOutput::default();
        tx.handle_reset(ArqResetType::Initiator, &mut tq, &mut ack);
        assert!(!tx.transmission_enabled());
        assert_eq!(ack.messages, vec![ArqMessage::Reset { cid: CID, reset: ArqResetType::AckRsp }]);

        let mut confirm = ArqOutput::default();
        rx.handle_reset(ArqResetType::AckRsp, &mut rq, &mut confirm);
        assert_eq!(confirm.messages, vec![ArqMessage::Reset { cid: CID, reset: ArqResetType::ConfirmInitiator }]);
        tx.handle_reset(ArqResetType::ConfirmInitiator, &mut tq, &mut ArqOutput::default());
        assert!(tx.transmission_enabled() && rx.transmission_enabled());

        // an unanswered initiator is repeated six times, then abandoned
        let mut out = ArqOutput::default();
        rx.start_reset(&mut rq, &mut out);
        let mut resent = 0;
        while let Some((h, t)) = rq.advance() {
            let mut o = ArqOutput::default();
            rx.handle_timer(h, t, &mut rq, &mut o);
            resent += o.messages.iter().filter(|m| matches!(m, ArqMessage::Reset { .. })).count();
        }
        assert_eq!(resent, ARQ_MAX_RESET_RETRY as usize);
        assert_eq!(rx.reset_retries(), 0);
    }

    #[test]
    fn test_bandwidth_request_counts_pending_only() {
        let mut q = EventQueue::new();
        let mut tx = ArqControl::new(CID, ArqDirection::Tx, params(16, 4));
        let mut queue: VecDeque<Sdu> = [sdu(&[1u8; 6], 1), sdu(&[2u8; 3], 2)].into();
        tx.fill_window(&mut queue);

        // 9 bytes in two SDUs: blocks First, Last, Unfragmented
        assert_eq!(tx.bandwidth_request(false, 4), 9 + (2 + 4 + 6) * 3);
        assert_eq!(tx.bandwidth_request(true, 4), 9 + 4 + 6 + 3 * 3);

        tx.next_segment(100, &mut q);
        assert_eq!(tx.bandwidth_request(false, 0), 3 + 2 + 6);

        let mut out = ArqOutput::default();
        tx.start_reset(&mut q, &mut out);
        assert_eq!(tx.bandwidth_request(false, 0), 0);
    }
}
