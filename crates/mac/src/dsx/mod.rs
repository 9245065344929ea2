//! Dynamic service transactions (DSA, DSC, DSD)
//!
//! Each service flow carries at most one transaction at a time. The
//! transaction keeps copies of what it sent so a timer can resend them, and
//! owns the four DSx timers.

use std::time::Duration;

use bytes::Bytes;
use log::trace;
use wimax_core::TransactionId;

use crate::service_flow::FlowId;
use crate::timer::{disarm, DsxTimer, MacTimer, Scheduler, TimerHandle};

pub mod messages;

pub use messages::{ClassifierRule, DsxMessage, FlowRequest, FlowTlvs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DsxKind {
    Add,
    Change,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DsxState {
    #[default]
    Null,
    ReqSent,
    RspSent,
    RspReceived,
    AckSent,
    AckReceived,
}

#[derive(Debug, Default)]
pub struct DsxTransaction {
    pub kind: Option<DsxKind>,
    pub state: DsxState,
    pub transaction_id: Option<TransactionId>,
    /// Retransmissions left for the message currently guarded by a timer.
    pub retries_left: u8,
    pub req: Option<Bytes>,
    pub rsp: Option<Bytes>,
    pub ack: Option<Bytes>,
    t7: Option<TimerHandle>,
    t8: Option<TimerHandle>,
    t10: Option<TimerHandle>,
    t14: Option<TimerHandle>,
}

impl DsxTransaction {
    pub fn is_idle(&self) -> bool {
        self.state == DsxState::Null && self.transaction_id.is_none()
    }

    pub fn matches(&self, transaction_id: TransactionId) -> bool {
        self.transaction_id == Some(transaction_id)
    }

    pub fn begin(&mut self, kind: DsxKind, transaction_id: TransactionId, retries: u8) {
        self.kind = Some(kind);
        self.transaction_id = Some(transaction_id);
        self.retries_left = retries;
    }

    fn slot(&mut self, timer: DsxTimer) -> &mut Option<TimerHandle> {
        match timer {
            DsxTimer::T7 => &mut self.t7,
            DsxTimer::T8 => &mut self.t8,
            DsxTimer::T10 => &mut self.t10,
            DsxTimer::T14 => &mut self.t14,
        }
    }

    pub fn is_current(&self, timer: DsxTimer, handle: TimerHandle) -> bool {
        let slot = match timer {
            DsxTimer::T7 => self.t7,
            DsxTimer::T8 => self.t8,
            DsxTimer::T10 => self.t10,
            DsxTimer::T14 => self.t14,
        };
        slot == Some(handle)
    }

    /// (Re)arms `timer` for this transaction.
    pub fn arm(&mut self, timer: DsxTimer, delay: Duration, flow: FlowId, sched: &mut dyn Scheduler) {
        let Some(transaction_id) = self.transaction_id else { return };
        let slot = self.slot(timer);
        disarm(sched, slot);
        *slot = Some(sched.schedule(delay, MacTimer::Dsx { flow, timer, transaction_id }));
    }

    pub fn disarm(&mut self, timer: DsxTimer, sched: &mut dyn Scheduler) {
        disarm(sched, self.slot(timer));
    }

    /// Forgets a timer that has just fired.
    pub fn fired(&mut self, timer: DsxTimer) {
        *self.slot(timer) = None;
    }

    pub fn held_copies(&self) -> usize {
        [&self.req, &self.rsp, &self.ack].iter().filter(|m| m.is_some()).count()
    }

    pub fn armed_timers(&self) -> usize {
        [self.t7, self.t8, self.t10, self.t14].iter().filter(|t| t.is_some()).count()
    }

    /// Terminal cleanup: frees the held copies, cancels every timer and
    /// forgets the transaction id. Safe to call any number of times.
    pub fn reset(&mut self, sched: &mut dyn Scheduler) {
        for timer in [DsxTimer::T7, DsxTimer::T8, DsxTimer::T10, DsxTimer::T14] {
            self.disarm(timer, sched);
        }
        if let Some(id) = self.transaction_id {
            trace!("DSx transaction {id:#06x} closed in state {:?}", self.state);
        }
        *self = Self::default();
    }
}
