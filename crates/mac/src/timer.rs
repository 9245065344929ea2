//! Timer substrate
//!
//! The engine never sleeps. It asks a [`Scheduler`] to deliver a
//! [`MacTimer`] after a delay and keeps the returned handle. Handlers
//! re-check that handle (and whatever state the timer guards) before
//! acting, so a late or cancelled expiry is harmless.

use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

use wimax_core::{Bsn, Cid, TransactionId};

use crate::arq::ArqResetType;
use crate::service_flow::FlowId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DsxTimer {
    /// wait for DSA-RSP
    T7,
    /// wait for DSA/DSC-ACK
    T8,
    /// transaction holding down
    T10,
    /// wait for DSC/DSD-RSP
    T14,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MacTimer {
    Dsx { flow: FlowId, timer: DsxTimer, transaction_id: TransactionId },
    ArqRetry { cid: Cid, bsn: Bsn, count: u16 },
    ArqBlockLifetime { cid: Cid, bsn: Bsn, count: u16 },
    ArqDiscardRetry { cid: Cid, bsn: Bsn },
    ArqRxPurge { cid: Cid, bsn: Bsn },
    ArqSyncLoss { cid: Cid },
    /// T22
    ArqResetRetry { cid: Cid, reset: ArqResetType },
    ClassifierSweep,
}

pub trait Scheduler {
    fn now(&self) -> Duration;
    fn schedule(&mut self, delay: Duration, timer: MacTimer) -> TimerHandle;
    fn cancel(&mut self, handle: TimerHandle) -> bool;
}

/// Cancels the timer held in `slot`, if any, and clears the slot.
pub fn disarm(sched: &mut dyn Scheduler, slot: &mut Option<TimerHandle>) {
    if let Some(handle) = slot.take() {
        sched.cancel(handle);
    }
}

struct PendingTimer {
    fire_at: Duration,
    handle: TimerHandle,
    timer: MacTimer,
}

impl Ord for PendingTimer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.fire_at.cmp(&self.fire_at).then_with(|| other.handle.cmp(&self.handle))
    }
}
impl PartialOrd for PendingTimer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for PendingTimer {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}
impl Eq for PendingTimer {}

/// Deterministic single-node scheduler. Expiries come out ordered by time,
/// ties in arming order. Cancellation is lazy.
#[derive(Default)]
pub struct EventQueue {
    now: Duration,
    next_handle: u64,
    heap: BinaryHeap<PendingTimer>,
    live: HashSet<TimerHandle>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the clock forward. Time never runs backwards.
    pub fn set_now(&mut self, now: Duration) {
        if now > self.now {
            self.now = now;
        }
    }

    pub fn pending(&self) -> usize {
        self.live.len()
    }

    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.live.contains(&handle)
    }

    fn discard_cancelled(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.live.contains(&top.handle) {
                break;
            }
            self.heap.pop();
        }
    }

    pub fn next_expiry(&mut self) -> Option<Duration> {
        self.discard_cancelled();
        self.heap.peek().map(|t| t.fire_at)
    }

    /// Pops the earliest timer that is due at the current time.
    pub fn pop_due(&mut self) -> Option<(TimerHandle, MacTimer)> {
        self.discard_cancelled();
        if self.heap.peek()?.fire_at > self.now {
            return None;
        }
        let t = self.heap.pop()?;
        self.live.remove(&t.handle);
        Some((t.handle, t.timer))
    }

    /// Jumps the clock to the next expiry and pops it.
    pub fn advance(&mut self) -> Option<(TimerHandle, MacTimer)> {
        let at = self.next_expiry()?;
        self.set_now(at);
        self.pop_due()
    }

    /// Moves the clock to `until` and returns every timer due by then.
    pub fn drain_until(&mut self, until: Duration) -> Vec<(TimerHandle, MacTimer)> {
        self.set_now(until);
        let mut due = Vec::new();
        while let Some(t) = self.pop_due() {
            due.push(t);
        }
        due
    }
}

impl Scheduler for EventQueue {
    fn now(&self) -> Duration {
        self.now
    }

    fn schedule(&mut self, delay: Duration, timer: MacTimer) -> TimerHandle {
        self.next_handle += 1;
        let handle = TimerHandle(self.next_handle);
        self.heap.push(PendingTimer { fire_at: self.now + delay, handle, timer });
        self.live.insert(handle);
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.live.remove(&handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_order_and_ties() {
        let mut q = EventQueue::new();
        let late = q.schedule(Duration::from_millis(20), MacTimer::ClassifierSweep);
        let a = q.schedule(Duration::from_millis(10), MacTimer::ArqSyncLoss { cid: 1 });
        let b = q.schedule(Duration::from_millis(10), MacTimer::ArqSyncLoss { cid: 2 });

        assert_eq!(q.advance().map(|(h, _)| h), Some(a));
        assert_eq!(q.advance().map(|(h, _)| h), Some(b));
        assert_eq!(q.now(), Duration::from_millis(10));
        assert_eq!(q.advance().map(|(h, _)| h), Some(late));
        assert!(q.advance().is_none());
    }

    #[test]
    fn test_cancel_is_lazy_and_single_shot() {
        let mut q = EventQueue::new();
        let h = q.schedule(Duration::from_millis(5), MacTimer::ClassifierSweep);
        assert!(q.cancel(h));
        assert!(!q.cancel(h));
        assert_eq!(q.pending(), 0);
        assert!(q.next_expiry().is_none());
    }

    #[test]
    fn test_disarm_clears_slot() {
        let mut q = EventQueue::new();
        let mut slot = Some(q.schedule(Duration::from_secs(1), MacTimer::ClassifierSweep));
        disarm(&mut q, &mut slot);
        assert!(slot.is_none());
        assert!(q.drain_until(Duration::from_secs(2)).is_empty());
    }
}
