//! Convergence sublayer classifier
//!
//! Outbound packets are reduced to a [`ClassifierKey`] and matched against
//! an arena of classifier records, each of which names the service flow(s)
//! the packet belongs to. Records are never freed on teardown. They are
//! invalidated and removed by a later sweep so that traffic still in flight
//! on a stale route does not immediately spawn a new flow.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::time::Duration;

use log::{debug, trace};
use wimax_core::{MacAddress, ServiceType, StationType, BROADCAST_MAC};

use crate::packet::{NetworkType, PacketInfo};
use crate::timer::{MacTimer, Scheduler, TimerHandle};
use crate::MacConfig;

pub type CsfId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassifierKind {
    Unicast,
    /// One bucket per scheduling service.
    Multicast(ServiceType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassifierKey {
    pub kind: ClassifierKind,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub next_hop: MacAddress,
}

#[derive(Debug, Clone)]
pub struct ClassifierRecord {
    pub id: CsfId,
    pub key: ClassifierKey,
    pub service_type: ServiceType,
    /// Number of service flows bound to this record.
    pub ref_count: u32,
    pub invalidated_at: Option<Duration>,
}

impl ClassifierKey {
    /// What a live record is found by. Multicast keys match on their
    /// bucket alone.
    fn slot(&self) -> RecordSlot {
        match self.kind {
            ClassifierKind::Multicast(service) => RecordSlot::Multicast(service),
            ClassifierKind::Unicast => RecordSlot::Unicast(*self),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RecordSlot {
    Unicast(ClassifierKey),
    Multicast(ServiceType),
}

impl ClassifierRecord {
    pub fn is_valid(&self) -> bool {
        self.invalidated_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragmentKey {
    id: u32,
    protocol: u8,
    src: IpAddr,
    dst: IpAddr,
}

#[derive(Debug, Clone, Copy)]
struct FragmentPorts {
    src_port: u16,
    dst_port: u16,
    hold_until: Duration,
}

/// Remembers the transport ports of IP datagrams whose first fragment has
/// been seen, so that later fragments classify onto the same flow.
#[derive(Debug)]
pub struct FragmentClassifierMap {
    entries: HashMap<FragmentKey, FragmentPorts>,
    capacity: usize,
    hold: Duration,
}

impl FragmentClassifierMap {
    pub fn new(capacity: usize, hold: Duration) -> Self {
        Self { entries: HashMap::new(), capacity, hold }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ports to classify a fragment with. Unknown datagrams, and first
    /// fragments that find the map full of live entries, fall back to 0/0.
    pub fn ports_for(&mut self, info: &PacketInfo, now: Duration) -> (u16, u16) {
        let Some(frag) = info.fragment else {
            return (info.src_port, info.dst_port);
        };
        let key = FragmentKey { id: frag.id, protocol: info.protocol, src: info.src, dst: info.dst };

        if frag.is_first() {
            if self.entries.len() >= self.capacity {
                self.entries.retain(|_, v| now < v.hold_until);
                if self.entries.len() >= self.capacity {
                    debug!("fragment classifier map full, datagram {:#x} goes to the default bucket", frag.id);
                    return (0, 0);
                }
            }
            self.entries.insert(
                key,
                FragmentPorts { src_port: info.src_port, dst_port: info.dst_port, hold_until: now + self.hold },
            );
            return (info.src_port, info.dst_port);
        }

        match self.entries.get_mut(&key) {
            None => {
                trace!("fragment of unseen datagram {:#x}", frag.id);
                (0, 0)
            }
            Some(entry) => {
                entry.hold_until = now + self.hold;
                let ports = (entry.src_port, entry.dst_port);
                if !frag.more {
                    self.entries.remove(&key);
                }
                ports
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CsStats {
    pub packets_from_upper: u64,
    pub packets_classified: u64,
    pub packets_dropped: u64,
    pub packets_from_lower: u64,
    pub records_created: u64,
    pub records_removed: u64,
}

pub struct ConvergenceSublayer {
    records: BTreeMap<CsfId, ClassifierRecord>,
    /// Valid records only, at most one per slot.
    live: HashMap<RecordSlot, CsfId>,
    next_id: CsfId,
    fragments: FragmentClassifierMap,
    removal_delay: Duration,
    sweep_timer: Option<TimerHandle>,
    pub stats: CsStats,
}

impl ConvergenceSublayer {
    pub fn new(config: &MacConfig) -> Self {
        Self {
            records: BTreeMap::new(),
            live: HashMap::new(),
            next_id: 0,
            fragments: FragmentClassifierMap::new(
                config.fragment_classifier_capacity,
                config.ip_fragment_hold_time + config.fragment_hold_margin,
            ),
            removal_delay: config.classifier_removal_delay,
            sweep_timer: None,
            stats: CsStats::default(),
        }
    }

    /// Picks the multicast bucket for group traffic, or unicast.
    pub fn classifier_kind(
        info: &PacketInfo,
        next_hop: MacAddress,
        station: StationType,
        service: ServiceType,
    ) -> ClassifierKind {
        let broadcast = match info.network {
            NetworkType::Arp => true,
            NetworkType::Ipv4 => info.is_broadcast(),
            NetworkType::Ipv6 => next_hop == BROADCAST_MAC,
        };
        if broadcast {
            ClassifierKind::Multicast(ServiceType::NrtPs)
        } else if station == StationType::BaseStation && info.is_multicast() {
            ClassifierKind::Multicast(service)
        } else {
            ClassifierKind::Unicast
        }
    }

    pub fn build_key(
        &mut self,
        info: &PacketInfo,
        kind: ClassifierKind,
        next_hop: MacAddress,
        now: Duration,
    ) -> ClassifierKey {
        let (src_port, dst_port) = self.fragments.ports_for(info, now);
        ClassifierKey { kind, src: info.src, dst: info.dst, protocol: info.protocol, src_port, dst_port, next_hop }
    }

    /// Finds a live record. Multicast keys match on their bucket alone.
    pub fn lookup(&self, key: &ClassifierKey) -> Option<CsfId> {
        self.live.get(&key.slot()).copied()
    }

    /// Creates a record for `key`, or returns the live one already there.
    pub fn insert(&mut self, key: ClassifierKey, service_type: ServiceType) -> CsfId {
        if let Some(id) = self.lookup(&key) {
            return id;
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        debug!(
            "new classifier {id}: {:?} {}:{} -> {}:{} proto {} ({:?})",
            key.kind, key.src, key.src_port, key.dst, key.dst_port, key.protocol, service_type
        );
        self.records.insert(id, ClassifierRecord { id, key, service_type, ref_count: 0, invalidated_at: None });
        self.live.insert(key.slot(), id);
        self.stats.records_created += 1;
        id
    }

    pub fn record(&self, id: CsfId) -> Option<&ClassifierRecord> {
        self.records.get(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn fragment_map(&self) -> &FragmentClassifierMap {
        &self.fragments
    }

    pub fn attach(&mut self, id: CsfId) {
        if let Some(r) = self.records.get_mut(&id) {
            r.ref_count += 1;
        }
    }

    /// Drops one flow's reference; the last one invalidates the record.
    pub fn release(&mut self, id: CsfId, sched: &mut dyn Scheduler) {
        let Some(r) = self.records.get_mut(&id) else {
            return;
        };
        r.ref_count = r.ref_count.saturating_sub(1);
        if r.ref_count == 0 {
            self.invalidate(id, sched);
        }
    }

    pub fn invalidate(&mut self, id: CsfId, sched: &mut dyn Scheduler) {
        let now = sched.now();
        let Some(r) = self.records.get_mut(&id) else {
            return;
        };
        if r.invalidated_at.is_some() {
            return;
        }
        r.invalidated_at = Some(now);
        r.ref_count = 0;
        let slot = r.key.slot();
        if self.live.get(&slot) == Some(&id) {
            self.live.remove(&slot);
        }
        trace!("classifier {id} invalidated");
        if self.sweep_timer.is_none() {
            self.sweep_timer = Some(sched.schedule(self.removal_delay, MacTimer::ClassifierSweep));
        }
    }

    /// Removes records invalidated at least `removal_delay` ago and re-arms
    /// for the next one due. Returns the number removed.
    pub fn handle_sweep(&mut self, handle: TimerHandle, sched: &mut dyn Scheduler) -> usize {
        if self.sweep_timer != Some(handle) {
            return 0;
        }
        self.sweep_timer = None;
        let now = sched.now();
        let delay = self.removal_delay;
        let before = self.records.len();
        self.records.retain(|_, r| r.invalidated_at.map_or(true, |t| t + delay > now));
        let removed = before - self.records.len();
        self.stats.records_removed += removed as u64;

        if let Some(next_due) = self.records.values().filter_map(|r| r.invalidated_at).map(|t| t + delay).min() {
            self.sweep_timer = Some(sched.schedule(next_due.saturating_sub(now), MacTimer::ClassifierSweep));
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{parse_packet, ipv4_udp, ipv4_udp_fragments, IpFragment};
    use crate::timer::EventQueue;
    use std::net::Ipv4Addr;

    const HOP: MacAddress = [2, 0, 0, 0, 0, 1];

    fn cs() -> ConvergenceSublayer {
        ConvergenceSublayer::new(&MacConfig::default())
    }

    fn udp_info(sport: u16) -> PacketInfo {
        let pkt = ipv4_udp(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), sport, 80, 0, 40);
        parse_packet(&pkt, NetworkType::Ipv4).unwrap()
    }

    #[test]
    fn test_same_tuple_same_record() {
        let mut cs = cs();
        let info = udp_info(1000);
        let k1 = cs.build_key(&info, ClassifierKind::Unicast, HOP, Duration::ZERO);
        assert!(cs.lookup(&k1).is_none());
        let id = cs.insert(k1, ServiceType::Be);

        let k2 = cs.build_key(&udp_info(1000), ClassifierKind::Unicast, HOP, Duration::ZERO);
        assert_eq!(cs.lookup(&k2), Some(id));

        let other = cs.build_key(&udp_info(1001), ClassifierKind::Unicast, HOP, Duration::ZERO);
        assert_eq!(cs.lookup(&other), None);
    }

    #[test]
    fn test_invalidated_record_not_reused_then_swept() {
        let mut q = EventQueue::new();
        let mut cs = cs();
        let key = cs.build_key(&udp_info(1000), ClassifierKind::Unicast, HOP, q.now());
        let id = cs.insert(key, ServiceType::Be);
        cs.attach(id);
        cs.release(id, &mut q);
        assert!(!cs.record(id).unwrap().is_valid());

        // within the grace period: a new record, not the stale one
        q.set_now(Duration::from_secs(1));
        assert_eq!(cs.lookup(&key), None);
        let fresh = cs.insert(key, ServiceType::Be);
        assert_ne!(fresh, id);
        assert_eq!(cs.len(), 2);

        let due = q.drain_until(Duration::from_secs(10));
        assert_eq!(due.len(), 1);
        let (h, timer) = due[0];
        assert_eq!(timer, MacTimer::ClassifierSweep);
        assert_eq!(cs.handle_sweep(h, &mut q), 1);
        assert!(cs.record(id).is_none());
        assert_eq!(cs.lookup(&key), Some(fresh));
    }

    #[test]
    fn test_shared_record_survives_until_last_release() {
        let mut q = EventQueue::new();
        let mut cs = cs();
        let key = cs.build_key(&udp_info(5), ClassifierKind::Multicast(ServiceType::Ugs), HOP, q.now());
        let id = cs.insert(key, ServiceType::Ugs);
        cs.attach(id);
        cs.attach(id);
        cs.release(id, &mut q);
        assert!(cs.record(id).unwrap().is_valid());
        cs.release(id, &mut q);
        assert!(!cs.record(id).unwrap().is_valid());
        assert_eq!(q.pending(), 1);
    }

    #[test]
    fn test_multicast_matches_by_bucket() {
        let mut cs = cs();
        let kind = ClassifierKind::Multicast(ServiceType::RtPs);
        let a = cs.build_key(&udp_info(1), kind, BROADCAST_MAC, Duration::ZERO);
        let id = cs.insert(a, ServiceType::RtPs);
        let b = cs.build_key(&udp_info(2), kind, BROADCAST_MAC, Duration::ZERO);
        assert_eq!(cs.lookup(&b), Some(id));
        let c = cs.build_key(&udp_info(2), ClassifierKind::Multicast(ServiceType::Be), BROADCAST_MAC, Duration::ZERO);
        assert_eq!(cs.lookup(&c), None);
    }

    #[test]
    fn test_one_live_record_per_tuple() {
        let mut q = EventQueue::new();
        let mut cs = cs();
        let key = cs.build_key(&udp_info(1000), ClassifierKind::Unicast, HOP, q.now());
        let id = cs.insert(key, ServiceType::Be);
        assert_eq!(cs.insert(key, ServiceType::Ugs), id);
        assert_eq!(cs.len(), 1);

        cs.invalidate(id, &mut q);
        let fresh = cs.insert(key, ServiceType::Be);
        assert_ne!(fresh, id);
        // invalidating the stale record again leaves the fresh one findable
        cs.invalidate(id, &mut q);
        assert_eq!(cs.lookup(&key), Some(fresh));
    }

    #[test]
    fn test_kind_selection() {
        let mut info = udp_info(1);
        assert_eq!(
            ConvergenceSublayer::classifier_kind(&info, HOP, StationType::BaseStation, ServiceType::Ugs),
            ClassifierKind::Unicast
        );
        info.dst = IpAddr::V4(Ipv4Addr::BROADCAST);
        assert_eq!(
            ConvergenceSublayer::classifier_kind(&info, HOP, StationType::Subscriber, ServiceType::Ugs),
            ClassifierKind::Multicast(ServiceType::NrtPs)
        );
        info.dst = IpAddr::V4(Ipv4Addr::new(224, 0, 0, 9));
        assert_eq!(
            ConvergenceSublayer::classifier_kind(&info, HOP, StationType::BaseStation, ServiceType::Ugs),
            ClassifierKind::Multicast(ServiceType::Ugs)
        );
        assert_eq!(
            ConvergenceSublayer::classifier_kind(&info, HOP, StationType::Subscriber, ServiceType::Ugs),
            ClassifierKind::Unicast
        );
    }

    #[test]
    fn test_fragments_follow_first_fragment_ports() {
        let mut cs = cs();
        let frags = ipv4_udp_fragments(Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2), 4000, 53, 77, 200, 64);
        let infos: Vec<_> = frags.iter().map(|f| parse_packet(f, NetworkType::Ipv4).unwrap()).collect();
        let keys: Vec<_> =
            infos.iter().map(|i| cs.build_key(i, ClassifierKind::Unicast, HOP, Duration::ZERO)).collect();
        assert!(keys.iter().all(|k| (k.src_port, k.dst_port) == (4000, 53)));
        assert!(cs.fragment_map().is_empty());
    }

    #[test]
    fn test_unseen_or_overflowing_fragments_fall_back_to_zero_ports() {
        let mut map = FragmentClassifierMap::new(1, Duration::from_secs(31));
        let mut info = udp_info(9);
        info.fragment = Some(IpFragment { id: 1, offset: 10, more: false });
        assert_eq!(map.ports_for(&info, Duration::ZERO), (0, 0));

        info.fragment = Some(IpFragment { id: 2, offset: 0, more: true });
        assert_eq!(map.ports_for(&info, Duration::ZERO), (9, 80));
        info.fragment = Some(IpFragment { id: 3, offset: 0, more: true });
        assert_eq!(map.ports_for(&info, Duration::from_secs(1)), (0, 0));

        // the stale entry is evicted once its hold time has passed
        assert_eq!(map.ports_for(&info, Duration::from_secs(40)), (9, 80));
        assert_eq!(map.len(), 1);
    }
}
