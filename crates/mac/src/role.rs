//! What differs between a base station and a subscriber
//!
//! The engine is written once against [`StationRole`]. The base station
//! owns the identifier spaces and knows its subscribers; a subscriber only
//! knows its base station and the basic CID it was given.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Add;

use log::info;
use wimax_core::constants::{
    BASIC_CID_END, BASIC_CID_START, BS_TRANSACTION_ID_END, BS_TRANSACTION_ID_START, PRIMARY_CID_START,
    SS_TRANSACTION_ID_END, SS_TRANSACTION_ID_START, TRANSPORT_CID_END, TRANSPORT_CID_START,
};
use wimax_core::{Cid, FlowDirection, MacAddress, Sfid, StationType, TransactionId};

use crate::MacError;

pub trait StationRole {
    fn station_type(&self) -> StationType;

    fn address(&self) -> MacAddress;

    /// Next id from this side's half of the transaction space.
    fn next_transaction_id(&mut self) -> TransactionId;

    /// Basic CID management messages for `peer` travel on.
    fn management_cid(&self, peer: MacAddress) -> Option<Cid>;

    /// Peer behind a management CID.
    fn peer_for_cid(&self, cid: Cid) -> Option<MacAddress>;

    /// Peers a packet for `next_hop` goes to. Group traffic fans out.
    fn peers_for(&self, next_hop: MacAddress, group: bool) -> Vec<MacAddress>;

    /// Direction of the flows this side transmits on.
    fn outbound_direction(&self) -> FlowDirection;

    /// SFID and transport CID for a new flow, if this side assigns them.
    fn allocate_flow(&mut self) -> Result<Option<(Sfid, Cid)>, MacError>;

    /// Hands a removed flow's identifiers back for reuse.
    fn release_flow(&mut self, sfid: Sfid, cid: Cid);
}

fn next_in_range(counter: &mut TransactionId, start: TransactionId, end: TransactionId) -> TransactionId {
    let id = *counter;
    *counter = if id >= end { start } else { id + 1 };
    id
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberEntry {
    pub basic_cid: Cid,
    pub primary_cid: Cid,
}

#[derive(Debug)]
pub struct BaseStationRole {
    address: MacAddress,
    subscribers: BTreeMap<MacAddress, SubscriberEntry>,
    next_basic_cid: Cid,
    transport_cids: IdPool<Cid>,
    sfids: IdPool<Sfid>,
    next_transaction_id: TransactionId,
}

impl BaseStationRole {
    pub fn new(address: MacAddress) -> Self {
        Self {
            address,
            subscribers: BTreeMap::new(),
            next_basic_cid: BASIC_CID_START,
            transport_cids: IdPool::new(TRANSPORT_CID_START, TRANSPORT_CID_END),
            sfids: IdPool::new(1, Sfid::MAX),
            next_transaction_id: BS_TRANSACTION_ID_START,
        }
    }

    /// Admits a subscriber and hands out its management CIDs. Registering
    /// the same address twice returns the entry it already has.
    pub fn register_subscriber(&mut self, mac: MacAddress) -> Result<SubscriberEntry, MacError> {
        if let Some(entry) = self.subscribers.get(&mac) {
            return Ok(*entry);
        }
        let in_use = |cid: Cid, subs: &BTreeMap<MacAddress, SubscriberEntry>| subs.values().any(|e| e.basic_cid == cid);
        let mut cid = self.next_basic_cid;
        for _ in BASIC_CID_START..=BASIC_CID_END {
            if !in_use(cid, &self.subscribers) {
                break;
            }
            cid = if cid >= BASIC_CID_END { BASIC_CID_START } else { cid + 1 };
        }
        if in_use(cid, &self.subscribers) {
            return Err(MacError::CidExhausted);
        }
        self.next_basic_cid = if cid >= BASIC_CID_END { BASIC_CID_START } else { cid + 1 };

        let entry = SubscriberEntry { basic_cid: cid, primary_cid: cid + PRIMARY_CID_START - BASIC_CID_START };
        self.subscribers.insert(mac, entry);
        info!("subscriber {} registered with basic CID {}", hex::encode(mac), cid);
        Ok(entry)
    }

    pub fn deregister_subscriber(&mut self, mac: MacAddress) -> Option<SubscriberEntry> {
        self.subscribers.remove(&mac)
    }

    pub fn subscriber(&self, mac: MacAddress) -> Option<&SubscriberEntry> {
        self.subscribers.get(&mac)
    }

    pub fn subscribers(&self) -> impl Iterator<Item = MacAddress> + '_ {
        self.subscribers.keys().copied()
    }

    /// Transport CIDs held by live flows.
    pub fn transport_cids_in_use(&self) -> usize {
        self.transport_cids.len()
    }
}

/// Identifiers handed out lowest first and taken back when a flow goes.
/// Everything below `cursor` is in use.
#[derive(Debug)]
struct IdPool<T> {
    used: BTreeSet<T>,
    cursor: T,
    end: T,
}

impl<T> IdPool<T>
where
    T: Copy + Ord + Add<Output = T> + From<u8>,
{
    fn new(start: T, end: T) -> Self {
        Self { used: BTreeSet::new(), cursor: start, end }
    }

    fn take(&mut self) -> Option<T> {
        let mut id = self.cursor;
        while self.used.contains(&id) {
            if id >= self.end {
                return None;
            }
            id = id + T::from(1);
        }
        self.used.insert(id);
        self.cursor = id;
        Some(id)
    }

    fn give_back(&mut self, id: T) {
        if self.used.remove(&id) && id < self.cursor {
            self.cursor = id;
        }
    }

    fn len(&self) -> usize {
        self.used.len()
    }
}

impl StationRole for BaseStationRole {
    fn station_type(&self) -> StationType {
        StationType::BaseStation
    }

    fn address(&self) -> MacAddress {
        self.address
    }

    fn next_transaction_id(&mut self) -> TransactionId {
        next_in_range(&mut self.next_transaction_id, BS_TRANSACTION_ID_START, BS_TRANSACTION_ID_END)
    }

    fn management_cid(&self, peer: MacAddress) -> Option<Cid> {
        self.subscribers.get(&peer).map(|e| e.basic_cid)
    }

    fn peer_for_cid(&self, cid: Cid) -> Option<MacAddress> {
        self.subscribers
            .iter()
            .find(|(_, e)| e.basic_cid == cid || e.primary_cid == cid)
            .map(|(mac, _)| *mac)
    }

    fn peers_for(&self, next_hop: MacAddress, group: bool) -> Vec<MacAddress> {
        if group {
            self.subscribers.keys().copied().collect()
        } else if self.subscribers.contains_key(&next_hop) {
            vec![next_hop]
        } else {
            Vec::new()
        }
    }

    fn outbound_direction(&self) -> FlowDirection {
        FlowDirection::Downlink
    }

    fn allocate_flow(&mut self) -> Result<Option<(Sfid, Cid)>, MacError> {
        let cid = self.transport_cids.take().ok_or(MacError::CidExhausted)?;
        let Some(sfid) = self.sfids.take() else {
            self.transport_cids.give_back(cid);
            return Err(MacError::CidExhausted);
        };
        Ok(Some((sfid, cid)))
    }

    fn release_flow(&mut self, sfid: Sfid, cid: Cid) {
        self.transport_cids.give_back(cid);
        self.sfids.give_back(sfid);
    }
}

#[derive(Debug)]
pub struct SubscriberRole {
    address: MacAddress,
    base_station: MacAddress,
    basic_cid: Cid,
    next_transaction_id: TransactionId,
}

impl SubscriberRole {
    pub fn new(address: MacAddress, base_station: MacAddress, basic_cid: Cid) -> Self {
        Self { address, base_station, basic_cid, next_transaction_id: SS_TRANSACTION_ID_START }
    }

    pub fn base_station(&self) -> MacAddress {
        self.base_station
    }

    pub fn basic_cid(&self) -> Cid {
        self.basic_cid
    }
}

impl StationRole for SubscriberRole {
    fn station_type(&self) -> StationType {
        StationType::Subscriber
    }

    fn address(&self) -> MacAddress {
        self.address
    }

    fn next_transaction_id(&mut self) -> TransactionId {
        next_in_range(&mut self.next_transaction_id, SS_TRANSACTION_ID_START, SS_TRANSACTION_ID_END)
    }

    fn management_cid(&self, peer: MacAddress) -> Option<Cid> {
        (peer == self.base_station).then_some(self.basic_cid)
    }

    fn peer_for_cid(&self, cid: Cid) -> Option<MacAddress> {
        let primary = self.basic_cid + PRIMARY_CID_START - BASIC_CID_START;
        (cid == self.basic_cid || cid == primary).then_some(self.base_station)
    }

    fn peers_for(&self, _next_hop: MacAddress, _group: bool) -> Vec<MacAddress> {
        vec![self.base_station]
    }

    fn outbound_direction(&self) -> FlowDirection {
        FlowDirection::Uplink
    }

    fn allocate_flow(&mut self) -> Result<Option<(Sfid, Cid)>, MacError> {
        Ok(None)
    }

    fn release_flow(&mut self, _sfid: Sfid, _cid: Cid) {}
}
