//! Service flows and the table that owns them

use std::collections::{BTreeMap, VecDeque};

use wimax_core::{
    ArqParameters, Cid, FlowDirection, FlowInitiation, MacAddress, QosParameters, ServiceType, Sfid, TransactionId,
};

use crate::arq::ArqControl;
use crate::classifier::CsfId;
use crate::dsx::{ClassifierRule, DsxTransaction};
use crate::fragment::{Fragmenter, Reassembler};
use crate::packet::Sdu;

/// Local handle of a flow, stable for its whole life. SFID and CID are
/// only known once the DSA exchange has assigned them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    /// DSA in progress
    Adding,
    Active,
    /// DSD in progress
    Deleting,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowStats {
    pub sdus_queued: u64,
    pub sdus_sent: u64,
    pub sdus_delivered: u64,
    pub bytes_sent: u64,
    pub bytes_delivered: u64,
    pub sdus_dropped: u64,
}

#[derive(Debug)]
pub struct ServiceFlow {
    pub id: FlowId,
    pub sfid: Option<Sfid>,
    pub cid: Option<Cid>,
    /// BS side: the subscriber. SS side: the base station.
    pub peer: MacAddress,
    pub direction: FlowDirection,
    pub initiation: FlowInitiation,
    pub status: FlowStatus,
    pub service_type: ServiceType,
    pub qos: QosParameters,
    /// QoS a DSC in progress is trying to install.
    pub pending_qos: Option<QosParameters>,
    pub classifier: Option<ClassifierRule>,
    pub csf: Option<CsfId>,
    pub fixed_sdu_size: Option<u8>,
    pub arq_params: Option<ArqParameters>,
    pub arq: Option<ArqControl>,
    pub fragmenter: Fragmenter,
    pub reassembler: Reassembler,
    pub queue: VecDeque<Sdu>,
    pub dsx: DsxTransaction,
    pub stats: FlowStats,
}

impl ServiceFlow {
    pub fn new(
        id: FlowId,
        peer: MacAddress,
        direction: FlowDirection,
        initiation: FlowInitiation,
        service_type: ServiceType,
        qos: QosParameters,
    ) -> Self {
        Self {
            id,
            sfid: None,
            cid: None,
            peer,
            direction,
            initiation,
            status: FlowStatus::Adding,
            service_type,
            qos,
            pending_qos: None,
            classifier: None,
            csf: None,
            fixed_sdu_size: None,
            arq_params: None,
            arq: None,
            fragmenter: Fragmenter::new(),
            reassembler: Reassembler::new(),
            queue: VecDeque::new(),
            dsx: DsxTransaction::default(),
            stats: FlowStats::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == FlowStatus::Active
    }

    pub fn queued_bytes(&self) -> usize {
        self.queue.iter().map(Sdu::len).sum::<usize>() + self.fragmenter.partial_bytes()
    }
}

#[derive(Debug, Default)]
pub struct ServiceFlowTable {
    flows: BTreeMap<FlowId, ServiceFlow>,
    next_id: u32,
}

impl ServiceFlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> FlowId {
        self.next_id = self.next_id.wrapping_add(1);
        FlowId(self.next_id)
    }

    pub fn insert(&mut self, flow: ServiceFlow) -> FlowId {
        let id = flow.id;
        self.flows.insert(id, flow);
        id
    }

    pub fn get(&self, id: FlowId) -> Option<&ServiceFlow> {
        self.flows.get(&id)
    }

    pub fn get_mut(&mut self, id: FlowId) -> Option<&mut ServiceFlow> {
        self.flows.get_mut(&id)
    }

    pub fn remove(&mut self, id: FlowId) -> Option<ServiceFlow> {
        self.flows.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceFlow> {
        self.flows.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ServiceFlow> {
        self.flows.values_mut()
    }

    pub fn ids(&self) -> Vec<FlowId> {
        self.flows.keys().copied().collect()
    }

    pub fn by_cid(&self, cid: Cid) -> Option<FlowId> {
        self.flows.values().find(|f| f.cid == Some(cid)).map(|f| f.id)
    }

    pub fn by_sfid(&self, sfid: Sfid) -> Option<FlowId> {
        self.flows.values().find(|f| f.sfid == Some(sfid)).map(|f| f.id)
    }

    /// Every flow bound to a classifier record. Group records fan out to
    /// one flow per subscriber.
    pub fn by_csf(&self, csf: CsfId) -> Vec<FlowId> {
        self.flows.values().filter(|f| f.csf == Some(csf)).map(|f| f.id).collect()
    }

    /// Transaction ids are only unique per peer: subscribers draw from the
    /// same half of the space.
    pub fn by_transaction(&self, peer: MacAddress, transaction_id: TransactionId) -> Option<FlowId> {
        self.flows.values().find(|f| f.peer == peer && f.dsx.matches(transaction_id)).map(|f| f.id)
    }

    pub fn flows_of(&self, peer: MacAddress) -> Vec<FlowId> {
        self.flows.values().filter(|f| f.peer == peer).map(|f| f.id).collect()
    }

    pub fn count_for_peer(&self, peer: MacAddress) -> usize {
        self.flows.values().filter(|f| f.peer == peer).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsx::DsxKind;

    const SS: MacAddress = [2, 0, 0, 0, 0, 9];

    fn flow(table: &mut ServiceFlowTable, peer: MacAddress) -> FlowId {
        let id = table.next_id();
        table.insert(ServiceFlow::new(
            id,
            peer,
            FlowDirection::Downlink,
            FlowInitiation::Local,
            ServiceType::Be,
            QosParameters::default(),
        ))
    }

    #[test]
    fn test_lookups() {
        let mut table = ServiceFlowTable::new();
        let a = flow(&mut table, SS);
        let b = flow(&mut table, SS);
        let c = flow(&mut table, [2, 0, 0, 0, 0, 10]);
        assert_ne!(a, b);

        table.get_mut(a).unwrap().cid = Some(401);
        table.get_mut(b).unwrap().sfid = Some(7);
        table.get_mut(b).unwrap().csf = Some(3);
        table.get_mut(c).unwrap().csf = Some(3);
        table.get_mut(c).unwrap().dsx.begin(DsxKind::Add, 0x8001, 3);

        assert_eq!(table.by_cid(401), Some(a));
        assert_eq!(table.by_sfid(7), Some(b));
        assert_eq!(table.by_csf(3), vec![b, c]);
        assert_eq!(table.by_transaction([2, 0, 0, 0, 0, 10], 0x8001), Some(c));
        assert_eq!(table.by_transaction(SS, 0x8001), None);
        assert_eq!(table.count_for_peer(SS), 2);
        assert_eq!(table.flows_of(SS), vec![a, b]);

        assert!(table.remove(a).is_some());
        assert_eq!(table.by_cid(401), None);
        assert_eq!(table.len(), 2);
    }
}
