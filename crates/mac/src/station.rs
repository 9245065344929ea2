//! One MAC instance, base station or subscriber
//!
//! [`MacStation`] owns the convergence sublayer, the service flow table and
//! every per-flow state machine. It is driven from outside through four
//! entry points: packets from the upper layer ([`MacStation::classify`]),
//! PDUs from the air ([`MacStation::receive_pdu`]), timer expiries
//! ([`MacStation::handle_timer`]) and transmit opportunities
//! ([`MacStation::pull_pdus`]). Everything it wants to send lands in an
//! outbox the caller drains.

use std::collections::VecDeque;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use wimax_core::constants::{
    BASIC_CID_START, FRAGMENTED_MAX_FIXED_LENGTH_PACKET_SIZE, MAC_HEADER_SIZE, MAX_PDU_SIZE, PRIMARY_CID_END,
};
use wimax_core::{
    ArqParameters, Cid, CodecError, ConfirmCode, FlowDirection, FlowInitiation, FragSubheader, MacAddress,
    MacHeader, MgmtMessageType, PduTag, QosParameters, ServiceType, Sfid, TransactionId,
};

use crate::arq::{convert_param, ArqControl, ArqDirection, ArqMessage, ArqOutput, ArqStats};
use crate::classifier::{ClassifierKind, ConvergenceSublayer, CsStats, CsfId};
use crate::dsx::messages::{
    build_dsa_req, build_dsa_rsp, build_dsc_req, build_dsd_req, build_dsd_rsp, build_dsx_confirm,
};
use crate::dsx::{self, ClassifierRule, DsxKind, DsxMessage, DsxState, FlowRequest, FlowTlvs};
use crate::fragment::{DataPdu, PduUnit, ReassemblyStats};
use crate::packet::{parse_packet, OutboundPacket, PacketInfo, Sdu, IPPROTO_UDP};
use crate::qos::{QosResolver, ResolvedQos};
use crate::role::{BaseStationRole, StationRole, SubscriberEntry};
use crate::service_flow::{FlowId, FlowStatus, ServiceFlow, ServiceFlowTable};
use crate::timer::{DsxTimer, MacTimer, Scheduler, TimerHandle};
use crate::{MacConfig, MacError};

/// A PDU ready for the air. Tags ride beside the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPdu {
    pub peer: MacAddress,
    pub bytes: Bytes,
    pub tags: Vec<PduTag>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredSdu {
    pub sdu: Sdu,
    pub cid: Cid,
    pub source: MacAddress,
}

/// A packet offered to the MAC is always consumed; `dropped` tells whether
/// it made it onto at least one flow queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifyOutcome {
    pub handled: bool,
    pub dropped: bool,
    pub csf: Option<CsfId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MacStats {
    pub cs: CsStats,
    pub mgmt_sent: u64,
    pub mgmt_received: u64,
    pub data_pdus_sent: u64,
    pub data_pdus_received: u64,
    pub sdus_delivered: u64,
    pub flows_created: u64,
    pub flows_deleted: u64,
    pub dsx_abandoned: u64,
    pub arq: ArqStats,
    pub reassembly: ReassemblyStats,
}

fn activate(flow: &mut ServiceFlow, outbound: FlowDirection) {
    flow.status = FlowStatus::Active;
    if let (Some(params), Some(cid)) = (flow.arq_params, flow.cid) {
        let direction = if flow.direction == outbound { ArqDirection::Tx } else { ArqDirection::Rx };
        flow.arq = Some(ArqControl::new(cid, direction, params));
    }
    info!(
        "service flow SFID {:?} CID {:?} ({:?}, {:?}) active{}",
        flow.sfid,
        flow.cid,
        flow.direction,
        flow.service_type,
        if flow.arq.is_some() { " with ARQ" } else { "" }
    );
}

/// Fills one PDU from an ARQ window: a single run, or as many runs as fit
/// when packing.
fn build_arq_pdu(
    arq: &mut ArqControl,
    cid: Cid,
    burst: usize,
    packing: bool,
    crc_size: usize,
    sched: &mut dyn Scheduler,
) -> Option<DataPdu> {
    let mut room = burst.min(MAX_PDU_SIZE).checked_sub(MAC_HEADER_SIZE + crc_size)?;
    let sub = DataPdu::subheader_size(true, packing);
    let mut units = Vec::new();
    while room > sub {
        let Some(seg) = arq.next_segment(room - sub, sched) else { break };
        room -= sub + seg.payload.len();
        units.push(PduUnit { fc: seg.fc, sequence: seg.bsn, payload: seg.payload, tag: seg.tag });
        if !packing {
            break;
        }
    }
    if units.is_empty() {
        return None;
    }
    Some(DataPdu { cid, extended: true, packed: packing, units })
}

pub struct MacStation<R: StationRole> {
    config: MacConfig,
    role: R,
    cs: ConvergenceSublayer,
    qos: QosResolver,
    flows: ServiceFlowTable,
    /// ARQ parameters offered on flows this side opens.
    arq_params: ArqParameters,
    outbox: VecDeque<OutboundPdu>,
    delivered: Vec<DeliveredSdu>,
    stats: MacStats,
}

impl<R: StationRole> MacStation<R> {
    /// Fails when the frame duration cannot drive the ARQ timers.
    pub fn new(config: MacConfig, role: R) -> Result<Self, MacError> {
        let arq_params = convert_param(&config.arq, config.frame_duration)?;
        let cs = ConvergenceSublayer::new(&config);
        let qos = QosResolver::new(config.station_class, &config.tos_service_map);
        Ok(Self {
            config,
            role,
            cs,
            qos,
            flows: ServiceFlowTable::new(),
            arq_params,
            outbox: VecDeque::new(),
            delivered: Vec::new(),
            stats: MacStats::default(),
        })
    }

    pub fn config(&self) -> &MacConfig {
        &self.config
    }

    pub fn role(&self) -> &R {
        &self.role
    }

    pub fn address(&self) -> MacAddress {
        self.role.address()
    }

    pub fn classifier(&self) -> &ConvergenceSublayer {
        &self.cs
    }

    pub fn flows(&self) -> &ServiceFlowTable {
        &self.flows
    }

    pub fn flow(&self, id: FlowId) -> Option<&ServiceFlow> {
        self.flows.get(id)
    }

    pub fn take_outbox(&mut self) -> Vec<OutboundPdu> {
        self.outbox.drain(..).collect()
    }

    pub fn take_delivered(&mut self) -> Vec<DeliveredSdu> {
        std::mem::take(&mut self.delivered)
    }

    /// Counters, including those of live flows.
    pub fn stats(&self) -> MacStats {
        let mut stats = self.stats;
        stats.cs = self.cs.stats;
        for flow in self.flows.iter() {
            if let Some(arq) = &flow.arq {
                stats.arq.merge(arq.stats());
            }
            stats.reassembly.merge(&flow.reassembler.stats);
        }
        stats
    }

    fn send_mgmt(&mut self, peer: MacAddress, bytes: Bytes) {
        self.stats.mgmt_sent += 1;
        trace!("management PDU to {}: {}", hex::encode(peer), hex::encode(&bytes));
        self.outbox.push_back(OutboundPdu { peer, bytes, tags: Vec::new() });
    }

    fn mgmt_cid(&self, peer: MacAddress) -> Result<Cid, MacError> {
        self.role.management_cid(peer).ok_or(MacError::UnknownSubscriber(peer))
    }

    // ---- convergence sublayer ----

    /// Maps a packet from the upper layer onto its service flow(s), opening
    /// new flows on a classifier miss.
    pub fn classify(&mut self, packet: OutboundPacket, sched: &mut dyn Scheduler) -> ClassifyOutcome {
        self.cs.stats.packets_from_upper += 1;
        let info = match parse_packet(&packet.sdu.payload, packet.network) {
            Ok(info) => info,
            Err(e) => {
                debug!("dropping unclassifiable packet: {e}");
                return self.drop_packet(None);
            }
        };

        let resolved = self.qos.resolve(info.tos, packet.app, packet.sdu.len() as u32);
        let kind = ConvergenceSublayer::classifier_kind(
            &info,
            packet.next_hop,
            self.role.station_type(),
            resolved.service_type,
        );
        let mut key = self.cs.build_key(&info, kind, packet.next_hop, sched.now());
        if let (Some(port), None) = (resolved.source_port, info.fragment) {
            key.src_port = port;
        }

        let csf = match self.cs.lookup(&key) {
            Some(csf) => csf,
            None => {
                let csf = self.cs.insert(key, resolved.service_type);
                if !self.open_flows(csf, &info, &resolved, sched) {
                    self.cs.invalidate(csf, sched);
                    return self.drop_packet(Some(csf));
                }
                csf
            }
        };

        let flows = self.flows.by_csf(csf);
        if flows.is_empty() {
            debug!("classifier {csf} has no flows left");
            self.cs.invalidate(csf, sched);
            return self.drop_packet(Some(csf));
        }

        let mut queued = 0;
        for id in flows {
            if info.fragment.is_none() {
                self.maybe_change(id, &resolved.params, sched);
            }
            if self.enqueue(id, packet.sdu.clone()) {
                queued += 1;
            }
        }
        if queued == 0 {
            return self.drop_packet(Some(csf));
        }
        self.cs.stats.packets_classified += 1;
        ClassifyOutcome { handled: true, dropped: false, csf: Some(csf) }
    }

    fn drop_packet(&mut self, csf: Option<CsfId>) -> ClassifyOutcome {
        self.cs.stats.packets_dropped += 1;
        ClassifyOutcome { handled: true, dropped: true, csf }
    }

    fn enqueue(&mut self, id: FlowId, sdu: Sdu) -> bool {
        let max = self.config.max_queue_len;
        let Some(flow) = self.flows.get_mut(id) else { return false };
        if flow.status == FlowStatus::Deleting || flow.queue.len() >= max {
            trace!("flow {:?} not accepting packets ({:?}, {} queued)", id, flow.status, flow.queue.len());
            flow.stats.sdus_dropped += 1;
            return false;
        }
        flow.queue.push_back(sdu);
        flow.stats.sdus_queued += 1;
        true
    }

    fn fixed_sdu_size(&self, info: &PacketInfo, qos: &QosParameters) -> Option<u8> {
        let fits = self.config.packing_enabled
            && info.protocol == IPPROTO_UDP
            && qos.min_pkt_size == qos.max_pkt_size
            && qos.max_pkt_size <= FRAGMENTED_MAX_FIXED_LENGTH_PACKET_SIZE;
        fits.then_some(qos.max_pkt_size as u8)
    }

    /// Opens one flow per peer the record serves. Returns whether any
    /// transaction started.
    fn open_flows(&mut self, csf: CsfId, info: &PacketInfo, resolved: &ResolvedQos, sched: &mut dyn Scheduler) -> bool {
        let Some(record) = self.cs.record(csf) else { return false };
        let key = record.key;
        let group = matches!(key.kind, ClassifierKind::Multicast(_));
        let rule = ClassifierRule {
            protocol: key.protocol,
            src: key.src,
            dst: key.dst,
            src_port: key.src_port,
            dst_port: key.dst_port,
        };
        let fixed = self.fixed_sdu_size(info, &resolved.params);

        let mut opened = 0;
        for peer in self.role.peers_for(key.next_hop, group) {
            match self.start_dsa(peer, resolved, rule, fixed, csf, sched) {
                Ok(_) => {
                    self.cs.attach(csf);
                    opened += 1;
                }
                Err(e) => warn!("cannot open a service flow to {}: {e}", hex::encode(peer)),
            }
        }
        if opened == 0 {
            debug!("no service flow could be opened for classifier {csf}");
        }
        opened > 0
    }

    // ---- DSx initiator ----

    fn start_dsa(
        &mut self,
        peer: MacAddress,
        resolved: &ResolvedQos,
        rule: ClassifierRule,
        fixed: Option<u8>,
        csf: CsfId,
        sched: &mut dyn Scheduler,
    ) -> Result<FlowId, MacError> {
        let mgmt_cid = self.mgmt_cid(peer)?;
        if self.flows.count_for_peer(peer) >= self.config.max_flows_per_subscriber {
            return Err(MacError::FlowLimit);
        }
        let ids = self.role.allocate_flow()?;
        let id = self.flows.next_id();
        let mut flow = ServiceFlow::new(
            id,
            peer,
            self.role.outbound_direction(),
            FlowInitiation::Local,
            resolved.service_type,
            resolved.params,
        );
        flow.sfid = ids.map(|(sfid, _)| sfid);
        flow.cid = ids.map(|(_, cid)| cid);
        flow.classifier = Some(rule);
        flow.csf = Some(csf);
        flow.fixed_sdu_size = fixed;
        flow.arq_params = self.config.arq_enabled.then_some(self.arq_params);

        let transaction_id = self.role.next_transaction_id();
        let req = FlowRequest {
            direction: flow.direction,
            sfid: flow.sfid,
            cid: flow.cid,
            qos: &flow.qos,
            service_type: flow.service_type,
            packing: self.config.packing_enabled.then_some(fixed),
            arq: flow.arq_params.as_ref(),
            classifier: flow.classifier.as_ref(),
        };
        let bytes = match build_dsa_req(mgmt_cid, transaction_id, &req, self.config.hmac_key_seq) {
            Ok(bytes) => bytes,
            Err(e) => {
                if let Some((sfid, cid)) = ids {
                    self.role.release_flow(sfid, cid);
                }
                return Err(e.into());
            }
        };

        flow.dsx.begin(DsxKind::Add, transaction_id, self.config.dsx.req_retries);
        flow.dsx.state = DsxState::ReqSent;
        flow.dsx.req = Some(bytes.clone());
        flow.dsx.arm(DsxTimer::T7, self.config.dsx.t7, id, sched);
        debug!(
            "DSA-REQ {transaction_id:#06x} to {} for {:?} {:?} flow",
            hex::encode(peer),
            flow.direction,
            flow.service_type
        );
        self.flows.insert(flow);
        self.stats.flows_created += 1;
        self.send_mgmt(peer, bytes);
        Ok(id)
    }

    fn maybe_change(&mut self, id: FlowId, qos: &QosParameters, sched: &mut dyn Scheduler) {
        let Some(flow) = self.flows.get(id) else { return };
        let wanted = flow.is_active()
            && flow.initiation == FlowInitiation::Local
            && flow.dsx.is_idle()
            && qos.differs_from(&flow.qos);
        if wanted {
            if let Err(e) = self.change_flow(id, *qos, sched) {
                warn!("cannot change flow {id:?}: {e}");
            }
        }
    }

    /// Starts a DSC renegotiating the flow's QoS.
    pub fn change_flow(&mut self, id: FlowId, qos: QosParameters, sched: &mut dyn Scheduler) -> Result<(), MacError> {
        let flow = self.flows.get(id).ok_or(MacError::UnknownFlow(id))?;
        let (peer, direction) = (flow.peer, flow.direction);
        let sfid = flow.sfid.ok_or(MacError::UnknownFlow(id))?;
        let mgmt_cid = self.mgmt_cid(peer)?;
        let transaction_id = self.role.next_transaction_id();
        let bytes = build_dsc_req(mgmt_cid, transaction_id, direction, sfid, &qos, self.config.hmac_key_seq)?;

        let (retries, t14) = (self.config.dsx.req_retries, self.config.dsx.t14);
        let flow = self.flows.get_mut(id).ok_or(MacError::UnknownFlow(id))?;
        flow.pending_qos = Some(qos);
        flow.dsx.begin(DsxKind::Change, transaction_id, retries);
        flow.dsx.state = DsxState::ReqSent;
        flow.dsx.req = Some(bytes.clone());
        flow.dsx.arm(DsxTimer::T14, t14, id, sched);
        debug!("DSC-REQ {transaction_id:#06x} for SFID {sfid}");
        self.send_mgmt(peer, bytes);
        Ok(())
    }

    /// Tears a flow down with a DSD exchange. Flows still being added are
    /// dropped locally.
    pub fn delete_flow(&mut self, id: FlowId, sched: &mut dyn Scheduler) -> Result<(), MacError> {
        let flow = self.flows.get(id).ok_or(MacError::UnknownFlow(id))?;
        if flow.status == FlowStatus::Deleting {
            return Ok(());
        }
        let (peer, sfid) = (flow.peer, flow.sfid);
        let Some(sfid) = sfid.filter(|_| flow.status == FlowStatus::Active) else {
            self.teardown(id, sched);
            return Ok(());
        };
        let mgmt_cid = self.mgmt_cid(peer)?;
        let transaction_id = self.role.next_transaction_id();
        let bytes = build_dsd_req(mgmt_cid, transaction_id, sfid, self.config.hmac_key_seq)?;

        let (retries, t14) = (self.config.dsx.req_retries, self.config.dsx.t14);
        let flow = self.flows.get_mut(id).ok_or(MacError::UnknownFlow(id))?;
        flow.dsx.reset(sched);
        flow.pending_qos = None;
        flow.status = FlowStatus::Deleting;
        flow.dsx.begin(DsxKind::Delete, transaction_id, retries);
        flow.dsx.state = DsxState::ReqSent;
        flow.dsx.req = Some(bytes.clone());
        flow.dsx.arm(DsxTimer::T14, t14, id, sched);
        debug!("DSD-REQ {transaction_id:#06x} for SFID {sfid}");
        self.send_mgmt(peer, bytes);
        Ok(())
    }

    /// Removes a flow and everything it holds. The classifier record is
    /// released, not freed.
    fn teardown(&mut self, id: FlowId, sched: &mut dyn Scheduler) {
        let Some(mut flow) = self.flows.remove(id) else { return };
        flow.dsx.reset(sched);
        if let Some(arq) = flow.arq.as_mut() {
            arq.shutdown(sched);
            self.stats.arq.merge(arq.stats());
        }
        self.stats.reassembly.merge(&flow.reassembler.stats);
        if let Some(csf) = flow.csf {
            self.cs.release(csf, sched);
        }
        if let (Some(sfid), Some(cid)) = (flow.sfid, flow.cid) {
            self.role.release_flow(sfid, cid);
        }
        self.stats.flows_deleted += 1;
        info!(
            "service flow SFID {:?} CID {:?} to {} removed ({} SDUs unsent)",
            flow.sfid,
            flow.cid,
            hex::encode(flow.peer),
            flow.queue.len()
        );
    }

    /// Drops every flow to `peer` without signalling.
    pub fn forget_peer(&mut self, peer: MacAddress, sched: &mut dyn Scheduler) {
        for id in self.flows.flows_of(peer) {
            self.teardown(id, sched);
        }
    }

    pub fn shutdown(&mut self, sched: &mut dyn Scheduler) {
        for id in self.flows.ids() {
            self.teardown(id, sched);
        }
    }

    // ---- receive path ----

    /// Accepts one PDU from the air.
    pub fn receive_pdu(&mut self, bytes: Bytes, tags: &[PduTag], sched: &mut dyn Scheduler) -> Result<(), MacError> {
        let header = MacHeader::decode(&bytes)?;
        if !(BASIC_CID_START..=PRIMARY_CID_END).contains(&header.cid) {
            return self.receive_data(&bytes, tags, sched);
        }

        let peer = self.role.peer_for_cid(header.cid).ok_or(MacError::UnknownConnection(header.cid))?;
        let end = (header.len as usize).min(bytes.len());
        let payload = bytes
            .get(MAC_HEADER_SIZE..end)
            .ok_or(CodecError::Truncated { needed: MAC_HEADER_SIZE, available: bytes.len() })?;
        let (&ty, body) = payload.split_first().ok_or(CodecError::Truncated {
            needed: MAC_HEADER_SIZE + 1,
            available: bytes.len(),
        })?;
        let msg_type = MgmtMessageType::try_from(ty)?;
        self.stats.mgmt_received += 1;

        match msg_type {
            MgmtMessageType::ArqFeedback | MgmtMessageType::ArqDiscard | MgmtMessageType::ArqReset => {
                let msg = ArqMessage::decode(msg_type, body)?;
                self.handle_arq_message(peer, msg, sched)
            }
            MgmtMessageType::DsxRvd => {
                trace!("ignoring DSX-RVD from {}", hex::encode(peer));
                Ok(())
            }
            _ => {
                let msg = dsx::messages::decode(msg_type, body)?;
                self.handle_dsx(peer, header.cid, msg, sched)
            }
        }
    }

    fn receive_data(&mut self, bytes: &[u8], tags: &[PduTag], sched: &mut dyn Scheduler) -> Result<(), MacError> {
        let mut pdu = DataPdu::decode(bytes)?;
        pdu.attach_tags(tags);
        let cid = pdu.cid;
        let id = self.flows.by_cid(cid).ok_or(MacError::UnknownConnection(cid))?;
        let flow = self.flows.get_mut(id).ok_or(MacError::UnknownConnection(cid))?;
        if !flow.is_active() {
            debug!("data on CID {cid} before the flow is active, dropped");
            return Ok(());
        }
        self.stats.data_pdus_received += 1;

        let peer = flow.peer;
        let mut out = ArqOutput::default();
        match flow.arq.as_mut() {
            Some(arq) => {
                for unit in pdu.units {
                    arq.receive(unit.sequence, unit.fc, unit.payload, unit.tag, sched, &mut out);
                }
            }
            None => {
                for unit in pdu.units {
                    if let Some(sdu) = flow.reassembler.accept(unit) {
                        out.delivered.push(sdu);
                    }
                }
            }
        }
        self.dispatch(peer, cid, out);
        Ok(())
    }

    /// Sends what an ARQ machine asked for and hands delivered SDUs up.
    fn dispatch(&mut self, peer: MacAddress, cid: Cid, out: ArqOutput) {
        if !out.messages.is_empty() {
            match self.role.management_cid(peer) {
                Some(mgmt_cid) => {
                    for msg in out.messages {
                        match msg.encode(mgmt_cid) {
                            Ok(bytes) => self.send_mgmt(peer, bytes),
                            Err(e) => warn!("cannot encode {msg:?}: {e}"),
                        }
                    }
                }
                None => debug!("no management connection to {}", hex::encode(peer)),
            }
        }
        if out.delivered.is_empty() {
            return;
        }
        if let Some(flow) = self.flows.by_cid(cid).and_then(|id| self.flows.get_mut(id)) {
            flow.stats.sdus_delivered += out.delivered.len() as u64;
            flow.stats.bytes_delivered += out.delivered.iter().map(Sdu::len).sum::<usize>() as u64;
        }
        for sdu in out.delivered {
            self.stats.sdus_delivered += 1;
            self.cs.stats.packets_from_lower += 1;
            self.delivered.push(DeliveredSdu { sdu, cid, source: peer });
        }
    }

    fn handle_arq_message(&mut self, peer: MacAddress, msg: ArqMessage, sched: &mut dyn Scheduler) -> Result<(), MacError> {
        let cid = msg.cid();
        let flow = self
            .flows
            .by_cid(cid)
            .and_then(|id| self.flows.get_mut(id))
            .filter(|f| f.peer == peer)
            .ok_or(MacError::UnknownConnection(cid))?;
        let arq = flow.arq.as_mut().ok_or(MacError::UnknownConnection(cid))?;

        let mut out = ArqOutput::default();
        match msg {
            ArqMessage::Feedback(ie) => {
                arq.handle_feedback(&ie, sched);
            }
            ArqMessage::Discard { bsn, .. } => arq.handle_discard(bsn, sched, &mut out),
            ArqMessage::Reset { reset, .. } => arq.handle_reset(reset, sched, &mut out),
        }
        self.dispatch(peer, cid, out);
        Ok(())
    }

    // ---- DSx dispatch ----

    fn handle_dsx(
        &mut self,
        peer: MacAddress,
        mgmt_cid: Cid,
        msg: DsxMessage,
        sched: &mut dyn Scheduler,
    ) -> Result<(), MacError> {
        trace!("{:?} from {}", msg, hex::encode(peer));
        match msg {
            DsxMessage::DsaReq { transaction_id, flow } => self.on_dsa_req(peer, mgmt_cid, transaction_id, flow, sched),
            DsxMessage::DsaRsp { transaction_id, cc, flow } => {
                self.on_dsa_rsp(peer, mgmt_cid, transaction_id, cc, flow, sched)
            }
            DsxMessage::DsaAck { transaction_id, cc } => self.on_ack(peer, DsxKind::Add, transaction_id, cc, sched),
            DsxMessage::DscReq { transaction_id, flow } => self.on_dsc_req(peer, mgmt_cid, transaction_id, flow, sched),
            DsxMessage::DscRsp { transaction_id, cc } => self.on_dsc_rsp(peer, mgmt_cid, transaction_id, cc, sched),
            DsxMessage::DscAck { transaction_id, cc } => self.on_ack(peer, DsxKind::Change, transaction_id, cc, sched),
            DsxMessage::DsdReq { transaction_id, sfid } => self.on_dsd_req(peer, mgmt_cid, transaction_id, sfid, sched),
            DsxMessage::DsdRsp { transaction_id, cc, sfid } => {
                let id = self
                    .flows
                    .by_transaction(peer, transaction_id)
                    .ok_or(MacError::UnknownTransaction(transaction_id))?;
                let deleting = self.flows.get(id).is_some_and(|f| f.dsx.kind == Some(DsxKind::Delete));
                if deleting {
                    debug!("DSD-RSP {transaction_id:#06x} for SFID {sfid}: {cc:?}");
                    self.teardown(id, sched);
                }
                Ok(())
            }
        }
    }

    /// Resends the held copy of `which` when a retransmitted request shows
    /// our answer was lost.
    fn resend_held(&mut self, peer: MacAddress, transaction_id: TransactionId, which: DsxState) -> bool {
        let Some(id) = self.flows.by_transaction(peer, transaction_id) else { return false };
        let held = self.flows.get(id).and_then(|f| match which {
            DsxState::RspSent => f.dsx.rsp.clone(),
            _ => f.dsx.ack.clone(),
        });
        if let Some(bytes) = held {
            debug!("duplicate for transaction {transaction_id:#06x}, resending");
            self.send_mgmt(peer, bytes);
        }
        true
    }

    // ---- DSA ----

    fn on_dsa_req(
        &mut self,
        peer: MacAddress,
        mgmt_cid: Cid,
        transaction_id: TransactionId,
        req: FlowTlvs,
        sched: &mut dyn Scheduler,
    ) -> Result<(), MacError> {
        if self.resend_held(peer, transaction_id, DsxState::RspSent) {
            return Ok(());
        }
        let direction = req.direction.ok_or(MacError::Malformed(MgmtMessageType::DsaReq))?;
        let mut qos = req.qos.unwrap_or_else(|| self.qos.class_defaults());

        let admitted = if self.flows.count_for_peer(peer) >= self.config.max_flows_per_subscriber {
            Err(ConfirmCode::RejectExceededDynamicServiceLimit)
        } else {
            self.admit_flow_ids(peer, &req)
        };
        let (cc, (sfid, cid)) = match admitted {
            Ok(ids) => (ConfirmCode::Ok, ids),
            Err(cc) => (cc, (0, 0)),
        };

        let mut qos_changed = false;
        if let Some(cap) = self.config.sustained_rate_cap {
            if cc.is_ok() && qos.max_sustained_rate > cap {
                qos.max_sustained_rate = cap;
                qos_changed = true;
            }
        }
        let arq = req.arq.filter(|_| self.config.arq_enabled && req.arq_enabled == Some(true));
        let rsp = match build_dsa_rsp(
            mgmt_cid,
            transaction_id,
            cc,
            direction,
            sfid,
            cid,
            qos_changed.then_some(&qos),
            arq.as_ref(),
            self.config.hmac_key_seq,
        ) {
            Ok(rsp) => rsp,
            Err(e) => {
                if cc.is_ok() {
                    self.role.release_flow(sfid, cid);
                }
                return Err(e.into());
            }
        };
        if !cc.is_ok() {
            warn!("rejecting DSA-REQ {transaction_id:#06x} from {}: {cc:?}", hex::encode(peer));
            self.send_mgmt(peer, rsp);
            return Ok(());
        }

        let id = self.flows.next_id();
        let mut flow = ServiceFlow::new(
            id,
            peer,
            direction,
            FlowInitiation::Remote,
            req.service_type.unwrap_or(ServiceType::Be),
            qos,
        );
        flow.sfid = Some(sfid);
        flow.cid = Some(cid);
        flow.classifier = req.classifier;
        flow.fixed_sdu_size = req.fixed_sdu_size;
        flow.arq_params = arq;
        flow.dsx.begin(DsxKind::Add, transaction_id, self.config.dsx.rsp_retries);
        flow.dsx.state = DsxState::RspSent;
        flow.dsx.rsp = Some(rsp.clone());
        flow.dsx.arm(DsxTimer::T8, self.config.dsx.t8, id, sched);
        debug!("DSA-RSP {transaction_id:#06x} to {}: SFID {sfid} CID {cid}", hex::encode(peer));
        self.flows.insert(flow);
        self.stats.flows_created += 1;
        self.send_mgmt(peer, rsp);
        Ok(())
    }

    /// Identifiers for a flow the peer asked for. Only called once the
    /// request is within the flow limit, so rejects never hold a CID.
    fn admit_flow_ids(&mut self, peer: MacAddress, req: &FlowTlvs) -> Result<(Sfid, Cid), ConfirmCode> {
        match self.role.allocate_flow() {
            Ok(Some(ids)) => Ok(ids),
            Ok(None) => {
                let (sfid, cid) = req.sfid.zip(req.cid).ok_or(ConfirmCode::RejectRequiredParamNotPresent)?;
                if self.flows.by_cid(cid).is_some() {
                    return Err(ConfirmCode::RejectServiceFlowExists);
                }
                Ok((sfid, cid))
            }
            Err(e) => {
                debug!("cannot admit flow from {}: {e}", hex::encode(peer));
                Err(ConfirmCode::RejectTempResource)
            }
        }
    }

    fn on_dsa_rsp(
        &mut self,
        peer: MacAddress,
        mgmt_cid: Cid,
        transaction_id: TransactionId,
        cc: ConfirmCode,
        rsp: FlowTlvs,
        sched: &mut dyn Scheduler,
    ) -> Result<(), MacError> {
        let id = self
            .flows
            .by_transaction(peer, transaction_id)
            .ok_or(MacError::UnknownTransaction(transaction_id))?;
        let ack = build_dsx_confirm(mgmt_cid, MgmtMessageType::DsaAck, transaction_id, cc, self.config.hmac_key_seq)?;
        let (outbound, t10) = (self.role.outbound_direction(), self.config.dsx.t10);
        let flow = self.flows.get_mut(id).ok_or(MacError::UnknownFlow(id))?;

        match (flow.dsx.kind, flow.dsx.state) {
            (_, DsxState::AckSent) => {
                self.resend_held(peer, transaction_id, DsxState::AckSent);
                return Ok(());
            }
            (Some(DsxKind::Add), DsxState::ReqSent) => {}
            (kind, state) => {
                debug!("unexpected DSA-RSP {transaction_id:#06x} in {kind:?}/{state:?}");
                return Ok(());
            }
        }
        flow.dsx.disarm(DsxTimer::T7, sched);
        flow.dsx.state = DsxState::RspReceived;

        if !cc.is_ok() {
            warn!("DSA {transaction_id:#06x} rejected by {}: {cc:?}", hex::encode(peer));
            self.send_mgmt(peer, ack);
            self.teardown(id, sched);
            return Ok(());
        }

        if flow.sfid.is_none() {
            flow.sfid = rsp.sfid;
            flow.cid = rsp.cid;
        }
        if flow.cid.is_none() {
            self.teardown(id, sched);
            return Err(MacError::Malformed(MgmtMessageType::DsaRsp));
        }
        if let Some(qos) = rsp.qos {
            debug!("admission changed the QoS of flow {id:?}");
            flow.qos = qos;
        }
        flow.arq_params = match rsp.arq_enabled {
            Some(true) => rsp.arq.or(flow.arq_params),
            _ => None,
        };
        flow.dsx.ack = Some(ack.clone());
        flow.dsx.state = DsxState::AckSent;
        flow.dsx.arm(DsxTimer::T10, t10, id, sched);
        activate(flow, outbound);
        self.send_mgmt(peer, ack);
        Ok(())
    }

    /// DSA-ACK and DSC-ACK close the responder's side.
    fn on_ack(
        &mut self,
        peer: MacAddress,
        kind: DsxKind,
        transaction_id: TransactionId,
        cc: ConfirmCode,
        sched: &mut dyn Scheduler,
    ) -> Result<(), MacError> {
        let id = self
            .flows
            .by_transaction(peer, transaction_id)
            .ok_or(MacError::UnknownTransaction(transaction_id))?;
        let outbound = self.role.outbound_direction();
        let flow = self.flows.get_mut(id).ok_or(MacError::UnknownFlow(id))?;
        if flow.dsx.kind != Some(kind) || flow.dsx.state != DsxState::RspSent {
            trace!("late {kind:?} ACK {transaction_id:#06x}");
            return Ok(());
        }
        flow.dsx.disarm(DsxTimer::T8, sched);
        flow.dsx.state = DsxState::AckReceived;

        match kind {
            DsxKind::Add if cc.is_ok() => activate(flow, outbound),
            DsxKind::Add => {
                warn!("DSA {transaction_id:#06x} aborted by {}: {cc:?}", hex::encode(peer));
                self.teardown(id, sched);
                return Ok(());
            }
            _ => {
                let pending = flow.pending_qos.take();
                if let Some(qos) = pending.filter(|_| cc.is_ok()) {
                    flow.qos = qos;
                    debug!("flow {id:?} QoS changed by peer");
                }
            }
        }
        flow.dsx.reset(sched);
        Ok(())
    }

    // ---- DSC ----

    fn on_dsc_req(
        &mut self,
        peer: MacAddress,
        mgmt_cid: Cid,
        transaction_id: TransactionId,
        req: FlowTlvs,
        sched: &mut dyn Scheduler,
    ) -> Result<(), MacError> {
        if self.resend_held(peer, transaction_id, DsxState::RspSent) {
            return Ok(());
        }
        let key_seq = self.config.hmac_key_seq;
        let found = req
            .sfid
            .and_then(|sfid| self.flows.by_sfid(sfid))
            .filter(|id| self.flows.get(*id).is_some_and(|f| f.peer == peer && f.is_active()));
        let cc = match found.and_then(|id| self.flows.get(id)) {
            None => ConfirmCode::RejectServiceFlowNotFound,
            Some(f) if !f.dsx.is_idle() => ConfirmCode::RejectTempResource,
            Some(_) => ConfirmCode::Ok,
        };
        let rsp = build_dsx_confirm(mgmt_cid, MgmtMessageType::DscRsp, transaction_id, cc, key_seq)?;
        let (Some(id), true) = (found, cc.is_ok()) else {
            debug!("DSC-REQ {transaction_id:#06x} from {} refused: {cc:?}", hex::encode(peer));
            self.send_mgmt(peer, rsp);
            return Ok(());
        };

        let (retries, t8) = (self.config.dsx.rsp_retries, self.config.dsx.t8);
        let flow = self.flows.get_mut(id).ok_or(MacError::UnknownFlow(id))?;
        flow.pending_qos = Some(req.qos.unwrap_or(flow.qos));
        flow.dsx.begin(DsxKind::Change, transaction_id, retries);
        flow.dsx.state = DsxState::RspSent;
        flow.dsx.rsp = Some(rsp.clone());
        flow.dsx.arm(DsxTimer::T8, t8, id, sched);
        self.send_mgmt(peer, rsp);
        Ok(())
    }

    fn on_dsc_rsp(
        &mut self,
        peer: MacAddress,
        mgmt_cid: Cid,
        transaction_id: TransactionId,
        cc: ConfirmCode,
        sched: &mut dyn Scheduler,
    ) -> Result<(), MacError> {
        let id = self
            .flows
            .by_transaction(peer, transaction_id)
            .ok_or(MacError::UnknownTransaction(transaction_id))?;
        let ack = build_dsx_confirm(mgmt_cid, MgmtMessageType::DscAck, transaction_id, cc, self.config.hmac_key_seq)?;
        let t10 = self.config.dsx.t10;
        let flow = self.flows.get_mut(id).ok_or(MacError::UnknownFlow(id))?;

        match (flow.dsx.kind, flow.dsx.state) {
            (_, DsxState::AckSent) => {
                self.resend_held(peer, transaction_id, DsxState::AckSent);
                return Ok(());
            }
            (Some(DsxKind::Change), DsxState::ReqSent) => {}
            (kind, state) => {
                debug!("unexpected DSC-RSP {transaction_id:#06x} in {kind:?}/{state:?}");
                return Ok(());
            }
        }
        flow.dsx.disarm(DsxTimer::T14, sched);
        flow.dsx.state = DsxState::RspReceived;
        let pending = flow.pending_qos.take();
        match pending.filter(|_| cc.is_ok()) {
            Some(qos) => flow.qos = qos,
            None => warn!("DSC {transaction_id:#06x} refused by {}: {cc:?}", hex::encode(peer)),
        }
        flow.dsx.ack = Some(ack.clone());
        flow.dsx.state = DsxState::AckSent;
        flow.dsx.arm(DsxTimer::T10, t10, id, sched);
        self.send_mgmt(peer, ack);
        Ok(())
    }

    // ---- DSD ----

    fn on_dsd_req(
        &mut self,
        peer: MacAddress,
        mgmt_cid: Cid,
        transaction_id: TransactionId,
        sfid: Sfid,
        sched: &mut dyn Scheduler,
    ) -> Result<(), MacError> {
        let found = self.flows.by_sfid(sfid).filter(|id| self.flows.get(*id).is_some_and(|f| f.peer == peer));
        let cc = if found.is_some() { ConfirmCode::Ok } else { ConfirmCode::RejectServiceFlowNotFound };
        let rsp = build_dsd_rsp(mgmt_cid, transaction_id, cc, sfid, self.config.hmac_key_seq)?;
        if let Some(id) = found {
            self.teardown(id, sched);
        }
        self.send_mgmt(peer, rsp);
        Ok(())
    }

    // ---- timers ----

    pub fn handle_timer(&mut self, handle: TimerHandle, timer: MacTimer, sched: &mut dyn Scheduler) {
        match timer {
            MacTimer::Dsx { flow, timer: which, transaction_id } => {
                self.on_dsx_timer(handle, flow, which, transaction_id, sched)
            }
            MacTimer::ClassifierSweep => {
                let removed = self.cs.handle_sweep(handle, sched);
                if removed > 0 {
                    trace!("swept {removed} classifier records");
                }
            }
            MacTimer::ArqRetry { cid, .. }
            | MacTimer::ArqBlockLifetime { cid, .. }
            | MacTimer::ArqDiscardRetry { cid, .. }
            | MacTimer::ArqRxPurge { cid, .. }
            | MacTimer::ArqSyncLoss { cid }
            | MacTimer::ArqResetRetry { cid, .. } => {
                let Some(flow) = self.flows.by_cid(cid).and_then(|id| self.flows.get_mut(id)) else { return };
                let Some(arq) = flow.arq.as_mut() else { return };
                let mut out = ArqOutput::default();
                arq.handle_timer(handle, timer, sched, &mut out);
                let peer = flow.peer;
                self.dispatch(peer, cid, out);
            }
        }
    }

    fn on_dsx_timer(
        &mut self,
        handle: TimerHandle,
        id: FlowId,
        which: DsxTimer,
        transaction_id: TransactionId,
        sched: &mut dyn Scheduler,
    ) {
        let cfg = self.config.dsx.clone();
        let Some(flow) = self.flows.get_mut(id) else { return };
        if !flow.dsx.matches(transaction_id) || !flow.dsx.is_current(which, handle) {
            return;
        }
        flow.dsx.fired(which);

        let (waiting, delay) = match which {
            DsxTimer::T10 => {
                trace!("transaction {transaction_id:#06x} hold-down over");
                flow.dsx.reset(sched);
                return;
            }
            DsxTimer::T7 => (DsxState::ReqSent, cfg.t7),
            DsxTimer::T14 => (DsxState::ReqSent, cfg.t14),
            DsxTimer::T8 => (DsxState::RspSent, cfg.t8),
        };
        if flow.dsx.state != waiting {
            return;
        }
        if flow.dsx.retries_left == 0 {
            self.abandon(id, sched);
            return;
        }

        flow.dsx.retries_left -= 1;
        flow.dsx.arm(which, delay, id, sched);
        let held = if waiting == DsxState::ReqSent { flow.dsx.req.clone() } else { flow.dsx.rsp.clone() };
        let peer = flow.peer;
        debug!("{which:?} expired for {transaction_id:#06x}, {} retries left", flow.dsx.retries_left);
        if let Some(bytes) = held {
            self.send_mgmt(peer, bytes);
        }
    }

    /// Out of retries: a change is dropped, an add or delete takes the
    /// flow with it.
    fn abandon(&mut self, id: FlowId, sched: &mut dyn Scheduler) {
        let Some(flow) = self.flows.get_mut(id) else { return };
        warn!(
            "DSx {:?} transaction {:#06x?} on flow {:?} gave up in {:?}",
            flow.dsx.kind, flow.dsx.transaction_id, id, flow.dsx.state
        );
        self.stats.dsx_abandoned += 1;
        if flow.dsx.kind == Some(DsxKind::Change) {
            flow.pending_qos = None;
            flow.dsx.reset(sched);
        } else {
            self.teardown(id, sched);
        }
    }

    // ---- transmit path ----

    /// Builds at most one PDU for `id` within a burst of `burst` bytes.
    pub fn pull_pdu(&mut self, id: FlowId, burst: usize, sched: &mut dyn Scheduler) -> Option<OutboundPdu> {
        let (packing, crc_size) = (self.config.packing_enabled, self.config.crc_size());
        let outbound = self.role.outbound_direction();
        let flow = self.flows.get_mut(id)?;
        if !flow.is_active() || flow.direction != outbound {
            return None;
        }
        let cid = flow.cid?;
        let pdu = match flow.arq.as_mut() {
            Some(arq) => {
                arq.fill_window(&mut flow.queue);
                build_arq_pdu(arq, cid, burst, packing, crc_size, sched)?
            }
            None => flow.fragmenter.build(cid, &mut flow.queue, burst, packing, crc_size)?,
        };
        let bytes = match pdu.encode(crc_size > 0) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("cannot encode PDU on CID {cid}: {e}");
                return None;
            }
        };
        flow.stats.sdus_sent += pdu.units.iter().filter(|u| u.fc.ends_sdu()).count() as u64;
        flow.stats.bytes_sent += bytes.len() as u64;
        let peer = flow.peer;
        self.stats.data_pdus_sent += 1;
        Some(OutboundPdu { peer, bytes, tags: pdu.tags() })
    }

    /// Drains every outbound flow, one burst-sized PDU at a time.
    pub fn pull_pdus(&mut self, burst: usize, sched: &mut dyn Scheduler) -> Vec<OutboundPdu> {
        let mut pdus = Vec::new();
        for id in self.flows.ids() {
            while let Some(pdu) = self.pull_pdu(id, burst, sched) {
                pdus.push(pdu);
            }
        }
        pdus
    }

    /// Bytes the flow would need granted to empty its queue.
    pub fn bandwidth_request(&self, id: FlowId) -> usize {
        let Some(flow) = self.flows.get(id).filter(|f| f.is_active()) else { return 0 };
        let (packing, crc_size) = (self.config.packing_enabled, self.config.crc_size());
        let overhead = MAC_HEADER_SIZE + crc_size;
        match &flow.arq {
            Some(arq) => {
                let sub = DataPdu::subheader_size(true, packing);
                arq.bandwidth_request(packing, crc_size)
                    + flow.queue.iter().map(|sdu| sdu.len() + sub + overhead).sum::<usize>()
            }
            None => {
                let sub = if packing { DataPdu::subheader_size(false, true) } else { 0 };
                let partial = match flow.fragmenter.partial_bytes() {
                    0 => 0,
                    n => n + overhead + FragSubheader::SHORT_SIZE,
                };
                partial + flow.queue.iter().map(|sdu| sdu.len() + sub + overhead).sum::<usize>()
            }
        }
    }
}

impl MacStation<BaseStationRole> {
    pub fn register_subscriber(&mut self, mac: MacAddress) -> Result<SubscriberEntry, MacError> {
        self.role.register_subscriber(mac)
    }

    pub fn deregister_subscriber(&mut self, mac: MacAddress, sched: &mut dyn Scheduler) {
        self.forget_peer(mac, sched);
        if self.role.deregister_subscriber(mac).is_some() {
            info!("subscriber {} deregistered", hex::encode(mac));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ipv4_udp, NetworkType};
    use crate::role::SubscriberRole;
    use crate::timer::EventQueue;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use wimax_core::AppProfile;

    const BS: MacAddress = [2, 0, 0, 0, 0, 1];
    const SS: MacAddress = [2, 0, 0, 0, 0, 2];
    const SS2: MacAddress = [2, 0, 0, 0, 0, 3];

    struct Net {
        bs: MacStation<BaseStationRole>,
        bs_q: EventQueue,
        ss: MacStation<SubscriberRole>,
        ss_q: EventQueue,
    }

    fn net(config: MacConfig) -> Net {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut bs = MacStation::new(config.clone(), BaseStationRole::new(BS)).unwrap();
        let entry = bs.register_subscriber(SS).unwrap();
        let ss = MacStation::new(config, SubscriberRole::new(SS, BS, entry.basic_cid)).unwrap();
        Net { bs, bs_q: EventQueue::new(), ss, ss_q: EventQueue::new() }
    }

    impl Net {
        /// Moves management traffic both ways until both sides go quiet.
        fn pump(&mut self) -> usize {
            let mut moved = 0;
            loop {
                let up = self.ss.take_outbox();
                let down = self.bs.take_outbox();
                if up.is_empty() && down.is_empty() {
                    return moved;
                }
                moved += up.len() + down.len();
                for pdu in up {
                    self.bs.receive_pdu(pdu.bytes, &pdu.tags, &mut self.bs_q).unwrap();
                }
                for pdu in down {
                    self.ss.receive_pdu(pdu.bytes, &pdu.tags, &mut self.ss_q).unwrap();
                }
            }
        }

        fn uplink(&mut self, burst: usize) -> usize {
            let pdus = self.ss.pull_pdus(burst, &mut self.ss_q);
            let n = pdus.len();
            for pdu in pdus {
                self.bs.receive_pdu(pdu.bytes, &pdu.tags, &mut self.bs_q).unwrap();
            }
            n
        }

        fn ss_flow(&self) -> &ServiceFlow {
            self.ss.flows().iter().next().unwrap()
        }

        fn bs_flow(&self) -> &ServiceFlow {
            self.bs.flows().iter().next().unwrap()
        }
    }

    fn fire_next(station: &mut MacStation<impl StationRole>, q: &mut EventQueue) -> MacTimer {
        let (h, t) = q.advance().unwrap();
        station.handle_timer(h, t, q);
        t
    }

    fn udp(dst: Ipv4Addr, sport: u16, len: usize, app: AppProfile, next_hop: MacAddress) -> OutboundPacket {
        let payload = ipv4_udp(Ipv4Addr::new(10, 0, 0, 2), dst, sport, 5000, 0, len);
        OutboundPacket {
            sdu: Sdu { payload, tag: PduTag { origin: 2, sequence: 1, protocol: 17, virtual_size: 0 } },
            next_hop,
            network: NetworkType::Ipv4,
            priority: 0,
            app,
        }
    }

    fn uplink_packet(len: usize, app: AppProfile) -> OutboundPacket {
        udp(Ipv4Addr::new(10, 0, 0, 1), 4000, len, app, BS)
    }

    fn msg_type(pdu: &OutboundPdu) -> u8 {
        pdu.bytes[MAC_HEADER_SIZE]
    }

    #[test]
    fn test_dsa_handshake_and_uplink_delivery() {
        let mut n = net(MacConfig::default());
        let packet = uplink_packet(100, AppProfile::Unknown);
        let original = packet.sdu.payload.clone();
        let out = n.ss.classify(packet, &mut n.ss_q);
        assert!(out.handled && !out.dropped);
        assert_eq!(n.pump(), 3);

        let (ss_flow, bs_flow) = (n.ss_flow(), n.bs_flow());
        assert!(ss_flow.is_active() && bs_flow.is_active());
        assert_eq!(ss_flow.dsx.state, DsxState::AckSent);
        assert!(bs_flow.dsx.is_idle());
        assert_eq!(bs_flow.sfid, Some(1));
        assert_eq!(ss_flow.cid, bs_flow.cid);
        assert_eq!(bs_flow.direction, FlowDirection::Uplink);
        assert_eq!(bs_flow.initiation, FlowInitiation::Remote);
        assert_eq!(bs_flow.classifier.map(|r| r.src_port), Some(4000));

        assert_eq!(n.uplink(1000), 1);
        let got = n.bs.take_delivered();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].source, SS);
        assert_eq!(got[0].sdu.payload, original);
        assert_eq!(got[0].sdu.tag.sequence, 1);

        // T10 closes the initiator's side
        assert!(matches!(fire_next(&mut n.ss, &mut n.ss_q), MacTimer::Dsx { timer: DsxTimer::T10, .. }));
        assert!(n.ss_flow().dsx.is_idle());
        assert_eq!(n.ss_flow().dsx.held_copies(), 0);
    }

    #[test]
    fn test_fragmented_uplink_reassembles() {
        let mut n = net(MacConfig::default());
        let packet = uplink_packet(400, AppProfile::Unknown);
        let original = packet.sdu.payload.clone();
        n.ss.classify(packet, &mut n.ss_q);
        n.pump();

        assert!(n.uplink(100) > 1);
        let got = n.bs.take_delivered();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].sdu.payload, original);
        assert_eq!(n.bs.stats().sdus_delivered, 1);
    }

    #[test]
    fn test_same_packet_reuses_classifier_and_flow() {
        let mut n = net(MacConfig::default());
        let a = n.ss.classify(uplink_packet(100, AppProfile::Unknown), &mut n.ss_q);
        let b = n.ss.classify(uplink_packet(100, AppProfile::Unknown), &mut n.ss_q);
        assert_eq!(a.csf, b.csf);
        assert_eq!(n.ss.take_outbox().len(), 1);
        assert_eq!(n.ss.flows().len(), 1);
        assert_eq!(n.ss_flow().queue.len(), 2);
        assert_eq!(n.ss.classifier().record(a.csf.unwrap()).unwrap().ref_count, 1);
    }

    #[test]
    fn test_dsa_retransmits_then_gives_up() {
        let mut n = net(MacConfig::default());
        let out = n.ss.classify(uplink_packet(100, AppProfile::Unknown), &mut n.ss_q);
        let csf = out.csf.unwrap();
        assert_eq!(n.ss.take_outbox().len(), 1);

        for _ in 0..3 {
            fire_next(&mut n.ss, &mut n.ss_q);
            let resent = n.ss.take_outbox();
            assert_eq!(resent.len(), 1);
            assert_eq!(msg_type(&resent[0]), MgmtMessageType::DsaReq as u8);
        }
        assert_eq!(n.ss_flow().dsx.retries_left, 0);

        fire_next(&mut n.ss, &mut n.ss_q);
        assert!(n.ss.take_outbox().is_empty());
        assert!(n.ss.flows().is_empty());
        assert!(!n.ss.classifier().record(csf).unwrap().is_valid());
        assert_eq!(n.ss.stats().dsx_abandoned, 1);
        // only the classifier sweep is left
        assert_eq!(n.ss_q.pending(), 1);

        // an invalidated record is never reused
        let again = n.ss.classify(uplink_packet(100, AppProfile::Unknown), &mut n.ss_q);
        assert_ne!(again.csf, Some(csf));
        assert_eq!(n.ss.take_outbox().len(), 1);
    }

    #[test]
    fn test_responder_resends_rsp_on_duplicate_req() {
        let mut n = net(MacConfig::default());
        n.ss.classify(uplink_packet(100, AppProfile::Unknown), &mut n.ss_q);
        let req = n.ss.take_outbox().remove(0);
        n.bs.receive_pdu(req.bytes.clone(), &[], &mut n.bs_q).unwrap();
        n.bs.receive_pdu(req.bytes, &[], &mut n.bs_q).unwrap();
        let rsps = n.bs.take_outbox();
        assert_eq!(rsps.len(), 2);
        assert_eq!(rsps[0].bytes, rsps[1].bytes);
        assert_eq!(n.bs.flows().len(), 1);
    }

    #[test]
    fn test_responder_gives_up_without_ack() {
        let mut n = net(MacConfig::default());
        n.ss.classify(uplink_packet(100, AppProfile::Unknown), &mut n.ss_q);
        let req = n.ss.take_outbox().remove(0);
        n.bs.receive_pdu(req.bytes, &[], &mut n.bs_q).unwrap();
        n.bs.take_outbox();

        for _ in 0..3 {
            fire_next(&mut n.bs, &mut n.bs_q);
            assert_eq!(msg_type(&n.bs.take_outbox()[0]), MgmtMessageType::DsaRsp as u8);
        }
        fire_next(&mut n.bs, &mut n.bs_q);
        assert!(n.bs.flows().is_empty());
        assert_eq!(n.bs_q.pending(), 0);
    }

    #[test]
    fn test_dsc_follows_qos_change() {
        let mut n = net(MacConfig::default());
        n.ss.classify(uplink_packet(100, AppProfile::Unknown), &mut n.ss_q);
        n.pump();
        fire_next(&mut n.ss, &mut n.ss_q);

        let cbr = AppProfile::Cbr { interval: Duration::from_millis(20) };
        n.ss.classify(uplink_packet(100, cbr), &mut n.ss_q);
        assert_eq!(n.ss_flow().dsx.kind, Some(DsxKind::Change));
        assert_eq!(n.pump(), 3);

        let wanted = n.ss_flow().qos;
        assert_eq!(wanted.max_latency, Duration::from_millis(20));
        assert_eq!(n.bs_flow().qos.max_latency, wanted.max_latency);
        assert_eq!(n.bs_flow().qos.max_sustained_rate, wanted.max_sustained_rate);
        assert!(n.bs_flow().dsx.is_idle());
        assert_eq!(n.ss_flow().dsx.state, DsxState::AckSent);
    }

    #[test]
    fn test_dsc_retransmits_then_keeps_old_qos() {
        let mut n = net(MacConfig::default());
        n.ss.classify(uplink_packet(100, AppProfile::Unknown), &mut n.ss_q);
        n.pump();
        fire_next(&mut n.ss, &mut n.ss_q);
        let before = n.ss_flow().qos;

        let cbr = AppProfile::Cbr { interval: Duration::from_millis(20) };
        n.ss.classify(uplink_packet(100, cbr), &mut n.ss_q);
        assert_eq!(msg_type(&n.ss.take_outbox()[0]), MgmtMessageType::DscReq as u8);

        for _ in 0..3 {
            assert!(matches!(fire_next(&mut n.ss, &mut n.ss_q), MacTimer::Dsx { timer: DsxTimer::T14, .. }));
            assert_eq!(n.ss.take_outbox().len(), 1);
        }
        fire_next(&mut n.ss, &mut n.ss_q);
        assert!(n.ss.take_outbox().is_empty());

        let flow = n.ss_flow();
        assert!(flow.is_active());
        assert!(flow.dsx.is_idle());
        assert_eq!(flow.dsx.held_copies(), 0);
        assert_eq!(flow.dsx.armed_timers(), 0);
        assert_eq!(flow.pending_qos, None);
        assert_eq!(flow.qos, before);
        assert_eq!(n.ss_q.pending(), 0);
    }

    #[test]
    fn test_dsd_removes_flow_on_both_sides() {
        let mut n = net(MacConfig::default());
        let out = n.ss.classify(uplink_packet(100, AppProfile::Unknown), &mut n.ss_q);
        n.pump();
        let id = n.ss_flow().id;
        n.ss.delete_flow(id, &mut n.ss_q).unwrap();
        assert_eq!(n.ss_flow().status, FlowStatus::Deleting);
        assert_eq!(n.pump(), 2);

        assert!(n.ss.flows().is_empty());
        assert!(n.bs.flows().is_empty());
        assert!(!n.ss.classifier().record(out.csf.unwrap()).unwrap().is_valid());
        assert_eq!(n.ss.stats().flows_deleted, 1);
    }

    #[test]
    fn test_deleted_flow_cid_is_reused() {
        let mut n = net(MacConfig::default());
        n.ss.classify(uplink_packet(100, AppProfile::Unknown), &mut n.ss_q);
        n.pump();
        let first = n.bs_flow().cid;
        assert_eq!(n.bs.role().transport_cids_in_use(), 1);

        let id = n.ss_flow().id;
        n.ss.delete_flow(id, &mut n.ss_q).unwrap();
        n.pump();
        assert!(n.bs.flows().is_empty());
        assert_eq!(n.bs.role().transport_cids_in_use(), 0);

        n.ss.classify(uplink_packet(100, AppProfile::Unknown), &mut n.ss_q);
        n.pump();
        assert_eq!(n.bs_flow().cid, first);
        assert_eq!(n.ss_flow().cid, first);
        assert_eq!(n.bs_flow().sfid, Some(1));
    }

    #[test]
    fn test_rejected_dsa_holds_no_cid() {
        let mut n = net(MacConfig::default());
        n.ss.classify(uplink_packet(100, AppProfile::Unknown), &mut n.ss_q);
        let req = n.ss.take_outbox().remove(0);

        let mut config = MacConfig::default();
        config.max_flows_per_subscriber = 0;
        let mut bs = MacStation::new(config, BaseStationRole::new(BS)).unwrap();
        let mut q = EventQueue::new();
        bs.register_subscriber(SS).unwrap();
        bs.receive_pdu(req.bytes, &[], &mut q).unwrap();

        let rsp = bs.take_outbox().remove(0);
        let msg = dsx::messages::decode(MgmtMessageType::DsaRsp, &rsp.bytes[MAC_HEADER_SIZE + 1..]).unwrap();
        assert!(matches!(msg, DsxMessage::DsaRsp { cc: ConfirmCode::RejectExceededDynamicServiceLimit, .. }));
        assert!(bs.flows().is_empty());
        assert_eq!(bs.role().transport_cids_in_use(), 0);
    }

    #[test]
    fn test_unusable_frame_duration_fails_at_startup() {
        let mut config = MacConfig::default();
        config.frame_duration = Duration::ZERO;
        let bs = MacStation::new(config, BaseStationRole::new(BS));
        assert!(matches!(bs, Err(MacError::FrameDuration(Duration::ZERO))));
    }

    #[test]
    fn test_dsd_for_unknown_flow_is_rejected() {
        let mut n = net(MacConfig::default());
        let mgmt_cid = n.ss.role().basic_cid();
        let req = build_dsd_req(mgmt_cid, 0x0042, 99, 0).unwrap();
        n.bs.receive_pdu(req, &[], &mut n.bs_q).unwrap();
        let rsp = n.bs.take_outbox().remove(0);
        let msg = dsx::messages::decode(MgmtMessageType::DsdRsp, &rsp.bytes[MAC_HEADER_SIZE + 1..]).unwrap();
        assert_eq!(
            msg,
            DsxMessage::DsdRsp { transaction_id: 0x0042, cc: ConfirmCode::RejectServiceFlowNotFound, sfid: 99 }
        );
    }

    #[test]
    fn test_admission_caps_sustained_rate() {
        let mut config = MacConfig::default();
        config.sustained_rate_cap = Some(50_000);
        let mut n = net(config);
        n.ss.classify(uplink_packet(100, AppProfile::Unknown), &mut n.ss_q);
        n.pump();
        assert_eq!(n.bs_flow().qos.max_sustained_rate, 50_000);
        assert_eq!(n.ss_flow().qos.max_sustained_rate, 50_000);
    }

    #[test]
    fn test_fixed_length_sdu_negotiated_with_packing() {
        let mut config = MacConfig::default();
        config.packing_enabled = true;
        let mut n = net(config);
        let cbr = AppProfile::Cbr { interval: Duration::from_millis(20) };
        n.ss.classify(uplink_packet(50, cbr), &mut n.ss_q);
        n.pump();
        // 20 + 8 + 50
        assert_eq!(n.ss_flow().fixed_sdu_size, Some(78));
        assert_eq!(n.bs_flow().fixed_sdu_size, Some(78));
    }

    #[test]
    fn test_arq_connection_delivers_and_acks() {
        let mut config = MacConfig::default();
        config.arq_enabled = true;
        config.arq.block_size = 32;
        let mut n = net(config);
        let packet = uplink_packet(100, AppProfile::Unknown);
        let original = packet.sdu.payload.clone();
        n.ss.classify(packet, &mut n.ss_q);
        n.pump();
        assert!(n.ss_flow().arq.is_some());
        assert_eq!(n.bs_flow().arq.as_ref().map(|a| a.direction()), Some(ArqDirection::Rx));
        assert!(n.ss.bandwidth_request(n.ss_flow().id) > original.len());

        n.uplink(1000);
        assert_eq!(n.bs.take_delivered()[0].sdu.payload, original);
        // feedback goes back on the basic CID
        n.pump();
        let arq = n.ss_flow().arq.as_ref().unwrap();
        assert!(arq.window().is_empty());
        assert_eq!(arq.stats().blocks_acked, 4);
        assert_eq!(n.ss.bandwidth_request(n.ss_flow().id), 0);
    }

    #[test]
    fn test_bs_multicast_fans_out_to_every_subscriber() {
        let mut bs = MacStation::new(MacConfig::default(), BaseStationRole::new(BS)).unwrap();
        let mut q = EventQueue::new();
        bs.register_subscriber(SS).unwrap();
        bs.register_subscriber(SS2).unwrap();

        let out = bs.classify(udp(Ipv4Addr::new(239, 1, 1, 1), 7000, 64, AppProfile::Unknown, BS), &mut q);
        let csf = out.csf.unwrap();
        assert!(!out.dropped);
        let reqs = bs.take_outbox();
        assert_eq!(reqs.len(), 2);
        assert_ne!(reqs[0].peer, reqs[1].peer);
        assert_eq!(bs.classifier().record(csf).unwrap().ref_count, 2);
        let flows = bs.flows().by_csf(csf);
        assert_eq!(flows.len(), 2);
        assert!(flows.iter().all(|id| bs.flow(*id).unwrap().queue.len() == 1));
    }

    #[test]
    fn test_bs_drops_packet_for_unknown_subscriber() {
        let mut bs = MacStation::new(MacConfig::default(), BaseStationRole::new(BS)).unwrap();
        let mut q = EventQueue::new();
        let out = bs.classify(udp(Ipv4Addr::new(10, 0, 0, 9), 7000, 64, AppProfile::Unknown, [9; 6]), &mut q);
        assert!(out.handled && out.dropped);
        assert!(!bs.classifier().record(out.csf.unwrap()).unwrap().is_valid());
        assert!(bs.take_outbox().is_empty());
        assert_eq!(bs.stats().cs.packets_dropped, 1);
    }

    #[test]
    fn test_deregister_tears_down_flows() {
        let mut n = net(MacConfig::default());
        n.ss.classify(uplink_packet(100, AppProfile::Unknown), &mut n.ss_q);
        n.pump();
        n.bs.deregister_subscriber(SS, &mut n.bs_q);
        assert!(n.bs.flows().is_empty());
        assert_eq!(n.bs.role().subscriber(SS), None);
    }
}
