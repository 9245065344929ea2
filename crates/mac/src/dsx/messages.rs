//! DSA/DSC/DSD management PDUs
//!
//! Service flow TLVs always come before the CS specification, and the HMAC
//! tuple closes every message.

use std::net::IpAddr;
use std::time::Duration;

use bytes::Bytes;
use wimax_core::constants::{tlv, ARQ_TLV_TICK, FIXED_LENGTH_SDU, QOS_PARAM_SET_ADMISSION, VARIABLE_LENGTH_SDU};
use wimax_core::{
    ArqParameters, Cid, CodecError, ConfirmCode, FlowDirection, MgmtMessageType, QosParameters, ServiceType, Sfid,
    Tlv, TlvReader, TlvWriter, TransactionId,
};

use crate::MacError;

/// The 5-tuple a DSA-REQ asks the peer to classify on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifierRule {
    pub protocol: u8,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

/// What the initiator puts in a DSA-REQ.
#[derive(Debug, Clone)]
pub struct FlowRequest<'a> {
    pub direction: FlowDirection,
    /// Assigned by the BS; a subscriber leaves these out.
    pub sfid: Option<Sfid>,
    pub cid: Option<Cid>,
    pub qos: &'a QosParameters,
    pub service_type: ServiceType,
    /// `Some` when packing is on; carries the fixed SDU size if the flow
    /// qualifies for fixed-length SDUs.
    pub packing: Option<Option<u8>>,
    pub arq: Option<&'a ArqParameters>,
    pub classifier: Option<&'a ClassifierRule>,
}

/// Contents of a service flow TLV as received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowTlvs {
    pub direction: Option<FlowDirection>,
    pub sfid: Option<Sfid>,
    pub cid: Option<Cid>,
    pub qos: Option<QosParameters>,
    pub service_type: Option<ServiceType>,
    pub fixed_sdu_size: Option<u8>,
    pub arq_enabled: Option<bool>,
    pub arq: Option<ArqParameters>,
    pub classifier: Option<ClassifierRule>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DsxMessage {
    DsaReq { transaction_id: TransactionId, flow: FlowTlvs },
    DsaRsp { transaction_id: TransactionId, cc: ConfirmCode, flow: FlowTlvs },
    DsaAck { transaction_id: TransactionId, cc: ConfirmCode },
    DscReq { transaction_id: TransactionId, flow: FlowTlvs },
    DscRsp { transaction_id: TransactionId, cc: ConfirmCode },
    DscAck { transaction_id: TransactionId, cc: ConfirmCode },
    DsdReq { transaction_id: TransactionId, sfid: Sfid },
    DsdRsp { transaction_id: TransactionId, cc: ConfirmCode, sfid: Sfid },
}

impl DsxMessage {
    pub fn transaction_id(&self) -> TransactionId {
        match self {
            Self::DsaReq { transaction_id, .. }
            | Self::DsaRsp { transaction_id, .. }
            | Self::DsaAck { transaction_id, .. }
            | Self::DscReq { transaction_id, .. }
            | Self::DscRsp { transaction_id, .. }
            | Self::DscAck { transaction_id, .. }
            | Self::DsdReq { transaction_id, .. }
            | Self::DsdRsp { transaction_id, .. } => *transaction_id,
        }
    }
}

fn sf_tlv_type(direction: FlowDirection) -> u8 {
    match direction {
        FlowDirection::Uplink => tlv::COMMON_UL_SERVICE_FLOW,
        FlowDirection::Downlink => tlv::COMMON_DL_SERVICE_FLOW,
    }
}

fn millis(d: Duration) -> u32 {
    (d.as_millis() as u32).max(1)
}

fn ticks(d: Duration) -> u16 {
    (d.as_nanos() / ARQ_TLV_TICK.as_nanos()).min(u16::MAX as u128) as u16
}

fn put_qos(w: &mut TlvWriter, qos: &QosParameters, service_type: Option<ServiceType>) {
    w.put_tlv_u8(tlv::DSX_QOS_PARAM_SET_TYPE, QOS_PARAM_SET_ADMISSION)
        .put_tlv_u32(tlv::DSX_MAX_SUSTAINED_RATE, qos.max_sustained_rate)
        .put_tlv_u32(tlv::DSX_MAX_TRAFFIC_BURST, qos.max_pkt_size)
        .put_tlv_u32(tlv::DSX_MIN_RESERVED_RATE, qos.min_reserved_rate)
        .put_tlv_u32(tlv::DSX_MIN_TOLERABLE_RATE, qos.min_pkt_size);
    if let Some(st) = service_type {
        w.put_tlv_u8(tlv::DSX_SERVICE_TYPE, st as u8);
    }
    w.put_tlv_u32(tlv::DSX_TOLERATED_JITTER, millis(qos.tolerated_jitter))
        .put_tlv_u32(tlv::DSX_MAX_LATENCY, millis(qos.max_latency));
}

fn put_arq(w: &mut TlvWriter, arq: &ArqParameters) {
    w.put_tlv_u16(tlv::DSX_ARQ_WINDOW_SIZE, arq.window_size)
        .put_tlv_u16(tlv::DSX_ARQ_RETRY_TIMEOUT_TX_DELAY, ticks(arq.retry_timeout_tx_delay))
        .put_tlv_u16(tlv::DSX_ARQ_RETRY_TIMEOUT_RX_DELAY, ticks(arq.retry_timeout_rx_delay))
        .put_tlv_u16(tlv::DSX_ARQ_BLOCK_LIFETIME, ticks(arq.block_lifetime))
        .put_tlv_u16(tlv::DSX_ARQ_SYNC_LOSS_TIMEOUT, ticks(arq.sync_loss_timeout))
        .put_tlv_u8(tlv::DSX_ARQ_DELIVER_IN_ORDER, arq.deliver_in_order as u8)
        .put_tlv_u16(tlv::DSX_ARQ_RX_PURGE_TIMEOUT, ticks(arq.rx_purge_timeout))
        .put_tlv_u16(tlv::DSX_ARQ_BLOCK_SIZE, arq.block_size);
}

fn put_addr(w: &mut TlvWriter, ty: u8, addr: IpAddr) {
    match addr {
        IpAddr::V4(a) => w.put_tlv(ty, &a.octets()),
        IpAddr::V6(a) => w.put_tlv(ty, &a.octets()),
    };
}

pub fn build_dsa_req(
    mgmt_cid: Cid,
    transaction_id: TransactionId,
    req: &FlowRequest<'_>,
    key_seq: u8,
) -> Result<Bytes, CodecError> {
    let mut w = TlvWriter::management(mgmt_cid, MgmtMessageType::DsaReq as u8);
    w.put_u16(transaction_id);
    let sf = w.reserve_length(sf_tlv_type(req.direction));
    if let Some(sfid) = req.sfid {
        w.put_tlv_u32(tlv::DSX_SERVICE_FLOW_ID, sfid);
    }
    if let Some(cid) = req.cid {
        w.put_tlv_u16(tlv::DSX_CID, cid);
    }
    put_qos(&mut w, req.qos, Some(req.service_type));

    if let Some(fixed) = req.packing {
        match fixed {
            Some(size) => {
                w.put_tlv_u8(tlv::DSX_FIX_LEN_VAR_LEN_SDU, FIXED_LENGTH_SDU);
                w.put_tlv_u8(tlv::DSX_SDU_SIZE, size);
            }
            None => {
                w.put_tlv_u8(tlv::DSX_FIX_LEN_VAR_LEN_SDU, VARIABLE_LENGTH_SDU);
            }
        }
    }
    if let Some(arq) = req.arq {
        w.put_tlv_u8(tlv::DSX_ARQ_ENABLE, 1);
        put_arq(&mut w, arq);
    }

    w.put_tlv_u8(tlv::DSX_CS_SPEC, 0);
    if let Some(rule) = req.classifier {
        let cs_type = if rule.dst.is_ipv6() { tlv::DSX_CS_TYPE_IPV6 } else { tlv::DSX_CS_TYPE_IPV4 };
        let cs = w.reserve_length(cs_type);
        let r = w.reserve_length(tlv::CS_PACKET_CLASSIFIER_RULE);
        w.put_tlv_u8(tlv::CS_PACKET_PROTOCOL, rule.protocol);
        put_addr(&mut w, tlv::CS_PACKET_IP_SRC_ADDR, rule.src);
        put_addr(&mut w, tlv::CS_PACKET_IP_DEST_ADDR, rule.dst);
        w.put_tlv_u16(tlv::CS_PACKET_SRC_PORT_RANGE, rule.src_port);
        w.put_tlv_u16(tlv::CS_PACKET_DEST_PORT_RANGE, rule.dst_port);
        w.patch_length(r)?;
        w.patch_length(cs)?;
    }
    w.patch_length(sf)?;
    w.put_hmac_tuple(key_seq);
    w.finish()
}

/// DSA-RSP. `qos` is echoed back only when admission changed it.
#[allow(clippy::too_many_arguments)]
pub fn build_dsa_rsp(
    mgmt_cid: Cid,
    transaction_id: TransactionId,
    cc: ConfirmCode,
    direction: FlowDirection,
    sfid: Sfid,
    cid: Cid,
    qos: Option<&QosParameters>,
    arq: Option<&ArqParameters>,
    key_seq: u8,
) -> Result<Bytes, CodecError> {
    let mut w = TlvWriter::management(mgmt_cid, MgmtMessageType::DsaRsp as u8);
    w.put_u16(transaction_id).put_byte(cc as u8);
    let sf = w.reserve_length(sf_tlv_type(direction));
    w.put_tlv_u32(tlv::DSX_SERVICE_FLOW_ID, sfid);
    w.put_tlv_u16(tlv::DSX_CID, cid);
    if let Some(qos) = qos {
        put_qos(&mut w, qos, None);
    }
    w.put_tlv_u8(tlv::DSX_ARQ_ENABLE, arq.is_some() as u8);
    if let Some(arq) = arq {
        put_arq(&mut w, arq);
    }
    if !cc.is_ok() {
        w.put_tlv_u8(tlv::DSX_CS_TYPE_IPV4, 0);
    }
    w.patch_length(sf)?;
    w.put_hmac_tuple(key_seq);
    w.finish()
}

/// DSA-ACK, DSC-RSP and DSC-ACK share one shape.
pub fn build_dsx_confirm(
    mgmt_cid: Cid,
    msg_type: MgmtMessageType,
    transaction_id: TransactionId,
    cc: ConfirmCode,
    key_seq: u8,
) -> Result<Bytes, CodecError> {
    let mut w = TlvWriter::management(mgmt_cid, msg_type as u8);
    w.put_u16(transaction_id).put_byte(cc as u8).put_hmac_tuple(key_seq);
    w.finish()
}

pub fn build_dsc_req(
    mgmt_cid: Cid,
    transaction_id: TransactionId,
    direction: FlowDirection,
    sfid: Sfid,
    qos: &QosParameters,
    key_seq: u8,
) -> Result<Bytes, CodecError> {
    let mut w = TlvWriter::management(mgmt_cid, MgmtMessageType::DscReq as u8);
    w.put_u16(transaction_id);
    let sf = w.reserve_length(sf_tlv_type(direction));
    w.put_tlv_u32(tlv::DSX_SERVICE_FLOW_ID, sfid);
    put_qos(&mut w, qos, None);
    w.patch_length(sf)?;
    w.put_hmac_tuple(key_seq);
    w.finish()
}

pub fn build_dsd_req(mgmt_cid: Cid, transaction_id: TransactionId, sfid: Sfid, key_seq: u8) -> Result<Bytes, CodecError> {
    let mut w = TlvWriter::management(mgmt_cid, MgmtMessageType::DsdReq as u8);
    w.put_u16(transaction_id).put_u32(sfid).put_hmac_tuple(key_seq);
    w.finish()
}

pub fn build_dsd_rsp(
    mgmt_cid: Cid,
    transaction_id: TransactionId,
    cc: ConfirmCode,
    sfid: Sfid,
    key_seq: u8,
) -> Result<Bytes, CodecError> {
    let mut w = TlvWriter::management(mgmt_cid, MgmtMessageType::DsdRsp as u8);
    w.put_u16(transaction_id).put_byte(cc as u8).put_u32(sfid).put_hmac_tuple(key_seq);
    w.finish()
}

fn need(body: &[u8], n: usize) -> Result<(), CodecError> {
    if body.len() < n {
        return Err(CodecError::Truncated { needed: n, available: body.len() });
    }
    Ok(())
}

fn addr(t: &Tlv<'_>) -> Result<IpAddr, CodecError> {
    if let Ok(v4) = <[u8; 4]>::try_from(t.value) {
        return Ok(IpAddr::from(v4));
    }
    <[u8; 16]>::try_from(t.value)
        .map(IpAddr::from)
        .map_err(|_| CodecError::TlvLength { ty: t.ty, len: t.value.len() })
}

fn from_ticks(t: &Tlv<'_>) -> Result<Duration, CodecError> {
    Ok(ARQ_TLV_TICK * t.as_u16()? as u32)
}

fn parse_rule(t: &Tlv<'_>) -> Result<ClassifierRule, CodecError> {
    let unspecified = IpAddr::from([0u8; 4]);
    let mut rule = ClassifierRule { protocol: 0, src: unspecified, dst: unspecified, src_port: 0, dst_port: 0 };
    for child in t.nested() {
        let child = child?;
        match child.ty {
            tlv::CS_PACKET_PROTOCOL => rule.protocol = child.as_u8()?,
            tlv::CS_PACKET_IP_SRC_ADDR => rule.src = addr(&child)?,
            tlv::CS_PACKET_IP_DEST_ADDR => rule.dst = addr(&child)?,
            tlv::CS_PACKET_SRC_PORT_RANGE => rule.src_port = child.as_u16()?,
            tlv::CS_PACKET_DEST_PORT_RANGE => rule.dst_port = child.as_u16()?,
            _ => {}
        }
    }
    Ok(rule)
}

fn parse_flow(t: &Tlv<'_>) -> Result<FlowTlvs, CodecError> {
    let mut flow = FlowTlvs {
        direction: Some(if t.ty == tlv::COMMON_UL_SERVICE_FLOW { FlowDirection::Uplink } else { FlowDirection::Downlink }),
        ..FlowTlvs::default()
    };
    let mut qos = QosParameters::default();
    let mut has_qos = false;
    let mut arq = ArqParameters {
        window_size: 0,
        retry_timeout_tx_delay: Duration::ZERO,
        retry_timeout_rx_delay: Duration::ZERO,
        block_lifetime: Duration::ZERO,
        sync_loss_timeout: Duration::ZERO,
        rx_purge_timeout: Duration::ZERO,
        block_size: 0,
        deliver_in_order: false,
    };
    let mut has_arq = false;

    for child in t.nested() {
        let child = child?;
        match child.ty {
            tlv::DSX_SERVICE_FLOW_ID => flow.sfid = Some(child.as_u32()?),
            tlv::DSX_CID => flow.cid = Some(child.as_u16()?),
            tlv::DSX_MAX_SUSTAINED_RATE => {
                qos.max_sustained_rate = child.as_u32()?;
                has_qos = true;
            }
            tlv::DSX_MAX_TRAFFIC_BURST => {
                qos.max_pkt_size = child.as_u32()?;
                has_qos = true;
            }
            tlv::DSX_MIN_RESERVED_RATE => {
                qos.min_reserved_rate = child.as_u32()?;
                has_qos = true;
            }
            tlv::DSX_MIN_TOLERABLE_RATE => {
                qos.min_pkt_size = child.as_u32()?;
                has_qos = true;
            }
            tlv::DSX_TOLERATED_JITTER => {
                qos.tolerated_jitter = Duration::from_millis(child.as_u32()? as u64);
                has_qos = true;
            }
            tlv::DSX_MAX_LATENCY => {
                qos.max_latency = Duration::from_millis(child.as_u32()? as u64);
                has_qos = true;
            }
            tlv::DSX_SERVICE_TYPE => flow.service_type = ServiceType::from_u8(child.as_u8()?),
            tlv::DSX_SDU_SIZE => flow.fixed_sdu_size = Some(child.as_u8()?),
            tlv::DSX_ARQ_ENABLE => flow.arq_enabled = Some(child.as_u8()? != 0),
            tlv::DSX_ARQ_WINDOW_SIZE => {
                arq.window_size = child.as_u16()?;
                has_arq = true;
            }
            tlv::DSX_ARQ_RETRY_TIMEOUT_TX_DELAY => arq.retry_timeout_tx_delay = from_ticks(&child)?,
            tlv::DSX_ARQ_RETRY_TIMEOUT_RX_DELAY => arq.retry_timeout_rx_delay = from_ticks(&child)?,
            tlv::DSX_ARQ_BLOCK_LIFETIME => arq.block_lifetime = from_ticks(&child)?,
            tlv::DSX_ARQ_SYNC_LOSS_TIMEOUT => arq.sync_loss_timeout = from_ticks(&child)?,
            tlv::DSX_ARQ_DELIVER_IN_ORDER => arq.deliver_in_order = child.as_u8()? != 0,
            tlv::DSX_ARQ_RX_PURGE_TIMEOUT => arq.rx_purge_timeout = from_ticks(&child)?,
            tlv::DSX_ARQ_BLOCK_SIZE => arq.block_size = child.as_u16()?,
            tlv::DSX_CS_TYPE_IPV4 | tlv::DSX_CS_TYPE_IPV6 if child.value.len() > 1 => {
                for rule in child.nested() {
                    let rule = rule?;
                    if rule.ty == tlv::CS_PACKET_CLASSIFIER_RULE {
                        flow.classifier = Some(parse_rule(&rule)?);
                    }
                }
            }
            _ => {}
        }
    }
    if has_qos {
        flow.qos = Some(qos);
    }
    if has_arq && flow.arq_enabled == Some(true) {
        flow.arq = Some(arq);
    }
    Ok(flow)
}

fn parse_tail(body: &[u8]) -> Result<Option<FlowTlvs>, CodecError> {
    let mut flow = None;
    for t in TlvReader::new(body) {
        let t = t?;
        if t.ty == tlv::COMMON_UL_SERVICE_FLOW || t.ty == tlv::COMMON_DL_SERVICE_FLOW {
            flow = Some(parse_flow(&t)?);
        }
    }
    Ok(flow)
}

fn confirm_code(msg_type: MgmtMessageType, b: u8) -> Result<ConfirmCode, MacError> {
    ConfirmCode::from_u8(b).ok_or(MacError::Malformed(msg_type))
}

/// Parses the body that follows the message type byte.
pub fn decode(msg_type: MgmtMessageType, body: &[u8]) -> Result<DsxMessage, MacError> {
    need(body, 2)?;
    let transaction_id = u16::from_be_bytes([body[0], body[1]]);
    let rest = &body[2..];
    let msg = match msg_type {
        MgmtMessageType::DsaReq | MgmtMessageType::DscReq => {
            let flow = parse_tail(rest)?.ok_or(MacError::Malformed(msg_type))?;
            if msg_type == MgmtMessageType::DsaReq {
                DsxMessage::DsaReq { transaction_id, flow }
            } else {
                DsxMessage::DscReq { transaction_id, flow }
            }
        }
        MgmtMessageType::DsaRsp => {
            need(rest, 1)?;
            let cc = confirm_code(msg_type, rest[0])?;
            let flow = parse_tail(&rest[1..])?.unwrap_or_default();
            DsxMessage::DsaRsp { transaction_id, cc, flow }
        }
        MgmtMessageType::DsaAck | MgmtMessageType::DscRsp | MgmtMessageType::DscAck => {
            need(rest, 1)?;
            let cc = confirm_code(msg_type, rest[0])?;
            match msg_type {
                MgmtMessageType::DsaAck => DsxMessage::DsaAck { transaction_id, cc },
                MgmtMessageType::DscRsp => DsxMessage::DscRsp { transaction_id, cc },
                _ => DsxMessage::DscAck { transaction_id, cc },
            }
        }
        MgmtMessageType::DsdReq => {
            need(rest, 4)?;
            DsxMessage::DsdReq { transaction_id, sfid: u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) }
        }
        MgmtMessageType::DsdRsp => {
            need(rest, 5)?;
            let cc = confirm_code(msg_type, rest[0])?;
            DsxMessage::DsdRsp { transaction_id, cc, sfid: u32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]) }
        }
        other => return Err(MacError::Malformed(other)),
    };
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use wimax_core::constants::MAC_HEADER_SIZE;
    use wimax_core::MacHeader;

    fn body(bytes: &Bytes) -> (MgmtMessageType, &[u8]) {
        (MgmtMessageType::try_from(bytes[MAC_HEADER_SIZE]).unwrap(), &bytes[MAC_HEADER_SIZE + 1..])
    }

    fn qos() -> QosParameters {
        QosParameters {
            priority: 0,
            min_pkt_size: 100,
            max_pkt_size: 100,
            max_sustained_rate: 80_000,
            min_reserved_rate: 80_000,
            max_latency: Duration::from_millis(10),
            tolerated_jitter: Duration::ZERO,
        }
    }

    #[test]
    fn test_dsa_req_byte_layout() {
        let q = qos();
        let rule = ClassifierRule {
            protocol: 17,
            src: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            src_port: 5000,
            dst_port: 6000,
        };
        let req = FlowRequest {
            direction: FlowDirection::Uplink,
            sfid: None,
            cid: None,
            qos: &q,
            service_type: ServiceType::Ugs,
            packing: None,
            arq: None,
            classifier: Some(&rule),
        };
        let bytes = build_dsa_req(0x0003, 0x0001, &req, 0).unwrap();

        #[rustfmt::skip]
        let parts: &[&[u8]] = &[
            &[11, 0x00, 0x01],
            // SF: length patched, pad
            &[145, 75, 0],
            &[5, 1, 0x06],
            &[7, 4, 0, 1, 0x38, 0x80],
            &[8, 4, 0, 0, 0, 100],
            &[9, 4, 0, 1, 0x38, 0x80],
            &[10, 4, 0, 0, 0, 100],
            &[11, 1, 3],
            &[13, 4, 0, 0, 0, 1],
            &[14, 4, 0, 0, 0, 10],
            &[28, 1, 0],
            &[100, 27, 0],
            &[3, 24, 0],
            &[3, 1, 17],
            &[4, 4, 10, 0, 0, 1],
            &[5, 4, 10, 0, 0, 2],
            &[6, 2, 0x13, 0x88],
            &[7, 2, 0x17, 0x70],
        ];
        let expected = parts.concat();
        assert_eq!(&bytes[MAC_HEADER_SIZE..MAC_HEADER_SIZE + expected.len()], &expected[..]);

        // HMAC tuple closes the message
        let tail = &bytes[MAC_HEADER_SIZE + expected.len()..];
        assert_eq!(tail.len(), 23);
        assert_eq!(&tail[..3], &[149, 21, 0]);
        assert_eq!(MacHeader::decode(&bytes).unwrap().len as usize, bytes.len());

        let (ty, b) = body(&bytes);
        let DsxMessage::DsaReq { transaction_id, flow } = decode(ty, b).unwrap() else { panic!("not a DSA-REQ") };
        assert_eq!(transaction_id, 1);
        assert_eq!(flow.direction, Some(FlowDirection::Uplink));
        assert_eq!(flow.service_type, Some(ServiceType::Ugs));
        assert_eq!(flow.classifier, Some(rule));
        let parsed = flow.qos.unwrap();
        assert!(!parsed.differs_from(&QosParameters { tolerated_jitter: Duration::from_millis(1), ..q }));
    }

    #[test]
    fn test_arq_and_fixed_length_negotiation() {
        let q = qos();
        let arq = ArqParameters {
            window_size: 64,
            retry_timeout_tx_delay: Duration::from_millis(20),
            retry_timeout_rx_delay: Duration::from_millis(20),
            block_lifetime: Duration::from_millis(80),
            sync_loss_timeout: Duration::from_millis(160),
            rx_purge_timeout: Duration::from_millis(140),
            block_size: 64,
            deliver_in_order: true,
        };
        let req = FlowRequest {
            direction: FlowDirection::Downlink,
            sfid: Some(0x10),
            cid: Some(0x1A0),
            qos: &q,
            service_type: ServiceType::Be,
            packing: Some(Some(100)),
            arq: Some(&arq),
            classifier: None,
        };
        let bytes = build_dsa_req(7, 0x8001, &req, 0).unwrap();
        let (ty, b) = body(&bytes);
        let DsxMessage::DsaReq { flow, .. } = decode(ty, b).unwrap() else { panic!("not a DSA-REQ") };
        assert_eq!((flow.sfid, flow.cid), (Some(0x10), Some(0x1A0)));
        assert_eq!(flow.fixed_sdu_size, Some(100));
        assert_eq!(flow.arq, Some(arq));
    }

    #[test]
    fn test_rejected_rsp_and_short_messages() {
        let bytes = build_dsa_rsp(
            3,
            0x8002,
            ConfirmCode::RejectExceededDynamicServiceLimit,
            FlowDirection::Downlink,
            0,
            0,
            None,
            None,
            0,
        )
        .unwrap();
        // SF: pad, SFID, CID, ARQ disabled, CS marker
        assert_eq!(&bytes[7..12], &[0x80, 0x02, 13, 146, 17]);
        let (ty, b) = body(&bytes);
        let DsxMessage::DsaRsp { cc, flow, .. } = decode(ty, b).unwrap() else { panic!("not a DSA-RSP") };
        assert_eq!(cc, ConfirmCode::RejectExceededDynamicServiceLimit);
        assert_eq!(flow.arq_enabled, Some(false));

        let dsd = build_dsd_rsp(3, 9, ConfirmCode::Ok, 0xABCD, 0).unwrap();
        assert_eq!(&dsd[6..14], &[18, 0, 9, 0, 0, 0, 0xAB, 0xCD]);
        let (ty, b) = body(&dsd);
        assert_eq!(decode(ty, b).unwrap(), DsxMessage::DsdRsp { transaction_id: 9, cc: ConfirmCode::Ok, sfid: 0xABCD });

        assert!(decode(MgmtMessageType::DsdReq, &[0, 1, 2]).is_err());
        assert!(decode(MgmtMessageType::DsaAck, &[0, 1, 99]).is_err());
    }
}
