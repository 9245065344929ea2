//! Network-layer packets as seen by the convergence sublayer

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use wimax_core::{AppProfile, MacAddress, PduTag};

use crate::MacError;

pub const IPPROTO_IP: u8 = 0;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_IPV6: u8 = 41;
pub const IPPROTO_ICMPV6: u8 = 58;
pub const IPPROTO_OSPF: u8 = 89;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_ARP: u16 = 0x0806;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_MPLS: u16 = 0x8847;
const LLC_SNAP: [u8; 3] = [0xAA, 0xAA, 0x03];
const LLC_SNAP_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkType {
    Ipv4,
    Ipv6,
    Arp,
}

/// A MAC service data unit and the metadata that travels with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sdu {
    pub payload: Bytes,
    pub tag: PduTag,
}

impl Sdu {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct OutboundPacket {
    pub sdu: Sdu,
    pub next_hop: MacAddress,
    pub network: NetworkType,
    pub priority: u8,
    pub app: AppProfile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpFragment {
    pub id: u32,
    /// in 8-byte units
    pub offset: u16,
    pub more: bool,
}

impl IpFragment {
    pub fn is_first(&self) -> bool {
        self.offset == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub network: NetworkType,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub tos: u8,
    pub fragment: Option<IpFragment>,
}

impl PacketInfo {
    pub fn is_broadcast(&self) -> bool {
        self.network == NetworkType::Arp || self.dst == IpAddr::V4(Ipv4Addr::BROADCAST)
    }

    pub fn is_multicast(&self) -> bool {
        self.dst.is_multicast()
    }
}

fn take<'a>(buf: &'a [u8], at: usize, len: usize, what: &'static str) -> Result<&'a [u8], MacError> {
    buf.get(at..at + len).ok_or(MacError::BadPacket(what))
}

fn be16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

/// Strips LLC/SNAP and MPLS label stacks, returning the network payload
/// and the ethertype they announced.
fn skip_link_headers(buf: &[u8]) -> Result<(&[u8], Option<u16>), MacError> {
    if buf.len() < LLC_SNAP_LEN || buf[..3] != LLC_SNAP {
        return Ok((buf, None));
    }
    let mut ethertype = be16(&buf[6..8]);
    let mut rest = &buf[LLC_SNAP_LEN..];
    if ethertype == ETHERTYPE_MPLS {
        loop {
            let label = take(rest, 0, 4, "mpls label")?;
            rest = &rest[4..];
            if label[2] & 0x01 != 0 {
                break;
            }
        }
        ethertype = match rest.first() {
            Some(b) if b >> 4 == 6 => ETHERTYPE_IPV6,
            _ => ETHERTYPE_IPV4,
        };
    }
    Ok((rest, Some(ethertype)))
}

pub fn parse_packet(buf: &[u8], hint: NetworkType) -> Result<PacketInfo, MacError> {
    let (payload, ethertype) = skip_link_headers(buf)?;
    let network = match ethertype {
        Some(ETHERTYPE_ARP) => NetworkType::Arp,
        Some(ETHERTYPE_IPV6) => NetworkType::Ipv6,
        Some(ETHERTYPE_IPV4) => NetworkType::Ipv4,
        _ => hint,
    };
    match network {
        NetworkType::Arp => parse_arp(payload),
        NetworkType::Ipv4 => parse_ipv4(payload),
        NetworkType::Ipv6 => parse_ipv6(payload),
    }
}

fn parse_arp(buf: &[u8]) -> Result<PacketInfo, MacError> {
    let spa = take(buf, 14, 4, "arp sender")?;
    let tpa = take(buf, 24, 4, "arp target")?;
    Ok(PacketInfo {
        network: NetworkType::Arp,
        src: IpAddr::V4(Ipv4Addr::new(spa[0], spa[1], spa[2], spa[3])),
        dst: IpAddr::V4(Ipv4Addr::new(tpa[0], tpa[1], tpa[2], tpa[3])),
        protocol: IPPROTO_IP,
        src_port: 0,
        dst_port: 0,
        tos: 0,
        fragment: None,
    })
}

fn ports(l4: &[u8]) -> Result<(u16, u16), MacError> {
    let p = take(l4, 0, 4, "transport ports")?;
    Ok((be16(&p[0..2]), be16(&p[2..4])))
}

fn parse_ipv4(buf: &[u8]) -> Result<PacketInfo, MacError> {
    let h = take(buf, 0, 20, "ipv4 header")?;
    if h[0] >> 4 != 4 {
        return Err(MacError::BadPacket("ipv4 version"));
    }
    let ihl = ((h[0] & 0x0F) as usize) * 4;
    if ihl < 20 {
        return Err(MacError::BadPacket("ipv4 ihl"));
    }
    let flags_frag = be16(&h[6..8]);
    let more = flags_frag & 0x2000 != 0;
    let offset = flags_frag & 0x1FFF;
    let fragment = (more || offset > 0).then_some(IpFragment { id: be16(&h[4..6]) as u32, offset, more });

    let mut info = PacketInfo {
        network: NetworkType::Ipv4,
        src: IpAddr::V4(Ipv4Addr::new(h[12], h[13], h[14], h[15])),
        dst: IpAddr::V4(Ipv4Addr::new(h[16], h[17], h[18], h[19])),
        protocol: IPPROTO_IP,
        src_port: 0,
        dst_port: 0,
        tos: h[1],
        fragment,
    };
    let proto = h[9];
    if proto == IPPROTO_UDP || proto == IPPROTO_TCP {
        info.protocol = proto;
        // later fragments carry no transport header
        if fragment.map_or(true, |f| f.is_first()) {
            (info.src_port, info.dst_port) = ports(buf.get(ihl..).unwrap_or(&[]))?;
        }
    }
    Ok(info)
}

fn parse_ipv6(buf: &[u8]) -> Result<PacketInfo, MacError> {
    let h = take(buf, 0, 40, "ipv6 header")?;
    if h[0] >> 4 != 6 {
        return Err(MacError::BadPacket("ipv6 version"));
    }
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&h[8..24]);
    dst.copy_from_slice(&h[24..40]);
    let mut info = PacketInfo {
        network: NetworkType::Ipv6,
        src: IpAddr::V6(Ipv6Addr::from(src)),
        dst: IpAddr::V6(Ipv6Addr::from(dst)),
        protocol: IPPROTO_IPV6,
        src_port: 0,
        dst_port: 0,
        tos: ((h[0] & 0x0F) << 4) | (h[1] >> 4),
        fragment: None,
    };

    let mut next = h[6];
    let mut at = 40;
    loop {
        match next {
            // hop-by-hop, routing, destination options
            0 | 43 | 60 => {
                let ext = take(buf, at, 2, "ipv6 extension")?;
                next = ext[0];
                at += (ext[1] as usize + 1) * 8;
            }
            44 => {
                let frag = take(buf, at, 8, "ipv6 fragment header")?;
                let off_flags = be16(&frag[2..4]);
                let f = IpFragment {
                    id: u32::from_be_bytes([frag[4], frag[5], frag[6], frag[7]]),
                    offset: off_flags >> 3,
                    more: off_flags & 0x1 != 0,
                };
                info.fragment = Some(f);
                next = frag[0];
                at += 8;
                if !f.is_first() {
                    if next == IPPROTO_UDP || next == IPPROTO_TCP {
                        info.protocol = next;
                    }
                    return Ok(info);
                }
            }
            IPPROTO_UDP | IPPROTO_TCP => {
                info.protocol = next;
                (info.src_port, info.dst_port) = ports(buf.get(at..).unwrap_or(&[]))?;
                return Ok(info);
            }
            IPPROTO_ICMPV6 | IPPROTO_OSPF => {
                info.protocol = next;
                return Ok(info);
            }
            _ => return Ok(info),
        }
    }
}

/// Builds an IPv4/UDP datagram with a zero-filled payload of `payload_len`
/// bytes. Used to synthesise traffic.
pub fn ipv4_udp(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16, tos: u8, payload_len: usize) -> Bytes {
    ipv4_datagram(src, dst, IPPROTO_UDP, tos, 0, 0, false, &udp_segment(sport, dport, payload_len))
}

fn udp_segment(sport: u16, dport: u16, payload_len: usize) -> Vec<u8> {
    let mut seg = Vec::with_capacity(8 + payload_len);
    seg.extend_from_slice(&sport.to_be_bytes());
    seg.extend_from_slice(&dport.to_be_bytes());
    seg.extend_from_slice(&((8 + payload_len) as u16).to_be_bytes());
    seg.extend_from_slice(&[0, 0]);
    seg.resize(8 + payload_len, 0);
    seg
}

#[allow(clippy::too_many_arguments)]
pub fn ipv4_datagram(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    tos: u8,
    id: u16,
    frag_offset: u16,
    more_fragments: bool,
    body: &[u8],
) -> Bytes {
    let mut b = BytesMut::with_capacity(20 + body.len());
    b.put_u8(0x45);
    b.put_u8(tos);
    b.put_u16((20 + body.len()) as u16);
    b.put_u16(id);
    b.put_u16(((more_fragments as u16) << 13) | (frag_offset & 0x1FFF));
    b.put_u8(64);
    b.put_u8(protocol);
    b.put_u16(0);
    b.put_slice(&src.octets());
    b.put_slice(&dst.octets());
    b.put_slice(body);
    b.freeze()
}

/// Splits a UDP datagram into IPv4 fragments of at most `chunk` body bytes
/// (rounded down to a multiple of 8).
pub fn ipv4_udp_fragments(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    sport: u16,
    dport: u16,
    id: u16,
    payload_len: usize,
    chunk: usize,
) -> Vec<Bytes> {
    let seg = udp_segment(sport, dport, payload_len);
    let chunk = (chunk / 8).max(1) * 8;
    let pieces: Vec<_> = seg.chunks(chunk).collect();
    let last = pieces.len() - 1;
    pieces
        .iter()
        .enumerate()
        .map(|(i, body)| ipv4_datagram(src, dst, IPPROTO_UDP, 0, id, ((i * chunk) / 8) as u16, i < last, body))
        .collect()
}

pub fn ipv6_udp(src: Ipv6Addr, dst: Ipv6Addr, sport: u16, dport: u16, traffic_class: u8, payload_len: usize) -> Bytes {
    let seg = udp_segment(sport, dport, payload_len);
    let mut b = BytesMut::with_capacity(40 + seg.len());
    b.put_u8(0x60 | (traffic_class >> 4));
    b.put_u8(traffic_class << 4);
    b.put_u16(0);
    b.put_u16(seg.len() as u16);
    b.put_u8(IPPROTO_UDP);
    b.put_u8(64);
    b.put_slice(&src.octets());
    b.put_slice(&dst.octets());
    b.put_slice(&seg);
    b.freeze()
}

/// Wraps a network packet in an LLC/SNAP header.
pub fn llc_snap(ethertype: u16, packet: &[u8]) -> Bytes {
    let mut b = BytesMut::with_capacity(LLC_SNAP_LEN + packet.len());
    b.put_slice(&LLC_SNAP);
    b.put_slice(&[0, 0, 0]);
    b.put_u16(ethertype);
    b.put_slice(packet);
    b.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_udp_five_tuple() {
        let pkt = ipv4_udp(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), 5000, 6000, 0xB8, 100);
        let info = parse_packet(&pkt, NetworkType::Ipv4).unwrap();
        assert_eq!(info.protocol, IPPROTO_UDP);
        assert_eq!((info.src_port, info.dst_port), (5000, 6000));
        assert_eq!(info.tos, 0xB8);
        assert!(info.fragment.is_none());
    }

    #[test]
    fn test_ipv4_fragments_only_first_has_ports() {
        let frags = ipv4_udp_fragments(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            7,
            9,
            0x1234,
            100,
            48,
        );
        assert_eq!(frags.len(), 3);
        let first = parse_packet(&frags[0], NetworkType::Ipv4).unwrap();
        assert_eq!(first.fragment, Some(IpFragment { id: 0x1234, offset: 0, more: true }));
        assert_eq!((first.src_port, first.dst_port), (7, 9));

        let last = parse_packet(&frags[2], NetworkType::Ipv4).unwrap();
        assert_eq!(last.fragment, Some(IpFragment { id: 0x1234, offset: 12, more: false }));
        assert_eq!((last.src_port, last.dst_port), (0, 0));
        assert_eq!(last.protocol, IPPROTO_UDP);
    }

    #[test]
    fn test_llc_and_arp() {
        let mut arp = vec![0u8; 28];
        arp[14..18].copy_from_slice(&[192, 168, 1, 1]);
        arp[24..28].copy_from_slice(&[192, 168, 1, 7]);
        let framed = llc_snap(ETHERTYPE_ARP, &arp);
        let info = parse_packet(&framed, NetworkType::Ipv4).unwrap();
        assert_eq!(info.network, NetworkType::Arp);
        assert!(info.is_broadcast());
        assert_eq!(info.dst, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7)));
    }

    #[test]
    fn test_ipv6_udp() {
        let pkt = ipv6_udp(Ipv6Addr::LOCALHOST, "ff02::1".parse().unwrap(), 1, 2, 0x28, 10);
        let info = parse_packet(&pkt, NetworkType::Ipv6).unwrap();
        assert_eq!(info.protocol, IPPROTO_UDP);
        assert_eq!(info.tos, 0x28);
        assert!(info.is_multicast());
    }

    #[test]
    fn test_truncated_header_rejected() {
        assert!(parse_packet(&[0x45, 0, 0], NetworkType::Ipv4).is_err());
    }
}
