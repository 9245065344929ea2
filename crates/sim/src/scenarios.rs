//! End-to-end scenarios over the simulated air link
//!
//! Each scenario builds one cell (a base station and `subscribers`
//! subscribers registered with it), offers CBR traffic, lets the air go
//! quiet and reports what came out the other end.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use log::info;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use wimax_core::{AppProfile, MacAddress, PduTag};
use wimax_mac::packet::ipv4_udp;
use wimax_mac::{BaseStationRole, MacStation, NetworkType, OutboundPacket, Sdu, SubscriberRole};

use crate::link::{AirLink, LinkStats};
use crate::runner::{Delivery, StationHandle, StationReport, StationRunner};
use crate::{ScenarioConfig, SimError};

pub const BS_ADDRESS: MacAddress = [0x02, 0x16, 0, 0, 0, 0x01];
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 1, 1, 1);
const BS_IP: Ipv4Addr = Ipv4Addr::new(10, 16, 0, 1);
const SOURCE_PORT: u16 = 5000;
const SINK_PORT: u16 = 6000;
const IPPROTO_UDP: u8 = 17;

pub fn subscriber_address(index: usize) -> MacAddress {
    let [hi, lo] = (index as u16 + 1).to_be_bytes();
    [0x02, 0x16, 0, 1, hi, lo]
}

fn subscriber_ip(index: usize) -> Ipv4Addr {
    let [hi, lo] = (index as u16 + 2).to_be_bytes();
    Ipv4Addr::new(10, 16, hi, lo)
}

#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub name: &'static str,
    /// SDUs that should have arrived somewhere.
    pub offered: u64,
    /// Distinct SDUs that did.
    pub delivered: u64,
    pub duplicates: u64,
    pub delivered_bytes: u64,
    pub elapsed: Duration,
    pub link: LinkStats,
    pub base_station: StationReport,
    pub subscribers: Vec<StationReport>,
}

impl ScenarioReport {
    pub fn delivery_ratio(&self) -> f64 {
        if self.offered == 0 {
            return 1.0;
        }
        self.delivered as f64 / self.offered as f64
    }

    fn stations(&self) -> impl Iterator<Item = &StationReport> {
        std::iter::once(&self.base_station).chain(self.subscribers.iter())
    }

    pub fn retransmissions(&self) -> u64 {
        self.stations().map(|s| s.mac.arq.blocks_retransmitted).sum()
    }

    pub fn management_messages(&self) -> u64 {
        self.stations().map(|s| s.mac.mgmt_sent).sum()
    }

    pub fn abandoned_transactions(&self) -> u64 {
        self.stations().map(|s| s.mac.dsx_abandoned).sum()
    }
}

struct Cell {
    link: AirLink,
    bs: StationHandle,
    subscribers: Vec<StationHandle>,
    bs_task: JoinHandle<StationReport>,
    ss_tasks: Vec<JoinHandle<StationReport>>,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    started: Instant,
}

async fn build_cell(config: &ScenarioConfig) -> Result<Cell, SimError> {
    let link = AirLink::new(config.link.clone())?;
    let (sink, deliveries) = mpsc::unbounded_channel();

    let mut bs = MacStation::new(config.mac.clone(), BaseStationRole::new(BS_ADDRESS))?;
    let mut stations = Vec::with_capacity(config.subscribers);
    for index in 0..config.subscribers {
        let address = subscriber_address(index);
        let entry = bs.register_subscriber(address)?;
        let role = SubscriberRole::new(address, BS_ADDRESS, entry.basic_cid);
        stations.push(MacStation::new(config.mac.clone(), role)?);
    }

    let (runner, bs_handle) = StationRunner::new(bs, link.clone(), sink.clone()).await;
    let bs_task = tokio::spawn(runner.run());
    let mut subscribers = Vec::with_capacity(stations.len());
    let mut ss_tasks = Vec::with_capacity(stations.len());
    for station in stations {
        let (runner, handle) = StationRunner::new(station, link.clone(), sink.clone()).await;
        ss_tasks.push(tokio::spawn(runner.run()));
        subscribers.push(handle);
    }

    Ok(Cell { link, bs: bs_handle, subscribers, bs_task, ss_tasks, deliveries, started: Instant::now() })
}

impl Cell {
    /// Waits out the drain period, stops every station and tallies the
    /// deliveries.
    async fn finish(self, name: &'static str, offered: u64, drain: Duration) -> Result<ScenarioReport, SimError> {
        sleep(drain).await;
        let Cell { link, bs, subscribers, bs_task, ss_tasks, mut deliveries, started } = self;
        drop(bs);
        drop(subscribers);

        let base_station = bs_task.await?;
        let mut reports = Vec::with_capacity(ss_tasks.len());
        for task in ss_tasks {
            reports.push(task.await?);
        }

        let mut seen = HashSet::new();
        let (mut delivered, mut duplicates, mut delivered_bytes) = (0, 0, 0);
        while let Ok(d) = deliveries.try_recv() {
            let tag = d.sdu.sdu.tag;
            if seen.insert((d.station, d.sdu.source, tag.origin, tag.sequence)) {
                delivered += 1;
                delivered_bytes += d.sdu.sdu.len() as u64;
            } else {
                duplicates += 1;
            }
        }

        let report = ScenarioReport {
            name,
            offered,
            delivered,
            duplicates,
            delivered_bytes,
            elapsed: started.elapsed(),
            link: link.stats().await,
            base_station,
            subscribers: reports,
        };
        info!(
            "{name}: {}/{} delivered ({:.1}%), {} retransmitted blocks",
            report.delivered,
            report.offered,
            report.delivery_ratio() * 100.0,
            report.retransmissions()
        );
        Ok(report)
    }
}

fn cbr_packet(
    config: &ScenarioConfig,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    origin: u32,
    sequence: u64,
    next_hop: MacAddress,
) -> OutboundPacket {
    let payload = ipv4_udp(src, dst, SOURCE_PORT, SINK_PORT, 0, config.payload_len);
    OutboundPacket {
        sdu: Sdu { payload, tag: PduTag { origin, sequence, protocol: IPPROTO_UDP, virtual_size: 0 } },
        next_hop,
        network: NetworkType::Ipv4,
        priority: 0,
        app: AppProfile::Cbr { interval: config.packet_interval },
    }
}

/// Every subscriber sends a CBR stream to the base station.
pub async fn cbr_uplink(config: &ScenarioConfig) -> Result<ScenarioReport, SimError> {
    let cell = build_cell(config).await?;
    let mut ticker = interval(config.packet_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    for sequence in 0..config.packets {
        ticker.tick().await;
        for (index, ss) in cell.subscribers.iter().enumerate() {
            let packet = cbr_packet(config, subscriber_ip(index), BS_IP, index as u32 + 1, sequence, BS_ADDRESS);
            ss.send(packet).await?;
        }
    }

    let offered = config.packets * config.subscribers as u64;
    cell.finish("cbr_uplink", offered, config.drain).await
}

/// The base station sends one CBR stream to a multicast group; every
/// subscriber should receive all of it.
pub async fn multicast_downlink(config: &ScenarioConfig) -> Result<ScenarioReport, SimError> {
    let cell = build_cell(config).await?;
    let mut ticker = interval(config.packet_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    for sequence in 0..config.packets {
        ticker.tick().await;
        let packet = cbr_packet(config, BS_IP, MULTICAST_GROUP, 0, sequence, BS_ADDRESS);
        cell.bs.send(packet).await?;
    }

    let offered = config.packets * config.subscribers as u64;
    cell.finish("multicast_downlink", offered, config.drain).await
}
