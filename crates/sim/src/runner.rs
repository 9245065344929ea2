//! Drives one MAC station on tokio
//!
//! The runner owns the station and its event queue. Before every call into
//! the engine the queue's clock is set to the tokio time elapsed since the
//! runner started, so timers fire on the runtime's (possibly paused) clock.

use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use wimax_core::MacAddress;
use wimax_mac::{DeliveredSdu, EventQueue, MacStation, MacStats, OutboundPacket, OutboundPdu, StationRole};

use crate::link::{AirFrame, AirLink};
use crate::SimError;

const PACKET_QUEUE: usize = 1024;
const IDLE_WAKE: Duration = Duration::from_secs(3600);

/// An SDU handed up by `station`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub station: MacAddress,
    /// Time since the receiving runner started.
    pub at: Duration,
    pub sdu: DeliveredSdu,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerStats {
    pub packets_offered: u64,
    pub packets_dropped: u64,
    pub frames_received: u64,
    pub frames_undecodable: u64,
    pub pdus_rejected: u64,
    pub bursts_sent: u64,
    pub bursts_lost: u64,
    pub link_errors: u64,
}

#[derive(Debug, Clone)]
pub struct StationReport {
    pub address: MacAddress,
    pub mac: MacStats,
    pub runner: RunnerStats,
}

/// Upper-layer side of a running station. Dropping every handle stops it.
#[derive(Clone)]
pub struct StationHandle {
    address: MacAddress,
    packets: mpsc::Sender<OutboundPacket>,
}

impl StationHandle {
    pub fn address(&self) -> MacAddress {
        self.address
    }

    pub async fn send(&self, packet: OutboundPacket) -> Result<(), SimError> {
        self.packets.send(packet).await.map_err(|_| SimError::StationGone(self.address))
    }
}

pub struct StationRunner<R: StationRole> {
    station: MacStation<R>,
    timers: EventQueue,
    link: AirLink,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    packets: mpsc::Receiver<OutboundPacket>,
    sink: mpsc::UnboundedSender<Delivery>,
    epoch: Instant,
    stats: RunnerStats,
}

impl<R: StationRole> StationRunner<R> {
    pub async fn new(
        station: MacStation<R>,
        link: AirLink,
        sink: mpsc::UnboundedSender<Delivery>,
    ) -> (Self, StationHandle) {
        let address = station.address();
        let inbound = link.attach(address).await;
        let (tx, packets) = mpsc::channel(PACKET_QUEUE);
        let runner = Self {
            station,
            timers: EventQueue::new(),
            link,
            inbound,
            packets,
            sink,
            epoch: Instant::now(),
            stats: RunnerStats::default(),
        };
        (runner, StationHandle { address, packets: tx })
    }

    fn sync_clock(&mut self) {
        self.timers.set_now(self.epoch.elapsed());
    }

    fn offer(&mut self, packet: OutboundPacket) {
        self.sync_clock();
        self.stats.packets_offered += 1;
        if self.station.classify(packet, &mut self.timers).dropped {
            self.stats.packets_dropped += 1;
        }
    }

    fn receive(&mut self, buf: &[u8]) {
        self.sync_clock();
        self.stats.frames_received += 1;
        let frame = match AirFrame::decode(buf) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.frames_undecodable += 1;
                warn!("undecodable burst at {}: {e}", hex::encode(self.station.address()));
                return;
            }
        };
        if let Err(e) = self.station.receive_pdu(Bytes::from(frame.bytes), &frame.tags, &mut self.timers) {
            self.stats.pdus_rejected += 1;
            debug!("{} rejected a PDU from {}: {e}", hex::encode(self.station.address()), hex::encode(frame.from));
        }
    }

    fn fire_timers(&mut self) {
        self.sync_clock();
        while let Some((handle, timer)) = self.timers.pop_due() {
            self.station.handle_timer(handle, timer, &mut self.timers);
        }
    }

    async fn transmit_opportunity(&mut self) {
        self.sync_clock();
        let burst = self.link.config().mtu;
        for pdu in self.station.pull_pdus(burst, &mut self.timers) {
            self.transmit(pdu).await;
        }
    }

    async fn transmit(&mut self, pdu: OutboundPdu) {
        let frame = AirFrame { from: self.station.address(), to: pdu.peer, bytes: pdu.bytes.to_vec(), tags: pdu.tags };
        match self.link.send(frame).await {
            Ok(true) => self.stats.bursts_sent += 1,
            Ok(false) => self.stats.bursts_lost += 1,
            Err(e) => {
                self.stats.link_errors += 1;
                debug!("{} could not transmit: {e}", hex::encode(self.station.address()));
            }
        }
    }

    /// Sends whatever the engine queued and hands delivered SDUs up.
    async fn flush(&mut self) {
        for pdu in self.station.take_outbox() {
            self.transmit(pdu).await;
        }
        let station = self.station.address();
        let at = self.epoch.elapsed();
        for sdu in self.station.take_delivered() {
            if self.sink.send(Delivery { station, at, sdu }).is_err() {
                break;
            }
        }
    }

    /// Runs until every [`StationHandle`] is gone, then tears the station
    /// down and reports.
    pub async fn run(mut self) -> StationReport {
        let address = self.station.address();
        let mut frames = interval(self.station.config().frame_duration);
        frames.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = match self.timers.next_expiry() {
                Some(at) => self.epoch + at,
                None => Instant::now() + IDLE_WAKE,
            };
            tokio::select! {
                packet = self.packets.recv() => match packet {
                    Some(packet) => self.offer(packet),
                    None => break,
                },
                Some(buf) = self.inbound.recv() => self.receive(&buf),
                _ = sleep_until(wake) => self.fire_timers(),
                _ = frames.tick() => self.transmit_opportunity().await,
            }
            self.flush().await;
        }

        self.sync_clock();
        self.station.shutdown(&mut self.timers);
        self.flush().await;
        self.link.detach(address).await;

        let report = StationReport { address, mac: self.station.stats(), runner: self.stats };
        info!(
            "station {} stopped: {} packets offered, {} SDUs delivered, {} bursts lost",
            hex::encode(address),
            report.runner.packets_offered,
            report.mac.sdus_delivered,
            report.runner.bursts_lost
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LinkConfig;
    use std::net::Ipv4Addr;
    use wimax_core::{AppProfile, PduTag};
    use wimax_mac::packet::ipv4_udp;
    use wimax_mac::{BaseStationRole, MacConfig, NetworkType, Sdu, SubscriberRole};

    const BS: MacAddress = [2, 0, 0, 0, 0, 1];
    const SS: MacAddress = [2, 0, 0, 0, 0, 2];

    fn packet(sequence: u64) -> OutboundPacket {
        let payload = ipv4_udp(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1), 4000, 5000, 0, 120);
        OutboundPacket {
            sdu: Sdu { payload, tag: PduTag { origin: 2, sequence, protocol: 17, virtual_size: 0 } },
            next_hop: BS,
            network: NetworkType::Ipv4,
            priority: 0,
            app: AppProfile::Unknown,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_uplink_over_lossless_link() {
        let link = AirLink::new(LinkConfig::default()).unwrap();
        let (sink, mut deliveries) = mpsc::unbounded_channel();

        let mut bs = MacStation::new(MacConfig::default(), BaseStationRole::new(BS)).unwrap();
        let entry = bs.register_subscriber(SS).unwrap();
        let ss = MacStation::new(MacConfig::default(), SubscriberRole::new(SS, BS, entry.basic_cid)).unwrap();

        let (bs_runner, bs_handle) = StationRunner::new(bs, link.clone(), sink.clone()).await;
        let (ss_runner, ss_handle) = StationRunner::new(ss, link.clone(), sink).await;
        let bs_task = tokio::spawn(bs_runner.run());
        let ss_task = tokio::spawn(ss_runner.run());

        for seq in 0..10 {
            ss_handle.send(packet(seq)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop((bs_handle, ss_handle));

        let bs_report = bs_task.await.unwrap();
        let ss_report = ss_task.await.unwrap();

        let mut got = Vec::new();
        while let Ok(d) = deliveries.try_recv() {
            got.push(d);
        }
        assert_eq!(got.len(), 10);
        assert!(got.iter().all(|d| d.station == BS && d.sdu.source == SS));
        let sequences: Vec<u64> = got.iter().map(|d| d.sdu.sdu.tag.sequence).collect();
        assert_eq!(sequences, (0..10).collect::<Vec<_>>());

        assert_eq!(ss_report.runner.packets_offered, 10);
        // DSA-REQ and DSA-ACK up, DSA-RSP down
        assert_eq!(ss_report.mac.mgmt_sent, 2);
        assert_eq!(bs_report.mac.mgmt_sent, 1);
        assert_eq!(bs_report.mac.sdus_delivered, 10);
        assert_eq!(link.stats().await.frames_dropped, 0);
    }
}
