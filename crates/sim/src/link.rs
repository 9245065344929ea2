//! Simulated air link
//!
//! Every burst is bincode-encoded, may be lost, and arrives after its
//! airtime plus latency plus jitter. Bursts to the same station never
//! overtake each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Bernoulli, Distribution, Normal};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep_until, Instant};
use wimax_core::{MacAddress, PduTag};

use crate::SimError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Largest MAC PDU one burst carries.
    pub mtu: usize,
    pub bandwidth_bps: u64,
    pub packet_loss: f64,
    pub latency: Duration,
    /// Standard deviation of the extra delay.
    pub latency_jitter: Duration,
    pub seed: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            mtu: 1500,
            bandwidth_bps: 10_000_000,
            packet_loss: 0.0,
            latency: Duration::from_millis(2),
            latency_jitter: Duration::ZERO,
            seed: 0x802_16,
        }
    }
}

/// What actually crosses the air: one MAC PDU and its side tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AirFrame {
    pub from: MacAddress,
    pub to: MacAddress,
    pub bytes: Vec<u8>,
    pub tags: Vec<PduTag>,
}

impl AirFrame {
    pub fn encode(&self) -> Result<Vec<u8>, SimError> {
        Ok(bincode::serde::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, SimError> {
        let (frame, _) = bincode::serde::decode_from_slice(buf, bincode::config::standard())?;
        Ok(frame)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub frames_delivered: u64,
    pub bytes_sent: u64,
}

struct Wire {
    tx: mpsc::UnboundedSender<(Instant, Vec<u8>)>,
    last_arrival: Instant,
}

struct Channel {
    loss: Bernoulli,
    jitter: Normal<f64>,
    rng: StdRng,
    wires: HashMap<MacAddress, Wire>,
    stats: LinkStats,
}

#[derive(Clone)]
pub struct AirLink {
    config: Arc<LinkConfig>,
    channel: Arc<Mutex<Channel>>,
}

impl AirLink {
    pub fn new(config: LinkConfig) -> Result<Self, SimError> {
        let loss = Bernoulli::new(config.packet_loss).map_err(|e| SimError::InvalidLink(e.to_string()))?;
        let jitter =
            Normal::new(0.0, config.latency_jitter.as_secs_f64()).map_err(|e| SimError::InvalidLink(e.to_string()))?;
        let channel = Channel {
            loss,
            jitter,
            rng: StdRng::seed_from_u64(config.seed),
            wires: HashMap::new(),
            stats: LinkStats::default(),
        };
        Ok(Self { config: Arc::new(config), channel: Arc::new(Mutex::new(channel)) })
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Puts a station on the air. Encoded frames addressed to it come out
    /// of the returned receiver once they have crossed the link. Must be
    /// called from inside a tokio runtime.
    pub async fn attach(&self, address: MacAddress) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (wire_tx, mut wire_rx) = mpsc::unbounded_channel::<(Instant, Vec<u8>)>();
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = self.channel.clone();
        tokio::spawn(async move {
            while let Some((at, frame)) = wire_rx.recv().await {
                sleep_until(at).await;
                channel.lock().await.stats.frames_delivered += 1;
                if tx.send(frame).is_err() {
                    break;
                }
            }
        });

        let wire = Wire { tx: wire_tx, last_arrival: Instant::now() };
        self.channel.lock().await.wires.insert(address, wire);
        debug!("station {} attached to the link", hex::encode(address));
        rx
    }

    pub async fn detach(&self, address: MacAddress) {
        self.channel.lock().await.wires.remove(&address);
    }

    /// Transmits one burst. `Ok(false)` means the air ate it.
    pub async fn send(&self, frame: AirFrame) -> Result<bool, SimError> {
        if frame.bytes.len() > self.config.mtu {
            return Err(SimError::FrameTooLarge { len: frame.bytes.len(), mtu: self.config.mtu });
        }
        let encoded = frame.encode()?;

        let mut guard = self.channel.lock().await;
        let ch = &mut *guard;
        if !ch.wires.contains_key(&frame.to) {
            return Err(SimError::UnknownStation(frame.to));
        }
        ch.stats.frames_sent += 1;
        ch.stats.bytes_sent += encoded.len() as u64;
        if ch.loss.sample(&mut ch.rng) {
            ch.stats.frames_dropped += 1;
            debug!("burst {} -> {} lost", hex::encode(frame.from), hex::encode(frame.to));
            return Ok(false);
        }

        let airtime = Duration::from_secs_f64((encoded.len() * 8) as f64 / self.config.bandwidth_bps.max(1) as f64);
        let jitter = Duration::from_secs_f64(ch.jitter.sample(&mut ch.rng).abs());
        let Some(wire) = ch.wires.get_mut(&frame.to) else {
            return Err(SimError::UnknownStation(frame.to));
        };
        let at = (Instant::now() + airtime + self.config.latency + jitter).max(wire.last_arrival);
        wire.last_arrival = at;
        trace!("{} byte burst to {} lands in {:?}", encoded.len(), hex::encode(frame.to), at - Instant::now());

        if wire.tx.send((at, encoded)).is_err() {
            ch.wires.remove(&frame.to);
            return Err(SimError::UnknownStation(frame.to));
        }
        Ok(true)
    }

    pub async fn stats(&self) -> LinkStats {
        self.channel.lock().await.stats
    }
}
