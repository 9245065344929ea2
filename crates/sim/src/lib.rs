//! Simulation harness for the WiMAX MAC
//!
//! Stations run as tokio tasks and talk over a simulated air link with
//! configurable loss, latency, jitter and burst size. The MAC engine itself
//! stays synchronous; each [`runner::StationRunner`] maps tokio time onto the
//! engine's event queue.

pub mod link;
pub mod runner;
pub mod scenarios;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use wimax_core::{ArqSettings, MacAddress};
use wimax_mac::{MacConfig, MacError};

pub use link::{AirFrame, AirLink, LinkConfig, LinkStats};
pub use runner::{Delivery, RunnerStats, StationHandle, StationReport, StationRunner};
pub use scenarios::ScenarioReport;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("frame of {len} bytes exceeds the {mtu} byte burst")]
    FrameTooLarge { len: usize, mtu: usize },

    #[error("no station {} on the link", hex::encode(.0))]
    UnknownStation(MacAddress),

    #[error("station {} has stopped", hex::encode(.0))]
    StationGone(MacAddress),

    #[error("invalid link model: {0}")]
    InvalidLink(String),

    #[error("frame encoding failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("frame decoding failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("MAC error: {0}")]
    Mac(#[from] MacError),

    #[error("station task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Everything one scenario run needs: both ends of the MAC, the air in
/// between and the offered traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub mac: MacConfig,
    pub link: LinkConfig,
    pub subscribers: usize,
    /// Packets each traffic source offers.
    pub packets: u64,
    pub packet_interval: Duration,
    /// UDP payload bytes per packet.
    pub payload_len: usize,
    /// Quiet time after the last packet before the stations stop.
    pub drain: Duration,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            mac: MacConfig::default(),
            link: LinkConfig::default(),
            subscribers: 2,
            packets: 100,
            packet_interval: Duration::from_millis(20),
            payload_len: 200,
            drain: Duration::from_secs(3),
        }
    }
}

pub struct SimulationPresets;

impl SimulationPresets {
    pub fn good_conditions() -> ScenarioConfig {
        ScenarioConfig {
            mac: MacConfig { packing_enabled: true, ..MacConfig::default() },
            link: LinkConfig {
                mtu: 1500,
                bandwidth_bps: 20_000_000,
                packet_loss: 0.001,
                latency: Duration::from_millis(1),
                latency_jitter: Duration::from_micros(200),
                ..LinkConfig::default()
            },
            ..ScenarioConfig::default()
        }
    }

    pub fn average_conditions() -> ScenarioConfig {
        ScenarioConfig {
            mac: MacConfig { packing_enabled: true, arq_enabled: true, ..MacConfig::default() },
            link: LinkConfig {
                mtu: 1000,
                bandwidth_bps: 10_000_000,
                packet_loss: 0.02,
                latency: Duration::from_millis(3),
                latency_jitter: Duration::from_millis(1),
                ..LinkConfig::default()
            },
            ..ScenarioConfig::default()
        }
    }

    pub fn poor_conditions() -> ScenarioConfig {
        ScenarioConfig {
            mac: MacConfig {
                packing_enabled: true,
                arq_enabled: true,
                arq: ArqSettings {
                    retry_timeout_tx_frames: 8,
                    retry_timeout_rx_frames: 8,
                    block_lifetime_retries: 4,
                    ..ArqSettings::default()
                },
                ..MacConfig::default()
            },
            link: LinkConfig {
                mtu: 600,
                bandwidth_bps: 4_000_000,
                packet_loss: 0.10,
                latency: Duration::from_millis(5),
                latency_jitter: Duration::from_millis(2),
                ..LinkConfig::default()
            },
            ..ScenarioConfig::default()
        }
    }

    /// Deep fade: a quarter of all bursts never arrive.
    pub fn extreme_conditions() -> ScenarioConfig {
        ScenarioConfig {
            mac: MacConfig {
                packing_enabled: true,
                arq_enabled: true,
                arq: ArqSettings {
                    retry_timeout_tx_frames: 12,
                    retry_timeout_rx_frames: 12,
                    block_lifetime_retries: 6,
                    sync_loss_frames: 64,
                    ..ArqSettings::default()
                },
                ..MacConfig::default()
            },
            link: LinkConfig {
                mtu: 400,
                bandwidth_bps: 1_000_000,
                packet_loss: 0.25,
                latency: Duration::from_millis(10),
                latency_jitter: Duration::from_millis(5),
                ..LinkConfig::default()
            },
            drain: Duration::from_secs(6),
            ..ScenarioConfig::default()
        }
    }

    pub fn all() -> Vec<(&'static str, ScenarioConfig)> {
        vec![
            ("Good Conditions", Self::good_conditions()),
            ("Average Conditions", Self::average_conditions()),
            ("Poor Conditions", Self::poor_conditions()),
            ("Extreme Conditions", Self::extreme_conditions()),
        ]
    }
}
