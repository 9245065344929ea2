//! IEEE 802.16 MAC protocol engine

use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use wimax_core::constants::{
    DSX_REQ_RETRIES, DSX_RSP_RETRIES, DSX_T10_INTERVAL, DSX_T14_INTERVAL, DSX_T7_INTERVAL, DSX_T8_INTERVAL,
};
use wimax_core::{ArqSettings, Cid, CodecError, DuplexMode, MacAddress, MgmtMessageType, ServiceType, StationClass, TransactionId};

pub mod arq;
pub mod classifier;
pub mod dsx;
pub mod fragment;
pub mod packet;
pub mod qos;
pub mod role;
pub mod service_flow;
pub mod station;
pub mod timer;

pub use classifier::{ClassifierKey, ClassifierKind, ConvergenceSublayer, CsfId};
pub use packet::{NetworkType, OutboundPacket, Sdu};
pub use qos::QosResolver;
pub use role::{BaseStationRole, StationRole, SubscriberRole};
pub use service_flow::{FlowId, FlowStatus, ServiceFlow, ServiceFlowTable};
pub use station::{ClassifyOutcome, DeliveredSdu, MacStation, MacStats, OutboundPdu};
pub use timer::{EventQueue, MacTimer, Scheduler, TimerHandle};

#[derive(Debug, Error)]
pub enum MacError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("no service flow on CID {0}")]
    UnknownConnection(Cid),

    #[error("no service flow {0:?}")]
    UnknownFlow(FlowId),

    #[error("no outstanding transaction {0:#06x}")]
    UnknownTransaction(TransactionId),

    #[error("malformed {0:?} message")]
    Malformed(MgmtMessageType),

    #[error("subscriber {0:02x?} is not registered")]
    UnknownSubscriber(MacAddress),

    #[error("frame duration {0:?} is outside the range of the ARQ timers")]
    FrameDuration(Duration),

    #[error("CID space exhausted")]
    CidExhausted,

    #[error("service flow limit reached")]
    FlowLimit,

    #[error("unparsable packet: {0}")]
    BadPacket(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DsxTimerConfig {
    pub t7: Duration,
    pub t8: Duration,
    pub t10: Duration,
    pub t14: Duration,
    pub req_retries: u8,
    pub rsp_retries: u8,
}

impl Default for DsxTimerConfig {
    fn default() -> Self {
        Self {
            t7: DSX_T7_INTERVAL,
            t8: DSX_T8_INTERVAL,
            t10: DSX_T10_INTERVAL,
            t14: DSX_T14_INTERVAL,
            req_retries: DSX_REQ_RETRIES,
            rsp_retries: DSX_RSP_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacConfig {
    pub duplex: DuplexMode,
    pub mobility_enabled: bool,
    pub station_class: StationClass,
    pub frame_duration: Duration,
    pub packing_enabled: bool,
    pub crc_enabled: bool,
    pub arq_enabled: bool,
    pub arq: ArqSettings,
    pub dsx: DsxTimerConfig,
    pub classifier_removal_delay: Duration,
    pub fragment_classifier_capacity: usize,
    pub ip_fragment_hold_time: Duration,
    pub fragment_hold_margin: Duration,
    pub max_queue_len: usize,
    pub max_flows_per_subscriber: usize,
    /// BS admission control caps the sustained rate of new flows.
    pub sustained_rate_cap: Option<u32>,
    /// DSCP (ToS >> 2) to scheduling service.
    pub tos_service_map: Vec<(u8, ServiceType)>,
    pub hmac_key_seq: u8,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            duplex: DuplexMode::Tdd,
            mobility_enabled: false,
            station_class: StationClass::Default,
            frame_duration: Duration::from_millis(5),
            packing_enabled: false,
            crc_enabled: true,
            arq_enabled: false,
            arq: ArqSettings::default(),
            dsx: DsxTimerConfig::default(),
            classifier_removal_delay: Duration::from_secs(10),
            fragment_classifier_capacity: 100,
            ip_fragment_hold_time: Duration::from_secs(30),
            fragment_hold_margin: Duration::from_secs(1),
            max_queue_len: 256,
            max_flows_per_subscriber: 32,
            sustained_rate_cap: None,
            tos_service_map: qos::default_tos_map(),
            hmac_key_seq: 0,
        }
    }
}

impl MacConfig {
    pub fn crc_size(&self) -> usize {
        if self.crc_enabled {
            wimax_core::constants::CRC_SIZE
        } else {
            0
        }
    }
}
