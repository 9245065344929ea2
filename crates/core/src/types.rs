use std::time::Duration;

use serde::{Deserialize, Serialize};

pub type Cid = u16;
pub type Sfid = u32;
pub type TransactionId = u16;
pub type Bsn = u16;
pub type MacAddress = [u8; 6];

pub const BROADCAST_MAC: MacAddress = [0xff; 6];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StationType {
    BaseStation,
    Subscriber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DuplexMode {
    Tdd,
    Fdd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowDirection {
    Uplink,
    Downlink,
}

/// Which side of a service flow started the DSA exchange that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowInitiation {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ServiceType {
    Be = 0,
    NrtPs = 1,
    RtPs = 2,
    Ugs = 3,
    ErtPs = 4,
}

impl ServiceType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Be),
            1 => Some(Self::NrtPs),
            2 => Some(Self::RtPs),
            3 => Some(Self::Ugs),
            4 => Some(Self::ErtPs),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StationClass {
    Unknown = 0,
    Gold = 1,
    Silver = 2,
    Bronze = 3,
    AppSpecified = 98,
    Default = 99,
}

/// DSx confirmation codes carried in RSP/ACK messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConfirmCode {
    Ok = 0,
    RejectOther = 1,
    RejectUnrecognizedConfigSetting = 2,
    RejectTempResource = 3,
    RejectPermResource = 4,
    RejectNotOwner = 5,
    RejectServiceFlowNotFound = 6,
    RejectServiceFlowExists = 7,
    RejectRequiredParamNotPresent = 8,
    RejectHeaderSuppression = 9,
    RejectUnknownTransactionId = 10,
    RejectAuthenticationFailure = 11,
    RejectAddAborted = 12,
    RejectExceededDynamicServiceLimit = 13,
    RejectNotAuthorizedForSaid = 14,
    RejectFailToEstablishSa = 15,
    RejectNotSupportedParam = 16,
    RejectNotSupportedParamValue = 17,
}

impl ConfirmCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        use ConfirmCode::*;
        const ALL: [ConfirmCode; 18] = [
            Ok,
            RejectOther,
            RejectUnrecognizedConfigSetting,
            RejectTempResource,
            RejectPermResource,
            RejectNotOwner,
            RejectServiceFlowNotFound,
            RejectServiceFlowExists,
            RejectRequiredParamNotPresent,
            RejectHeaderSuppression,
            RejectUnknownTransactionId,
            RejectAuthenticationFailure,
            RejectAddAborted,
            RejectExceededDynamicServiceLimit,
            RejectNotAuthorizedForSaid,
            RejectFailToEstablishSa,
            RejectNotSupportedParam,
            RejectNotSupportedParamValue,
        ];
        ALL.get(v as usize).copied()
    }

    pub fn is_ok(self) -> bool {
        self == ConfirmCode::Ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosParameters {
    pub priority: u8,
    pub min_pkt_size: u32,
    pub max_pkt_size: u32,
    /// bits per second
    pub max_sustained_rate: u32,
    /// bits per second
    pub min_reserved_rate: u32,
    pub max_latency: Duration,
    pub tolerated_jitter: Duration,
}

impl QosParameters {
    /// Compares everything a DSC would renegotiate. Priority rides along
    /// with the packet and never triggers a change on its own.
    pub fn differs_from(&self, other: &QosParameters) -> bool {
        self.min_pkt_size != other.min_pkt_size
            || self.max_pkt_size != other.max_pkt_size
            || self.max_sustained_rate != other.max_sustained_rate
            || self.min_reserved_rate != other.min_reserved_rate
            || self.max_latency != other.max_latency
            || self.tolerated_jitter != other.tolerated_jitter
    }
}

impl Default for QosParameters {
    fn default() -> Self {
        Self {
            priority: 0,
            min_pkt_size: 1024,
            max_pkt_size: 512,
            max_sustained_rate: 100_000,
            min_reserved_rate: 100_000,
            max_latency: Duration::from_millis(150),
            tolerated_jitter: Duration::from_micros(1000),
        }
    }
}

/// ARQ knobs as configured, in frame units (block size in bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArqSettings {
    pub window_size: u16,
    pub retry_timeout_tx_frames: u32,
    pub retry_timeout_rx_frames: u32,
    /// Block lifetime as a multiple of the retry timeout.
    pub block_lifetime_retries: u32,
    pub sync_loss_frames: u32,
    pub rx_purge_frames: u32,
    pub block_size: u16,
    pub deliver_in_order: bool,
}

impl Default for ArqSettings {
    fn default() -> Self {
        Self {
            window_size: 256,
            retry_timeout_tx_frames: 4,
            retry_timeout_rx_frames: 4,
            block_lifetime_retries: 2,
            sync_loss_frames: 32,
            rx_purge_frames: 28,
            block_size: 64,
            deliver_in_order: true,
        }
    }
}

/// ARQ parameters of one connection, converted to absolute time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArqParameters {
    pub window_size: u16,
    pub retry_timeout_tx_delay: Duration,
    pub retry_timeout_rx_delay: Duration,
    pub block_lifetime: Duration,
    pub sync_loss_timeout: Duration,
    pub rx_purge_timeout: Duration,
    pub block_size: u16,
    pub deliver_in_order: bool,
}

impl ArqParameters {
    pub fn retry_timeout(&self) -> Duration {
        self.retry_timeout_tx_delay + self.retry_timeout_rx_delay
    }
}

/// Simulation metadata that travels next to a data PDU, the way a
/// simulator attaches message info out of band.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PduTag {
    pub origin: u32,
    pub sequence: u64,
    pub protocol: u8,
    /// Size the SDU accounts for beyond its real bytes.
    pub virtual_size: u32,
}

/// Declared traffic profile of the application that produced a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AppProfile {
    #[default]
    Unknown,
    Cbr { interval: Duration },
    Vbr { mean_interval: Duration, source_port: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_priority_is_not_a_change() {
        let a = QosParameters::default();
        let b = QosParameters { priority: 7, ..a };
        assert!(!a.differs_from(&b));

        let c = QosParameters { max_latency: Duration::from_millis(30), ..a };
        assert!(a.differs_from(&c));
    }

    #[test]
    fn test_confirm_code_range() {
        assert_eq!(ConfirmCode::from_u8(0), Some(ConfirmCode::Ok));
        assert_eq!(ConfirmCode::from_u8(13), Some(ConfirmCode::RejectExceededDynamicServiceLimit));
        assert_eq!(ConfirmCode::from_u8(17), Some(ConfirmCode::RejectNotSupportedParamValue));
        assert_eq!(ConfirmCode::from_u8(18), None);
    }
}
