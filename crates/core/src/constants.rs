//! Protocol constants of the 802.16 MAC

use std::time::Duration;

use crate::types::{Bsn, Cid, TransactionId};

pub const MAC_HEADER_SIZE: usize = 6;
pub const CRC_SIZE: usize = 4;
pub const MAX_PDU_SIZE: usize = 2047;
pub const MAX_MGMT_MSG_SIZE: usize = 3000;

// CID space, m = CID_BLOCK_M
pub const INITIAL_RANGING_CID: Cid = 0x0000;
pub const CID_BLOCK_M: Cid = 200;
pub const BASIC_CID_START: Cid = 0x0001;
pub const BASIC_CID_END: Cid = CID_BLOCK_M;
pub const PRIMARY_CID_START: Cid = CID_BLOCK_M + 1;
pub const PRIMARY_CID_END: Cid = 2 * CID_BLOCK_M;
pub const TRANSPORT_CID_START: Cid = 2 * CID_BLOCK_M + 1;
pub const TRANSPORT_CID_END: Cid = 0xFEFE;
pub const BROADCAST_CID: Cid = 0xFFFF;

pub const SS_TRANSACTION_ID_START: TransactionId = 0x0000;
pub const SS_TRANSACTION_ID_END: TransactionId = 0x7FFF;
pub const BS_TRANSACTION_ID_START: TransactionId = 0x8000;
pub const BS_TRANSACTION_ID_END: TransactionId = 0xFFFF;

// DSx
pub const DSX_REQ_RETRIES: u8 = 3;
pub const DSX_RSP_RETRIES: u8 = 3;
pub const DSX_T7_INTERVAL: Duration = Duration::from_secs(1);
pub const DSX_T8_INTERVAL: Duration = Duration::from_millis(200);
pub const DSX_T10_INTERVAL: Duration = Duration::from_secs(3);
pub const DSX_T14_INTERVAL: Duration = Duration::from_millis(200);
pub const QOS_PARAM_SET_ADMISSION: u8 = 0x6;
pub const HMAC_TUPLE_LEN: u8 = 21;
pub const HMAC_DIGEST_LEN: usize = 20;
pub const FIXED_LENGTH_SDU: u8 = 1;
pub const VARIABLE_LENGTH_SDU: u8 = 0;
pub const DEFAULT_FIXED_LENGTH_SDU_SIZE: u32 = 49;
pub const FRAGMENTED_MAX_FIXED_LENGTH_PACKET_SIZE: u32 = 128;

// Fragmentation
pub const FSN_MODULUS: u8 = 8;

// ARQ
pub const ARQ_BSN_MODULUS: Bsn = 2048;
pub const ARQ_DEFAULT_WINDOW_SIZE: u16 = 256;
pub const ARQ_DEFAULT_BLOCK_SIZE: u16 = 64;
pub const ARQ_MAX_BLOCK_SIZE: u16 = 2040;
pub const ARQ_MAX_RESET_RETRY: u8 = 6;
pub const ARQ_MAX_RETRY_TIMEOUT_TX_DELAY: Duration = Duration::from_micros(655_350);
pub const ARQ_MAX_RETRY_TIMEOUT_RX_DELAY: Duration = Duration::from_micros(655_350);
pub const ARQ_MAX_RETRY_TIMEOUT_DELAY: Duration = Duration::from_micros(1_310_700);
pub const ARQ_MAX_BLOCK_LIFETIME: Duration = Duration::from_micros(655_350);
pub const ARQ_MAX_SYNC_LOSS_TIMEOUT: Duration = Duration::from_micros(655_350);
pub const ARQ_MAX_RX_PURGE_TIMEOUT: Duration = Duration::from_micros(655_350);
/// ARQ durations travel in TLVs as 10 microsecond ticks.
pub const ARQ_TLV_TICK: Duration = Duration::from_micros(10);

/// Management message type byte following the generic MAC header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MgmtMessageType {
    DsaReq = 11,
    DsaRsp = 12,
    DsaAck = 13,
    DscReq = 14,
    DscRsp = 15,
    DscAck = 16,
    DsdReq = 17,
    DsdRsp = 18,
    DsxRvd = 30,
    ArqFeedback = 33,
    ArqDiscard = 34,
    ArqReset = 35,
}

impl TryFrom<u8> for MgmtMessageType {
    type Error = crate::CodecError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            11 => Self::DsaReq,
            12 => Self::DsaRsp,
            13 => Self::DsaAck,
            14 => Self::DscReq,
            15 => Self::DscRsp,
            16 => Self::DscAck,
            17 => Self::DsdReq,
            18 => Self::DsdRsp,
            30 => Self::DsxRvd,
            33 => Self::ArqFeedback,
            34 => Self::ArqDiscard,
            35 => Self::ArqReset,
            other => return Err(crate::CodecError::UnknownMessageType(other)),
        })
    }
}

pub mod tlv {
    pub const COMMON_HMAC_TUPLE: u8 = 149;
    pub const COMMON_DL_SERVICE_FLOW: u8 = 146;
    pub const COMMON_UL_SERVICE_FLOW: u8 = 145;

    pub const DSX_SERVICE_FLOW_ID: u8 = 1;
    pub const DSX_CID: u8 = 2;
    pub const DSX_QOS_PARAM_SET_TYPE: u8 = 5;
    pub const DSX_TRAFFIC_PRIORITY: u8 = 6;
    pub const DSX_MAX_SUSTAINED_RATE: u8 = 7;
    pub const DSX_MAX_TRAFFIC_BURST: u8 = 8;
    pub const DSX_MIN_RESERVED_RATE: u8 = 9;
    pub const DSX_MIN_TOLERABLE_RATE: u8 = 10;
    pub const DSX_SERVICE_TYPE: u8 = 11;
    pub const DSX_TOLERATED_JITTER: u8 = 13;
    pub const DSX_MAX_LATENCY: u8 = 14;
    pub const DSX_FIX_LEN_VAR_LEN_SDU: u8 = 15;
    pub const DSX_SDU_SIZE: u8 = 16;
    pub const DSX_ARQ_ENABLE: u8 = 18;
    pub const DSX_ARQ_WINDOW_SIZE: u8 = 19;
    pub const DSX_ARQ_RETRY_TIMEOUT_TX_DELAY: u8 = 20;
    pub const DSX_ARQ_RETRY_TIMEOUT_RX_DELAY: u8 = 21;
    pub const DSX_ARQ_BLOCK_LIFETIME: u8 = 22;
    pub const DSX_ARQ_SYNC_LOSS_TIMEOUT: u8 = 23;
    pub const DSX_ARQ_DELIVER_IN_ORDER: u8 = 24;
    pub const DSX_ARQ_RX_PURGE_TIMEOUT: u8 = 25;
    pub const DSX_ARQ_BLOCK_SIZE: u8 = 26;
    pub const DSX_CS_SPEC: u8 = 28;
    pub const DSX_TRAFFIC_INDICATION_PREFERENCE: u8 = 34;
    pub const DSX_CS_TYPE_IPV4: u8 = 100;
    pub const DSX_CS_TYPE_IPV6: u8 = 101;

    pub const CS_PACKET_CLASSIFIER_RULE: u8 = 3;
    pub const CS_PACKET_PROTOCOL: u8 = 3;
    pub const CS_PACKET_IP_SRC_ADDR: u8 = 4;
    pub const CS_PACKET_IP_DEST_ADDR: u8 = 5;
    pub const CS_PACKET_SRC_PORT_RANGE: u8 = 6;
    pub const CS_PACKET_DEST_PORT_RANGE: u8 = 7;
}
