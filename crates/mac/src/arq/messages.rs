//! ARQ management messages: feedback, discard and reset

use bytes::Bytes;
use wimax_core::{Bsn, Cid, CodecError, MgmtMessageType, TlvWriter};

pub const ACK_TYPE_SELECTIVE: u8 = 0;
pub const ACK_TYPE_CUMULATIVE: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ArqResetType {
    Initiator = 0,
    AckRsp = 1,
    ConfirmInitiator = 2,
}

impl ArqResetType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Initiator),
            1 => Some(Self::AckRsp),
            2 => Some(Self::ConfirmInitiator),
            _ => None,
        }
    }
}

/// One feedback information element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackIe {
    pub cid: Cid,
    pub last: bool,
    pub ack_type: u8,
    pub bsn: Bsn,
    pub num_ack_maps: u8,
}

impl FeedbackIe {
    pub fn cumulative(cid: Cid, bsn: Bsn) -> Self {
        Self { cid, last: true, ack_type: ACK_TYPE_CUMULATIVE, bsn, num_ack_maps: 1 }
    }

    fn encode(&self) -> [u8; 4] {
        let cid = self.cid.to_be_bytes();
        [
            cid[0],
            cid[1],
            ((self.last as u8) << 7) | ((self.ack_type & 0x03) << 5) | ((self.bsn >> 6) as u8 & 0x1F),
            (((self.bsn & 0x3F) as u8) << 2) | (self.num_ack_maps & 0x03),
        ]
    }

    fn decode(b: &[u8]) -> Self {
        Self {
            cid: u16::from_be_bytes([b[0], b[1]]),
            last: b[2] & 0x80 != 0,
            ack_type: (b[2] >> 5) & 0x03,
            bsn: (((b[2] & 0x1F) as u16) << 6) | (b[3] >> 2) as u16,
            num_ack_maps: b[3] & 0x03,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArqMessage {
    Feedback(FeedbackIe),
    Discard { cid: Cid, bsn: Bsn },
    Reset { cid: Cid, reset: ArqResetType },
}

impl ArqMessage {
    pub fn cid(&self) -> Cid {
        match self {
            Self::Feedback(ie) => ie.cid,
            Self::Discard { cid, .. } | Self::Reset { cid, .. } => *cid,
        }
    }

    /// Full management PDU sent on the peer's basic CID.
    pub fn encode(&self, mgmt_cid: Cid) -> Result<Bytes, CodecError> {
        let mut w;
        match self {
            Self::Feedback(ie) => {
                w = TlvWriter::management(mgmt_cid, MgmtMessageType::ArqFeedback as u8);
                w.put_bytes(&ie.encode());
            }
            Self::Discard { cid, bsn } => {
                w = TlvWriter::management(mgmt_cid, MgmtMessageType::ArqDiscard as u8);
                w.put_u16(*cid).put_byte((bsn >> 8) as u8 & 0x07).put_byte((bsn & 0xFF) as u8);
            }
            Self::Reset { cid, reset } => {
                w = TlvWriter::management(mgmt_cid, MgmtMessageType::ArqReset as u8);
                w.put_u16(*cid).put_byte(*reset as u8);
            }
        }
        w.finish()
    }

    /// Parses the body that follows the message type byte.
    pub fn decode(msg_type: MgmtMessageType, body: &[u8]) -> Result<Self, CodecError> {
        let need = match msg_type {
            MgmtMessageType::ArqFeedback | MgmtMessageType::ArqDiscard => 4,
            MgmtMessageType::ArqReset => 3,
            other => return Err(CodecError::UnknownMessageType(other as u8)),
        };
        if body.len() < need {
            return Err(CodecError::Truncated { needed: need, available: body.len() });
        }
        let cid = u16::from_be_bytes([body[0], body[1]]);
        Ok(match msg_type {
            MgmtMessageType::ArqFeedback => Self::Feedback(FeedbackIe::decode(body)),
            MgmtMessageType::ArqDiscard => {
                Self::Discard { cid, bsn: (((body[2] & 0x07) as u16) << 8) | body[3] as u16 }
            }
            _ => Self::Reset {
                cid,
                reset: ArqResetType::from_u8(body[2]).ok_or(CodecError::UnknownMessageType(body[2]))?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wimax_core::MacHeader;

    #[test]
    fn test_feedback_bit_layout() {
        let bytes = ArqMessage::Feedback(FeedbackIe::cumulative(0x1234, 0x5A5)).encode(7).unwrap();
        assert_eq!(bytes.len(), MacHeader::SIZE + 5);
        let header = MacHeader::decode(&bytes).unwrap();
        assert_eq!((header.cid, header.len), (7, 11));
        assert_eq!(bytes[6], 33);
        assert_eq!(&bytes[7..9], &[0x12, 0x34]);
        // last=1, cumulative=1, BSN[10:6]
        assert_eq!(bytes[9], 0x80 | 0x20 | (0x5A5 >> 6) as u8);
        assert_eq!(bytes[10], ((0x5A5 & 0x3F) << 2) as u8 | 1);
    }

    #[test]
    fn test_discard_and_reset_decode() {
        let d = ArqMessage::Discard { cid: 500, bsn: 0x703 };
        let bytes = d.encode(3).unwrap();
        assert_eq!(&bytes[6..], &[34, 0x01, 0xF4, 0x07, 0x03]);
        assert_eq!(ArqMessage::decode(MgmtMessageType::ArqDiscard, &bytes[7..]).unwrap(), d);

        let r = ArqMessage::Reset { cid: 401, reset: ArqResetType::ConfirmInitiator };
        let bytes = r.encode(3).unwrap();
        assert_eq!(&bytes[6..], &[35, 0x01, 0x91, 2]);
        assert_eq!(ArqMessage::decode(MgmtMessageType::ArqReset, &bytes[7..]).unwrap(), r);
    }

    #[test]
    fn test_short_body_rejected() {
        assert!(ArqMessage::decode(MgmtMessageType::ArqFeedback, &[0, 1, 2]).is_err());
        assert!(ArqMessage::decode(MgmtMessageType::ArqReset, &[0, 1, 9]).is_err());
    }
}
