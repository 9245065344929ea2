//! wire-level types and codecs for the IEEE 802.16 MAC

use thiserror::Error;

pub mod constants;
pub mod header;
pub mod subheader;
pub mod tlv;
pub mod types;

pub use constants::MgmtMessageType;
pub use header::MacHeader;
pub use subheader::{FragSubheader, FragmentControl, PackSubheader};
pub use tlv::{LengthSlot, Tlv, TlvReader, TlvWriter};
pub use types::*;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("TLV {ty} claims {len} bytes past end of buffer")]
    TlvOverrun { ty: u8, len: usize },

    #[error("TLV {ty} has unexpected length {len}")]
    TlvLength { ty: u8, len: usize },

    #[error("length {0} does not fit the field")]
    LengthOverflow(usize),

    #[error("unknown management message type {0}")]
    UnknownMessageType(u8),

    #[error("not a generic MAC header")]
    NotGenericHeader,
}
