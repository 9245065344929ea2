//! Conversion of configured ARQ settings (frame units) to absolute time

use std::time::Duration;

use log::warn;
use wimax_core::constants::{
    ARQ_BSN_MODULUS, ARQ_MAX_BLOCK_LIFETIME, ARQ_MAX_BLOCK_SIZE, ARQ_MAX_RETRY_TIMEOUT_DELAY,
    ARQ_MAX_RETRY_TIMEOUT_RX_DELAY, ARQ_MAX_RETRY_TIMEOUT_TX_DELAY, ARQ_MAX_RX_PURGE_TIMEOUT,
    ARQ_MAX_SYNC_LOSS_TIMEOUT,
};
use wimax_core::{ArqParameters, ArqSettings};

use crate::MacError;

fn frames(n: u32, frame: Duration) -> Duration {
    frame * n
}

/// Largest whole number of frames that fits in `max`.
fn frames_within(max: Duration, frame: Duration) -> u32 {
    (max.as_nanos() / frame.as_nanos()) as u32
}

/// Out-of-range values are clamped to the nearest legal value with a
/// warning. A frame longer than the block lifetime bound is a configuration
/// the engine cannot run with.
pub fn convert_param(settings: &ArqSettings, frame: Duration) -> Result<ArqParameters, MacError> {
    if frame.is_zero() || frame >= ARQ_MAX_BLOCK_LIFETIME {
        return Err(MacError::FrameDuration(frame));
    }

    let mut tx_delay = frames(settings.retry_timeout_tx_frames, frame);
    let mut rx_delay = frames(settings.retry_timeout_rx_frames, frame);
    if tx_delay.max(rx_delay) > ARQ_MAX_RETRY_TIMEOUT_RX_DELAY.min(ARQ_MAX_RETRY_TIMEOUT_TX_DELAY) {
        let in_range = frames_within(ARQ_MAX_RETRY_TIMEOUT_DELAY, frame);
        warn!(
            "ARQ retry timeout must be shorter than {:?}; using {} frames",
            ARQ_MAX_RETRY_TIMEOUT_RX_DELAY, in_range
        );
        tx_delay = frames(in_range / 2, frame);
        rx_delay = frames(in_range / 2, frame);
    }

    let mut block_lifetime = (tx_delay + rx_delay) * settings.block_lifetime_retries;
    if block_lifetime > ARQ_MAX_BLOCK_LIFETIME {
        let in_range = frames_within(ARQ_MAX_BLOCK_LIFETIME, frame);
        warn!("ARQ block lifetime must be shorter than {ARQ_MAX_BLOCK_LIFETIME:?}; using {in_range} frames");
        block_lifetime = frames(in_range, frame);
    }

    let mut sync_loss_timeout = frames(settings.sync_loss_frames, frame);
    if sync_loss_timeout > ARQ_MAX_SYNC_LOSS_TIMEOUT {
        let in_range = frames_within(ARQ_MAX_SYNC_LOSS_TIMEOUT, frame);
        warn!("ARQ sync loss interval must be shorter than {ARQ_MAX_SYNC_LOSS_TIMEOUT:?}; using {in_range} frames");
        sync_loss_timeout = frames(in_range, frame);
    }

    let mut rx_purge_timeout = frames(settings.rx_purge_frames, frame);
    if rx_purge_timeout > ARQ_MAX_RX_PURGE_TIMEOUT {
        let in_range = frames_within(ARQ_MAX_RX_PURGE_TIMEOUT, frame);
        warn!("ARQ RX purge timeout must be shorter than {ARQ_MAX_RX_PURGE_TIMEOUT:?}; using {in_range} frames");
        rx_purge_timeout = frames(in_range, frame);
    }

    let max_window = ARQ_BSN_MODULUS / 2;
    let window_size = match settings.window_size {
        0 => {
            warn!("ARQ window size 0 is not usable; using 1");
            1
        }
        w if w > max_window => {
            warn!("ARQ window size {w} exceeds half the BSN space; using {max_window}");
            max_window
        }
        w => w,
    };
    let block_size = match settings.block_size {
        0 => {
            warn!("ARQ block size 0 is not usable; using 1");
            1
        }
        b if b > ARQ_MAX_BLOCK_SIZE => {
            warn!("ARQ block size {b} exceeds {ARQ_MAX_BLOCK_SIZE}; using the maximum");
            ARQ_MAX_BLOCK_SIZE
        }
        b => b,
    };

    Ok(ArqParameters {
        window_size,
        retry_timeout_tx_delay: tx_delay,
        retry_timeout_rx_delay: rx_delay,
        block_lifetime,
        sync_loss_timeout,
        rx_purge_timeout,
        block_size,
        deliver_in_order: settings.deliver_in_order,
    })
}
