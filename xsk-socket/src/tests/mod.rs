#![cfg(test)]

mod io_loop;
mod socket;

use crate::config::XdpConfig;
use std::time::Duration;

/// A small configuration for simulated sockets: `frames` frames and rings of
/// `ring` slots in both directions.
pub(crate) fn small_config(frames: u32, ring: u32) -> XdpConfig {
    XdpConfig {
        frame_count: frames,
        fill_size: ring,
        comp_size: ring,
        rx_size: ring,
        tx_size: ring,
        huge_page: Some(false),
        drain_timeout: Duration::from_millis(20),
        ..Default::default()
    }
}

pub(crate) fn rx_only(frames: u32, ring: u32) -> XdpConfig {
    XdpConfig {
        tx_size: 0,
        comp_size: 0,
        ..small_config(frames, ring)
    }
}
