//! Per-service traffic counters
//!
//! A service keeps two counter sets, home and roaming, each a byte/packet
//! snapshot plus a monotonic connected-time accumulator. Registered counter
//! peers get periodic usage dictionaries built from these values.

use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsData {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
    /// Accumulated connected time in seconds.
    pub time: u64,
}

#[derive(Debug, Default)]
pub struct ServiceStats {
    pub data: StatsData,
    enabled: bool,
    started: Option<Instant>,
}

impl ServiceStats {
    /// Begin accumulating connected time (lower-up).
    pub fn start(&mut self) {
        self.enabled = true;
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    /// Stop the clock and fold the elapsed span in (lower-down).
    pub fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.data.time += started.elapsed().as_secs();
        }
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Fold in a counter snapshot from the link layer.
    pub fn update(&mut self, update: &StatsData) {
        let time = self.data.time;
        self.data = *update;
        self.data.time = time;
    }

    pub fn reset(&mut self) {
        let running = self.started.is_some();
        self.data = StatsData::default();
        self.started = if running { Some(Instant::now()) } else { None };
    }

    /// Current totals including the running time span.
    pub fn snapshot(&self) -> StatsData {
        let mut data = self.data;
        if let Some(started) = self.started {
            data.time += started.elapsed().as_secs();
        }
        data
    }
}

/// Last values pushed to one registered counter peer.
#[derive(Debug, Clone, Default)]
pub struct CounterSnapshot {
    pub data: StatsData,
    pub roaming: StatsData,
    /// First push after registration sends the full history.
    pub append_all: bool,
}

pub type CounterTable = HashMap<String, CounterSnapshot>;
