//! Packet rate guard
//!
//! Counts inbound packets per endpoint over fixed windows. At the end of each
//! window every endpoint above the threshold is reported with a strike; an
//! endpoint that keeps offending is reported with `should_ban`.

use std::collections::HashMap;
use std::time::Duration;

use tidewire_shared::Endpoint;

use crate::config::DosConfig;

#[derive(Debug, Default, Clone, Copy)]
struct Strikes {
    count: u32,
    /// Windows since the last offense
    clean_windows: u32,
}

/// Per-endpoint packet rate limiter
#[derive(Debug)]
pub struct DosGuard {
    enabled: bool,
    window: Duration,
    threshold: u32,
    strikes_before_ban: u32,
    memory_windows: u32,
    elapsed: Duration,
    counts: HashMap<Endpoint, u32>,
    strikes: HashMap<Endpoint, Strikes>,
}

impl DosGuard {
    pub fn new(config: &DosConfig) -> Self {
        Self {
            enabled: config.enabled,
            window: config.window(),
            threshold: config.packet_threshold,
            strikes_before_ban: config.strikes_before_ban.max(1),
            memory_windows: config.strike_memory_windows,
            elapsed: Duration::ZERO,
            counts: HashMap::new(),
            strikes: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Count one inbound packet
    pub fn on_packet(&mut self, endpoint: &Endpoint) {
        if !self.enabled {
            return;
        }
        match self.counts.get_mut(endpoint) {
            Some(count) => *count = count.saturating_add(1),
            None => {
                self.counts.insert(endpoint.clone(), 1);
            }
        }
    }

    /// Advance time. `on_offense(endpoint, should_ban)` runs once per
    /// offending endpoint for every window that closes.
    pub fn update(&mut self, dt: Duration, mut on_offense: impl FnMut(&Endpoint, bool)) {
        if !self.enabled {
            return;
        }
        self.elapsed += dt;
        while self.elapsed >= self.window {
            self.elapsed -= self.window;
            self.close_window(&mut on_offense);
            if self.window.is_zero() {
                break;
            }
        }
    }

    fn close_window(&mut self, on_offense: &mut impl FnMut(&Endpoint, bool)) {
        let threshold = self.threshold;
        let mut offenders: Vec<Endpoint> = self
            .counts
            .drain()
            .filter(|(_, count)| *count > threshold)
            .map(|(endpoint, _)| endpoint)
            .collect();
        offenders.sort();

        for strikes in self.strikes.values_mut() {
            strikes.clean_windows += 1;
        }

        for endpoint in &offenders {
            let strikes = self.strikes.entry(endpoint.clone()).or_default();
            strikes.count += 1;
            strikes.clean_windows = 0;
            let should_ban = strikes.count >= self.strikes_before_ban;
            tracing::warn!(endpoint = %endpoint, strikes = strikes.count, should_ban, "Excessive packet rate");
            on_offense(endpoint, should_ban);
        }

        let memory = self.memory_windows;
        self.strikes.retain(|_, s| s.clean_windows < memory);
    }

    /// Drop all state for an endpoint
    pub fn forget(&mut self, endpoint: &Endpoint) {
        self.counts.remove(endpoint);
        self.strikes.remove(endpoint);
    }

    /// Offenses currently remembered for an endpoint
    pub fn strikes(&self, endpoint: &Endpoint) -> u32 {
        self.strikes.get(endpoint).map_or(0, |s| s.count)
    }
}
