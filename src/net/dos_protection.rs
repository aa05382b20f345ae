use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::game::constants::net::TRAFFIC_SAMPLE_MIN_MICROS;

/// Per-client inbound traffic estimate
///
/// Exponentially weighted moving average of bytes per second, sampled on
/// each packet. Samples arriving closer together than the minimum interval
/// only feed the rate check, not the average.
#[derive(Debug, Clone)]
pub struct TrafficMeter {
    bytes_per_sec: f64,
    last_sample: Instant,
}

impl TrafficMeter {
    pub fn new(now: Instant) -> Self {
        Self {
            bytes_per_sec: 0.0,
            last_sample: now,
        }
    }

    pub fn reset(&mut self, now: Instant) {
        self.bytes_per_sec = 0.0;
        self.last_sample = now;
    }

    pub fn bytes_per_sec(&self) -> f64 {
        self.bytes_per_sec
    }

    /// Check the current estimate against `limit_bytes_per_sec`, then fold in
    /// a packet of `size` bytes. Returns false when the client was already
    /// over the limit.
    pub fn check_and_record(&mut self, size: usize, limit_bytes_per_sec: f64, alpha: f64, now: Instant) -> bool {
        if self.bytes_per_sec > limit_bytes_per_sec {
            return false;
        }

        let elapsed = now.saturating_duration_since(self.last_sample);
        if elapsed > Duration::from_micros(TRAFFIC_SAMPLE_MIN_MICROS) {
            let sample = size as f64 / elapsed.as_secs_f64();
            self.bytes_per_sec = alpha * sample + (1.0 - alpha) * self.bytes_per_sec;
            self.last_sample = now;
        }
        true
    }
}

/// An address ban
#[derive(Debug, Clone)]
pub struct IpBan {
    pub reason: String,
    pub banned_at: Instant,
    /// `None` bans permanently
    pub expires_at: Option<Instant>,
}

impl IpBan {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires| now >= expires)
    }

    /// Remaining ban duration, `None` when permanent
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at
            .map(|expires| expires.saturating_duration_since(now))
    }
}

/// Banned addresses
#[derive(Debug, Default)]
pub struct BanList {
    bans: HashMap<IpAddr, IpBan>,
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ban(&mut self, ip: IpAddr, duration: Option<Duration>, reason: impl Into<String>, now: Instant) {
        self.bans.insert(
            ip,
            IpBan {
                reason: reason.into(),
                banned_at: now,
                expires_at: duration.map(|d| now + d),
            },
        );
    }

    pub fn unban(&mut self, ip: IpAddr) -> bool {
        self.bans.remove(&ip).is_some()
    }

    /// Active ban for an address, if any
    pub fn check(&self, ip: IpAddr, now: Instant) -> Option<&IpBan> {
        self.bans.get(&ip).filter(|ban| !ban.is_expired(now))
    }

    /// Drop expired entries, returning how many were removed
    pub fn cleanup_expired(&mut self, now: Instant) -> usize {
        let before = self.bans.len();
        self.bans.retain(|_, ban| !ban.is_expired(now));
        before - self.bans.len()
    }

    pub fn len(&self) -> usize {
        self.bans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bans.is_empty()
    }
}
