//! Adaptive pulse strategy.
//!
//! Decides, per outgoing message, whether to perform a KEM pulse (full
//! root rotation) or a symmetric-only ratchet step. The decision is
//! advisory: packets self-describe whether they carry a pulse, so the
//! strategy can change without affecting interoperability.

use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Any plaintext at least this large forces a pulse in every mode.
pub const LARGE_MESSAGE_THRESHOLD: usize = 1024 * 1024;

/// Security/overhead trade-off for pulse scheduling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatchetMode {
    /// Pulse on every message.
    MaximumSecurity,
    /// Pulse every 16 messages, 4 MiB or 60 seconds.
    #[default]
    BalancedFlow,
    /// Pulse every 128 messages, 64 MiB or 600 seconds.
    MinimalOverhead,
}

impl RatchetMode {
    fn message_interval(self) -> u64 {
        match self {
            Self::MaximumSecurity => 1,
            Self::BalancedFlow => 16,
            Self::MinimalOverhead => 128,
        }
    }

    fn byte_interval(self) -> u64 {
        match self {
            Self::MaximumSecurity => 128 * 1024,
            Self::BalancedFlow => 4 * 1024 * 1024,
            Self::MinimalOverhead => 64 * 1024 * 1024,
        }
    }

    fn time_interval(self) -> Duration {
        match self {
            Self::MaximumSecurity => Duration::ZERO,
            Self::BalancedFlow => Duration::from_secs(60),
            Self::MinimalOverhead => Duration::from_secs(600),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MaximumSecurity => "MAXIMUM_SECURITY",
            Self::BalancedFlow => "BALANCED_FLOW",
            Self::MinimalOverhead => "MINIMAL_OVERHEAD",
        }
    }
}

impl FromStr for RatchetMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MAXIMUM_SECURITY" => Ok(Self::MaximumSecurity),
            "BALANCED_FLOW" => Ok(Self::BalancedFlow),
            "MINIMAL_OVERHEAD" => Ok(Self::MinimalOverhead),
            _ => Err(()),
        }
    }
}

/// Tracks traffic since the last pulse and applies the mode thresholds.
#[derive(Clone, Debug)]
pub struct PulseStrategy {
    mode: RatchetMode,
    messages_since_pulse: u64,
    bytes_since_pulse: u64,
    last_pulse: Instant,
}

impl PulseStrategy {
    pub fn new(mode: RatchetMode) -> Self {
        Self {
            mode,
            messages_since_pulse: 0,
            bytes_since_pulse: 0,
            last_pulse: Instant::now(),
        }
    }

    pub fn mode(&self) -> RatchetMode {
        self.mode
    }

    /// Whether the next outgoing message of `plaintext_len` bytes
    /// should carry a KEM pulse.
    pub fn should_pulse(&self, plaintext_len: usize) -> bool {
        if self.mode == RatchetMode::MaximumSecurity {
            return true;
        }
        if plaintext_len >= LARGE_MESSAGE_THRESHOLD {
            return true;
        }
        self.messages_since_pulse >= self.mode.message_interval()
            || self.bytes_since_pulse >= self.mode.byte_interval()
            || self.last_pulse.elapsed() >= self.mode.time_interval()
    }

    /// Record an outgoing message that did not pulse.
    pub fn note_send(&mut self, plaintext_len: usize) {
        self.messages_since_pulse += 1;
        self.bytes_since_pulse = self.bytes_since_pulse.saturating_add(plaintext_len as u64);
    }

    /// Record a completed pulse (local or remote); counters restart.
    pub fn note_pulse(&mut self) {
        self.messages_since_pulse = 0;
        self.bytes_since_pulse = 0;
        self.last_pulse = Instant::now();
    }
}

impl Default for PulseStrategy {
    fn default() -> Self {
        Self::new(RatchetMode::default())
    }
}
