//! Liveness detection over per-channel traffic counters.
//!
//! Evaluated once per tick. Two independent conditions are checked per
//! channel, stagnation first:
//!
//! - **Stagnation**: sends went out but nothing came back for K ticks in a
//!   row. A channel that can still send never trips a plain silence check, so
//!   this one has to run on its own.
//! - **Full death**: nothing inbound for longer than T, observed on M ticks in
//!   a row. Only judged on watched channels (keepalive channels, or ones the
//!   application has sent on).
//!
//! Channels with no outbound traffic during a tick get a keepalive ping, so an
//! idle session always has something to be answered.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use tether_protocol::{Channel, HealthConfig};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Outbound flows, inbound frozen
    Stagnation,
    /// No inbound traffic at all
    FullDeath,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Stagnation => f.write_str("stagnation"),
            FailureKind::FullDeath => f.write_str("full death"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{kind} on {channel} channel")]
pub struct ChannelFailure {
    pub channel: Channel,
    pub kind: FailureKind,
}

/// Counter readings for one channel at tick time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelCounters {
    pub channel: Channel,
    pub sent: u64,
    pub recv: u64,
    /// Time since the last inbound message (or since the session started)
    pub last_recv_age: Duration,
}

/// Per-tick view of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub channel: Channel,
    pub sent_delta: u64,
    pub recv_delta: u64,
    pub stagnant_ticks: u32,
    pub silent_ticks: u32,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HealthVerdict {
    pub snapshots: Vec<HealthSnapshot>,
    pub failure: Option<ChannelFailure>,
    /// Channels that should get a keepalive ping now
    pub keepalive: Vec<Channel>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Track {
    sent: u64,
    recv: u64,
    stagnant_ticks: u32,
    silent_ticks: u32,
}

#[derive(Debug)]
pub struct ChannelHealthMonitor {
    config: HealthConfig,
    tracks: BTreeMap<Channel, Track>,
    armed: bool,
}

impl ChannelHealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            tracks: BTreeMap::new(),
            armed: false,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        self.config.tick_interval()
    }

    pub fn keepalive_message(&self) -> &str {
        &self.config.keepalive_message
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Start watching a fresh session. Counters restart from zero.
    pub fn arm(&mut self) {
        self.tracks.clear();
        self.armed = true;
    }

    pub fn disarm(&mut self) {
        self.tracks.clear();
        self.armed = false;
    }

    /// Evaluate one tick. After a failure is reported the monitor disarms
    /// itself and returns empty verdicts until [`Self::arm`] is called again.
    pub fn evaluate(&mut self, counters: &[ChannelCounters]) -> HealthVerdict {
        let mut verdict = HealthVerdict::default();
        if !self.armed {
            return verdict;
        }

        let silence_timeout = self.config.silence_timeout();
        for reading in counters {
            let track = self.tracks.entry(reading.channel).or_default();
            let sent_delta = reading.sent.saturating_sub(track.sent);
            let recv_delta = reading.recv.saturating_sub(track.recv);
            track.sent = reading.sent;
            track.recv = reading.recv;

            if sent_delta > 0 && recv_delta == 0 {
                track.stagnant_ticks += 1;
            } else {
                track.stagnant_ticks = 0;
            }

            // Silence only means something on a channel somebody talks to
            let watched =
                reading.sent > 0 || self.config.keepalive_channels.contains(&reading.channel);
            if watched && recv_delta == 0 && reading.last_recv_age >= silence_timeout {
                track.silent_ticks += 1;
            } else {
                track.silent_ticks = 0;
            }

            let snapshot = HealthSnapshot {
                channel: reading.channel,
                sent_delta,
                recv_delta,
                stagnant_ticks: track.stagnant_ticks,
                silent_ticks: track.silent_ticks,
            };
            debug!(
                channel = %snapshot.channel,
                sent_delta,
                recv_delta,
                stagnant = snapshot.stagnant_ticks,
                silent = snapshot.silent_ticks,
                "Health tick"
            );
            verdict.snapshots.push(snapshot);

            if verdict.failure.is_none() {
                let kind = if snapshot.stagnant_ticks >= self.config.stagnation_ticks {
                    Some(FailureKind::Stagnation)
                } else if snapshot.silent_ticks >= self.config.silence_ticks {
                    Some(FailureKind::FullDeath)
                } else {
                    None
                };
                if let Some(kind) = kind {
                    verdict.failure = Some(ChannelFailure {
                        channel: reading.channel,
                        kind,
                    });
                }
            }

            if sent_delta == 0 && self.config.keepalive_channels.contains(&reading.channel) {
                verdict.keepalive.push(reading.channel);
            }
        }

        if let Some(failure) = verdict.failure {
            warn!(
                channel = %failure.channel,
                kind = %failure.kind,
                "Channel failure detected, monitor disarmed"
            );
            verdict.keepalive.clear();
            self.disarm();
        }
        verdict
    }
}
