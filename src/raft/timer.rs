use rand::Rng;
use tokio::time::{Duration, Instant};

use crate::config::TimingConfig;

/// Generates a randomized election timeout: `base_ms` plus a jitter drawn
/// from `[0, jitter_ms)` in `granularity_ms` steps.
pub fn random_election_timeout(base_ms: u64, jitter_ms: u64, granularity_ms: u64) -> Duration {
    let slots = jitter_ms / granularity_ms.max(1);
    let jitter = if slots == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..slots) * granularity_ms
    };
    Duration::from_millis(base_ms + jitter)
}

/// Election and heartbeat deadlines, reset independently.
#[derive(Debug, Clone)]
pub struct Deadlines {
    timing: TimingConfig,
    pub election: Instant,
    pub heartbeat: Instant,
}

impl Deadlines {
    pub fn new(timing: TimingConfig) -> Self {
        let now = Instant::now();
        let mut deadlines = Self {
            timing,
            election: now,
            heartbeat: now,
        };
        deadlines.reset_election();
        deadlines.reset_heartbeat();
        deadlines
    }

    pub fn reset_election(&mut self) {
        self.election = Instant::now()
            + random_election_timeout(
                self.timing.election_timeout_base_ms,
                self.timing.election_jitter_ms,
                self.timing.timer_granularity_ms,
            );
    }

    pub fn reset_heartbeat(&mut self) {
        self.heartbeat = Instant::now() + self.timing.heartbeat_interval();
    }

    /// Make the next heartbeat due immediately.
    pub fn expire_heartbeat(&mut self) {
        self.heartbeat = Instant::now();
    }

    pub fn election_expired(&self) -> bool {
        Instant::now() >= self.election
    }

    pub fn heartbeat_expired(&self) -> bool {
        Instant::now() >= self.heartbeat
    }
}
