//! The failure tracker decides when to suspect a replica of failure.  The twist is
//! self-suspicion:  a node that has heard from no one discounts its suspicion of everyone else by
//! the time since it last heard anything, so an isolated node does not accuse healthy peers.

use biometrics::{Collector, Counter};

use replicant_pb::{Configuration, ServerID, MAX_REPLICAS};

use crate::monotonic_time;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static PROOF_OF_LIFE: Counter = Counter::new("replicant.failures.proof_of_life");
static SUSPECTED: Counter = Counter::new("replicant.failures.suspected");

pub(crate) fn register_biometrics(collector: &Collector) {
    collector.register_counter(&PROOF_OF_LIFE);
    collector.register_counter(&SUSPECTED);
}

/////////////////////////////////////////// FailureTracker /////////////////////////////////////////

pub struct FailureTracker {
    config: Configuration,
    us: ServerID,
    last_seen: [u64; MAX_REPLICAS],
}

impl FailureTracker {
    pub fn new(config: Configuration, us: ServerID) -> Self {
        let mut tracker = Self {
            config,
            us,
            last_seen: [0; MAX_REPLICAS],
        };
        tracker.assume_all_alive();
        tracker
    }

    pub fn set_server_id(&mut self, us: ServerID) {
        self.us = us;
    }

    /// Reset every replica's proof of life to now.
    pub fn assume_all_alive(&mut self) {
        self.assume_all_alive_at(monotonic_time());
    }

    pub fn assume_all_alive_at(&mut self, now: u64) {
        for seen in self.last_seen.iter_mut() {
            *seen = now;
        }
    }

    /// Record that `si` was alive.
    pub fn proof_of_life(&mut self, si: ServerID) {
        self.proof_of_life_at(si, monotonic_time());
    }

    pub fn proof_of_life_at(&mut self, si: ServerID, now: u64) {
        PROOF_OF_LIFE.click();
        let servers = self.config.servers();
        for (i, server) in servers.iter().enumerate().take(MAX_REPLICAS) {
            if server.id == si {
                self.last_seen[i] = now;
            }
        }
    }

    /// Whether `si` has been silent longer than `timeout`, after discounting our own isolation.
    /// We never suspect ourselves, and we conservatively suspect servers we've never heard of.
    pub fn suspect_failed(&mut self, si: ServerID, timeout: u64) -> bool {
        self.suspect_failed_at(si, timeout, monotonic_time())
    }

    pub fn suspect_failed_at(&mut self, si: ServerID, timeout: u64, now: u64) -> bool {
        if si == self.us {
            return false;
        }
        let us = self.us;
        let servers: Vec<ServerID> = self
            .config
            .servers()
            .iter()
            .take(MAX_REPLICAS)
            .map(|s| s.id)
            .collect();
        let max_seen = self.last_seen[..servers.len()]
            .iter()
            .copied()
            .max()
            .unwrap_or(now);
        // no one contacts us on purpose, so count ourselves as current as our most recent peer
        for (i, server) in servers.iter().enumerate() {
            if *server == us {
                self.last_seen[i] = max_seen;
            }
        }
        for (i, server) in servers.iter().enumerate() {
            if *server == si {
                let diff = now.saturating_sub(self.last_seen[i]);
                let self_suspicion = now.saturating_sub(max_seen);
                let susp = diff.saturating_sub(self_suspicion);
                if susp > timeout {
                    SUSPECTED.click();
                    return true;
                }
                return false;
            }
        }
        true
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
