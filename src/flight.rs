//! Single-flight gate: at most one concurrent computation per key.
//!
//! The first caller for a key becomes the Leader and computes; later
//! callers become Followers, blocking until the Leader releases the gate
//! and then re-checking the cache the Leader committed to. A Follower that
//! waits longer than the leader timeout proceeds as a FallbackLeader — a
//! stuck leader costs at most one extra duplicate call, never an unbounded
//! wait.
//!
//! The gate is process-local. Two processes sharing a store but not this
//! gate can still elect two leaders for one key; the cache double-check
//! narrows that window but does not close it.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Role assigned to a caller by [`SingleFlightGate::enter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    /// First caller in: computes and commits to cache before release.
    Leader,
    /// Waited out the leader; holds the gate and should re-check the cache
    /// before deciding to compute itself.
    Follower,
    /// Gave up waiting on a stuck leader; proceeds without the gate.
    FallbackLeader,
}

/// Per-key in-flight registry.
///
/// Cheap to clone; clones share the registry.
#[derive(Clone, Default)]
pub struct SingleFlightGate {
    inflight: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl SingleFlightGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for `key`, waiting at most `leader_timeout` for an
    /// existing leader to finish.
    pub async fn enter(&self, key: &str, leader_timeout: Duration) -> FlightGuard {
        let lock = self
            .inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        if let Ok(permit) = lock.clone().try_lock_owned() {
            return FlightGuard {
                gate: self.clone(),
                key: key.to_string(),
                lock,
                role: FlightRole::Leader,
                permit: Some(permit),
            };
        }

        debug!(key = %short(key), "following in-flight computation");
        match tokio::time::timeout(leader_timeout, lock.clone().lock_owned()).await {
            Ok(permit) => FlightGuard {
                gate: self.clone(),
                key: key.to_string(),
                lock,
                role: FlightRole::Follower,
                permit: Some(permit),
            },
            Err(_) => {
                // Internal condition only; the caller proceeds as a bounded
                // duplicate instead of surfacing an error.
                warn!(
                    key = %short(key),
                    timeout_secs = leader_timeout.as_secs(),
                    "leader did not finish in time, proceeding without the gate"
                );
                FlightGuard {
                    gate: self.clone(),
                    key: key.to_string(),
                    lock,
                    role: FlightRole::FallbackLeader,
                    permit: None,
                }
            }
        }
    }

    /// Number of keys with a registered flight (test/diagnostic hook).
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}

/// Holds the gate for one key. Dropping the guard leaves the flight,
/// whether by completion, cancellation, or panic.
pub struct FlightGuard {
    gate: SingleFlightGate,
    key: String,
    lock: Arc<Mutex<()>>,
    role: FlightRole,
    permit: Option<OwnedMutexGuard<()>>,
}

impl FlightGuard {
    pub fn role(&self) -> FlightRole {
        self.role
    }

    /// Whether this caller is expected to compute (leader or fallback, or a
    /// follower whose cache re-check came up empty).
    pub fn holds_gate(&self) -> bool {
        self.permit.is_some()
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        // Only the holder of the permit retires the registry entry, and only
        // if it is still the same lock — a fallback situation may already
        // have replaced it with a newer flight.
        if self.permit.take().is_some() {
            self.gate
                .inflight
                .remove_if(&self.key, |_, existing| Arc::ptr_eq(existing, &self.lock));
        }
    }
}

// Cuts on a char boundary so arbitrary caller keys cannot panic a log path.
fn short(key: &str) -> &str {
    key.char_indices().nth(8).map_or(key, |(i, _)| &key[..i])
}
