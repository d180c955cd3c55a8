//! Backend selection strategies.
//!
//! All strategies take a read-only, insertion-ordered view of the pool and
//! return one backend or none. None of them suspends. Ties break to the
//! earliest-inserted backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::backend::Backend;

/// Selection policy names as they appear in configuration
/// (`load_balancer.strategy`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    LeastConnections,
    Random,
    LatencyAware,
}

/// A selection strategy plus whatever state it carries.
pub enum Algorithm {
    /// Rotating cursor with a liveness-aware probe.
    RoundRobin { cursor: AtomicUsize },
    /// Alive backend with the fewest in-flight connections.
    LeastConnections,
    /// Uniform pick over the whole set; dead peers are recovered by the
    /// forwarder's transport retries.
    Random,
    /// Alive backend with the smallest last-probe latency.
    LatencyAware,
}

impl From<Strategy> for Algorithm {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::RoundRobin => Algorithm::RoundRobin {
                cursor: AtomicUsize::new(0),
            },
            Strategy::LeastConnections => Algorithm::LeastConnections,
            Strategy::Random => Algorithm::Random,
            Strategy::LatencyAware => Algorithm::LatencyAware,
        }
    }
}

impl Algorithm {
    /// Picks one backend, or `None` when the view is empty or every eligible
    /// backend is dead.
    pub fn select(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }

        match self {
            Algorithm::RoundRobin { cursor } => {
                let len = backends.len();
                let next = (cursor.fetch_add(1, Ordering::Relaxed) + 1) % len;
                for offset in 0..len {
                    let idx = (next + offset) % len;
                    if backends[idx].is_alive() {
                        if offset != 0 {
                            // Skipped past dead peers; park the cursor on the
                            // index actually served.
                            cursor.store(idx, Ordering::Relaxed);
                        }
                        return Some(Arc::clone(&backends[idx]));
                    }
                }
                None
            }
            Algorithm::LeastConnections => backends
                .iter()
                .enumerate()
                .filter(|(_, backend)| backend.is_alive())
                .min_by_key(|(idx, backend)| (backend.connections(), *idx))
                .map(|(_, backend)| Arc::clone(backend)),
            Algorithm::Random => {
                let idx = rand::rng().random_range(0..backends.len());
                Some(Arc::clone(&backends[idx]))
            }
            Algorithm::LatencyAware => backends
                .iter()
                .enumerate()
                .filter(|(_, backend)| backend.is_alive())
                .min_by_key(|(idx, backend)| (backend.latency(), *idx))
                .map(|(_, backend)| Arc::clone(backend)),
        }
    }
}
