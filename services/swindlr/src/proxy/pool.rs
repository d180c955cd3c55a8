//! The server pool: backend set, session affinity, and peer selection.
//!
//! The pool is the sole owner of its backends. Four actors mutate or read it
//! concurrently (request handlers, the health sweep, the admin API, and the
//! failover path), so the backend sequence and session table live under one
//! reader/writer lock. No pool operation suspends; the lock is never held
//! across an await point.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use tracing::{debug, info};

use crate::config::RateLimitingConfig;
use crate::error::PoolError;

use super::algorithm::Algorithm;
use super::backend::Backend;

pub struct ServerPool {
    state: RwLock<PoolState>,
    algorithm: Algorithm,
    limits: RateLimitingConfig,
    sticky_sessions: bool,
}

#[derive(Default)]
struct PoolState {
    /// Insertion-ordered; a backend appears at most once.
    backends: Vec<Arc<Backend>>,
    /// Session id to backend. Weak so that `remove` actually releases a
    /// backend once its in-flight requests finish; dangling entries upgrade
    /// to `None` and are tolerated until purged.
    sessions: HashMap<String, Weak<Backend>>,
}

impl ServerPool {
    pub fn new(algorithm: Algorithm, limits: RateLimitingConfig, sticky_sessions: bool) -> Self {
        Self {
            state: RwLock::new(PoolState::default()),
            algorithm,
            limits,
            sticky_sessions,
        }
    }

    pub fn sticky_sessions(&self) -> bool {
        self.sticky_sessions
    }

    /// Appends a backend to the pool.
    pub fn add(&self, backend: Arc<Backend>) {
        let mut state = self.state.write().expect("pool lock");
        info!(url = %backend.url(), "Added a new backend");
        state.backends.push(backend);
    }

    /// Builds a backend from a URL (with the pool's admission limits) and
    /// appends it.
    pub fn add_url(&self, url: &str) -> Result<Arc<Backend>, PoolError> {
        let backend = Arc::new(Backend::new(url, self.limits.rate, self.limits.bucket_size)?);
        self.add(Arc::clone(&backend));
        Ok(backend)
    }

    /// Removes the backend matching `url` exactly. Sessions pointing at it
    /// are not purged; they die lazily once the backend is reclaimed.
    pub fn remove(&self, url: &str) -> Result<(), PoolError> {
        let mut state = self.state.write().expect("pool lock");
        match state.backends.iter().position(|b| b.url() == url) {
            Some(idx) => {
                state.backends.remove(idx);
                info!(url, "Removed backend");
                Ok(())
            }
            None => Err(PoolError::BackendNotFound(url.to_string())),
        }
    }

    /// Sets the liveness flag on the backend matching `url`, if any.
    pub fn mark_status(&self, url: &str, alive: bool) {
        let state = self.state.read().expect("pool lock");
        if let Some(backend) = state.backends.iter().find(|b| b.url() == url) {
            info!(url, alive, "Marking backend status");
            backend.set_alive(alive);
        }
    }

    /// Selects the backend for a request.
    ///
    /// With sticky sessions enabled, a session id that still maps to a live
    /// reference wins; otherwise the active algorithm picks, and the id (if
    /// any) is bound to the pick before returning.
    pub fn next_peer(&self, session_id: Option<&str>) -> Option<Arc<Backend>> {
        if self.sticky_sessions {
            if let Some(id) = session_id {
                if let Some(backend) = self.backend_for_session(id) {
                    return Some(backend);
                }
            }
        }

        let selected = {
            let state = self.state.read().expect("pool lock");
            self.algorithm.select(&state.backends)
        }?;

        if self.sticky_sessions {
            if let Some(id) = session_id {
                self.bind_session(id, &selected);
            }
        }
        Some(selected)
    }

    pub fn bind_session(&self, session_id: &str, backend: &Arc<Backend>) {
        let mut state = self.state.write().expect("pool lock");
        debug!(session_id, url = %backend.url(), "Bound session");
        state
            .sessions
            .insert(session_id.to_string(), Arc::downgrade(backend));
    }

    pub fn backend_for_session(&self, session_id: &str) -> Option<Arc<Backend>> {
        let state = self.state.read().expect("pool lock");
        state.sessions.get(session_id).and_then(Weak::upgrade)
    }

    /// Drops session entries whose backend has been reclaimed. Invoked after
    /// each health sweep.
    pub fn purge_dead_sessions(&self) {
        let mut state = self.state.write().expect("pool lock");
        state.sessions.retain(|_, backend| backend.upgrade().is_some());
    }

    /// A point-in-time copy of the backend sequence, for health sweeps.
    pub fn snapshot(&self) -> Vec<Arc<Backend>> {
        self.state.read().expect("pool lock").backends.clone()
    }

    pub fn len(&self) -> usize {
        self.state.read().expect("pool lock").backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::algorithm::Strategy;

    fn pool(strategy: Strategy, sticky: bool) -> ServerPool {
        ServerPool::new(
            Algorithm::from(strategy),
            RateLimitingConfig::default(),
            sticky,
        )
    }

    #[test]
    fn remove_splices_out_the_matching_backend() {
        let pool = pool(Strategy::RoundRobin, false);
        pool.add_url("http://backend1.test").unwrap();
        pool.add_url("http://backend2.test").unwrap();

        pool.remove("http://backend1.test").unwrap();

        let remaining = pool.snapshot();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].url(), "http://backend2.test");
    }

    #[test]
    fn remove_unknown_backend_fails() {
        let pool = pool(Strategy::RoundRobin, false);
        pool.add_url("http://backend1.test").unwrap();

        let err = pool.remove("http://nonexistent.test").unwrap_err();
        assert!(matches!(err, PoolError::BackendNotFound(_)));
    }

    #[test]
    fn removed_backend_is_never_selected_again() {
        let pool = pool(Strategy::RoundRobin, false);
        pool.add_url("http://backend1.test").unwrap();
        pool.add_url("http://backend2.test").unwrap();
        pool.remove("http://backend1.test").unwrap();

        for _ in 0..8 {
            let peer = pool.next_peer(None).unwrap();
            assert_eq!(peer.url(), "http://backend2.test");
        }
    }

    #[test]
    fn mark_status_flips_liveness() {
        let pool = pool(Strategy::RoundRobin, false);
        let backend = pool.add_url("http://backend1.test").unwrap();

        pool.mark_status("http://backend1.test", false);
        assert!(!backend.is_alive());

        pool.mark_status("http://backend1.test", true);
        assert!(backend.is_alive());
    }

    #[test]
    fn next_peer_on_empty_pool_is_none() {
        let pool = pool(Strategy::RoundRobin, false);
        assert!(pool.next_peer(None).is_none());
    }

    #[test]
    fn session_lookup_returns_bound_backend() {
        let pool = pool(Strategy::RoundRobin, true);
        let backend1 = pool.add_url("http://backend1.test").unwrap();
        pool.add_url("http://backend2.test").unwrap();

        pool.bind_session("session123", &backend1);

        let found = pool.backend_for_session("session123").unwrap();
        assert_eq!(found.url(), backend1.url());
    }

    #[test]
    fn sticky_next_peer_pins_the_session() {
        let pool = pool(Strategy::RoundRobin, true);
        pool.add_url("http://backend1.test").unwrap();
        pool.add_url("http://backend2.test").unwrap();

        let first = pool.next_peer(Some("s1")).unwrap();
        for _ in 0..8 {
            let again = pool.next_peer(Some("s1")).unwrap();
            assert_eq!(again.url(), first.url());
        }
    }

    #[test]
    fn dangling_session_falls_through_to_the_algorithm() {
        let pool = pool(Strategy::RoundRobin, true);
        let doomed = pool.add_url("http://backend1.test").unwrap();
        pool.add_url("http://backend2.test").unwrap();

        pool.bind_session("s1", &doomed);
        pool.remove("http://backend1.test").unwrap();
        drop(doomed);

        // The weak entry no longer upgrades, so selection falls through and
        // rebinds the session to a member.
        let peer = pool.next_peer(Some("s1")).unwrap();
        assert_eq!(peer.url(), "http://backend2.test");
        assert_eq!(
            pool.backend_for_session("s1").unwrap().url(),
            "http://backend2.test"
        );
    }

    #[test]
    fn purge_drops_only_reclaimed_sessions() {
        let pool = pool(Strategy::RoundRobin, true);
        let kept = pool.add_url("http://backend1.test").unwrap();
        let doomed = pool.add_url("http://backend2.test").unwrap();

        pool.bind_session("kept", &kept);
        pool.bind_session("doomed", &doomed);
        pool.remove("http://backend2.test").unwrap();
        drop(doomed);

        pool.purge_dead_sessions();

        assert!(pool.backend_for_session("kept").is_some());
        assert!(pool.backend_for_session("doomed").is_none());
    }

    #[test]
    fn concurrent_selection_and_mutation_never_yields_a_removed_backend() {
        let pool = Arc::new(pool(Strategy::RoundRobin, false));
        pool.add_url("http://stable.test").unwrap();
        pool.add_url("http://doomed.test").unwrap();
        pool.remove("http://doomed.test").unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    if let Some(peer) = pool.next_peer(None) {
                        assert_ne!(peer.url(), "http://doomed.test");
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
