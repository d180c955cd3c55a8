//! Backend endpoints: origin identity, liveness, connection accounting,
//! token-bucket admission, and the owned reverse-proxy forwarder.
//!
//! A backend is created by the pool and shared by reference: the pool holds
//! the primary `Arc`, in-flight requests clone it for the duration of a
//! forward, and the session table holds weak copies. Liveness and latency are
//! written by the health sweep and the failover path while requests read them
//! concurrently.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::uri::{Authority, Scheme, Uri};
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

pub use hyper_util::client::legacy::Error as TransportError;

use crate::error::PoolError;

/// One origin server the proxy forwards to.
pub struct Backend {
    url: String,
    origin: Uri,
    scheme: Scheme,
    authority: Authority,
    alive: AtomicBool,
    latency: RwLock<Duration>,
    connections: AtomicUsize,
    limiter: TokenBucket,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl Backend {
    /// Builds a backend from its origin URL. The backend starts alive with a
    /// full admission bucket.
    pub fn new(url: &str, rate: f64, bucket_size: f64) -> Result<Self, PoolError> {
        let origin: Uri = url.parse().map_err(|err: http::uri::InvalidUri| PoolError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        let authority = origin
            .authority()
            .cloned()
            .ok_or_else(|| PoolError::InvalidUrl {
                url: url.to_string(),
                reason: "missing host".to_string(),
            })?;
        let scheme = origin.scheme().cloned().unwrap_or(Scheme::HTTP);

        Ok(Self {
            url: url.to_string(),
            origin,
            scheme,
            authority,
            alive: AtomicBool::new(true),
            latency: RwLock::new(Duration::ZERO),
            connections: AtomicUsize::new(0),
            limiter: TokenBucket::new(rate, bucket_size),
            client: Client::builder(TokioExecutor::new()).build_http(),
        })
    }

    /// The URL string this backend was created from; pool identity.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Records the latest health-probe latency.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write().expect("latency lock") = latency;
    }

    pub fn latency(&self) -> Duration {
        *self.latency.read().expect("latency lock")
    }

    pub fn increment_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_connections(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Current number of in-flight forwards through this backend.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Increments the connection counter and returns a guard that decrements
    /// it when dropped, covering every return path including streamed bodies.
    pub fn connection_guard(self: &Arc<Self>) -> ConnectionGuard {
        self.increment_connections();
        ConnectionGuard {
            backend: Arc::clone(self),
        }
    }

    /// Non-blocking admission check against the backend's token bucket.
    pub fn admit(&self) -> bool {
        self.limiter.admit()
    }

    /// Host and port probed by the health sweep.
    pub fn probe_addr(&self) -> (String, u16) {
        let host = self
            .authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = self.authority.port_u16().unwrap_or_else(|| {
            if self.scheme == Scheme::HTTPS {
                443
            } else {
                80
            }
        });
        (host, port)
    }

    /// Proxies one request to the origin through the owned client. The URI is
    /// rewritten to the origin's scheme and authority, with the origin's path
    /// prefix joined in front of the request path.
    pub async fn forward(
        &self,
        mut req: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>, TransportError> {
        *req.uri_mut() = self.origin_uri(req.uri());
        self.client.request(req).await
    }

    fn origin_uri(&self, uri: &Uri) -> Uri {
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let prefix = self.origin.path().trim_end_matches('/');
        let joined = if prefix.is_empty() {
            path_and_query.to_string()
        } else {
            format!("{prefix}{path_and_query}")
        };

        let mut parts = http::uri::Parts::default();
        parts.scheme = Some(self.scheme.clone());
        parts.authority = Some(self.authority.clone());
        parts.path_and_query = joined.parse().ok().or_else(|| uri.path_and_query().cloned());
        Uri::from_parts(parts).unwrap_or_else(|_| uri.clone())
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("url", &self.url)
            .field("alive", &self.is_alive())
            .field("connections", &self.connections())
            .finish()
    }
}

/// RAII guard pairing one `increment_connections` with one decrement.
pub struct ConnectionGuard {
    backend: Arc<Backend>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.backend.decrement_connections();
    }
}

/// Token bucket with continuous refill.
///
/// Refills at `rate` tokens per second up to `bucket_size`, starting full.
/// `admit` consumes one token or rejects; it never blocks.
pub struct TokenBucket {
    rate: f64,
    bucket_size: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    refreshed: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, bucket_size: f64) -> Self {
        Self {
            rate,
            bucket_size,
            state: Mutex::new(BucketState {
                tokens: bucket_size,
                refreshed: Instant::now(),
            }),
        }
    }

    pub fn admit(&self) -> bool {
        let mut state = self.state.lock().expect("bucket lock");
        let now = Instant::now();
        let elapsed = now.duration_since(state.refreshed).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.bucket_size);
        state.refreshed = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
