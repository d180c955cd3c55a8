//! swindlr
//!
//! HTTP/HTTPS reverse-proxy load balancer: a mutable backend pool with
//! pluggable selection strategies, TCP health sweeps, sticky-session
//! affinity, per-backend token-bucket admission, and a revalidating response
//! cache composed around a streaming reverse proxy.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod proxy;
pub mod server;

pub use cache::ResponseCache;
pub use config::Config;
pub use error::PoolError;
pub use health::HealthStatus;
pub use proxy::{Algorithm, AppState, Backend, ServerPool, Strategy};
pub use server::Server;
