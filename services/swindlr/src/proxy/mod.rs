//! Proxy internals: backends, selection strategies, the server pool, and the
//! per-request forwarding pipeline.

pub mod algorithm;
pub mod backend;
pub mod forward;
pub mod pool;

pub use algorithm::{Algorithm, Strategy};
pub use backend::{Backend, ConnectionGuard, TokenBucket};
pub use forward::{AppState, ProxyBody};
pub use pool::ServerPool;
