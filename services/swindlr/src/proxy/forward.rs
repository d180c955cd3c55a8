//! The per-request load-balancing pipeline.
//!
//! Control flow per request: resolve the session id (reading or minting the
//! affinity cookie), buffer the request body so it can be replayed, then run
//! the attempt loop: select a peer, account its connection, check admission,
//! consult the cache, and proxy with bounded same-backend retries. Transport
//! failures mark the backend dead and re-enter the loop with an incremented
//! attempt count; exhaustion flattens to `503`.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, HeaderValue, COOKIE, SET_COOKIE};
use http::request::Parts;
use http::{Method, Request, Response, StatusCode, Version};
use http_body::{Body, Frame, SizeHint};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use tracing::{debug, warn};

use crate::cache::{self, ResponseCache, CACHE_STATUS};

use super::backend::{Backend, ConnectionGuard, TransportError};
use super::pool::ServerPool;

/// Whole-request failover cap.
const MAX_ATTEMPTS: u32 = 3;

/// Same-backend transport retry cap.
const MAX_RETRIES: u32 = 3;

/// Pause between same-backend retries.
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Session affinity cookie name.
pub const SESSION_COOKIE: &str = "SESSION_ID";

/// Headers consumed by this hop, never forwarded.
const HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Body type returned to clients: a buffered local response or a streamed
/// upstream body.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Shared context handed to every request handler.
pub struct AppState {
    pub pool: Arc<ServerPool>,
    pub cache: Arc<ResponseCache>,
    pub use_cache: bool,
}

/// Entry point for one client request.
pub async fn handle(
    req: Request<Incoming>,
    state: Arc<AppState>,
    remote: SocketAddr,
) -> Response<ProxyBody> {
    let (parts, body) = req.into_parts();

    // Buffer once so the body can be replayed across retries and failover.
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!(error = %err, "Failed to read request body");
            return status_response(StatusCode::BAD_REQUEST, "Bad request");
        }
    };

    let cookie_session = session_from_cookies(&parts.headers);
    let minted = cookie_session.is_none() && state.pool.sticky_sessions();
    let session_id = match cookie_session {
        Some(id) => Some(id),
        None if minted => Some(uuid::Uuid::new_v4().to_string()),
        None => None,
    };

    let mut response = dispatch(&parts, body, &state, session_id.as_deref(), remote).await;

    if minted {
        if let Some(id) = &session_id {
            let cookie = format!("{SESSION_COOKIE}={id}; Path=/; HttpOnly; Secure");
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response.headers_mut().append(SET_COOKIE, value);
            }
        }
    }
    response
}

async fn dispatch(
    parts: &Parts,
    body: Bytes,
    state: &AppState,
    session_id: Option<&str>,
    remote: SocketAddr,
) -> Response<ProxyBody> {
    let mut base_headers = parts.headers.clone();
    strip_hop_headers(&mut base_headers);
    append_forwarded_for(&mut base_headers, remote);

    let cache_active = state.use_cache && parts.method == Method::GET;
    let cache_key = parts.uri.path().to_string();

    let mut attempts: u32 = 1;
    loop {
        if attempts > MAX_ATTEMPTS {
            warn!(path = %parts.uri.path(), "Max attempts reached, terminating");
            return status_response(StatusCode::SERVICE_UNAVAILABLE, "Service not available");
        }

        let Some(peer) = state.pool.next_peer(session_id) else {
            return status_response(StatusCode::SERVICE_UNAVAILABLE, "Service not available");
        };
        let guard = peer.connection_guard();

        if !peer.admit() {
            debug!(url = %peer.url(), "Admission rejected");
            return status_response(StatusCode::TOO_MANY_REQUESTS, "Too many requests");
        }

        if cache_active {
            if let Some(entry) = state.cache.get(&cache_key) {
                return cache::revalidate(&entry, &parts.headers)
                    .map(|cached| cached.map_err(|never| match never {}).boxed());
            }
        }

        match proxy_with_retries(&peer, parts, &base_headers, &body).await {
            Ok(upstream) => {
                let capture = cache_active
                    .then(|| (Arc::clone(&state.cache), cache_key.clone()));
                return finish_upstream(upstream, guard, capture);
            }
            Err(err) => {
                warn!(url = %peer.url(), error = %err, "Transport retries exhausted, failing over");
                state.pool.mark_status(peer.url(), false);
                attempts += 1;
            }
        }
    }
}

/// Replays the request against one backend until it answers or the retry cap
/// is hit. Any transport-level error counts; an upstream response of any
/// status is a success.
async fn proxy_with_retries(
    peer: &Arc<Backend>,
    parts: &Parts,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response<Incoming>, TransportError> {
    let mut retries: u32 = 1;
    loop {
        let mut req = Request::new(Full::new(body.clone()));
        *req.method_mut() = parts.method.clone();
        *req.uri_mut() = parts.uri.clone();
        *req.version_mut() = Version::HTTP_11;
        *req.headers_mut() = headers.clone();

        match peer.forward(req).await {
            Ok(response) => return Ok(response),
            Err(err) if retries < MAX_RETRIES => {
                debug!(url = %peer.url(), retry = retries, error = %err, "Transport error, retrying");
                tokio::time::sleep(RETRY_BACKOFF).await;
                retries += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Wraps an upstream response for the client: strips hop headers, marks a
/// cache MISS when the cache middleware is active, and tees the streamed body
/// into a capture buffer when the response is cacheable. The connection guard
/// rides inside the body so the count covers the full transfer.
fn finish_upstream(
    upstream: Response<Incoming>,
    guard: ConnectionGuard,
    capture: Option<(Arc<ResponseCache>, String)>,
) -> Response<ProxyBody> {
    let (mut parts, body) = upstream.into_parts();
    strip_hop_headers(&mut parts.headers);

    let capture = capture.and_then(|(cache, key)| {
        let captured_headers = parts.headers.clone();
        parts
            .headers
            .insert(CACHE_STATUS, HeaderValue::from_static("MISS"));
        cache::is_cacheable(parts.status, &captured_headers).then(|| Capture {
            cache,
            key,
            headers: captured_headers,
            buf: BytesMut::new(),
        })
    });

    let body = ProxiedBody {
        inner: body,
        capture,
        _guard: guard,
    };
    Response::from_parts(parts, body.boxed())
}

struct Capture {
    cache: Arc<ResponseCache>,
    key: String,
    headers: HeaderMap,
    buf: BytesMut,
}

/// Streams the upstream body to the client while optionally capturing it for
/// the cache. The entry is inserted only when the stream completes cleanly.
struct ProxiedBody {
    inner: Incoming,
    capture: Option<Capture>,
    _guard: ConnectionGuard,
}

impl Body for ProxiedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(capture) = this.capture.as_mut() {
                    if let Some(data) = frame.data_ref() {
                        capture.buf.extend_from_slice(data);
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(None) => {
                if let Some(capture) = this.capture.take() {
                    capture
                        .cache
                        .set(&capture.key, capture.buf.freeze(), &capture.headers);
                }
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(err))) => {
                this.capture = None;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed()
}

fn status_response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
}

fn session_from_cookies(headers: &HeaderMap) -> Option<String> {
    for value in headers.get_all(COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                if name == SESSION_COOKIE {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_HEADERS {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, remote: SocketAddr) {
    let ip = remote.ip().to_string();
    let value = match headers
        .get("x-forwarded-for")
        .and_then(|existing| existing.to_str().ok())
    {
        Some(existing) => format!("{existing}, {ip}"),
        None => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_map(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                http::header::HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }
        map
    }

    #[test]
    fn session_cookie_is_found_among_others() {
        let headers = header_map(&[("cookie", "theme=dark; SESSION_ID=abc123; lang=en")]);
        assert_eq!(session_from_cookies(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn session_cookie_absent_yields_none() {
        let headers = header_map(&[("cookie", "theme=dark")]);
        assert!(session_from_cookies(&headers).is_none());
        assert!(session_from_cookies(&HeaderMap::new()).is_none());
    }

    #[test]
    fn hop_headers_are_stripped() {
        let mut headers = header_map(&[
            ("connection", "keep-alive"),
            ("transfer-encoding", "chunked"),
            ("accept", "*/*"),
        ]);
        strip_hop_headers(&mut headers);
        assert!(headers.get("connection").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert_eq!(headers.get("accept").unwrap(), "*/*");
    }

    #[test]
    fn forwarded_for_appends_to_existing_chain() {
        let mut headers = header_map(&[("x-forwarded-for", "10.0.0.1")]);
        append_forwarded_for(&mut headers, "192.168.1.5:4000".parse().unwrap());
        assert_eq!(
            headers.get("x-forwarded-for").unwrap(),
            "10.0.0.1, 192.168.1.5"
        );
    }

    #[test]
    fn status_response_carries_literal_body() {
        let response = status_response(StatusCode::SERVICE_UNAVAILABLE, "Service not available");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
