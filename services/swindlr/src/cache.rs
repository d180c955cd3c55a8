//! In-memory response cache with TTL and conditional revalidation.
//!
//! Entries are keyed on the request URL path. A hit replays the captured
//! response, answering `If-None-Match` / `If-Modified-Since` with `304` when
//! the stored validators still match. Insertion happens in the forwarder once
//! a cacheable upstream body has fully streamed to the client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use http::header::{
    HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH,
    LAST_MODIFIED,
};
use http::{Response, StatusCode};
use http_body_util::Full;
use tracing::debug;

/// Header reporting whether a response was served from cache.
pub const CACHE_STATUS: HeaderName = HeaderName::from_static("x-swindlr-cache");

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// How often the janitor sweeps expired entries.
pub const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// HTTP date layout (RFC 1123, always GMT).
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// One captured response.
#[derive(Clone)]
pub struct CacheEntry {
    pub body: Bytes,
    /// Full response header set as captured at insertion.
    pub headers: HeaderMap,
    /// Taken verbatim from the captured headers; may be empty.
    pub etag: String,
    /// Insertion instant, served as `Last-Modified`.
    pub last_modified: DateTime<Utc>,
    expires_at: Instant,
}

pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Returns the entry for `key` iff present and unexpired. Expired entries
    /// are dropped on access.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value().clone());

        if hit.is_none() {
            self.entries
                .remove_if(key, |_, entry| entry.expires_at <= Instant::now());
        }
        hit
    }

    /// Stores a captured response under `key` with the cache's TTL.
    pub fn set(&self, key: &str, body: Bytes, headers: &HeaderMap) {
        let etag = headers
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        debug!(key, bytes = body.len(), "Cached response");
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                body,
                headers: headers.clone(),
                etag,
                last_modified: Utc::now(),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Sweeps every expired entry.
    pub fn delete_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Periodically sweeps expired entries.
pub async fn run_janitor(cache: Arc<ResponseCache>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        cache.delete_expired();
    }
}

/// Serves a cached entry for a request, honoring its conditional headers.
pub fn revalidate(entry: &CacheEntry, req_headers: &HeaderMap) -> Response<Full<Bytes>> {
    if !entry.etag.is_empty() {
        if let Some(candidate) = req_headers
            .get(IF_NONE_MATCH)
            .and_then(|value| value.to_str().ok())
        {
            if candidate == entry.etag {
                return not_modified(entry);
            }
        }
    }

    if let Some(since) = req_headers
        .get(IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_http_date)
    {
        // HTTP dates have one-second resolution.
        if entry.last_modified < since + TimeDelta::seconds(1) {
            return not_modified(entry);
        }
    }

    let mut response = Response::new(Full::new(entry.body.clone()));
    *response.headers_mut() = entry.headers.clone();
    overlay_validators(response.headers_mut(), entry);
    response
}

fn not_modified(entry: &CacheEntry) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::NOT_MODIFIED;
    if !entry.etag.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&entry.etag) {
            response.headers_mut().insert(ETAG, value);
        }
    }
    response
        .headers_mut()
        .insert(CACHE_STATUS, HeaderValue::from_static("HIT"));
    response
}

fn overlay_validators(headers: &mut HeaderMap, entry: &CacheEntry) {
    if !entry.etag.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&entry.etag) {
            headers.insert(ETAG, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&fmt_http_date(entry.last_modified)) {
        headers.insert(LAST_MODIFIED, value);
    }
    headers.insert(CACHE_STATUS, HeaderValue::from_static("HIT"));
}

/// Whether a captured upstream response may be inserted: `200 OK` and a
/// `Cache-Control` that is neither `no-store` nor `private`.
pub fn is_cacheable(status: StatusCode, headers: &HeaderMap) -> bool {
    if status != StatusCode::OK {
        return false;
    }
    match headers.get(CACHE_CONTROL).and_then(|value| value.to_str().ok()) {
        Some(directives) => {
            let directives = directives.to_ascii_lowercase();
            !directives.contains("no-store") && !directives.contains("private")
        }
        None => true,
    }
}

pub fn fmt_http_date(date: DateTime<Utc>) -> String {
    date.format(HTTP_DATE_FORMAT).to_string()
}

pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}
