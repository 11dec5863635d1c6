use crate::content::{Body, plain, serve_content};
use crate::rate_limit::RateLimiter;
use http::header::{self, HeaderValue};
use http::request::Parts;
use http::{Method, Response, StatusCode};
use memserve_cache::FileCache;
use percent_encoding::percent_decode_str;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// Answers requests straight out of the [`FileCache`].
///
/// The request path, minus its leading `/` and percent-decoded, is the cache
/// key. There is no other resolution: no `index.html`, no directory
/// listings, no redirects.
pub struct Handler {
    cache: Arc<FileCache>,
    rate_limiter: Option<RateLimiter>,
}

impl Handler {
    pub fn new(cache: Arc<FileCache>) -> Self {
        Self { cache, rate_limiter: None }
    }

    /// Reject clients that come back sooner than the limiter allows, before
    /// the cache is consulted.
    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Produce the response for one request from `peer` and log it.
    pub fn handle(&self, request: &Parts, peer: SocketAddr) -> Response<Body> {
        let started = Instant::now();
        let response = self.respond(request, peer);
        tracing::info!(
            method = %request.method,
            path = request.uri.path(),
            status = response.status().as_u16(),
            peer = %peer,
            elapsed = ?started.elapsed(),
            "Request served"
        );
        response
    }

    fn respond(&self, request: &Parts, peer: SocketAddr) -> Response<Body> {
        if let Some(limiter) = &self.rate_limiter
            && !limiter.check(peer.ip())
        {
            return plain(StatusCode::TOO_MANY_REQUESTS);
        }
        if request.method != Method::GET && request.method != Method::HEAD {
            let mut response = plain(StatusCode::METHOD_NOT_ALLOWED);
            response.headers_mut().insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
            return response;
        }
        let Some(key) = request_key(request.uri.path()) else {
            return plain(StatusCode::NOT_FOUND);
        };
        match self.cache.lookup(&key) {
            Some(entry) => serve_content(&request.method, &request.headers, &key, &entry),
            None => plain(StatusCode::NOT_FOUND),
        }
    }
}

/// Cache key for a request path: the leading `/` stripped and the rest
/// percent-decoded. `None` if the decoded path is not UTF-8, since no key
/// can match it.
pub fn request_key(path: &str) -> Option<String> {
    let path = path.strip_prefix('/').unwrap_or(path);
    percent_decode_str(path).decode_utf8().ok().map(|key| key.into_owned())
}
