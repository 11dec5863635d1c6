//! Turning a cache entry into an HTTP response.
//!
//! Handles the parts of HTTP that only need the content and its
//! modification time: `Last-Modified`/`ETag` validators, conditional requests
//! (`If-Match`, `If-Unmodified-Since`, `If-None-Match`, `If-Modified-Since`)
//! and single byte ranges (`Range`, `If-Range`).

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, Response, StatusCode};
use http_body_util::Full;
use memserve_cache::CacheEntry;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use time::OffsetDateTime;

/// Response body type used throughout the server.
pub type Body = Full<Bytes>;

/// Last second `httpdate` can render (9999-12-31T23:59:59Z).
const MAX_HTTP_DATE: i64 = 253_402_300_799;

/// Build the response for `entry`, served under `key`.
///
/// `key` only feeds the `Content-Type` guess. `HEAD` gets the same status
/// and headers as `GET` with an empty body.
pub fn serve_content(method: &Method, headers: &HeaderMap, key: &str, entry: &CacheEntry) -> Response<Body> {
    let last_modified = http_time(entry.modified());
    match check_preconditions(method, headers, entry.etag(), last_modified) {
        Precondition::Proceed => {},
        Precondition::NotModified => return not_modified(entry.etag(), last_modified),
        Precondition::Failed => return plain(StatusCode::PRECONDITION_FAILED),
    }

    let size = entry.len() as u64;
    let mut status = StatusCode::OK;
    let mut body = entry.content().clone();
    let mut content_range = None;
    if let Some(range) = headers.get(header::RANGE)
        && if_range_allows(headers, entry.etag(), last_modified)
    {
        match parse_range(range, size) {
            ByteRange::Whole => {},
            ByteRange::Partial { start, end } => {
                status = StatusCode::PARTIAL_CONTENT;
                body = body.slice(start as usize..end as usize);
                content_range = Some(format!("bytes {start}-{}/{size}", end - 1));
            },
            ByteRange::Unsatisfiable => {
                let mut response = plain(StatusCode::RANGE_NOT_SATISFIABLE);
                insert(response.headers_mut(), header::CONTENT_RANGE, format!("bytes */{size}"));
                return response;
            },
        }
    }

    let length = body.len() as u64;
    let mut response = Response::new(Full::new(if method == Method::HEAD { Bytes::new() } else { body }));
    *response.status_mut() = status;
    let out = response.headers_mut();
    out.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type(key)));
    out.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    out.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    insert(out, header::ETAG, entry.etag().to_string());
    if let Some(last_modified) = last_modified {
        insert(out, header::LAST_MODIFIED, httpdate::fmt_http_date(last_modified));
    }
    if let Some(content_range) = content_range {
        insert(out, header::CONTENT_RANGE, content_range);
    }
    response
}

/// Short `text/plain` response for anything that is not file content.
pub fn plain(status: StatusCode) -> Response<Body> {
    let text = format!("{} {}\n", status.as_u16(), status.canonical_reason().unwrap_or_default());
    let mut response = Response::new(Full::new(Bytes::from(text)));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}

fn not_modified(etag: &str, last_modified: Option<SystemTime>) -> Response<Body> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::NOT_MODIFIED;
    let headers = response.headers_mut();
    insert(headers, header::ETAG, etag.to_string());
    if let Some(last_modified) = last_modified {
        insert(headers, header::LAST_MODIFIED, httpdate::fmt_http_date(last_modified));
    }
    response
}

fn insert(headers: &mut HeaderMap, name: header::HeaderName, value: String) {
    if let Ok(value) = HeaderValue::try_from(value) {
        headers.insert(name, value);
    }
}

fn content_type(key: &str) -> &'static str {
    mime_guess::from_path(key).first_raw().unwrap_or("application/octet-stream")
}

/// Modification time at HTTP-date (whole second) precision.
///
/// `None` for times HTTP cannot express; such entries simply go without
/// `Last-Modified` and date-based conditionals.
fn http_time(modified: OffsetDateTime) -> Option<SystemTime> {
    let seconds = modified.unix_timestamp();
    if !(1..=MAX_HTTP_DATE).contains(&seconds) {
        return None;
    }
    Some(UNIX_EPOCH + Duration::from_secs(seconds as u64))
}

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn header_date(headers: &HeaderMap, name: header::HeaderName) -> Option<SystemTime> {
    header_str(headers, name).and_then(|value| httpdate::parse_http_date(value.trim()).ok())
}

/// Whether `etag` appears in a comma-separated list of entity tags.
///
/// Strong comparison never matches weak (`W/`) candidates; weak comparison
/// ignores the prefix.
fn etag_listed(list: &str, etag: &str, weak: bool) -> bool {
    list.split(',').map(str::trim).any(|candidate| {
        if candidate == "*" {
            return true;
        }
        match candidate.strip_prefix("W/") {
            Some(stripped) => weak && stripped == etag,
            None => candidate == etag,
        }
    })
}

#[derive(Debug, PartialEq, Eq)]
enum Precondition {
    Proceed,
    NotModified,
    Failed,
}

/// Evaluate conditional request headers in RFC 9110 §13.2.2 order.
fn check_preconditions(
    method: &Method,
    headers: &HeaderMap,
    etag: &str,
    last_modified: Option<SystemTime>,
) -> Precondition {
    if let Some(if_match) = header_str(headers, header::IF_MATCH) {
        if !etag_listed(if_match, etag, false) {
            return Precondition::Failed;
        }
    } else if let (Some(since), Some(modified)) = (header_date(headers, header::IF_UNMODIFIED_SINCE), last_modified)
        && modified > since
    {
        return Precondition::Failed;
    }

    let safe = method == Method::GET || method == Method::HEAD;
    if let Some(if_none_match) = header_str(headers, header::IF_NONE_MATCH) {
        if etag_listed(if_none_match, etag, true) {
            return if safe { Precondition::NotModified } else { Precondition::Failed };
        }
    } else if safe
        && let (Some(since), Some(modified)) = (header_date(headers, header::IF_MODIFIED_SINCE), last_modified)
        && modified <= since
    {
        return Precondition::NotModified;
    }
    Precondition::Proceed
}

/// `If-Range` names the representation a partial request is valid for; if
/// it no longer matches, the whole content is sent instead.
fn if_range_allows(headers: &HeaderMap, etag: &str, last_modified: Option<SystemTime>) -> bool {
    let Some(value) = header_str(headers, header::IF_RANGE).map(str::trim) else {
        return true;
    };
    if value.starts_with('"') || value.starts_with("W/") {
        return value == etag;
    }
    match (httpdate::parse_http_date(value).ok(), last_modified) {
        (Some(date), Some(modified)) => date == modified,
        _ => false,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ByteRange {
    /// No usable range: send everything with `200`.
    Whole,
    /// `start..end` (end exclusive).
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Parse a `Range` header against a representation of `size` bytes.
///
/// Only a single `bytes` range is honoured. Malformed headers, other units
/// and multiple ranges fall back to the whole content.
fn parse_range(value: &HeaderValue, size: u64) -> ByteRange {
    let Some(ranges) = value.to_str().ok().and_then(|value| value.trim().strip_prefix("bytes=")) else {
        return ByteRange::Whole;
    };
    if ranges.contains(',') {
        return ByteRange::Whole;
    }
    let Some((first, last)) = ranges.trim().split_once('-') else {
        return ByteRange::Whole;
    };
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        // Suffix range: the final `last` bytes.
        let Ok(suffix) = last.parse::<u64>() else {
            return ByteRange::Whole;
        };
        if suffix == 0 || size == 0 {
            return ByteRange::Unsatisfiable;
        }
        return ByteRange::Partial { start: size - suffix.min(size), end: size };
    }

    let Ok(start) = first.parse::<u64>() else {
        return ByteRange::Whole;
    };
    let end = if last.is_empty() {
        size
    } else {
        match last.parse::<u64>() {
            Ok(last) if last >= start => last.saturating_add(1).min(size),
            _ => return ByteRange::Whole,
        }
    };
    if start >= size {
        return ByteRange::Unsatisfiable;
    }
    ByteRange::Partial { start, end }
}
