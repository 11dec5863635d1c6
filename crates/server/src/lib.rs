//! HTTP front end for the in-memory file cache.
//!
//! # Architecture
//! - [`Server`]: accept loop and per-connection HTTP/1.1 tasks, with graceful
//!   shutdown through a cancellation token.
//! - [`Handler`]: maps a request path to a cache key, applies the optional
//!   [`RateLimiter`] and logs every request.
//! - [`serve_content`]: validators, conditional requests and byte ranges for
//!   a single cache entry.

mod content;
pub mod error;
mod handler;
mod rate_limit;
mod server;

pub use crate::content::{Body, plain, serve_content};
pub use crate::handler::{Handler, request_key};
pub use crate::rate_limit::{DEFAULT_WINDOW, RateLimiter};
pub use crate::server::Server;
