//! Read-only access to the served directory tree.
//!
//! Everything above this crate talks in terms of *keys*: forward-slash
//! separated paths relative to the served root (`css/site.css`), which are
//! exactly what an HTTP request path looks like once the leading `/` has been
//! stripped. Backends list and read files by those relative paths and never
//! write to the tree they serve.

pub mod backend;
pub mod error;
mod file;
mod path;

pub use crate::backend::StorageBackend;
pub use crate::file::FileInfo;
pub use crate::path::{key as path_key, validate as validate_path};
use std::sync::Arc;

pub type BackendHandle = Arc<dyn StorageBackend + Send + Sync>;
