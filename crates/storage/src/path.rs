//! Path validation and cache key normalization.
//!
//! Keys are the only form in which a path crosses a crate boundary: relative
//! to the served root, components joined by `/` whatever the platform
//! separator is. Two distinct files always produce two distinct keys because
//! a single component can never contain the separator.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Validates a relative path for security and correctness.
/// Ensures that paths don't escape the served root (no `..` traversal).
///
/// > **Note:** This does **not** normalize backslashes, non-UTF8 bytes, or
/// >           platform-specific weirdness. Null bytes are explicitly rejected.
///
/// # Returns
/// Returns the normalized path if valid, or [`InvalidPath`](crate::error::ErrorKind::InvalidPath)
/// if invalid.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use memserve_storage::validate_path;
/// // Valid paths
/// assert!(validate_path("css/site.css").is_ok());
/// assert!(validate_path("a/../index.html").is_ok()); // (never leaves the root)
/// // Invalid paths
/// assert!(validate_path("../etc/passwd").is_err());
/// assert!(validate_path("a/../../b").is_err()); // (leaves the root)
/// assert!(validate_path("a\0b").is_err());
/// // Paths get resolved
/// assert_eq!(
///     validate_path("wrong/../still-wrong/.././img//./logo.png/").unwrap(),
///     Path::new("img/logo.png")
/// );
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let mut components = Vec::new();
    for component in path.as_ref().components() {
        match component {
            Component::Normal(s) => {
                // Null bytes pass through Path::components() on Unix but cause
                // truncation in C-based syscalls, reject them explicitly.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
            },
        }
    }
    match components.is_empty() {
        true => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
        false => Ok(components.into_iter().collect()),
    }
}

/// Turns a path relative to the served root into its cache key.
///
/// The path is validated first, then its components are joined with `/`.
/// Non-UTF8 file names cannot be addressed by a URL path and are rejected.
///
/// ```
/// use memserve_storage::path_key;
/// assert_eq!(path_key("img/./logo.png").unwrap(), "img/logo.png");
/// assert!(path_key("../outside").is_err());
/// ```
pub fn key(path: impl AsRef<Path>) -> Result<String> {
    let validated = validate(path.as_ref())?;
    let mut parts = Vec::new();
    for component in validated.components() {
        match component.as_os_str().to_str() {
            Some(part) => parts.push(part),
            None => exn::bail!(ErrorKind::InvalidPath(validated.clone())),
        }
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("index.html", "index.html")]
    #[case("css/site.css", "css/site.css")]
    #[case("a//b//c", "a/b/c")]
    #[case("a/./b/./c", "a/b/c")]
    #[case("/leading/slash.txt", "leading/slash.txt")]
    #[case("docs/", "docs")]
    #[case("a/b/..", "a")]
    fn test_valid_paths(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(validate(Path::new(input)).unwrap(), Path::new(expected));
    }

    #[rstest]
    #[case("../etc/passwd")]
    #[case("a/../../b")]
    #[case("..")]
    #[case("../..")]
    #[case("a\0b")]
    #[case("")]
    #[case(".")]
    #[case("./.")]
    #[case("//")]
    fn test_invalid_paths(#[case] input: &str) {
        assert!(validate(Path::new(input)).is_err());
    }

    #[cfg(windows)]
    #[test]
    fn test_backslash_normalization() {
        assert_eq!(key(Path::new("a\\b\\c")).unwrap(), "a/b/c");
    }

    #[test]
    fn test_key_uses_forward_slashes() {
        let path: PathBuf = ["assets", "img", "logo.png"].iter().collect();
        assert_eq!(key(&path).unwrap(), "assets/img/logo.png");
    }

    #[test]
    fn test_key_keeps_dotfiles() {
        assert_eq!(key(".hidden").unwrap(), ".hidden");
        assert_eq!(key(".git/config").unwrap(), ".git/config");
    }

    #[cfg(unix)]
    #[test]
    fn test_key_rejects_non_utf8() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;
        let path = Path::new(OsStr::from_bytes(b"bad\xffname"));
        assert!(key(path).is_err());
    }
}
