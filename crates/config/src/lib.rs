//! Layered runtime configuration.
//!
//! Settings are merged from, lowest priority first:
//! 1. compiled-in defaults ([`Config::default`]),
//! 2. a configuration file (TOML, or YAML/JSON by extension),
//! 3. `MEMSERVE_*` environment variables,
//! 4. command-line flags that were actually given ([`Overrides`]).
//!
//! Durations accept a unit suffix (`500ms`, `30s`, `5m`, `1h`) or a bare
//! number of seconds. A zero duration switches the associated feature off.

mod duration;
pub mod error;

pub use crate::duration::{format as format_duration, parse as parse_duration};
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use memserve_cache::Strategy;
use memserve_storage::backend::IgnorePattern;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment variable overrides (`MEMSERVE_REFRESH=5m`).
pub const ENV_PREFIX: &str = "MEMSERVE_";

/// Resolved server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory to serve.
    pub root: PathBuf,
    /// Address the HTTP server binds to.
    pub listen: SocketAddr,
    /// Interval between rescans; zero loads once and never rescans.
    #[serde(with = "duration")]
    pub refresh: Duration,
    pub strategy: Strategy,
    /// Regular expression over cache keys; matching files are never served.
    pub ignore: Option<String>,
    /// Minimum interval between two requests from the same client; zero
    /// disables rate limiting.
    #[serde(with = "duration")]
    pub rate_limit: Duration,
    /// Time allowed for a client to send a request's headers; zero disables
    /// it.
    #[serde(with = "duration")]
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
            refresh: Duration::ZERO,
            strategy: Strategy::default(),
            ignore: None,
            rate_limit: Duration::ZERO,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Values given on the command line. Unset fields leave lower layers alone.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<SocketAddr>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "duration::serialize_option")]
    pub refresh: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "duration::serialize_option")]
    pub rate_limit: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "duration::serialize_option")]
    pub request_timeout: Option<Duration>,
}

impl Config {
    /// Merge every layer and validate the result.
    ///
    /// `file` names the configuration file explicitly, in which case it must
    /// exist. Without it the per-user default location is consulted and
    /// silently skipped when absent.
    pub fn load(file: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let figment = Self::figment(file, overrides)?;
        let config: Self = figment.extract().map_err(|e| ErrorKind::Parse(e.to_string()))?;
        config.validate()?;
        tracing::debug!(?config, "Configuration loaded");
        Ok(config)
    }

    /// The merged (but not yet extracted) provider stack.
    pub fn figment(file: Option<&Path>, overrides: &Overrides) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        match file {
            Some(path) => {
                if !path.is_file() {
                    exn::bail!(ErrorKind::MissingFile(path.to_path_buf()));
                }
                tracing::debug!(path = %path.display(), "Reading configuration file");
                figment = merge_file(figment, path);
            },
            None => {
                if let Some(path) = default_path().filter(|path| path.is_file()) {
                    tracing::debug!(path = %path.display(), "Reading default configuration file");
                    figment = merge_file(figment, &path);
                }
            },
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX)).merge(Serialized::defaults(overrides)))
    }

    /// Check the settings that deserialization alone cannot.
    pub fn validate(&self) -> Result<()> {
        self.ignore_pattern()?;
        if self.root.as_os_str().is_empty() {
            exn::bail!(ErrorKind::Parse("`root` must not be empty".to_string()));
        }
        Ok(())
    }

    /// Compiled ignore pattern. An empty pattern counts as no pattern.
    pub fn ignore_pattern(&self) -> Result<Option<IgnorePattern>> {
        let Some(pattern) = self.ignore.as_deref().filter(|pattern| !pattern.is_empty()) else {
            return Ok(None);
        };
        let pattern = IgnorePattern::new(pattern).or_raise(|| ErrorKind::InvalidIgnore(pattern.to_string()))?;
        Ok(Some(pattern))
    }

    /// Refresh period, or `None` when periodic rescans are disabled.
    pub fn refresh_period(&self) -> Option<Duration> {
        non_zero(self.refresh)
    }

    /// Per-client minimum interval, or `None` when rate limiting is off.
    pub fn rate_limit_interval(&self) -> Option<Duration> {
        non_zero(self.rate_limit)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        non_zero(self.request_timeout)
    }
}

/// `config.toml` in the platform's per-user configuration directory, e.g.
/// `~/.config/memserve/config.toml` on Linux.
pub fn default_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "memserve").map(|dirs| dirs.config_dir().join("config.toml"))
}

fn merge_file(figment: Figment, path: &Path) -> Figment {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml" | "yml") => figment.merge(Yaml::file_exact(path)),
        Some("json") => figment.merge(Json::file_exact(path)),
        _ => figment.merge(Toml::file_exact(path)),
    }
}

fn non_zero(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}
