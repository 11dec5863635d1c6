use clap::Parser;
use memserve_cache::Strategy;
use memserve_config::{Overrides, parse_duration};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Serve a directory tree from memory, rescanning it in the background.
///
/// Every flag can also be set in the configuration file or through a
/// `MEMSERVE_*` environment variable; flags win.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Directory to serve [default: .]
    #[arg(short, long, value_name = "DIR")]
    pub dir: Option<PathBuf>,
    /// Address to listen on [default: 0.0.0.0:8080]
    #[arg(short, long, value_name = "ADDR")]
    pub addr: Option<SocketAddr>,
    /// Interval between rescans, e.g. `30s` or `5m`; `0` loads once [default: 0]
    #[arg(short, long, value_name = "DURATION", value_parser = duration)]
    pub refresh: Option<Duration>,
    /// Minimum interval between requests from one client; `0` disables [default: 0]
    #[arg(long, value_name = "DURATION", value_parser = duration)]
    pub rate: Option<Duration>,
    /// Regular expression over relative paths; matching files are not served
    #[arg(short, long, value_name = "REGEX")]
    pub ignore: Option<String>,
    /// Time allowed for a client to send a request; `0` disables [default: 30s]
    #[arg(long, value_name = "DURATION", value_parser = duration)]
    pub timeout: Option<Duration>,
    /// How a rescan is applied to the cache [default: incremental]
    #[arg(long, value_name = "STRATEGY", value_parser = strategy)]
    pub strategy: Option<Strategy>,
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, value_name = "FILE", env = "MEMSERVE_CONFIG")]
    pub config: Option<PathBuf>,
    /// More logging; repeat for even more
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            root: self.dir.clone(),
            listen: self.addr,
            refresh: self.refresh,
            strategy: self.strategy,
            ignore: self.ignore.clone(),
            rate_limit: self.rate,
            request_timeout: self.timeout,
        }
    }
}

fn duration(value: &str) -> Result<Duration, String> {
    parse_duration(value).map_err(|e| e.to_string())
}

fn strategy(value: &str) -> Result<Strategy, String> {
    match value.to_ascii_lowercase().as_str() {
        "incremental" => Ok(Strategy::Incremental),
        "snapshot" => Ok(Strategy::Snapshot),
        _ => Err(format!("unknown strategy `{value}` (expected `incremental` or `snapshot`)")),
    }
}
