use std::{env, fmt::Display, str::FromStr, time::Duration};
use tracing::{info, warn};

const LOCATE_URL: &str = "https://locate.measurementlab.net/v2/nearest/ndt/ndt7";
const LAST_RESORT_SERVER: &str = "wss://ndt-iupui-mlab3-ams05.measurementlab.net/ndt/v7/download";
const STATIC_SERVERS: [&str; 4] = [
    "wss://ndt-iupui-mlab1-nyc05.measurementlab.net/ndt/v7/download",
    "wss://ndt-iupui-mlab1-lon05.measurementlab.net/ndt/v7/download",
    "wss://ndt-iupui-mlab1-fra05.measurementlab.net/ndt/v7/download",
    "wss://ndt-iupui-mlab1-syd05.measurementlab.net/ndt/v7/download",
];
const HTTP_SOURCES: [&str; 3] = [
    "https://speed.hetzner.de/1MB.bin",
    "https://ipv4.download.thinkbroadband.com/1MB.zip",
    "https://proof.ovh.net/files/1Mb.dat",
];
const CONNECTIVITY_PROBE_URL: &str = "https://httpbin.org/get";

#[derive(Debug, Clone)]
pub struct Settings {
    pub download_secs: u64,
    pub stall_ms: u64,
    pub timeout_buffer_secs: u64,
    pub locate_timeout_ms: u64,
    pub low_byte_threshold: u64,
    pub server_cache_ttl_secs: u64,

    pub locate_url: String,
    pub static_servers: Vec<String>,
    pub last_resort_server: String,
    pub http_sources: Vec<String>,
    pub connectivity_probe_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_secs: 12,
            stall_ms: 2000,
            timeout_buffer_secs: 2,
            locate_timeout_ms: 3000,
            low_byte_threshold: 64 * 1024,
            server_cache_ttl_secs: 5 * 60,
            locate_url: LOCATE_URL.to_string(),
            static_servers: STATIC_SERVERS.iter().map(|s| s.to_string()).collect(),
            last_resort_server: LAST_RESORT_SERVER.to_string(),
            http_sources: HTTP_SOURCES.iter().map(|s| s.to_string()).collect(),
            connectivity_probe_url: CONNECTIVITY_PROBE_URL.to_string(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            download_secs: try_load("CAFESPEED_DOWNLOAD_SECS", defaults.download_secs),
            stall_ms: try_load("CAFESPEED_STALL_MS", defaults.stall_ms),
            timeout_buffer_secs: try_load("CAFESPEED_TIMEOUT_BUFFER_SECS", defaults.timeout_buffer_secs),
            locate_timeout_ms: try_load("CAFESPEED_LOCATE_TIMEOUT_MS", defaults.locate_timeout_ms),
            low_byte_threshold: try_load("CAFESPEED_LOW_BYTE_THRESHOLD", defaults.low_byte_threshold),
            server_cache_ttl_secs: try_load("CAFESPEED_SERVER_CACHE_TTL_SECS", defaults.server_cache_ttl_secs),
            ..defaults
        }
    }

    pub fn download_duration(&self) -> Duration {
        Duration::from_secs(self.download_secs)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_ms)
    }

    pub fn global_timeout(&self) -> Duration {
        Duration::from_secs(self.download_secs + self.timeout_buffer_secs)
    }

    pub fn locate_timeout(&self) -> Duration {
        Duration::from_millis(self.locate_timeout_ms)
    }

    pub fn server_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.server_cache_ttl_secs)
    }
}

fn try_load<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|e| {
            warn!("Invalid {key} value {raw:?}: {e}, using default: {default}");
            default
        }),
        Err(_) => {
            info!("{key} not set, using default: {default}");
            default
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsField {
    Duration,
    Stall,
    TimeoutBuffer,
}

impl SettingsField {
    pub fn next(self) -> Self {
        match self {
            SettingsField::Duration => SettingsField::Stall,
            SettingsField::Stall => SettingsField::TimeoutBuffer,
            SettingsField::TimeoutBuffer => SettingsField::Duration,
        }
    }

    pub fn prev(self) -> Self {
        match self {
            SettingsField::Duration => SettingsField::TimeoutBuffer,
            SettingsField::Stall => SettingsField::Duration,
            SettingsField::TimeoutBuffer => SettingsField::Stall,
        }
    }
}
