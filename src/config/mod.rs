use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::remote::WriteMode;

pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_READ_RETRIES: u32 = 2;
pub const DEFAULT_FAST_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_SLOW_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_DEBOUNCE_MS: u64 = 3_000;
pub const DEFAULT_CACHE_KEY: &str = "examsy_backup";
pub const DEFAULT_MAX_VIOLATIONS: u32 = 3;
pub const DEFAULT_COOLDOWN_MS: u64 = 2_000;
pub const DEFAULT_BLOCK_CHECK_SECS: u64 = 15;

pub struct Config {
    pub server: ServerConfig,
    pub remote: RemoteConfig,
    pub sync: SyncConfig,
    pub cache: CacheConfig,
    pub monitor: MonitorConfig,
    pub admin: AdminConfig,
    pub log_json: bool,
}

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub endpoint: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub read_retries: u32,
    pub write_mode: WriteMode,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub fast_interval: Duration,
    pub slow_interval: Duration,
    pub debounce: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub max_violations: u32,
    pub cooldown: Duration,
    pub block_check_interval: Duration,
    pub camera_required: bool,
}

#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub username: String,
    pub password: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
            read_retries: DEFAULT_READ_RETRIES,
            write_mode: WriteMode::Envelope,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fast_interval: Duration::from_secs(DEFAULT_FAST_INTERVAL_SECS),
            slow_interval: Duration::from_secs(DEFAULT_SLOW_INTERVAL_SECS),
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_violations: DEFAULT_MAX_VIOLATIONS,
            cooldown: Duration::from_millis(DEFAULT_COOLDOWN_MS),
            block_check_interval: Duration::from_secs(DEFAULT_BLOCK_CHECK_SECS),
            camera_required: false,
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            username: "admin".to_string(),
            password: "admin123".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_or("SERVER_PORT", 8080),
            },
            remote: RemoteConfig {
                endpoint: env::var("REMOTE_ENDPOINT").unwrap_or_default(),
                read_timeout: Duration::from_secs(parse_or(
                    "REMOTE_READ_TIMEOUT_SECS",
                    DEFAULT_READ_TIMEOUT_SECS,
                )),
                write_timeout: Duration::from_secs(parse_or(
                    "REMOTE_WRITE_TIMEOUT_SECS",
                    DEFAULT_WRITE_TIMEOUT_SECS,
                )),
                read_retries: parse_or("REMOTE_READ_RETRIES", DEFAULT_READ_RETRIES),
                write_mode: parse_or("REMOTE_WRITE_MODE", WriteMode::Envelope),
            },
            sync: SyncConfig {
                fast_interval: Duration::from_secs(parse_or(
                    "SYNC_FAST_INTERVAL_SECS",
                    DEFAULT_FAST_INTERVAL_SECS,
                )),
                slow_interval: Duration::from_secs(parse_or(
                    "SYNC_SLOW_INTERVAL_SECS",
                    DEFAULT_SLOW_INTERVAL_SECS,
                )),
                debounce: Duration::from_millis(parse_or("SYNC_DEBOUNCE_MS", DEFAULT_DEBOUNCE_MS)),
            },
            cache: CacheConfig {
                dir: env::var("CACHE_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./.examsy-cache")),
                key: env::var("CACHE_KEY").unwrap_or_else(|_| DEFAULT_CACHE_KEY.to_string()),
            },
            monitor: MonitorConfig {
                max_violations: parse_or("MONITOR_MAX_VIOLATIONS", DEFAULT_MAX_VIOLATIONS),
                cooldown: Duration::from_millis(parse_or("MONITOR_COOLDOWN_MS", DEFAULT_COOLDOWN_MS)),
                block_check_interval: Duration::from_secs(parse_or(
                    "MONITOR_BLOCK_CHECK_SECS",
                    DEFAULT_BLOCK_CHECK_SECS,
                )),
                camera_required: parse_or("MONITOR_CAMERA_REQUIRED", false),
            },
            admin: AdminConfig {
                username: env::var("ADMIN_USERNAME").unwrap_or_else(|_| "admin".to_string()),
                password: env::var("ADMIN_PASSWORD").unwrap_or_else(|_| "admin123".to_string()),
            },
            log_json: env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }

    pub fn bind_address(&self) -> ([u8; 4], u16) {
        let ip_addr = self.parse_host_to_ipv4();
        (ip_addr.octets(), self.server.port)
    }

    fn parse_host_to_ipv4(&self) -> Ipv4Addr {
        // Try to parse as IP address first
        if let Ok(addr) = self.server.host.parse::<IpAddr>() {
            match addr {
                IpAddr::V4(ipv4) => return ipv4,
                IpAddr::V6(_) => {
                    tracing::warn!(
                        host = %self.server.host,
                        "IPv6 address provided but only IPv4 supported, using 0.0.0.0"
                    );
                    return Ipv4Addr::new(0, 0, 0, 0);
                }
            }
        }

        match self.server.host.as_str() {
            "localhost" => Ipv4Addr::new(127, 0, 0, 1),
            "" | "0.0.0.0" => Ipv4Addr::new(0, 0, 0, 0),
            _ => {
                tracing::warn!(
                    host = %self.server.host,
                    "Unable to parse host as IPv4, using 0.0.0.0"
                );
                Ipv4Addr::new(0, 0, 0, 0)
            }
        }
    }
}

/// Reads `key` from the environment, falling back to `default` when unset or unparsable.
fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key = %key, value = %raw, "Invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}
