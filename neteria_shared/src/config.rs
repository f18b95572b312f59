//! Configuration surface for the client and server engines.
//!
//! Loads configuration from JSON strings (file IO left to the caller) via
//! a `#[derive(Deserialize)]` struct with field-level defaults and a
//! `Default` impl matching the protocol's documented defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_version() -> String {
    "1.0.2".to_string()
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    40080
}

fn default_timeout_secs() -> f64 {
    2.0
}

fn default_max_retries() -> u32 {
    4
}

fn default_registration_limit() -> usize {
    50
}

fn default_rsa_key_bits() -> usize {
    512
}

fn default_max_datagram_size() -> usize {
    10_240
}

fn default_stats_check_interval_secs() -> f64 {
    2.0
}

/// Configuration for a `ClientEngine`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// `0` means "pick a random port in [50000, 60000)" at bind time.
    #[serde(default)]
    pub listen_port: u16,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default)]
    pub compression: bool,
    #[serde(default)]
    pub encryption: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_rsa_key_bits")]
    pub rsa_key_bits: usize,
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
    #[serde(default)]
    pub stats: bool,
    #[serde(default = "default_stats_check_interval_secs")]
    pub stats_check_interval_secs: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            listen_address: default_listen_address(),
            listen_port: 0,
            server_port: default_server_port(),
            compression: false,
            encryption: false,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            rsa_key_bits: default_rsa_key_bits(),
            max_datagram_size: default_max_datagram_size(),
            stats: false,
            stats_check_interval_secs: default_stats_check_interval_secs(),
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    pub fn stats_check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.stats_check_interval_secs)
    }

    /// Resolves `listen_port`, picking a random port in `[50000, 60000)`
    /// when unset.
    pub fn resolved_listen_port(&self) -> u16 {
        if self.listen_port != 0 {
            self.listen_port
        } else {
            rand::Rng::gen_range(&mut rand::thread_rng(), 50_000..60_000)
        }
    }
}

/// Configuration for a `ServerEngine`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub allowed_versions: Vec<String>,
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_server_port")]
    pub listen_port: u16,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default)]
    pub compression: bool,
    #[serde(default)]
    pub encryption: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_registration_limit")]
    pub registration_limit: usize,
    #[serde(default = "default_rsa_key_bits")]
    pub rsa_key_bits: usize,
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
    #[serde(default)]
    pub stats: bool,
    #[serde(default = "default_stats_check_interval_secs")]
    pub stats_check_interval_secs: f64,
}

fn default_server_name() -> String {
    "Neteria Server".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            allowed_versions: vec![default_version()],
            listen_address: default_listen_address(),
            listen_port: default_server_port(),
            server_name: default_server_name(),
            compression: false,
            encryption: false,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            registration_limit: default_registration_limit(),
            rsa_key_bits: default_rsa_key_bits(),
            max_datagram_size: default_max_datagram_size(),
            stats: false,
            stats_check_interval_secs: default_stats_check_interval_secs(),
        }
    }
}

impl ServerConfig {
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    pub fn stats_check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.stats_check_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_defaults_match_protocol_defaults() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.server_port, 40080);
        assert_eq!(cfg.max_retries, 4);
        assert_eq!(cfg.rsa_key_bits, 512);
        assert_eq!(cfg.max_datagram_size, 10_240);
    }

    #[test]
    fn server_config_from_json_fills_defaults() {
        let cfg = ServerConfig::from_json_str(r#"{"server_name": "test"}"#).unwrap();
        assert_eq!(cfg.server_name, "test");
        assert_eq!(cfg.registration_limit, 50);
    }
}
