//! Load config from file and environment.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use hive_core::config::{DEFAULT_DISCOVERY_PORT, DEFAULT_LINK_PORT, DEFAULT_MESSAGE_PORTS};
use hive_core::NetConfig;
use serde::Deserialize;
use tracing::warn;

/// Daemon configuration. File: ~/.config/hive/config.toml or /etc/hive/config.toml.
/// Env overrides: HIVE_DISCOVERY_PORT, HIVE_MESSAGE_PORTS, HIVE_LINK_PORT, HIVE_DISPLAY_NAME.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery UDP port (default 9999).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Message port candidates, in preference order.
    #[serde(default = "default_message_ports")]
    pub message_ports: Vec<u16>,
    /// Direct-link TCP port (default 8888).
    #[serde(default = "default_link_port")]
    pub link_port: u16,
    /// Overrides the name saved with the identity.
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: Ipv4Addr,
    #[serde(default)]
    pub broadcast_interval_ms: Option<u64>,
    /// Announcements per burst.
    #[serde(default)]
    pub broadcast_burst: Option<u32>,
    #[serde(default)]
    pub burst_gap_ms: Option<u64>,
    #[serde(default)]
    pub discovery_duration_ms: Option<u64>,
    #[serde(default)]
    pub listen_timeout_ms: Option<u64>,
    #[serde(default)]
    pub stale_threshold_ms: Option<u64>,
    #[serde(default)]
    pub sweep_interval_ms: Option<u64>,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}
fn default_message_ports() -> Vec<u16> {
    DEFAULT_MESSAGE_PORTS.to_vec()
}
fn default_link_port() -> u16 {
    DEFAULT_LINK_PORT
}
fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_broadcast_addr() -> Ipv4Addr {
    Ipv4Addr::BROADCAST
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            message_ports: default_message_ports(),
            link_port: default_link_port(),
            display_name: None,
            bind_addr: default_bind_addr(),
            broadcast_addr: default_broadcast_addr(),
            broadcast_interval_ms: None,
            broadcast_burst: None,
            burst_gap_ms: None,
            discovery_duration_ms: None,
            listen_timeout_ms: None,
            stale_threshold_ms: None,
            sweep_interval_ms: None,
            connect_timeout_ms: None,
        }
    }
}

impl Config {
    /// Network settings for the core; unset durations keep the core defaults.
    pub fn net_config(&self) -> NetConfig {
        let d = NetConfig::default();
        let ms = |v: Option<u64>, fallback: Duration| v.map(Duration::from_millis).unwrap_or(fallback);
        NetConfig {
            discovery_port: self.discovery_port,
            message_ports: self.message_ports.clone(),
            link_port: self.link_port,
            bind_addr: self.bind_addr,
            broadcast_addr: self.broadcast_addr,
            broadcast_interval: ms(self.broadcast_interval_ms, d.broadcast_interval),
            broadcast_burst: self.broadcast_burst.unwrap_or(d.broadcast_burst),
            burst_gap: ms(self.burst_gap_ms, d.burst_gap),
            discovery_duration: ms(self.discovery_duration_ms, d.discovery_duration),
            listen_timeout: ms(self.listen_timeout_ms, d.listen_timeout),
            stale_threshold: ms(self.stale_threshold_ms, d.stale_threshold),
            sweep_interval: ms(self.sweep_interval_ms, d.sweep_interval),
            connect_timeout: ms(self.connect_timeout_ms, d.connect_timeout),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("HIVE_DISCOVERY_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.discovery_port = p;
    }
    if let Some(s) = var("HIVE_MESSAGE_PORTS") {
        match parse_port_list(&s) {
            Some(ports) => c.message_ports = ports,
            None => warn!(value = %s, "ignoring invalid HIVE_MESSAGE_PORTS"),
        }
    }
    if let Some(p) = var("HIVE_LINK_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.link_port = p;
    }
    if let Some(name) = var("HIVE_DISPLAY_NAME").filter(|n| !n.trim().is_empty()) {
        c.display_name = Some(name);
    }
}

/// "443, 80,8080" -> [443, 80, 8080]. Any bad entry rejects the whole list.
fn parse_port_list(s: &str) -> Option<Vec<u16>> {
    let ports = s
        .split(',')
        .map(|p| p.trim().parse::<u16>().ok())
        .collect::<Option<Vec<_>>>()?;
    (!ports.is_empty()).then_some(ports)
}

pub fn config_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config/hive"))
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(dir) = config_dir() {
        out.push(dir.join("config.toml"));
    }
    out.push(PathBuf::from("/etc/hive/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => warn!(path = %p.display(), "invalid config, using defaults: {e}"),
                },
                Err(e) => warn!(path = %p.display(), "cannot read config: {e}"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_gives_core_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.net_config(), NetConfig::default());
    }

    #[test]
    fn file_values_and_durations() {
        let c: Config = toml::from_str(
            r#"
            discovery_port = 10000
            message_ports = [8080, 9090]
            discovery_duration_ms = 1500
            "#,
        )
        .unwrap();
        let n = c.net_config();
        assert_eq!(n.discovery_port, 10000);
        assert_eq!(n.message_ports, vec![8080, 9090]);
        assert_eq!(n.discovery_duration, Duration::from_millis(1500));
        assert_eq!(n.connect_timeout, NetConfig::default().connect_timeout);
    }

    #[test]
    fn every_tunable_is_settable_from_file() {
        let c: Config = toml::from_str(
            r#"
            bind_addr = "127.0.0.1"
            broadcast_addr = "192.168.1.255"
            broadcast_interval_ms = 2000
            broadcast_burst = 5
            burst_gap_ms = 20
            discovery_duration_ms = 10000
            listen_timeout_ms = 500
            stale_threshold_ms = 15000
            sweep_interval_ms = 1000
            connect_timeout_ms = 3000
            "#,
        )
        .unwrap();
        let n = c.net_config();
        assert_eq!(n.bind_addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(n.broadcast_addr, Ipv4Addr::new(192, 168, 1, 255));
        assert_eq!(n.broadcast_interval, Duration::from_secs(2));
        assert_eq!(n.broadcast_burst, 5);
        assert_eq!(n.burst_gap, Duration::from_millis(20));
        assert_eq!(n.discovery_duration, Duration::from_secs(10));
        assert_eq!(n.listen_timeout, Duration::from_millis(500));
        assert_eq!(n.stale_threshold, Duration::from_secs(15));
        assert_eq!(n.sweep_interval, Duration::from_secs(1));
        assert_eq!(n.connect_timeout, Duration::from_secs(3));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("HIVE_DISCOVERY_PORT", "7000"),
            ("HIVE_MESSAGE_PORTS", "443, 8443"),
            ("HIVE_LINK_PORT", "not a port"),
            ("HIVE_DISPLAY_NAME", "Desk"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.discovery_port, 7000);
        assert_eq!(c.message_ports, vec![443, 8443]);
        assert_eq!(c.link_port, DEFAULT_LINK_PORT);
        assert_eq!(c.display_name.as_deref(), Some("Desk"));
    }

    #[test]
    fn port_list_parsing() {
        assert_eq!(parse_port_list("1,2"), Some(vec![1, 2]));
        assert_eq!(parse_port_list("1,x"), None);
        assert_eq!(parse_port_list(""), None);
    }
}
