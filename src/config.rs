use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;

use crate::game::constants::map::DEFAULT_WINDOW;
use crate::game::constants::tick::SERVER_TICK_SPEED;

/// What to do when the last client leaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadWhenEmpty {
    Off,
    /// Reload the map the first time the server is empty, then switch off
    Once,
    /// Reload every time the server becomes empty
    Always,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub bind_address: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Port of the metrics endpoint
    pub metrics_port: u16,
    /// Number of client slots
    pub max_clients: usize,
    /// Top slots usable only with the reserved-slots password
    pub reserved_slots: usize,
    /// Server password, empty for none
    pub password: String,
    pub reserved_slots_password: String,
    /// Map to load
    pub map: String,
    pub maps_dir: PathBuf,
    pub demos_dir: PathBuf,
    /// Simulation ticks per second
    pub tick_speed: u32,
    /// Snapshot every tick instead of every second tick
    pub high_bandwidth: bool,
    /// Pipeline map chunks ahead of client requests
    pub fast_download: bool,
    /// Chunks sent ahead when fast download is on
    pub map_window: i32,
    /// Inbound traffic limit per client in KiB/s, 0 disables
    pub netlimit: u32,
    /// Weight of the newest sample in the traffic average, percent
    pub netlimit_alpha: u32,
    pub dnsbl: bool,
    pub dnsbl_host: String,
    pub dnsbl_key: Option<String>,
    /// Ban addresses the blocklist reports
    pub dnsbl_ban: bool,
    pub reload_when_empty: ReloadWhenEmpty,
    pub shutdown_when_empty: bool,
    pub rcon_password: String,
    pub rcon_mod_password: String,
    pub rcon_helper_password: String,
    /// Failed rcon logins before sanction, 0 disables the limit
    pub rcon_max_tries: u32,
    /// Ban length in minutes after too many failed logins, 0 only drops
    pub rcon_bantime: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 8303,
            metrics_port: 9090,
            max_clients: 64,
            reserved_slots: 0,
            password: String::new(),
            reserved_slots_password: String::new(),
            map: "dm1".to_string(),
            maps_dir: PathBuf::from("maps"),
            demos_dir: PathBuf::from("demos"),
            tick_speed: SERVER_TICK_SPEED,
            high_bandwidth: false,
            fast_download: true,
            map_window: DEFAULT_WINDOW,
            netlimit: 500,
            netlimit_alpha: 50,
            dnsbl: false,
            dnsbl_host: "zen.spamhaus.org".to_string(),
            dnsbl_key: None,
            dnsbl_ban: false,
            reload_when_empty: ReloadWhenEmpty::Off,
            shutdown_when_empty: false,
            rcon_password: String::new(),
            rcon_mod_password: String::new(),
            rcon_helper_password: String::new(),
            rcon_max_tries: 30,
            rcon_bantime: 5,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, valid: impl Fn(&T) -> bool, target: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse::<T>() {
            Ok(parsed) if valid(&parsed) => *target = parsed,
            Ok(_) => tracing::warn!("{} out of range ('{}'), using default", key, raw),
            Err(_) => tracing::warn!("Invalid {} '{}', using default", key, raw),
        }
    }
}

fn env_bool(key: &str, target: &mut bool) {
    if let Ok(raw) = std::env::var(key) {
        match raw.as_str() {
            "1" | "true" | "yes" => *target = true,
            "0" | "false" | "no" => *target = false,
            _ => tracing::warn!("Invalid {} '{}', using default", key, raw),
        }
    }
}

fn env_string(key: &str, target: &mut String) {
    if let Ok(raw) = std::env::var(key) {
        *target = raw;
    }
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        env_parse("BIND_ADDRESS", |_| true, &mut config.bind_address);
        env_parse("PORT", |&p: &u16| p > 0, &mut config.port);
        env_parse("METRICS_PORT", |&p: &u16| p > 0, &mut config.metrics_port);
        env_parse("MAX_CLIENTS", |&n: &usize| (1..=256).contains(&n), &mut config.max_clients);
        env_parse("RESERVED_SLOTS", |_: &usize| true, &mut config.reserved_slots);
        env_string("SERVER_PASSWORD", &mut config.password);
        env_string("RESERVED_SLOTS_PASSWORD", &mut config.reserved_slots_password);
        env_string("MAP", &mut config.map);
        if let Ok(dir) = std::env::var("MAPS_DIR") {
            config.maps_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("DEMOS_DIR") {
            config.demos_dir = PathBuf::from(dir);
        }
        env_parse("TICK_SPEED", |&t: &u32| (1..=1000).contains(&t), &mut config.tick_speed);
        env_bool("HIGH_BANDWIDTH", &mut config.high_bandwidth);
        env_bool("FAST_DOWNLOAD", &mut config.fast_download);
        env_parse("MAP_WINDOW", |&w: &i32| (0..=100).contains(&w), &mut config.map_window);
        env_parse("NETLIMIT", |_: &u32| true, &mut config.netlimit);
        env_parse("NETLIMIT_ALPHA", |&a: &u32| (1..=100).contains(&a), &mut config.netlimit_alpha);
        env_bool("DNSBL", &mut config.dnsbl);
        env_string("DNSBL_HOST", &mut config.dnsbl_host);
        if let Ok(key) = std::env::var("DNSBL_KEY") {
            config.dnsbl_key = Some(key).filter(|k| !k.is_empty());
        }
        env_bool("DNSBL_BAN", &mut config.dnsbl_ban);

        if let Ok(raw) = std::env::var("RELOAD_WHEN_EMPTY") {
            match raw.as_str() {
                "0" => config.reload_when_empty = ReloadWhenEmpty::Off,
                "1" => config.reload_when_empty = ReloadWhenEmpty::Once,
                "2" => config.reload_when_empty = ReloadWhenEmpty::Always,
                _ => tracing::warn!("RELOAD_WHEN_EMPTY must be 0, 1 or 2, using default"),
            }
        }
        env_bool("SHUTDOWN_WHEN_EMPTY", &mut config.shutdown_when_empty);

        env_string("RCON_PASSWORD", &mut config.rcon_password);
        env_string("RCON_MOD_PASSWORD", &mut config.rcon_mod_password);
        env_string("RCON_HELPER_PASSWORD", &mut config.rcon_helper_password);
        env_parse("RCON_MAX_TRIES", |_: &u32| true, &mut config.rcon_max_tries);
        env_parse("RCON_BANTIME", |_: &u64| true, &mut config.rcon_bantime);

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("Port cannot be 0".to_string());
        }
        if self.max_clients == 0 {
            return Err("max_clients must be at least 1".to_string());
        }
        if self.reserved_slots > self.max_clients {
            return Err("reserved_slots cannot exceed max_clients".to_string());
        }
        if self.tick_speed == 0 {
            return Err("tick_speed must be at least 1".to_string());
        }
        if self.map.is_empty() {
            return Err("map must be set".to_string());
        }
        if !(1..=100).contains(&self.netlimit_alpha) {
            return Err("netlimit_alpha must be 1-100".to_string());
        }
        Ok(())
    }

    /// Inbound traffic limit in bytes per second, `None` when disabled
    pub fn netlimit_bytes_per_sec(&self) -> Option<f64> {
        (self.netlimit > 0).then(|| self.netlimit as f64 * 1024.0)
    }

    /// First slot index that requires the reserved-slots password
    pub fn first_reserved_slot(&self) -> usize {
        self.max_clients.saturating_sub(self.reserved_slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8303);
        assert_eq!(config.tick_speed, 50);
        assert!(config.fast_download);
        assert!(!config.high_bandwidth);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_default() {
        let config = ServerConfig::load_or_default();
        assert!(config.port > 0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = ServerConfig {
            reserved_slots: 70,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            map: String::new(),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_values() {
        let config = ServerConfig {
            max_clients: 16,
            reserved_slots: 2,
            netlimit: 0,
            ..ServerConfig::default()
        };
        assert_eq!(config.first_reserved_slot(), 14);
        assert_eq!(config.netlimit_bytes_per_sec(), None);
        assert_eq!(ServerConfig::default().netlimit_bytes_per_sec(), Some(512_000.0));
    }
}
