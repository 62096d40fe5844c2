use std::{net::Ipv4Addr, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use utilities::discovery::{DEFAULT_GROUP, DEFAULT_PORT};

fn default_announce_interval() -> u64 {
    10
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    #[serde(default = "default_announce_interval")]
    pub announce_interval_secs: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    // human readable name, hashed to place the node on the ring
    pub node_name: String,
    pub listen_addr: String,
    // address peers use to reach this node, also its identity on the ring
    pub advertise_addr: String,
    pub nameserver_addr: String,
    pub storage_path: PathBuf,
    pub replication_interval_secs: u64,
    pub lock_poll_interval_secs: u64,
    pub remote_timeout_ms: u64,
    pub transfer_timeout_secs: u64,
    pub log_level: String,
    pub log_base: String,
    pub apm_endpoint: Option<String>,
    pub discovery: DiscoveryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: "node".to_string(),
            listen_addr: "0.0.0.0:7100".to_string(),
            advertise_addr: "127.0.0.1:7100".to_string(),
            nameserver_addr: "127.0.0.1:7000".to_string(),
            storage_path: PathBuf::from("./temp/node"),
            replication_interval_secs: 30,
            lock_poll_interval_secs: 5,
            remote_timeout_ms: 5000,
            transfer_timeout_secs: 300,
            log_level: "info".to_string(),
            log_base: "./temp/logs".to_string(),
            apm_endpoint: None,
            discovery: DiscoveryConfig {
                group: DEFAULT_GROUP,
                port: DEFAULT_PORT,
                announce_interval_secs: default_announce_interval(),
            },
        }
    }
}

impl Config {
    /// Defaults, then `CONFIG_PATH` (or `./node/config/<ENV>.yaml`), then
    /// `NODE_*` environment variables (`NODE_DISCOVERY__PORT` for nested keys).
    pub fn figment() -> Figment {
        let env = std::env::var("ENV").unwrap_or_else(|_| "default".to_owned());
        let config_file_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| format!("./node/config/{}.yaml", env));
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(config_file_path))
            .merge(Env::prefixed("NODE_").split("__"))
    }
    /// Extracts the layered config. An `advertise_addr` without a port is
    /// rejected, peers could not reach the node through it.
    pub fn load() -> Result<Self, figment::Error> {
        let config: Self = Self::figment().extract()?;
        if config.advertised_port().is_none() {
            return Err(figment::Error::from(format!(
                "advertise_addr {:?} has no port",
                config.advertise_addr
            )));
        }
        Ok(config)
    }
    pub fn replication_interval(&self) -> Duration {
        Duration::from_secs(self.replication_interval_secs)
    }
    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_secs(self.lock_poll_interval_secs)
    }
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }
    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.discovery.announce_interval_secs)
    }
    /// Port announced to peers, taken from the advertised address.
    pub fn advertised_port(&self) -> Option<u16> {
        self.advertise_addr
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
    }
}
