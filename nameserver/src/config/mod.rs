use std::{net::Ipv4Addr, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use utilities::discovery::{DEFAULT_GROUP, DEFAULT_PORT};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    pub group: Ipv4Addr,
    pub port: u16,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    pub id: String,
    pub listen_addr: String,
    // JSON object name -> address, rewritten on every registration
    pub name_table_file: String,
    pub remote_timeout_ms: u64,
    pub log_level: String,
    pub log_base: String,
    pub apm_endpoint: Option<String>,
    pub discovery: DiscoveryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: "nameserver".to_string(),
            listen_addr: "0.0.0.0:7000".to_string(),
            name_table_file: "./temp/nameserver/name_table.json".to_string(),
            remote_timeout_ms: 5000,
            log_level: "info".to_string(),
            log_base: "./temp/logs".to_string(),
            apm_endpoint: None,
            discovery: DiscoveryConfig {
                group: DEFAULT_GROUP,
                port: DEFAULT_PORT,
            },
        }
    }
}

impl Config {
    pub fn figment() -> Figment {
        let env = std::env::var("ENV").unwrap_or_else(|_| "default".to_owned());
        let config_file_path = std::env::var("CONFIG_PATH")
            .unwrap_or_else(|_| format!("./nameserver/config/{}.yaml", env));
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(config_file_path))
            .merge(Env::prefixed("NAMESERVER_").split("__"))
    }
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment().extract()
    }
    /// Upper bound on reading one request and writing its reply.
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_apply_without_a_file() {
        Jail::expect_with(|jail| {
            jail.set_env("CONFIG_PATH", "missing.yaml");
            jail.set_env("NAMESERVER_LISTEN_ADDR", "127.0.0.1:7500");
            let config = Config::load()?;
            assert_eq!(config.listen_addr, "127.0.0.1:7500");
            assert_eq!(config.discovery.group, DEFAULT_GROUP);
            assert_eq!(config.remote_timeout(), Duration::from_secs(5));
            Ok(())
        });
    }

    #[test]
    fn yaml_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "ns.yaml",
                r#"
                id: ns-2
                name_table_file: table.json
                discovery:
                  group: 239.1.1.1
                  port: 7777
                "#,
            )?;
            jail.set_env("CONFIG_PATH", "ns.yaml");
            let config = Config::load()?;
            assert_eq!(config.id, "ns-2");
            assert_eq!(config.name_table_file, "table.json");
            assert_eq!(config.discovery.port, 7777);
            assert_eq!(config.discovery.group, Ipv4Addr::new(239, 1, 1, 1));
            Ok(())
        });
    }
}
