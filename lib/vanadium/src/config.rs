use serde_derive::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_CLUSTER_NAME: &str = "default";
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_POOL_IDLE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_POOL_SIZE: usize = 100;
pub const DEFAULT_RELOAD_MIN_INTERVAL_MS: u64 = 15_000;

/// Driver configuration: the seed endpoints, bucket binding and tuning
/// knobs. Loadable from TOML; missing fields fall back to the defaults.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct DriverConfig {
    /// Config seed endpoints, `host:port` of the cluster REST interface.
    pub host_ports: Vec<String>,
    pub bucket_name: String,
    pub username: String,
    pub password: String,
    /// Registry key; clusters sharing a name share topology entries.
    pub cluster_name: String,
    pub default_timeout_ms: u64,
    pub pool_max_idle_timeout_ms: u64,
    pub pool_size: usize,
    pub reload_min_interval_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> DriverConfig {
        DriverConfig {
            host_ports: Vec::new(),
            bucket_name: "default".to_string(),
            username: String::new(),
            password: String::new(),
            cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            pool_max_idle_timeout_ms: DEFAULT_POOL_IDLE_TIMEOUT_MS,
            pool_size: DEFAULT_POOL_SIZE,
            reload_min_interval_ms: DEFAULT_RELOAD_MIN_INTERVAL_MS,
        }
    }
}

impl DriverConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> DriverConfig {
        serdeconv::from_toml_file(path).expect("Error loading driver configuration file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DriverConfig::default();

        assert_eq!(config.cluster_name, "default");
        assert_eq!(config.default_timeout_ms, 5_000);
        assert_eq!(config.pool_max_idle_timeout_ms, 10_000);
        assert_eq!(config.pool_size, 100);
        assert_eq!(config.reload_min_interval_ms, 15_000);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: DriverConfig = serdeconv::from_toml_str(
            r#"
            host_ports = ["10.0.0.1:8091", "10.0.0.2:8091"]
            bucket_name = "beer-sample"
            username = "app"
            password = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.host_ports.len(), 2);
        assert_eq!(config.bucket_name, "beer-sample");
        assert_eq!(config.cluster_name, "default");
        assert_eq!(config.pool_size, 100);
    }
}
