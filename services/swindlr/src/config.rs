//! Layered configuration.
//!
//! Sources, lowest precedence first: `/etc/swindlr/config.yaml`,
//! `$HOME/.swindlr/config.yaml`, `./config.yaml`, an optional extra directory
//! from `SWINDLR_CONFIG_PATH`, then `SWINDLR_*` environment overrides. The
//! result is snapshotted into a typed record at startup; nothing reads
//! configuration globally at runtime.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::proxy::Strategy;

/// Environment variable naming an extra config directory, the equivalent of
/// a `--configPath` flag.
pub const CONFIG_PATH_ENV: &str = "SWINDLR_CONFIG_PATH";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Main listener port.
    pub port: u16,

    /// Initial backend URLs.
    pub backends: Vec<String>,

    pub use_ssl: bool,
    pub ssl_cert_file: String,
    pub ssl_key_file: String,

    /// Enables the admin API.
    pub use_dynamic: bool,

    /// Admin API port.
    #[serde(rename = "apiPort", alias = "apiport")]
    pub api_port: u16,

    pub load_balancer: LoadBalancerConfig,

    /// Enables cookie affinity.
    pub use_sticky_sessions: bool,

    /// Per-backend admission bucket.
    pub rate_limiting: RateLimitingConfig,

    /// Enables the response cache middleware.
    pub use_cache: bool,

    /// Reserved; parsed but without behavior.
    pub use_geo_routing: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub strategy: Strategy,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RateLimitingConfig {
    /// Refill rate in tokens per second.
    pub rate: f64,
    /// Bucket capacity (burst).
    pub bucket_size: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            backends: Vec::new(),
            use_ssl: false,
            ssl_cert_file: String::new(),
            ssl_key_file: String::new(),
            use_dynamic: false,
            api_port: 8082,
            load_balancer: LoadBalancerConfig::default(),
            use_sticky_sessions: false,
            rate_limiting: RateLimitingConfig::default(),
            use_cache: false,
            use_geo_routing: false,
        }
    }
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::RoundRobin,
        }
    }
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            rate: 100.0,
            bucket_size: 100.0,
        }
    }
}

impl Config {
    /// Loads from the layered sources, honoring `SWINDLR_CONFIG_PATH`.
    pub fn load() -> Result<Self> {
        let custom = std::env::var(CONFIG_PATH_ENV).ok();
        Self::load_from(custom.as_deref())
    }

    pub fn load_from(custom_dir: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("/etc/swindlr/config").required(false));

        if let Ok(home) = std::env::var("HOME") {
            builder = builder
                .add_source(config::File::with_name(&format!("{home}/.swindlr/config")).required(false));
        }

        builder = builder.add_source(config::File::with_name("config").required(false));

        if let Some(dir) = custom_dir {
            let dir = dir.trim_end_matches('/');
            builder =
                builder.add_source(config::File::with_name(&format!("{dir}/config")).required(false));
        }

        builder = builder.add_source(config::Environment::with_prefix("SWINDLR").separator("__"));

        let settings = builder.build().context("Error reading config")?;
        let cfg: Config = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Startup validation: TLS material must be configured and on disk when
    /// SSL is enabled.
    pub fn validate(&self) -> Result<()> {
        if self.use_ssl {
            if self.ssl_cert_file.is_empty() || self.ssl_key_file.is_empty() {
                bail!("SSL is enabled but ssl_cert_file or ssl_key_file is not specified");
            }
            if !Path::new(&self.ssl_cert_file).exists() {
                bail!("SSL certificate file {} not found", self.ssl_cert_file);
            }
            if !Path::new(&self.ssl_key_file).exists() {
                bail!("SSL key file {} not found", self.ssl_key_file);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Config> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?;
        let cfg: Config = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[test]
    fn defaults_apply_when_keys_are_absent() {
        let cfg = parse("port: 9000").unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.api_port, 8082);
        assert!(cfg.backends.is_empty());
        assert!(!cfg.use_ssl);
        assert!(!cfg.use_cache);
        assert_eq!(cfg.load_balancer.strategy, Strategy::RoundRobin);
    }

    #[test]
    fn full_config_parses() {
        let cfg = parse(
            r#"
port: 8080
backends:
  - "http://10.0.0.1:8081"
  - "http://10.0.0.2:8081"
use_dynamic: true
apiPort: 9082
load_balancer:
  strategy: least_connections
use_sticky_sessions: true
rate_limiting:
  rate: 5.5
  bucket_size: 10
use_cache: true
use_geo_routing: true
"#,
        )
        .unwrap();

        assert_eq!(cfg.backends.len(), 2);
        assert_eq!(cfg.api_port, 9082);
        assert_eq!(cfg.load_balancer.strategy, Strategy::LeastConnections);
        assert!(cfg.use_sticky_sessions);
        assert_eq!(cfg.rate_limiting.rate, 5.5);
        assert_eq!(cfg.rate_limiting.bucket_size, 10.0);
        assert!(cfg.use_cache);
    }

    #[test]
    fn every_strategy_name_is_recognized() {
        for (name, strategy) in [
            ("round_robin", Strategy::RoundRobin),
            ("least_connections", Strategy::LeastConnections),
            ("random", Strategy::Random),
            ("latency_aware", Strategy::LatencyAware),
        ] {
            let cfg = parse(&format!("load_balancer:\n  strategy: {name}")).unwrap();
            assert_eq!(cfg.load_balancer.strategy, strategy);
        }
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        assert!(parse("load_balancer:\n  strategy: weighted_coin_flip").is_err());
    }

    #[test]
    fn ssl_without_material_is_rejected() {
        assert!(parse("use_ssl: true").is_err());
        assert!(parse(
            "use_ssl: true\nssl_cert_file: /no/such/cert.pem\nssl_key_file: /no/such/key.pem"
        )
        .is_err());
    }
}
