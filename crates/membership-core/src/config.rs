//! Agent host configuration.
//!
//! All options have defaults and can be loaded from YAML. Durations are
//! given in milliseconds (`*_ms`) or seconds (`*_in_sec`).

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Bind address must not be empty")]
    EmptyBindAddress,

    #[error("Bind address must not be a wildcard address: {0}")]
    WildcardBindAddress(String),

    #[error("Invalid bind address: {0}")]
    InvalidBindAddress(String),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Options for one agent host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHostOptions {
    /// Cluster environment; hosts only talk to hosts in the same env
    #[serde(default = "default_env")]
    pub env: String,

    /// Address to bind (must be a concrete IP, not a wildcard)
    #[serde(default = "default_addr")]
    pub addr: String,

    /// Port to bind (0 = pick an ephemeral port)
    #[serde(default)]
    pub port: u16,

    /// Max peers contacted per gossip spread round
    #[serde(default = "default_gossip_fanout")]
    pub gossip_fanout: usize,

    /// Max gossip items piggybacked per envelope
    #[serde(default = "default_gossip_fanout_per_period")]
    pub gossip_fanout_per_period: usize,

    /// Gossip spread tick interval
    #[serde(default = "default_gossip_period_ms")]
    pub gossip_period_ms: u64,

    #[serde(default = "default_retransmit_multiplier")]
    pub retransmit_multiplier: u32,

    /// Upper clamp on the awareness scaling of probe timeouts
    #[serde(default = "default_awareness_max_multiplier")]
    pub awareness_max_multiplier: u32,

    #[serde(default = "default_base_probe_interval_ms")]
    pub base_probe_interval_ms: u64,

    #[serde(default = "default_base_probe_timeout_ms")]
    pub base_probe_timeout_ms: u64,

    /// Helpers asked to probe a target that missed its direct ack
    #[serde(default = "default_indirect_probes")]
    pub indirect_probes: usize,

    #[serde(default = "default_suspicion_multiplier")]
    pub suspicion_multiplier: u32,

    #[serde(default = "default_suspicion_max_timeout_multiplier")]
    pub suspicion_max_timeout_multiplier: u32,

    #[serde(default = "default_auto_healing_interval_ms")]
    pub auto_healing_interval_ms: u64,

    #[serde(default = "default_auto_healing_timeout_ms")]
    pub auto_healing_timeout_ms: u64,

    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    #[serde(default = "default_join_retry_in_sec")]
    pub join_retry_in_sec: u64,
}

fn default_env() -> String {
    "dev".to_string()
}

fn default_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_gossip_fanout() -> usize {
    4
}

fn default_gossip_fanout_per_period() -> usize {
    4
}

fn default_gossip_period_ms() -> u64 {
    200
}

fn default_retransmit_multiplier() -> u32 {
    4
}

fn default_awareness_max_multiplier() -> u32 {
    8
}

fn default_base_probe_interval_ms() -> u64 {
    1000
}

fn default_base_probe_timeout_ms() -> u64 {
    500
}

fn default_indirect_probes() -> usize {
    3
}

fn default_suspicion_multiplier() -> u32 {
    4
}

fn default_suspicion_max_timeout_multiplier() -> u32 {
    6
}

fn default_auto_healing_interval_ms() -> u64 {
    5000
}

fn default_auto_healing_timeout_ms() -> u64 {
    3000
}

fn default_join_timeout_ms() -> u64 {
    5000
}

fn default_join_retry_in_sec() -> u64 {
    5
}

impl Default for AgentHostOptions {
    fn default() -> Self {
        Self {
            env: default_env(),
            addr: default_addr(),
            port: 0,
            gossip_fanout: default_gossip_fanout(),
            gossip_fanout_per_period: default_gossip_fanout_per_period(),
            gossip_period_ms: default_gossip_period_ms(),
            retransmit_multiplier: default_retransmit_multiplier(),
            awareness_max_multiplier: default_awareness_max_multiplier(),
            base_probe_interval_ms: default_base_probe_interval_ms(),
            base_probe_timeout_ms: default_base_probe_timeout_ms(),
            indirect_probes: default_indirect_probes(),
            suspicion_multiplier: default_suspicion_multiplier(),
            suspicion_max_timeout_multiplier: default_suspicion_max_timeout_multiplier(),
            auto_healing_interval_ms: default_auto_healing_interval_ms(),
            auto_healing_timeout_ms: default_auto_healing_timeout_ms(),
            join_timeout_ms: default_join_timeout_ms(),
            join_retry_in_sec: default_join_retry_in_sec(),
        }
    }
}

impl AgentHostOptions {
    /// Parse options from a YAML document. Missing fields take defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load options from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Check the options before anything is bound or started.
    pub fn validate(&self) -> Result<()> {
        self.bind_ip()?;

        if self.env.is_empty() {
            return Err(invalid("env", "must not be empty"));
        }
        if self.gossip_fanout == 0 {
            return Err(invalid("gossip_fanout", "must be at least 1"));
        }
        if self.gossip_fanout_per_period == 0 {
            return Err(invalid("gossip_fanout_per_period", "must be at least 1"));
        }
        if self.gossip_period_ms == 0 {
            return Err(invalid("gossip_period_ms", "must be positive"));
        }
        if self.retransmit_multiplier == 0 {
            return Err(invalid("retransmit_multiplier", "must be at least 1"));
        }
        if self.awareness_max_multiplier == 0 {
            return Err(invalid("awareness_max_multiplier", "must be at least 1"));
        }
        if self.base_probe_timeout_ms == 0 {
            return Err(invalid("base_probe_timeout_ms", "must be positive"));
        }
        if self.base_probe_timeout_ms >= self.base_probe_interval_ms {
            return Err(invalid(
                "base_probe_timeout_ms",
                format!(
                    "must be below base_probe_interval_ms ({})",
                    self.base_probe_interval_ms
                ),
            ));
        }
        if self.suspicion_multiplier == 0 {
            return Err(invalid("suspicion_multiplier", "must be at least 1"));
        }
        if self.suspicion_max_timeout_multiplier == 0 {
            return Err(invalid("suspicion_max_timeout_multiplier", "must be at least 1"));
        }
        if self.auto_healing_interval_ms == 0 {
            return Err(invalid("auto_healing_interval_ms", "must be positive"));
        }
        if self.auto_healing_timeout_ms == 0 {
            return Err(invalid("auto_healing_timeout_ms", "must be positive"));
        }
        if self.join_timeout_ms == 0 {
            return Err(invalid("join_timeout_ms", "must be positive"));
        }

        Ok(())
    }

    /// The concrete IP to bind, rejecting empty and wildcard addresses.
    pub fn bind_ip(&self) -> Result<IpAddr> {
        let addr = self.addr.trim();
        if addr.is_empty() {
            return Err(ConfigError::EmptyBindAddress);
        }
        let ip: IpAddr = addr
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(addr.to_string()))?;
        if ip.is_unspecified() {
            return Err(ConfigError::WildcardBindAddress(addr.to_string()));
        }
        Ok(ip)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.bind_ip()?, self.port))
    }

    pub fn gossip_period(&self) -> Duration {
        Duration::from_millis(self.gossip_period_ms)
    }

    pub fn join_retry(&self) -> Duration {
        Duration::from_secs(self.join_retry_in_sec)
    }

    /// Interval of the single scheduler tick that drives every control loop.
    pub fn tick_interval(&self) -> Duration {
        let fine = (self.base_probe_timeout_ms / 5).max(5);
        Duration::from_millis(self.gossip_period_ms.min(fine).max(5))
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let options = AgentHostOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.gossip_fanout, 4);
        assert_eq!(options.base_probe_interval_ms, 1000);
        assert_eq!(options.join_retry(), Duration::from_secs(5));
    }

    #[test]
    fn test_rejects_empty_addr() {
        let options = AgentHostOptions {
            addr: "".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(ConfigError::EmptyBindAddress)
        ));
    }

    #[test]
    fn test_rejects_wildcard_addr() {
        for addr in ["0.0.0.0", "::"] {
            let options = AgentHostOptions {
                addr: addr.to_string(),
                ..Default::default()
            };
            assert!(matches!(
                options.validate(),
                Err(ConfigError::WildcardBindAddress(_))
            ));
        }
    }

    #[test]
    fn test_rejects_hostname() {
        let options = AgentHostOptions {
            addr: "localhost".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(ConfigError::InvalidBindAddress(_))
        ));
    }

    #[test]
    fn test_rejects_probe_timeout_above_interval() {
        let options = AgentHostOptions {
            base_probe_timeout_ms: 1000,
            base_probe_interval_ms: 1000,
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(ConfigError::Invalid {
                field: "base_probe_timeout_ms",
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_zero_fanout() {
        let options = AgentHostOptions {
            gossip_fanout: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_yaml_partial_uses_defaults() {
        let options = AgentHostOptions::from_yaml_str(
            "env: prod\naddr: 10.1.2.3\nport: 7400\ngossip_period_ms: 50\n",
        )
        .unwrap();

        assert_eq!(options.env, "prod");
        assert_eq!(
            options.bind_addr().unwrap(),
            "10.1.2.3:7400".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(options.gossip_period(), Duration::from_millis(50));
        assert_eq!(options.indirect_probes, 3);
    }

    #[test]
    fn test_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "addr: 127.0.0.1\nindirect_probes: 5").unwrap();

        let options = AgentHostOptions::from_yaml_file(file.path()).unwrap();
        assert_eq!(options.indirect_probes, 5);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_yaml_missing_file() {
        let result = AgentHostOptions::from_yaml_file("/definitely/not/here.yaml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_tick_interval() {
        let options = AgentHostOptions::default();
        assert_eq!(options.tick_interval(), Duration::from_millis(100));

        let fast = AgentHostOptions {
            gossip_period_ms: 20,
            ..Default::default()
        };
        assert_eq!(fast.tick_interval(), Duration::from_millis(20));

        let tiny = AgentHostOptions {
            gossip_period_ms: 1,
            ..Default::default()
        };
        assert_eq!(tiny.tick_interval(), Duration::from_millis(5));
    }
}
