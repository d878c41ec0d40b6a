// src/config.rs

//! Loads and validates this node's configuration from a TOML file.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

fn default_log_level() -> String {
    "info".into()
}

fn default_bus_port() -> u16 {
    7001
}

fn default_driver() -> String {
    "tcp".into()
}

fn default_epoch_log_dir() -> String {
    "./epoch".into()
}

fn default_join_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_node_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_replication_factor_hint() -> u32 {
    3
}

/// This node's storage identity, echoed into the `NodeEntry` the core
/// advertises once ratified into the roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
}

/// Cluster bus and coordination settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_bus_port")]
    pub bus_port: u16,
    /// `"tcp"` for the real sequencer-based adapter, `"simulated"` for the
    /// in-process test driver.
    #[serde(default = "default_driver")]
    pub driver: String,
    /// Only consulted when `driver = "tcp"`: the seed address of the
    /// elected sequencer. If it equals this node's own bus address, this
    /// node acts as the sequencer.
    pub sequencer_addr: Option<String>,
    #[serde(default = "default_epoch_log_dir")]
    pub epoch_log_dir: String,
    #[serde(with = "humantime_serde", default = "default_join_timeout")]
    pub join_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_node_timeout")]
    pub node_timeout: Duration,
    #[serde(default = "default_replication_factor_hint")]
    pub replication_factor_hint: u32,
}

/// The shape read straight off the TOML file, before defaults are applied
/// via `serde(default)` and the result is validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawConfig {
    node: NodeConfig,
    #[serde(default = "default_cluster_config")]
    cluster: ClusterConfig,
    #[serde(default = "default_log_level")]
    log_level: String,
}

fn default_cluster_config() -> ClusterConfig {
    ClusterConfig {
        bus_port: default_bus_port(),
        driver: default_driver(),
        sequencer_addr: None,
        epoch_log_dir: default_epoch_log_dir(),
        join_timeout: default_join_timeout(),
        node_timeout: default_node_timeout(),
        replication_factor_hint: default_replication_factor_hint(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub cluster: ClusterConfig,
    pub log_level: String,
}

impl Config {
    /// Reads and validates a node's configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse TOML from '{path}'"))?;

        let config = Config {
            node: raw.node,
            cluster: raw.cluster,
            log_level: raw.log_level,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.node.host.trim().is_empty() {
            return Err(anyhow!("node.host cannot be empty"));
        }
        if self.node.port == 0 {
            return Err(anyhow!("node.port cannot be 0"));
        }
        if self.cluster.bus_port == 0 {
            return Err(anyhow!("cluster.bus_port cannot be 0"));
        }
        match self.cluster.driver.as_str() {
            "tcp" => {
                if self.cluster.sequencer_addr.is_none() {
                    return Err(anyhow!(
                        "cluster.sequencer_addr is required when cluster.driver = \"tcp\""
                    ));
                }
            }
            "simulated" => {}
            other => return Err(anyhow!("unknown cluster.driver '{}'", other)),
        }
        if self.cluster.replication_factor_hint == 0 {
            return Err(anyhow!("cluster.replication_factor_hint cannot be 0"));
        }
        Ok(())
    }
}
