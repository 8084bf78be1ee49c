//! Configuration Module - Ensemble Description
//!
//! Parses the cluster configuration file shared by every node of the
//! ensemble. The format is plain `key=value` text with `#` comments:
//!
//! ```text
//! # two node ensemble
//! local_node_id=0
//! num_nodes=2
//! node0=10.0.0.1:9000:0:1073741824
//! node1=10.0.0.2:9000:0:1073741824
//! ```
//!
//! Each `nodeK` value is `hostname:port:region_base_hex:region_size_decimal`.
//! The node table is immutable after startup; only the per-peer active flags
//! (owned by the connection manager) change afterwards.

use crate::error::{PgasError, Result};
use crate::MAX_NODES;
use std::path::Path;
use std::time::Duration;

/// Default number of connect attempts per peer during bring-up
pub const DEFAULT_CONNECT_RETRIES: u32 = 30;

/// Default per-connect socket timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Static description of one ensemble member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub node_id: u16,
    pub hostname: String,
    pub port: u16,
    /// Advertised base of the node's region (routing metadata only)
    pub region_base: u64,
    /// Size of the node's shared region in bytes
    pub region_size: u64,
}

impl NodeConfig {
    /// `host:port` form used for outbound connects
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// Parsed ensemble configuration
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub local_node_id: u16,
    pub num_nodes: u16,
    pub nodes: Vec<NodeConfig>,

    /// Connect attempts per peer before giving up (override: PGAS_CONNECT_RETRIES)
    pub connect_retries: u32,
    /// Per-connect send/recv timeout during bring-up
    pub connect_timeout: Duration,
}

impl ClusterConfig {
    /// Load and parse a configuration file
    ///
    /// Environment overrides are applied after parsing:
    /// - `PGAS_REGION_SIZE` replaces the local node's region size
    /// - `PGAS_CONNECT_RETRIES` replaces the bring-up retry count
    ///
    /// Parsing does not validate cross-field consistency; call
    /// [`ClusterConfig::validate`] before use.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PgasError::Config(format!(
                "cannot read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let mut config = Self::parse(&text)?;
        config.apply_env();
        Ok(config)
    }

    /// Parse configuration from text
    pub fn parse(text: &str) -> Result<Self> {
        let mut local_node_id: Option<u16> = None;
        let mut num_nodes: Option<u16> = None;
        let mut nodes: Vec<NodeConfig> = Vec::new();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                PgasError::Config(format!("line {}: expected key=value", lineno + 1))
            })?;
            let key = key.trim();
            let value = value.trim();

            match key {
                "local_node_id" => {
                    local_node_id = Some(parse_u16(value, lineno, "local_node_id")?);
                }
                "num_nodes" => {
                    num_nodes = Some(parse_u16(value, lineno, "num_nodes")?);
                }
                _ if key.starts_with("node") => {
                    let idx = key[4..].parse::<u16>().map_err(|_| {
                        PgasError::Config(format!("line {}: bad node index in '{}'", lineno + 1, key))
                    })?;
                    nodes.push(parse_node(idx, value, lineno)?);
                }
                _ => {
                    // Unknown keys are ignored so configs can carry collaborator settings
                    log::debug!("config: ignoring unknown key '{}'", key);
                }
            }
        }

        let local_node_id = local_node_id
            .ok_or_else(|| PgasError::Config("missing local_node_id".to_string()))?;
        let num_nodes =
            num_nodes.ok_or_else(|| PgasError::Config("missing num_nodes".to_string()))?;

        nodes.sort_by_key(|n| n.node_id);

        Ok(Self {
            local_node_id,
            num_nodes,
            nodes,
            connect_retries: DEFAULT_CONNECT_RETRIES,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    /// Apply environment overrides
    pub fn apply_env(&mut self) {
        if let Ok(val) = std::env::var("PGAS_REGION_SIZE") {
            if let Ok(size) = val.parse::<u64>() {
                let local = self.local_node_id;
                if let Some(node) = self.nodes.iter_mut().find(|n| n.node_id == local) {
                    node.region_size = size;
                }
            }
        }

        if let Ok(val) = std::env::var("PGAS_CONNECT_RETRIES") {
            if let Ok(retries) = val.parse::<u32>() {
                self.connect_retries = retries.max(1);
            }
        }
    }

    /// Validate cross-field consistency
    pub fn validate(&self) -> Result<()> {
        if self.num_nodes == 0 {
            return Err(PgasError::Config("num_nodes must be > 0".to_string()));
        }
        if self.num_nodes as usize > MAX_NODES {
            return Err(PgasError::Config(format!(
                "num_nodes {} exceeds maximum of {}",
                self.num_nodes, MAX_NODES
            )));
        }
        if self.local_node_id >= self.num_nodes {
            return Err(PgasError::Config(format!(
                "local_node_id {} out of range for {} nodes",
                self.local_node_id, self.num_nodes
            )));
        }
        if self.nodes.len() != self.num_nodes as usize {
            return Err(PgasError::Config(format!(
                "expected {} node entries, found {}",
                self.num_nodes,
                self.nodes.len()
            )));
        }
        for (expected, node) in self.nodes.iter().enumerate() {
            if node.node_id as usize != expected {
                return Err(PgasError::Config(format!(
                    "node table has a gap at index {}",
                    expected
                )));
            }
            if node.port == 0 {
                return Err(PgasError::Config(format!(
                    "node{} has port 0",
                    node.node_id
                )));
            }
            if node.region_size == 0 {
                return Err(PgasError::Config(format!(
                    "node{} has an empty region",
                    node.node_id
                )));
            }
        }
        Ok(())
    }

    /// The local node's entry
    pub fn local_node(&self) -> &NodeConfig {
        &self.nodes[self.local_node_id as usize]
    }
}

fn parse_u16(value: &str, lineno: usize, key: &str) -> Result<u16> {
    value.parse::<u16>().map_err(|_| {
        PgasError::Config(format!("line {}: {} must be a u16, got '{}'", lineno + 1, key, value))
    })
}

/// Parse `hostname:port:region_base_hex:region_size_decimal`
fn parse_node(node_id: u16, value: &str, lineno: usize) -> Result<NodeConfig> {
    let mut fields = value.rsplitn(4, ':');
    let size_s = fields.next();
    let base_s = fields.next();
    let port_s = fields.next();
    let host_s = fields.next();

    let (Some(size_s), Some(base_s), Some(port_s), Some(host_s)) =
        (size_s, base_s, port_s, host_s)
    else {
        return Err(PgasError::Config(format!(
            "line {}: node{} must be hostname:port:base:size",
            lineno + 1,
            node_id
        )));
    };

    let port = port_s.parse::<u16>().map_err(|_| {
        PgasError::Config(format!("line {}: bad port '{}'", lineno + 1, port_s))
    })?;
    let region_base = u64::from_str_radix(base_s.trim_start_matches("0x"), 16).map_err(|_| {
        PgasError::Config(format!("line {}: bad hex base '{}'", lineno + 1, base_s))
    })?;
    let region_size = size_s.parse::<u64>().map_err(|_| {
        PgasError::Config(format!("line {}: bad region size '{}'", lineno + 1, size_s))
    })?;

    Ok(NodeConfig {
        node_id,
        hostname: host_s.to_string(),
        port,
        region_base,
        region_size,
    })
}
