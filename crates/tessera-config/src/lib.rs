//! Configuration management for Tessera
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (TESSERA_* prefix, highest precedence)
//! 2. tessera.local.toml (per-host overrides)
//! 3. tessera.toml (deployment config)
//! 4. ~/.config/tessera/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)
//!
//! Durations are stored as integer milliseconds so that every layer,
//! including environment variables, can express them.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::{Layer, Paths};

/// Conflict resolvers that may appear in `repair.resolver_chain`.
pub const KNOWN_RESOLVERS: &[&str] = &["majority", "content", "version", "owner"];

/// Placeholder in a server list that expands to every known node.
pub const ALL_SERVERS: &str = "*";

/// Main Tessera configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    pub node: NodeConfig,
    pub database: DatabaseConfig,
    pub replication: ReplicationConfig,
    pub locks: LockConfig,
    pub transactions: TransactionConfig,
    pub repair: RepairConfig,
    pub layout: LayoutConfig,
}

/// Identity of the local server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    pub id: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "node-0".to_string(),
            id: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub name: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
        }
    }
}

/// Dispatcher, collector and quorum settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Number of partitioned workers per database.
    pub worker_count: usize,
    /// Capacity of each worker queue.
    pub queue_capacity: usize,
    /// How long a sender blocks waiting for a quorum.
    pub synchronous_timeout_ms: u64,
    /// How long a collector stays registered before missing nodes count as failed.
    pub total_timeout_ms: u64,
    /// Tick of the background purge (collector timeouts, context expiry).
    pub purge_interval_ms: u64,
    /// Upper bound on draining worker queues during shutdown.
    pub shutdown_timeout_ms: u64,
    /// Refuse to send when fewer nodes are online than the quorum needs.
    pub check_nodes_online: bool,
    pub read_quorum: QuorumSetting,
    pub write_quorum: QuorumSetting,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            worker_count: 8,
            queue_capacity: 1024,
            synchronous_timeout_ms: 5_000,
            total_timeout_ms: 15_000,
            purge_interval_ms: 500,
            shutdown_timeout_ms: 5_000,
            check_nodes_online: true,
            read_quorum: QuorumSetting::Fixed(1),
            write_quorum: QuorumSetting::Named(NamedQuorum::Majority),
        }
    }
}

impl ReplicationConfig {
    pub fn synchronous_timeout(&self) -> Duration {
        Duration::from_millis(self.synchronous_timeout_ms)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// A configured quorum: `"majority"`, `"all"` or a fixed number of nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuorumSetting {
    Fixed(usize),
    Named(NamedQuorum),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NamedQuorum {
    Majority,
    All,
}

impl QuorumSetting {
    /// Resolves the setting against the number of nodes that take part in it.
    pub fn resolve(self, participants: usize) -> usize {
        match self {
            QuorumSetting::Fixed(n) => n,
            QuorumSetting::Named(NamedQuorum::Majority) => participants / 2 + 1,
            QuorumSetting::Named(NamedQuorum::All) => participants,
        }
    }
}

/// Lock-batch acquisition retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 20,
            max_retry_delay_ms: 200,
        }
    }
}

/// Transaction coordinator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Whole-transaction retries on contention.
    pub max_autoretry: u32,
    pub autoretry_delay_ms: u64,
    pub max_autoretry_delay_ms: u64,
    /// Size of the transaction sequencer ring.
    pub sequence_slots: u32,
    /// Participant contexts older than this are expired and their locks freed.
    pub context_timeout_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_autoretry: 10,
            autoretry_delay_ms: 10,
            max_autoretry_delay_ms: 500,
            sequence_slots: 1000,
            context_timeout_ms: 30_000,
        }
    }
}

impl TransactionConfig {
    pub fn context_timeout(&self) -> Duration {
        Duration::from_millis(self.context_timeout_ms)
    }
}

/// Background repairer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Period of the repair cycle; 0 disables the background thread.
    pub check_interval_ms: u64,
    /// Maximum records (and clusters) drained per cycle, also the create batch size.
    pub batch_size: usize,
    pub resolver_chain: Vec<String>,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 5_000,
            batch_size: 1000,
            resolver_chain: vec![
                "majority".to_string(),
                "content".to_string(),
                "version".to_string(),
            ],
        }
    }
}

impl RepairConfig {
    pub fn check_interval(&self) -> Option<Duration> {
        (self.check_interval_ms > 0).then(|| Duration::from_millis(self.check_interval_ms))
    }
}

/// Per-node role. Only primaries concur to write quorums.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    #[default]
    Primary,
    Replica,
}

/// Server lists for one cluster. The first server owns the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterLayout {
    pub servers: Vec<String>,
}

/// Replica placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// All nodes of the cluster, in owner-preference order.
    pub nodes: Vec<String>,
    /// Servers for clusters without an explicit entry.
    pub default_servers: Vec<String>,
    /// Explicit server lists keyed by cluster id.
    pub clusters: BTreeMap<String, ClusterLayout>,
    /// Roles keyed by node name; missing nodes are primaries.
    pub roles: BTreeMap<String, NodeRole>,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            nodes: vec!["node-0".to_string()],
            default_servers: vec![ALL_SERVERS.to_string()],
            clusters: BTreeMap::new(),
            roles: BTreeMap::new(),
        }
    }
}

impl LayoutConfig {
    /// Ordered server list for a cluster with `*` expanded.
    pub fn servers_for(&self, cluster: u32) -> Vec<String> {
        let configured = self
            .clusters
            .get(&cluster.to_string())
            .map_or(&self.default_servers, |layout| &layout.servers);

        let mut servers: Vec<String> = Vec::new();
        for server in configured {
            if server == ALL_SERVERS {
                for node in &self.nodes {
                    if !servers.contains(node) {
                        servers.push(node.clone());
                    }
                }
            } else if !servers.contains(server) {
                servers.push(server.clone());
            }
        }
        servers
    }

    pub fn role_of(&self, node: &str) -> NodeRole {
        self.roles.get(node).copied().unwrap_or_default()
    }
}

impl TesseraConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from a specific directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// A configuration with short timeouts and no background repair, for tests.
    pub fn testing() -> Self {
        Self {
            replication: ReplicationConfig {
                worker_count: 4,
                queue_capacity: 64,
                synchronous_timeout_ms: 500,
                total_timeout_ms: 1_000,
                purge_interval_ms: 50,
                shutdown_timeout_ms: 1_000,
                ..ReplicationConfig::default()
            },
            locks: LockConfig {
                max_attempts: 3,
                retry_delay_ms: 1,
                max_retry_delay_ms: 5,
            },
            transactions: TransactionConfig {
                max_autoretry: 5,
                autoretry_delay_ms: 1,
                max_autoretry_delay_ms: 10,
                sequence_slots: 16,
                context_timeout_ms: 5_000,
            },
            repair: RepairConfig {
                check_interval_ms: 0,
                batch_size: 100,
                ..RepairConfig::default()
            },
            ..Self::default()
        }
    }

    /// Reads a single TOML file without layering.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Rejects settings the replication layer cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let replication = &self.replication;
        if replication.worker_count == 0 {
            return Err(ConfigError::ValidationError(
                "replication.worker_count must be positive".to_string(),
            ));
        }
        if replication.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "replication.queue_capacity must be positive".to_string(),
            ));
        }
        if replication.synchronous_timeout_ms > replication.total_timeout_ms {
            return Err(ConfigError::ValidationError(format!(
                "replication.synchronous_timeout_ms ({}) exceeds total_timeout_ms ({})",
                replication.synchronous_timeout_ms, replication.total_timeout_ms
            )));
        }
        if self.transactions.sequence_slots == 0 {
            return Err(ConfigError::ValidationError(
                "transactions.sequence_slots must be positive".to_string(),
            ));
        }
        if self.locks.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "locks.max_attempts must be positive".to_string(),
            ));
        }
        if self.repair.resolver_chain.is_empty() {
            return Err(ConfigError::ValidationError(
                "repair.resolver_chain must name at least one resolver".to_string(),
            ));
        }
        if let Some(unknown) = self
            .repair
            .resolver_chain
            .iter()
            .find(|name| !KNOWN_RESOLVERS.contains(&name.as_str()))
        {
            return Err(ConfigError::UnknownResolver(unknown.clone()));
        }
        if self.layout.nodes.is_empty() {
            return Err(ConfigError::ValidationError(
                "layout.nodes must list at least one node".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_default_config() {
        let config = TesseraConfig::default();
        assert_eq!(config.replication.worker_count, 8);
        assert_eq!(config.replication.synchronous_timeout(), Duration::from_secs(5));
        assert_eq!(
            config.replication.write_quorum,
            QuorumSetting::Named(NamedQuorum::Majority)
        );
        assert_eq!(config.repair.resolver_chain, ["majority", "content", "version"]);
        config.validate().expect("defaults must validate");
    }

    #[test]
    fn test_testing_config_validates() {
        let config = TesseraConfig::testing();
        config.validate().expect("testing config must validate");
        assert!(config.repair.check_interval().is_none());
    }

    #[test_case(QuorumSetting::Named(NamedQuorum::Majority), 5, 3)]
    #[test_case(QuorumSetting::Named(NamedQuorum::Majority), 4, 3)]
    #[test_case(QuorumSetting::Named(NamedQuorum::All), 5, 5)]
    #[test_case(QuorumSetting::Fixed(2), 5, 2)]
    fn test_quorum_resolution(setting: QuorumSetting, participants: usize, expected: usize) {
        assert_eq!(setting.resolve(participants), expected);
    }

    #[test]
    fn test_quorum_setting_parses_names_and_numbers() {
        #[derive(Deserialize)]
        struct Holder {
            a: QuorumSetting,
            b: QuorumSetting,
        }
        let holder: Holder = toml::from_str("a = \"all\"\nb = 2\n").unwrap();
        assert_eq!(holder.a, QuorumSetting::Named(NamedQuorum::All));
        assert_eq!(holder.b, QuorumSetting::Fixed(2));
    }

    #[test]
    fn test_servers_expand_wildcard_without_duplicates() {
        let mut layout = LayoutConfig {
            nodes: vec!["a".into(), "b".into(), "c".into()],
            ..LayoutConfig::default()
        };
        layout.clusters.insert(
            "7".to_string(),
            ClusterLayout {
                servers: vec!["c".into(), ALL_SERVERS.into()],
            },
        );

        assert_eq!(layout.servers_for(1), ["a", "b", "c"]);
        assert_eq!(layout.servers_for(7), ["c", "a", "b"]);
    }

    #[test]
    fn test_roles_default_to_primary() {
        let mut layout = LayoutConfig::default();
        layout.roles.insert("r1".into(), NodeRole::Replica);
        assert_eq!(layout.role_of("r1"), NodeRole::Replica);
        assert_eq!(layout.role_of("other"), NodeRole::Primary);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = TesseraConfig::default();
        config.replication.worker_count = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = TesseraConfig::default();
        config.replication.synchronous_timeout_ms = 20_000;
        assert!(config.validate().is_err());

        let mut config = TesseraConfig::default();
        config.repair.resolver_chain = vec!["majority".into(), "coin-flip".into()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownResolver(name)) if name == "coin-flip"
        ));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = TesseraConfig::testing();
        let text = config.to_toml_string().unwrap();
        let parsed: TesseraConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
