//! Backend configuration parsing and validation.
//!
//! The backend is fed a flat string map (the storage stanza of the server
//! configuration). Every recognized key is validated here; environment
//! variables override their corresponding keys. Construction fails loudly on
//! bad values so a misconfigured node never starts.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use snafu::Snafu;
use tracing::warn;

use crate::verifier::DEFAULT_VERIFICATION_INTERVAL;
use crate::verifier::MINIMUM_VERIFICATION_INTERVAL;

pub const ENV_RAFT_PATH: &str = "BASTION_RAFT_PATH";
pub const ENV_RAFT_NODE_ID: &str = "BASTION_RAFT_NODE_ID";
pub const ENV_RAFT_NON_VOTER: &str = "BASTION_RAFT_NON_VOTER";
pub const ENV_RAFT_INITIAL_CACHE_SIZE: &str = "BASTION_RAFT_INITIAL_CACHE_SIZE";
pub const ENV_RAFT_AUTOPILOT_DISABLE: &str = "BASTION_RAFT_AUTOPILOT_DISABLE";
pub const ENV_RAFT_MAX_BATCH_ENTRIES: &str = "BASTION_RAFT_MAX_BATCH_ENTRIES";
pub const ENV_RAFT_MAX_BATCH_SIZE_BYTES: &str = "BASTION_RAFT_MAX_BATCH_SIZE_BYTES";

/// Default cap on one entry (key plus value) in bytes.
pub const DEFAULT_MAX_ENTRY_SIZE: u64 = 1024 * 1024;

/// Bounds on the mount/namespace-table entry size override.
pub const MIN_MOUNT_TABLE_ENTRY_SIZE: u64 = 1024;
pub const MAX_MOUNT_TABLE_ENTRY_SIZE: u64 = 10 * 1024 * 1024;

/// Default transaction limits, derived from replication batch testing.
pub const DEFAULT_MAX_BATCH_ENTRIES: usize = 4096;
pub const DEFAULT_MAX_BATCH_SIZE: u64 = 128 * 1024;

/// Default log entries retained after a snapshot.
pub const DEFAULT_TRAILING_LOGS: u64 = 10240;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("'path' cannot be empty"))]
    MissingPath,

    #[snafu(display("value of {key:?} does not parse as a duration: {source}"))]
    InvalidDuration {
        key: String,
        source: humantime::DurationError,
    },

    #[snafu(display("value of {key:?} does not parse as a boolean: {value:?}"))]
    InvalidBool { key: String, value: String },

    #[snafu(display("value of {key:?} does not parse as an integer: {value:?}"))]
    InvalidInteger { key: String, value: String },

    #[snafu(display("value of {key:?} does not parse as an address: {value:?}"))]
    InvalidAddress { key: String, value: String },

    #[snafu(display(
        "max_mount_and_namespace_table_entry_size must be at least {MIN_MOUNT_TABLE_ENTRY_SIZE} bytes"
    ))]
    MountTableEntrySizeTooSmall,

    #[snafu(display(
        "max_mount_and_namespace_table_entry_size must be at most {MAX_MOUNT_TABLE_ENTRY_SIZE} bytes"
    ))]
    MountTableEntrySizeTooLarge,

    #[snafu(display("'retry_join_as_non_voter' requires a non-empty 'retry_join'"))]
    NonVoterWithoutRetryJoin,

    #[snafu(display(
        "'autopilot_reconcile_interval' ({reconcile:?}) must not be less than \
         'autopilot_update_interval' ({update:?})"
    ))]
    ReconcileBelowUpdate { reconcile: Duration, update: Duration },

    #[snafu(display("'performance_multiplier' must be between 1 and 10, got {value}"))]
    InvalidPerformanceMultiplier { value: u64 },

    #[snafu(display("value of {key:?} does not parse as a semantic version: {value:?}"))]
    InvalidVersion { key: String, value: String },
}

/// Parsed backend configuration.
#[derive(Debug, Clone)]
pub struct RaftBackendConfig {
    pub path: String,
    pub node_id: Option<String>,
    /// Cluster addresses of existing members to join through.
    pub retry_join: Vec<SocketAddr>,
    pub retry_join_as_non_voter: bool,
    pub raft_wal: bool,
    pub raft_log_verifier_enabled: bool,
    pub raft_log_verification_interval: Duration,
    pub snapshot_delay: Option<Duration>,
    pub apply_delay: Option<Duration>,
    pub max_entry_size: u64,
    pub max_mount_and_namespace_table_entry_size: Option<u64>,
    pub max_batch_entries: usize,
    pub max_batch_size: u64,
    pub trailing_logs: u64,
    pub performance_multiplier: u64,
    pub autopilot_reconcile_interval: Duration,
    pub autopilot_update_interval: Duration,
    pub autopilot_disable: bool,
    pub autopilot_upgrade_version: Option<semver::Version>,
    pub autopilot_redundancy_zone: Option<String>,
    pub initial_cache_size: Option<usize>,
}

impl RaftBackendConfig {
    /// Parse and validate a configuration map, applying environment
    /// overrides.
    pub fn parse(conf: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let path = std::env::var(ENV_RAFT_PATH)
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| conf.get("path").cloned())
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingPath)?;

        let node_id = std::env::var(ENV_RAFT_NODE_ID)
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| conf.get("node_id").cloned())
            .filter(|v| !v.is_empty());

        let retry_join = parse_retry_join(conf)?;

        let retry_join_as_non_voter = match std::env::var(ENV_RAFT_NON_VOTER) {
            Ok(v) if !v.is_empty() => true,
            _ => parse_bool(conf, "retry_join_as_non_voter")?.unwrap_or(false),
        };
        if retry_join_as_non_voter && retry_join.is_empty() {
            return Err(ConfigError::NonVoterWithoutRetryJoin);
        }

        let raft_log_verifier_enabled =
            parse_bool(conf, "raft_log_verifier_enabled")?.unwrap_or(false);
        let raft_log_verification_interval =
            match parse_duration(conf, "raft_log_verification_interval")? {
                Some(interval) if interval >= MINIMUM_VERIFICATION_INTERVAL => interval,
                Some(interval) => {
                    warn!(
                        configured = ?interval,
                        minimum = ?MINIMUM_VERIFICATION_INTERVAL,
                        default = ?DEFAULT_VERIFICATION_INTERVAL,
                        "raft_log_verification_interval is below the minimum; using the default"
                    );
                    DEFAULT_VERIFICATION_INTERVAL
                }
                None => DEFAULT_VERIFICATION_INTERVAL,
            };

        let max_mount_and_namespace_table_entry_size =
            match parse_u64(conf, "max_mount_and_namespace_table_entry_size")? {
                Some(size) if size < MIN_MOUNT_TABLE_ENTRY_SIZE => {
                    return Err(ConfigError::MountTableEntrySizeTooSmall);
                }
                Some(size) if size > MAX_MOUNT_TABLE_ENTRY_SIZE => {
                    return Err(ConfigError::MountTableEntrySizeTooLarge);
                }
                other => other,
            };

        let autopilot_update_interval =
            parse_duration(conf, "autopilot_update_interval")?
                .unwrap_or(crate::autopilot::DEFAULT_UPDATE_INTERVAL);
        let autopilot_reconcile_interval =
            parse_duration(conf, "autopilot_reconcile_interval")?
                .unwrap_or(crate::autopilot::DEFAULT_RECONCILE_INTERVAL);
        if autopilot_reconcile_interval < autopilot_update_interval {
            return Err(ConfigError::ReconcileBelowUpdate {
                reconcile: autopilot_reconcile_interval,
                update: autopilot_update_interval,
            });
        }

        let performance_multiplier = match parse_u64(conf, "performance_multiplier")? {
            Some(value) if !(1..=10).contains(&value) => {
                return Err(ConfigError::InvalidPerformanceMultiplier { value });
            }
            Some(value) => value,
            None => 1,
        };

        let autopilot_upgrade_version = match conf.get("autopilot_upgrade_version") {
            Some(value) if !value.is_empty() => {
                Some(value.parse().map_err(|_| ConfigError::InvalidVersion {
                    key: "autopilot_upgrade_version".to_string(),
                    value: value.clone(),
                })?)
            }
            _ => None,
        };

        let max_batch_entries = env_usize(ENV_RAFT_MAX_BATCH_ENTRIES)
            .or(parse_u64(conf, "max_batch_entries")?.map(|v| v as usize))
            .unwrap_or(DEFAULT_MAX_BATCH_ENTRIES);
        let max_batch_size = env_u64(ENV_RAFT_MAX_BATCH_SIZE_BYTES)
            .or(parse_u64(conf, "max_batch_size")?)
            .unwrap_or(DEFAULT_MAX_BATCH_SIZE);

        Ok(Self {
            path,
            node_id,
            retry_join,
            retry_join_as_non_voter,
            raft_wal: parse_bool(conf, "raft_wal")?.unwrap_or(false),
            raft_log_verifier_enabled,
            raft_log_verification_interval,
            snapshot_delay: parse_duration(conf, "snapshot_delay")?,
            apply_delay: parse_duration(conf, "apply_delay")?,
            max_entry_size: parse_u64(conf, "max_entry_size")?.unwrap_or(DEFAULT_MAX_ENTRY_SIZE),
            max_mount_and_namespace_table_entry_size,
            max_batch_entries,
            max_batch_size,
            trailing_logs: parse_u64(conf, "trailing_logs")?.unwrap_or(DEFAULT_TRAILING_LOGS),
            performance_multiplier,
            autopilot_reconcile_interval,
            autopilot_update_interval,
            autopilot_disable: std::env::var(ENV_RAFT_AUTOPILOT_DISABLE)
                .map(|v| !v.is_empty())
                .unwrap_or(parse_bool(conf, "autopilot_disable")?.unwrap_or(false)),
            autopilot_upgrade_version,
            autopilot_redundancy_zone: conf
                .get("autopilot_redundancy_zone")
                .filter(|v| !v.is_empty())
                .cloned(),
            initial_cache_size: env_usize(ENV_RAFT_INITIAL_CACHE_SIZE),
        })
    }

    /// The byte limit applied to an entry at `path`.
    pub fn entry_size_limit_for(&self, is_special_path: bool) -> u64 {
        if is_special_path {
            self.max_mount_and_namespace_table_entry_size.unwrap_or(self.max_entry_size)
        } else {
            self.max_entry_size
        }
    }
}

fn parse_bool(conf: &HashMap<String, String>, key: &str) -> Result<Option<bool>, ConfigError> {
    match conf.get(key) {
        None => Ok(None),
        Some(value) if value.is_empty() => Ok(None),
        Some(value) => value.parse().map(Some).map_err(|_| ConfigError::InvalidBool {
            key: key.to_string(),
            value: value.clone(),
        }),
    }
}

fn parse_u64(conf: &HashMap<String, String>, key: &str) -> Result<Option<u64>, ConfigError> {
    match conf.get(key) {
        None => Ok(None),
        Some(value) if value.is_empty() => Ok(None),
        Some(value) => value.parse().map(Some).map_err(|_| ConfigError::InvalidInteger {
            key: key.to_string(),
            value: value.clone(),
        }),
    }
}

fn parse_duration(
    conf: &HashMap<String, String>,
    key: &str,
) -> Result<Option<Duration>, ConfigError> {
    match conf.get(key) {
        None => Ok(None),
        Some(value) if value.is_empty() => Ok(None),
        Some(value) => humantime::parse_duration(value).map(Some).map_err(|source| {
            ConfigError::InvalidDuration {
                key: key.to_string(),
                source,
            }
        }),
    }
}

fn parse_retry_join(conf: &HashMap<String, String>) -> Result<Vec<SocketAddr>, ConfigError> {
    let Some(raw) = conf.get("retry_join").filter(|v| !v.is_empty()) else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse().map_err(|_| ConfigError::InvalidAddress {
                key: "retry_join".to_string(),
                value: part.to_string(),
            })
        })
        .collect()
}

/// Negative or unparseable values are ignored.
fn env_usize(name: &str) -> Option<usize> {
    let raw = std::env::var(name).ok()?;
    let parsed: i64 = raw.trim().parse().ok()?;
    if parsed < 0 {
        return None;
    }
    Some(parsed as usize)
}

fn env_u64(name: &str) -> Option<u64> {
    env_usize(name).map(|v| v as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let parsed = RaftBackendConfig::parse(&conf(&[("path", "/d"), ("node_id", "x")])).unwrap();
        assert_eq!(parsed.path, "/d");
        assert_eq!(parsed.node_id.as_deref(), Some("x"));
        assert_eq!(parsed.max_entry_size, DEFAULT_MAX_ENTRY_SIZE);
        assert_eq!(parsed.max_batch_entries, DEFAULT_MAX_BATCH_ENTRIES);
        assert_eq!(parsed.trailing_logs, DEFAULT_TRAILING_LOGS);
        assert_eq!(parsed.performance_multiplier, 1);
        assert!(!parsed.raft_wal);
    }

    #[test]
    fn missing_path_is_rejected() {
        let err = RaftBackendConfig::parse(&conf(&[("node_id", "x")])).unwrap_err();
        assert!(err.to_string().contains("'path' cannot be empty"));
    }

    #[test]
    fn zero_verification_interval_clamps_to_default() {
        let parsed = RaftBackendConfig::parse(&conf(&[
            ("path", "/d"),
            ("node_id", "x"),
            ("raft_log_verifier_enabled", "true"),
            ("raft_log_verification_interval", "0s"),
        ]))
        .unwrap();
        assert!(parsed.raft_log_verifier_enabled);
        assert_eq!(parsed.raft_log_verification_interval, DEFAULT_VERIFICATION_INTERVAL);
    }

    #[test]
    fn unparseable_verification_interval_is_rejected() {
        let err = RaftBackendConfig::parse(&conf(&[
            ("path", "/d"),
            ("node_id", "x"),
            ("raft_log_verifier_enabled", "true"),
            ("raft_log_verification_interval", "notaduration"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("does not parse as a duration"));
    }

    #[test]
    fn tiny_mount_table_entry_size_is_rejected() {
        let err = RaftBackendConfig::parse(&conf(&[
            ("path", "/d"),
            ("node_id", "x"),
            ("max_mount_and_namespace_table_entry_size", "1"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("must be at least 1024 bytes"));
    }

    #[test]
    fn huge_mount_table_entry_size_is_rejected() {
        let err = RaftBackendConfig::parse(&conf(&[
            ("path", "/d"),
            ("node_id", "x"),
            ("max_mount_and_namespace_table_entry_size", "999999999"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("must be at most"));
    }

    #[test]
    fn non_voter_without_retry_join_is_rejected() {
        let err = RaftBackendConfig::parse(&conf(&[
            ("path", "/d"),
            ("node_id", "x"),
            ("retry_join_as_non_voter", "true"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("requires a non-empty 'retry_join'"));
    }

    #[test]
    fn non_voter_with_retry_join_is_accepted() {
        let parsed = RaftBackendConfig::parse(&conf(&[
            ("path", "/d"),
            ("node_id", "x"),
            ("retry_join", "127.0.0.1:8201, 127.0.0.1:8202"),
            ("retry_join_as_non_voter", "true"),
        ]))
        .unwrap();
        assert!(parsed.retry_join_as_non_voter);
        assert_eq!(parsed.retry_join.len(), 2);
    }

    #[test]
    fn reconcile_below_update_is_rejected() {
        let err = RaftBackendConfig::parse(&conf(&[
            ("path", "/d"),
            ("node_id", "x"),
            ("autopilot_reconcile_interval", "1s"),
            ("autopilot_update_interval", "5s"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("must not be less than"));
    }

    #[test]
    fn performance_multiplier_bounds() {
        let err = RaftBackendConfig::parse(&conf(&[
            ("path", "/d"),
            ("node_id", "x"),
            ("performance_multiplier", "0"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("between 1 and 10"));

        let parsed = RaftBackendConfig::parse(&conf(&[
            ("path", "/d"),
            ("node_id", "x"),
            ("performance_multiplier", "5"),
        ]))
        .unwrap();
        assert_eq!(parsed.performance_multiplier, 5);
    }

    #[test]
    fn upgrade_version_must_be_semver() {
        let err = RaftBackendConfig::parse(&conf(&[
            ("path", "/d"),
            ("node_id", "x"),
            ("autopilot_upgrade_version", "not-a-version"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("semantic version"));

        let parsed = RaftBackendConfig::parse(&conf(&[
            ("path", "/d"),
            ("node_id", "x"),
            ("autopilot_upgrade_version", "1.2.3"),
        ]))
        .unwrap();
        assert_eq!(parsed.autopilot_upgrade_version.unwrap().to_string(), "1.2.3");
    }
}
