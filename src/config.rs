//! Operator configuration from environment variables
//!
//! Every setting has a default; a value that does not parse falls back to the
//! default with a warning instead of stopping the operator.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_RESTART_READY_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_RESTART_POLL_INTERVAL_SECS: u64 = 2;
pub const DEFAULT_STATUS_UPDATE_RETRIES: u32 = 3;
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Watch only this namespace; all namespaces when `None`
    pub watch_namespace: Option<String>,
    /// Periodic requeue of every cluster
    pub resync_interval: Duration,
    /// Bound on each wait for an instance during a restart
    pub restart_ready_timeout: Duration,
    pub restart_poll_interval: Duration,
    /// Attempts of one status write before a conflict is surfaced
    pub status_update_retries: u32,
    pub health_port: u16,
    pub leader_election: bool,
    /// Leader election identity
    pub pod_name: String,
    /// Namespace holding the leader election lease
    pub pod_namespace: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_INTERVAL_SECS),
            restart_ready_timeout: Duration::from_secs(DEFAULT_RESTART_READY_TIMEOUT_SECS),
            restart_poll_interval: Duration::from_secs(DEFAULT_RESTART_POLL_INTERVAL_SECS),
            status_update_retries: DEFAULT_STATUS_UPDATE_RETRIES,
            health_port: DEFAULT_HEALTH_PORT,
            leader_election: true,
            pod_name: "unknown".to_string(),
            pod_namespace: "default".to_string(),
        }
    }
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(value) => value.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %value, "Invalid value, using default");
            default
        }),
    }
}

fn parse_bool(key: &str, raw: Option<String>, default: bool) -> bool {
    match raw.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        None => default,
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        Some(v) => {
            warn!(key, value = %v, "Invalid boolean, using default");
            default
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let pod_name = lookup("POD_NAME").unwrap_or_else(|| {
            warn!("POD_NAME not set, using hostname");
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or(defaults.pod_name.clone())
        });
        let pod_namespace = lookup("POD_NAMESPACE").unwrap_or_else(|| {
            warn!("POD_NAMESPACE not set, using 'default'");
            defaults.pod_namespace.clone()
        });

        Self {
            watch_namespace: lookup("WATCH_NAMESPACE").filter(|ns| !ns.trim().is_empty()),
            resync_interval: Duration::from_secs(parse_or(
                "RESYNC_INTERVAL_SECS",
                lookup("RESYNC_INTERVAL_SECS"),
                DEFAULT_RESYNC_INTERVAL_SECS,
            )),
            restart_ready_timeout: Duration::from_secs(parse_or(
                "RESTART_READY_TIMEOUT_SECS",
                lookup("RESTART_READY_TIMEOUT_SECS"),
                DEFAULT_RESTART_READY_TIMEOUT_SECS,
            )),
            restart_poll_interval: Duration::from_secs(parse_or(
                "RESTART_POLL_INTERVAL_SECS",
                lookup("RESTART_POLL_INTERVAL_SECS"),
                DEFAULT_RESTART_POLL_INTERVAL_SECS,
            )),
            status_update_retries: parse_or(
                "STATUS_UPDATE_RETRIES",
                lookup("STATUS_UPDATE_RETRIES"),
                DEFAULT_STATUS_UPDATE_RETRIES,
            )
            .max(1),
            health_port: parse_or("HEALTH_PORT", lookup("HEALTH_PORT"), DEFAULT_HEALTH_PORT),
            leader_election: parse_bool(
                "LEADER_ELECTION",
                lookup("LEADER_ELECTION"),
                defaults.leader_election,
            ),
            pod_name,
            pod_namespace,
        }
    }
}
