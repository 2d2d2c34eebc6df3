//! Configuration types for the webhook auth agent
//!
//! Provides JSON-serializable configuration for authentication, topic
//! authorization, usage auditing and actor caching.

use crate::mqtt::{Qos, DEFAULT_NODE_DATUM_TOPIC_REGEX, DEFAULT_USER_TOPIC_REGEX};
use serde::{Deserialize, Serialize};

/// Webhook auth agent configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct FluxAuthConfig {
    /// Connection authentication
    pub auth: AuthConfig,

    /// Topic authorization
    pub authz: AuthzConfig,

    /// Usage auditing
    pub audit: AuditConfig,

    /// Actor cache
    pub cache: CacheConfig,
}

// ============================================================================
// Authentication Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct AuthConfig {
    /// Username identifying device (node) clients
    pub device_username: String,

    /// CIDR that device clients must connect from
    pub ip_mask: Option<String>,

    /// Maximum allowed difference between the signed date and now, in
    /// seconds (negative disables the check)
    pub max_date_skew_secs: i64,

    /// Require token clients to use a client id starting with the token id
    pub require_token_client_id_prefix: bool,

    /// Force a clean session on successful connect
    pub force_clean_session: bool,

    /// Accept raw token secrets in the password and sign locally
    pub direct_token_authentication: bool,

    /// Pattern a password must match to be treated as a raw token secret
    pub direct_token_secret_regex: String,

    /// Host included in signed requests
    pub host: String,

    /// Path included in signed requests
    pub path: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            device_username: "solarnode".to_string(),
            ip_mask: None,
            max_date_skew_secs: default_max_date_skew(),
            require_token_client_id_prefix: true,
            force_clean_session: false,
            direct_token_authentication: false,
            direct_token_secret_regex: default_direct_token_secret_regex(),
            host: "data.solarnetwork.net".to_string(),
            path: "/solarflux/auth".to_string(),
        }
    }
}

// ============================================================================
// Authorization Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct AuthzConfig {
    /// Node datum topic pattern (groups: userId, nodeId, aggregation, sourceId)
    pub node_datum_topic_regex: String,

    /// Generic user topic pattern (groups: userId, topic)
    pub user_topic_regex: String,

    /// Enable `user/{id}/` topic prefixes and wildcard node ids
    pub allow_topic_prefix: bool,

    /// Maximum QoS granted; higher requests are downgraded
    pub max_qos: Option<Qos>,
}

impl Default for AuthzConfig {
    fn default() -> Self {
        Self {
            node_datum_topic_regex: DEFAULT_NODE_DATUM_TOPIC_REGEX.to_string(),
            user_topic_regex: DEFAULT_USER_TOPIC_REGEX.to_string(),
            allow_topic_prefix: false,
            max_qos: None,
        }
    }
}

// ============================================================================
// Audit Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct AuditConfig {
    /// Record and persist byte counts
    pub enabled: bool,

    /// Service name for publish (ingress) traffic
    pub publish_service: String,

    /// Service name for deliver (egress) traffic
    pub deliver_service: String,

    /// Deliver topic pattern (optional groups: userId, nodeId, sourceId)
    pub deliver_topic_regex: String,

    /// Pause between flush passes
    pub flush_delay_ms: u64,

    /// Pause before reconnecting after a storage error
    pub connection_recovery_delay_ms: u64,

    /// Pause between individual writes in a flush pass
    pub update_delay_ms: u64,

    /// Log flush progress every this many writes (0 disables)
    pub progress_log_count: u64,

    /// Maximum wait for the writer to start
    pub startup_timeout_ms: u64,
}

impl AuditConfig {
    /// Whether a change from `self` to `other` affects the write statement
    pub fn write_settings_differ(&self, other: &AuditConfig) -> bool {
        self.publish_service != other.publish_service
            || self.deliver_service != other.deliver_service
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            publish_service: "flxi".to_string(),
            deliver_service: "flxo".to_string(),
            deliver_topic_regex: default_deliver_topic_regex(),
            flush_delay_ms: 10_000,
            connection_recovery_delay_ms: 15_000,
            update_delay_ms: 0,
            progress_log_count: 500,
            startup_timeout_ms: 5_000,
        }
    }
}

// ============================================================================
// Cache Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheConfig {
    /// Cache actor lookups
    pub enabled: bool,

    /// Time to live of cached actors, in seconds
    pub ttl_secs: u64,

    /// Maximum number of cached actors
    pub max_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            max_capacity: 10_000,
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_max_date_skew() -> i64 {
    15 * 60
}

fn default_direct_token_secret_regex() -> String {
    // Raw secrets never contain the `=` used by signed passwords
    r"^[^=,\s]{16,64}$".to_string()
}

fn default_deliver_topic_regex() -> String {
    r"^(?:user/(?P<userId>\d+)/)?(?:node/(?P<nodeId>\d+)/datum/[^/]+/(?P<sourceId>.+)|.*)$"
        .to_string()
}
