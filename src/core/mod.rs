/// Core data model shared by the router, the policy engine and the monitor
pub mod balancer;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default uptime schedule: always eligible
pub const DEFAULT_UPTIME_SCHEDULE: &str = "* * * * *";

/// URL scheme a backend cluster is served on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Scheme::Https)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One addressable Trino cluster the gateway can route to
///
/// `enabled` is operator intent, `healthy` is what the monitor last
/// observed. Only backends that are both are eligible for routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    pub id: String,
    /// `host[:port]` the gateway forwards to
    pub hostname: String,
    #[serde(default)]
    pub scheme: Scheme,
    /// `host[:port]` clients use to reach the cluster UI directly
    #[serde(default)]
    pub external_url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub healthy: bool,
    #[serde(default = "default_uptime_schedule")]
    pub uptime_schedule: String,
    #[serde(default)]
    pub cluster_load: i32,
    /// 0 means no threshold
    #[serde(default)]
    pub threshold_cluster_load: i32,
}

fn default_true() -> bool {
    true
}

fn default_uptime_schedule() -> String {
    DEFAULT_UPTIME_SCHEDULE.to_string()
}

impl Backend {
    pub fn new<I: Into<String>, H: Into<String>>(id: I, hostname: H, scheme: Scheme) -> Self {
        let hostname = hostname.into();
        Self {
            id: id.into(),
            external_url: hostname.clone(),
            hostname,
            scheme,
            enabled: true,
            healthy: false,
            uptime_schedule: default_uptime_schedule(),
            cluster_load: 0,
            threshold_cluster_load: 0,
        }
    }

    /// Eligible for routing
    pub fn is_routable(&self) -> bool {
        self.enabled && self.healthy
    }

    /// `host:port` with the scheme's default port filled in
    pub fn authority(&self) -> String {
        with_default_port(&self.hostname, self.scheme.default_port())
    }

    /// Host part without the port, used as TLS SNI
    pub fn host(&self) -> &str {
        strip_port(&self.hostname)
    }

    /// `scheme://hostname`
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.hostname)
    }

    /// `scheme://external_url`, falling back to the hostname when unset
    pub fn external_base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.external_host())
    }

    pub fn external_host(&self) -> &str {
        if self.external_url.is_empty() {
            &self.hostname
        } else {
            &self.external_url
        }
    }
}

/// Backend selection strategy of a routing group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    #[default]
    Random,
    RoundRobin,
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingStrategy::Random => write!(f, "random"),
            RoutingStrategy::RoundRobin => write!(f, "round_robin"),
        }
    }
}

/// Named, strategy-tagged set of interchangeable backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingGroup {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub backends: Vec<String>,
    #[serde(default)]
    pub strategy: RoutingStrategy,
}

/// Client attribute a policy matches on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    ListeningPort,
    HeaderHost,
    HeaderClientTags,
    HeaderConnectionProperties,
}

impl RuleType {
    pub const ALL: [RuleType; 4] = [
        RuleType::ListeningPort,
        RuleType::HeaderHost,
        RuleType::HeaderClientTags,
        RuleType::HeaderConnectionProperties,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::ListeningPort => "listening_port",
            RuleType::HeaderHost => "header_host",
            RuleType::HeaderClientTags => "header_client_tags",
            RuleType::HeaderConnectionProperties => "header_connection_properties",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule mapping a client attribute match to a target group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub rule_type: RuleType,
    pub rule_value: String,
    pub group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_group_id: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auth_delegated: bool,
    /// Value forced into `X-Trino-Source` for matching clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_source: Option<String>,
}

impl Policy {
    pub fn new<I, V, G>(id: I, rule_type: RuleType, rule_value: V, group_id: G) -> Self
    where
        I: Into<String>,
        V: Into<String>,
        G: Into<String>,
    {
        Self {
            id: id.into(),
            rule_type,
            rule_value: rule_value.into(),
            group_id: group_id.into(),
            fallback_group_id: None,
            enabled: true,
            auth_delegated: false,
            request_source: None,
        }
    }

    pub fn matches(&self, rule_type: RuleType, value: &str) -> bool {
        self.enabled && self.rule_type == rule_type && self.rule_value == value
    }
}

/// Attributes of a client request that policies are evaluated against
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientAttributes {
    pub port: u16,
    pub host: String,
    pub client_tags: String,
    pub connection_properties: String,
}

impl ClientAttributes {
    /// Value of this client for the given rule axis
    pub fn value_for(&self, rule_type: RuleType) -> String {
        match rule_type {
            RuleType::ListeningPort => self.port.to_string(),
            RuleType::HeaderHost => self.host.clone(),
            RuleType::HeaderClientTags => self.client_tags.clone(),
            RuleType::HeaderConnectionProperties => self.connection_properties.clone(),
        }
    }
}

/// Backend chosen for a request together with the group it was chosen from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendAssignment {
    pub backend_id: String,
    pub group_id: String,
}

/// Query metadata persisted through the management API
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub id: String,
    pub text: String,
    pub client_ip: String,
    pub group_id: String,
    pub backend_id: String,
    pub username: String,
    /// Epoch seconds the gateway received the request
    pub received_at: i64,
    /// Epoch seconds the backend accepted the query
    pub submitted_at: i64,
    pub server_host: String,
}

/// Append `default_port` to `host` unless it already carries one
pub fn with_default_port(host: &str, default_port: u16) -> String {
    if has_port(host) {
        host.to_string()
    } else {
        format!("{}:{}", host, default_port)
    }
}

fn has_port(host: &str) -> bool {
    if let Some(end) = host.rfind(']') {
        // [v6]:port
        return host[end..].contains(':');
    }
    matches!(host.rsplit_once(':'), Some((_, port)) if port.parse::<u16>().is_ok())
}

/// Strip a trailing `:port`, keeping IPv6 brackets
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        if let Some(end) = host.find(']') {
            return &host[..=end];
        }
    }
    match host.rsplit_once(':') {
        Some((h, port)) if port.parse::<u16>().is_ok() => h,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_routable_requires_enabled_and_healthy() {
        let mut backend = Backend::new("b1", "trino-a:8080", Scheme::Http);
        assert!(!backend.is_routable());

        backend.healthy = true;
        assert!(backend.is_routable());

        backend.enabled = false;
        assert!(!backend.is_routable());
    }

    #[test]
    fn test_backend_authority_defaults_port() {
        let backend = Backend::new("b1", "trino-a.internal", Scheme::Https);
        assert_eq!(backend.authority(), "trino-a.internal:443");
        assert_eq!(backend.host(), "trino-a.internal");

        let backend = Backend::new("b2", "10.0.0.5:8080", Scheme::Http);
        assert_eq!(backend.authority(), "10.0.0.5:8080");
        assert_eq!(backend.host(), "10.0.0.5");
        assert_eq!(backend.base_url(), "http://10.0.0.5:8080");
    }

    #[test]
    fn test_external_url_falls_back_to_hostname() {
        let mut backend = Backend::new("b1", "trino-a:8080", Scheme::Http);
        backend.external_url.clear();
        assert_eq!(backend.external_base_url(), "http://trino-a:8080");

        backend.external_url = "trino-a.example.com".to_string();
        assert_eq!(backend.external_base_url(), "http://trino-a.example.com");
    }

    #[test]
    fn test_strip_port_ipv6() {
        assert_eq!(strip_port("[::1]:8080"), "[::1]");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(with_default_port("[::1]", 80), "[::1]:80");
        assert_eq!(with_default_port("[::1]:9000", 80), "[::1]:9000");
    }

    #[test]
    fn test_policy_matches_only_when_enabled() {
        let mut policy = Policy::new("p1", RuleType::ListeningPort, "8080", "adhoc");
        assert!(policy.matches(RuleType::ListeningPort, "8080"));
        assert!(!policy.matches(RuleType::ListeningPort, "8081"));
        assert!(!policy.matches(RuleType::HeaderHost, "8080"));

        policy.enabled = false;
        assert!(!policy.matches(RuleType::ListeningPort, "8080"));
    }

    #[test]
    fn test_rule_type_serde_names() {
        let json = serde_json::to_string(&RuleType::HeaderConnectionProperties).unwrap();
        assert_eq!(json, "\"header_connection_properties\"");
        let parsed: RoutingStrategy = serde_json::from_str("\"round_robin\"").unwrap();
        assert_eq!(parsed, RoutingStrategy::RoundRobin);
    }
}
