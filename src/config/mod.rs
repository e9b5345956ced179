/// Configuration management for the Trino gateway
use crate::core::{Backend, Policy, RoutingGroup, RoutingStrategy, RuleType, Scheme};
pub use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Largest body the proxy can inspect and still replay upstream
pub const MAX_INSPECTABLE_BODY_BYTES: usize = 64 * 1024;

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listener and routing configuration
    pub gateway: GatewayConfig,
    /// Where backends, groups, policies and queries are managed
    pub management: ManagementConfig,
    /// Delegated authentication
    pub auth: AuthConfig,
    /// Backend health monitor
    pub monitor: MonitorConfig,
    /// Prometheus exposition
    pub metrics: MetricsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Listener and routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address every listener binds to
    pub listen_host: String,
    /// One proxy listener per port
    pub ports: Vec<u16>,
    /// Group used when no policy constrains the client
    pub default_routing_group: String,
    /// Hostname written into rewritten Location headers
    pub external_hostname: String,
    /// Scheme written into rewritten Location headers
    #[serde(default)]
    pub external_scheme: Scheme,
    /// Request bodies above this size are rejected
    #[serde(default = "default_max_request_body_bytes")]
    pub max_request_body_bytes: usize,
}

fn default_max_request_body_bytes() -> usize {
    MAX_INSPECTABLE_BODY_BYTES
}

/// Management API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode")]
pub enum ManagementConfig {
    /// Remote management services reached over twirp JSON
    #[serde(rename = "remote")]
    Remote {
        /// Base URL of the management services
        url: String,
        /// Shared service token sent with every call
        token: String,
        /// Header carrying the token
        #[serde(default = "default_token_header")]
        token_header: String,
        /// Per-call timeout in seconds
        timeout_sec: u64,
    },
    /// Catalog declared inline and served from memory
    #[serde(rename = "static")]
    Static {
        #[serde(default)]
        backends: Vec<Backend>,
        #[serde(default)]
        groups: Vec<RoutingGroup>,
        #[serde(default)]
        policies: Vec<Policy>,
    },
}

fn default_token_header() -> String {
    "X-Auth-Token".to_string()
}

/// Delegated authentication configuration
///
/// Requests on ports whose policy delegates auth are always authenticated.
/// On every other port only the usernames in `service_accounts` are
/// authenticated and all other requests pass through unauthenticated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// External credential validator endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_url: Option<String>,
    /// Shared token sent to the validator
    pub validation_token: String,
    /// Header carrying the validator token
    #[serde(default = "default_token_header")]
    pub token_header: String,
    /// How long a validated credential stays cached, in seconds
    pub cache_ttl_sec: u64,
    /// Validator call timeout in seconds
    pub timeout_sec: u64,
    /// Accounts authenticated even when delegation is off
    #[serde(default)]
    pub service_accounts: Vec<String>,
}

/// Backend health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Run the monitor at all
    pub enabled: bool,
    /// Interval between runs in seconds
    pub interval_sec: u64,
    /// Timeout for probing a single backend in seconds
    pub probe_timeout_sec: u64,
    /// User the probe identifies as; its own queries are excluded from load
    pub trino_user: String,
    /// Optional password for the probing user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trino_password: Option<String>,
    /// Query that must drain without error for a cluster to be healthy
    pub health_check_sql: String,
    /// Threshold used when a backend declares none; 0 disables the check
    pub default_load_threshold: i32,
    /// Load score weights
    #[serde(default)]
    pub load_weights: LoadWeights,
}

/// Weights of the load score
///
/// `load = running_weight * (planning + dispatching + finishing + running)
///       + (queued + starting) / queued_divisor`
///
/// A tunable heuristic, not a fixed contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadWeights {
    pub running_weight: i64,
    pub queued_divisor: i64,
}

impl Default for LoadWeights {
    fn default() -> Self {
        Self {
            running_weight: 2,
            queued_divisor: 3,
        }
    }
}

/// Prometheus exposition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Serve the registry at all
    pub enabled: bool,
    /// Address the metrics endpoint listens on
    pub listen_addr: String,
    /// Constant `env` label on every series
    pub env: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig {
                listen_host: "0.0.0.0".to_string(),
                ports: vec![8080],
                default_routing_group: "adhoc".to_string(),
                external_hostname: "localhost:8080".to_string(),
                external_scheme: Scheme::Http,
                max_request_body_bytes: MAX_INSPECTABLE_BODY_BYTES,
            },
            management: ManagementConfig::Remote {
                url: "http://127.0.0.1:8081".to_string(),
                token: "change-me".to_string(),
                token_header: default_token_header(),
                timeout_sec: 5,
            },
            auth: AuthConfig {
                validation_url: None,
                validation_token: String::new(),
                token_header: default_token_header(),
                cache_ttl_sec: 600,
                timeout_sec: 5,
                service_accounts: Vec::new(),
            },
            monitor: MonitorConfig {
                enabled: true,
                interval_sec: 60,
                probe_timeout_sec: 30,
                trino_user: "trino-gateway".to_string(),
                trino_password: None,
                health_check_sql: "SELECT 1".to_string(),
                default_load_threshold: 0,
                load_weights: LoadWeights::default(),
            },
            metrics: MetricsConfig {
                enabled: true,
                listen_addr: "0.0.0.0:9090".to_string(),
                env: "dev".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// `host:port` for every configured listener
    pub fn listen_addrs(&self) -> Vec<String> {
        self.gateway
            .ports
            .iter()
            .map(|port| format!("{}:{}", self.gateway.listen_host, port))
            .collect()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_gateway()?;
        self.validate_management()?;

        if self.auth.cache_ttl_sec == 0 {
            return Err(invalid("auth cache_ttl_sec must be greater than 0"));
        }
        if self.auth.timeout_sec == 0 {
            return Err(invalid("auth timeout_sec must be greater than 0"));
        }
        if let Some(url) = &self.auth.validation_url {
            check_http_url("auth validation_url", url)?;
        }

        self.validate_monitor()?;

        if self.metrics.enabled {
            self.metrics
                .listen_addr
                .parse::<std::net::SocketAddr>()
                .map_err(|_| {
                    invalid(format!(
                        "Invalid metrics listen_addr: {}",
                        self.metrics.listen_addr
                    ))
                })?;
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(invalid(format!("Invalid log level: {}", self.logging.level))),
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(invalid(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    fn validate_gateway(&self) -> Result<(), ConfigError> {
        let gateway = &self.gateway;
        if gateway.ports.is_empty() {
            return Err(invalid("gateway ports cannot be empty"));
        }

        let mut seen = HashSet::new();
        for port in &gateway.ports {
            if *port == 0 {
                return Err(invalid("gateway ports must be non-zero"));
            }
            if !seen.insert(*port) {
                return Err(invalid(format!("duplicate gateway port: {}", port)));
            }
        }

        if gateway.default_routing_group.trim().is_empty() {
            return Err(invalid("default_routing_group cannot be empty"));
        }

        if gateway.external_hostname.trim().is_empty() {
            return Err(invalid("external_hostname cannot be empty"));
        }

        if gateway.max_request_body_bytes == 0
            || gateway.max_request_body_bytes > MAX_INSPECTABLE_BODY_BYTES
        {
            return Err(invalid(format!(
                "max_request_body_bytes must be between 1 and {}",
                MAX_INSPECTABLE_BODY_BYTES
            )));
        }

        Ok(())
    }

    fn validate_management(&self) -> Result<(), ConfigError> {
        match &self.management {
            ManagementConfig::Remote {
                url,
                token_header,
                timeout_sec,
                ..
            } => {
                check_http_url("management url", url)?;
                if token_header.trim().is_empty() {
                    return Err(invalid("management token_header cannot be empty"));
                }
                if *timeout_sec == 0 {
                    return Err(invalid("management timeout_sec must be greater than 0"));
                }
            }
            ManagementConfig::Static {
                backends,
                groups,
                policies,
            } => {
                let mut backend_ids = HashSet::new();
                for backend in backends {
                    if backend.id.is_empty() || backend.hostname.is_empty() {
                        return Err(invalid("static backends need an id and a hostname"));
                    }
                    if !backend_ids.insert(backend.id.as_str()) {
                        return Err(invalid(format!("duplicate backend id: {}", backend.id)));
                    }
                }

                let mut group_ids = HashSet::new();
                for group in groups {
                    if !group_ids.insert(group.id.as_str()) {
                        return Err(invalid(format!("duplicate group id: {}", group.id)));
                    }
                    for member in &group.backends {
                        if !backend_ids.contains(member.as_str()) {
                            return Err(invalid(format!(
                                "group {} references unknown backend {}",
                                group.id, member
                            )));
                        }
                    }
                }

                for policy in policies {
                    let targets = std::iter::once(&policy.group_id)
                        .chain(policy.fallback_group_id.iter());
                    for target in targets {
                        if !group_ids.contains(target.as_str()) {
                            return Err(invalid(format!(
                                "policy {} references unknown group {}",
                                policy.id, target
                            )));
                        }
                    }
                    if policy.rule_type == RuleType::ListeningPort
                        && policy.rule_value.parse::<u16>().is_err()
                    {
                        return Err(invalid(format!(
                            "policy {} has invalid listening port {}",
                            policy.id, policy.rule_value
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    fn validate_monitor(&self) -> Result<(), ConfigError> {
        let monitor = &self.monitor;
        if monitor.interval_sec == 0 {
            return Err(invalid("monitor interval_sec must be greater than 0"));
        }

        if monitor.probe_timeout_sec == 0 {
            return Err(invalid("monitor probe_timeout_sec must be greater than 0"));
        }

        if monitor.probe_timeout_sec >= monitor.interval_sec {
            return Err(invalid(
                "monitor probe_timeout_sec must be less than interval_sec",
            ));
        }

        if monitor.trino_user.trim().is_empty() {
            return Err(invalid("monitor trino_user cannot be empty"));
        }

        if monitor.health_check_sql.trim().is_empty() {
            return Err(invalid("monitor health_check_sql cannot be empty"));
        }

        if monitor.default_load_threshold < 0 {
            return Err(invalid("monitor default_load_threshold cannot be negative"));
        }

        if monitor.load_weights.queued_divisor <= 0 || monitor.load_weights.running_weight < 0 {
            return Err(invalid(
                "load_weights need a positive queued_divisor and a non-negative running_weight",
            ));
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, mode: &str) -> Result<(), ConfigError> {
        let config = match mode {
            "remote" => Config {
                management: ManagementConfig::Remote {
                    url: "http://gateway-api.internal:8081".to_string(),
                    token: "change-me".to_string(),
                    token_header: default_token_header(),
                    timeout_sec: 5,
                },
                auth: AuthConfig {
                    validation_url: Some("http://auth.internal/validate".to_string()),
                    validation_token: "change-me".to_string(),
                    ..Config::default().auth
                },
                ..Default::default()
            },
            "static" => Config {
                gateway: GatewayConfig {
                    ports: vec![8080, 8081],
                    ..Config::default().gateway
                },
                management: ManagementConfig::Static {
                    backends: vec![
                        example_backend("trino-adhoc-1", "10.0.1.10:8080"),
                        example_backend("trino-adhoc-2", "10.0.1.11:8080"),
                        example_backend("trino-etl-1", "10.0.2.10:8080"),
                    ],
                    groups: vec![
                        RoutingGroup {
                            id: "adhoc".to_string(),
                            enabled: true,
                            backends: vec![
                                "trino-adhoc-1".to_string(),
                                "trino-adhoc-2".to_string(),
                            ],
                            strategy: RoutingStrategy::RoundRobin,
                        },
                        RoutingGroup {
                            id: "etl".to_string(),
                            enabled: true,
                            backends: vec!["trino-etl-1".to_string()],
                            strategy: RoutingStrategy::Random,
                        },
                    ],
                    policies: vec![Policy {
                        fallback_group_id: Some("adhoc".to_string()),
                        request_source: Some("etl-scheduler".to_string()),
                        ..Policy::new("etl-port", RuleType::ListeningPort, "8081", "etl")
                    }],
                },
                ..Default::default()
            },
            _ => return Err(invalid("Mode must be 'remote' or 'static'")),
        };

        let content = toml::to_string_pretty(&config)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        fs::write(path, format!("{}\n{}", EXAMPLE_HEADER, content))
            .map_err(|e| ConfigError::IoError(e.to_string()))
    }
}

const EXAMPLE_HEADER: &str = "\
# trino-gateway example configuration
#
# [auth]: ports whose listening-port policy sets auth_delegated always
# authenticate clients against validation_url. On every other port only the
# usernames in service_accounts are authenticated; all other requests pass
# through unauthenticated.
#
# [monitor.load_weights]: load = running_weight * (planning + dispatching +
# finishing + running) + (queued + starting) / queued_divisor. The weights are
# a tunable heuristic.
";

fn example_backend(id: &str, hostname: &str) -> Backend {
    Backend {
        threshold_cluster_load: 100,
        ..Backend::new(id, hostname, Scheme::Http)
    }
}

fn check_http_url(name: &str, url: &str) -> Result<(), ConfigError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(invalid(format!("{} must be an http(s) URL: {}", name, url)))
    }
}

fn invalid<S: Into<String>>(message: S) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_addrs(), vec!["0.0.0.0:8080".to_string()]);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.gateway.ports = vec![];
        assert!(config.validate().is_err());

        config.gateway.ports = vec![8080, 8080];
        assert!(config.validate().is_err());

        config.gateway.ports = vec![8080, 8081];
        assert!(config.validate().is_ok());

        config.gateway.default_routing_group = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_body_limit_bounded_by_retry_buffer() {
        let mut config = Config::default();
        config.gateway.max_request_body_bytes = MAX_INSPECTABLE_BODY_BYTES + 1;
        assert!(config.validate().is_err());

        config.gateway.max_request_body_bytes = 1024;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_monitor_validation() {
        let mut config = Config::default();
        config.monitor.probe_timeout_sec = config.monitor.interval_sec;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.monitor.load_weights.queued_divisor = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_static_catalog_references_checked() {
        let mut config = Config::default();
        config.management = ManagementConfig::Static {
            backends: vec![Backend::new("b1", "trino:8080", Scheme::Http)],
            groups: vec![RoutingGroup {
                id: "g1".to_string(),
                enabled: true,
                backends: vec!["b2".to_string()],
                strategy: RoutingStrategy::Random,
            }],
            policies: vec![],
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown backend b2"));
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed_config: Config = toml::from_str(&toml_str).unwrap();
        assert!(parsed_config.validate().is_ok());
        assert_eq!(parsed_config.monitor.load_weights, LoadWeights::default());
    }

    #[test]
    fn test_config_file_operations() {
        let config = Config::default();
        let temp_file = NamedTempFile::new().unwrap();

        config.save_to_file(temp_file.path()).unwrap();
        let loaded_config = Config::load_from_file(temp_file.path()).unwrap();
        assert!(loaded_config.validate().is_ok());
    }

    #[test]
    fn test_example_configs() {
        for mode in ["remote", "static"] {
            let temp_file = NamedTempFile::new().unwrap();
            Config::create_example_config(temp_file.path(), mode).unwrap();
            let loaded = Config::load_from_file(temp_file.path()).unwrap();
            assert!(loaded.validate().is_ok());
        }

        let temp_file = NamedTempFile::new().unwrap();
        assert!(Config::create_example_config(temp_file.path(), "hybrid").is_err());
    }

    #[test]
    fn test_parse_static_catalog() {
        let toml_str = r#"
            [gateway]
            listen_host = "127.0.0.1"
            ports = [8080]
            default_routing_group = "adhoc"
            external_hostname = "gateway.example.com"
            external_scheme = "https"

            [management]
            mode = "static"

            [[management.backends]]
            id = "b1"
            hostname = "trino-1:8080"
            healthy = true

            [[management.groups]]
            id = "adhoc"
            backends = ["b1"]
            strategy = "round_robin"

            [[management.policies]]
            id = "p1"
            rule_type = "listening_port"
            rule_value = "8080"
            group_id = "adhoc"
            auth_delegated = true

            [auth]
            validation_token = ""
            cache_ttl_sec = 60
            timeout_sec = 5

            [monitor]
            enabled = false
            interval_sec = 60
            probe_timeout_sec = 10
            trino_user = "gateway"
            health_check_sql = "SELECT 1"
            default_load_threshold = 0

            [metrics]
            enabled = false
            listen_addr = "127.0.0.1:9090"
            env = "test"

            [logging]
            level = "debug"
            format = "json"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.gateway.external_scheme, Scheme::Https);
        assert_eq!(config.gateway.max_request_body_bytes, MAX_INSPECTABLE_BODY_BYTES);
        match config.management {
            ManagementConfig::Static {
                backends, policies, ..
            } => {
                assert!(backends[0].enabled);
                assert_eq!(backends[0].uptime_schedule, "* * * * *");
                assert!(policies[0].auth_delegated);
            }
            other => panic!("unexpected management config: {:?}", other),
        }
    }
}
