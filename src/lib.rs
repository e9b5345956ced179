//! Trino Gateway - routing gateway for fleets of Trino clusters
//! Built on Cloudflare's Pingora framework
//!
//! The gateway runs three things inside one pingora server:
//! 1. Router: one HTTP reverse proxy per listening port that classifies
//!    client requests, evaluates routing policies and forwards to a backend
//! 2. Health monitor: a background job probing every backend and pushing
//!    health transitions to the management API
//! 3. Metrics: a prometheus exposition endpoint

pub mod api;
pub mod config;
pub mod core;
pub mod error;
pub mod health;
pub mod metrics;
pub mod policy;
pub mod router;
pub mod utils;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use pingora::proxy::http_proxy_service;
use pingora::server::configuration::Opt;
use pingora::server::Server;
use pingora::services::background::background_service;
use pingora::services::listening::Service;
use tracing::info;

use crate::api::GatewayApi;
use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::health::{HealthMonitor, TrinoProbe};
use crate::metrics::{GatewayMetrics, MetricsApp};
use crate::router::auth::{AuthGate, Authenticator, HttpCredentialValidator};
use crate::router::{GatewayProxy, RequestRouter};

/// Shared objects built once at startup and handed to every service
pub struct Components {
    pub api: Arc<dyn GatewayApi>,
    pub metrics: Arc<GatewayMetrics>,
    pub router: Arc<RequestRouter>,
}

impl Components {
    /// Wire the management API client, metrics registry and router
    pub fn build(config: &Config) -> GatewayResult<Self> {
        let api = api::from_config(&config.management, &config.gateway.default_routing_group)?;
        let metrics = GatewayMetrics::new(&config.metrics.env).map_err(|e| {
            GatewayError::internal(format!("Failed to register metrics: {}", e))
        })?;

        let authenticator = match &config.auth.validation_url {
            Some(url) => {
                let validator = HttpCredentialValidator::new(
                    url,
                    &config.auth.validation_token,
                    &config.auth.token_header,
                    Duration::from_secs(config.auth.timeout_sec),
                )?;
                Some(Authenticator::new(
                    Arc::new(validator),
                    Duration::from_secs(config.auth.cache_ttl_sec),
                ))
            }
            None => None,
        };
        let gate = AuthGate::new(
            Arc::clone(&api),
            authenticator,
            config.auth.service_accounts.clone(),
        );
        let router = RequestRouter::new(
            Arc::clone(&api),
            gate,
            config.gateway.default_routing_group.clone(),
        );

        Ok(Self {
            api,
            metrics: Arc::new(metrics),
            router: Arc::new(router),
        })
    }

    /// Health monitor probing backends over the Trino protocol
    pub fn health_monitor(&self, config: &Config) -> HealthMonitor {
        let probe = TrinoProbe::new(
            config.monitor.trino_user.clone(),
            config.monitor.trino_password.clone(),
            config.monitor.health_check_sql.clone(),
        );
        HealthMonitor::new(
            Arc::clone(&self.api),
            Arc::new(probe),
            Arc::clone(&self.metrics),
            config.monitor.clone(),
        )
    }

    pub fn proxy(&self, config: &Config, port: u16) -> GatewayProxy {
        GatewayProxy::new(
            port,
            Arc::clone(&self.router),
            Arc::clone(&self.metrics),
            &config.gateway,
        )
    }
}

/// Main gateway instance
pub struct Gateway {
    config: Config,
    server: Option<Server>,
}

impl Gateway {
    /// Create a new gateway instance
    pub fn new(config: Config) -> Self {
        Self {
            config,
            server: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Initialize the pingora server
    pub fn initialize(&mut self, opt: Option<Opt>) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.config.validate()?;
        let server = Server::new(opt)?;
        self.server = Some(server);
        Ok(())
    }

    /// Check if the server is initialized
    pub fn is_initialized(&self) -> bool {
        self.server.is_some()
    }

    /// Register every service and serve until shutdown
    pub fn run(&mut self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut server = self
            .server
            .take()
            .ok_or("Server not initialized. Call initialize() first.")?;
        server.bootstrap();

        let components = Components::build(&self.config)?;

        for (port, addr) in self
            .config
            .gateway
            .ports
            .iter()
            .zip(self.config.listen_addrs())
        {
            let mut proxy = http_proxy_service(
                &server.configuration,
                components.proxy(&self.config, *port),
            );
            proxy.add_tcp(&addr);
            server.add_service(proxy);
            info!(port, addr = %addr, "Router listening");
        }

        if self.config.monitor.enabled {
            let monitor = background_service(
                "health-monitor",
                components.health_monitor(&self.config),
            );
            server.add_service(monitor);
            info!(
                interval_sec = self.config.monitor.interval_sec,
                "Health monitor scheduled"
            );
        } else {
            info!("Health monitor disabled");
        }

        if self.config.metrics.enabled {
            let mut metrics = Service::new(
                "Prometheus metrics".to_string(),
                MetricsApp::new(Arc::clone(&components.metrics)),
            );
            metrics.add_tcp(&self.config.metrics.listen_addr);
            server.add_service(metrics);
            info!(addr = %self.config.metrics.listen_addr, "Metrics endpoint listening");
        }

        info!(
            default_group = %self.config.gateway.default_routing_group,
            "Trino gateway started"
        );
        server.run_forever();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagementConfig;
    use crate::core::{Backend, RoutingGroup, RoutingStrategy, Scheme};

    fn static_config() -> Config {
        let mut config = Config::default();
        config.management = ManagementConfig::Static {
            backends: vec![Backend::new("b1", "trino-1:8080", Scheme::Http)],
            groups: vec![RoutingGroup {
                id: config.gateway.default_routing_group.clone(),
                enabled: true,
                backends: vec!["b1".to_string()],
                strategy: RoutingStrategy::Random,
            }],
            policies: Vec::new(),
        };
        config
    }

    #[test]
    fn test_gateway_creation() {
        let gateway = Gateway::new(static_config());
        assert!(!gateway.is_initialized());
        assert_eq!(gateway.config().gateway.ports, vec![8080]);
    }

    #[test]
    fn test_run_requires_initialize() {
        let mut gateway = Gateway::new(static_config());
        let err = gateway.run().unwrap_err();
        assert!(err.to_string().contains("not initialized"));
    }

    #[test]
    fn test_initialize_rejects_invalid_config() {
        let mut config = static_config();
        config.gateway.ports.clear();
        let mut gateway = Gateway::new(config);
        tokio_test::assert_err!(gateway.initialize(None));
        assert!(!gateway.is_initialized());
    }

    #[tokio::test]
    async fn test_components_from_static_catalog() {
        let config = static_config();
        let components = Components::build(&config).unwrap();

        let backends = components.api.list_all_backends().await.unwrap();
        assert_eq!(backends.len(), 1);
        assert!(components.metrics.render().is_ok());
    }

    #[tokio::test]
    async fn test_components_with_validator() {
        let mut config = static_config();
        config.auth.validation_url = Some("http://auth.internal/validate".to_string());
        config.auth.service_accounts = vec!["svc".to_string()];
        tokio_test::assert_ok!(Components::build(&config));
    }
}
