/// Management API contract
///
/// The router and the monitor only ever talk to backends, groups, policies
/// and query records through [`GatewayApi`]. `twirp` reaches the remote
/// management services, `memory` serves a catalog held in process.
pub mod memory;
pub mod twirp;

use crate::config::ManagementConfig;
use crate::core::{Backend, BackendAssignment, ClientAttributes, QueryRecord};
use crate::error::ApiError;
use crate::policy::GroupSet;
use async_trait::async_trait;
use std::sync::Arc;

pub use memory::InMemoryCatalog;
pub use twirp::TwirpClient;

/// Calls the gateway makes against the management services
#[async_trait]
pub trait GatewayApi: Send + Sync {
    async fn get_backend(&self, id: &str) -> Result<Backend, ApiError>;

    async fn list_all_backends(&self) -> Result<Vec<Backend>, ApiError>;

    async fn mark_healthy_backend(&self, id: &str) -> Result<(), ApiError>;

    async fn mark_unhealthy_backend(&self, id: &str) -> Result<(), ApiError>;

    async fn update_cluster_load(&self, id: &str, load: i32) -> Result<(), ApiError>;

    async fn evaluate_groups_for_client(
        &self,
        attrs: &ClientAttributes,
    ) -> Result<GroupSet, ApiError>;

    /// Reduce candidate groups to one backend using each group's strategy
    async fn evaluate_backend_for_groups(
        &self,
        group_ids: &[String],
    ) -> Result<BackendAssignment, ApiError>;

    async fn evaluate_auth_delegation_for_client(&self, port: u16) -> Result<bool, ApiError>;

    async fn evaluate_request_source_for_client(
        &self,
        port: u16,
    ) -> Result<Option<String>, ApiError>;

    /// Backend and group that currently own `query_id`
    async fn find_backend_for_query(&self, query_id: &str)
        -> Result<BackendAssignment, ApiError>;

    async fn create_or_update_query(&self, query: &QueryRecord) -> Result<(), ApiError>;
}

/// Build the management API client for the configured mode
pub fn from_config(
    config: &ManagementConfig,
    default_group: &str,
) -> Result<Arc<dyn GatewayApi>, ApiError> {
    match config {
        ManagementConfig::Remote {
            url,
            token,
            token_header,
            timeout_sec,
        } => Ok(Arc::new(TwirpClient::new(
            url,
            token,
            token_header,
            std::time::Duration::from_secs(*timeout_sec),
        )?)),
        ManagementConfig::Static {
            backends,
            groups,
            policies,
        } => Ok(Arc::new(InMemoryCatalog::with_catalog(
            default_group,
            backends.clone(),
            groups.clone(),
            policies.clone(),
        ))),
    }
}
