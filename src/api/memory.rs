/// In-memory management catalog
use crate::api::GatewayApi;
use crate::core::balancer::{self, RoundRobin};
use crate::core::{
    Backend, BackendAssignment, ClientAttributes, Policy, QueryRecord, RoutingGroup,
};
use crate::error::ApiError;
use crate::policy::{self, GroupSet};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Backends, groups, policies and query records held in process
pub struct InMemoryCatalog {
    default_group: String,
    backends: RwLock<HashMap<String, Backend>>,
    groups: RwLock<HashMap<String, RoutingGroup>>,
    policies: RwLock<Vec<Policy>>,
    queries: RwLock<HashMap<String, QueryRecord>>,
    cursors: Mutex<HashMap<String, Arc<RoundRobin>>>,
}

impl InMemoryCatalog {
    pub fn new<S: Into<String>>(default_group: S) -> Self {
        Self::with_catalog(default_group, Vec::new(), Vec::new(), Vec::new())
    }

    pub fn with_catalog<S: Into<String>>(
        default_group: S,
        backends: Vec<Backend>,
        groups: Vec<RoutingGroup>,
        policies: Vec<Policy>,
    ) -> Self {
        Self {
            default_group: default_group.into(),
            backends: RwLock::new(backends.into_iter().map(|b| (b.id.clone(), b)).collect()),
            groups: RwLock::new(groups.into_iter().map(|g| (g.id.clone(), g)).collect()),
            policies: RwLock::new(policies),
            queries: RwLock::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Add or replace a backend
    pub async fn add_backend(&self, backend: Backend) {
        let mut backends = self.backends.write().await;
        backends.insert(backend.id.clone(), backend);
    }

    /// Remove a backend from the catalog
    pub async fn remove_backend(&self, backend_id: &str) -> Option<Backend> {
        let mut backends = self.backends.write().await;
        backends.remove(backend_id)
    }

    /// Add or replace a routing group
    pub async fn add_group(&self, group: RoutingGroup) {
        let mut groups = self.groups.write().await;
        groups.insert(group.id.clone(), group);
    }

    pub async fn add_policy(&self, policy: Policy) {
        let mut policies = self.policies.write().await;
        policies.retain(|p| p.id != policy.id);
        policies.push(policy);
    }

    pub async fn get_query(&self, query_id: &str) -> Option<QueryRecord> {
        let queries = self.queries.read().await;
        queries.get(query_id).cloned()
    }

    fn cursor(&self, group_id: &str) -> Arc<RoundRobin> {
        let mut cursors = self.cursors.lock();
        Arc::clone(
            cursors
                .entry(group_id.to_string())
                .or_insert_with(|| Arc::new(RoundRobin::new())),
        )
    }

    /// Pick a routable member of `group_id` with the group's strategy
    async fn select_from_group(&self, group_id: &str) -> Option<BackendAssignment> {
        let group = {
            let groups = self.groups.read().await;
            groups.get(group_id).filter(|g| g.enabled).cloned()
        }?;

        let members = {
            let backends = self.backends.read().await;
            balancer::routable_members(group.backends.iter().filter_map(|id| backends.get(id)))
        };

        let cursor = self.cursor(&group.id);
        balancer::select(group.strategy, &cursor, &members).map(|backend| BackendAssignment {
            backend_id: backend.id.clone(),
            group_id: group.id.clone(),
        })
    }

    async fn set_health(&self, id: &str, healthy: bool) -> Result<(), ApiError> {
        let mut backends = self.backends.write().await;
        let backend = backends
            .get_mut(id)
            .ok_or_else(|| ApiError::not_found(format!("backend {}", id)))?;
        backend.healthy = healthy;
        Ok(())
    }
}

#[async_trait]
impl GatewayApi for InMemoryCatalog {
    async fn get_backend(&self, id: &str) -> Result<Backend, ApiError> {
        let backends = self.backends.read().await;
        backends
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::not_found(format!("backend {}", id)))
    }

    async fn list_all_backends(&self) -> Result<Vec<Backend>, ApiError> {
        let backends = self.backends.read().await;
        let mut all: Vec<Backend> = backends.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn mark_healthy_backend(&self, id: &str) -> Result<(), ApiError> {
        self.set_health(id, true).await
    }

    async fn mark_unhealthy_backend(&self, id: &str) -> Result<(), ApiError> {
        self.set_health(id, false).await
    }

    async fn update_cluster_load(&self, id: &str, load: i32) -> Result<(), ApiError> {
        let mut backends = self.backends.write().await;
        let backend = backends
            .get_mut(id)
            .ok_or_else(|| ApiError::not_found(format!("backend {}", id)))?;
        backend.cluster_load = load;
        Ok(())
    }

    async fn evaluate_groups_for_client(
        &self,
        attrs: &ClientAttributes,
    ) -> Result<GroupSet, ApiError> {
        let policies = self.policies.read().await;
        Ok(policy::evaluate_groups_for_client(&policies, attrs))
    }

    async fn evaluate_backend_for_groups(
        &self,
        group_ids: &[String],
    ) -> Result<BackendAssignment, ApiError> {
        for group_id in group_ids {
            if let Some(assignment) = self.select_from_group(group_id).await {
                debug!(
                    group_id = %assignment.group_id,
                    backend_id = %assignment.backend_id,
                    "Backend evaluated for groups"
                );
                return Ok(assignment);
            }
        }

        let fallbacks = {
            let policies = self.policies.read().await;
            policy::fallback_groups(&policies, group_ids)
        };
        for group_id in &fallbacks {
            if let Some(assignment) = self.select_from_group(group_id).await {
                warn!(
                    groups = ?group_ids,
                    fallback_group = %group_id,
                    backend_id = %assignment.backend_id,
                    "No eligible backends available, invoking policy fallback group"
                );
                return Ok(assignment);
            }
        }

        if !group_ids.iter().chain(&fallbacks).any(|g| g == &self.default_group) {
            warn!(
                groups = ?group_ids,
                default_group = %self.default_group,
                "No eligible backends available, invoking default group routing"
            );
            if let Some(assignment) = self.select_from_group(&self.default_group).await {
                return Ok(assignment);
            }
        }

        Err(ApiError::no_eligible_backend(format!(
            "no enabled and healthy backend in groups {:?}",
            group_ids
        )))
    }

    async fn evaluate_auth_delegation_for_client(&self, port: u16) -> Result<bool, ApiError> {
        let policies = self.policies.read().await;
        Ok(policy::evaluate_auth_delegation(&policies, port))
    }

    async fn evaluate_request_source_for_client(
        &self,
        port: u16,
    ) -> Result<Option<String>, ApiError> {
        let policies = self.policies.read().await;
        Ok(policy::evaluate_request_source(&policies, port))
    }

    async fn find_backend_for_query(
        &self,
        query_id: &str,
    ) -> Result<BackendAssignment, ApiError> {
        let queries = self.queries.read().await;
        queries
            .get(query_id)
            .map(|q| BackendAssignment {
                backend_id: q.backend_id.clone(),
                group_id: q.group_id.clone(),
            })
            .ok_or_else(|| ApiError::not_found(format!("query {}", query_id)))
    }

    async fn create_or_update_query(&self, query: &QueryRecord) -> Result<(), ApiError> {
        if query.id.is_empty() {
            return Err(ApiError::Rejected {
                code: "invalid_argument".to_string(),
                message: "query id is required".to_string(),
            });
        }
        let mut queries = self.queries.write().await;
        queries.insert(query.id.clone(), query.clone());
        Ok(())
    }
}
