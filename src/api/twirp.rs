/// Remote management API client speaking twirp JSON
///
/// Every call is `POST {url}/twirp/gateway.v1.<Service>/<Method>` with a
/// camelCase JSON body and the shared service token header. Twirp errors
/// come back as non-2xx responses carrying `{"code": .., "msg": ..}`.
use crate::api::GatewayApi;
use crate::core::{Backend, BackendAssignment, ClientAttributes, QueryRecord, Scheme};
use crate::error::ApiError;
use crate::policy::GroupSet;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const TWIRP_PACKAGE: &str = "gateway.v1";

const BACKEND_API: &str = "BackendApi";
const GROUP_API: &str = "GroupApi";
const POLICY_API: &str = "PolicyApi";
const QUERY_API: &str = "QueryApi";

/// Management API client
pub struct TwirpClient {
    base_url: String,
    token: String,
    token_header: String,
    client: reqwest::Client,
}

impl TwirpClient {
    pub fn new(
        base_url: &str,
        token: &str,
        token_header: &str,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::unreachable(format!("unable to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            token_header: token_header.to_string(),
            client,
        })
    }

    fn method_url(&self, service: &str, method: &str) -> String {
        format!(
            "{}/twirp/{}.{}/{}",
            self.base_url, TWIRP_PACKAGE, service, method
        )
    }

    async fn call<Req, Resp>(&self, service: &str, method: &str, req: &Req) -> Result<Resp, ApiError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = self.method_url(service, method);
        debug!(url = %url, "Calling management API");

        let response = self
            .client
            .post(&url)
            .header(self.token_header.as_str(), self.token.as_str())
            .json(req)
            .send()
            .await
            .map_err(|e| ApiError::unreachable(format!("{}/{}: {}", service, method, e)))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ApiError::unreachable(format!("{}/{}: {}", service, method, e)))?;

        if !status.is_success() {
            return Err(twirp_error(status.as_u16(), &body));
        }

        serde_json::from_slice(&body)
            .map_err(|e| ApiError::decode(format!("{}/{}: {}", service, method, e)))
    }
}

/// Map a twirp error response onto the API error taxonomy
fn twirp_error(status: u16, body: &[u8]) -> ApiError {
    let error: TwirpErrorBody = serde_json::from_slice(body).unwrap_or_else(|_| TwirpErrorBody {
        code: String::new(),
        msg: String::from_utf8_lossy(body).into_owned(),
    });

    match error.code.as_str() {
        "not_found" | "bad_route" => ApiError::not_found(error.msg),
        "unavailable" | "deadline_exceeded" | "canceled" => ApiError::unreachable(error.msg),
        "" if status >= 500 => ApiError::unreachable(format!("HTTP {}: {}", status, error.msg)),
        "" => ApiError::Rejected {
            code: status.to_string(),
            message: error.msg,
        },
        code => ApiError::Rejected {
            code: code.to_string(),
            message: error.msg,
        },
    }
}

#[derive(Debug, Deserialize)]
struct TwirpErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    msg: String,
}

#[derive(Debug, Default, Deserialize)]
struct Empty {}

#[derive(Debug, Serialize)]
struct IdRequest<'a> {
    id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateClusterLoadRequest<'a> {
    id: &'a str,
    cluster_load: i32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateGroupsRequest<'a> {
    incoming_port: u16,
    host: &'a str,
    header_client_tags: &'a str,
    header_connection_properties: &'a str,
}

/// Eligible groups; an empty, unconstrained reply means "any group"
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct EvaluateGroupsResponse {
    group_ids: Vec<String>,
    constrained: bool,
}

impl From<EvaluateGroupsResponse> for GroupSet {
    fn from(resp: EvaluateGroupsResponse) -> Self {
        if resp.constrained || !resp.group_ids.is_empty() {
            GroupSet::only(resp.group_ids)
        } else {
            GroupSet::Unconstrained
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateBackendRequest<'a> {
    group_ids: &'a [String],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PortRequest {
    incoming_port: u16,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AuthDelegationResponse {
    is_auth_delegated: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RequestSourceResponse {
    set_request_source: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FindBackendForQueryRequest<'a> {
    query_id: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AssignmentResponse {
    backend_id: String,
    group_id: String,
}

impl From<AssignmentResponse> for BackendAssignment {
    fn from(resp: AssignmentResponse) -> Self {
        BackendAssignment {
            backend_id: resp.backend_id,
            group_id: resp.group_id,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GetBackendResponse {
    backend: Option<BackendDto>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListBackendsResponse {
    items: Vec<BackendDto>,
    backends: Vec<BackendDto>,
}

/// Backend as the management services encode it; defaults are omitted on the wire
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BackendDto {
    id: String,
    hostname: String,
    scheme: String,
    external_url: String,
    is_enabled: bool,
    is_healthy: bool,
    uptime_schedule: String,
    cluster_load: i32,
    threshold_cluster_load: i32,
}

impl From<BackendDto> for Backend {
    fn from(dto: BackendDto) -> Self {
        let scheme = if dto.scheme.eq_ignore_ascii_case("https") {
            Scheme::Https
        } else {
            Scheme::Http
        };
        let mut backend = Backend::new(dto.id, dto.hostname, scheme);
        if !dto.external_url.is_empty() {
            backend.external_url = dto.external_url;
        }
        if !dto.uptime_schedule.is_empty() {
            backend.uptime_schedule = dto.uptime_schedule;
        }
        backend.enabled = dto.is_enabled;
        backend.healthy = dto.is_healthy;
        backend.cluster_load = dto.cluster_load;
        backend.threshold_cluster_load = dto.threshold_cluster_load;
        backend
    }
}

#[derive(Debug, Serialize)]
struct CreateOrUpdateQueryRequest<'a> {
    query: QueryDto<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryDto<'a> {
    id: &'a str,
    text: &'a str,
    client_ip: &'a str,
    group_id: &'a str,
    backend_id: &'a str,
    username: &'a str,
    received_at: i64,
    submitted_at: i64,
    server_host: &'a str,
}

impl<'a> From<&'a QueryRecord> for QueryDto<'a> {
    fn from(q: &'a QueryRecord) -> Self {
        QueryDto {
            id: &q.id,
            text: &q.text,
            client_ip: &q.client_ip,
            group_id: &q.group_id,
            backend_id: &q.backend_id,
            username: &q.username,
            received_at: q.received_at,
            submitted_at: q.submitted_at,
            server_host: &q.server_host,
        }
    }
}

#[async_trait]
impl GatewayApi for TwirpClient {
    async fn get_backend(&self, id: &str) -> Result<Backend, ApiError> {
        let resp: GetBackendResponse = self
            .call(BACKEND_API, "GetBackend", &IdRequest { id })
            .await?;
        resp.backend
            .map(Backend::from)
            .ok_or_else(|| ApiError::not_found(format!("backend {}", id)))
    }

    async fn list_all_backends(&self) -> Result<Vec<Backend>, ApiError> {
        let resp: ListBackendsResponse = self
            .call(BACKEND_API, "ListAllBackends", &serde_json::json!({}))
            .await?;
        let dtos = if resp.items.is_empty() {
            resp.backends
        } else {
            resp.items
        };
        Ok(dtos.into_iter().map(Backend::from).collect())
    }

    async fn mark_healthy_backend(&self, id: &str) -> Result<(), ApiError> {
        let _: Empty = self
            .call(BACKEND_API, "MarkHealthyBackend", &IdRequest { id })
            .await?;
        Ok(())
    }

    async fn mark_unhealthy_backend(&self, id: &str) -> Result<(), ApiError> {
        let _: Empty = self
            .call(BACKEND_API, "MarkUnhealthyBackend", &IdRequest { id })
            .await?;
        Ok(())
    }

    async fn update_cluster_load(&self, id: &str, load: i32) -> Result<(), ApiError> {
        let req = UpdateClusterLoadRequest {
            id,
            cluster_load: load,
        };
        let _: Empty = self.call(BACKEND_API, "UpdateClusterLoad", &req).await?;
        Ok(())
    }

    async fn evaluate_groups_for_client(
        &self,
        attrs: &ClientAttributes,
    ) -> Result<GroupSet, ApiError> {
        let req = EvaluateGroupsRequest {
            incoming_port: attrs.port,
            host: &attrs.host,
            header_client_tags: &attrs.client_tags,
            header_connection_properties: &attrs.connection_properties,
        };
        let resp: EvaluateGroupsResponse =
            self.call(POLICY_API, "EvaluateGroupsForClient", &req).await?;
        Ok(resp.into())
    }

    async fn evaluate_backend_for_groups(
        &self,
        group_ids: &[String],
    ) -> Result<BackendAssignment, ApiError> {
        let req = EvaluateBackendRequest { group_ids };
        let resp: AssignmentResponse = self
            .call(GROUP_API, "EvaluateBackendForGroups", &req)
            .await
            .map_err(|e| match e {
                ApiError::NotFound { message } => ApiError::no_eligible_backend(message),
                other => other,
            })?;

        if resp.backend_id.is_empty() {
            return Err(ApiError::no_eligible_backend(format!(
                "no backend for groups {:?}",
                group_ids
            )));
        }
        Ok(resp.into())
    }

    async fn evaluate_auth_delegation_for_client(&self, port: u16) -> Result<bool, ApiError> {
        let req = PortRequest {
            incoming_port: port,
        };
        let resp: AuthDelegationResponse = self
            .call(POLICY_API, "EvaluateAuthDelegationForClient", &req)
            .await?;
        Ok(resp.is_auth_delegated)
    }

    async fn evaluate_request_source_for_client(
        &self,
        port: u16,
    ) -> Result<Option<String>, ApiError> {
        let req = PortRequest {
            incoming_port: port,
        };
        let resp: RequestSourceResponse = self
            .call(POLICY_API, "EvaluateRequestSourceForClient", &req)
            .await?;
        Ok(Some(resp.set_request_source).filter(|s| !s.is_empty()))
    }

    async fn find_backend_for_query(
        &self,
        query_id: &str,
    ) -> Result<BackendAssignment, ApiError> {
        let req = FindBackendForQueryRequest { query_id };
        let resp: AssignmentResponse = self.call(QUERY_API, "FindBackendForQuery", &req).await?;
        if resp.backend_id.is_empty() {
            return Err(ApiError::not_found(format!("query {}", query_id)));
        }
        Ok(resp.into())
    }

    async fn create_or_update_query(&self, query: &QueryRecord) -> Result<(), ApiError> {
        let req = CreateOrUpdateQueryRequest {
            query: QueryDto::from(query),
        };
        let _: Empty = self.call(QUERY_API, "CreateOrUpdateQuery", &req).await?;
        Ok(())
    }
}
