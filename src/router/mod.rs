/// Request routing and reverse proxying
///
/// [`RequestRouter`] runs the transport independent steps: authenticate,
/// classify, validate and resolve a backend. [`GatewayProxy`] plugs those
/// steps into pingora's `ProxyHttp` callbacks, one instance per listening
/// port. Everything a single request needs between callbacks lives in its
/// own [`RequestCtx`].
pub mod auth;
pub mod headers;
pub mod request;

use crate::api::GatewayApi;
use crate::config::GatewayConfig;
use crate::core::{strip_port, with_default_port, Backend, BackendAssignment, ClientAttributes};
use crate::core::{QueryRecord, Scheme};
use crate::error::{ApiError, ErrorPhase, GatewayError, GatewayResult, RequestError};
use crate::metrics::GatewayMetrics;
use crate::utils;
use async_trait::async_trait;
use auth::{AuthGate, AuthOutcome};
use bytes::{Bytes, BytesMut};
use http::header;
use lazy_static::lazy_static;
use pingora::http::{RequestHeader, ResponseHeader};
use pingora::proxy::{ProxyHttp, Session};
use pingora::upstreams::peer::HttpPeer;
use pingora::{Error, ErrorSource, ErrorType, Result};
use regex::Regex;
use request::{ClientRequest, RequestParts};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

lazy_static! {
    static ref LOCATION_AUTHORITY: Regex =
        Regex::new(r"\w+://[^/]*(.*)").expect("location rewrite pattern");
}

/// Upper bound on a response body kept for query id extraction
const MAX_CAPTURED_RESPONSE_BYTES: usize = 1024 * 1024;

/// Backend a request is forwarded to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub backend: Backend,
    pub group_id: String,
    /// Sent as `Host` and `X-Forwarded-Host`
    pub host: String,
    /// Client source override from the port's policy
    pub request_source: Option<String>,
}

impl Route {
    fn new(
        backend: Backend,
        group_id: String,
        request: &ClientRequest,
        request_source: Option<String>,
    ) -> Self {
        // UI pages are served from the cluster's externally reachable URL
        let host = match request {
            ClientRequest::Ui { .. } => backend.external_host().to_string(),
            _ => backend.hostname.clone(),
        };
        Self {
            backend,
            group_id,
            host,
            request_source,
        }
    }

    /// `host:port` to connect to
    pub fn authority(&self) -> String {
        with_default_port(&self.host, self.backend.scheme.default_port())
    }

    /// TLS server name
    pub fn sni(&self) -> String {
        strip_port(&self.host)
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string()
    }
}

/// Authentication, classification and backend resolution
pub struct RequestRouter {
    api: Arc<dyn GatewayApi>,
    auth: AuthGate,
    default_group: String,
}

impl RequestRouter {
    pub fn new<S: Into<String>>(api: Arc<dyn GatewayApi>, auth: AuthGate, default_group: S) -> Self {
        Self {
            api,
            auth,
            default_group: default_group.into(),
        }
    }

    pub fn api(&self) -> &Arc<dyn GatewayApi> {
        &self.api
    }

    pub async fn authorize(&self, port: u16, headers: &http::HeaderMap) -> GatewayResult<AuthOutcome> {
        self.auth.check(port, headers).await
    }

    /// Classify, validate and resolve a request to a backend
    ///
    /// Query records on the returned request carry the resolved group,
    /// backend and server host.
    pub async fn route(
        &self,
        parts: &RequestParts<'_>,
        body: &str,
    ) -> GatewayResult<(ClientRequest, Route)> {
        let mut request = request::classify(parts, body)?;
        request.validate()?;
        debug!(kind = request.kind(), port = parts.port, "Request classified");

        let (backend, group_id) = self.resolve(&request).await?;
        if let Some(query) = request.query_mut() {
            query.backend_id = backend.id.clone();
            query.group_id = group_id.clone();
            query.server_host = backend.external_base_url();
        }

        let request_source = self.api.evaluate_request_source_for_client(parts.port).await?;
        let route = Route::new(backend, group_id, &request, request_source);
        info!(
            kind = request.kind(),
            port = parts.port,
            group_id = %route.group_id,
            backend_id = %route.backend.id,
            host = %route.host,
            "Request ready to be forwarded"
        );
        Ok((request, route))
    }

    async fn resolve(&self, request: &ClientRequest) -> GatewayResult<(Backend, String)> {
        let assignment = match request {
            ClientRequest::Api => {
                self.api
                    .evaluate_backend_for_groups(&[self.default_group.clone()])
                    .await?
            }
            ClientRequest::Ui { query_id } => self.find_owner(query_id).await?,
            ClientRequest::QueryApi(req) => self.find_owner(&req.query.id).await?,
            ClientRequest::Query(req) if !req.query.id.is_empty() => {
                match self.find_owner(&req.query.id).await {
                    Ok(assignment) => assignment,
                    Err(ApiError::NotFound { .. }) => {
                        warn!(
                            query_id = %req.query.id,
                            "Owner of killed query unknown, ignoring extracted query id"
                        );
                        self.evaluate_policies(&req.attrs).await?
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            ClientRequest::Query(req) => self.evaluate_policies(&req.attrs).await?,
        };

        let backend = self.api.get_backend(&assignment.backend_id).await.map_err(|e| {
            error!(backend_id = %assignment.backend_id, error = %e, "Unable to fetch resolved backend");
            e
        })?;
        Ok((backend, assignment.group_id))
    }

    async fn find_owner(&self, query_id: &str) -> Result<BackendAssignment, ApiError> {
        self.api.find_backend_for_query(query_id).await.map_err(|e| {
            warn!(query_id = %query_id, error = %e, "Backend unresolvable for query");
            e
        })
    }

    async fn evaluate_policies(&self, attrs: &ClientAttributes) -> GatewayResult<BackendAssignment> {
        let groups = self.api.evaluate_groups_for_client(attrs).await.map_err(|e| {
            error!(
                port = attrs.port,
                host = %attrs.host,
                client_tags = %attrs.client_tags,
                error = %e,
                "Group resolution failed"
            );
            e
        })?;

        let candidates = groups.resolve(&self.default_group);
        if candidates.is_empty() {
            warn!(
                port = attrs.port,
                host = %attrs.host,
                client_tags = %attrs.client_tags,
                connection_properties = %attrs.connection_properties,
                "Policies matched no common group"
            );
            return Err(GatewayError::NoEligibleGroup {
                port: attrs.port,
                host: attrs.host.clone(),
            });
        }

        debug!(groups = ?candidates, "Evaluating backend for groups");
        let assignment = self.api.evaluate_backend_for_groups(&candidates).await?;
        Ok(assignment)
    }
}

/// Point an absolute redirect at the gateway instead of the backend
pub fn rewrite_location(location: &str, scheme: Scheme, hostname: &str) -> String {
    let replacement = format!("{}://{}${{1}}", scheme, hostname);
    LOCATION_AUTHORITY
        .replace(location, replacement.as_str())
        .into_owned()
}

/// Point a forwarded request at its backend
///
/// Host and X-Forwarded-Host name the backend. A policy source override
/// replaces whatever source the client sent under either prefix.
pub fn rewrite_upstream_headers(
    req: &mut RequestHeader,
    route: &Route,
    strip_authorization: bool,
) -> Result<()> {
    req.insert_header(header::HOST, route.host.as_str())?;
    req.insert_header("X-Forwarded-Host", route.host.as_str())?;
    if let Some(source) = &route.request_source {
        for name in headers::names(headers::SOURCE) {
            req.remove_header(name.as_str());
        }
        req.insert_header(headers::TRINO_SOURCE, source.as_str())?;
    }
    if strip_authorization {
        req.remove_header(&header::AUTHORIZATION);
    }
    Ok(())
}

/// Gateway error for a failure pingora raised while proxying
///
/// Connection failures belong to the transport phase even when they
/// surface before the request context has moved past pre-routing.
pub fn proxy_failure<S: Into<String>>(
    phase: ErrorPhase,
    etype: &ErrorType,
    message: S,
) -> GatewayError {
    let phase = match etype {
        ErrorType::ConnectTimedout
        | ErrorType::ConnectRefused
        | ErrorType::ConnectNoRoute
        | ErrorType::ConnectError
        | ErrorType::TLSHandshakeFailure
        | ErrorType::TLSHandshakeTimedout => ErrorPhase::Transport,
        _ => phase,
    };
    match phase {
        ErrorPhase::Transport => GatewayError::transport(message),
        ErrorPhase::PostRouting => GatewayError::post_routing(message),
        ErrorPhase::PreRouting => GatewayError::internal(message),
    }
}

/// Status answered when proxying fails, 0 when the client is gone
pub fn failure_status(phase: ErrorPhase, etype: &ErrorType, esource: &ErrorSource) -> u16 {
    match etype {
        ErrorType::HTTPStatus(code) => *code,
        _ if matches!(esource, ErrorSource::Downstream) => 0,
        _ => proxy_failure(phase, etype, String::new()).http_status(),
    }
}

/// Query id assigned by the backend in a statement response
pub fn extract_query_id_from_response(body: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()?
        .get("id")?
        .as_str()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Persist a query record once the backend has assigned its id
///
/// Runs detached from the client response; failures only reach the logs.
pub fn spawn_query_persistence(
    api: Arc<dyn GatewayApi>,
    mut query: QueryRecord,
    body: Bytes,
    content_encoding: Option<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let text = match utils::decode_body(&body, content_encoding.as_deref()) {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "Unable to decode backend response");
                return;
            }
        };
        let Some(query_id) = extract_query_id_from_response(&text) else {
            warn!(backend_id = %query.backend_id, "Backend response carries no query id");
            return;
        };

        query.id = query_id;
        query.submitted_at = utils::epoch_seconds();
        match api.create_or_update_query(&query).await {
            Ok(()) => debug!(query_id = %query.id, "Query saved"),
            Err(e) => error!(query_id = %query.id, error = %e, "Unable to save query"),
        }
    })
}

struct ResponseCapture {
    body: BytesMut,
    content_encoding: Option<String>,
    overflowed: bool,
}

/// Per-request correlation record
///
/// Created by `new_ctx` for every request and dropped with it, so nothing
/// here can be observed by another request.
pub struct RequestCtx {
    received_at: Instant,
    method: String,
    phase: ErrorPhase,
    request: Option<ClientRequest>,
    route: Option<Route>,
    strip_authorization: bool,
    response_started: Option<Instant>,
    capture: Option<ResponseCapture>,
    failure_recorded: bool,
}

impl RequestCtx {
    pub fn new() -> Self {
        Self {
            received_at: Instant::now(),
            method: String::new(),
            phase: ErrorPhase::PreRouting,
            request: None,
            route: None,
            strip_authorization: false,
            response_started: None,
            capture: None,
            failure_recorded: false,
        }
    }

    pub fn phase(&self) -> ErrorPhase {
        self.phase
    }

    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }
}

impl Default for RequestCtx {
    fn default() -> Self {
        Self::new()
    }
}

/// Reverse proxy for one listening port
pub struct GatewayProxy {
    port: u16,
    router: Arc<RequestRouter>,
    metrics: Arc<GatewayMetrics>,
    external_scheme: Scheme,
    external_hostname: String,
    max_body_bytes: usize,
}

impl GatewayProxy {
    pub fn new(
        port: u16,
        router: Arc<RequestRouter>,
        metrics: Arc<GatewayMetrics>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            port,
            router,
            metrics,
            external_scheme: config.external_scheme,
            external_hostname: config.external_hostname.clone(),
            max_body_bytes: config.max_request_body_bytes,
        }
    }

    async fn prepare(&self, session: &mut Session, ctx: &mut RequestCtx) -> GatewayResult<()> {
        let outcome = self
            .router
            .authorize(self.port, &session.req_header().headers)
            .await?;
        if let AuthOutcome::Authenticated {
            username,
            basic_auth,
        } = outcome
        {
            debug!(username = %username, "User authenticated");
            ctx.strip_authorization = basic_auth;
        }

        let body = if request::needs_body(&session.req_header().method) {
            self.read_body(session).await?
        } else {
            String::new()
        };

        let client_ip = session
            .client_addr()
            .and_then(|addr| addr.as_inet())
            .map(|addr| addr.ip().to_string())
            .unwrap_or_default();
        let req = session.req_header();
        let parts = RequestParts {
            method: &req.method,
            uri: &req.uri,
            headers: &req.headers,
            client_ip: &client_ip,
            port: self.port,
        };

        let (request, route) = self.router.route(&parts, &body).await?;
        ctx.request = Some(request);
        ctx.route = Some(route);
        Ok(())
    }

    /// Read the whole body into pingora's retry buffer so it is still
    /// forwarded upstream, and decode it for inspection
    async fn read_body(&self, session: &mut Session) -> GatewayResult<String> {
        session.enable_retry_buffering();

        let mut body = BytesMut::new();
        while let Some(chunk) = session
            .read_request_body()
            .await
            .map_err(|e| RequestError::Body {
                message: e.to_string(),
            })?
        {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(RequestError::BodyTooLarge {
                    limit: self.max_body_bytes,
                }
                .into());
            }
            body.extend_from_slice(&chunk);
        }

        let encoding = session
            .req_header()
            .headers
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = utils::decode_body(&body, encoding.as_deref()).map_err(|e| RequestError::Body {
            message: e.to_string(),
        })?;
        Ok(text)
    }

    async fn reject(
        &self,
        session: &mut Session,
        ctx: &mut RequestCtx,
        e: &GatewayError,
    ) -> Result<()> {
        let status = e.http_status();
        let phase = e.phase();
        warn!(
            port = self.port,
            phase = %phase,
            status,
            severity = %e.severity(),
            recoverable = e.is_recoverable(),
            error = %e,
            "Request rejected"
        );
        self.metrics.record_routing_failure(phase.as_str());
        ctx.failure_recorded = true;
        write_error(session, status, &e.to_string()).await
    }
}

async fn write_error(session: &mut Session, status: u16, message: &str) -> Result<()> {
    let body = Bytes::from(format!("{}\n", message));
    let mut resp = ResponseHeader::build(status, Some(2))?;
    resp.insert_header(header::CONTENT_TYPE, "text/plain; charset=utf-8")?;
    resp.insert_header(header::CONTENT_LENGTH, body.len().to_string())?;
    session.write_response_header(Box::new(resp), false).await?;
    session.write_response_body(Some(body), true).await
}

#[async_trait]
impl ProxyHttp for GatewayProxy {
    type CTX = RequestCtx;

    fn new_ctx(&self) -> Self::CTX {
        RequestCtx::new()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        ctx.method = session.req_header().method.to_string();
        self.metrics.record_request(&ctx.method, self.port);

        match self.prepare(session, ctx).await {
            Ok(()) => Ok(false),
            Err(e) => {
                self.reject(session, ctx, &e).await?;
                Ok(true)
            }
        }
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let route = ctx.route.as_ref().ok_or_else(|| {
            Error::explain(
                ErrorType::InternalError,
                "request reached upstream selection without a route",
            )
        })?;

        ctx.phase = ErrorPhase::Transport;
        let authority = route.authority();
        let addr = tokio::net::lookup_host(authority.as_str())
            .await
            .map_err(|e| {
                Error::because(
                    ErrorType::ConnectNoRoute,
                    format!("resolving {}", authority),
                    e,
                )
            })?
            .next()
            .ok_or_else(|| {
                Error::explain(
                    ErrorType::ConnectNoRoute,
                    format!("no address for {}", authority),
                )
            })?;

        self.metrics
            .observe_pre_routing(&ctx.method, ctx.received_at.elapsed());
        self.metrics
            .record_routed(&ctx.method, self.port, &route.group_id, &route.backend.id);

        let peer = HttpPeer::new(addr, route.backend.scheme.is_tls(), route.sni());
        Ok(Box::new(peer))
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        match ctx.route.as_ref() {
            Some(route) => rewrite_upstream_headers(upstream_request, route, ctx.strip_authorization),
            None => Ok(()),
        }
    }

    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        ctx.phase = ErrorPhase::PostRouting;
        ctx.response_started = Some(Instant::now());

        let status = upstream_response.status;
        if status.is_success() {
            let location = upstream_response
                .headers
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            if let Some(location) = location {
                let rewritten =
                    rewrite_location(&location, self.external_scheme, &self.external_hostname);
                debug!(from = %location, to = %rewritten, "Location rewritten");
                upstream_response.insert_header(header::LOCATION, rewritten)?;
            }

            if matches!(ctx.request, Some(ClientRequest::Query(_))) {
                let content_encoding = upstream_response
                    .headers
                    .get(header::CONTENT_ENCODING)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                ctx.capture = Some(ResponseCapture {
                    body: BytesMut::new(),
                    content_encoding,
                    overflowed: false,
                });
            }
        } else if !status.is_redirection() {
            warn!(
                status = status.as_u16(),
                backend_id = ctx.route.as_ref().map(|r| r.backend.id.as_str()).unwrap_or("-"),
                "Routing unsuccessful"
            );
        }
        Ok(())
    }

    fn response_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<Option<Duration>> {
        let Some(capture) = ctx.capture.as_mut() else {
            return Ok(None);
        };

        if let Some(chunk) = body.as_ref() {
            if capture.body.len() + chunk.len() > MAX_CAPTURED_RESPONSE_BYTES {
                capture.overflowed = true;
            } else if !capture.overflowed {
                capture.body.extend_from_slice(chunk);
            }
        }

        if end_of_stream {
            if let (Some(capture), Some(ClientRequest::Query(req))) =
                (ctx.capture.take(), ctx.request.as_ref())
            {
                if capture.overflowed {
                    warn!("Backend response too large to extract a query id");
                } else {
                    spawn_query_persistence(
                        Arc::clone(self.router.api()),
                        req.query.clone(),
                        capture.body.freeze(),
                        capture.content_encoding,
                    );
                }
            }
        }
        Ok(None)
    }

    async fn fail_to_proxy(&self, session: &mut Session, e: &Error, ctx: &mut Self::CTX) -> u16 {
        let failure = proxy_failure(ctx.phase, e.etype(), e.to_string());
        let code = failure_status(ctx.phase, e.etype(), e.esource());
        let phase = failure.phase();

        if !ctx.failure_recorded {
            self.metrics.record_routing_failure(phase.as_str());
            ctx.failure_recorded = true;
        }
        let backend_id = ctx
            .route
            .as_ref()
            .map(|r| r.backend.id.as_str())
            .unwrap_or("-");
        error!(
            backend_id,
            phase = %phase,
            severity = %failure.severity(),
            recoverable = failure.is_recoverable(),
            status = code,
            error = %failure,
            "Proxying failed"
        );

        if code > 0 && session.response_written().is_none() {
            let message = match phase {
                ErrorPhase::Transport => "Trino server unreachable",
                _ => "Bad gateway",
            };
            if let Err(write_err) = write_error(session, code, message).await {
                debug!(error = %write_err, "Unable to write error response");
            }
        }
        code
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        let status = session
            .response_written()
            .map(|r| r.status.as_u16())
            .unwrap_or(0);

        if let Some(started) = ctx.response_started {
            self.metrics
                .observe_post_routing(&ctx.method, status, started.elapsed());
        }
        self.metrics
            .record_response(&ctx.method, status, ctx.received_at.elapsed());

        info!(
            method = %ctx.method,
            path = session.req_header().uri.path(),
            port = self.port,
            status,
            kind = ctx.request.as_ref().map(ClientRequest::kind).unwrap_or("-"),
            backend_id = ctx.route.as_ref().map(|r| r.backend.id.as_str()).unwrap_or("-"),
            error = %e.map(|e| e.to_string()).unwrap_or_default(),
            duration_ms = ctx.received_at.elapsed().as_millis() as u64,
            "Request completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::InMemoryCatalog;
    use crate::core::{Policy, RoutingGroup, RoutingStrategy, RuleType};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use http::{HeaderMap, HeaderValue, Method, Uri};
    use std::io::Write;

    fn backend(id: &str, external: &str) -> Backend {
        let mut b = Backend::new(id, format!("{}.internal:8080", id), Scheme::Http);
        b.external_url = external.to_string();
        b.healthy = true;
        b
    }

    fn group(id: &str, members: &[&str]) -> RoutingGroup {
        RoutingGroup {
            id: id.to_string(),
            enabled: true,
            backends: members.iter().map(|m| m.to_string()).collect(),
            strategy: RoutingStrategy::RoundRobin,
        }
    }

    fn catalog() -> Arc<InMemoryCatalog> {
        let mut etl_policy = Policy::new("p1", RuleType::ListeningPort, "8080", "etl");
        etl_policy.request_source = Some("etl-gateway".to_string());
        Arc::new(InMemoryCatalog::with_catalog(
            "adhoc",
            vec![
                backend("e1", "trino-e1.example.com"),
                backend("a1", "trino-a1.example.com"),
            ],
            vec![group("etl", &["e1"]), group("adhoc", &["a1"])],
            vec![etl_policy],
        ))
    }

    fn router(catalog: Arc<InMemoryCatalog>) -> RequestRouter {
        let api: Arc<dyn GatewayApi> = catalog;
        RequestRouter::new(api.clone(), AuthGate::new(api, None, Vec::new()), "adhoc")
    }

    fn user_headers(user: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("X-Trino-User", HeaderValue::from_str(user).unwrap());
        headers.insert(header::HOST, HeaderValue::from_static("gateway:8080"));
        headers
    }

    async fn route(
        router: &RequestRouter,
        method: Method,
        uri: &str,
        port: u16,
        body: &str,
    ) -> GatewayResult<(ClientRequest, Route)> {
        let uri: Uri = uri.parse().unwrap();
        let headers = user_headers("alice");
        let parts = RequestParts {
            method: &method,
            uri: &uri,
            headers: &headers,
            client_ip: "10.0.0.7",
            port,
        };
        router.route(&parts, body).await
    }

    #[test]
    fn test_rewrite_location() {
        assert_eq!(
            rewrite_location(
                "http://trino-e1.internal:8080/v1/statement/queued/abc/1",
                Scheme::Https,
                "gateway.example.com"
            ),
            "https://gateway.example.com/v1/statement/queued/abc/1"
        );
        assert_eq!(
            rewrite_location("https://backend", Scheme::Http, "gw:8080"),
            "http://gw:8080"
        );
        assert_eq!(
            rewrite_location("/ui/query.html?abc", Scheme::Http, "gw:8080"),
            "/ui/query.html?abc"
        );
    }

    #[test]
    fn test_route_addressing() {
        let b = backend("e1", "trino-e1.example.com");
        let query = Route::new(b.clone(), "etl".to_string(), &ClientRequest::Api, None);
        assert_eq!(query.host, "e1.internal:8080");
        assert_eq!(query.authority(), "e1.internal:8080");
        assert_eq!(query.sni(), "e1.internal");

        let ui = Route::new(
            b,
            "etl".to_string(),
            &ClientRequest::Ui {
                query_id: "q".to_string(),
            },
            None,
        );
        assert_eq!(ui.host, "trino-e1.example.com");
        assert_eq!(ui.authority(), "trino-e1.example.com:80");
    }

    #[test]
    fn test_extract_query_id_from_response() {
        assert_eq!(
            extract_query_id_from_response(r#"{"id":"20240101_000000_00001_abcde","stats":{}}"#),
            Some("20240101_000000_00001_abcde".to_string())
        );
        assert_eq!(extract_query_id_from_response(r#"{"id":""}"#), None);
        assert_eq!(extract_query_id_from_response("<html>"), None);
    }

    #[test]
    fn test_ctx_starts_pre_routing() {
        let ctx = RequestCtx::new();
        assert_eq!(ctx.phase(), ErrorPhase::PreRouting);
        assert!(ctx.route().is_none());
    }

    fn forwarded(route: &Route, strip_authorization: bool) -> RequestHeader {
        let mut req = RequestHeader::build("POST", b"/v1/statement", None).unwrap();
        req.insert_header(header::HOST, "gateway:8080").unwrap();
        req.insert_header("X-Presto-Source", "client-presto").unwrap();
        req.insert_header("X-Trino-Source", "client-trino").unwrap();
        req.insert_header(header::AUTHORIZATION, "Basic YWxpY2U6czNjcmV0").unwrap();
        rewrite_upstream_headers(&mut req, route, strip_authorization).unwrap();
        req
    }

    fn header_value<'a>(req: &'a RequestHeader, name: &str) -> Option<&'a str> {
        req.headers.get(name).and_then(|v| v.to_str().ok())
    }

    #[test]
    fn test_upstream_headers_name_backend() {
        let route = Route::new(
            backend("e1", "trino-e1.example.com"),
            "etl".to_string(),
            &ClientRequest::Api,
            Some("etl-gateway".to_string()),
        );
        let req = forwarded(&route, true);

        assert_eq!(header_value(&req, "host"), Some("e1.internal:8080"));
        assert_eq!(header_value(&req, "x-forwarded-host"), Some("e1.internal:8080"));
        assert_eq!(header_value(&req, "x-presto-source"), None);
        assert_eq!(req.headers.get_all("x-trino-source").iter().count(), 1);
        assert_eq!(header_value(&req, "x-trino-source"), Some("etl-gateway"));
        assert_eq!(header_value(&req, "authorization"), None);
    }

    #[test]
    fn test_upstream_headers_keep_client_source_without_override() {
        let route = Route::new(
            backend("e1", "trino-e1.example.com"),
            "etl".to_string(),
            &ClientRequest::Ui {
                query_id: "q".to_string(),
            },
            None,
        );
        let req = forwarded(&route, false);

        assert_eq!(header_value(&req, "host"), Some("trino-e1.example.com"));
        assert_eq!(header_value(&req, "x-presto-source"), Some("client-presto"));
        assert_eq!(header_value(&req, "x-trino-source"), Some("client-trino"));
        assert_eq!(
            header_value(&req, "authorization"),
            Some("Basic YWxpY2U6czNjcmV0")
        );
    }

    #[test]
    fn test_failure_status_by_phase() {
        let unset = ErrorSource::Unset;
        assert_eq!(
            failure_status(ErrorPhase::Transport, &ErrorType::ConnectRefused, &ErrorSource::Upstream),
            502
        );
        assert_eq!(
            failure_status(ErrorPhase::PostRouting, &ErrorType::ReadError, &ErrorSource::Upstream),
            502
        );
        assert_eq!(
            failure_status(ErrorPhase::PreRouting, &ErrorType::InternalError, &unset),
            500
        );
        // unresolvable backend hosts fail before the context leaves pre-routing
        assert_eq!(
            failure_status(ErrorPhase::PreRouting, &ErrorType::ConnectNoRoute, &unset),
            502
        );
        assert_eq!(
            failure_status(ErrorPhase::Transport, &ErrorType::HTTPStatus(413), &unset),
            413
        );
        assert_eq!(
            failure_status(ErrorPhase::PostRouting, &ErrorType::WriteError, &ErrorSource::Downstream),
            0
        );
    }

    #[test]
    fn test_proxy_failure_phase() {
        let unreachable = proxy_failure(ErrorPhase::PreRouting, &ErrorType::ConnectNoRoute, "resolving e1");
        assert!(matches!(unreachable, GatewayError::Transport { .. }));
        assert_eq!(unreachable.phase(), ErrorPhase::Transport);
        assert!(unreachable.is_recoverable());

        let reset = proxy_failure(ErrorPhase::PostRouting, &ErrorType::ConnectionClosed, "reset");
        assert_eq!(reset.phase(), ErrorPhase::PostRouting);

        let internal = proxy_failure(ErrorPhase::PreRouting, &ErrorType::InternalError, "no route");
        assert!(matches!(internal, GatewayError::Internal { .. }));
    }

    #[tokio::test]
    async fn test_query_routed_by_port_policy() {
        let router = router(catalog());
        let (request, route) = route(&router, Method::POST, "/v1/statement", 8080, "SELECT 1")
            .await
            .unwrap();

        assert_eq!(route.group_id, "etl");
        assert_eq!(route.backend.id, "e1");
        assert_eq!(route.request_source.as_deref(), Some("etl-gateway"));
        let query = request.query().unwrap();
        assert_eq!(query.backend_id, "e1");
        assert_eq!(query.group_id, "etl");
        assert_eq!(query.server_host, "http://trino-e1.example.com");
        assert_eq!(query.username, "alice");
    }

    #[tokio::test]
    async fn test_unmatched_port_has_no_eligible_group() {
        let router = router(catalog());
        let err = route(&router, Method::POST, "/v1/statement", 9090, "SELECT 1")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoEligibleGroup { port: 9090, .. }));
        assert_eq!(err.http_status(), 400);
    }

    #[tokio::test]
    async fn test_unconstrained_client_uses_default_group() {
        let catalog = Arc::new(InMemoryCatalog::with_catalog(
            "adhoc",
            vec![backend("a1", "trino-a1.example.com")],
            vec![group("adhoc", &["a1"])],
            Vec::new(),
        ));
        let router = router(catalog);
        let (_, route) = route(&router, Method::POST, "/v1/statement", 9090, "SELECT 1")
            .await
            .unwrap();
        assert_eq!(route.group_id, "adhoc");
        assert_eq!(route.request_source, None);
    }

    #[tokio::test]
    async fn test_validation_fails_before_resolution() {
        let router = router(catalog());
        let err = route(&router, Method::POST, "/v1/statement", 8080, "")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Request(RequestError::MissingQueryText)
        ));
        assert_eq!(err.phase(), ErrorPhase::PreRouting);
    }

    #[tokio::test]
    async fn test_kill_query_goes_to_owner() {
        let catalog = catalog();
        catalog
            .create_or_update_query(&QueryRecord {
                id: "q_owned".to_string(),
                backend_id: "a1".to_string(),
                group_id: "adhoc".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let router = router(catalog);

        let body = "CALL system.runtime.kill_query(query_id => 'q_owned')";
        let (_, route) = route(&router, Method::POST, "/v1/statement", 8080, body)
            .await
            .unwrap();
        assert_eq!(route.backend.id, "a1");
        assert_eq!(route.group_id, "adhoc");
    }

    #[tokio::test]
    async fn test_kill_unknown_query_falls_back_to_policies() {
        let router = router(catalog());
        let body = "CALL system.runtime.kill_query(query_id => 'q_unknown')";
        let (_, route) = route(&router, Method::POST, "/v1/statement", 8080, body)
            .await
            .unwrap();
        assert_eq!(route.backend.id, "e1");
    }

    #[tokio::test]
    async fn test_ui_and_cancel_need_known_owner() {
        let catalog = catalog();
        catalog
            .create_or_update_query(&QueryRecord {
                id: "q1".to_string(),
                backend_id: "e1".to_string(),
                group_id: "etl".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let router = router(catalog);

        let (_, ui) = route(&router, Method::GET, "/ui/query.html?q1", 8080, "")
            .await
            .unwrap();
        assert_eq!(ui.host, "trino-e1.example.com");

        let (_, cancel) = route(&router, Method::DELETE, "/v1/query/q1", 8080, "")
            .await
            .unwrap();
        assert_eq!(cancel.host, "e1.internal:8080");

        let err = route(&router, Method::GET, "/ui/query.html?missing", 8080, "")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Api(ApiError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_api_request_uses_default_group() {
        let router = router(catalog());
        let (_, route) = route(&router, Method::GET, "/v1/info", 8080, "")
            .await
            .unwrap();
        assert_eq!(route.group_id, "adhoc");
        assert_eq!(route.backend.id, "a1");
    }

    #[tokio::test]
    async fn test_unsupported_request() {
        let router = router(catalog());
        let err = route(&router, Method::PUT, "/v1/statement", 8080, "")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Request(RequestError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_query_persistence() {
        let catalog = catalog();
        let api: Arc<dyn GatewayApi> = catalog.clone();
        let query = QueryRecord {
            text: "SELECT 1".to_string(),
            username: "alice".to_string(),
            backend_id: "e1".to_string(),
            group_id: "etl".to_string(),
            ..Default::default()
        };
        let body = Bytes::from_static(br#"{"id":"20240101_000000_00001_abcde"}"#);

        spawn_query_persistence(api, query, body, None).await.unwrap();

        let saved = catalog
            .get_query("20240101_000000_00001_abcde")
            .await
            .unwrap();
        assert_eq!(saved.backend_id, "e1");
        assert_eq!(saved.text, "SELECT 1");
        assert!(saved.submitted_at > 0);
    }

    #[tokio::test]
    async fn test_gzip_response_persistence() {
        let catalog = catalog();
        let api: Arc<dyn GatewayApi> = catalog.clone();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(br#"{"id":"q_gzip"}"#).unwrap();
        let body = Bytes::from(encoder.finish().unwrap());

        spawn_query_persistence(api, QueryRecord::default(), body, Some("gzip".to_string()))
            .await
            .unwrap();
        assert!(catalog.get_query("q_gzip").await.is_some());
    }

    #[tokio::test]
    async fn test_response_without_id_is_not_persisted() {
        let catalog = catalog();
        let api: Arc<dyn GatewayApi> = catalog.clone();
        spawn_query_persistence(api, QueryRecord::default(), Bytes::from_static(b"{}"), None)
            .await
            .unwrap();
        assert!(catalog.get_query("").await.is_none());
    }
}
