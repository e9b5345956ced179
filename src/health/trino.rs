/// Trino cluster probe
///
/// Talks to a coordinator over its REST API: `/v1/info` for readiness and
/// the `/v1/statement` protocol for the health check and load queries.
use super::{ClusterLoadStats, ClusterProbe};
use crate::core::Backend;
use crate::error::ProbeError;
use crate::router::headers;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_IDLE_PER_HOST: usize = 3;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterInfo {
    #[serde(default = "starting_by_default")]
    starting: bool,
    #[serde(default)]
    coordinator: bool,
    #[serde(default)]
    node_version: NodeVersion,
}

fn starting_by_default() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
struct NodeVersion {
    #[serde(default)]
    version: String,
}

/// One page of the statement protocol
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResults {
    #[serde(default)]
    id: String,
    next_uri: Option<String>,
    #[serde(default)]
    data: Vec<Vec<Value>>,
    error: Option<QueryError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    error_name: String,
}

/// Probe speaking the Trino client protocol as a fixed user
pub struct TrinoProbe {
    user: String,
    password: Option<String>,
    health_check_sql: String,
    client: OnceCell<reqwest::Client>,
}

impl TrinoProbe {
    pub fn new<U: Into<String>, Q: Into<String>>(
        user: U,
        password: Option<String>,
        health_check_sql: Q,
    ) -> Self {
        Self {
            user: user.into(),
            password,
            health_check_sql: health_check_sql.into(),
            client: OnceCell::new(),
        }
    }

    /// HTTP client, built on first use
    async fn client(&self) -> Result<&reqwest::Client, ProbeError> {
        self.client
            .get_or_try_init(|| async {
                reqwest::Client::builder()
                    .connect_timeout(CONNECT_TIMEOUT)
                    .pool_idle_timeout(IDLE_TIMEOUT)
                    .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
                    .build()
            })
            .await
            .map_err(|e| ProbeError::http("client", e))
    }

    fn user_header() -> String {
        format!("X-Trino-{}", headers::USER)
    }

    /// Query counts per state, leaving out the probe's own and finished queries
    pub fn load_query(&self) -> String {
        format!(
            "SELECT state, count(*) FROM system.runtime.queries \
             WHERE user != '{}' AND state NOT IN ('FINISHED', 'FAILED') \
             GROUP BY state",
            self.user.replace('\'', "''")
        )
    }

    async fn ping(&self, backend: &Backend) -> Result<(), ProbeError> {
        let url = format!("{}/v1/info", backend.base_url());
        self.client()
            .await?
            .get(&url)
            .header(Self::user_header(), &self.user)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ProbeError::http(&backend.hostname, e))?;
        Ok(())
    }

    /// Run `sql` to completion and return every row
    ///
    /// The cluster is pinged first; every page is followed so the query
    /// ends as finished on the coordinator rather than abandoned.
    pub async fn run_query(
        &self,
        backend: &Backend,
        sql: &str,
    ) -> Result<Vec<Vec<Value>>, ProbeError> {
        self.ping(backend).await?;

        let client = self.client().await?;
        let mut request = client
            .post(format!("{}/v1/statement", backend.base_url()))
            .header(Self::user_header(), &self.user)
            .header("X-Trino-Catalog", "system")
            .header("X-Trino-Schema", "runtime")
            .body(sql.to_string());
        if let Some(password) = &self.password {
            request = request.basic_auth(&self.user, Some(password));
        }

        let mut page = Self::read_page(backend, request).await?;
        debug!(backend_id = %backend.id, query_id = %page.id, "Probe query submitted");

        let mut rows = Vec::new();
        loop {
            if let Some(error) = page.error.take() {
                return Err(ProbeError::query(
                    &backend.hostname,
                    format!("{}: {}", error.error_name, error.message),
                ));
            }
            rows.append(&mut page.data);
            match page.next_uri.take() {
                Some(next) => {
                    let request = client.get(next).header(Self::user_header(), &self.user);
                    page = Self::read_page(backend, request).await?;
                }
                None => return Ok(rows),
            }
        }
    }

    async fn read_page(
        backend: &Backend,
        request: reqwest::RequestBuilder,
    ) -> Result<QueryResults, ProbeError> {
        let response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ProbeError::http(&backend.hostname, e))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| ProbeError::http(&backend.hostname, e))?;
        serde_json::from_slice(&body).map_err(|e| ProbeError::parse(&backend.hostname, e))
    }
}

/// Fold rows of `(state, count)` into load stats
fn stats_from_rows(host: &str, rows: &[Vec<Value>]) -> Result<ClusterLoadStats, ProbeError> {
    let mut counts = Vec::with_capacity(rows.len());
    for row in rows {
        match (
            row.first().and_then(Value::as_str),
            row.get(1).and_then(Value::as_i64),
        ) {
            (Some(state), Some(count)) => counts.push((state, count)),
            _ => return Err(ProbeError::parse(host, format!("unexpected row {:?}", row))),
        }
    }
    Ok(ClusterLoadStats::from_state_counts(counts))
}

#[async_trait]
impl ClusterProbe for TrinoProbe {
    async fn is_cluster_up(&self, backend: &Backend) -> Result<bool, ProbeError> {
        let url = format!("{}/v1/info", backend.base_url());
        debug!(backend_id = %backend.id, url = %url, "Fetching cluster info");

        let response = self
            .client()
            .await?
            .get(&url)
            .header(Self::user_header(), &self.user)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ProbeError::http(&backend.hostname, e))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| ProbeError::http(&backend.hostname, e))?;

        let info: ClusterInfo = serde_json::from_slice(&body).unwrap_or_default();
        if info.node_version.version.is_empty() {
            return Err(ProbeError::InvalidInfo {
                host: backend.hostname.clone(),
                message: "missing node version".to_string(),
            });
        }
        if !info.coordinator || info.starting {
            debug!(
                backend_id = %backend.id,
                coordinator = info.coordinator,
                starting = info.starting,
                "Cluster not ready"
            );
            return Ok(false);
        }
        Ok(true)
    }

    async fn is_cluster_healthy(&self, backend: &Backend) -> Result<bool, ProbeError> {
        self.run_query(backend, &self.health_check_sql).await?;
        debug!(backend_id = %backend.id, "Health check query succeeded");
        Ok(true)
    }

    async fn cluster_load_stats(&self, backend: &Backend) -> Result<ClusterLoadStats, ProbeError> {
        let rows = self.run_query(backend, &self.load_query()).await?;
        stats_from_rows(&backend.hostname, &rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadWeights;
    use crate::core::Scheme;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    type Handler = Arc<dyn Fn(&str, &str) -> (u16, String) + Send + Sync>;

    /// Minimal HTTP/1.1 stub answering one request per connection
    async fn serve(listener: TcpListener, handler: Handler) {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                let header_end = loop {
                    let n = match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                };
                let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
                let content_length = head
                    .lines()
                    .filter_map(|l| l.split_once(':'))
                    .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                while buf.len() < header_end + content_length {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }

                let mut parts = head.split_whitespace();
                let method = parts.next().unwrap_or_default().to_string();
                let path = parts.next().unwrap_or_default().to_string();
                let (status, body) = handler(&method, &path);
                let response = format!(
                    "HTTP/1.1 {} OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    }

    async fn stub<F>(make: F) -> Backend
    where
        F: FnOnce(String) -> Handler,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handler = make(format!("http://{}", addr));
        tokio::spawn(serve(listener, handler));
        Backend::new("stub", addr, Scheme::Http)
    }

    fn handler<F>(f: F) -> Handler
    where
        F: Fn(&str, &str) -> (u16, String) + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    fn info(coordinator: bool, starting: bool, version: &str) -> String {
        json!({
            "nodeVersion": {"version": version},
            "environment": "test",
            "coordinator": coordinator,
            "starting": starting,
            "uptime": "1.00d"
        })
        .to_string()
    }

    fn probe() -> TrinoProbe {
        TrinoProbe::new("trino-gateway", None, "SELECT 1")
    }

    #[test]
    fn test_cluster_info_defaults() {
        let info: ClusterInfo = serde_json::from_str("{}").unwrap();
        assert!(info.starting);
        assert!(!info.coordinator);
        assert!(info.node_version.version.is_empty());
    }

    #[test]
    fn test_load_query_excludes_probe_user() {
        let sql = TrinoProbe::new("o'brien", None, "SELECT 1").load_query();
        assert!(sql.contains("user != 'o''brien'"));
        assert!(sql.contains("NOT IN ('FINISHED', 'FAILED')"));
        assert!(sql.ends_with("GROUP BY state"));
    }

    #[test]
    fn test_stats_from_rows() {
        let rows = vec![
            vec![json!("RUNNING"), json!(2)],
            vec![json!("PLANNING"), json!(1)],
            vec![json!("QUEUED"), json!(3)],
        ];
        let stats = stats_from_rows("h", &rows).unwrap();
        assert_eq!(stats.load(&LoadWeights::default()), 7);

        let bad = vec![vec![json!(1), json!("RUNNING")]];
        assert!(matches!(
            stats_from_rows("h", &bad),
            Err(ProbeError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn test_cluster_up() {
        let backend = stub(|_| handler(|_, _| (200, info(true, false, "435")))).await;
        assert!(probe().is_cluster_up(&backend).await.unwrap());
    }

    #[tokio::test]
    async fn test_cluster_starting_or_worker() {
        let starting = stub(|_| handler(|_, _| (200, info(true, true, "435")))).await;
        assert!(!probe().is_cluster_up(&starting).await.unwrap());

        let worker = stub(|_| handler(|_, _| (200, info(false, false, "435")))).await;
        assert!(!probe().is_cluster_up(&worker).await.unwrap());
    }

    #[tokio::test]
    async fn test_cluster_info_without_version() {
        let backend = stub(|_| handler(|_, _| (200, "not json".to_string()))).await;
        assert!(matches!(
            probe().is_cluster_up(&backend).await,
            Err(ProbeError::InvalidInfo { .. })
        ));
    }

    #[tokio::test]
    async fn test_cluster_unreachable() {
        let backend = Backend::new("gone", "127.0.0.1:1", Scheme::Http);
        assert!(matches!(
            probe().is_cluster_up(&backend).await,
            Err(ProbeError::Http { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_follows_next_uri() {
        let backend = stub(|base| {
            handler(move |method, path| match (method, path) {
                ("GET", "/v1/info") => (200, info(true, false, "435")),
                ("POST", "/v1/statement") => (
                    200,
                    json!({
                        "id": "q1",
                        "nextUri": format!("{}/v1/statement/executing/q1/1", base),
                        "stats": {"state": "QUEUED"}
                    })
                    .to_string(),
                ),
                ("GET", "/v1/statement/executing/q1/1") => (
                    200,
                    json!({
                        "id": "q1",
                        "nextUri": format!("{}/v1/statement/executing/q1/2", base),
                        "data": [["RUNNING", 2], ["PLANNING", 1]]
                    })
                    .to_string(),
                ),
                ("GET", "/v1/statement/executing/q1/2") => (
                    200,
                    json!({"id": "q1", "data": [["QUEUED", 3]]}).to_string(),
                ),
                _ => (404, "{}".to_string()),
            })
        })
        .await;

        let stats = probe().cluster_load_stats(&backend).await.unwrap();
        assert_eq!(stats.running, 2);
        assert_eq!(stats.queued, 3);
        assert_eq!(stats.load(&LoadWeights::default()), 7);
    }

    #[tokio::test]
    async fn test_failed_health_query() {
        let backend = stub(|_| {
            handler(|method, _| match method {
                "GET" => (200, info(true, false, "435")),
                _ => (
                    200,
                    json!({
                        "id": "q2",
                        "error": {"message": "line 1:1: mismatched input", "errorName": "SYNTAX_ERROR"}
                    })
                    .to_string(),
                ),
            })
        })
        .await;

        assert!(matches!(
            probe().is_cluster_healthy(&backend).await,
            Err(ProbeError::Query { .. })
        ));
    }
}
