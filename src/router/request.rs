/// Client request classification and validation
use crate::core::{ClientAttributes, QueryRecord};
use crate::error::RequestError;
use crate::router::headers;
use http::{HeaderMap, Method, Uri};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

lazy_static! {
    static ref KILL_QUERY: Regex = Regex::new(
        r#"(?:call|CALL)[ ]+(?:(?:system|"system")\.(?:runtime|"runtime")\.(?:kill_query|"kill_query"))"#
    )
    .expect("kill_query detection pattern");
    static ref KILL_QUERY_ID: Regex = Regex::new(
        r#"(?:(?:kill_query|"kill_query")[ ]*\([ ]*'([\w_-]*)'|(?:query_id[ ]*=>[ ]*'([\w_-]*)'))"#
    )
    .expect("kill_query id pattern");
}

/// A classified client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// Informational endpoint such as `/v1/info`
    Api,
    /// Web UI page for a known query
    Ui { query_id: String },
    /// New statement submission
    Query(QueryRequest),
    /// Out-of-band operation on an existing query
    QueryApi(QueryApiRequest),
}

/// Statement submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    /// `id` is only set when the statement kills another query
    pub query: QueryRecord,
    pub attrs: ClientAttributes,
    pub transaction_id: String,
}

/// Cancellation of a running query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryApiRequest {
    pub query: QueryRecord,
    pub attrs: ClientAttributes,
}

/// Request line and headers the classifier looks at
#[derive(Debug, Clone, Copy)]
pub struct RequestParts<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    pub client_ip: &'a str,
    pub port: u16,
}

impl<'a> RequestParts<'a> {
    fn host(&self) -> String {
        self.headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| self.uri.authority().map(|a| a.as_str()))
            .unwrap_or_default()
            .to_string()
    }

    fn attributes(&self) -> ClientAttributes {
        ClientAttributes {
            port: self.port,
            host: self.host(),
            client_tags: headers::get(headers::CLIENT_TAGS, self.headers),
            connection_properties: headers::get(headers::CONNECTION_PROPERTIES, self.headers),
        }
    }
}

/// Whether the classifier needs the request body
pub fn needs_body(method: &Method) -> bool {
    method == Method::POST
}

/// Turn a request into one of the client request variants
///
/// `body` is the decoded request body and is only read for POST.
pub fn classify(parts: &RequestParts<'_>, body: &str) -> Result<ClientRequest, RequestError> {
    let path = parts.uri.path();
    let method = parts.method;

    if method == Method::GET {
        if path.contains("ui/") {
            return Ok(ClientRequest::Ui {
                query_id: parts.uri.query().unwrap_or_default().to_string(),
            });
        }
        if path.contains("v1/info") || path.contains("v1/status") {
            return Ok(ClientRequest::Api);
        }
    } else if method == Method::POST {
        let query = QueryRecord {
            id: extract_kill_query_id(body),
            text: body.to_string(),
            username: headers::get(headers::USER, parts.headers),
            client_ip: parts.client_ip.to_string(),
            received_at: chrono::Utc::now().timestamp(),
            ..Default::default()
        };

        return Ok(ClientRequest::Query(QueryRequest {
            query,
            attrs: parts.attributes(),
            transaction_id: headers::get(headers::TRANSACTION_ID, parts.headers),
        }));
    } else if method == Method::DELETE && path.starts_with("/v1/query") {
        let query_id = path
            .strip_prefix("/v1/query")
            .unwrap_or_default()
            .trim_start_matches('/');

        let query = QueryRecord {
            id: query_id.to_string(),
            username: headers::get(headers::USER, parts.headers),
            client_ip: parts.client_ip.to_string(),
            received_at: chrono::Utc::now().timestamp(),
            ..Default::default()
        };

        return Ok(ClientRequest::QueryApi(QueryApiRequest {
            query,
            attrs: parts.attributes(),
        }));
    }

    Err(RequestError::Unsupported {
        method: method.to_string(),
        path: path.to_string(),
    })
}

/// Query id referenced by a `system.runtime.kill_query` call, or ""
pub fn extract_kill_query_id(body: &str) -> String {
    if !KILL_QUERY.is_match(body) {
        return String::new();
    }

    let Some(captures) = KILL_QUERY_ID.captures(body) else {
        debug!("kill_query procedure detected but no query id found");
        return String::new();
    };

    let query_id = captures
        .get(1)
        .or_else(|| captures.get(2))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();
    debug!(query_id = %query_id, "Extracted query id from kill_query procedure");
    query_id
}

impl ClientRequest {
    /// Every variant must validate before it is routed
    pub fn validate(&self) -> Result<(), RequestError> {
        match self {
            ClientRequest::Api => Ok(()),
            ClientRequest::Ui { query_id } => {
                if query_id.is_empty() {
                    return Err(RequestError::MissingQueryId { kind: "ui" });
                }
                Ok(())
            }
            ClientRequest::Query(req) => {
                if req.query.username.is_empty() {
                    return Err(RequestError::MissingUsername);
                }
                if req.query.text.is_empty() {
                    return Err(RequestError::MissingQueryText);
                }
                // Some Presto clients send `NONE` when no transaction is open
                if !(req.transaction_id.is_empty() || req.transaction_id == "NONE") {
                    return Err(RequestError::TransactionsUnsupported {
                        transaction_id: req.transaction_id.clone(),
                    });
                }
                Ok(())
            }
            ClientRequest::QueryApi(req) => {
                if req.query.id.is_empty() {
                    return Err(RequestError::MissingQueryId { kind: "query api" });
                }
                Ok(())
            }
        }
    }

    /// Query id whose owning backend serves this request, if any
    pub fn known_query_id(&self) -> Option<&str> {
        let id = match self {
            ClientRequest::Api => return None,
            ClientRequest::Ui { query_id } => query_id.as_str(),
            ClientRequest::Query(req) => req.query.id.as_str(),
            ClientRequest::QueryApi(req) => req.query.id.as_str(),
        };
        Some(id).filter(|id| !id.is_empty())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientRequest::Api => "api",
            ClientRequest::Ui { .. } => "ui",
            ClientRequest::Query(_) => "query",
            ClientRequest::QueryApi(_) => "query_api",
        }
    }

    pub fn attributes(&self) -> Option<&ClientAttributes> {
        match self {
            ClientRequest::Query(req) => Some(&req.attrs),
            ClientRequest::QueryApi(req) => Some(&req.attrs),
            ClientRequest::Api | ClientRequest::Ui { .. } => None,
        }
    }

    pub fn query(&self) -> Option<&QueryRecord> {
        match self {
            ClientRequest::Query(req) => Some(&req.query),
            ClientRequest::QueryApi(req) => Some(&req.query),
            ClientRequest::Api | ClientRequest::Ui { .. } => None,
        }
    }

    pub fn query_mut(&mut self) -> Option<&mut QueryRecord> {
        match self {
            ClientRequest::Query(req) => Some(&mut req.query),
            ClientRequest::QueryApi(req) => Some(&mut req.query),
            ClientRequest::Api | ClientRequest::Ui { .. } => None,
        }
    }
}
