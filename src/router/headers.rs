/// Trino client protocol headers
///
/// Clients send either the legacy `X-Presto-*` or the current `X-Trino-*`
/// spelling of each header.
use http::HeaderMap;

pub const USER: &str = "User";
pub const PASSWORD: &str = "Password";
pub const CLIENT_TAGS: &str = "Client-Tags";
/// Not part of the Trino protocol but sent by some JDBC clients
pub const CONNECTION_PROPERTIES: &str = "Connection-Properties";
pub const TRANSACTION_ID: &str = "Transaction-Id";
pub const SOURCE: &str = "Source";

/// Header the gateway writes when a policy overrides the client source
pub const TRINO_SOURCE: &str = "X-Trino-Source";

const PREFIXES: [&str; 2] = ["Presto", "Trino"];

/// Every spelling of `name`, legacy prefix first
pub fn names(name: &str) -> [String; 2] {
    PREFIXES.map(|prefix| format!("X-{}-{}", prefix, name))
}

/// First non-empty value of `X-{prefix}-{name}`, or "" when absent
pub fn get(name: &str, headers: &HeaderMap) -> String {
    names(name)
        .iter()
        .filter_map(|header| headers.get(header.as_str()).and_then(|v| v.to_str().ok()))
        .find(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_default()
}
