/// Unified error handling for the Trino gateway
///
/// Errors are grouped by where they surface: request classification and
/// validation, management API resolution, authentication, transport to the
/// backend cluster, post-routing response handling, and monitor probes.
use std::fmt;
use thiserror::Error;

/// Main error type for gateway operations
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Malformed or unsupported client request
    #[error("Invalid request: {0}")]
    Request(#[from] RequestError),

    /// Management API call failed
    #[error("Management API error: {0}")]
    Api(#[from] ApiError),

    /// Policies matched but agreed on no group
    #[error("No eligible routing group for client (port={port}, host={host})")]
    NoEligibleGroup { port: u16, host: String },

    /// Authentication failures
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Backend cluster unreachable or connection reset
    #[error("Trino server unreachable: {message}")]
    Transport { message: String },

    /// Backend answered but the response could not be handled
    #[error("Post-routing error: {message}")]
    PostRouting { message: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Classification and validation errors for inbound client requests
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("client request type not supported by gateway: {method} {path}")]
    Unsupported { method: String, path: String },

    #[error("{kind}: Missing query id")]
    MissingQueryId { kind: &'static str },

    #[error("query submission: Missing Trino Username header")]
    MissingUsername,

    #[error("query submission: Missing Query text")]
    MissingQueryText,

    #[error("query submission: Transactions are not supported in gateway (transaction id '{transaction_id}')")]
    TransactionsUnsupported { transaction_id: String },

    #[error("unable to read request body: {message}")]
    Body { message: String },

    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
}

/// Management API errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("management API unreachable: {message}")]
    Unreachable { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("no eligible backend: {message}")]
    NoEligibleBackend { message: String },

    #[error("request rejected ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("unable to decode response: {message}")]
    Decode { message: String },
}

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Username from basic auth - {basic} does not match with User principal - {principal}")]
    UsernameMismatch { basic: String, principal: String },

    #[error("Password required")]
    PasswordRequired,

    #[error("User {username} not authenticated")]
    Rejected { username: String },

    #[error("Unable to authenticate the user: {message}")]
    Validator { message: String },
}

/// Cluster probe errors
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("HTTP error probing {host}: {message}")]
    Http { host: String, message: String },

    #[error("invalid cluster info from {host}: {message}")]
    InvalidInfo { host: String, message: String },

    #[error("query failed on {host}: {message}")]
    Query { host: String, message: String },

    #[error("unable to parse query results from {host}: {message}")]
    Parse { host: String, message: String },
}

/// Phase of the proxying pipeline in which a request failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPhase {
    /// Classification, validation, auth or resolution failed before forwarding
    PreRouting,
    /// Backend response could not be parsed or forwarded
    PostRouting,
    /// Backend cluster could not be reached
    Transport,
}

impl ErrorPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorPhase::PreRouting => "pre_routing",
            ErrorPhase::PostRouting => "post_routing",
            ErrorPhase::Transport => "transport",
        }
    }
}

impl fmt::Display for ErrorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type alias for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Convenience methods for creating specific error types
impl GatewayError {
    /// Create a transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        GatewayError::Transport {
            message: message.into(),
        }
    }

    /// Create a post-routing error
    pub fn post_routing<S: Into<String>>(message: S) -> Self {
        GatewayError::PostRouting {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        GatewayError::Internal {
            message: message.into(),
        }
    }

    /// Pipeline phase this error belongs to
    pub fn phase(&self) -> ErrorPhase {
        match self {
            GatewayError::Transport { .. } => ErrorPhase::Transport,
            GatewayError::PostRouting { .. } => ErrorPhase::PostRouting,
            _ => ErrorPhase::PreRouting,
        }
    }

    /// HTTP status returned to the client for this error
    ///
    /// Client-correctable failures map to 4xx; faults of the gateway, the
    /// management API or the backend map to 502.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Request(RequestError::BodyTooLarge { .. }) => 413,
            GatewayError::Request(_) | GatewayError::NoEligibleGroup { .. } => 400,
            GatewayError::Api(ApiError::NotFound { .. })
            | GatewayError::Api(ApiError::NoEligibleBackend { .. })
            | GatewayError::Api(ApiError::Rejected { .. }) => 400,
            GatewayError::Api(_) => 502,
            GatewayError::Auth(_) => 401,
            GatewayError::Transport { .. } | GatewayError::PostRouting { .. } => 502,
            GatewayError::Config(_) | GatewayError::Internal { .. } => 500,
        }
    }

    /// Check if this error is recoverable (the client may retry)
    pub fn is_recoverable(&self) -> bool {
        match self {
            GatewayError::Transport { .. } => true,
            GatewayError::Api(ApiError::Unreachable { .. }) => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            GatewayError::Config(_) => ErrorSeverity::Critical,
            GatewayError::Internal { .. } => ErrorSeverity::Critical,
            GatewayError::Api(ApiError::Unreachable { .. }) => ErrorSeverity::Error,
            GatewayError::Transport { .. } => ErrorSeverity::Warning,
            GatewayError::PostRouting { .. } => ErrorSeverity::Warning,
            GatewayError::Request(_) | GatewayError::Auth(_) => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

impl ApiError {
    pub fn unreachable<S: Into<String>>(message: S) -> Self {
        ApiError::Unreachable {
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        ApiError::NotFound {
            message: message.into(),
        }
    }

    pub fn no_eligible_backend<S: Into<String>>(message: S) -> Self {
        ApiError::NoEligibleBackend {
            message: message.into(),
        }
    }

    pub fn decode<S: Into<String>>(message: S) -> Self {
        ApiError::Decode {
            message: message.into(),
        }
    }
}

impl ProbeError {
    pub fn http<H: Into<String>, S: fmt::Display>(host: H, err: S) -> Self {
        ProbeError::Http {
            host: host.into(),
            message: err.to_string(),
        }
    }

    pub fn query<H: Into<String>, S: Into<String>>(host: H, message: S) -> Self {
        ProbeError::Query {
            host: host.into(),
            message: message.into(),
        }
    }

    pub fn parse<H: Into<String>, S: fmt::Display>(host: H, err: S) -> Self {
        ProbeError::Parse {
            host: host.into(),
            message: err.to_string(),
        }
    }
}
