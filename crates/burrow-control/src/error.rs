//! Relay core errors
//!
//! Every variant is recoverable: it is reported to the caller (management
//! call or public exchange) and never tears down the process.

use burrow_router::RouteError;
use thiserror::Error;

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Subdomain already claimed: {0}")]
    DuplicateSubdomain(String),

    #[error("No free subdomain derived from '{0}'")]
    SubdomainExhausted(String),

    #[error("Unknown subdomain: {0}")]
    UnknownSubdomain(String),

    #[error("Tunnel {0} is not active")]
    TunnelNotActive(String),

    #[error("Agent {0} is busy")]
    AgentBusy(String),

    #[error("Relay exchange timed out")]
    RelayTimeout,

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Agent {0} is not connected")]
    AgentOffline(String),

    #[error("Agent reported an error: {0}")]
    Upstream(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl RelayError {
    pub fn agent_not_found(id: impl Into<String>) -> Self {
        RelayError::NotFound {
            kind: "Agent",
            id: id.into(),
        }
    }

    pub fn tunnel_not_found(id: impl Into<String>) -> Self {
        RelayError::NotFound {
            kind: "Tunnel",
            id: id.into(),
        }
    }

    /// Short reason written into `Error` frames and status records
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

impl From<RouteError> for RelayError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::DuplicateSubdomain { subdomain, .. } => {
                RelayError::DuplicateSubdomain(subdomain)
            }
            RouteError::AlreadyPublished { subdomain, .. } => {
                RelayError::DuplicateSubdomain(subdomain)
            }
            RouteError::NotFound(subdomain) => RelayError::UnknownSubdomain(subdomain),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_error_conversion() {
        let err: RelayError = RouteError::NotFound("web".to_string()).into();
        assert_eq!(err, RelayError::UnknownSubdomain("web".to_string()));

        let err: RelayError = RouteError::DuplicateSubdomain {
            subdomain: "web".to_string(),
            claimed_by: "tun-1".to_string(),
        }
        .into();
        assert_eq!(err, RelayError::DuplicateSubdomain("web".to_string()));
    }

    #[test]
    fn test_not_found_display() {
        assert_eq!(
            RelayError::tunnel_not_found("tun-9").to_string(),
            "Tunnel not found: tun-9"
        );
    }
}
