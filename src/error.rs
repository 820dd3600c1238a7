use std::fmt;

/// Failure kinds surfaced on the dispatch path. Each maps to a uniform JSON
/// error body at the proxy boundary (see `RequestContext::error_response`).
#[derive(Debug)]
pub enum GatewayError {
    NoRouteMatch,
    NoBackend,
    DeadlineExceeded,
    Transport(String),
    Canceled,
    InvalidState(String),
    Config(String),
}

impl GatewayError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, GatewayError::DeadlineExceeded)
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::NoRouteMatch => write!(f, "no route matched"),
            GatewayError::NoBackend => write!(f, "no healthy backends"),
            GatewayError::DeadlineExceeded => write!(f, "deadline exceeded"),
            GatewayError::Transport(msg) => write!(f, "upstream transport error: {}", msg),
            GatewayError::Canceled => write!(f, "request canceled"),
            GatewayError::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}
