pub mod commerce;
pub mod licensing;

use thiserror::Error;

/// Failure from one of the external HTTP clients. Status errors keep the
/// upstream HTTP code so callers can tell business rejections from outages.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{service} request failed with status {status}")]
    Status { service: &'static str, status: u16 },
    #[error("{service} transport error: {source}")]
    Transport {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{service} returned an unexpected response shape")]
    UnexpectedResponse { service: &'static str },
}

impl ApiError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Join a base URL and an endpoint path without doubling slashes.
/// Absolute endpoints are passed through untouched.
pub(crate) fn join_url(base: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http") {
        return endpoint.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_base_and_endpoint() {
        assert_eq!(
            join_url("https://api.example.com/", "/v1/grant"),
            "https://api.example.com/v1/grant"
        );
        assert_eq!(
            join_url("https://api.example.com", "v1/grant"),
            "https://api.example.com/v1/grant"
        );
    }

    #[test]
    fn absolute_endpoint_wins() {
        assert_eq!(
            join_url("https://api.example.com", "https://other.example.com/x"),
            "https://other.example.com/x"
        );
    }

    #[test]
    fn status_code_only_on_status_errors() {
        let err = ApiError::Status {
            service: "commerce",
            status: 502,
        };
        assert_eq!(err.status_code(), Some(502));
        let err = ApiError::UnexpectedResponse { service: "commerce" };
        assert_eq!(err.status_code(), None);
    }
}
