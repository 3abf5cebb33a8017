use std::fmt;

use crate::graph::GraphError;

/// What went wrong, without the details.
/// The first two are deployment bugs; the rest describe the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Validation,
    EndpointNotFound,
    UpstreamUnavailable,
    UpstreamError,
    MalformedResponse,
    Network,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::EndpointNotFound => "EndpointNotFound",
            ErrorKind::UpstreamUnavailable => "UpstreamUnavailable",
            ErrorKind::UpstreamError => "UpstreamError",
            ErrorKind::MalformedResponse => "MalformedResponse",
            ErrorKind::Network => "NetworkError",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("workflow validation failed: {0}")]
    Validation(#[from] GraphError),

    #[error("{model}: workflow has {slots} image input(s), but {supplied} reference image(s) were supplied")]
    ReferenceCount {
        model: String,
        slots: usize,
        supplied: usize,
    },

    /// 404 from the backend. Almost always a wrong base URL.
    #[error("endpoint not found: {url}")]
    EndpointNotFound { url: String },

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream error ({status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Configuration(_) => ErrorKind::Configuration,
            DispatchError::Validation(_) | DispatchError::ReferenceCount { .. } => {
                ErrorKind::Validation
            }
            DispatchError::EndpointNotFound { .. } => ErrorKind::EndpointNotFound,
            DispatchError::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            DispatchError::Upstream { .. } => ErrorKind::UpstreamError,
            DispatchError::MalformedResponse(_) => ErrorKind::MalformedResponse,
            DispatchError::Network(_) => ErrorKind::Network,
        }
    }
}

/// Either a `data:image/png;base64,...` URL, or a classified error.
pub type DispatchResult = Result<String, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        let err = DispatchError::from(GraphError::NodeNotFound("6".to_string()));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.to_string(), "workflow validation failed: node 6 not found in workflow");

        let err = DispatchError::ReferenceCount {
            model: "sdxl".to_string(),
            slots: 1,
            supplied: 2,
        };
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = DispatchError::Upstream {
            status: 500,
            body: "boom".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::UpstreamError);
        assert_eq!(err.kind().to_string(), "UpstreamError");
        assert_eq!(ErrorKind::Network.to_string(), "NetworkError");
    }
}
