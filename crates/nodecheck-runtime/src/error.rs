use miette::Diagnostic;
use thiserror::Error;

/// Error type for cluster API access and probe reconciliation
#[derive(Error, Debug, Diagnostic)]
pub enum ProbeError {
    /// Object already exists on the API server
    #[error("{kind} already exists: {name}")]
    #[diagnostic(
        code(nodecheck::runtime::already_exists),
        help("Probe pods are named after the node UID, so an existing probe is reused rather than recreated")
    )]
    AlreadyExists {
        #[allow(unused)]
        kind: String,
        #[allow(unused)]
        name: String,
    },

    /// Object not found on the API server
    #[error("{kind} not found: {name}")]
    #[diagnostic(
        code(nodecheck::runtime::not_found),
        help("The object was probably removed between listing and acting on it")
    )]
    NotFound {
        #[allow(unused)]
        kind: String,
        #[allow(unused)]
        name: String,
    },

    /// Transport-level HTTP failure
    #[error("HTTP request failed: {message}")]
    #[diagnostic(
        code(nodecheck::runtime::http_error),
        help("Verify the API server address is reachable from this host and that TLS settings match the cluster")
    )]
    HttpError {
        #[allow(unused)]
        message: String,
    },

    /// API server answered with a non-success status
    #[error("{operation} failed with status {status}: {body}")]
    #[diagnostic(
        code(nodecheck::runtime::api_status),
        help("Check the RBAC rules of the service account: nodecheck needs list on nodes, list/create/delete on pods and update on nodes/status")
    )]
    ApiStatus {
        #[allow(unused)]
        operation: String,
        #[allow(unused)]
        status: u16,
        #[allow(unused)]
        body: String,
    },

    /// Failed to decode an API response
    #[error("Failed to decode {what}: {message}")]
    #[diagnostic(
        code(nodecheck::runtime::decode_error),
        help("The API server returned an unexpected payload. Check that it serves the core/v1 API")
    )]
    DecodeError {
        #[allow(unused)]
        what: String,
        #[allow(unused)]
        message: String,
    },

    /// Kubeconfig could not be loaded
    #[error("Invalid kubeconfig '{path}': {message}")]
    #[diagnostic(code(nodecheck::runtime::kubeconfig), help("{suggestion}"))]
    KubeconfigError {
        #[allow(unused)]
        path: String,
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        suggestion: String,
    },

    /// In-cluster service account configuration is unavailable
    #[error("In-cluster configuration unavailable: {message}")]
    #[diagnostic(
        code(nodecheck::runtime::in_cluster),
        help("Outside a pod, point KUBECONFIG at a kubeconfig file. Inside a pod, make sure the service account token is mounted")
    )]
    InClusterError {
        #[allow(unused)]
        message: String,
    },

    /// Internal error
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(nodecheck::runtime::internal_error),
        help("This is likely a bug in nodecheck-runtime. Please report it with the full error details")
    )]
    InternalError {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, ProbeError>;

impl ProbeError {
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn http_error(message: impl Into<String>) -> Self {
        Self::HttpError {
            message: message.into(),
        }
    }

    pub fn api_status(operation: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self::ApiStatus {
            operation: operation.into(),
            status,
            body: body.into(),
        }
    }

    pub fn decode_error(what: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DecodeError {
            what: what.into(),
            message: message.into(),
        }
    }

    pub fn kubeconfig_error(
        path: impl Into<String>,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::KubeconfigError {
            path: path.into(),
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn in_cluster_error(message: impl Into<String>) -> Self {
        Self::InClusterError {
            message: message.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Whether the API server rejected a create because the object exists
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
