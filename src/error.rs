use thiserror::Error;

/// Error taxonomy shared across the registry, controller and proxy layers.
///
/// Storage and runtime failures stay typed until the HTTP/gRPC edge, where
/// they are translated to status codes. Messages never carry raw filesystem
/// paths.
#[derive(Debug, Error)]
pub enum Error {
    #[error("route not found: {domain}")]
    RouteNotFound { domain: String },

    #[error("route already exists: {domain}")]
    RouteExists { domain: String },

    #[error("route domain must not be empty")]
    RouteDomainEmpty,

    #[error("route image must not be empty")]
    RouteImageEmpty,

    #[error("attachment not found: {image} on {target}")]
    AttachmentNotFound { target: String, image: String },

    #[error("attachment already exists: {image} on {target}")]
    AttachmentExists { target: String, image: String },

    #[error("attachment image must not be empty")]
    AttachmentImageEmpty,

    #[error("attachment target must not be empty")]
    AttachmentTargetEmpty,

    #[error("blob not found: {digest}")]
    BlobNotFound { digest: String },

    #[error("manifest not found: {repository}:{reference}")]
    ManifestNotFound {
        repository: String,
        reference: String,
    },

    #[error("upload session not found: {uuid}")]
    UploadNotFound { uuid: String },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("deploy failed for {domain}: {reason}")]
    DeployFailed { domain: String, reason: String },

    #[error("job already running: {id}")]
    JobRunning { id: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// True for the 404-equivalent variants.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::RouteNotFound { .. }
                | Error::AttachmentNotFound { .. }
                | Error::BlobNotFound { .. }
                | Error::ManifestNotFound { .. }
                | Error::UploadNotFound { .. }
                | Error::NotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
