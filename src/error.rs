use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kube error: {0}")]
    Kube(#[from] kube::Error),

    /// The slice cache disagrees with the tracker; the key must be retried
    /// once the informer catches up.
    #[error("EndpointSlice cache is out of date for {0}")]
    StaleCache(String),

    #[error("Invalid service key: {0}")]
    InvalidKey(String),

    #[error("Invalid destination path: {0}")]
    InvalidPath(String),

    #[error("Host {0} is not a cluster-local name")]
    HostNotFound(String),

    #[error("Cannot bind server: {0}")]
    Io(#[from] std::io::Error),

    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

impl Error {
    /// Retryable errors go back through the rate limiter; the rest are
    /// surfaced to the caller.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StaleCache(_) | Self::Kube(_))
    }
}
