use thiserror::Error;

/// Failure modes of the simulation core.
///
/// The transport layer alone maps these to wire sentinels: `OutOfDomain`
/// becomes `"alt error"`, other per-flight failures become `"error"`, and
/// `CycleUnavailable` becomes a 503.
#[derive(Debug, Error)]
pub enum SimError {
    /// A wind sample was requested outside the axis extent of the field.
    #[error("sample outside the wind-field domain")]
    OutOfDomain,

    /// A required remote artifact does not exist in the object store.
    #[error("artifact {0} not found in object store")]
    ArtifactMissing(String),

    /// No complete forecast cycle is available to serve requests.
    #[error("no complete forecast cycle available")]
    CycleUnavailable,

    /// Materializing a simulator failed after the one cache-bust retry.
    #[error("failed to build simulator for member {member}: {reason}")]
    SimulatorBuildFailed { member: u8, reason: String },

    /// The integrator produced a non-finite state component.
    #[error("integration produced a non-finite state")]
    IntegratorFailed,

    /// The request was cancelled cooperatively. Terminal, never retried.
    #[error("request cancelled")]
    Cancelled,

    /// The per-request deadline elapsed. Terminal.
    #[error("request deadline exceeded")]
    Timeout,
}

/// Errors from the object-store client and the on-disk artifact cache.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Permanent not-found; never retried.
    #[error("object {0} not found")]
    NotFound(String),

    #[error("object store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected object store response for {name}: {status}")]
    Status {
        name: String,
        status: reqwest::StatusCode,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Transient failures are worth retrying with backoff; a missing
    /// object is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::NotFound(_) => false,
            StoreError::Http(_) | StoreError::Io(_) => true,
            StoreError::Status { status, .. } => {
                status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
        }
    }
}
