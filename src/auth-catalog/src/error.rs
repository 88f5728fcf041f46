use thiserror::Error;

/// Errors surfaced by the catalog core to its host.
///
/// Authentication outcomes (`UnknownUser`, `BadPassword`, ...) are not part of
/// this enum — they are structured values returned by
/// [`crate::authenticator::Authenticator`], not exceptional conditions. This
/// enum covers the loading/persistence side: the things that can go wrong
/// while talking to a backend or to disk.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("backend {addr} unreachable: {source}")]
    BackendUnreachable {
        addr: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("backend {addr} missing required privileges on {table}: {detail}")]
    PermissionsMissing {
        addr: String,
        table: &'static str,
        detail: String,
    },

    #[error("query against {addr} failed: {source}")]
    QueryFailed {
        addr: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("malformed host pattern {host:?}: {reason}")]
    ParseFailed { host: String, reason: String },

    #[error("catalog persistence I/O failed: {0}")]
    PersistenceIO(#[from] std::io::Error),
}

impl CatalogError {
    /// `QueryFailed` should be handled the same way as `BackendUnreachable`
    /// by callers that only care whether a server is usable right now.
    pub fn is_server_unusable(&self) -> bool {
        matches!(
            self,
            CatalogError::BackendUnreachable { .. } | CatalogError::QueryFailed { .. }
        )
    }
}
