//! Error types for the listener and the per-session relay.

use crate::BoxError;
use crate::audit::AuditError;
use derive_more::Display;
use thiserror::Error;

/// Startup and listener failures. Fatal for the whole process.
#[derive(Debug, Error)]
#[error("server error: {kind}")]
pub struct ServerError {
    kind: ServerErrorKind,
    #[source]
    source: Option<BoxError>,
}

/// Categories of server failures.
#[derive(Debug, Display, Eq, PartialEq)]
pub enum ServerErrorKind {
    /// The configured listen endpoint did not resolve or could not be bound.
    #[display("Failed to bind {}", address)]
    Bind {
        /// The configured endpoint.
        address: String,
    },
    /// `disable_ipv6_bind` filtered every resolved address away.
    #[display("No usable address for {}", address)]
    NoAddress {
        /// The configured endpoint.
        address: String,
    },
    /// The configuration carries no bastion private key.
    #[display("No bastion private keys configured")]
    NoHostKeys,
}

impl ServerError {
    pub(crate) fn new(kind: ServerErrorKind) -> Self {
        ServerError { kind, source: None }
    }

    pub(crate) fn with_source(kind: ServerErrorKind, source: impl Into<BoxError>) -> Self {
        ServerError {
            kind,
            source: Some(source.into()),
        }
    }

    /// Return the inner error kind.
    pub fn kind(&self) -> &ServerErrorKind {
        &self.kind
    }
}

/// Failures inside one relayed session. These close the session; the server
/// keeps serving other connections.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The audit trail could not be written. Hard teardown by design.
    #[error(transparent)]
    Audit(#[from] AuditError),
    /// SSH transport failure on either side of the relay.
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),
    /// The inbound session channel went away.
    #[error("session channel closed")]
    ChannelClosed,
}
