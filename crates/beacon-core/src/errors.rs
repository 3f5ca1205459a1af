use crate::ids::ConnectionId;

/// Typed error hierarchy for hub operations.
/// Classifies errors as connection-fatal, benign, or degraded-mode.
#[derive(Clone, Debug, thiserror::Error)]
pub enum HubError {
    // Fatal to the connect attempt
    #[error("authentication failed: {0}")]
    Unauthenticated(String),
    #[error("connection id already registered: {0}")]
    DuplicateIdentity(ConnectionId),

    // Benign — target absent at dispatch time
    #[error("connection not found: {0}")]
    NotFound(ConnectionId),

    // Connection-local, handled inside the connection's loops
    #[error("transport closed")]
    TransportClosed,

    // Relay-only, degrades cross-instance delivery
    #[error("bus unavailable: {0}")]
    BusUnavailable(String),

    // Backpressure signal, recorded not raised
    #[error("outbound queue overflowed")]
    QueueOverflow,
}

impl HubError {
    /// Whether the error is expected under normal operation and must never
    /// propagate past the component that observed it.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::TransportClosed | Self::QueueOverflow
        )
    }

    /// Whether the error rejects the connect attempt it occurred on.
    pub fn is_connect_fatal(&self) -> bool {
        matches!(self, Self::Unauthenticated(_) | Self::DuplicateIdentity(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "unauthenticated",
            Self::DuplicateIdentity(_) => "duplicate_identity",
            Self::NotFound(_) => "not_found",
            Self::TransportClosed => "transport_closed",
            Self::BusUnavailable(_) => "bus_unavailable",
            Self::QueueOverflow => "queue_overflow",
        }
    }
}
