use crate::compose::RenderedBody;
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("rate limited by {transport}; gave up after {attempts} attempts")]
    RateLimited { transport: String, attempts: u32 },

    /// Access to the destination is gone (deleted channel, revoked permissions).
    #[error("destination {destination} rejected the message ({status})")]
    PermanentDestination { destination: String, status: u16 },

    #[error("{transport} returned HTTP {status}: {body}")]
    Http {
        transport: String,
        status: u16,
        body: String,
    },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::PermanentDestination { .. })
    }
}

/// Outbound chat transport. Implementations own rate-limit retry; callers see
/// only the final outcome of each attempt.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Post a new message and return its id.
    async fn send(&self, destination: &str, body: &RenderedBody) -> Result<String, TransportError>;

    /// Replace the content of an existing message and return its id.
    async fn update(
        &self,
        destination: &str,
        message_id: &str,
        body: &RenderedBody,
    ) -> Result<String, TransportError>;

    async fn health_check(&self) -> bool {
        true
    }
}
