//! Handler outcome taxonomy.

use std::time::Duration;

use serde_json::Value as Json;

/// What a handler returns: an optional JSON result stored under its id in `status`.
pub type HandlerResult = Result<Option<Json>, HandlerError>;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Retry later: after `delay` if given, otherwise after the handler's backoff.
    #[error("{message}")]
    Temporary { message: String, delay: Option<Duration> },
    /// Never retried within the current change-cycle.
    #[error("{0}")]
    Permanent(String),
    /// Anything else; classified by the handler's error mode.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn temporary(message: impl Into<String>, delay: Duration) -> Self {
        Self::Temporary { message: message.into(), delay: Some(delay) }
    }

    pub fn retry(message: impl Into<String>) -> Self { Self::Temporary { message: message.into(), delay: None } }

    pub fn permanent(message: impl Into<String>) -> Self { Self::Permanent(message.into()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_render_without_wrapping() {
        assert_eq!(HandlerError::temporary("not ready", Duration::from_secs(5)).to_string(), "not ready");
        assert_eq!(HandlerError::permanent("bad spec").to_string(), "bad spec");
        let other: HandlerError = anyhow::anyhow!("boom").into();
        assert_eq!(other.to_string(), "boom");
    }
}
