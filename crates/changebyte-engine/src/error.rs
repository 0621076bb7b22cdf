//! Pipeline error model.

use changebyte_state::StateError;
use changebyte_types::error::RelayError;

/// Categorized pipeline error.
///
/// `Relay` wraps a typed [`RelayError`] raised by a pipeline stage; its kind
/// carries the retry decision.
///
/// `Infrastructure` wraps host-side failures (state backend, connector
/// startup, panicked tasks) that abort the run instead of being retried.
#[derive(Debug)]
pub enum PipelineError {
    Relay(RelayError),
    Infrastructure(anyhow::Error),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Relay(e) => write!(f, "{e}"),
            Self::Infrastructure(e) => write!(f, "{e:#}"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<anyhow::Error> for PipelineError {
    fn from(e: anyhow::Error) -> Self {
        Self::Infrastructure(e)
    }
}

impl From<RelayError> for PipelineError {
    fn from(e: RelayError) -> Self {
        Self::Relay(e)
    }
}

impl From<StateError> for PipelineError {
    fn from(e: StateError) -> Self {
        Self::Infrastructure(anyhow::Error::new(e).context("state backend failure"))
    }
}

impl PipelineError {
    /// Returns `true` for relay errors whose kind feeds the backoff state
    /// machine.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Relay(e) => e.is_retryable(),
            Self::Infrastructure(_) => false,
        }
    }

    pub fn as_relay_error(&self) -> Option<&RelayError> {
        match self {
            Self::Relay(e) => Some(e),
            Self::Infrastructure(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use changebyte_types::error::ErrorKind;

    #[test]
    fn test_relay_error_retryability_passes_through() {
        let err = PipelineError::from(RelayError::writeback("HTTP_503", "source busy"));
        assert!(err.is_retryable());
        assert_eq!(err.as_relay_error().unwrap().kind, ErrorKind::Writeback);

        let err = PipelineError::from(RelayError::apply_rejected("NOT_NULL", "name"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_infrastructure_not_retryable() {
        let err = PipelineError::Infrastructure(anyhow::anyhow!("state db locked"));
        assert!(!err.is_retryable());
        assert!(err.as_relay_error().is_none());
    }

    #[test]
    fn test_state_error_becomes_infrastructure_with_context() {
        let err: PipelineError = StateError::Corrupt("bad row".into()).into();
        assert!(matches!(err, PipelineError::Infrastructure(_)));
        let msg = err.to_string();
        assert!(msg.contains("state backend failure"), "got: {msg}");
        assert!(msg.contains("bad row"), "got: {msg}");
    }

    #[test]
    fn test_display_relay() {
        let err = PipelineError::Relay(RelayError::publish("BROKER_DOWN", "no leader"));
        assert_eq!(err.to_string(), "[publish] BROKER_DOWN: no leader");
    }
}
