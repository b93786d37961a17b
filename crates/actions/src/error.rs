use {hearth_onboarding::TransportError, thiserror::Error};

/// Failures of the companion link itself.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("companion link is closed")]
    Closed,

    #[error("companion disconnected before replying")]
    Disconnected,

    #[error("no reply from companion within the timeout")]
    Timeout,

    #[error("invalid companion frame: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("reply {0} does not match any outstanding request")]
    UnknownReply(String),
}

/// Why an action run ended in failure. Never surfaced past the dispatcher
/// except through [`last_failure`](crate::ActionDispatcher::last_failure).
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("companion link is not immediately reachable")]
    TransportUnavailable,

    #[error("companion reply did not report whether the action fired")]
    NotFired,

    #[error("companion reported that the action failed")]
    RemoteExecutionFailed,

    #[error("companion did not reply in time")]
    LinkTimeout,

    #[error(transparent)]
    Link(LinkError),

    #[error("no server configured for {0}")]
    NoServer(String),

    #[error("direct call failed: {0}")]
    Direct(#[from] TransportError),
}

impl From<LinkError> for DispatchError {
    fn from(error: LinkError) -> Self {
        match error {
            LinkError::Timeout => Self::LinkTimeout,
            other => Self::Link(other),
        }
    }
}

impl DispatchError {
    /// Whether the direct network call should be tried after this failure.
    pub fn falls_back(&self) -> bool {
        !matches!(self, Self::RemoteExecutionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_remote_failure_skips_fallback() {
        assert!(!DispatchError::RemoteExecutionFailed.falls_back());
        assert!(DispatchError::NotFired.falls_back());
        assert!(DispatchError::from(LinkError::Timeout).falls_back());
        assert!(DispatchError::from(LinkError::Disconnected).falls_back());
    }

    #[test]
    fn link_timeout_maps_to_its_own_kind() {
        assert!(matches!(DispatchError::from(LinkError::Timeout), DispatchError::LinkTimeout));
        assert!(matches!(
            DispatchError::from(LinkError::Closed),
            DispatchError::Link(LinkError::Closed)
        ));
    }
}
