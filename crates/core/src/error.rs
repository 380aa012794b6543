use std::time::Duration;

/// Result alias that carries the custom [`MetronomeError`] type.
pub type Result<T> = std::result::Result<T, MetronomeError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum MetronomeError {
    /// A tempo, time signature or configuration value was out of range. The
    /// state that the call would have modified is left untouched.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The timing thread did not terminate within the bounded join window.
    /// This means the cancellable wait ignored its stop signal and should be
    /// treated as fatal by the caller.
    #[error("timing thread did not stop within {timeout:?}")]
    SchedulerStopFailure { timeout: Duration },
    /// The operating system refused to spawn a worker thread.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] std::io::Error),
    /// A click sink reported a failure while handling a beat.
    #[error("click sink failed: {0}")]
    Sink(String),
    /// A settings document could not be parsed.
    #[error("malformed settings: {0}")]
    Config(#[from] serde_json::Error),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Free-form message for failures without a dedicated variant.
    #[error("{0}")]
    Message(String),
}

impl MetronomeError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub(crate) fn invalid<T: Into<String>>(msg: T) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Returns `true` for errors that leave the metronome in an unknown state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SchedulerStopFailure { .. } | Self::Spawn(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_failure_is_fatal_but_invalid_argument_is_not() {
        let stop = MetronomeError::SchedulerStopFailure {
            timeout: Duration::from_secs(1),
        };
        assert!(stop.is_fatal());
        assert!(!MetronomeError::invalid("bpm 300").is_fatal());
        assert_eq!(
            MetronomeError::invalid("bpm 300").to_string(),
            "invalid argument: bpm 300"
        );
    }
}
