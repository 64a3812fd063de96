use crate::ProcessorError;
use std::fmt;
use thiserror::Error;

/// Why a retried operation stopped without succeeding
#[derive(Debug, Error)]
pub enum RetryError<E: fmt::Debug + fmt::Display> {
    #[error("Maximum retries ({attempts}) exceeded: {last}")]
    MaxRetriesExceeded { attempts: u32, last: E },

    /// The operation failed in a way that retrying cannot fix
    #[error("{0}")]
    Permanent(E),

    #[error("Retry interrupted by shutdown signal")]
    Interrupted,
}

impl<E> From<RetryError<E>> for ProcessorError
where
    E: fmt::Debug + fmt::Display + Into<ProcessorError>,
{
    fn from(err: RetryError<E>) -> Self {
        match err {
            RetryError::MaxRetriesExceeded { last, .. } => last.into(),
            RetryError::Permanent(e) => e.into(),
            RetryError::Interrupted => ProcessorError::Shutdown,
        }
    }
}

impl<E: fmt::Debug + fmt::Display> RetryError<E> {
    pub fn is_max_retries(&self) -> bool {
        matches!(self, RetryError::MaxRetriesExceeded { .. })
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, RetryError::Interrupted)
    }

    /// The last error seen, if the operation ran at all
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::MaxRetriesExceeded { last, .. } | RetryError::Permanent(last) => Some(last),
            RetryError::Interrupted => None,
        }
    }
}
