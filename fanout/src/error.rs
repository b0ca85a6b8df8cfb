// Copyright © 2026 The Fanout Contributors
//
// This file is part of fanout, distributed under the GPLv3 or later.

//! The error taxonomy surfaced by the manager and the wrapper combinators.

use std::{any::Any, sync::Arc};

use serde::{Serialize, Serializer};

use crate::task::TaskId;

/// An error from one of the manager's public operations.
///
/// Display strings are stable: the embedding boundary classifies exceptions
/// by the "task timed out" / "task canceled" / "task not found" /
/// "task failed" / "task panicked" substrings.
///
/// The variant wrapping a task failure shares its cause behind an [`Arc`] so
/// that every concurrent awaiter of the same task observes the identical
/// error.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    /// The caller's scope reached its deadline.
    #[error("task timed out")]
    Timeout,

    /// The caller's scope was canceled, the task was explicitly canceled, or
    /// the manager is shutting down.
    #[error("task canceled")]
    Canceled,

    /// The id is not, or is no longer, in the task tables.
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// The work unit returned an error, or panicked (see [`Panicked`]).
    #[error("task failed: {0}")]
    Failed(Arc<anyhow::Error>),

    /// Malformed input to a public operation.
    #[error("invalid argument: {0}")]
    Argument(String),
}

impl Error {
    pub(crate) fn failed(cause: anyhow::Error) -> Self {
        Self::Failed(Arc::new(cause))
    }

    /// The underlying work-unit error, if this is a failure.
    pub fn cause(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Failed(cause) => Some(cause),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// True iff this is a failure whose cause is a reified panic.
    pub fn is_panic(&self) -> bool {
        self.cause()
            .map(|cause| cause.downcast_ref::<Panicked>().is_some())
            .unwrap_or(false)
    }
}

impl Serialize for Error {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl From<crate::duration::ParseDurationError> for Error {
    fn from(err: crate::duration::ParseDurationError) -> Self {
        Self::Argument(err.to_string())
    }
}

/// A panic caught inside a worker, reified as a task failure.
#[derive(Clone, Debug, thiserror::Error)]
#[error("task panicked: {message}")]
pub struct Panicked {
    pub message: String,
}

impl Panicked {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_owned()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        Self { message }
    }
}

/// Returned by the retry combinator once every attempt has failed. Wraps the
/// last attempt's error.
#[derive(Debug, thiserror::Error)]
#[error("retry exhausted after {attempts} attempts: {last}")]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last: anyhow::Error,
}
