// Copyright © 2026 The Fanout Contributors
//
// This file is part of fanout, distributed under the GPLv3 or later.

//! Cancellation scopes.
//!
//! A [`Scope`] is the composable token every operation and every work unit
//! receives: it carries a cancellation signal, an optional deadline and the
//! manager binding used to locate a manager from nested code. Derived scopes
//! inherit cancellation from their parent, so firing a request's root scope
//! tears down everything submitted under it.

use std::{any::Any, fmt, sync::Arc, time::Duration};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

#[derive(Clone, Default)]
pub struct Scope {
    token: CancellationToken,
    deadline: Option<Instant>,
    binding: Option<Arc<dyn Any + Send + Sync>>,
}

impl Scope {
    /// A root scope: never expires, fires only via [`Scope::cancel`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a child scope. Cancelling the parent cancels the child; the
    /// child can be canceled on its own without affecting the parent. The
    /// deadline and the manager binding are inherited.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            binding: self.binding.clone(),
        }
    }

    /// Derive a child scope that also expires after `timeout`. A deadline
    /// inherited from the parent is kept if it is earlier.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut child = self.child();
        if let Some(deadline) = Instant::now().checked_add(timeout) {
            child.deadline = Some(match child.deadline {
                Some(inherited) if inherited < deadline => inherited,
                _ => deadline,
            });
        }
        child
    }

    /// Derive a child scope from a boundary-style millisecond timeout, where
    /// zero or negative means "no deadline".
    pub fn with_timeout_millis(&self, millis: i64) -> Self {
        if millis <= 0 {
            self.child()
        } else {
            self.with_timeout(Duration::from_millis(millis as u64))
        }
    }

    /// Fire this scope's cancellation signal.
    pub fn cancel(&self) {
        self.token.cancel()
    }

    /// Resolves once the scope is canceled or its deadline has passed.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => {},
                _ = tokio::time::sleep_until(deadline) => {},
            },
            None => self.token.cancelled().await,
        }
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline_passed()
    }

    /// Why the scope is done: [`Error::Timeout`] when the deadline passed,
    /// [`Error::Canceled`] when the signal fired, `None` while still live.
    pub fn err(&self) -> Option<Error> {
        if self.deadline_passed() {
            Some(Error::Timeout)
        } else if self.token.is_cancelled() {
            Some(Error::Canceled)
        } else {
            None
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn deadline_passed(&self) -> bool {
        self.deadline
            .map(|deadline| deadline <= Instant::now())
            .unwrap_or(false)
    }

    /// The raw cancellation trigger, recorded by the manager so an explicit
    /// cancel can fire this scope without holding on to the whole [`Scope`].
    pub(crate) fn trigger(&self) -> CancellationToken {
        self.token.clone()
    }

    pub(crate) fn with_binding(&self, value: Arc<dyn Any + Send + Sync>) -> Self {
        let mut child = self.child();
        child.binding = Some(value);
        child
    }

    pub(crate) fn binding(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.binding.as_deref()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Scope")
            .field("cancelled", &self.token.is_cancelled())
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}
