// Copyright © 2026 The Fanout Contributors
//
// This file is part of fanout, distributed under the GPLv3 or later.

//! Timeout wrapper.

use std::time::Duration;

use async_trait::async_trait;

use crate::{error::Error, runnable::Runnable, scope::Scope};

/// Wrap a work unit so it runs under a deadline of `limit`.
///
/// The inner unit runs under a child scope expiring after `limit`. If it
/// returns first its result is passed through; if the deadline fires first
/// the child scope is canceled and a timeout error is returned. The child
/// scope is released on every exit path.
pub fn with_timeout<R>(runnable: R, limit: Duration) -> Timeout<R> {
    Timeout {
        inner: runnable,
        limit,
    }
}

/// See [`with_timeout`].
pub struct Timeout<R> {
    inner: R,
    limit: Duration,
}

#[async_trait]
impl<T, R> Runnable<T> for Timeout<R>
where
    R: Runnable<T>,
{
    async fn run(&self, scope: Scope) -> anyhow::Result<T> {
        let child = scope.with_timeout(self.limit);
        let result = tokio::select! {
            biased;
            outcome = self.inner.run(child.clone()) => outcome,
            _ = child.done() => Err(child.err().unwrap_or(Error::Timeout).into()),
        };
        child.cancel();
        result
    }
}
