// Copyright © 2026 The Fanout Contributors
//
// This file is part of fanout, distributed under the GPLv3 or later.

//! The work-unit capability.

use std::future::Future;

use async_trait::async_trait;

use crate::scope::Scope;

/// One unit of work: given a cancellation scope, produce a value or fail.
///
/// Implementations are expected to check the scope at their blocking points;
/// cancellation never aborts code that does not observe it. The same runnable
/// may be invoked more than once by wrapper combinators such as
/// [`crate::with_retry`].
#[async_trait]
pub trait Runnable<T>: Send + Sync {
    async fn run(&self, scope: Scope) -> anyhow::Result<T>;
}

/// Adapt a plain async function or closure into a [`Runnable`].
///
/// This is the bare-function variant of the capability:
///
/// ```ignore
/// let task = run_fn(|scope| async move {
///     scope.err().map_or(Ok("hello"), |err| Err(err.into()))
/// });
/// ```
pub fn run_fn<F, Fut, T>(f: F) -> RunFn<F>
where
    F: Fn(Scope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<T>> + Send,
{
    RunFn { f }
}

/// See [`run_fn`].
pub struct RunFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut, T> Runnable<T> for RunFn<F>
where
    F: Fn(Scope) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<T>> + Send,
{
    async fn run(&self, scope: Scope) -> anyhow::Result<T> {
        (self.f)(scope).await
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn closures_run_as_work_units() {
        let unit = run_fn(|_scope| async move { Ok(21 * 2) });
        assert_eq!(unit.run(Scope::new()).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn closures_observe_their_scope() {
        let unit = run_fn(|scope: Scope| async move {
            match scope.err() {
                Some(err) => Err(err.into()),
                None => Ok("live"),
            }
        });

        let scope = Scope::new();
        assert_eq!(unit.run(scope.clone()).await.unwrap(), "live");

        scope.cancel();
        assert!(unit.run(scope).await.is_err());
    }
}
