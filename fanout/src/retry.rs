// Copyright © 2026 The Fanout Contributors
//
// This file is part of fanout, distributed under the GPLv3 or later.

//! Retry wrapper.

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    error::{Error, RetryExhausted},
    runnable::Runnable,
    scope::Scope,
};

/// Wrap a work unit so it is retried on failure.
///
/// The inner unit is invoked up to `attempts + 1` times. After each failure
/// except the last the wrapper backs off linearly, `backoff * (n + 1)` for
/// the n-th attempt, unless the ambient scope fires first. Once every attempt
/// has failed the last error is returned wrapped in [`RetryExhausted`].
///
/// Composes with [`crate::with_timeout`] in either order: a timeout outside
/// the retry budgets all attempts together, a timeout inside budgets each
/// attempt separately.
pub fn with_retry<R>(runnable: R, attempts: u32, backoff: Duration) -> Retry<R> {
    Retry {
        inner: runnable,
        attempts,
        backoff,
    }
}

/// See [`with_retry`].
pub struct Retry<R> {
    inner: R,
    attempts: u32,
    backoff: Duration,
}

#[async_trait]
impl<T, R> Runnable<T> for Retry<R>
where
    R: Runnable<T>,
{
    async fn run(&self, scope: Scope) -> anyhow::Result<T> {
        let mut last = None;
        for attempt in 0..=self.attempts {
            if let Some(err) = scope.err() {
                return Err(err.into());
            }
            match self.inner.run(scope.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    tracing::debug!(attempt, err = %err, "attempt failed");
                    last = Some(err);
                },
            }
            if attempt < self.attempts {
                let delay = self.backoff * (attempt + 1);
                tokio::select! {
                    _ = scope.done() => return Err(scope.err().unwrap_or(Error::Canceled).into()),
                    _ = tokio::time::sleep(delay) => {},
                }
            }
        }
        let last = match last {
            Some(err) => err,
            None => anyhow::anyhow!("no attempt was made"),
        };
        Err(anyhow::Error::new(RetryExhausted {
            attempts: self.attempts + 1,
            last,
        }))
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::runnable::run_fn;

    fn failing_until(threshold: u32, calls: Arc<AtomicU32>) -> impl Runnable<String> {
        run_fn(move |_scope| {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < threshold {
                    Err(anyhow::anyhow!("temporary error"))
                } else {
                    Ok("success".to_owned())
                }
            }
        })
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let unit = with_retry(
            failing_until(3, Arc::clone(&calls)),
            3,
            Duration::from_millis(10),
        );

        let value = unit.run(Scope::new()).await.unwrap();
        assert_eq!(value, "success");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_wraps_the_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let unit = with_retry(
            failing_until(u32::MAX, Arc::clone(&calls)),
            2,
            Duration::from_millis(1),
        );

        let err = unit.run(Scope::new()).await.unwrap_err();
        let exhausted = err.downcast_ref::<RetryExhausted>().unwrap();
        assert_eq!(exhausted.attempts, 3);
        assert_eq!(exhausted.last.to_string(), "temporary error");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn a_fired_scope_stops_the_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let unit = with_retry(
            failing_until(u32::MAX, Arc::clone(&calls)),
            10,
            Duration::from_secs(3600),
        );

        let scope = Scope::new();
        let run = unit.run(scope.clone());
        let abort = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            scope.cancel();
        };
        let (outcome, ()) = tokio::join!(run, abort);

        let err = outcome.unwrap_err();
        assert!(err.downcast_ref::<Error>().map(Error::is_canceled).unwrap_or(false));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn an_already_done_scope_skips_every_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let unit = with_retry(
            failing_until(u32::MAX, Arc::clone(&calls)),
            3,
            Duration::from_millis(1),
        );

        let scope = Scope::new();
        scope.cancel();
        assert!(unit.run(scope).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
