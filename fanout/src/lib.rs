// Copyright © 2026 The Fanout Contributors
//
// This file is part of fanout, distributed under the GPLv3 or later.

//! Request-scoped asynchronous task manager.
//!
//! A [`Manager`] runs user-supplied [`Runnable`] work units concurrently
//! under a bounded worker pool, tracks each unit's lifecycle, and lets
//! callers wait on them individually, in aggregate, or in a winner-take-all
//! race. Cancellation flows through composable [`Scope`]s; [`with_retry`]
//! and [`with_timeout`] wrap work units with the common policies.

mod duration;
pub use duration::{parse_duration, HumanDuration, ParseDurationError};

mod error;
pub use error::{Error, Panicked, RetryExhausted};

mod manager;
pub use manager::{Config, Manager, WORKER_LIMIT_ENV};

mod retry;
pub use retry::{with_retry, Retry};

mod runnable;
pub use runnable::{run_fn, RunFn, Runnable};

mod scope;
pub use scope::Scope;

mod task;
pub use task::{ParseTaskIdError, Stats, Status, TaskId, TaskRecord};

mod timeout;
pub use timeout::{with_timeout, Timeout};
