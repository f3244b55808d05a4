// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Per-task deadline. The job runs on a blocking thread of the worker's
//! runtime; when the deadline passes the thread is abandoned and the caller
//! gets `Guarded::Expired` through the normal return path.

use std::any::Any;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Runtime;

#[derive(Debug)]
pub enum Guarded<T> {
    Completed(T),
    Panicked(String),
    Expired(Duration),
}

/// Handed to `TaskHandler::on_timeout`.
#[derive(Error, Debug, Clone)]
#[error("task {item_id} exceeded {limit:?} in worker {pid} (payload: {payload})")]
pub struct TaskTimeout {
    pub limit: Duration,
    pub item_id: String,
    pub pid: i32,
    /// Truncated payload for the log line.
    pub payload: String,
}

#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    limit: Option<Duration>,
}

impl Watchdog {
    /// A zero limit disables the deadline.
    pub fn new(limit: Duration) -> Self {
        Self {
            limit: (!limit.is_zero()).then_some(limit),
        }
    }

    pub fn limit(&self) -> Option<Duration> {
        self.limit
    }

    pub fn guard<T, F>(&self, rt: &Runtime, job: F) -> Guarded<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let handle = rt.spawn_blocking(job);
        let outcome = match self.limit {
            Some(limit) => rt.block_on(async { tokio::time::timeout(limit, handle).await }),
            None => Ok(rt.block_on(handle)),
        };
        match outcome {
            Ok(Ok(value)) => Guarded::Completed(value),
            Ok(Err(join_err)) => match join_err.try_into_panic() {
                Ok(panic) => Guarded::Panicked(panic_message(panic.as_ref())),
                Err(join_err) => Guarded::Panicked(join_err.to_string()),
            },
            Err(_elapsed) => Guarded::Expired(self.limit.unwrap_or_default()),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
