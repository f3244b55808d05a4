// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use nix::errno::Errno;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Reasons the supervisor refuses to start.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("unsupported environment: {0}")]
    Environment(String),
    #[error("invalid pool limits: {0}")]
    InvalidLimits(String),
    #[error("could not bind heartbeat socket {path:?}")]
    Heartbeat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not install signal handlers")]
    Signals(#[from] Errno),
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue connection is closed")]
    Closed,
    #[error("queue i/o failed: {context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl QueueError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        QueueError::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("heartbeat frame of {0} bytes exceeds the limit")]
    TooLarge(usize),
    #[error("undecodable heartbeat payload")]
    Decode(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum PidFileError {
    #[error("another pool is running with pid {pid} (PID file {path:?})")]
    AlreadyRunning { path: PathBuf, pid: u32 },
    #[error("PID file {path:?} is not usable")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Refused registry insert; the pool is at `max_workers`.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("worker registry is full ({capacity} workers)")]
pub struct RegistryFull {
    pub capacity: usize,
}
