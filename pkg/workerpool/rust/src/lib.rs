// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

// Correctness
#![deny(clippy::indexing_slicing)]
#![deny(clippy::string_slice)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::undocumented_unsafe_blocks)]
// Panicking code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unimplemented)]
#![deny(clippy::todo)]
// Debug code that shouldn't be in production
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]

//! Self-managing pool of forked worker processes.
//!
//! A [`supervisor::Supervisor`] forks resident workers, adds temporary ones
//! under load, reboots residents that die unexpectedly and drains the pool
//! on SIGINT/SIGTERM. Workers pull items from a [`queue::QueueBackend`] and
//! hand them to a [`handler::TaskHandler`] under a per-task watchdog.

pub mod config;
pub mod error;
pub mod exit;
pub mod handler;
pub mod heartbeat;
pub mod memory;
pub mod pidfile;
pub mod queue;
pub mod signals;
pub mod state;
pub mod supervisor;
pub mod watchdog;
pub mod worker;

pub use config::{Limits, PoolConfig, PoolSettings, ScalingMode};
pub use error::{PidFileError, QueueError, StartupError};
pub use exit::{ExitCode, WorkerExit};
pub use handler::{CommandHandler, TaskHandler, TimeoutDisposition};
pub use pidfile::PidFile;
pub use queue::{Item, QueueBackend, QueueConnector};
pub use state::{Lifecycle, WorkerKind, WorkerStatus};
pub use supervisor::{PoolStats, Supervisor};
