// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Worker exit taxonomy.
//!
//! The exit status is the only thing a worker reports back to the supervisor
//! reliably, so these codes are a stable external contract: init systems and
//! other tooling can use them to tell a crash from a voluntary retirement.
//!
//! | code | meaning              | rebooted? |
//! |------|----------------------|-----------|
//! | 0    | success              | no        |
//! | 1    | fork error           | yes       |
//! | 2    | memory exceeded      | yes       |
//! | 3    | task timeout         | yes       |
//! | 4    | idle shutdown        | no        |
//! | 5    | task quota reached   | no        |
//! | 70   | unhandled failure    | yes       |
//! | *    | unknown / signal     | yes       |
//!
//! Only resident workers are ever rebooted.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::fmt;

/// Exit code for failures outside the taxonomy (EX_SOFTWARE).
pub const UNHANDLED_FAILURE: i32 = 70;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ExitCode {
    /// Orderly exit, normally after a stop request.
    Success = 0,
    /// The worker could not bootstrap itself after fork.
    ForkError = 1,
    MemoryExceeded = 2,
    TaskTimeout = 3,
    /// Temporary worker found no work for the idle window.
    IdleShutdown = 4,
    /// Preventive retirement after the configured number of tasks.
    TaskQuotaReached = 5,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ExitCode::Success),
            1 => Some(ExitCode::ForkError),
            2 => Some(ExitCode::MemoryExceeded),
            3 => Some(ExitCode::TaskTimeout),
            4 => Some(ExitCode::IdleShutdown),
            5 => Some(ExitCode::TaskQuotaReached),
            _ => None,
        }
    }

    /// Membership in the no-reboot set.
    pub fn is_expected(self) -> bool {
        matches!(
            self,
            ExitCode::Success | ExitCode::IdleShutdown | ExitCode::TaskQuotaReached
        )
    }

    fn name(self) -> &'static str {
        match self {
            ExitCode::Success => "success",
            ExitCode::ForkError => "fork-error",
            ExitCode::MemoryExceeded => "memory-exceeded",
            ExitCode::TaskTimeout => "task-timeout",
            ExitCode::IdleShutdown => "idle-shutdown",
            ExitCode::TaskQuotaReached => "task-quota-reached",
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// How a worker process ended, as observed by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Code(ExitCode),
    Unknown(i32),
    Signaled(Signal),
}

impl WorkerExit {
    pub fn from_code(code: i32) -> Self {
        ExitCode::from_code(code).map_or(WorkerExit::Unknown(code), WorkerExit::Code)
    }

    /// Returns `None` for statuses that do not mean the child is gone
    /// (still alive, stopped, continued).
    pub fn from_wait_status(status: WaitStatus) -> Option<(Pid, Self)> {
        match status {
            WaitStatus::Exited(pid, code) => Some((pid, WorkerExit::from_code(code))),
            WaitStatus::Signaled(pid, signal, _) => Some((pid, WorkerExit::Signaled(signal))),
            _ => None,
        }
    }

    pub fn is_expected(self) -> bool {
        match self {
            WorkerExit::Code(code) => code.is_expected(),
            WorkerExit::Unknown(_) | WorkerExit::Signaled(_) => false,
        }
    }

    /// Raw process exit code, using the shell convention for signals.
    pub fn code(self) -> i32 {
        match self {
            WorkerExit::Code(code) => code.code(),
            WorkerExit::Unknown(code) => code,
            WorkerExit::Signaled(signal) => 128 + signal as i32,
        }
    }
}

impl From<ExitCode> for WorkerExit {
    fn from(code: ExitCode) -> Self {
        WorkerExit::Code(code)
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Code(code) => write!(f, "{code}"),
            WorkerExit::Unknown(code) => write!(f, "unknown ({code})"),
            WorkerExit::Signaled(signal) => write!(f, "signal {signal}"),
        }
    }
}
