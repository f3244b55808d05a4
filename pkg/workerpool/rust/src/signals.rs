// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! SIGINT/SIGTERM become a flag that the monitor loop and the worker loop
//! poll. The handler itself only stores to an atomic.
//!
//! Handlers survive `fork`, so a signal delivered to a freshly forked worker
//! before it re-installs them still lands in the same flag.

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use std::sync::atomic::{AtomicBool, Ordering};

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_stop_signal(_: nix::libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

pub fn install() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_stop_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only performs an atomic store, which is
        // async-signal-safe.
        unsafe { sigaction(signal, &action) }?;
    }
    Ok(())
}

/// Cooperative cancellation token.
#[derive(Debug, Clone, Copy)]
pub struct StopFlag(&'static AtomicBool);

impl StopFlag {
    /// The flag set by the process signal handlers.
    pub fn process() -> Self {
        StopFlag(&STOP_REQUESTED)
    }

    pub fn requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Read and clear.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// A flag not wired to any signal.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        StopFlag(Box::leak(Box::new(AtomicBool::new(false))))
    }
}
