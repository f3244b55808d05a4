// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use super::registry::Registry;
use crate::error::QueueError;
use crate::exit::{ExitCode, WorkerExit};
use crate::queue::{QueueBackend, QueueConnector};
use crate::state::{Lifecycle, WorkerKind};
use log::warn;
use std::sync::Arc;

/// Which worker, if any, replaces one that just exited.
///
/// Nothing is forked once the pool is stopping. Temporary workers are never
/// replaced; the scaling rule restores capacity when it is needed. A resident
/// is replaced after an unexpected exit, and after reaching its task quota
/// when `replace_retired` is set.
pub fn reboot_decision(
    lifecycle: Lifecycle,
    exit: WorkerExit,
    kind: WorkerKind,
    replace_retired: bool,
) -> Option<WorkerKind> {
    if lifecycle == Lifecycle::Stopping || kind == WorkerKind::Temporary {
        return None;
    }
    let retired = exit == WorkerExit::Code(ExitCode::TaskQuotaReached);
    if !exit.is_expected() || (replace_retired && retired) {
        Some(WorkerKind::Resident)
    } else {
        None
    }
}

/// Decides, once per tick, whether the pool needs one more temporary worker.
pub trait ScalingSignal: Send {
    fn name(&self) -> &'static str;

    fn wants_temporary(&mut self, registry: &Registry) -> bool;
}

/// Grow when no worker reports idle.
#[derive(Debug, Default)]
pub struct IdleProxy;

impl ScalingSignal for IdleProxy {
    fn name(&self) -> &'static str {
        "idle"
    }

    fn wants_temporary(&mut self, registry: &Registry) -> bool {
        !registry.any_idle()
    }
}

/// Grow when the backlog per worker outnumbers the workers.
pub struct BacklogDepth {
    connector: Arc<dyn QueueConnector>,
    queue: Option<Box<dyn QueueBackend>>,
}

impl BacklogDepth {
    pub fn new(connector: Arc<dyn QueueConnector>) -> Self {
        Self {
            connector,
            queue: None,
        }
    }

    fn backlog(&mut self) -> Result<usize, QueueError> {
        if self.queue.is_none() {
            self.queue = Some(self.connector.connect()?);
        }
        match self.queue.as_mut() {
            Some(queue) => queue.length(),
            None => Ok(0),
        }
    }
}

impl ScalingSignal for BacklogDepth {
    fn name(&self) -> &'static str {
        "backlog"
    }

    fn wants_temporary(&mut self, registry: &Registry) -> bool {
        match self.backlog() {
            Ok(backlog) => backlog_exceeds_capacity(backlog, registry.len()),
            Err(e) => {
                warn!("backlog length unavailable: {e}");
                // Reconnect on the next tick.
                self.queue = None;
                false
            }
        }
    }
}

/// `ceil(backlog / workers) - workers > 0`; any backlog counts when there are
/// no workers.
pub fn backlog_exceeds_capacity(backlog: usize, workers: usize) -> bool {
    if workers == 0 {
        return backlog > 0;
    }
    backlog.div_ceil(workers) > workers
}
