// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::error::RegistryFull;
use crate::state::{WorkerKind, WorkerStatus};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRecord {
    pub pid: Pid,
    pub kind: WorkerKind,
    pub status: WorkerStatus,
    pub spawned_at: Instant,
}

/// Live workers keyed by pid, bounded by `max_workers`. Only the supervisor
/// mutates it.
#[derive(Debug)]
pub struct Registry {
    workers: HashMap<Pid, WorkerRecord>,
    capacity: usize,
}

impl Registry {
    pub(super) fn new(capacity: usize) -> Self {
        Self {
            workers: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.workers.len() >= self.capacity
    }

    pub fn free_slots(&self) -> usize {
        self.capacity.saturating_sub(self.workers.len())
    }

    pub fn any_idle(&self) -> bool {
        self.workers
            .values()
            .any(|w| w.status == WorkerStatus::Idle)
    }

    pub fn count(&self, kind: WorkerKind) -> usize {
        self.workers.values().filter(|w| w.kind == kind).count()
    }

    pub fn pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.workers.keys().copied().collect();
        pids.sort_unstable_by_key(|p| p.as_raw());
        pids
    }

    pub fn get(&self, pid: Pid) -> Option<&WorkerRecord> {
        self.workers.get(&pid)
    }

    /// New records start Idle.
    pub(super) fn insert(&mut self, pid: Pid, kind: WorkerKind) -> Result<(), RegistryFull> {
        if self.is_full() && !self.workers.contains_key(&pid) {
            return Err(RegistryFull {
                capacity: self.capacity,
            });
        }
        self.workers.insert(
            pid,
            WorkerRecord {
                pid,
                kind,
                status: WorkerStatus::Idle,
                spawned_at: Instant::now(),
            },
        );
        Ok(())
    }

    pub(super) fn remove(&mut self, pid: Pid) -> Option<WorkerRecord> {
        self.workers.remove(&pid)
    }

    /// Returns false for pids that are not registered.
    pub(super) fn set_status(&mut self, pid: Pid, status: WorkerStatus) -> bool {
        match self.workers.get_mut(&pid) {
            Some(record) => {
                record.status = status;
                true
            }
            None => false,
        }
    }

    pub(super) fn clear(&mut self) {
        self.workers.clear();
    }
}
