// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! The master process.
//!
//! The supervisor is synchronous and single-threaded so that `fork` is always
//! called from a process with exactly one thread. Each monitor tick does, in
//! order:
//!
//! 1. turn a pending SIGINT/SIGTERM into `shutdown()`;
//! 2. reap at most one exited child and apply the reboot policy;
//! 3. drain heartbeats into the registry;
//! 4. apply the scaling rule;
//! 5. sleep `tick_interval`, unless a child was reaped.

mod policy;
mod registry;
mod stats;

pub use policy::{
    BacklogDepth, IdleProxy, ScalingSignal, backlog_exceeds_capacity, reboot_decision,
};
pub use registry::{Registry, WorkerRecord};
pub use stats::PoolStats;

use crate::config::{PoolSettings, ScalingMode};
use crate::error::StartupError;
use crate::exit::{ExitCode, WorkerExit};
use crate::handler::TaskHandler;
use crate::heartbeat::HeartbeatServer;
use crate::queue::QueueConnector;
use crate::signals::{self, StopFlag};
use crate::state::{Lifecycle, WorkerKind};
use crate::worker::{self, WorkerContext};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::{ForkResult, Pid, fork, getpid};
use std::path::PathBuf;
use std::sync::Arc;

const FORK_ATTEMPTS: u32 = 3;

/// Which side of a fork we ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master { child: Pid },
    Worker(WorkerKind),
}

pub struct Supervisor {
    settings: PoolSettings,
    connector: Arc<dyn QueueConnector>,
    handler: Arc<dyn TaskHandler>,
    registry: Registry,
    lifecycle: Lifecycle,
    master_pid: Pid,
    heartbeat: Option<HeartbeatServer>,
    socket_path: PathBuf,
    scaling: Box<dyn ScalingSignal>,
    stop: StopFlag,
    stats: PoolStats,
    saturated: bool,
}

impl Supervisor {
    pub fn new(
        settings: PoolSettings,
        connector: Arc<dyn QueueConnector>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        let scaling: Box<dyn ScalingSignal> = match settings.scaling {
            ScalingMode::Idle => Box::new(IdleProxy),
            ScalingMode::Backlog => Box::new(BacklogDepth::new(Arc::clone(&connector))),
        };
        Self {
            registry: Registry::new(settings.limits.max_workers),
            socket_path: settings.heartbeat_socket.clone().unwrap_or_default(),
            settings,
            connector,
            handler,
            lifecycle: Lifecycle::Starting,
            master_pid: getpid(),
            heartbeat: None,
            scaling,
            stop: StopFlag::process(),
            stats: PoolStats::default(),
            saturated: false,
        }
    }

    pub fn with_scaling_signal(mut self, signal: Box<dyn ScalingSignal>) -> Self {
        self.scaling = signal;
        self
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Run the pool until it has been stopped and every worker has exited.
    pub fn start(mut self) -> Result<PoolStats, StartupError> {
        check_environment()?;
        self.settings.validate()?;

        self.master_pid = getpid();
        self.socket_path = match &self.settings.heartbeat_socket {
            Some(path) => path.clone(),
            None => default_socket_path(&self.settings.name, self.master_pid),
        };
        if let Some(dir) = self.socket_path.parent()
            && !dir.as_os_str().is_empty()
            && !dir.is_dir()
        {
            return Err(StartupError::Environment(format!(
                "heartbeat socket directory {} does not exist",
                dir.display()
            )));
        }
        let server =
            HeartbeatServer::bind(&self.socket_path).map_err(|source| StartupError::Heartbeat {
                path: self.socket_path.clone(),
                source,
            })?;
        self.heartbeat = Some(server);
        signals::install()?;

        let limits = &self.settings.limits;
        info!(
            "[{}] supervisor started (pid={}, residents={}, max_workers={}, scaling={}, socket={})",
            self.settings.name,
            self.master_pid,
            limits.resident_count,
            limits.max_workers,
            self.scaling.name(),
            self.socket_path.display()
        );

        let wanted = self.settings.limits.resident_count;
        let forked = self.fork(WorkerKind::Resident, wanted);
        if forked < wanted {
            warn!("started {forked} of {wanted} resident workers");
        }
        self.transition(Lifecycle::Running);
        self.monitor_loop();

        self.heartbeat = None;
        info!(
            "[{}] pool drained: {}",
            self.settings.name,
            serde_json::to_string(&self.stats).unwrap_or_default()
        );
        Ok(self.stats)
    }

    /// Fork up to `count` workers of `kind`, bounded by free capacity.
    /// Returns how many were started.
    fn fork(&mut self, kind: WorkerKind, count: usize) -> usize {
        if self.lifecycle == Lifecycle::Stopping {
            return 0;
        }
        let mut started = 0;
        for _ in 0..count.min(self.registry.free_slots()) {
            if self.fork_with_retry(kind).is_some() {
                started += 1;
            }
        }
        started
    }

    fn fork_with_retry(&mut self, kind: WorkerKind) -> Option<Pid> {
        for attempt in 1..=FORK_ATTEMPTS {
            match self.spawn(kind) {
                Ok(Role::Master { child }) => return Some(child),
                Ok(Role::Worker(kind)) => self.become_worker(kind),
                Err(e) => warn!("[{kind}] fork attempt {attempt}/{FORK_ATTEMPTS} failed: {e}"),
            }
        }
        error!(
            "[{kind}] could not fork worker: {}",
            WorkerExit::Code(ExitCode::ForkError)
        );
        self.stats.fork_failures += 1;
        None
    }

    fn spawn(&mut self, kind: WorkerKind) -> nix::Result<Role> {
        // Buffered log lines would otherwise be written twice.
        log::logger().flush();
        // SAFETY: the supervisor never starts threads, so the child inherits a
        // consistent address space and may keep running Rust code.
        let role = match unsafe { fork() }? {
            ForkResult::Parent { child } => Role::Master { child },
            ForkResult::Child => Role::Worker(kind),
        };
        if let Role::Master { child } = role {
            if let Err(e) = self.registry.insert(child, kind) {
                // free_slots() bounds every fork, so this means a bookkeeping bug.
                error!("[{kind}] spawned worker (pid={child}) not tracked: {e}");
            }
            self.stats.forked += 1;
            self.stats.peak_workers = self.stats.peak_workers.max(self.registry.len());
            info!("[{kind}] spawned worker (pid={child})");
        }
        Ok(role)
    }

    /// Shed master state and run the worker loop in this child.
    fn become_worker(&mut self, kind: WorkerKind) -> ! {
        self.registry.clear();
        self.heartbeat = None;
        self.scaling = Box::new(IdleProxy);
        worker::run(WorkerContext {
            kind,
            limits: self.settings.limits.clone(),
            reserve_timeout: self.settings.reserve_timeout,
            heartbeat_socket: self.socket_path.clone(),
            master_pid: self.master_pid,
            connector: Arc::clone(&self.connector),
            handler: Arc::clone(&self.handler),
        })
    }

    fn monitor_loop(&mut self) {
        loop {
            if self.stop.take() {
                self.shutdown();
            }
            let reaped = self.reap_one();
            self.drain_heartbeats();
            self.apply_scaling_rule();

            if self.lifecycle == Lifecycle::Stopping && self.registry.is_empty() {
                break;
            }
            if !reaped {
                std::thread::sleep(self.settings.tick_interval);
            }
        }
    }

    fn reap_one(&mut self) -> bool {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => match WorkerExit::from_wait_status(status) {
                Some((pid, exit)) => {
                    self.on_worker_exit(pid, exit);
                    true
                }
                None => false,
            },
            Err(Errno::ECHILD) => {
                if !self.registry.is_empty() {
                    warn!(
                        "no children left but {} workers registered, clearing",
                        self.registry.len()
                    );
                    self.registry.clear();
                }
                false
            }
            Err(Errno::EINTR) => false,
            Err(e) => {
                warn!("waitpid failed: {e}");
                false
            }
        }
    }

    fn on_worker_exit(&mut self, pid: Pid, exit: WorkerExit) {
        let Some(record) = self.registry.remove(pid) else {
            debug!("reaped untracked child (pid={pid}, exit={exit})");
            return;
        };
        self.stats.exits += 1;
        if exit.is_expected() {
            self.stats.expected_exits += 1;
            info!("worker exited (pid={pid}, kind={}, exit={exit})", record.kind);
        } else {
            warn!("worker exited (pid={pid}, kind={}, exit={exit})", record.kind);
        }

        if let Some(kind) = reboot_decision(
            self.lifecycle,
            exit,
            record.kind,
            self.settings.replace_retired_residents,
        ) {
            info!("rebooting {kind} worker (replacing pid={pid})");
            if self.fork(kind, 1) > 0 {
                self.stats.reboots += 1;
            }
        }
    }

    fn drain_heartbeats(&mut self) {
        let Some(server) = self.heartbeat.as_mut() else {
            return;
        };
        let registry = &mut self.registry;
        let result = server.poll(self.settings.poll_timeout, |message| {
            let pid = Pid::from_raw(message.pid);
            if !registry.set_status(pid, message.status) {
                debug!("ignoring heartbeat from untracked pid {pid}");
            }
        });
        if let Err(e) = result {
            warn!("heartbeat poll failed: {e}");
        }
    }

    fn apply_scaling_rule(&mut self) {
        if self.lifecycle != Lifecycle::Running {
            return;
        }
        if !self.scaling.wants_temporary(&self.registry) {
            self.saturated = false;
            return;
        }
        if self.registry.is_full() {
            self.stats.saturated_ticks += 1;
            if !self.saturated {
                warn!(
                    "pool saturated ({} workers, signal={})",
                    self.registry.len(),
                    self.scaling.name()
                );
                self.saturated = true;
            }
            return;
        }
        debug!("scaling signal {} requests a temporary worker", self.scaling.name());
        self.fork(WorkerKind::Temporary, 1);
    }

    /// Stop forking and ask every worker to finish. Never force-kills.
    pub fn shutdown(&mut self) {
        if self.lifecycle == Lifecycle::Stopping {
            return;
        }
        self.transition(Lifecycle::Stopping);
        info!(
            "[{}] shutting down {} workers",
            self.settings.name,
            self.registry.len()
        );
        for pid in self.registry.pids() {
            info!("sending SIGINT to worker (pid={pid})");
            if let Err(e) = kill(pid, Signal::SIGINT) {
                warn!("could not signal worker (pid={pid}): {e}");
            }
        }
    }

    fn transition(&mut self, next: Lifecycle) -> bool {
        if !self.lifecycle.can_transition_to(next) {
            warn!("refusing lifecycle transition {} -> {next}", self.lifecycle);
            return false;
        }
        debug!("lifecycle {} -> {next}", self.lifecycle);
        self.lifecycle = next;
        true
    }
}

fn check_environment() -> Result<(), StartupError> {
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
    {
        use nix::sys::resource::{Resource, getrlimit};
        let (soft, _) = getrlimit(Resource::RLIMIT_NPROC).map_err(|e| {
            StartupError::Environment(format!("could not read RLIMIT_NPROC: {e}"))
        })?;
        if soft == 0 {
            return Err(StartupError::Environment(
                "RLIMIT_NPROC is 0, cannot fork workers".to_string(),
            ));
        }
    }
    Ok(())
}

fn default_socket_path(name: &str, master: Pid) -> PathBuf {
    let name: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    std::env::temp_dir().join(format!("dd-workerpool-{name}-{master}.sock"))
}
