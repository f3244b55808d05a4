// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Code that runs in every forked child.
//!
//! A worker owns a current-thread tokio runtime, its own queue connection and
//! at most one in-flight task. It reports status over the heartbeat channel
//! and tells the supervisor why it stopped through its exit code only.

use crate::config::Limits;
use crate::exit::{ExitCode, UNHANDLED_FAILURE, WorkerExit};
use crate::handler::{TaskHandler, TimeoutDisposition};
use crate::heartbeat::HeartbeatClient;
use crate::memory;
use crate::queue::{Item, QueueBackend, QueueConnector};
use crate::signals::{self, StopFlag};
use crate::state::{WorkerKind, WorkerStatus};
use crate::watchdog::{Guarded, TaskTimeout, Watchdog};
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use nix::unistd::{Pid, getpid};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

/// Everything a child needs, captured by the supervisor before forking.
pub struct WorkerContext {
    pub kind: WorkerKind,
    pub limits: Limits,
    pub reserve_timeout: Duration,
    pub heartbeat_socket: PathBuf,
    pub master_pid: Pid,
    pub connector: Arc<dyn QueueConnector>,
    pub handler: Arc<dyn TaskHandler>,
}

/// Child entry point; never returns.
pub fn run(ctx: WorkerContext) -> ! {
    let kind = ctx.kind;
    let exit = match bootstrap(ctx) {
        Ok(mut worker) => worker.run_loop(),
        Err(e) => {
            error!("[{kind}] worker bootstrap failed: {e:#}");
            ExitCode::ForkError.into()
        }
    };
    info!("[{kind}] worker exiting (pid={}, exit={exit})", getpid());
    log::logger().flush();
    std::process::exit(exit.code())
}

fn bootstrap(ctx: WorkerContext) -> Result<Worker> {
    signals::install().context("installing signal handlers")?;
    Worker::start(ctx, StopFlag::process())
}

pub(crate) struct Worker {
    kind: WorkerKind,
    pid: Pid,
    limits: Limits,
    reserve_timeout: Duration,
    watchdog: Watchdog,
    queue: Box<dyn QueueBackend>,
    handler: Arc<dyn TaskHandler>,
    heartbeat: HeartbeatClient,
    rt: Runtime,
    stop: StopFlag,
    baseline_rss: u64,
    tasks_done: u64,
    idle_since: Instant,
}

impl Worker {
    pub(crate) fn start(ctx: WorkerContext, stop: StopFlag) -> Result<Self> {
        let pid = getpid();
        info!(
            "[{}] worker started (pid={pid}, master={})",
            ctx.kind, ctx.master_pid
        );
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("building worker runtime")?;
        let queue = ctx.connector.connect().context("connecting to queue")?;
        let baseline_rss = memory::resident_bytes().unwrap_or(0);

        Ok(Self {
            kind: ctx.kind,
            pid,
            watchdog: Watchdog::new(ctx.limits.task_timeout),
            limits: ctx.limits,
            reserve_timeout: ctx.reserve_timeout,
            queue,
            handler: ctx.handler,
            heartbeat: HeartbeatClient::new(ctx.heartbeat_socket, pid.as_raw()),
            rt,
            stop,
            baseline_rss,
            tasks_done: 0,
            idle_since: Instant::now(),
        })
    }

    pub(crate) fn run_loop(&mut self) -> WorkerExit {
        loop {
            if self.stop.requested() {
                info!("[{}] stop requested (pid={})", self.kind, self.pid);
                self.queue.close();
                return ExitCode::Success.into();
            }

            let item = match self.queue.reserve(self.reserve_timeout) {
                Ok(item) => item,
                Err(e) => {
                    error!("[{}] reserve failed (pid={}): {e:#}", self.kind, self.pid);
                    return WorkerExit::Unknown(UNHANDLED_FAILURE);
                }
            };

            let Some(item) = item else {
                self.heartbeat.send(&self.rt, WorkerStatus::Idle);
                if self.kind == WorkerKind::Temporary
                    && self.idle_since.elapsed() > self.limits.idle_timeout
                {
                    info!(
                        "[{}] idle for {:?}, retiring (pid={})",
                        self.kind, self.limits.idle_timeout, self.pid
                    );
                    self.queue.close();
                    return ExitCode::IdleShutdown.into();
                }
                continue;
            };

            if let Some(exit) = self.process(item) {
                return exit;
            }
            if let Some(exit) = self.after_task() {
                return exit;
            }
        }
    }

    fn process(&mut self, item: Item) -> Option<WorkerExit> {
        self.heartbeat.send(&self.rt, WorkerStatus::Busy);
        debug!("[{}] processing item {} (pid={})", self.kind, item.id, self.pid);

        let handler = Arc::clone(&self.handler);
        let job_item = item.clone();
        match self
            .watchdog
            .guard(&self.rt, move || handler.execute(&job_item))
        {
            Guarded::Completed(Ok(())) => None,
            Guarded::Completed(Err(e)) => {
                error!(
                    "[{}] task {} failed (pid={}): {e:#}",
                    self.kind, item.id, self.pid
                );
                Some(WorkerExit::Unknown(UNHANDLED_FAILURE))
            }
            Guarded::Panicked(msg) => {
                error!(
                    "[{}] task {} panicked (pid={}): {msg}",
                    self.kind, item.id, self.pid
                );
                Some(WorkerExit::Unknown(UNHANDLED_FAILURE))
            }
            Guarded::Expired(limit) => {
                // The blocking thread cannot be cancelled; stop what it started.
                self.handler.abort();
                let timeout = TaskTimeout {
                    limit,
                    item_id: item.id.clone(),
                    pid: self.pid.as_raw(),
                    payload: item.payload_preview(),
                };
                match self.handler.on_timeout(&timeout) {
                    TimeoutDisposition::Fatal => {
                        error!("[{}] {timeout}", self.kind);
                        Some(ExitCode::TaskTimeout.into())
                    }
                    TimeoutDisposition::Continue => {
                        warn!("[{}] {timeout}, abandoning it", self.kind);
                        None
                    }
                }
            }
        }
    }

    /// Memory ceiling first, then the task quota.
    fn after_task(&mut self) -> Option<WorkerExit> {
        self.idle_since = Instant::now();

        if let Some(rss) = memory::resident_bytes() {
            let growth = rss.saturating_sub(self.baseline_rss);
            if growth > self.limits.per_worker_memory_bytes {
                warn!(
                    "[{}] memory grew by {growth} bytes, over the {} byte limit (pid={})",
                    self.kind, self.limits.per_worker_memory_bytes, self.pid
                );
                return Some(ExitCode::MemoryExceeded.into());
            }
        }

        self.tasks_done += 1;
        if let Some(quota) = self.limits.tasks_per_worker_quota
            && self.tasks_done >= quota
        {
            info!(
                "[{}] completed {} tasks, retiring (pid={})",
                self.kind, self.tasks_done, self.pid
            );
            self.queue.close();
            return Some(ExitCode::TaskQuotaReached.into());
        }
        None
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::handler::CommandHandler;
    use crate::queue::spool::SpoolDir;

    struct Pool {
        tmp: tempfile::TempDir,
        spool: SpoolDir,
        socket: PathBuf,
    }

    fn pool() -> Pool {
        let tmp = tempfile::tempdir().unwrap();
        let spool = SpoolDir::new(tmp.path().join("spool"));
        spool.ensure().unwrap();
        let socket = tmp.path().join("absent.sock");
        Pool {
            tmp,
            spool,
            socket,
        }
    }

    fn limits() -> Limits {
        Limits {
            max_workers: 4,
            resident_count: 1,
            per_worker_memory_bytes: 1 << 30,
            task_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            tasks_per_worker_quota: None,
        }
    }

    fn worker(
        pool: &Pool,
        kind: WorkerKind,
        limits: Limits,
        handler: Arc<dyn TaskHandler>,
    ) -> (Worker, StopFlag) {
        let stop = StopFlag::detached();
        let ctx = WorkerContext {
            kind,
            limits,
            reserve_timeout: Duration::from_millis(50),
            heartbeat_socket: pool.socket.clone(),
            master_pid: getpid(),
            connector: Arc::new(pool.spool.clone()),
            handler,
        };
        (Worker::start(ctx, stop).unwrap(), stop)
    }

    fn ok_handler() -> Arc<dyn TaskHandler> {
        Arc::new(|_: &Item| -> Result<()> { Ok(()) })
    }

    #[test]
    fn test_stop_request_exits_success() {
        let pool = pool();
        let (mut worker, stop) = worker(&pool, WorkerKind::Resident, limits(), ok_handler());
        stop.request();
        assert_eq!(worker.run_loop(), WorkerExit::Code(ExitCode::Success));
        assert!(!worker.queue.is_connected());
    }

    #[test]
    fn test_idle_temporary_retires() {
        let pool = pool();
        let limits = Limits {
            idle_timeout: Duration::from_millis(120),
            ..limits()
        };
        let (mut worker, _stop) = worker(&pool, WorkerKind::Temporary, limits, ok_handler());
        let start = Instant::now();
        assert_eq!(worker.run_loop(), WorkerExit::Code(ExitCode::IdleShutdown));
        assert!(start.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn test_quota_retires_and_leaves_backlog() {
        let pool = pool();
        for i in 0..3 {
            pool.spool.push(Some(&i.to_string()), b"x").unwrap();
        }
        let limits = Limits {
            tasks_per_worker_quota: Some(2),
            ..limits()
        };
        let (mut worker, _stop) = worker(&pool, WorkerKind::Resident, limits, ok_handler());
        assert_eq!(
            worker.run_loop(),
            WorkerExit::Code(ExitCode::TaskQuotaReached)
        );
        assert_eq!(worker.tasks_done, 2);
        assert_eq!(pool.spool.len().unwrap(), 1);
    }

    #[test]
    fn test_handler_error_is_unhandled_failure() {
        let pool = pool();
        pool.spool.push(Some("bad"), b"x").unwrap();
        let handler: Arc<dyn TaskHandler> =
            Arc::new(|_: &Item| -> Result<()> { anyhow::bail!("gateway refused") });
        let (mut worker, _stop) = worker(&pool, WorkerKind::Resident, limits(), handler);
        assert_eq!(worker.run_loop(), WorkerExit::Unknown(UNHANDLED_FAILURE));
    }

    #[test]
    #[allow(clippy::panic)]
    fn test_handler_panic_is_unhandled_failure() {
        let pool = pool();
        pool.spool.push(Some("boom"), b"x").unwrap();
        let handler: Arc<dyn TaskHandler> =
            Arc::new(|_: &Item| -> Result<()> { panic!("boom") });
        let (mut worker, _stop) = worker(&pool, WorkerKind::Resident, limits(), handler);
        assert_eq!(worker.run_loop(), WorkerExit::Unknown(UNHANDLED_FAILURE));
    }

    fn sleepy_handler() -> Arc<dyn TaskHandler> {
        Arc::new(|_: &Item| -> Result<()> {
            std::thread::sleep(Duration::from_millis(600));
            Ok(())
        })
    }

    #[test]
    fn test_timeout_is_fatal_by_default() {
        let pool = pool();
        pool.spool.push(Some("slow"), b"x").unwrap();
        let limits = Limits {
            task_timeout: Duration::from_millis(100),
            ..limits()
        };
        let (mut worker, _stop) = worker(&pool, WorkerKind::Resident, limits, sleepy_handler());
        let start = Instant::now();
        assert_eq!(worker.run_loop(), WorkerExit::Code(ExitCode::TaskTimeout));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    struct Tolerant;

    impl TaskHandler for Tolerant {
        fn execute(&self, _item: &Item) -> Result<()> {
            std::thread::sleep(Duration::from_millis(600));
            Ok(())
        }

        fn on_timeout(&self, timeout: &TaskTimeout) -> TimeoutDisposition {
            assert_eq!(timeout.item_id, "slow");
            TimeoutDisposition::Continue
        }
    }

    #[test]
    fn test_timeout_continue_keeps_serving() {
        let pool = pool();
        pool.spool.push(Some("slow"), b"x").unwrap();
        let limits = Limits {
            task_timeout: Duration::from_millis(100),
            tasks_per_worker_quota: Some(1),
            ..limits()
        };
        let (mut worker, _stop) = worker(&pool, WorkerKind::Resident, limits, Arc::new(Tolerant));
        assert_eq!(
            worker.run_loop(),
            WorkerExit::Code(ExitCode::TaskQuotaReached)
        );
    }

    #[test]
    fn test_timeout_kills_command_handler() {
        let pool = pool();
        pool.spool.push(Some("hung"), b"x").unwrap();
        let pidfile = pool.tmp.path().join("handler.pid");
        let handler = CommandHandler::new(
            "/bin/sh",
            vec![
                "-c".into(),
                format!("echo $$ > {}; exec sleep 30", pidfile.display()),
            ],
        );
        let limits = Limits {
            task_timeout: Duration::from_millis(300),
            ..limits()
        };
        let (mut worker, _stop) = worker(&pool, WorkerKind::Resident, limits, Arc::new(handler));
        assert_eq!(worker.run_loop(), WorkerExit::Code(ExitCode::TaskTimeout));

        let pid: i32 = std::fs::read_to_string(&pidfile)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !process_gone(pid) {
            assert!(
                Instant::now() < deadline,
                "handler command {pid} outlived the watchdog"
            );
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    fn process_gone(pid: i32) -> bool {
        // Reaped, or a zombie about to be.
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(") ")
                .is_some_and(|(_, rest)| rest.starts_with('Z')),
            Err(_) => true,
        }
    }

    #[test]
    fn test_memory_ceiling() {
        let pool = pool();
        pool.spool.push(Some("hog"), b"x").unwrap();
        let handler: Arc<dyn TaskHandler> = Arc::new(|_: &Item| -> Result<()> {
            let hog = vec![1u8; 32 * 1024 * 1024];
            std::mem::forget(hog);
            Ok(())
        });
        let limits = Limits {
            per_worker_memory_bytes: 1024 * 1024,
            ..limits()
        };
        let (mut worker, _stop) = worker(&pool, WorkerKind::Resident, limits, handler);
        assert_eq!(worker.run_loop(), WorkerExit::Code(ExitCode::MemoryExceeded));
    }
}
