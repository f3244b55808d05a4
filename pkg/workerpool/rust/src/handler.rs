// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::HandlerConfig;
use crate::queue::Item;
use crate::watchdog::TaskTimeout;
use anyhow::{Context, Result, bail};
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::io::{self, Write};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::{Mutex, MutexGuard};

/// What a worker does after its watchdog fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutDisposition {
    /// Exit with the task-timeout code; residents are rebooted.
    #[default]
    Fatal,
    /// Keep serving; the expired task has already been aborted.
    Continue,
}

/// Business callback run for every item.
pub trait TaskHandler: Send + Sync + 'static {
    fn execute(&self, item: &Item) -> Result<()>;

    /// Called from the worker thread when the watchdog fires, while
    /// `execute` may still be running. Must stop whatever `execute` started.
    fn abort(&self) {}

    fn on_timeout(&self, _timeout: &TaskTimeout) -> TimeoutDisposition {
        TimeoutDisposition::Fatal
    }
}

impl<F> TaskHandler for F
where
    F: Fn(&Item) -> Result<()> + Send + Sync + 'static,
{
    fn execute(&self, item: &Item) -> Result<()> {
        self(item)
    }
}

/// Runs one process per item with the payload on stdin.
///
/// Each process leads its own process group, so terminal interrupts aimed at
/// the pool do not reach it and `abort` can take down its descendants too.
#[derive(Debug)]
pub struct CommandHandler {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    /// Process group of the command currently running, if any.
    running: Mutex<Option<Pid>>,
}

impl CommandHandler {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
            running: Mutex::new(None),
        }
    }

    pub fn from_config(config: &HandlerConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Pid>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl TaskHandler for CommandHandler {
    fn execute(&self, item: &Item) -> Result<()> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .env("DD_WORKERPOOL_ITEM_ID", &item.id)
            .stdin(Stdio::piped())
            .process_group(0)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.command))?;
        let group = i32::try_from(child.id()).ok().map(Pid::from_raw);
        *self.running() = group;

        let fed = match child.stdin.take() {
            Some(mut stdin) => match stdin.write_all(&item.payload) {
                // The command is free to ignore its input.
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                other => other,
            },
            None => Ok(()),
        };

        let status = child.wait();
        {
            // An aborted run may finish after the next one has started.
            let mut running = self.running();
            if *running == group {
                *running = None;
            }
        }
        fed.with_context(|| format!("failed to feed item {}", item.id))?;
        let status = status.with_context(|| format!("failed to wait for {}", self.command))?;
        if !status.success() {
            bail!("{} exited with {status} on item {}", self.command, item.id);
        }
        Ok(())
    }

    fn abort(&self) {
        let Some(group) = self.running().take() else {
            return;
        };
        match killpg(group, Signal::SIGKILL) {
            Ok(()) => debug!("killed handler process group {group}"),
            Err(Errno::ESRCH) => {}
            Err(e) => warn!("could not kill handler process group {group}: {e}"),
        }
    }
}
