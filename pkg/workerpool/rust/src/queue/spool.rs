// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Directory-backed FIFO shared by many processes.
//!
//! Layout:
//!
//! ```text
//! <root>/pending/<nanos>-<pid>-<seq>~<id>   enqueued items, oldest name first
//! <root>/claimed/<name>.<pid>               item being read by a worker
//! ```
//!
//! `rename` within one filesystem is atomic, so exactly one worker wins each
//! pending file. Writers publish through a dot-prefixed temp file that readers
//! skip.

use super::{Item, QueueBackend, QueueConnector};
use crate::error::QueueError;
use log::debug;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const PENDING: &str = "pending";
const CLAIMED: &str = "claimed";

static PUSH_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct SpoolDir {
    root: PathBuf,
}

impl SpoolDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pending(&self) -> PathBuf {
        self.root.join(PENDING)
    }

    fn claimed(&self) -> PathBuf {
        self.root.join(CLAIMED)
    }

    /// Create the directory layout if missing.
    pub fn ensure(&self) -> Result<(), QueueError> {
        for dir in [self.pending(), self.claimed()] {
            fs::create_dir_all(&dir)
                .map_err(|e| QueueError::io(format!("creating {}", dir.display()), e))?;
        }
        Ok(())
    }

    /// Enqueue one item and return its id. A generated id is used when none
    /// is given.
    pub fn push(&self, id: Option<&str>, payload: &[u8]) -> Result<String, QueueError> {
        self.ensure()?;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seq = PUSH_SEQ.fetch_add(1, Ordering::Relaxed);
        let pid = std::process::id();
        let id = match id {
            Some(id) => sanitize(id),
            None => format!("{pid}-{seq}"),
        };
        let name = format!("{nanos:020}-{pid:010}-{seq:06}~{id}");

        let pending = self.pending();
        let tmp = pending.join(format!(".tmp-{name}"));
        fs::write(&tmp, payload)
            .map_err(|e| QueueError::io(format!("writing {}", tmp.display()), e))?;
        fs::rename(&tmp, pending.join(&name))
            .map_err(|e| QueueError::io(format!("publishing {name}"), e))?;
        Ok(id)
    }

    pub fn len(&self) -> Result<usize, QueueError> {
        Ok(self.pending_names()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        self.len().map(|n| n == 0)
    }

    /// Published item names, oldest first.
    fn pending_names(&self) -> Result<Vec<String>, QueueError> {
        let dir = self.pending();
        let entries = fs::read_dir(&dir)
            .map_err(|e| QueueError::io(format!("listing {}", dir.display()), e))?;
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| !name.starts_with('.'))
            .collect();
        names.sort_unstable();
        Ok(names)
    }
}

impl QueueConnector for SpoolDir {
    fn connect(&self) -> Result<Box<dyn QueueBackend>, QueueError> {
        self.ensure()?;
        Ok(Box::new(SpoolQueue {
            dir: self.clone(),
            connected: true,
        }))
    }
}

pub struct SpoolQueue {
    dir: SpoolDir,
    connected: bool,
}

impl SpoolQueue {
    /// Claim and read the oldest pending item, if any.
    fn try_claim(&self) -> Result<Option<Item>, QueueError> {
        let pending = self.dir.pending();
        let claimed = self.dir.claimed();
        for name in self.dir.pending_names()? {
            let target = claimed.join(format!("{name}.{}", std::process::id()));
            match fs::rename(pending.join(&name), &target) {
                Ok(()) => {}
                // Another worker won the race.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(QueueError::io(format!("claiming {name}"), e)),
            }
            let payload = fs::read(&target)
                .map_err(|e| QueueError::io(format!("reading {}", target.display()), e))?;
            if let Err(e) = fs::remove_file(&target) {
                debug!("could not remove claimed item {}: {e}", target.display());
            }
            let id = name
                .split_once('~')
                .map_or(name.as_str(), |(_, id)| id)
                .to_string();
            return Ok(Some(Item { id, payload }));
        }
        Ok(None)
    }
}

impl QueueBackend for SpoolQueue {
    fn reserve(&mut self, timeout: Duration) -> Result<Option<Item>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.connected {
                return Err(QueueError::Closed);
            }
            if let Some(item) = self.try_claim()? {
                return Ok(Some(item));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    fn length(&mut self) -> Result<usize, QueueError> {
        if !self.connected {
            return Err(QueueError::Closed);
        }
        self.dir.len()
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close(&mut self) {
        self.connected = false;
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
