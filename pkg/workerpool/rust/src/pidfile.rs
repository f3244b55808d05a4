// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::error::PidFileError;
use log::{info, warn};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

/// Pid file owned by the running master; removed again on drop.
///
/// A second pool pointed at the same file refuses to start while the pid
/// recorded there is alive. Files left by a dead process are taken over.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, PidFileError> {
        let path = path.into();
        let pid = std::process::id();
        let io_err = |source| PidFileError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(parent)
                .map_err(io_err)?;
        }

        if let Some(holder) = read_pid(&path).map_err(io_err)? {
            if holder != pid && is_alive(holder) {
                return Err(PidFileError::AlreadyRunning {
                    path: path.clone(),
                    pid: holder,
                });
            }
            info!("taking over stale PID file {} (pid={holder})", path.display());
        }

        let mut file = OpenOptions::new()
            .write(true)
            .mode(0o644)
            .truncate(true)
            .create(true)
            .open(&path)
            .map_err(io_err)?;
        file.write_all(format!("{pid}\n").as_bytes())
            .map_err(io_err)?;

        info!("created PID file at {}", path.display());
        Ok(Self { path, pid })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Forked workers carry a copy of the guard; only the writer removes.
        if std::process::id() != self.pid {
            return;
        }
        match read_pid(&self.path) {
            Ok(Some(holder)) if holder != self.pid => {
                warn!(
                    "PID file {} now names pid {holder}, leaving it",
                    self.path.display()
                );
                return;
            }
            _ => {}
        }
        match fs::remove_file(&self.path) {
            Ok(()) => info!("removed PID file at {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("could not remove PID file {}: {e}", self.path.display()),
        }
    }
}

/// `None` when the file is missing or does not hold a pid.
fn read_pid(path: &Path) -> io::Result<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents.trim().parse().ok()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_create_writes_pid_and_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("pool.pid");
        let guard = PidFile::create(&path).unwrap();
        assert_eq!(guard.path(), path);
        assert_eq!(
            fs::read_to_string(&path).unwrap().trim(),
            std::process::id().to_string()
        );
        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn test_refuses_when_holder_is_alive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.pid");
        let mut other = Command::new("sleep").arg("30").spawn().unwrap();
        fs::write(&path, format!("{}\n", other.id())).unwrap();

        let err = PidFile::create(&path).unwrap_err();
        assert!(
            matches!(err, PidFileError::AlreadyRunning { pid, .. } if pid == other.id()),
            "{err}"
        );
        assert_eq!(
            fs::read_to_string(&path).unwrap().trim(),
            other.id().to_string()
        );

        other.kill().unwrap();
        other.wait().unwrap();
    }

    #[test]
    fn test_takes_over_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.pid");
        let mut gone = Command::new("true").spawn().unwrap();
        gone.wait().unwrap();
        fs::write(&path, format!("{}\n", gone.id())).unwrap();

        let _guard = PidFile::create(&path).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap().trim(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn test_garbage_contents_are_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.pid");
        fs::write(&path, "not a pid").unwrap();
        assert!(PidFile::create(&path).is_ok());
    }

    #[test]
    fn test_drop_leaves_file_claimed_by_another_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.pid");
        let guard = PidFile::create(&path).unwrap();
        fs::write(&path, "1\n").unwrap();
        drop(guard);
        assert!(path.exists());
    }

    #[test]
    fn test_drop_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.pid");
        let guard = PidFile::create(&path).unwrap();
        fs::remove_file(&path).unwrap();
        drop(guard);
        assert!(!path.exists());
    }
}
