// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use dd_workerpool::queue::spool::SpoolDir;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Scratch directory holding a pool's config, spool and heartbeat socket.
pub struct PoolDir {
    dir: tempfile::TempDir,
}

impl PoolDir {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("failed to create temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn spool(&self) -> SpoolDir {
        SpoolDir::new(self.dir.path().join("spool"))
    }

    /// Write a config with fast test timings. `extra` is appended verbatim and
    /// must not repeat the keys written here.
    pub fn write_config(&self, extra: &str) -> PathBuf {
        let base = format!(
            "name: test\n\
             reserve_timeout_secs: 1\n\
             tick_interval_ms: 100\n\
             poll_timeout_ms: 100\n\
             heartbeat_socket: {}\n\
             queue:\n  spool_dir: {}\n",
            self.dir.path().join("hb.sock").display(),
            self.dir.path().join("spool").display(),
        );
        let path = self.dir.path().join("pool.yaml");
        std::fs::write(&path, format!("{base}{extra}"))
            .unwrap_or_else(|e| panic!("failed to write {}: {e}", path.display()));
        path
    }

    /// Enqueue `n` items with the same payload.
    pub fn push(&self, n: usize, payload: &str) {
        let spool = self.spool();
        for i in 0..n {
            spool
                .push(Some(&format!("item-{i}")), payload.as_bytes())
                .expect("failed to push item");
        }
    }
}

/// Handle to a running `dd-workerpool run` process.
pub struct PoolHandle {
    child: Child,
    log_lines: Arc<Mutex<Vec<String>>>,
    _stderr_thread: std::thread::JoinHandle<()>,
}

impl PoolHandle {
    /// The pool leads its own process group, standing in for a terminal's
    /// foreground job, so group signals never reach the test runner.
    pub fn start(config: &Path) -> Self {
        let bin = env!("CARGO_BIN_EXE_dd-workerpool");
        let mut child = Command::new(bin)
            .arg("run")
            .arg("--config")
            .arg(config)
            .process_group(0)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .expect("failed to start dd-workerpool");

        let stderr = child.stderr.take().expect("failed to capture stderr");
        let log_lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let lines_clone = Arc::clone(&log_lines);

        // Supervisor and workers share the inherited stderr.
        let stderr_thread = std::thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                match line {
                    Ok(l) => {
                        eprintln!("[pool] {l}");
                        lines_clone.lock().unwrap().push(l);
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            child,
            log_lines,
            _stderr_thread: stderr_thread,
        }
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    /// Wait until a log line containing `pattern` appears, or timeout.
    pub fn wait_for_log(&self, pattern: &str, timeout: Duration) -> bool {
        self.wait_for_log_count(pattern, 1, timeout)
    }

    pub fn wait_for_log_default(&self, pattern: &str) -> bool {
        self.wait_for_log(pattern, DEFAULT_TIMEOUT)
    }

    pub fn count_log_matches(&self, pattern: &str) -> usize {
        let lines = self.log_lines.lock().unwrap();
        lines.iter().filter(|l| l.contains(pattern)).count()
    }

    pub fn wait_for_log_count(&self, pattern: &str, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.count_log_matches(pattern) >= n {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    pub fn send_signal(&self, sig: Signal) {
        signal::kill(self.pid(), sig).expect("failed to signal dd-workerpool");
    }

    /// Signal every process in the pool's group, like Ctrl-C at a terminal.
    pub fn send_group_signal(&self, sig: Signal) {
        signal::killpg(self.pid(), sig).expect("failed to signal dd-workerpool group");
    }

    /// Send SIGINT and wait for the pool to drain.
    pub fn stop(&mut self) -> ExitStatus {
        self.send_signal(Signal::SIGINT);
        self.wait_with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn wait_with_timeout(&mut self, timeout: Duration) -> ExitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            match self
                .child
                .try_wait()
                .expect("failed to check dd-workerpool status")
            {
                Some(status) => return status,
                None => {
                    if Instant::now() >= deadline {
                        self.child.kill().ok();
                        return self.child.wait().expect("failed to wait on killed pool");
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }

    /// Pids from "spawned worker (pid=NNN)" lines, optionally for one kind.
    pub fn spawned_pids(&self, kind: Option<&str>) -> Vec<i32> {
        let lines = self.log_lines.lock().unwrap();
        lines
            .iter()
            .filter(|l| kind.is_none_or(|k| l.contains(&format!("[{k}] spawned worker"))))
            .filter_map(|l| {
                let marker = "spawned worker (pid=";
                let start = l.find(marker)? + marker.len();
                let rest = l.get(start..)?;
                let end = rest.find(|c: char| !c.is_ascii_digit())?;
                rest.get(..end)?.parse().ok()
            })
            .collect()
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        // Workers notice the missing supervisor only through SIGINT.
        if let Ok(None) = self.child.try_wait() {
            let _ = signal::kill(self.pid(), Signal::SIGINT);
            self.wait_with_timeout(Duration::from_secs(5));
        }
    }
}

pub fn pid_is_alive(pid: i32) -> bool {
    signal::kill(Pid::from_raw(pid), None).is_ok()
}

pub fn wait_for_pid_gone(pid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !pid_is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
