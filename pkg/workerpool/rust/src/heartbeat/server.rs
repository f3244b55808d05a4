// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use super::frame::{FrameDecoder, HeartbeatMessage};
use log::{debug, warn};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::fs;
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(1);
const READ_CHUNK: usize = 4096;
/// Bytes read from one connection per `poll`, so a flooding client cannot
/// starve the others or the supervisor tick.
const MAX_READ_PER_POLL: usize = 64 * 1024;

struct Connection {
    stream: UnixStream,
    decoder: FrameDecoder,
}

impl Connection {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(),
        }
    }

    /// Read until the socket would block or the per-poll budget is spent,
    /// handing every complete message to `on_message`. Returns false once the
    /// connection is finished.
    fn drain(
        &mut self,
        on_message: &mut impl FnMut(HeartbeatMessage),
        delivered: &mut usize,
    ) -> bool {
        let mut chunk = [0u8; READ_CHUNK];
        let mut budget = MAX_READ_PER_POLL;
        loop {
            if budget == 0 {
                // Whatever is left keeps the fd readable for the next poll.
                return true;
            }
            let window = chunk.get_mut(..budget.min(READ_CHUNK)).unwrap_or_default();
            let (open, n) = match self.stream.read(window) {
                Ok(0) => (false, 0),
                Ok(n) => (true, n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("heartbeat connection read failed: {e}");
                    return false;
                }
            };
            budget = budget.saturating_sub(n);
            self.decoder.extend(chunk.get(..n).unwrap_or_default());
            loop {
                match self.decoder.next_message() {
                    Ok(Some(message)) => {
                        *delivered += 1;
                        on_message(message);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("dropping heartbeat connection: {e}");
                        return false;
                    }
                }
            }
            if !open {
                if self.decoder.buffered() > 0 {
                    debug!(
                        "heartbeat connection closed with {} trailing bytes",
                        self.decoder.buffered()
                    );
                }
                return false;
            }
        }
    }
}

/// Supervisor end of the heartbeat channel. Never blocks longer than the
/// timeout given to `poll`.
pub struct HeartbeatServer {
    path: PathBuf,
    listener: UnixListener,
    conns: Vec<Connection>,
    owner: u32,
}

impl HeartbeatServer {
    pub fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        match fs::remove_file(&path) {
            Ok(()) => debug!("removed stale heartbeat socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        Ok(Self {
            path,
            listener,
            conns: Vec::new(),
            owner: std::process::id(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open client connections currently watched.
    pub fn connections(&self) -> usize {
        self.conns.len()
    }

    /// Wait up to `timeout` (capped at one second) for activity, then accept
    /// and drain everything that is ready. Returns the number of messages
    /// delivered.
    pub fn poll(
        &mut self,
        timeout: Duration,
        mut on_message: impl FnMut(HeartbeatMessage),
    ) -> io::Result<usize> {
        let millis = timeout.min(MAX_POLL_TIMEOUT).as_millis();
        let timeout = PollTimeout::from(u16::try_from(millis).unwrap_or(u16::MAX));

        let ready: Vec<bool> = {
            let mut fds = Vec::with_capacity(self.conns.len() + 1);
            fds.push(PollFd::new(self.listener.as_fd(), PollFlags::POLLIN));
            fds.extend(
                self.conns
                    .iter()
                    .map(|c| PollFd::new(c.stream.as_fd(), PollFlags::POLLIN)),
            );
            match poll(&mut fds, timeout) {
                Ok(_) => {}
                Err(Errno::EINTR) => return Ok(0),
                Err(e) => return Err(e.into()),
            }
            fds.iter()
                .map(|fd| fd.revents().is_some_and(|r| !r.is_empty()))
                .collect()
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (idx, conn) in self.conns.iter_mut().enumerate() {
            let is_ready = ready.get(idx + 1).copied().unwrap_or(false);
            if is_ready && !conn.drain(&mut on_message, &mut delivered) {
                closed.push(idx);
            }
        }
        // Descending order keeps the remaining indices valid for swap_remove.
        for idx in closed.into_iter().rev() {
            self.conns.swap_remove(idx);
        }

        if ready.first().copied().unwrap_or(false) {
            loop {
                match self.listener.accept() {
                    Ok((stream, _)) => {
                        stream.set_nonblocking(true)?;
                        let mut conn = Connection::new(stream);
                        if conn.drain(&mut on_message, &mut delivered) {
                            self.conns.push(conn);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("heartbeat accept failed: {e}");
                        break;
                    }
                }
            }
        }

        Ok(delivered)
    }
}

impl Drop for HeartbeatServer {
    fn drop(&mut self) {
        // Forked workers drop their inherited copy; only the binder unlinks.
        if std::process::id() != self.owner {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!("could not remove heartbeat socket {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::heartbeat::client::HeartbeatClient;
    use crate::heartbeat::frame::encode;
    use crate::state::WorkerStatus;
    use std::io::Write;

    fn collect(server: &mut HeartbeatServer, rounds: usize) -> Vec<HeartbeatMessage> {
        let mut got = Vec::new();
        for _ in 0..rounds {
            server
                .poll(Duration::from_millis(50), |m| got.push(m))
                .unwrap();
        }
        got
    }

    fn msg(pid: i32, status: WorkerStatus) -> HeartbeatMessage {
        HeartbeatMessage { pid, status }
    }

    #[test]
    fn test_bind_sets_owner_only_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hb.sock");
        let _server = HeartbeatServer::bind(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hb.sock");
        fs::write(&path, b"stale").unwrap();
        assert!(HeartbeatServer::bind(&path).is_ok());
    }

    #[test]
    fn test_drop_removes_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hb.sock");
        drop(HeartbeatServer::bind(&path).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_idle_poll_returns_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = HeartbeatServer::bind(dir.path().join("hb.sock")).unwrap();
        let n = server.poll(Duration::from_millis(20), |_| {}).unwrap();
        assert_eq!(n, 0);
        assert_eq!(server.connections(), 0);
    }

    #[test]
    fn test_receives_client_heartbeats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hb.sock");
        let mut server = HeartbeatServer::bind(&path).unwrap();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        assert!(HeartbeatClient::new(&path, 10).send(&rt, WorkerStatus::Busy));
        assert!(HeartbeatClient::new(&path, 11).send(&rt, WorkerStatus::Idle));

        let got = collect(&mut server, 5);
        assert!(got.contains(&msg(10, WorkerStatus::Busy)));
        assert!(got.contains(&msg(11, WorkerStatus::Idle)));
        assert_eq!(server.connections(), 0);
    }

    #[test]
    fn test_split_frames_over_long_lived_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hb.sock");
        let mut server = HeartbeatServer::bind(&path).unwrap();

        let mut stream = UnixStream::connect(&path).unwrap();
        let frame = encode(&msg(5, WorkerStatus::Busy)).unwrap();
        let (head, tail) = frame.split_at(3);
        stream.write_all(head).unwrap();
        assert!(collect(&mut server, 2).is_empty());
        assert_eq!(server.connections(), 1);

        stream.write_all(tail).unwrap();
        stream
            .write_all(&encode(&msg(5, WorkerStatus::Idle)).unwrap())
            .unwrap();
        let got = collect(&mut server, 2);
        assert_eq!(
            got,
            vec![msg(5, WorkerStatus::Busy), msg(5, WorkerStatus::Idle)]
        );
    }

    #[test]
    fn test_flooding_client_is_read_in_bounded_slices() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hb.sock");
        let mut server = HeartbeatServer::bind(&path).unwrap();

        let frame = encode(&msg(7, WorkerStatus::Busy)).unwrap();
        let total = 2 * MAX_READ_PER_POLL / frame.len() + 100;
        let flood: Vec<u8> = frame.iter().copied().cycle().take(frame.len() * total).collect();
        let mut stream = UnixStream::connect(&path).unwrap();
        let writer = std::thread::spawn(move || {
            stream.write_all(&flood).unwrap();
            stream
        });

        let per_poll_cap = MAX_READ_PER_POLL / frame.len() + 1;
        let mut received = 0;
        for _ in 0..200 {
            let n = server.poll(Duration::from_millis(50), |_| {}).unwrap();
            assert!(n <= per_poll_cap, "one poll delivered {n} messages");
            received += n;
            if received == total {
                break;
            }
        }
        assert_eq!(received, total);
        let _stream = writer.join().unwrap();
        assert_eq!(server.connections(), 1);
    }

    #[test]
    fn test_garbage_drops_only_that_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hb.sock");
        let mut server = HeartbeatServer::bind(&path).unwrap();

        let mut good = UnixStream::connect(&path).unwrap();
        let mut bad = UnixStream::connect(&path).unwrap();
        collect(&mut server, 2);
        assert_eq!(server.connections(), 2);

        bad.write_all(&u32::MAX.to_be_bytes()).unwrap();
        collect(&mut server, 2);
        assert_eq!(server.connections(), 1);

        good.write_all(&encode(&msg(9, WorkerStatus::Idle)).unwrap())
            .unwrap();
        assert_eq!(collect(&mut server, 2), vec![msg(9, WorkerStatus::Idle)]);
    }
}
