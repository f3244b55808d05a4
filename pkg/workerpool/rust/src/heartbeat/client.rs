// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use super::frame::{HeartbeatMessage, encode};
use crate::state::WorkerStatus;
use log::debug;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::runtime::Runtime;

pub const SEND_TIMEOUT: Duration = Duration::from_millis(250);

/// One connection per heartbeat; the supervisor may be gone or busy and
/// that is never the worker's problem.
#[derive(Debug, Clone)]
pub struct HeartbeatClient {
    path: PathBuf,
    pid: i32,
}

impl HeartbeatClient {
    pub fn new(path: impl Into<PathBuf>, pid: i32) -> Self {
        Self {
            path: path.into(),
            pid,
        }
    }

    /// Returns whether the frame was written.
    pub fn send(&self, rt: &Runtime, status: WorkerStatus) -> bool {
        let frame = match encode(&HeartbeatMessage {
            pid: self.pid,
            status,
        }) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("heartbeat encode failed: {e}");
                return false;
            }
        };

        let exchange = async {
            let mut stream = UnixStream::connect(&self.path).await?;
            stream.write_all(&frame).await?;
            stream.shutdown().await
        };
        match rt.block_on(async { tokio::time::timeout(SEND_TIMEOUT, exchange).await }) {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("heartbeat to {} failed: {e}", self.path.display());
                false
            }
            Err(_) => {
                debug!("heartbeat to {} timed out", self.path.display());
                false
            }
        }
    }
}
