// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Backlog abstraction. Workers connect after fork, so a connector is shared
//! through the fork and each process opens its own handle.

pub mod spool;

use crate::error::QueueError;
use std::time::Duration;

const PREVIEW_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: String,
    pub payload: Vec<u8>,
}

impl Item {
    pub fn new(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
        }
    }

    /// Payload as text for log lines, lossy and truncated.
    pub fn payload_preview(&self) -> String {
        let end = self.payload.len().min(PREVIEW_LEN);
        let head = self.payload.get(..end).unwrap_or_default();
        let mut preview = String::from_utf8_lossy(head).into_owned();
        if self.payload.len() > PREVIEW_LEN {
            preview.push_str("...");
        }
        preview
    }
}

pub trait QueueBackend: Send {
    /// Blocks up to `timeout`; `Ok(None)` when nothing became available.
    fn reserve(&mut self, timeout: Duration) -> Result<Option<Item>, QueueError>;

    fn length(&mut self) -> Result<usize, QueueError>;

    fn is_connected(&self) -> bool;

    fn close(&mut self);
}

pub trait QueueConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn QueueBackend>, QueueError>;
}
