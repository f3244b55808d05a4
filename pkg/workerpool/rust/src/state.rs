// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    /// Long-lived pool member, replaced when it crashes.
    Resident,
    /// Elastic pool member added under load; retires itself when idle.
    Temporary,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerKind::Resident => write!(f, "resident"),
            WorkerKind::Temporary => write!(f, "temporary"),
        }
    }
}

/// Last status a worker reported over the heartbeat channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    #[default]
    Idle,
    Busy,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy => write!(f, "busy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Forking the resident workers.
    Starting,
    /// Monitor loop is supervising and scaling.
    Running,
    /// Shutdown requested; nothing is forked anymore. Terminal.
    Stopping,
}

impl Lifecycle {
    pub(crate) fn can_transition_to(self, next: Lifecycle) -> bool {
        use Lifecycle::*;
        matches!(
            (self, next),
            (Starting, Running) | (Starting, Stopping) | (Running, Stopping)
        )
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Starting => write!(f, "starting"),
            Lifecycle::Running => write!(f, "running"),
            Lifecycle::Stopping => write!(f, "stopping"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_is_monotonic() {
        use Lifecycle::*;
        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(Stopping));
        assert!(Running.can_transition_to(Stopping));

        assert!(!Running.can_transition_to(Starting));
        assert!(!Stopping.can_transition_to(Running));
        assert!(!Stopping.can_transition_to(Starting));
        assert!(!Stopping.can_transition_to(Stopping));
    }

    #[test]
    fn test_status_defaults_to_idle() {
        assert_eq!(WorkerStatus::default(), WorkerStatus::Idle);
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&WorkerStatus::Busy).unwrap(),
            "\"busy\""
        );
        let status: WorkerStatus = serde_json::from_str("\"idle\"").unwrap();
        assert_eq!(status, WorkerStatus::Idle);
    }
}
