// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use serde::Serialize;

/// Counters kept by the supervisor over one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub forked: u64,
    pub fork_failures: u64,
    pub reboots: u64,
    pub exits: u64,
    pub expected_exits: u64,
    /// Ticks on which more capacity was wanted but the pool was full.
    pub saturated_ticks: u64,
    pub peak_workers: usize,
}
