// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Best-effort status channel from workers to the supervisor over a unix
//! socket. Losing a heartbeat only delays a scaling decision.

pub mod client;
pub mod frame;
pub mod server;

pub use client::HeartbeatClient;
pub use frame::{FrameDecoder, HeartbeatMessage, MAX_FRAME_LEN};
pub use server::HeartbeatServer;
