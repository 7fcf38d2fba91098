// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Probe workers.
//!
//! Each probe is a sequential loop owned by the monitoring host: observe,
//! translate observations into indicators, hand them to the behavior
//! engine and action manager, sleep until the next cycle. Probes suspend
//! only at their inter-cycle delay and OS calls, and they observe the
//! host's cancellation signal at least once per cycle.

pub mod integrity;
pub mod load;
pub mod memory;
pub mod network;
pub mod process;

use std::time::Duration;

use tokio::sync::watch;

/// Sleep out the inter-cycle delay, waking early on cancellation.
/// Returns `true` once the worker should exit.
pub async fn idle(cancel: &mut watch::Receiver<bool>, interval: Duration) -> bool {
    if *cancel.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(interval) => false,
        changed = cancel.changed() => changed.is_err() || *cancel.borrow(),
    }
}
