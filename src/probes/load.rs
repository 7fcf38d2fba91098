// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Runtime-load monitor.
//!
//! Samples coarse host load (CPU, memory, process count) once per process
//! scan interval and writes `runtimeLoad` audit events. The offline
//! decoder's structured variant consumes exactly these records.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::audit::events::AuditKind;
use crate::audit::AuditLog;
use crate::os::SystemOps;

pub struct LoadMonitor {
    interval: Duration,
    system: Arc<dyn SystemOps>,
    audit: Arc<AuditLog>,
}

impl LoadMonitor {
    pub fn new(interval: Duration, system: Arc<dyn SystemOps>, audit: Arc<AuditLog>) -> Self {
        Self { interval, system, audit }
    }

    pub async fn run(self: Arc<Self>, mut cancel: watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            if *cancel.borrow() {
                return Ok(());
            }
            self.sample();
            if super::idle(&mut cancel, self.interval).await {
                return Ok(());
            }
        }
    }

    /// One sample. A failed read skips the tick; the next one retries.
    pub fn sample(&self) {
        if let Ok(load) = self.system.load_sample() {
            self.audit.log(AuditKind::RuntimeLoad {
                cpu_percent: load.cpu_percent,
                memory_percent: load.memory_percent,
                process_count: load.process_count,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::decoder;
    use crate::audit::keyfile::MachineScopeProtector;
    use crate::os::{LoadSample, OsResult};

    struct FixedLoad;
    impl SystemOps for FixedLoad {
        fn load_sample(&self) -> OsResult<LoadSample> {
            Ok(LoadSample { cpu_percent: 21.5, memory_percent: 63.0, process_count: 142 })
        }
    }

    #[tokio::test]
    async fn test_samples_land_in_the_decoder_view() {
        let dir = tempfile::tempdir().unwrap();
        let protector = MachineScopeProtector;
        let audit = Arc::new(AuditLog::open(dir.path(), &protector).unwrap());
        let monitor =
            LoadMonitor::new(Duration::from_secs(10), Arc::new(FixedLoad), audit.clone());
        monitor.sample();
        monitor.sample();
        audit.dispose().await;

        let file = decoder::newest_log_file(dir.path()).unwrap();
        let records = decoder::decode_runtime_loads(&file, &protector).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].cpu_percent, 21.5);
        assert_eq!(records[0].process_count, 142);
    }
}
