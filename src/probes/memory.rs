// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Memory probe.
//!
//! Detects writable-and-executable regions in a selected subset of
//! processes: the configured target names plus anything already scored at
//! Suspicious or above. Each cycle picks the top candidates by score and
//! walks their address space through a scoped scan session; regions that
//! are writable and executable at once raise the `rwxMemory` indicator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::audit::events::{AuditKind, SuspiciousRegion};
use crate::audit::AuditLog;
use crate::behavior::{with_indicator, BehaviorEngine, ThreatLevel};
use crate::config::MemoryScanningConfig;
use crate::os::{MemoryOps, ProcessOps};
use crate::response::ActionManager;

const RESERVED_PID_MAX: u32 = 4;

/// Weight of the writable-executable-region indicator.
const RWX_WEIGHT: u32 = 6;

pub struct MemoryProbe {
    config: MemoryScanningConfig,
    engine: Arc<BehaviorEngine>,
    actions: Arc<ActionManager>,
    audit: Arc<AuditLog>,
    process_ops: Arc<dyn ProcessOps>,
    memory_ops: Arc<dyn MemoryOps>,
    last_scan: Mutex<HashMap<u32, Instant>>,
}

/// Compare a process name against a target entry, tolerating a `.exe`
/// suffix on either side. Case-insensitive.
fn name_matches_target(name: &str, target: &str) -> bool {
    let strip = |s: &str| {
        let lower = s.to_lowercase();
        lower.strip_suffix(".exe").map(|s| s.to_string()).unwrap_or(lower)
    };
    strip(name) == strip(target)
}

impl MemoryProbe {
    pub fn new(
        config: MemoryScanningConfig,
        engine: Arc<BehaviorEngine>,
        actions: Arc<ActionManager>,
        audit: Arc<AuditLog>,
        process_ops: Arc<dyn ProcessOps>,
        memory_ops: Arc<dyn MemoryOps>,
    ) -> Self {
        Self {
            config,
            engine,
            actions,
            audit,
            process_ops,
            memory_ops,
            last_scan: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self: Arc<Self>, mut cancel: watch::Receiver<bool>) -> anyhow::Result<()> {
        let interval = Duration::from_secs(self.config.scan_interval);
        loop {
            if *cancel.borrow() {
                return Ok(());
            }
            self.cycle();
            if super::idle(&mut cancel, interval).await {
                return Ok(());
            }
        }
    }

    /// Select candidates and scan the top slice.
    pub fn cycle(&self) {
        for (pid, name) in self.select_targets() {
            self.scan_process(pid, &name);
        }
    }

    /// Union of configured names and scored processes, ordered by score
    /// descending then PID ascending, truncated to `max_concurrent_scans`.
    fn select_targets(&self) -> Vec<(u32, String)> {
        let Ok(pids) = self.process_ops.list_pids() else {
            return Vec::new();
        };
        let mut candidates: Vec<(u32, u32, String)> = Vec::new();
        for pid in pids {
            if pid <= RESERVED_PID_MAX {
                continue;
            }
            let Ok(raw) = self.process_ops.query(pid) else {
                continue;
            };
            let score = self.engine.get(pid);
            let targeted = self
                .config
                .target_processes
                .iter()
                .any(|t| name_matches_target(&raw.name, t));
            if targeted || score.level >= ThreatLevel::Suspicious {
                candidates.push((pid, score.total, raw.name));
            }
        }
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        candidates.truncate(self.config.max_concurrent_scans);
        candidates.into_iter().map(|(pid, _, name)| (pid, name)).collect()
    }

    /// Walk one process's regions. The scan session is scoped: whatever
    /// handle the platform opened is released when it drops, on every path.
    fn scan_process(&self, pid: u32, name: &str) {
        let interval = Duration::from_secs(self.config.scan_interval);
        {
            let mut last = self.last_scan.lock().unwrap();
            if let Some(at) = last.get(&pid) {
                if at.elapsed() < interval {
                    return;
                }
            }
            last.insert(pid, Instant::now());
        }

        let Ok(mut session) = self.memory_ops.open_scan(pid) else {
            return; // denied or vanished: skip this candidate
        };

        let mut suspicious = Vec::new();
        let mut addr = 0u64;
        while let Some(region) = session.query_region(addr) {
            if region.is_writable_executable() {
                suspicious.push(SuspiciousRegion {
                    base: region.base,
                    size: region.size,
                    protection: region.perms.clone(),
                });
            }
            addr = region.base + region.size;
        }
        drop(session);

        if suspicious.is_empty() {
            return;
        }

        let thresholds = *self.engine.thresholds();
        self.engine.update(pid, move |score| {
            with_indicator(score, "rwxMemory", RWX_WEIGHT, &thresholds)
        });
        self.actions.evaluate_and_respond(pid);
        self.audit.log(AuditKind::MemoryAnomaly {
            pid,
            name: name.to_string(),
            suspicious_regions: suspicious,
        });
    }
}
