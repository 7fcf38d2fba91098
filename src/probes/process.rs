// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Process probe.
//!
//! Two composed observation sources: a process-creation event stream
//! (where the platform provides one) and a full-table polling sweep every
//! `process_monitoring.scan_interval`. Both feed [`ProcessProbe::analyze`],
//! which collects metadata best-effort, applies the ordered indicator
//! rules plus any plugin contributions, and drives the score table and
//! action manager.
//!
//! Also owns the process-tree builder used by the dashboard contract and
//! the hook-state bookkeeping of instrumented processes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::audit::events::AuditKind;
use crate::audit::AuditLog;
use crate::behavior::plugin::AnalyzerRegistry;
use crate::behavior::{with_indicator, BehaviorEngine, Indicator};
use crate::config::ProcessMonitoringConfig;
use crate::os::ProcessOps;
use crate::response::ActionManager;

/// PIDs at or below this are system-reserved and never analyzed.
const RESERVED_PID_MAX: u32 = 4;

/// Executable-path fragments that mark an unexpected launch location.
const UNTRUSTED_PATH_FRAGMENTS: &[&str] = &["temp", "appdata", "downloads"];

/// Everything the probe knows about one process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessMetadata {
    pub pid: u32,
    pub parent_pid: u32,
    pub name: String,
    pub executable_path: String,
    pub command_line: String,
    pub signed: bool,
}

/// One node of the process forest returned by [`ProcessProbe::build_tree`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessNode {
    pub pid: u32,
    pub children: Vec<ProcessNode>,
}

pub struct ProcessProbe {
    config: ProcessMonitoringConfig,
    engine: Arc<BehaviorEngine>,
    actions: Arc<ActionManager>,
    audit: Arc<AuditLog>,
    ops: Arc<dyn ProcessOps>,
    plugins: AnalyzerRegistry,
    processes: Mutex<HashMap<u32, ProcessMetadata>>,
    hooks: Mutex<HashMap<u32, Vec<String>>>,
    encoded_powershell: Regex,
    mshta_prefix: Regex,
}

/// Case-insensitive name normalization: lowercase, extension stripped.
fn normalize_name(name: &str) -> String {
    let lower = name.to_lowercase();
    match lower.rsplit_once('.') {
        Some((stem, _ext)) if !stem.is_empty() => stem.to_string(),
        _ => lower,
    }
}

impl ProcessProbe {
    pub fn new(
        config: ProcessMonitoringConfig,
        engine: Arc<BehaviorEngine>,
        actions: Arc<ActionManager>,
        audit: Arc<AuditLog>,
        ops: Arc<dyn ProcessOps>,
        plugins: AnalyzerRegistry,
    ) -> Self {
        Self {
            config,
            engine,
            actions,
            audit,
            ops,
            plugins,
            processes: Mutex::new(HashMap::new()),
            hooks: Mutex::new(HashMap::new()),
            // An interpreter invoked with an encoded command block.
            encoded_powershell: Regex::new(
                r"(?i)\bpowershell(?:\.exe)?\b.*\s-e(?:n|nc|ncodedcommand)?\s+[A-Za-z0-9+/=]{16,}",
            )
            .expect("static regex"),
            // mshta as the command itself, with or without a path prefix.
            mshta_prefix: Regex::new(r"(?i)^(?:\S*[\\/])?mshta(?:\.exe)?\s")
                .expect("static regex"),
        }
    }

    /// Long-running worker loop: sweep on the configured cadence, and react
    /// to creation events between sweeps where the platform delivers them.
    pub async fn run(self: Arc<Self>, mut cancel: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut spawn_rx = self.ops.spawn_events();
        if spawn_rx.is_none() {
            self.audit.log(AuditKind::ProcessWatcherDisabled {
                message: "no process-creation event source on this platform; polling only".into(),
            });
        }
        let interval = Duration::from_secs(self.config.scan_interval);
        loop {
            if *cancel.borrow() {
                return Ok(());
            }
            self.sweep();

            let sleep = tokio::time::sleep(interval);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            return Ok(());
                        }
                    }
                    event = recv_spawn(&mut spawn_rx) => {
                        match event {
                            Some(pid) => self.analyze(pid),
                            None => spawn_rx = None, // stream closed; polling continues
                        }
                    }
                }
            }
        }
    }

    /// One full enumeration pass. Exited processes fall out of the cache.
    pub fn sweep(&self) {
        let Ok(pids) = self.ops.list_pids() else {
            return;
        };
        for pid in &pids {
            self.analyze(*pid);
        }
        let live: HashSet<u32> = pids.into_iter().collect();
        let gone: Vec<u32> = self
            .processes
            .lock()
            .unwrap()
            .keys()
            .filter(|pid| !live.contains(pid))
            .copied()
            .collect();
        for pid in gone {
            self.forget(pid, "exited");
        }
    }

    /// Analyze a single process: collect metadata, apply the indicator
    /// rules in order, compose one score update, respond, and evidence.
    pub fn analyze(&self, pid: u32) {
        if pid <= RESERVED_PID_MAX {
            return;
        }
        let meta = match self.collect_metadata(pid) {
            Ok(meta) => meta,
            Err(e) if e.is_vanished() => {
                self.forget(pid, "process vanished during analysis");
                return;
            }
            Err(_) => return, // transient denial: skip this observation
        };
        self.processes.lock().unwrap().insert(pid, meta.clone());

        if self.is_allow_listed(&meta.name) {
            return;
        }

        let mut indicators = Vec::new();
        let path_lower = meta.executable_path.to_lowercase();
        if !meta.signed && UNTRUSTED_PATH_FRAGMENTS.iter().any(|f| path_lower.contains(f)) {
            indicators.push(Indicator::new("unsignedTempExecution", 2));
        }
        if self.encoded_powershell.is_match(&meta.command_line) {
            indicators.push(Indicator::new("powershellEncoded", 4));
        }
        if self.mshta_prefix.is_match(&meta.command_line) {
            indicators.push(Indicator::new("mshta", 4));
        }
        indicators.extend(self.plugins.analyze_process(
            pid,
            &meta.name,
            &meta.command_line,
            &meta.executable_path,
        ));

        if indicators.is_empty() {
            return;
        }

        let thresholds = *self.engine.thresholds();
        let deltas = indicators.clone();
        let score = self.engine.update(pid, move |mut score| {
            for ind in &deltas {
                score = with_indicator(score, &ind.name, ind.weight, &thresholds);
            }
            score
        });
        self.actions.evaluate_and_respond(pid);
        self.audit.log(AuditKind::ProcessIndicators {
            pid,
            name: meta.name,
            command_line: meta.command_line,
            indicators,
            total: score.total,
            level: score.level,
        });
    }

    /// Best-effort metadata: individual sub-query failures come back as
    /// empty fields, `signed` defaults to false.
    fn collect_metadata(&self, pid: u32) -> Result<ProcessMetadata, crate::os::OsError> {
        let raw = self.ops.query(pid)?;
        let signed =
            !raw.executable_path.is_empty() && self.ops.is_signed(&raw.executable_path);
        Ok(ProcessMetadata {
            pid: raw.pid,
            parent_pid: raw.parent_pid,
            name: raw.name,
            executable_path: raw.executable_path,
            command_line: raw.command_line,
            signed,
        })
    }

    fn is_allow_listed(&self, name: &str) -> bool {
        let normalized = normalize_name(name);
        self.config
            .allow_listed_processes
            .iter()
            .any(|entry| normalize_name(entry) == normalized)
    }

    fn forget(&self, pid: u32, message: &str) {
        if self.processes.lock().unwrap().remove(&pid).is_some() {
            self.audit.log(AuditKind::ProcessRemoved { pid, message: message.to_string() });
        }
    }

    /// Snapshot of the metadata cache, for the dashboard contract.
    #[allow(dead_code)]
    pub fn processes(&self) -> Vec<ProcessMetadata> {
        self.processes.lock().unwrap().values().cloned().collect()
    }

    // ── Process tree ────────────────────────────────────────────────────

    /// Build the process forest from the cached metadata. With a known
    /// `root`, the result is that single subtree; otherwise the roots are
    /// processes whose parent is unknown or reserved, sorted by PID.
    ///
    /// Parent links that loop (PID reuse after a parent exit) are
    /// tolerated: a PID already on the current descent path is not
    /// re-descended.
    #[allow(dead_code)]
    pub fn build_tree(&self, root: Option<u32>) -> Vec<ProcessNode> {
        let table = self.processes.lock().unwrap();
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for meta in table.values() {
            children.entry(meta.parent_pid).or_default().push(meta.pid);
        }
        for kids in children.values_mut() {
            kids.sort_unstable();
        }

        let mut path = HashSet::new();
        if let Some(root) = root {
            if table.contains_key(&root) {
                return vec![descend(root, &children, &mut path)];
            }
        }
        let mut roots: Vec<u32> = table
            .values()
            .filter(|m| m.parent_pid <= RESERVED_PID_MAX || !table.contains_key(&m.parent_pid))
            .map(|m| m.pid)
            .collect();
        roots.sort_unstable();
        roots
            .into_iter()
            .map(|pid| descend(pid, &children, &mut path))
            .collect()
    }

    // ── Hook bookkeeping ────────────────────────────────────────────────

    /// Record that `module` was instrumented inside `pid`. Bookkeeping
    /// only; the instrumentation itself happens elsewhere.
    #[allow(dead_code)]
    pub fn register_hook(&self, pid: u32, module: &str) {
        let mut hooks = self.hooks.lock().unwrap();
        let modules = hooks.entry(pid).or_default();
        modules.push(module.to_string());
        self.audit.log(AuditKind::ApiHooked { pid, modules: modules.clone() });
    }

    /// Modules recorded for `pid`, in registration order.
    #[allow(dead_code)]
    pub fn hooked_modules(&self, pid: u32) -> Vec<String> {
        self.hooks.lock().unwrap().get(&pid).cloned().unwrap_or_default()
    }
}

fn descend(
    pid: u32,
    children: &HashMap<u32, Vec<u32>>,
    path: &mut HashSet<u32>,
) -> ProcessNode {
    path.insert(pid);
    let nodes = children
        .get(&pid)
        .map(|kids| {
            let filtered: Vec<u32> = kids
                .iter()
                .filter(|kid| **kid != pid && !path.contains(kid))
                .copied()
                .collect();
            filtered
                .into_iter()
                .map(|kid| descend(kid, children, path))
                .collect()
        })
        .unwrap_or_default();
    path.remove(&pid);
    ProcessNode { pid, children: nodes }
}

async fn recv_spawn(rx: &mut Option<mpsc::UnboundedReceiver<u32>>) -> Option<u32> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
