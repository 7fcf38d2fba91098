// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Detection-plugin contract.
//!
//! Plugins extend the process probe with additional per-process analysis.
//! The dynamic loader that discovers them on disk is an external
//! collaborator; the core only sees [`ProcessAnalyzer`] trait objects
//! handed to the [`AnalyzerRegistry`] at startup.

use std::sync::Arc;

use super::Indicator;
use crate::audit::events::AuditKind;
use crate::audit::AuditLog;

/// A pluggable per-process analyzer.
///
/// Implementations must be `Send + Sync` so they can be shared as
/// `Arc<dyn ProcessAnalyzer>` across probe workers. `analyze_process` must
/// return a finite list and must not block on OS calls the probe has not
/// already paid for; it receives only the already-collected metadata.
pub trait ProcessAnalyzer: Send + Sync {
    /// Stable name, used in plugin audit events.
    fn name(&self) -> &str;

    /// Inspect one process and return any indicators it raises.
    fn analyze_process(
        &self,
        pid: u32,
        name: &str,
        command_line: &str,
        executable_path: &str,
    ) -> Vec<Indicator>;
}

/// The set of active analyzers, owned by the process probe.
pub struct AnalyzerRegistry {
    analyzers: Vec<Arc<dyn ProcessAnalyzer>>,
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self { analyzers: Vec::new() }
    }

    /// Register an analyzer and evidence the load. Called by the external
    /// plugin loader; the core only ever reads the registry.
    #[allow(dead_code)]
    pub fn register(&mut self, analyzer: Arc<dyn ProcessAnalyzer>, audit: &AuditLog) {
        audit.log(AuditKind::PluginLoaded { name: analyzer.name().to_string() });
        self.analyzers.push(analyzer);
    }

    /// Run every analyzer against one process, concatenating results.
    pub fn analyze_process(
        &self,
        pid: u32,
        name: &str,
        command_line: &str,
        executable_path: &str,
    ) -> Vec<Indicator> {
        let mut out = Vec::new();
        for analyzer in &self.analyzers {
            out.extend(analyzer.analyze_process(pid, name, command_line, executable_path));
        }
        out
    }

    pub fn len(&self) -> usize {
        self.analyzers.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.analyzers.is_empty()
    }
}

impl Default for AnalyzerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
