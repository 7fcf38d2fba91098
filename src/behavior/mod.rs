// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Behavior scoring engine.
//!
//! The authoritative per-process risk table. Probes translate observations
//! into weighted [`Indicator`]s; each indicator is added to the process's
//! running total, and the total classifies into a [`ThreatLevel`] against
//! the configured threshold triple. Scores are created lazily on the first
//! indicator and accumulate for the life of the process.
//!
//! `update` is linearizable per PID (one table lock); ordering across PIDs
//! is unspecified and nothing depends on it.

pub mod plugin;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::audit::events::AuditKind;
use crate::audit::AuditLog;

/// Classification tiers, ordered from benign to actionable.
///
/// `Ord` matters: the action manager dispatches on comparisons and the
/// memory probe selects scan targets by `>= Suspicious`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ThreatLevel {
    Normal,
    Suspicious,
    Malicious,
    Critical,
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreatLevel::Normal => write!(f, "NORMAL"),
            ThreatLevel::Suspicious => write!(f, "SUSPICIOUS"),
            ThreatLevel::Malicious => write!(f, "MALICIOUS"),
            ThreatLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// A named reason for suspicion with a positive weight. The same name may
/// be raised repeatedly; every occurrence adds its weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Indicator {
    pub name: String,
    pub weight: u32,
}

impl Indicator {
    pub fn new(name: impl Into<String>, weight: u32) -> Self {
        Self { name: name.into(), weight }
    }
}

/// Strictly increasing score thresholds for the three actionable tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub suspicious: u32,
    pub malicious: u32,
    pub critical: u32,
}

impl Thresholds {
    /// Build a validated triple. Fails unless `suspicious < malicious < critical`.
    pub fn new(suspicious: u32, malicious: u32, critical: u32) -> anyhow::Result<Self> {
        if !(suspicious < malicious && malicious < critical) {
            anyhow::bail!(
                "behavior thresholds must be strictly increasing (got {} / {} / {})",
                suspicious,
                malicious,
                critical
            );
        }
        Ok(Self { suspicious, malicious, critical })
    }

    /// The highest tier whose threshold the total has reached.
    pub fn classify(&self, total: u32) -> ThreatLevel {
        if total >= self.critical {
            ThreatLevel::Critical
        } else if total >= self.malicious {
            ThreatLevel::Malicious
        } else if total >= self.suspicious {
            ThreatLevel::Suspicious
        } else {
            ThreatLevel::Normal
        }
    }
}

/// One process's accumulated risk state.
#[derive(Debug, Clone, Serialize)]
pub struct BehaviorScore {
    pub pid: u32,
    pub total: u32,
    /// Append-only history of every indicator ever applied.
    pub indicators: Vec<Indicator>,
    pub level: ThreatLevel,
}

impl BehaviorScore {
    /// A fresh Normal score with no history.
    pub fn normal(pid: u32) -> Self {
        Self { pid, total: 0, indicators: Vec::new(), level: ThreatLevel::Normal }
    }
}

/// Pure score transition: append the indicator, add its weight, reclassify.
pub fn with_indicator(
    mut score: BehaviorScore,
    name: &str,
    weight: u32,
    thresholds: &Thresholds,
) -> BehaviorScore {
    score.indicators.push(Indicator::new(name, weight));
    score.total = score.total.saturating_add(weight);
    score.level = thresholds.classify(score.total);
    score
}

/// The shared score table. Probes hold an `Arc<BehaviorEngine>` and funnel
/// every score mutation through [`BehaviorEngine::update`].
pub struct BehaviorEngine {
    thresholds: Thresholds,
    table: Mutex<HashMap<u32, BehaviorScore>>,
    audit: Arc<AuditLog>,
}

impl BehaviorEngine {
    pub fn new(thresholds: Thresholds, audit: Arc<AuditLog>) -> Self {
        Self { thresholds, table: Mutex::new(HashMap::new()), audit }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Apply `f` to the current score for `pid` (or a fresh Normal entry),
    /// store the result, and return it. The table lock is held across the
    /// read-modify-write, so concurrent updates to one PID serialize.
    ///
    /// Every update is evidenced with a `behaviorScore` audit event.
    pub fn update(
        &self,
        pid: u32,
        f: impl FnOnce(BehaviorScore) -> BehaviorScore,
    ) -> BehaviorScore {
        let updated = {
            let mut table = self.table.lock().unwrap();
            let current = table.remove(&pid).unwrap_or_else(|| BehaviorScore::normal(pid));
            let updated = f(current);
            table.insert(pid, updated.clone());
            updated
        };
        self.audit.log(AuditKind::BehaviorScore {
            pid,
            total: updated.total,
            level: updated.level,
        });
        updated
    }

    /// Current score for `pid`, or a fresh Normal default. Never inserts.
    pub fn get(&self, pid: u32) -> BehaviorScore {
        self.table
            .lock()
            .unwrap()
            .get(&pid)
            .cloned()
            .unwrap_or_else(|| BehaviorScore::normal(pid))
    }

    /// Current level for `pid` without cloning the whole score.
    pub fn level(&self, pid: u32) -> ThreatLevel {
        self.table
            .lock()
            .unwrap()
            .get(&pid)
            .map(|s| s.level)
            .unwrap_or(ThreatLevel::Normal)
    }

    /// Snapshot of every tracked score. Part of the dashboard contract;
    /// only the frontend collaborator and tests read it today.
    #[allow(dead_code)]
    pub fn all(&self) -> Vec<BehaviorScore> {
        self.table.lock().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests;
