// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Audit event model.
//!
//! Events are the universal currency of TideWatch: every subsystem
//! produces them, the encrypted log persists them, and the offline decoder
//! reads them back. Each event serializes to one compact JSON object with
//! a `timestamp` and an internally tagged `event_type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::behavior::{Indicator, ThreatLevel};

/// A timestamped audit record, one JSON line in the encrypted stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: AuditKind,
}

impl AuditEvent {
    /// Wrap an event kind with the current time.
    pub fn now(kind: AuditKind) -> Self {
        Self { timestamp: Utc::now(), kind }
    }
}

/// Outcome of an action-manager decision, recorded in `defenseAction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Decision {
    Monitor,
    Suspend,
    SuspendFailed,
    Terminate,
    TerminateFailed,
    TerminateSkipped,
    TerminateDeferred,
    NetworkBlocked,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Decision::Monitor => "monitor",
            Decision::Suspend => "suspend",
            Decision::SuspendFailed => "suspendFailed",
            Decision::Terminate => "terminate",
            Decision::TerminateFailed => "terminateFailed",
            Decision::TerminateSkipped => "terminateSkipped",
            Decision::TerminateDeferred => "terminateDeferred",
            Decision::NetworkBlocked => "networkBlocked",
        };
        write!(f, "{}", s)
    }
}

/// A writable-and-executable region recorded by the memory probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspiciousRegion {
    pub base: u64,
    pub size: u64,
    pub protection: String,
}

/// Every event type the core emits or the decoder understands.
///
/// The decoder also tolerates event types produced by external
/// collaborators (dashboard, certificate provisioning), so those variants
/// live here even though the core never constructs them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum AuditKind {
    #[serde(rename = "behaviorScore")]
    BehaviorScore { pid: u32, total: u32, level: ThreatLevel },

    #[serde(rename = "processIndicators")]
    ProcessIndicators {
        pid: u32,
        name: String,
        command_line: String,
        indicators: Vec<Indicator>,
        total: u32,
        level: ThreatLevel,
    },

    #[serde(rename = "processRemoved")]
    ProcessRemoved { pid: u32, message: String },

    #[serde(rename = "defenseAction")]
    DefenseAction {
        pid: u32,
        decision: Decision,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "memoryAnomaly")]
    MemoryAnomaly {
        pid: u32,
        name: String,
        suspicious_regions: Vec<SuspiciousRegion>,
    },

    #[serde(rename = "networkIndicators")]
    NetworkIndicators {
        pid: u32,
        local_addr: String,
        remote_addr: String,
        remote_port: u16,
        indicators: Vec<Indicator>,
        total: u32,
        level: ThreatLevel,
    },

    #[serde(rename = "interfaceSwitched")]
    InterfaceSwitched { name: String },

    #[serde(rename = "pluginLoaded")]
    PluginLoaded { name: String },

    #[serde(rename = "pluginLoadFailed")]
    PluginLoadFailed { name: String, error: String },

    #[serde(rename = "monitoringWorkerFailed")]
    MonitoringWorkerFailed { worker: String, error: String },

    #[serde(rename = "integrityViolation")]
    IntegrityViolation { path: String, message: String },

    #[serde(rename = "certificateInstalled")]
    CertificateInstalled { subject: String },

    #[serde(rename = "processWatcherDisabled")]
    ProcessWatcherDisabled { message: String },

    #[serde(rename = "apiHooked")]
    ApiHooked { pid: u32, modules: Vec<String> },

    #[serde(rename = "uiCommand")]
    UiCommand { command: String },

    #[serde(rename = "runtimeLoad")]
    RuntimeLoad {
        cpu_percent: f64,
        memory_percent: f64,
        process_count: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_tag_serialization() {
        let event = AuditEvent::now(AuditKind::ProcessRemoved {
            pid: 1234,
            message: "gone".into(),
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"processRemoved\""));
        assert!(json.contains("\"pid\":1234"));
        assert!(json.contains("\"timestamp\""));
    }

    #[test]
    fn test_decision_serializes_camel_case() {
        let event = AuditEvent::now(AuditKind::DefenseAction {
            pid: 77,
            decision: Decision::TerminateDeferred,
            error: None,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"decision\":\"terminateDeferred\""));
        // `error: None` stays off the wire entirely
        assert!(!json.contains("error"));
    }

    #[test]
    fn test_round_trip_network_indicators() {
        let event = AuditEvent::now(AuditKind::NetworkIndicators {
            pid: 5150,
            local_addr: "10.0.0.5".into(),
            remote_addr: "203.0.113.9".into(),
            remote_port: 4444,
            indicators: vec![Indicator::new("remotePort:4444", 3)],
            total: 3,
            level: ThreatLevel::Normal,
        });
        let json = serde_json::to_string(&event).unwrap();
        let back: AuditEvent = serde_json::from_str(&json).unwrap();
        match back.kind {
            AuditKind::NetworkIndicators { pid, remote_port, indicators, .. } => {
                assert_eq!(pid, 5150);
                assert_eq!(remote_port, 4444);
                assert_eq!(indicators[0].name, "remotePort:4444");
            }
            other => panic!("wrong kind after round trip: {:?}", other),
        }
    }
}
