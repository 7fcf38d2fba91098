// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Network probe.
//!
//! Snapshots the owner-aware TCP table every cycle, correlates rows to
//! PIDs through a 5-tuple connection cache, and raises connection-derived
//! indicators: suspicious remote ports, high-risk destination hosts, and
//! credential-exfiltration keywords in the row's explanation text. A hit
//! of weight 4 or more flags the PID for a network block.
//!
//! `payload_snapshot` is explanation text only, never wire bytes. External
//! sensors may enrich it through [`NetworkProbe::annotate`]; any future
//! real payload inspection gets its own field.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::audit::events::AuditKind;
use crate::audit::AuditLog;
use crate::behavior::{with_indicator, BehaviorEngine, Indicator};
use crate::config::NetworkConfig;
use crate::os::NetOps;
use crate::response::ActionManager;

const RESERVED_PID_MAX: u32 = 4;

/// Keywords credential-stealer beacons embed in their checkin payloads.
const EXFIL_KEYWORDS: &[&str] = &["uid=", "cid=", "hwid=", "ver=4.0"];

/// Indicator weight at or above which a network block is applied.
const BLOCK_WEIGHT: u32 = 4;

/// Cap on the [`NetworkProbe::snapshot_connections`] result.
const SNAPSHOT_LIMIT: usize = 25;

/// Cache key: one observed connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConnKey {
    pid: u32,
    local_addr: String,
    local_port: u16,
    remote_addr: String,
    remote_port: u16,
}

/// One cached connection, as exposed to the dashboard contract.
#[derive(Debug, Clone, Serialize)]
pub struct Connection {
    pub pid: u32,
    pub local_addr: String,
    pub local_port: u16,
    pub remote_addr: String,
    pub remote_port: u16,
    pub last_observed: DateTime<Utc>,
    /// Human-readable explanation of what this row is, not wire bytes.
    pub payload_snapshot: String,
}

/// Interface selection failure.
#[derive(Debug)]
pub enum InterfaceError {
    NotFound(String),
    Os(crate::os::OsError),
}

impl std::fmt::Display for InterfaceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterfaceError::NotFound(name) => {
                write!(f, "no operationally-up interface matches '{}'", name)
            }
            InterfaceError::Os(e) => write!(f, "interface enumeration failed: {}", e),
        }
    }
}

impl std::error::Error for InterfaceError {}

pub struct NetworkProbe {
    config: NetworkConfig,
    engine: Arc<BehaviorEngine>,
    actions: Arc<ActionManager>,
    audit: Arc<AuditLog>,
    net_ops: Arc<dyn NetOps>,
    cache: Mutex<HashMap<ConnKey, Connection>>,
    active_interface: Mutex<Option<String>>,
}

impl NetworkProbe {
    pub fn new(
        config: NetworkConfig,
        engine: Arc<BehaviorEngine>,
        actions: Arc<ActionManager>,
        audit: Arc<AuditLog>,
        net_ops: Arc<dyn NetOps>,
    ) -> Self {
        Self {
            config,
            engine,
            actions,
            audit,
            net_ops,
            cache: Mutex::new(HashMap::new()),
            active_interface: Mutex::new(None),
        }
    }

    pub async fn run(self: Arc<Self>, mut cancel: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.select_startup_interface();
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

    /// One snapshot-and-correlate pass over the TCP table.
    pub fn cycle(&self) {
        let rows = match self.net_ops.tcp_table() {
            Ok(rows) => rows,
            Err(_) => return, // transient: keep last cycle's cache intact
        };

        let now = Utc::now();
        let entries: Vec<Connection> = {
            let mut cache = self.cache.lock().unwrap();
            let mut seen: HashSet<ConnKey> = HashSet::with_capacity(rows.len());
            for row in rows {
                let key = ConnKey {
                    pid: row.pid,
                    local_addr: row.local_addr.clone(),
                    local_port: row.local_port,
                    remote_addr: row.remote_addr.clone(),
                    remote_port: row.remote_port,
                };
                seen.insert(key.clone());
                cache
                    .entry(key)
                    .and_modify(|conn| conn.last_observed = now)
                    .or_insert_with(|| Connection {
                        pid: row.pid,
                        local_addr: row.local_addr.clone(),
                        local_port: row.local_port,
                        remote_addr: row.remote_addr.clone(),
                        remote_port: row.remote_port,
                        last_observed: now,
                        payload_snapshot: format!(
                            "tcp {}:{} -> {}:{}",
                            row.local_addr, row.local_port, row.remote_addr, row.remote_port
                        ),
                    });
            }
            // Connections absent from this snapshot are gone.
            cache.retain(|key, _| seen.contains(key));
            cache.values().cloned().collect()
        };

        for conn in entries {
            if conn.pid <= RESERVED_PID_MAX || self.actions.is_network_blocked(conn.pid) {
                continue;
            }
            let indicators = self.indicators_for(&conn);
            if indicators.is_empty() {
                continue;
            }

            let thresholds = *self.engine.thresholds();
            let deltas = indicators.clone();
            let score = self.engine.update(conn.pid, move |mut score| {
                for ind in &deltas {
                    score = with_indicator(score, &ind.name, ind.weight, &thresholds);
                }
                score
            });
            self.actions.evaluate_and_respond(conn.pid);
            if indicators.iter().any(|i| i.weight >= BLOCK_WEIGHT) {
                self.actions.block_network(conn.pid);
            }
            self.audit.log(AuditKind::NetworkIndicators {
                pid: conn.pid,
                local_addr: conn.local_addr,
                remote_addr: conn.remote_addr,
                remote_port: conn.remote_port,
                indicators,
                total: score.total,
                level: score.level,
            });
        }
    }

    fn indicators_for(&self, conn: &Connection) -> Vec<Indicator> {
        let mut indicators = Vec::new();
        if self.config.suspicious_ports.contains(&conn.remote_port) {
            indicators.push(Indicator::new(format!("remotePort:{}", conn.remote_port), 3));
        }
        if self.config.high_risk_hosts.iter().any(|host| conn.remote_addr.contains(host.as_str())) {
            indicators.push(Indicator::new("highRiskHost", 3));
        }
        for keyword in EXFIL_KEYWORDS {
            if conn.payload_snapshot.contains(keyword) {
                indicators.push(Indicator::new(format!("exfilKeyword:{}", keyword), 4));
            }
        }
        indicators
    }

    /// Attach explanation text to every cached row of `pid` toward
    /// `remote_addr`. This is the enrichment seam for external sensors;
    /// the keyword rule evaluates whatever text lands here.
    #[allow(dead_code)]
    pub fn annotate(&self, pid: u32, remote_addr: &str, explanation: &str) {
        let mut cache = self.cache.lock().unwrap();
        for (key, conn) in cache.iter_mut() {
            if key.pid == pid && key.remote_addr == remote_addr {
                conn.payload_snapshot = explanation.to_string();
            }
        }
    }

    /// Up to the 25 most recently observed connections, newest first.
    /// Dashboard contract.
    #[allow(dead_code)]
    pub fn snapshot_connections(&self) -> Vec<Connection> {
        let mut connections: Vec<Connection> =
            self.cache.lock().unwrap().values().cloned().collect();
        connections.sort_by(|a, b| b.last_observed.cmp(&a.last_observed).then(a.pid.cmp(&b.pid)));
        connections.truncate(SNAPSHOT_LIMIT);
        connections
    }

    /// The interface currently treated as primary, if any.
    #[allow(dead_code)]
    pub fn active_interface(&self) -> Option<String> {
        self.active_interface.lock().unwrap().clone()
    }

    /// Startup selection: best operationally-up interface, preferring
    /// wireless and then the configured name prefix.
    fn select_startup_interface(&self) {
        let Ok(interfaces) = self.net_ops.interfaces() else {
            return;
        };
        let preference = self.config.primary_interface_preference.as_str();
        let mut up: Vec<_> = interfaces.into_iter().filter(|i| i.up).collect();
        up.sort_by(|a, b| {
            b.wireless
                .cmp(&a.wireless)
                .then_with(|| {
                    let a_pref = !preference.is_empty() && a.name.starts_with(preference);
                    let b_pref = !preference.is_empty() && b.name.starts_with(preference);
                    b_pref.cmp(&a_pref)
                })
                .then_with(|| a.name.cmp(&b.name))
        });
        if let Some(best) = up.first() {
            self.set_active(&best.name);
        }
    }

    /// Switch to a named interface. Fails when no operationally-up
    /// interface carries that name. Reached from the `uiCommand` surface.
    #[allow(dead_code)]
    pub fn switch_interface(&self, name: &str) -> Result<(), InterfaceError> {
        let interfaces = self.net_ops.interfaces().map_err(InterfaceError::Os)?;
        let found = interfaces.iter().any(|i| i.up && i.name == name);
        if !found {
            return Err(InterfaceError::NotFound(name.to_string()));
        }
        self.set_active(name);
        Ok(())
    }

    fn set_active(&self, name: &str) {
        let mut active = self.active_interface.lock().unwrap();
        if active.as_deref() != Some(name) {
            *active = Some(name.to_string());
            self.audit.log(AuditKind::InterfaceSwitched { name: name.to_string() });
        }
    }
}
