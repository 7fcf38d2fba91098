// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Action manager: graduated response to scored processes.
//!
//! Consumes the behavior table and decides per PID: monitor (Suspicious),
//! suspend with a scheduled resume (Malicious), or tree termination
//! (Critical), plus the advisory network-block flag the network probe
//! consults. Every decision path is evidenced as a `defenseAction` audit
//! event and stamps the per-PID cooldown.
//!
//! OS-side failures are downgraded to audited decisions; this module never
//! panics on a denied or vanished target and never propagates an error to
//! the probes that call it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use crate::audit::events::{AuditKind, Decision};
use crate::audit::AuditLog;
use crate::behavior::{BehaviorEngine, ThreatLevel};
use crate::os::ProcessOps;

/// System-reserved identifiers that are never acted upon.
const RESERVED_PID_MAX: u32 = 4;

/// Defense policy knobs, lowered from the `[defense]` config section.
#[derive(Debug, Clone)]
pub struct DefensePolicy {
    /// How long a suspended process stays stopped before the scheduled resume.
    pub process_suspend_duration: Duration,
    /// TTL of a network-block entry.
    pub network_block_duration: Duration,
    /// Minimum gap between actions on the same PID. Zero disables cooldowns.
    pub action_cooldown: Duration,
    /// Concurrent-termination cap. Zero disables termination entirely.
    pub max_concurrent_terminates: usize,
    /// Per-PID retry delay after a failed kill.
    pub terminate_failure_backoff: Duration,
}

/// The decision engine. Shared as `Arc<ActionManager>` across probes.
pub struct ActionManager {
    policy: DefensePolicy,
    own_pid: u32,
    engine: Arc<BehaviorEngine>,
    audit: Arc<AuditLog>,
    process_ops: Arc<dyn ProcessOps>,
    network_blocks: Mutex<HashMap<u32, Instant>>,
    action_cooldowns: Mutex<HashMap<u32, Instant>>,
    terminate_backoff: Mutex<HashMap<u32, Instant>>,
    terminate_semaphore: Semaphore,
}

impl ActionManager {
    pub fn new(
        policy: DefensePolicy,
        own_pid: u32,
        engine: Arc<BehaviorEngine>,
        audit: Arc<AuditLog>,
        process_ops: Arc<dyn ProcessOps>,
    ) -> Self {
        let permits = policy.max_concurrent_terminates;
        Self {
            policy,
            own_pid,
            engine,
            audit,
            process_ops,
            network_blocks: Mutex::new(HashMap::new()),
            action_cooldowns: Mutex::new(HashMap::new()),
            terminate_backoff: Mutex::new(HashMap::new()),
            terminate_semaphore: Semaphore::new(permits),
        }
    }

    /// Whether the manager may touch this PID at all.
    fn actionable(&self, pid: u32) -> bool {
        pid > RESERVED_PID_MAX && pid != self.own_pid
    }

    fn in_cooldown(&self, pid: u32) -> bool {
        self.action_cooldowns
            .lock()
            .unwrap()
            .get(&pid)
            .map(|expiry| Instant::now() < *expiry)
            .unwrap_or(false)
    }

    fn start_cooldown(&self, pid: u32) {
        if self.policy.action_cooldown > Duration::ZERO {
            self.action_cooldowns
                .lock()
                .unwrap()
                .insert(pid, Instant::now() + self.policy.action_cooldown);
        }
    }

    fn audit_decision(&self, pid: u32, decision: Decision, error: Option<String>) {
        self.audit.log(AuditKind::DefenseAction { pid, decision, error });
    }

    /// Primary entry point: look up the PID's current level and apply the
    /// matching response. Returns the decision taken, if any, mostly for
    /// tests and the dashboard contract.
    pub fn evaluate_and_respond(&self, pid: u32) -> Option<Decision> {
        if !self.actionable(pid) {
            return None;
        }
        let level = self.engine.level(pid);
        if level == ThreatLevel::Normal {
            return None;
        }
        if self.in_cooldown(pid) {
            return None;
        }
        let decision = match level {
            ThreatLevel::Suspicious => {
                self.audit_decision(pid, Decision::Monitor, None);
                Decision::Monitor
            }
            ThreatLevel::Malicious => self.suspend(pid),
            ThreatLevel::Critical => self.terminate(pid),
            ThreatLevel::Normal => unreachable!("handled above"),
        };
        self.start_cooldown(pid);
        Some(decision)
    }

    /// Suspend the target and schedule its resume. Partial thread failures
    /// are tolerated; zero suspended threads is a failure.
    fn suspend(&self, pid: u32) -> Decision {
        match self.process_ops.suspend(pid) {
            Ok(threads) if threads > 0 => {
                // Resume fires after the configured duration no matter how
                // the individual thread suspends went.
                let ops = self.process_ops.clone();
                let delay = self.policy.process_suspend_duration;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = ops.resume(pid);
                });
                self.audit_decision(pid, Decision::Suspend, None);
                Decision::Suspend
            }
            Ok(_) => {
                self.audit_decision(
                    pid,
                    Decision::SuspendFailed,
                    Some("no threads suspended".into()),
                );
                Decision::SuspendFailed
            }
            Err(e) => {
                self.audit_decision(pid, Decision::SuspendFailed, Some(e.to_string()));
                Decision::SuspendFailed
            }
        }
    }

    fn terminate(&self, pid: u32) -> Decision {
        if self.policy.max_concurrent_terminates == 0 {
            self.audit_decision(pid, Decision::TerminateSkipped, Some("disabled".into()));
            return Decision::TerminateSkipped;
        }

        let now = Instant::now();
        let deferred_until = self
            .terminate_backoff
            .lock()
            .unwrap()
            .get(&pid)
            .copied()
            .filter(|not_before| now < *not_before);
        if let Some(not_before) = deferred_until {
            let wait = not_before.saturating_duration_since(now);
            self.audit_decision(
                pid,
                Decision::TerminateDeferred,
                Some(format!("retry in {}s", wait.as_secs().max(1))),
            );
            return Decision::TerminateDeferred;
        }

        let Ok(_permit) = self.terminate_semaphore.try_acquire() else {
            self.audit_decision(
                pid,
                Decision::TerminateDeferred,
                Some("concurrency limit".into()),
            );
            return Decision::TerminateDeferred;
        };

        if !self.process_ops.is_alive(pid) {
            self.terminate_backoff.lock().unwrap().remove(&pid);
            self.audit_decision(pid, Decision::TerminateSkipped, Some("already exited".into()));
            return Decision::TerminateSkipped;
        }

        match self.process_ops.kill_tree(pid) {
            Ok(()) => {
                self.terminate_backoff.lock().unwrap().remove(&pid);
                self.audit_decision(pid, Decision::Terminate, None);
                Decision::Terminate
            }
            Err(e) if e.is_vanished() => {
                self.terminate_backoff.lock().unwrap().remove(&pid);
                self.audit_decision(pid, Decision::TerminateSkipped, Some("already exited".into()));
                Decision::TerminateSkipped
            }
            Err(e) => {
                self.terminate_backoff
                    .lock()
                    .unwrap()
                    .insert(pid, Instant::now() + self.policy.terminate_failure_backoff);
                self.audit_decision(pid, Decision::TerminateFailed, Some(e.to_string()));
                Decision::TerminateFailed
            }
        }
        // semaphore permit released on drop, on every path
    }

    /// Flag the PID so the network probe skips its rows for the configured
    /// duration.
    pub fn block_network(&self, pid: u32) {
        if !self.actionable(pid) {
            return;
        }
        self.network_blocks
            .lock()
            .unwrap()
            .insert(pid, Instant::now() + self.policy.network_block_duration);
        self.audit_decision(pid, Decision::NetworkBlocked, None);
        self.start_cooldown(pid);
    }

    /// Whether the PID is currently blocked. Expired entries encountered
    /// here are evicted on the way out.
    pub fn is_network_blocked(&self, pid: u32) -> bool {
        let now = Instant::now();
        let mut blocks = self.network_blocks.lock().unwrap();
        blocks.retain(|_, expiry| now < *expiry);
        blocks.contains_key(&pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::decoder;
    use crate::audit::keyfile::MachineScopeProtector;
    use crate::behavior::{with_indicator, Thresholds};
    use crate::os::{OsError, OsResult, RawProcess};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Controllable stand-in for the process contract.
    #[derive(Default)]
    struct MockOps {
        dead: AtomicBool,
        kill_fails: AtomicBool,
        suspend_fails: AtomicBool,
        suspends: AtomicUsize,
        resumes: AtomicUsize,
        kills: AtomicUsize,
    }

    impl ProcessOps for MockOps {
        fn list_pids(&self) -> OsResult<Vec<u32>> {
            Ok(Vec::new())
        }
        fn query(&self, pid: u32) -> OsResult<RawProcess> {
            Err(OsError::Vanished(pid))
        }
        fn is_alive(&self, _pid: u32) -> bool {
            !self.dead.load(Ordering::SeqCst)
        }
        fn is_signed(&self, _path: &str) -> bool {
            false
        }
        fn suspend(&self, _pid: u32) -> OsResult<usize> {
            self.suspends.fetch_add(1, Ordering::SeqCst);
            if self.suspend_fails.load(Ordering::SeqCst) {
                Err(OsError::Denied("suspend".into()))
            } else {
                Ok(4)
            }
        }
        fn resume(&self, _pid: u32) -> OsResult<usize> {
            self.resumes.fetch_add(1, Ordering::SeqCst);
            Ok(4)
        }
        fn kill_tree(&self, pid: u32) -> OsResult<()> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            if self.kill_fails.load(Ordering::SeqCst) {
                Err(OsError::Denied(format!("kill pid {}", pid)))
            } else {
                Ok(())
            }
        }
    }

    struct Rig {
        dir: TempDir,
        audit: Arc<AuditLog>,
        engine: Arc<BehaviorEngine>,
        ops: Arc<MockOps>,
        manager: ActionManager,
    }

    fn policy(cooldown: Duration) -> DefensePolicy {
        DefensePolicy {
            process_suspend_duration: Duration::from_millis(50),
            network_block_duration: Duration::from_millis(100),
            action_cooldown: cooldown,
            max_concurrent_terminates: 1,
            terminate_failure_backoff: Duration::from_millis(150),
        }
    }

    fn rig_with(policy: DefensePolicy) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::open(dir.path(), &MachineScopeProtector).unwrap());
        let thresholds = Thresholds::new(10, 15, 20).unwrap();
        let engine = Arc::new(BehaviorEngine::new(thresholds, audit.clone()));
        let ops = Arc::new(MockOps::default());
        let manager = ActionManager::new(
            policy,
            std::process::id(),
            engine.clone(),
            audit.clone(),
            ops.clone(),
        );
        Rig { dir, audit, engine, ops, manager }
    }

    fn raise(rig: &Rig, pid: u32, weight: u32) {
        let thresholds = *rig.engine.thresholds();
        rig.engine.update(pid, move |s| with_indicator(s, "test", weight, &thresholds));
    }

    async fn decoded_decisions(rig: &Rig) -> Vec<String> {
        rig.audit.dispose().await;
        let file = decoder::newest_log_file(rig.dir.path()).unwrap();
        decoder::decode_file(&file, &MachineScopeProtector)
            .unwrap()
            .into_iter()
            .filter_map(|line| {
                let v: serde_json::Value = serde_json::from_str(&line).ok()?;
                if v["event_type"] == "defenseAction" {
                    Some(v["decision"].as_str().unwrap().to_string())
                } else {
                    None
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_reserved_and_own_pids_are_untouchable() {
        let rig = rig_with(policy(Duration::ZERO));
        raise(&rig, 2, 50);
        assert_eq!(rig.manager.evaluate_and_respond(2), None);
        let own = std::process::id();
        raise(&rig, own, 50);
        assert_eq!(rig.manager.evaluate_and_respond(own), None);
        rig.manager.block_network(3);
        assert!(!rig.manager.is_network_blocked(3));
        assert_eq!(rig.ops.kills.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_normal_level_is_ignored() {
        let rig = rig_with(policy(Duration::ZERO));
        assert_eq!(rig.manager.evaluate_and_respond(100), None);
        raise(&rig, 100, 5); // below suspicious threshold
        assert_eq!(rig.manager.evaluate_and_respond(100), None);
    }

    #[tokio::test]
    async fn test_suspicious_monitors_and_cools_down() {
        let rig = rig_with(policy(Duration::from_secs(60)));
        raise(&rig, 100, 12);
        assert_eq!(rig.manager.evaluate_and_respond(100), Some(Decision::Monitor));
        // within cooldown: silent
        assert_eq!(rig.manager.evaluate_and_respond(100), None);
    }

    #[tokio::test]
    async fn test_malicious_suspends_exactly_once_within_cooldown() {
        let rig = rig_with(policy(Duration::from_secs(60)));
        raise(&rig, 100, 16);
        assert_eq!(rig.manager.evaluate_and_respond(100), Some(Decision::Suspend));
        assert_eq!(rig.manager.evaluate_and_respond(100), None);
        assert_eq!(rig.ops.suspends.load(Ordering::SeqCst), 1);
        let decisions = decoded_decisions(&rig).await;
        assert_eq!(decisions.iter().filter(|d| *d == "suspend").count(), 1);
    }

    #[tokio::test]
    async fn test_suspend_schedules_resume() {
        let rig = rig_with(policy(Duration::ZERO));
        raise(&rig, 100, 16);
        assert_eq!(rig.manager.evaluate_and_respond(100), Some(Decision::Suspend));
        assert_eq!(rig.ops.resumes.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(rig.ops.resumes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_suspend_failure_still_cools_down() {
        let rig = rig_with(policy(Duration::from_secs(60)));
        rig.ops.suspend_fails.store(true, Ordering::SeqCst);
        raise(&rig, 100, 16);
        assert_eq!(rig.manager.evaluate_and_respond(100), Some(Decision::SuspendFailed));
        assert_eq!(rig.manager.evaluate_and_respond(100), None);
    }

    #[tokio::test]
    async fn test_terminate_failure_sets_backoff_then_defers_then_retries() {
        let rig = rig_with(policy(Duration::ZERO));
        rig.ops.kill_fails.store(true, Ordering::SeqCst);
        raise(&rig, 100, 25);
        assert_eq!(rig.manager.evaluate_and_respond(100), Some(Decision::TerminateFailed));
        // within backoff: deferred without touching the process
        assert_eq!(rig.manager.evaluate_and_respond(100), Some(Decision::TerminateDeferred));
        assert_eq!(rig.ops.kills.load(Ordering::SeqCst), 1);
        // after backoff elapses: tried again
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rig.manager.evaluate_and_respond(100), Some(Decision::TerminateFailed));
        assert_eq!(rig.ops.kills.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_terminate_success_clears_backoff() {
        let rig = rig_with(policy(Duration::ZERO));
        rig.ops.kill_fails.store(true, Ordering::SeqCst);
        raise(&rig, 100, 25);
        assert_eq!(rig.manager.evaluate_and_respond(100), Some(Decision::TerminateFailed));
        tokio::time::sleep(Duration::from_millis(200)).await;
        rig.ops.kill_fails.store(false, Ordering::SeqCst);
        assert_eq!(rig.manager.evaluate_and_respond(100), Some(Decision::Terminate));
        assert!(rig.manager.terminate_backoff.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminate_disabled_by_zero_cap() {
        let mut p = policy(Duration::ZERO);
        p.max_concurrent_terminates = 0;
        let rig = rig_with(p);
        raise(&rig, 100, 25);
        assert_eq!(rig.manager.evaluate_and_respond(100), Some(Decision::TerminateSkipped));
        assert_eq!(rig.ops.kills.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_terminate_deferred_at_concurrency_limit() {
        let rig = rig_with(policy(Duration::ZERO));
        raise(&rig, 100, 25);
        // occupy the single permit as if another kill were in flight
        rig.manager.terminate_semaphore.try_acquire().unwrap().forget();
        assert_eq!(rig.manager.evaluate_and_respond(100), Some(Decision::TerminateDeferred));
        assert_eq!(rig.ops.kills.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_terminate_already_exited_is_skipped() {
        let rig = rig_with(policy(Duration::ZERO));
        rig.ops.dead.store(true, Ordering::SeqCst);
        raise(&rig, 100, 25);
        assert_eq!(rig.manager.evaluate_and_respond(100), Some(Decision::TerminateSkipped));
        assert_eq!(rig.ops.kills.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_network_block_expires_and_evicts() {
        let rig = rig_with(policy(Duration::ZERO));
        rig.manager.block_network(500);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rig.manager.is_network_blocked(500));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!rig.manager.is_network_blocked(500));
        assert!(rig.manager.network_blocks.lock().unwrap().is_empty());
    }
}
