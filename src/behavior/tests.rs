// Test module for the behavior scoring engine.
// Covers classification, the pure indicator transition, and the shared table.

use super::*;
use crate::audit::keyfile::MachineScopeProtector;
use tempfile::TempDir;

fn thresholds() -> Thresholds {
    Thresholds::new(10, 15, 20).unwrap()
}

fn engine() -> (TempDir, Arc<BehaviorEngine>) {
    let dir = tempfile::tempdir().unwrap();
    let audit = Arc::new(AuditLog::open(dir.path(), &MachineScopeProtector).unwrap());
    (dir, Arc::new(BehaviorEngine::new(thresholds(), audit)))
}

// --- Thresholds ---

#[test]
fn test_threshold_ordering_enforced() {
    assert!(Thresholds::new(10, 15, 20).is_ok());
    assert!(Thresholds::new(15, 10, 20).is_err());
    assert!(Thresholds::new(10, 10, 20).is_err());
    assert!(Thresholds::new(10, 15, 15).is_err());
}

#[test]
fn test_classify_tiers() {
    let t = thresholds();
    assert_eq!(t.classify(0), ThreatLevel::Normal);
    assert_eq!(t.classify(9), ThreatLevel::Normal);
    assert_eq!(t.classify(10), ThreatLevel::Suspicious);
    assert_eq!(t.classify(14), ThreatLevel::Suspicious);
    assert_eq!(t.classify(15), ThreatLevel::Malicious);
    assert_eq!(t.classify(20), ThreatLevel::Critical);
    assert_eq!(t.classify(1000), ThreatLevel::Critical);
}

#[test]
fn test_level_ordering() {
    assert!(ThreatLevel::Critical > ThreatLevel::Malicious);
    assert!(ThreatLevel::Malicious > ThreatLevel::Suspicious);
    assert!(ThreatLevel::Suspicious > ThreatLevel::Normal);
}

// --- with_indicator (pure transition) ---

#[test]
fn test_with_indicator_appends_and_adds() {
    let t = thresholds();
    let s = BehaviorScore::normal(42);
    let s = with_indicator(s, "a", 3, &t);
    let s = with_indicator(s, "b", 4, &t);
    assert_eq!(s.total, 7);
    assert_eq!(s.indicators.len(), 2);
    assert_eq!(s.indicators[0].name, "a");
    assert_eq!(s.indicators[1].weight, 4);
}

#[test]
fn test_with_indicator_duplicate_names_accumulate() {
    let t = thresholds();
    let mut s = BehaviorScore::normal(42);
    for _ in 0..3 {
        s = with_indicator(s, "repeat", 5, &t);
    }
    assert_eq!(s.total, 15);
    assert_eq!(s.indicators.len(), 3);
}

#[test]
fn test_additive_totals_over_sequence() {
    let t = thresholds();
    let weights = [1u32, 2, 3, 4, 5, 6];
    let mut s = BehaviorScore::normal(7);
    for (i, w) in weights.iter().enumerate() {
        s = with_indicator(s, &format!("w{}", i), *w, &t);
    }
    assert_eq!(s.total, weights.iter().sum::<u32>());
}

#[test]
fn test_level_never_decreases_within_with_indicator() {
    let t = thresholds();
    let mut s = BehaviorScore::normal(7);
    let mut prev = s.level;
    for w in [0u32, 2, 0, 9, 1, 0, 30] {
        s = with_indicator(s, "step", w, &t);
        assert!(s.level >= prev);
        prev = s.level;
    }
}

#[test]
fn test_escalation_scenario() {
    // thresholds (10, 15, 20); three 8-point hits walk Normal ->
    // Malicious -> Critical, final total 24
    let t = thresholds();
    let s = BehaviorScore::normal(1000);
    let s = with_indicator(s, "a", 8, &t);
    assert_eq!(s.level, ThreatLevel::Normal);
    let s = with_indicator(s, "b", 8, &t);
    assert_eq!(s.level, ThreatLevel::Malicious);
    let s = with_indicator(s, "c", 8, &t);
    assert_eq!(s.total, 24);
    assert_eq!(s.level, ThreatLevel::Critical);
}

// --- Engine table ---

#[tokio::test]
async fn test_update_creates_lazily_and_returns_new_score() {
    let (_dir, engine) = engine();
    let t = *engine.thresholds();
    let score = engine.update(100, move |s| with_indicator(s, "first", 12, &t));
    assert_eq!(score.total, 12);
    assert_eq!(score.level, ThreatLevel::Suspicious);
    assert_eq!(engine.get(100).total, 12);
}

#[tokio::test]
async fn test_get_does_not_insert() {
    let (_dir, engine) = engine();
    let score = engine.get(555);
    assert_eq!(score.total, 0);
    assert_eq!(score.level, ThreatLevel::Normal);
    assert!(engine.all().is_empty());
}

#[tokio::test]
async fn test_all_snapshots_every_entry() {
    let (_dir, engine) = engine();
    let t = *engine.thresholds();
    for pid in [10u32, 20, 30] {
        engine.update(pid, move |s| with_indicator(s, "seed", 1, &t));
    }
    let mut pids: Vec<u32> = engine.all().into_iter().map(|s| s.pid).collect();
    pids.sort_unstable();
    assert_eq!(pids, vec![10, 20, 30]);
}

#[tokio::test]
async fn test_concurrent_updates_to_one_pid_all_land() {
    let (_dir, engine) = engine();
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            let t = *engine.thresholds();
            for _ in 0..50 {
                engine.update(77, move |s| with_indicator(s, "hit", 1, &t));
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(engine.get(77).total, 400);
    assert_eq!(engine.get(77).indicators.len(), 400);
}

#[tokio::test]
async fn test_update_emits_behavior_score_event() {
    use crate::audit::decoder;
    let dir = tempfile::tempdir().unwrap();
    let protector = MachineScopeProtector;
    let audit = Arc::new(AuditLog::open(dir.path(), &protector).unwrap());
    let engine = BehaviorEngine::new(thresholds(), audit.clone());
    let t = *engine.thresholds();
    engine.update(99, move |s| with_indicator(s, "seed", 21, &t));
    audit.dispose().await;

    let file = decoder::newest_log_file(dir.path()).unwrap();
    let lines = decoder::decode_file(&file, &protector).unwrap();
    let event: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(event["event_type"], "behaviorScore");
    assert_eq!(event["pid"], 99);
    assert_eq!(event["total"], 21);
    assert_eq!(event["level"], "Critical");
}
