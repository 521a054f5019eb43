//! Approval Gate Integration Tests
//!
//! Threshold properties of the decision function and exactly-once routing
//! of intents through the gate stage.

use proptest::prelude::*;
use tempfile::TempDir;
use wodehouse::core::{Decision, GatePolicy, GateStage, Handler, Mode, RecordLog, TransportSettings};
use wodehouse::domain::{Intent, PendingRecord, RecordBody, RecordKind, SuggestReason};

fn policy(mode: Mode, threshold: f64, always_confirm: Vec<String>) -> GatePolicy {
    GatePolicy {
        mode,
        confidence_threshold: threshold,
        always_confirm_action_types: always_confirm,
    }
}

fn action_type() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("calendar.add".to_string()),
        Just("script.run".to_string()),
        Just("home.lights.on".to_string()),
        "[a-z]{1,8}\\.[a-z]{1,8}",
    ]
}

proptest! {
    #[test]
    fn prop_below_threshold_never_acts(
        threshold in 0.0f64..=1.0,
        gap in 1e-9f64..1.0,
        live in any::<bool>(),
        human_override in any::<bool>(),
        action_type in action_type(),
    ) {
        let confidence = threshold - gap;

        let mode = if live { Mode::Live } else { Mode::Poc };
        let gate = policy(mode, threshold, vec![]);
        let mut intent = Intent::new(action_type.as_str(), confidence, "u");
        intent.human_override = human_override;

        prop_assert_eq!(gate.decide(&intent), Decision::Suggest(SuggestReason::LowConfidence));
    }

    #[test]
    fn prop_poc_never_acts(
        threshold in 0.0f64..=1.0,
        confidence in 0.0f64..=1.0,
        human_override in any::<bool>(),
        action_type in action_type(),
    ) {
        let gate = policy(Mode::Poc, threshold, vec!["script.*".to_string()]);
        let mut intent = Intent::new(action_type.as_str(), confidence, "u");
        intent.human_override = human_override;

        prop_assert!(!gate.decide(&intent).is_action());
    }

    #[test]
    fn prop_decision_is_deterministic(
        threshold in 0.0f64..=1.0,
        confidence in 0.0f64..=1.0,
        live in any::<bool>(),
        action_type in action_type(),
    ) {
        let mode = if live { Mode::Live } else { Mode::Poc };
        let gate = policy(mode, threshold, vec!["script.run".to_string()]);
        let intent = Intent::new(action_type.as_str(), confidence, "u");

        prop_assert_eq!(gate.decide(&intent), gate.decide(&intent));
    }
}

#[tokio::test]
async fn test_redelivered_intent_gets_one_decision() {
    let temp = TempDir::new().unwrap();
    let log = RecordLog::open(temp.path().join("records.jsonl"), TransportSettings::default())
        .await
        .unwrap();

    let seq = log
        .append(PendingRecord::new(RecordBody::Intent(Intent::new(
            "calendar.add",
            0.9,
            "u1",
        ))))
        .await
        .unwrap();
    let intent = log.get(seq).await.unwrap().unwrap();

    let live = policy(Mode::Live, 0.6, vec![]);
    let mut gate = GateStage::new(log.clone(), live.clone());
    gate.prepare().await.unwrap();
    gate.handle(&intent).await.unwrap();
    gate.handle(&intent).await.unwrap();

    // A restarted gate seeds itself from the log
    let mut restarted = GateStage::new(log.clone(), live);
    restarted.prepare().await.unwrap();
    restarted.handle(&intent).await.unwrap();

    let records = log.snapshot().await.unwrap();
    let decisions: Vec<_> = records
        .iter()
        .filter(|r| matches!(r.kind(), RecordKind::Action | RecordKind::Suggestion))
        .collect();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].kind(), RecordKind::Action);
    assert_eq!(decisions[0].correlation_id, Some(intent.id));
}

#[tokio::test]
async fn test_override_without_known_suggestion_is_rejected() {
    let temp = TempDir::new().unwrap();
    let log = RecordLog::open(temp.path().join("records.jsonl"), TransportSettings::default())
        .await
        .unwrap();

    let mut forged = Intent::new("script.run", 1.0, "u1");
    forged.human_override = true;
    let seq = log
        .append(PendingRecord::new(RecordBody::Intent(forged)).correlated_with(uuid::Uuid::new_v4()))
        .await
        .unwrap();
    let record = log.get(seq).await.unwrap().unwrap();

    let mut gate = GateStage::new(log.clone(), policy(Mode::Live, 0.6, vec!["script.run".into()]));
    gate.prepare().await.unwrap();
    gate.handle(&record).await.unwrap();

    let records = log.snapshot().await.unwrap();
    match &records.last().unwrap().body {
        RecordBody::Suggestion(s) => assert_eq!(s.reason, SuggestReason::OverrideRejected),
        other => panic!("expected rejection, got {:?}", other),
    }
}
