//! Pipeline Integration Tests
//!
//! End-to-end runs of resolver, gate, script runner and audit logger over
//! one record log.

use tempfile::TempDir;
use wodehouse::adapters::ScriptSpec;
use wodehouse::config::ResolvedConfig;
use wodehouse::consumers::{self, AuditLogger};
use wodehouse::core::{Handler, Mode, Supervisor};
use wodehouse::domain::{
    ActionStatus, ApprovalSource, ParamValue, Record, RecordBody, RecordKind, SuggestReason,
    Utterance,
};

fn config(temp: &TempDir, mode: Mode) -> ResolvedConfig {
    let mut config = ResolvedConfig::with_home(temp.path().join("home"));
    config.pipeline.gate.mode = mode;
    config.pipeline.retry_initial_delay_ms = 1;
    config.pipeline.retry_max_delay_ms = 5;
    config
}

fn kinds(records: &[Record]) -> Vec<RecordKind> {
    records.iter().map(|r| r.kind()).collect()
}

fn last_suggestion(records: &[Record]) -> &Record {
    records
        .iter()
        .rev()
        .find(|r| r.kind() == RecordKind::Suggestion)
        .expect("no suggestion recorded")
}

#[tokio::test]
async fn test_poc_mode_only_suggests() {
    let temp = TempDir::new().unwrap();
    let supervisor = Supervisor::open(config(&temp, Mode::Poc)).await.unwrap();

    supervisor
        .ingest(Utterance::new("add meeting with Joanna Friday 3pm", 0.95))
        .await
        .unwrap();
    supervisor.drain().await.unwrap();

    let records = supervisor.log().snapshot().await.unwrap();
    assert_eq!(
        kinds(&records),
        vec![RecordKind::Utterance, RecordKind::Intent, RecordKind::Suggestion]
    );

    match &records[1].body {
        RecordBody::Intent(intent) => {
            assert_eq!(intent.action_type.as_str(), "calendar.add");
            assert_eq!(intent.params["title"], ParamValue::from("meeting with Joanna"));
            assert_eq!(intent.params["time"], ParamValue::from("Friday 3pm"));
            assert_eq!(intent.confidence, 0.95);
        }
        other => panic!("expected intent, got {:?}", other),
    }
    assert_eq!(records[1].correlation_id, Some(records[0].id));

    match &records[2].body {
        RecordBody::Suggestion(s) => assert_eq!(s.reason, SuggestReason::PocMode),
        other => panic!("expected suggestion, got {:?}", other),
    }
    assert_eq!(records[2].correlation_id, Some(records[1].id));
}

#[tokio::test]
async fn test_live_low_confidence_suggests() {
    let temp = TempDir::new().unwrap();
    let supervisor = Supervisor::open(config(&temp, Mode::Live)).await.unwrap();

    supervisor
        .ingest(Utterance::new("add dentist Tuesday 10am", 0.4))
        .await
        .unwrap();
    supervisor.drain().await.unwrap();

    let records = supervisor.log().snapshot().await.unwrap();
    assert!(records.iter().all(|r| r.kind() != RecordKind::Action));
    match &last_suggestion(&records).body {
        RecordBody::Suggestion(s) => assert_eq!(s.reason, SuggestReason::LowConfidence),
        other => panic!("expected suggestion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_override_cannot_lift_low_confidence() {
    let temp = TempDir::new().unwrap();
    let supervisor = Supervisor::open(config(&temp, Mode::Live)).await.unwrap();

    supervisor
        .ingest(Utterance::new("add dentist Tuesday 10am", 0.3))
        .await
        .unwrap();
    supervisor.drain().await.unwrap();

    let records = supervisor.log().snapshot().await.unwrap();
    let suggestion = last_suggestion(&records).clone();
    supervisor.approve(suggestion.seq).await.unwrap();
    supervisor.drain().await.unwrap();

    let records = supervisor.log().snapshot().await.unwrap();
    assert!(records.iter().all(|r| r.kind() != RecordKind::Action));
    let answer = last_suggestion(&records);
    assert_ne!(answer.id, suggestion.id);
    match &answer.body {
        RecordBody::Suggestion(s) => {
            assert_eq!(s.reason, SuggestReason::LowConfidence);
            assert!(s.intent.human_override);
            assert_eq!(s.intent.confidence, 0.3);
        }
        other => panic!("expected suggestion, got {:?}", other),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_always_confirm_then_override_executes() {
    let temp = TempDir::new().unwrap();
    let marker = temp.path().join("ran.txt");

    let mut cfg = config(&temp, Mode::Live);
    cfg.scripts.insert(
        "script.run".to_string(),
        ScriptSpec::new("sh").with_args([
            "-c".to_string(),
            format!("echo \"$WODEHOUSE_ACTION_ID\" >> '{}'", marker.display()),
        ]),
    );
    let supervisor = Supervisor::open(cfg).await.unwrap();

    supervisor
        .ingest(Utterance::new("run the backup script", 0.9))
        .await
        .unwrap();
    supervisor.drain().await.unwrap();

    let records = supervisor.log().snapshot().await.unwrap();
    let suggestion = last_suggestion(&records);
    match &suggestion.body {
        RecordBody::Suggestion(s) => assert_eq!(s.reason, SuggestReason::AlwaysConfirm),
        other => panic!("expected suggestion, got {:?}", other),
    }
    assert!(!marker.exists());

    supervisor.approve(suggestion.seq).await.unwrap();
    supervisor.drain().await.unwrap();

    let records = supervisor.log().snapshot().await.unwrap();
    let action = records
        .iter()
        .find(|r| r.kind() == RecordKind::Action)
        .expect("override produced no action");
    match &action.body {
        RecordBody::Action(a) => {
            assert_eq!(a.approval, ApprovalSource::HumanOverride);
            assert!(a.intent.human_override);
            assert_eq!(a.intent.confidence, 0.9);
        }
        other => panic!("expected action, got {:?}", other),
    }

    let result = records
        .iter()
        .find(|r| r.kind() == RecordKind::ActionResult)
        .expect("no action result");
    assert_eq!(result.correlation_id, Some(action.id));
    match &result.body {
        RecordBody::ActionResult(r) => assert_eq!(r.status, ActionStatus::Succeeded),
        other => panic!("expected result, got {:?}", other),
    }

    let ran = std::fs::read_to_string(&marker).unwrap();
    assert_eq!(ran.trim(), action.id.to_string());

    // A second approval of the same suggestion must not execute again
    supervisor.approve(suggestion.seq).await.unwrap();
    supervisor.drain().await.unwrap();
    let records = supervisor.log().snapshot().await.unwrap();
    assert_eq!(records.iter().filter(|r| r.kind() == RecordKind::Action).count(), 1);
    match &last_suggestion(&records).body {
        RecordBody::Suggestion(s) => assert_eq!(s.reason, SuggestReason::OverrideRejected),
        other => panic!("expected suggestion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unmapped_action_is_skipped() {
    let temp = TempDir::new().unwrap();
    let supervisor = Supervisor::open(config(&temp, Mode::Live)).await.unwrap();

    // The rule resolver has no lighting rules, so hand the gate an intent directly
    let utterance = Utterance::new("lights on", 0.9);
    let utterance_seq = supervisor.ingest(utterance.clone()).await.unwrap();
    let utterance_record = supervisor.log().get(utterance_seq).await.unwrap().unwrap();
    supervisor
        .log()
        .append(
            wodehouse::domain::PendingRecord::new(RecordBody::Intent(
                wodehouse::domain::Intent::new("home.lights.on", 0.9, utterance.utterance_id),
            ))
            .correlated_with(utterance_record.id),
        )
        .await
        .unwrap();

    supervisor.drain().await.unwrap();

    let records = supervisor.log().snapshot().await.unwrap();
    assert_eq!(
        kinds(&records),
        vec![
            RecordKind::Utterance,
            RecordKind::Intent,
            RecordKind::Action,
            RecordKind::ActionResult
        ]
    );
    match &records[3].body {
        RecordBody::ActionResult(r) => {
            assert_eq!(r.status, ActionStatus::Skipped);
            assert_eq!(r.consumer, consumers::SCRIPT_RUNNER);
        }
        other => panic!("expected result, got {:?}", other),
    }
}

#[tokio::test]
async fn test_drain_is_idempotent_across_restarts() {
    let temp = TempDir::new().unwrap();

    {
        let supervisor = Supervisor::open(config(&temp, Mode::Poc)).await.unwrap();
        supervisor
            .ingest(Utterance::new("remind me to call mom tomorrow at 9", 0.9).with_id("u-1"))
            .await
            .unwrap();
        supervisor.drain().await.unwrap();
    }

    // Same utterance resubmitted upstream, then a fresh process drains again
    let supervisor = Supervisor::open(config(&temp, Mode::Poc)).await.unwrap();
    supervisor
        .ingest(Utterance::new("remind me to call mom tomorrow at 9", 0.9).with_id("u-1"))
        .await
        .unwrap();
    supervisor.drain().await.unwrap();
    supervisor.drain().await.unwrap();

    let records = supervisor.log().snapshot().await.unwrap();
    let intents = records.iter().filter(|r| r.kind() == RecordKind::Intent).count();
    let suggestions = records.iter().filter(|r| r.kind() == RecordKind::Suggestion).count();
    assert_eq!(intents, 1);
    assert_eq!(suggestions, 1);
}

#[tokio::test]
async fn test_low_confidence_utterance_is_dropped() {
    let temp = TempDir::new().unwrap();
    let supervisor = Supervisor::open(config(&temp, Mode::Live)).await.unwrap();

    supervisor
        .ingest(Utterance::new("add meeting Friday 3pm", 0.1))
        .await
        .unwrap();
    let summaries = supervisor.drain().await.unwrap();

    let records = supervisor.log().snapshot().await.unwrap();
    assert_eq!(kinds(&records), vec![RecordKind::Utterance]);

    let resolver = summaries
        .iter()
        .find(|s| s.consumer_id == consumers::RESOLVER)
        .unwrap();
    assert_eq!(resolver.handled, 1);
    assert_eq!(resolver.end_offset, 1);
}

#[tokio::test]
async fn test_audit_trail_mirrors_log() {
    let temp = TempDir::new().unwrap();
    let cfg = config(&temp, Mode::Poc);
    let audit_dir = cfg.audit_dir();
    let supervisor = Supervisor::open(cfg).await.unwrap();

    supervisor
        .ingest(Utterance::new("journal had a quiet day", 0.9))
        .await
        .unwrap();
    supervisor.drain().await.unwrap();

    let head = supervisor.log().head().await.unwrap();
    let audit = std::fs::read_to_string(audit_dir.join("audit.jsonl")).unwrap();
    assert_eq!(audit.lines().count() as u64, head);

    // Redelivering to a fresh logger writes nothing twice
    let mut logger = AuditLogger::new(&audit_dir);
    logger.prepare().await.unwrap();
    for record in supervisor.log().snapshot().await.unwrap() {
        logger.handle(&record).await.unwrap();
    }
    let audit = std::fs::read_to_string(audit_dir.join("audit.jsonl")).unwrap();
    assert_eq!(audit.lines().count() as u64, head);
}
