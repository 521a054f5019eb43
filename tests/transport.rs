//! Transport Integration Tests
//!
//! Concurrent appends, ordering and tail-follow across log handles.

use std::collections::HashSet;
use std::time::Duration;

use tempfile::TempDir;
use tokio_test::assert_ok;
use wodehouse::core::{ReadMode, RecordLog, TransportError, TransportSettings};
use wodehouse::domain::{PendingRecord, RecordBody, Utterance};

fn utterance(text: &str) -> PendingRecord {
    PendingRecord::new(RecordBody::Utterance(Utterance::new(text, 0.9)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_are_gapless() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("records.jsonl");

    // Separate handles share nothing but the file, like separate processes
    let handles = vec![
        RecordLog::open(&path, TransportSettings::default()).await.unwrap(),
        RecordLog::open(&path, TransportSettings::default()).await.unwrap(),
        RecordLog::open(&path, TransportSettings::default()).await.unwrap(),
    ];

    let mut tasks = Vec::new();
    for (writer, log) in handles.iter().enumerate() {
        for i in 0..25 {
            let log = log.clone();
            tasks.push(tokio::spawn(async move {
                log.append(utterance(&format!("writer {} message {}", writer, i))).await
            }));
        }
    }

    let mut seqs = HashSet::new();
    for task in tasks {
        let seq = assert_ok!(task.await.unwrap());
        assert!(seqs.insert(seq), "sequence {} assigned twice", seq);
    }

    let expected: HashSet<u64> = (1..=75).collect();
    assert_eq!(seqs, expected);

    let records = handles[0].snapshot().await.unwrap();
    let order: Vec<u64> = records.iter().map(|r| r.seq).collect();
    assert_eq!(order, (1..=75).collect::<Vec<_>>());
    assert_eq!(handles[2].head().await.unwrap(), 75);
}

#[tokio::test]
async fn test_follow_reader_sees_other_handle_appends() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("records.jsonl");
    let settings = TransportSettings {
        lock_timeout_ms: 1000,
        poll_interval_ms: 20,
    };

    let reader_log = RecordLog::open(&path, settings.clone()).await.unwrap();
    let writer_log = RecordLog::open(&path, settings).await.unwrap();
    writer_log.append(utterance("first")).await.unwrap();

    let mut reader = reader_log.read_from("follower", 0, ReadMode::Follow).await.unwrap();
    assert_eq!(reader.next().await.unwrap().unwrap().seq, 1);

    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer_log.append(utterance("second")).await.unwrap()
    });

    // Different handle, so only the poll fallback (or fs events) can wake us
    let record = tokio::time::timeout(Duration::from_secs(5), reader.next())
        .await
        .expect("follow reader never woke")
        .unwrap()
        .unwrap();
    assert_eq!(record.seq, 2);
    assert_eq!(writer.await.unwrap(), 2);
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("records.jsonl");

    {
        let log = RecordLog::open(&path, TransportSettings::default()).await.unwrap();
        log.append(utterance("one")).await.unwrap();
        log.append(utterance("two")).await.unwrap();
    }

    let log = RecordLog::open(&path, TransportSettings::default()).await.unwrap();
    assert_eq!(log.append(utterance("three")).await.unwrap(), 3);

    let texts: Vec<String> = log
        .snapshot()
        .await
        .unwrap()
        .into_iter()
        .filter_map(|r| match r.body {
            RecordBody::Utterance(u) => Some(u.text),
            _ => None,
        })
        .collect();
    assert_eq!(texts, vec!["one", "two", "three"]);
}

#[cfg(unix)]
#[tokio::test]
async fn test_append_times_out_while_log_is_locked() {
    use fs2::FileExt;

    let temp = TempDir::new().unwrap();
    let path = temp.path().join("records.jsonl");
    let settings = TransportSettings {
        lock_timeout_ms: 50,
        ..TransportSettings::default()
    };
    let log = RecordLog::open(&path, settings).await.unwrap();
    assert_ok!(log.append(utterance("before")).await);

    // Another writer holds the lock and never lets go
    let holder = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    holder.lock_exclusive().unwrap();

    let err = log.append(utterance("blocked")).await.unwrap_err();
    assert!(matches!(err, TransportError::LockTimeout(_)));
    assert_eq!(log.head().await.unwrap(), 1);

    holder.unlock().unwrap();
    assert_eq!(log.append(utterance("after")).await.unwrap(), 2);
}
