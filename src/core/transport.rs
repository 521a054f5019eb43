//! Append-only record log with file-based persistence.
//!
//! Records are stored as newline-delimited JSON (JSONL), one record per line.
//! A record's sequence number is its 1-based line number, so numbering is
//! gapless and duplicate-free by construction. Appends from any thread or
//! process are serialized by an exclusive advisory lock on the log file.

use std::fs::OpenOptions as StdOpenOptions;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use fs2::FileExt;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::domain::{PendingRecord, Record};

/// Errors raised by the transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport unavailable: {context}: {source}")]
    Unavailable {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport unavailable: lock not acquired within {0:?}")]
    LockTimeout(Duration),

    #[error("failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt record at sequence {seq}: {reason}")]
    CorruptRecord { seq: u64, reason: String },
}

impl TransportError {
    fn unavailable(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Unavailable {
            context: context.into(),
            source,
        }
    }

    /// Whether this is a per-record error the stream can continue past
    pub fn is_corrupt_record(&self) -> bool {
        matches!(self, Self::CorruptRecord { .. })
    }
}

/// Tuning knobs for the transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    /// How long an appender waits for the log lock
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Fallback polling interval for tail-follow readers
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_lock_timeout_ms() -> u64 {
    5000
}
fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl TransportSettings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// How a reader behaves when it reaches the end of the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Stop at the head observed when the reader was opened
    Snapshot,

    /// Wait for new records indefinitely
    Follow,
}

/// Count of complete lines up to a byte position (always just past a newline)
#[derive(Debug, Default)]
struct LineIndex {
    scanned_bytes: u64,
    lines: u64,
}

struct LogInner {
    path: PathBuf,
    settings: TransportSettings,
    index: Mutex<LineIndex>,
    appended: Arc<Notify>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

/// File-based record log using JSONL format
#[derive(Clone)]
pub struct RecordLog {
    inner: Arc<LogInner>,
}

impl RecordLog {
    /// Create or open a record log at the given path
    pub async fn open(path: impl Into<PathBuf>, settings: TransportSettings) -> Result<Self, TransportError> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                TransportError::unavailable(format!("create {}", parent.display()), e)
            })?;
        }

        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| TransportError::unavailable(format!("open {}", path.display()), e))?;

        Ok(Self {
            inner: Arc::new(LogInner {
                path,
                settings,
                index: Mutex::new(LineIndex::default()),
                appended: Arc::new(Notify::new()),
                watcher: Mutex::new(None),
            }),
        })
    }

    /// Path to the records.jsonl file
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.inner.settings
    }

    /// Wake tail-follow readers when another process appends.
    ///
    /// Without this, readers in other processes still notice new records
    /// through the poll interval.
    pub fn watch_filesystem(&self) -> notify::Result<()> {
        let signal = Arc::clone(&self.inner.appended);
        let file_name = self.inner.path.file_name().map(|n| n.to_os_string());

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let touches_log = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if touches_log {
                    signal.notify_waiters();
                }
            }
        })?;

        let dir = self
            .inner
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        *self
            .inner
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(watcher);
        Ok(())
    }

    /// Append a record; returns its sequence number once durably written.
    ///
    /// On error the caller must not assume the record was recorded.
    pub async fn append(&self, record: PendingRecord) -> Result<u64, TransportError> {
        let inner = Arc::clone(&self.inner);
        let kind = record.body.kind();

        let seq = tokio::task::spawn_blocking(move || append_blocking(&inner, record))
            .await
            .map_err(|e| TransportError::unavailable("append task", std::io::Error::other(e)))??;

        self.inner.appended.notify_waiters();
        debug!(seq, kind = %kind, "Record appended");
        Ok(seq)
    }

    /// Sequence number of the last complete record (0 for an empty log)
    pub async fn head(&self) -> Result<u64, TransportError> {
        let inner = Arc::clone(&self.inner);

        tokio::task::spawn_blocking(move || -> Result<u64, TransportError> {
            let mut file = StdOpenOptions::new()
                .read(true)
                .open(&inner.path)
                .map_err(|e| TransportError::unavailable("open for head", e))?;
            let mut index = inner.index.lock().unwrap_or_else(PoisonError::into_inner);
            scan_lines(&mut file, &mut index)
                .map_err(|e| TransportError::unavailable("scan for head", e))?;
            Ok(index.lines)
        })
        .await
        .map_err(|e| TransportError::unavailable("head task", std::io::Error::other(e)))?
    }

    /// Open a lazy reader over records with `seq > after`, in sequence order
    pub async fn read_from(
        &self,
        consumer_id: &str,
        after: u64,
        mode: ReadMode,
    ) -> Result<RecordReader, TransportError> {
        let until = match mode {
            ReadMode::Snapshot => Some(self.head().await?),
            ReadMode::Follow => None,
        };

        let file = File::open(&self.inner.path)
            .await
            .map_err(|e| TransportError::unavailable(format!("open {}", self.inner.path.display()), e))?;

        Ok(RecordReader {
            consumer_id: consumer_id.to_string(),
            path: self.inner.path.clone(),
            reader: BufReader::new(file),
            buf: Vec::new(),
            line_start: 0,
            line_no: 0,
            after,
            until,
            eof_len: 0,
            signal: Arc::clone(&self.inner.appended),
            poll_interval: self.inner.settings.poll_interval(),
        })
    }

    /// Read every parseable record currently in the log.
    ///
    /// Corrupt records are logged and skipped.
    pub async fn snapshot(&self) -> Result<Vec<Record>, TransportError> {
        let mut reader = self.read_from("snapshot", 0, ReadMode::Snapshot).await?;
        let mut records = Vec::new();

        loop {
            match reader.try_next().await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => break,
                Err(e) if e.is_corrupt_record() => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(records)
    }

    /// Find a record by sequence number
    pub async fn get(&self, seq: u64) -> Result<Option<Record>, TransportError> {
        if seq == 0 {
            return Ok(None);
        }
        let mut reader = self
            .read_from("lookup", seq - 1, ReadMode::Snapshot)
            .await?;
        match reader.try_next().await? {
            Some(record) if record.seq == seq => Ok(Some(record)),
            _ => Ok(None),
        }
    }
}

/// Append under the exclusive file lock (blocking; run on the blocking pool)
fn append_blocking(inner: &LogInner, record: PendingRecord) -> Result<u64, TransportError> {
    let mut file = StdOpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(&inner.path)
        .map_err(|e| TransportError::unavailable(format!("open {}", inner.path.display()), e))?;

    lock_with_timeout(&file, inner.settings.lock_timeout())?;

    let mut index = inner.index.lock().unwrap_or_else(PoisonError::into_inner);
    let torn = scan_lines(&mut file, &mut index)
        .map_err(|e| TransportError::unavailable("scan before append", e))?;

    // A newline-less tail can only be left by a writer that died mid-write,
    // since live writers hold the lock we now own.
    if torn > 0 {
        warn!(
            bytes = torn,
            offset = index.scanned_bytes,
            "Truncating torn record left by a crashed writer"
        );
        file.set_len(index.scanned_bytes)
            .map_err(|e| TransportError::unavailable("truncate torn tail", e))?;
    }

    let seq = index.lines + 1;
    let sealed = record.seal(seq);
    let mut line = serde_json::to_vec(&sealed)?;
    line.push(b'\n');

    write_durably(&mut file, &line, index.scanned_bytes)
        .map_err(|e| TransportError::unavailable("write record", e))?;

    index.lines = seq;
    index.scanned_bytes += line.len() as u64;

    // Dropping the file releases the lock
    Ok(seq)
}

/// The file operations an append needs while holding the lock
trait LogFile: Write {
    fn sync(&mut self) -> std::io::Result<()>;
    fn truncate(&mut self, len: u64) -> std::io::Result<()>;
}

impl LogFile for std::fs::File {
    fn sync(&mut self) -> std::io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }
}

/// Write and sync one line. On failure the log is cut back to `committed_len`
/// so a caller told "not recorded" never finds the line there later.
fn write_durably<F: LogFile>(file: &mut F, line: &[u8], committed_len: u64) -> std::io::Result<()> {
    let outcome = file.write_all(line).and_then(|()| file.sync());
    if let Err(e) = outcome {
        if let Err(rollback) = file.truncate(committed_len).and_then(|()| file.sync()) {
            warn!(error = %rollback, offset = committed_len, "Failed to roll back unsynced record");
        }
        return Err(e);
    }
    Ok(())
}

fn lock_with_timeout(file: &std::fs::File, timeout: Duration) -> Result<(), TransportError> {
    let deadline = Instant::now() + timeout;
    let contended = fs2::lock_contended_error();

    loop {
        match FileExt::try_lock_exclusive(file) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.raw_os_error() == contended.raw_os_error() => {
                if Instant::now() >= deadline {
                    return Err(TransportError::LockTimeout(timeout));
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => return Err(TransportError::unavailable("lock log", e)),
        }
    }
}

/// Advance the index over complete lines; returns the length of any
/// trailing partial line.
fn scan_lines(file: &mut std::fs::File, index: &mut LineIndex) -> std::io::Result<u64> {
    let len = file.metadata()?.len();
    if len < index.scanned_bytes {
        // Log shrank underneath us (replaced out-of-band); rescan
        *index = LineIndex::default();
    }

    file.seek(SeekFrom::Start(index.scanned_bytes))?;
    let mut pos = index.scanned_bytes;
    let mut chunk = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        for (i, byte) in chunk[..n].iter().enumerate() {
            if *byte == b'\n' {
                index.lines += 1;
                index.scanned_bytes = pos + i as u64 + 1;
            }
        }
        pos += n as u64;
    }

    Ok(pos - index.scanned_bytes)
}

/// Lazy, ordered reader over the record log
pub struct RecordReader {
    consumer_id: String,
    path: PathBuf,
    reader: BufReader<File>,
    buf: Vec<u8>,
    /// Byte offset of the next unread line
    line_start: u64,
    /// Lines consumed so far (= seq of the last line consumed)
    line_no: u64,
    after: u64,
    until: Option<u64>,
    /// File length observed at the last end-of-log
    eof_len: u64,
    signal: Arc<Notify>,
    poll_interval: Duration,
}

impl RecordReader {
    /// Sequence number of the last line this reader moved past
    pub fn position(&self) -> u64 {
        self.line_no
    }

    /// Next record available right now, without waiting.
    ///
    /// `Ok(None)` means the reader is at the current end of the log (or the
    /// snapshot bound). A `CorruptRecord` error is per-record: the reader has
    /// already moved past it and the next call continues with the following
    /// line.
    pub async fn try_next(&mut self) -> Result<Option<Record>, TransportError> {
        loop {
            if let Some(limit) = self.until {
                if self.line_no >= limit {
                    return Ok(None);
                }
            }

            self.buf.clear();
            let n = self
                .reader
                .read_until(b'\n', &mut self.buf)
                .await
                .map_err(|e| TransportError::unavailable("read record", e))?;

            if self.buf.last() != Some(&b'\n') {
                // End of log, possibly with a line still being written.
                // Rewind so the partial line is re-read whole next time.
                self.eof_len = self.line_start + n as u64;
                if n > 0 {
                    self.reader
                        .seek(SeekFrom::Start(self.line_start))
                        .await
                        .map_err(|e| TransportError::unavailable("rewind partial record", e))?;
                }
                return Ok(None);
            }

            self.line_start += n as u64;
            self.line_no += 1;
            let seq = self.line_no;

            if seq <= self.after {
                continue;
            }

            return match parse_line(seq, &self.buf) {
                Ok(record) => Ok(Some(record)),
                Err(e) => {
                    warn!(consumer = %self.consumer_id, seq, error = %e, "Skipping corrupt record");
                    Err(e)
                }
            };
        }
    }

    /// Wait until the log may have grown (append signal, file change, or
    /// poll interval). Cancel-safe.
    pub async fn wait(&mut self) {
        let notified = self.signal.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Ok(meta) = fs::metadata(&self.path).await {
            if meta.len() != self.eof_len {
                return;
            }
        }

        tokio::select! {
            _ = &mut notified => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
    }

    /// Next record, waiting for one in follow mode.
    ///
    /// Returns `Ok(None)` only at the end of a snapshot.
    pub async fn next(&mut self) -> Result<Option<Record>, TransportError> {
        loop {
            if let Some(record) = self.try_next().await? {
                return Ok(Some(record));
            }
            if self.until.is_some() {
                return Ok(None);
            }
            self.wait().await;
        }
    }
}

fn parse_line(seq: u64, line: &[u8]) -> Result<Record, TransportError> {
    let record: Record = serde_json::from_slice(line).map_err(|e| TransportError::CorruptRecord {
        seq,
        reason: e.to_string(),
    })?;

    if record.seq != seq {
        return Err(TransportError::CorruptRecord {
            seq,
            reason: format!("line carries sequence {}", record.seq),
        });
    }

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RecordBody, RecordKind, Utterance};
    use tempfile::TempDir;

    async fn create_test_log() -> (RecordLog, TempDir) {
        let temp = TempDir::new().unwrap();
        let log = RecordLog::open(temp.path().join("records.jsonl"), TransportSettings::default())
            .await
            .unwrap();
        (log, temp)
    }

    fn utterance(text: &str) -> PendingRecord {
        PendingRecord::new(RecordBody::Utterance(Utterance::new(text, 0.9)))
    }

    #[tokio::test]
    async fn test_append_assigns_gapless_sequence() {
        let (log, _temp) = create_test_log().await;

        for expected in 1..=5u64 {
            let seq = log.append(utterance("note hello")).await.unwrap();
            assert_eq!(seq, expected);
        }

        assert_eq!(log.head().await.unwrap(), 5);
        let records = log.snapshot().await.unwrap();
        let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_read_from_offset() {
        let (log, _temp) = create_test_log().await;
        for i in 0..4 {
            log.append(utterance(&format!("note {}", i))).await.unwrap();
        }

        let mut reader = log.read_from("test", 2, ReadMode::Snapshot).await.unwrap();
        let third = reader.next().await.unwrap().unwrap();
        let fourth = reader.next().await.unwrap().unwrap();

        assert_eq!(third.seq, 3);
        assert_eq!(fourth.seq, 4);
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_stops_at_opening_head() {
        let (log, _temp) = create_test_log().await;
        log.append(utterance("note one")).await.unwrap();

        let mut reader = log.read_from("test", 0, ReadMode::Snapshot).await.unwrap();
        log.append(utterance("note two")).await.unwrap();

        assert_eq!(reader.next().await.unwrap().unwrap().seq, 1);
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_torn_tail_is_truncated_by_next_append() {
        let (log, _temp) = create_test_log().await;
        log.append(utterance("note one")).await.unwrap();

        // Simulate a writer that died mid-record
        {
            let mut file = StdOpenOptions::new().append(true).open(log.path()).unwrap();
            file.write_all(br#"{"seq":2,"id":"#).unwrap();
        }

        // The partial line is invisible to readers and to head()
        assert_eq!(log.head().await.unwrap(), 1);

        let seq = log.append(utterance("note two")).await.unwrap();
        assert_eq!(seq, 2);

        let records = log.snapshot().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].seq, 2);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_skipped() {
        let (log, _temp) = create_test_log().await;
        log.append(utterance("note one")).await.unwrap();
        {
            let mut file = StdOpenOptions::new().append(true).open(log.path()).unwrap();
            file.write_all(b"not json at all\n").unwrap();
        }
        log.append(utterance("note three")).await.unwrap();

        let mut reader = log.read_from("test", 0, ReadMode::Snapshot).await.unwrap();
        assert_eq!(reader.try_next().await.unwrap().unwrap().seq, 1);

        let err = reader.try_next().await.unwrap_err();
        assert!(matches!(err, TransportError::CorruptRecord { seq: 2, .. }));

        let third = reader.try_next().await.unwrap().unwrap();
        assert_eq!(third.seq, 3);
        assert_eq!(third.kind(), RecordKind::Utterance);
    }

    #[tokio::test]
    async fn test_sequence_mismatch_is_corrupt() {
        let (log, _temp) = create_test_log().await;
        let forged = PendingRecord::new(RecordBody::Utterance(Utterance::new("x", 1.0))).seal(9);
        {
            let mut file = StdOpenOptions::new().append(true).open(log.path()).unwrap();
            let line = serde_json::to_string(&forged).unwrap();
            writeln!(file, "{}", line).unwrap();
        }

        let mut reader = log.read_from("test", 0, ReadMode::Snapshot).await.unwrap();
        let err = reader.try_next().await.unwrap_err();
        assert!(matches!(err, TransportError::CorruptRecord { seq: 1, .. }));
    }

    #[tokio::test]
    async fn test_follow_reader_wakes_on_append() {
        let (log, _temp) = create_test_log().await;
        let mut reader = log.read_from("test", 0, ReadMode::Follow).await.unwrap();

        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.append(utterance("note later")).await.unwrap();
        });

        let record = tokio::time::timeout(Duration::from_secs(5), reader.next())
            .await
            .expect("follow reader should wake")
            .unwrap()
            .unwrap();
        assert_eq!(record.seq, 1);
    }

    #[tokio::test]
    async fn test_get_by_sequence() {
        let (log, _temp) = create_test_log().await;
        log.append(utterance("note a")).await.unwrap();
        log.append(utterance("note b")).await.unwrap();

        assert_eq!(log.get(2).await.unwrap().unwrap().seq, 2);
        assert!(log.get(3).await.unwrap().is_none());
        assert!(log.get(0).await.unwrap().is_none());
    }

    /// In-memory log whose sync can be made to fail
    struct FlakyFile {
        bytes: Vec<u8>,
        fail_sync: bool,
    }

    impl Write for FlakyFile {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.bytes.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogFile for FlakyFile {
        fn sync(&mut self) -> std::io::Result<()> {
            if self.fail_sync {
                self.fail_sync = false;
                return Err(std::io::Error::other("disk went away"));
            }
            Ok(())
        }

        fn truncate(&mut self, len: u64) -> std::io::Result<()> {
            self.bytes.truncate(len as usize);
            Ok(())
        }
    }

    #[test]
    fn test_failed_sync_rolls_back_written_line() {
        let mut file = FlakyFile {
            bytes: b"{\"seq\":1}\n".to_vec(),
            fail_sync: true,
        };
        let committed = file.bytes.len() as u64;

        assert!(write_durably(&mut file, b"{\"seq\":2}\n", committed).is_err());
        assert_eq!(file.bytes, b"{\"seq\":1}\n");

        write_durably(&mut file, b"{\"seq\":2}\n", committed).unwrap();
        assert_eq!(file.bytes, b"{\"seq\":1}\n{\"seq\":2}\n");
    }
}
