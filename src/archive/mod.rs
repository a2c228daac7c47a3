//! Durable sink for payloads that leave the live delivery path, and the
//! consumer thread that drains the ingestion work queue into it.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::logging::Logger;
use crate::queue::WorkQueue;

const ARCHIVE_FILE_NAME: &str = "pulsefab_archive.dat";
const EMPTY_QUEUE_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub enum ArchiveError {
    Io {
        path: String,
        source: std::io::Error,
    },
    Serialize(serde_json::Error),
}

impl fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "archive write to '{path}' failed: {source}")
            }
            Self::Serialize(source) => write!(f, "failed to serialize archive record: {source}"),
        }
    }
}

impl std::error::Error for ArchiveError {}

/// Append-only JSON-lines archive. Each record carries its own id and
/// timestamp so the file can be replayed or audited offline.
pub struct ArchiveWriter {
    path: PathBuf,
    file: Mutex<File>,
}

impl ArchiveWriter {
    pub fn open(directory: &Path) -> Result<Self, ArchiveError> {
        let path = directory.join(ARCHIVE_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| ArchiveError::Io {
                path: path.to_string_lossy().to_string(),
                source,
            })?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn append(&self, payload: &str, reason: &str) -> Result<Uuid, ArchiveError> {
        let id = Uuid::new_v4();
        let record = json!({
            "id": id.to_string(),
            "archived_at": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "reason": reason,
            "payload": payload,
        });
        let mut line = serde_json::to_string(&record).map_err(ArchiveError::Serialize)?;
        line.push('\n');

        let mut file = self.file.lock().expect("archive file mutex poisoned");
        file.write_all(line.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|source| ArchiveError::Io {
                path: self.path.to_string_lossy().to_string(),
                source,
            })?;
        Ok(id)
    }
}

/// Drains the work queue until the stop flag trips and the queue is empty.
/// Each payload is archived as processed output when an archive is
/// configured; without one the payloads are consumed and only logged.
pub fn spawn_consumer(
    queue: WorkQueue,
    archive: Option<Arc<ArchiveWriter>>,
    logger: Arc<Logger>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        loop {
            match queue.try_pop() {
                Some(payload) => consume_payload(&payload, archive.as_deref(), &logger),
                None => {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    thread::sleep(EMPTY_QUEUE_BACKOFF);
                }
            }
        }
        logger.info(Some("archive"), "consumer drained, exiting");
    })
}

fn consume_payload(payload: &str, archive: Option<&ArchiveWriter>, logger: &Logger) {
    let event = serde_json::from_str::<serde_json::Value>(payload)
        .ok()
        .and_then(|value| {
            value
                .get("event")
                .and_then(|event| event.as_str())
                .map(str::to_owned)
        });
    match event {
        Some(event) => logger.debug(Some("archive"), &format!("consuming event '{event}'")),
        None => logger.debug(Some("archive"), "consuming payload without event field"),
    }

    if let Some(archive) = archive {
        if let Err(error) = archive.append(payload, "processed") {
            logger.error(Some("archive"), &format!("{error}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::{spawn_consumer, ArchiveWriter, ARCHIVE_FILE_NAME};
    use crate::logging::test_support::MemorySink;
    use crate::logging::{Logger, LoggerConfig};
    use crate::queue::WorkQueue;

    fn temp_archive_dir(suffix: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "pulsefab-archive-test-{suffix}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&path);
        fs::create_dir_all(&path).expect("archive dir should create");
        path
    }

    #[test]
    fn append_writes_one_json_line_per_record() {
        let dir = temp_archive_dir("append");
        let writer = ArchiveWriter::open(&dir).expect("archive should open");

        let first = writer
            .append("{\"event\":\"build\"}", "processed")
            .expect("first append should succeed");
        let second = writer
            .append("{\"event\":\"test\"}", "retries-exhausted")
            .expect("second append should succeed");
        assert_ne!(first, second);

        let contents =
            fs::read_to_string(dir.join(ARCHIVE_FILE_NAME)).expect("archive should read back");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let record: serde_json::Value =
            serde_json::from_str(lines[1]).expect("archive line should be JSON");
        assert_eq!(record["reason"], "retries-exhausted");
        assert_eq!(record["payload"], "{\"event\":\"test\"}");
        assert_eq!(record["id"], second.to_string());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn consumer_archives_queued_payloads_then_stops() {
        let dir = temp_archive_dir("consumer");
        let writer = Arc::new(ArchiveWriter::open(&dir).expect("archive should open"));
        let queue = WorkQueue::with_capacity(8);
        let sink = Arc::new(MemorySink::default());
        let logger = Arc::new(Logger::with_sink(LoggerConfig::default(), sink));
        let stop = Arc::new(AtomicBool::new(false));

        queue
            .try_push("{\"event\":\"build-started\"}".to_owned())
            .expect("push should succeed");
        queue
            .try_push("{\"event\":\"build-finished\"}".to_owned())
            .expect("push should succeed");

        let handle = spawn_consumer(
            queue.clone(),
            Some(writer),
            logger,
            Arc::clone(&stop),
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        while !queue.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        stop.store(true, Ordering::SeqCst);
        handle.join().expect("consumer thread should join");

        let contents =
            fs::read_to_string(dir.join(ARCHIVE_FILE_NAME)).expect("archive should read back");
        assert_eq!(contents.lines().count(), 2);

        let _ = fs::remove_dir_all(dir);
    }
}
