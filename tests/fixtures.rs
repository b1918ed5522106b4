#![allow(dead_code)]
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::Duration;

use jiff::SignedDuration;
use wineventlog::{
    CheckpointStore, EventDefinition, EventLogConfig, EventLogReader, LogRecord, MemoryEventLog,
    MetadataEntry, NoMoreEvents, ProviderMetadata, PublisherMetadataCache, Record, Session,
    Shutdown, TypedValue,
};

static LOGGER_INIT: Once = Once::new();

// Rust runs the tests concurrently, so unless we synchronize logging access
// it will crash when attempting to run `cargo test` with some logging facilities.
pub fn ensure_env_logger_initialized() {
    use std::io::Write;

    LOGGER_INIT.call_once(|| {
        let mut builder = env_logger::Builder::from_default_env();
        builder
            .format(|buf, record| writeln!(buf, "[{}] - {}", record.level(), record.args()))
            .init();
    });
}

pub fn samples_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests").join("samples")
}

pub fn exported_application_log() -> PathBuf {
    samples_dir().join("application_export.xml")
}

pub const SERVICE_PROVIDER: &str = "Service Control Manager";

/// A provider declaring event 7036 ("The %1 service entered the %2 state.").
pub fn service_provider() -> ProviderMetadata {
    let mut provider = ProviderMetadata::new(SERVICE_PROVIDER);
    provider
        .keywords
        .push(MetadataEntry::new("Classic", 0x80_0000_0000_0000, ""));
    provider.events.push(EventDefinition {
        id: 7036,
        message: "The %1 service entered the %2 state.".to_owned(),
        template: r#"<template xmlns="http://schemas.microsoft.com/win/2004/08/events">
  <data name="param1" inType="win:UnicodeString"/>
  <data name="param2" inType="win:UnicodeString"/>
</template>"#
            .to_owned(),
        ..Default::default()
    });
    provider
}

pub fn service_record(service: &str, state: &str) -> LogRecord {
    LogRecord::new(SERVICE_PROVIDER, 7036)
        .keywords(0x8080_0000_0000_0000)
        .value("param1", TypedValue::String(service.to_owned()))
        .value("param2", TypedValue::String(state.to_owned()))
}

pub fn append_service_records(log: &MemoryEventLog, channel: &str, n: usize) {
    for i in 0..n {
        log.append(channel, service_record(&format!("svc{i}"), "running"));
    }
}

/// One temporary checkpoint file plus the shared pieces readers need.
pub struct Harness {
    pub log: MemoryEventLog,
    pub session: Arc<dyn Session>,
    pub cache: Arc<PublisherMetadataCache>,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let log = MemoryEventLog::new();
        let session: Arc<dyn Session> = Arc::new(log.clone());
        let cache = Arc::new(PublisherMetadataCache::new(Arc::clone(&session), 0));
        Harness {
            log,
            session,
            cache,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.dir.path().join("data").join("registry.yml")
    }

    pub fn open_checkpoints(&self) -> Arc<CheckpointStore> {
        Arc::new(CheckpointStore::open(self.checkpoint_path(), Duration::from_millis(200)).unwrap())
    }

    pub fn reader(
        &self,
        config: EventLogConfig,
        checkpoints: &Arc<CheckpointStore>,
        shutdown: &Shutdown,
    ) -> EventLogReader {
        EventLogReader::new(
            config,
            Arc::clone(&self.session),
            Arc::clone(&self.cache),
            Arc::clone(checkpoints),
            shutdown.clone(),
        )
        .unwrap()
    }
}

/// Reads to the end of the channel, then stops.
pub fn stop_config(name: &str, batch: usize) -> EventLogConfig {
    EventLogConfig::new(name)
        .batch_read_size(batch)
        .no_more_events(NoMoreEvents::Stop)
        .poll_interval(SignedDuration::from_millis(10))
        .max_backoff(SignedDuration::from_millis(50))
}

/// Run a reader to completion, returning everything it delivered.
pub fn read_all(reader: &EventLogReader) -> Vec<Record> {
    let mut out = Vec::new();
    let mut sink = |records: Vec<Record>| out.extend(records);
    reader.run(&mut sink).unwrap();
    out
}

pub fn record_ids(records: &[Record]) -> Vec<u64> {
    records.iter().map(|r| r.event.record_id).collect()
}

pub fn file_contains(path: &Path, needle: &str) -> bool {
    std::fs::read_to_string(path).is_ok_and(|text| text.contains(needle))
}
