//! Durable last-read positions, one per event log.
//!
//! All updates go through [`CheckpointStore::persist`], which only touches memory. A background
//! writer owns the file and flushes on a timer, and once more on shutdown. A flush writes
//! `<file>.new` and renames it over `<file>`, so the file on disk is always a complete document.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use jiff::Timestamp;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::config::CheckpointConfig;
use crate::err::CheckpointError;

pub type CheckpointResult<T> = std::result::Result<T, CheckpointError>;

/// The last position read from one event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub name: String,
    pub record_number: u64,
    pub timestamp: Timestamp,
    /// Serialized bookmark. Empty if only the record number is known.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bookmark: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    update_time: Timestamp,
    #[serde(default)]
    event_logs: Vec<CheckpointState>,
}

#[derive(Debug, Default)]
struct Inner {
    states: BTreeMap<String, CheckpointState>,
    dirty: bool,
    shutdown: bool,
}

#[derive(Debug)]
struct Shared {
    path: PathBuf,
    flush_interval: Duration,
    inner: Mutex<Inner>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write the current states if anything changed since the last flush.
    fn flush<'a>(&'a self, mut inner: MutexGuard<'a, Inner>) -> MutexGuard<'a, Inner> {
        if !inner.dirty {
            return inner;
        }
        let doc = PersistedState {
            update_time: Timestamp::now(),
            event_logs: inner.states.values().cloned().collect(),
        };
        inner.dirty = false;
        drop(inner);

        let result = write_atomically(&self.path, &doc);

        let mut inner = self.lock();
        match result {
            Ok(()) => trace!(
                "Flushed {} checkpoint(s) to {}",
                doc.event_logs.len(),
                self.path.display()
            ),
            Err(e) => {
                warn!("{e}; retrying on the next flush");
                inner.dirty = true;
            }
        }
        inner
    }
}

/// Owns the checkpoint file.
///
/// Share it between readers with an `Arc`; every method takes `&self`.
#[derive(Debug)]
pub struct CheckpointStore {
    shared: Arc<Shared>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl CheckpointStore {
    /// Load the checkpoint file at `path` (if any) and start the writer.
    ///
    /// Fails if the file exists but cannot be parsed, or if its directory is not writable.
    pub fn open(path: impl Into<PathBuf>, flush_interval: Duration) -> CheckpointResult<Self> {
        let path = path.into();
        let states = read_states(&path)?;
        check_writable(&path)?;
        debug!(
            "Loaded {} checkpoint(s) from {}",
            states.len(),
            path.display()
        );

        let shared = Arc::new(Shared {
            path,
            flush_interval,
            inner: Mutex::new(Inner {
                states,
                ..Default::default()
            }),
            wake: Condvar::new(),
        });

        let writer = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("checkpoint-writer".to_owned())
                .spawn(move || run_writer(&shared))
                .map_err(CheckpointError::Spawn)?
        };

        Ok(CheckpointStore {
            shared,
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn from_config(config: &CheckpointConfig) -> CheckpointResult<Self> {
        Self::open(&config.path, config.flush_interval())
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Record a new position. Does not block on disk I/O.
    pub fn persist(&self, state: CheckpointState) {
        let mut inner = self.shared.lock();
        if inner.shutdown {
            warn!(
                "Checkpoint store is shut down, dropping update for {}",
                state.name
            );
            return;
        }
        inner.states.insert(state.name.clone(), state);
        inner.dirty = true;
    }

    /// A copy of every known position, keyed by name.
    pub fn snapshot(&self) -> BTreeMap<String, CheckpointState> {
        self.shared.lock().states.clone()
    }

    pub fn get(&self, name: &str) -> Option<CheckpointState> {
        self.shared.lock().states.get(name).cloned()
    }

    /// Stop the writer after a final flush. Safe to call more than once.
    pub fn shutdown(&self) {
        self.shared.lock().shutdown = true;
        self.shared.wake.notify_all();

        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer) = writer {
            if writer.join().is_err() {
                warn!("Checkpoint writer panicked");
            }
        }
    }
}

impl Drop for CheckpointStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_writer(shared: &Shared) {
    let mut inner = shared.lock();
    while !inner.shutdown {
        let (guard, timeout) = shared
            .wake
            .wait_timeout(inner, shared.flush_interval)
            .unwrap_or_else(PoisonError::into_inner);
        inner = guard;
        if timeout.timed_out() {
            inner = shared.flush(inner);
        }
    }
    drop(shared.flush(inner));
    debug!("Checkpoint writer for {} stopped", shared.path.display());
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".new");
    PathBuf::from(name)
}

fn read_states(path: &Path) -> CheckpointResult<BTreeMap<String, CheckpointState>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(source) => {
            return Err(CheckpointError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if text.trim().is_empty() {
        return Ok(BTreeMap::new());
    }

    let doc: PersistedState =
        serde_yaml::from_str(&text).map_err(|source| CheckpointError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(doc
        .event_logs
        .into_iter()
        .map(|state| (state.name.clone(), state))
        .collect())
}

fn check_writable(path: &Path) -> CheckpointResult<()> {
    let not_writable = |source| CheckpointError::NotWritable {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(not_writable)?;
    }
    let probe = temp_path(path);
    File::create(&probe).map_err(not_writable)?;
    fs::remove_file(&probe).map_err(not_writable)
}

fn write_atomically(path: &Path, doc: &PersistedState) -> CheckpointResult<()> {
    let text = serde_yaml::to_string(doc).map_err(CheckpointError::Serialize)?;
    let temp = temp_path(path);
    let write_err = |source| CheckpointError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::create(&temp).map_err(write_err)?;
    file.write_all(text.as_bytes()).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    drop(file);
    fs::rename(&temp, path).map_err(write_err)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = sync_dir(parent) {
            debug!(
                "Could not sync checkpoint directory `{}`, the rename may not survive a crash: {e}",
                parent.display()
            );
        }
    }
    Ok(())
}

/// Persist directory entries (the rename). Not every platform can open a directory.
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Instant;

    fn state(name: &str, record_number: u64) -> CheckpointState {
        CheckpointState {
            name: name.to_owned(),
            record_number,
            timestamp: Timestamp::from_second(1_600_000_000 + record_number as i64).unwrap(),
            bookmark: String::new(),
        }
    }

    fn wait_for(path: &Path, needle: &str, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            if fs::read_to_string(path).is_ok_and(|text| text.contains(needle)) {
                return true;
            }
            thread::sleep(Duration::from_millis(50));
        }
        false
    }

    #[test]
    fn test_flushes_on_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.yml");
        let store = CheckpointStore::open(&path, Duration::from_secs(2)).unwrap();

        store.persist(state("App", 1));
        assert!(!path.exists());

        store.persist(state("App", 2));
        assert!(wait_for(&path, "record_number: 2", Duration::from_secs(4)));
        assert!(!temp_path(&path).exists());
        store.shutdown();
    }

    #[test]
    fn test_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("registry.yml");

        let store = CheckpointStore::open(&path, Duration::from_secs(60)).unwrap();
        store.persist(state("System", 5));
        let mut app = state("Application", 9);
        app.bookmark = "<BookmarkList/>".to_owned();
        store.persist(app);
        store.persist(state("System", 7));
        let before = store.snapshot();
        store.shutdown();
        store.shutdown();

        let text = fs::read_to_string(&path).unwrap();
        let app_at = text.find("name: Application").unwrap();
        let system_at = text.find("name: System").unwrap();
        assert!(app_at < system_at);

        let store = CheckpointStore::open(&path, Duration::from_secs(60)).unwrap();
        assert_eq!(store.snapshot(), before);
        assert_eq!(store.get("System").unwrap().record_number, 7);
    }

    #[test]
    fn test_interrupted_flush_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.yml");

        let store = CheckpointStore::open(&path, Duration::from_secs(60)).unwrap();
        store.persist(state("App", 3));
        drop(store);

        // A crash after writing the temp file but before the rename.
        fs::write(temp_path(&path), "update_time: [truncated").unwrap();

        let store = CheckpointStore::open(&path, Duration::from_secs(60)).unwrap();
        assert_eq!(store.get("App"), Some(state("App", 3)));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.yml");
        fs::write(&path, "event_logs: [ {name: App").unwrap();

        let err = CheckpointStore::open(&path, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, CheckpointError::Malformed { .. }));
    }

    #[test]
    fn test_missing_and_empty_files_are_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.yml");
        let store = CheckpointStore::open(&path, Duration::from_secs(1)).unwrap();
        assert!(store.snapshot().is_empty());
        drop(store);
        // Nothing was persisted, so nothing was written.
        assert!(!path.exists());

        fs::write(&path, "\n").unwrap();
        let store = CheckpointStore::open(&path, Duration::from_secs(1)).unwrap();
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_open_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = CheckpointConfig::new(dir.path().join("data").join("registry.yml"))
            .with_flush_interval(jiff::SignedDuration::from_millis(100));
        let store = CheckpointStore::from_config(&config).unwrap();
        assert_eq!(store.path(), config.path.as_path());

        store.persist(state("Setup", 4));
        assert!(wait_for(store.path(), "name: Setup", Duration::from_secs(4)));
    }

    #[test]
    fn test_directory_sync_reports_failures() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sync_dir(dir.path()).is_ok());

        let err = sync_dir(&dir.path().join("missing")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        let path = dir.path().join("registry.yml");
        let doc = PersistedState {
            update_time: Timestamp::from_second(1_600_000_000).unwrap(),
            event_logs: vec![state("App", 1)],
        };
        write_atomically(&path, &doc).unwrap();
        assert!(fs::read_to_string(&path).unwrap().contains("record_number: 1"));
    }

    #[test]
    fn test_unwritable_directory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "").unwrap();

        let err = CheckpointStore::open(blocker.join("registry.yml"), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, CheckpointError::NotWritable { .. }));
    }
}
