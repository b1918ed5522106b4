//! The per-log reading loop.
//!
//! An [`EventLogReader`] resumes from its checkpoint, reads and renders batches, hands them to an
//! [`EventSink`] and then records the position of the last record. Each reader can run on its own
//! thread ([`EventLogReader::spawn`]); a failing log only ends its own reader.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use jiff::Timestamp;
use log::{debug, info, trace, warn};

use crate::api::{Position, RecordHandle, Session, SubscribeRequest};
use crate::bookmark::Bookmark;
use crate::checkpoint::{CheckpointState, CheckpointStore};
use crate::config::{EventLogConfig, RendererKind};
use crate::err::{ErrorClass, EventLogError, Result};
use crate::event::Event;
use crate::iterator::{EventIterator, SubscriptionFactory};
use crate::publisher::PublisherMetadataCache;
use crate::renderer::{EventRenderer, Renderer, XmlRenderer};

/// A stop signal shared between readers and their owner.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for up to `timeout`. Returns `true` if shutdown was triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |triggered| !*triggered)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// One delivered record.
#[derive(Debug)]
pub struct Record {
    pub event: Event,
    pub xml: Option<String>,
    pub bookmark: Bookmark,
    /// Problems that did not stop the record from being delivered.
    pub errors: Vec<EventLogError>,
}

/// Receives rendered batches, in record order.
///
/// The batch's position is checkpointed once `deliver` returns.
pub trait EventSink: Send {
    fn deliver(&mut self, records: Vec<Record>);
}

impl<F> EventSink for F
where
    F: FnMut(Vec<Record>) + Send,
{
    fn deliver(&mut self, records: Vec<Record>) {
        self(records)
    }
}

/// Exponential backoff for a channel that is missing or unreachable.
///
/// Only the first failure of a streak is logged at warn level.
#[derive(Debug)]
struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    failing: bool,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Backoff {
            base,
            max: max.max(base),
            current: base,
            failing: false,
        }
    }

    fn fail(&mut self, name: &str, err: &EventLogError) -> Duration {
        let delay = self.current;
        if self.failing {
            debug!("{name}: {err}, retrying in {delay:?}");
        } else {
            warn!("{name}: {err}, retrying in {delay:?}");
            self.failing = true;
        }
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        if self.failing {
            info!("Recovered after {:?} of backoff", self.current);
        }
        self.current = self.base;
        self.failing = false;
    }
}

fn is_retryable(err: &EventLogError) -> bool {
    matches!(
        err.win_error().map(|e| e.class()),
        Some(ErrorClass::RecoverableSession | ErrorClass::NotFound)
    )
}

/// Reads one event log.
pub struct EventLogReader {
    config: EventLogConfig,
    session: Arc<dyn Session>,
    cache: Arc<PublisherMetadataCache>,
    checkpoints: Arc<CheckpointStore>,
    shutdown: Shutdown,
}

impl EventLogReader {
    pub fn new(
        config: EventLogConfig,
        session: Arc<dyn Session>,
        cache: Arc<PublisherMetadataCache>,
        checkpoints: Arc<CheckpointStore>,
        shutdown: Shutdown,
    ) -> Result<Self> {
        config.validate()?;
        Ok(EventLogReader {
            config,
            session,
            cache,
            checkpoints,
            shutdown,
        })
    }

    pub fn config(&self) -> &EventLogConfig {
        &self.config
    }

    /// Where reading resumes: the saved bookmark, else the saved record number, else the start.
    pub fn initial_position(&self) -> Position {
        let Some(state) = self.checkpoints.get(self.config.checkpoint_key()) else {
            return Position::Fresh;
        };

        if !state.bookmark.is_empty() {
            match Bookmark::from_serialized(&state.bookmark) {
                Ok(bookmark) => return Position::Bookmark(bookmark),
                Err(e) => warn!(
                    "{}: ignoring unreadable checkpoint bookmark: {e}",
                    self.config.name
                ),
            }
        }
        if state.record_number > 0 {
            return Position::Bookmark(Bookmark::new(&self.config.name, state.record_number));
        }
        Position::Fresh
    }

    fn subscription_factory(&self) -> SubscriptionFactory {
        let session = Arc::clone(&self.session);
        let channel = self.config.name.clone();
        let query = self.config.query.clone();
        Box::new(move |position: &Position| {
            let request =
                SubscribeRequest::new(channel.clone(), position.clone()).with_query(query.clone());
            session.subscribe(&request)
        })
    }

    fn renderer(&self) -> Box<dyn EventRenderer> {
        let session = Arc::clone(&self.session);
        let cache = Arc::clone(&self.cache);
        let conf = self.config.render_config();
        match self.config.renderer {
            RendererKind::Binary => Box::new(Renderer::new(session, cache, conf)),
            RendererKind::Xml => Box::new(XmlRenderer::new(session, cache, conf)),
        }
    }

    /// Read until shutdown, until the log ends (with `no_more_events: stop`), or until a
    /// non-retryable error.
    pub fn run(&self, sink: &mut dyn EventSink) -> Result<()> {
        let name = self.config.name.as_str();
        let mut iterator = EventIterator::from_factory(
            self.subscription_factory(),
            self.config.batch_read_size,
            self.config.no_more_events,
        );
        let mut renderer = self.renderer();
        let mut backoff = Backoff::new(
            self.config.poll_interval_std(),
            self.config.max_backoff_std(),
        );

        let mut pending_open = Some(self.initial_position());
        debug!("{name}: starting at {pending_open:?}");

        let result = loop {
            if self.shutdown.is_triggered() {
                break Ok(());
            }

            if let Some(position) = pending_open.take() {
                match iterator.open(position.clone()) {
                    Ok(()) => debug!("{name}: subscription opened"),
                    Err(e) if is_retryable(&e) => {
                        pending_open = Some(position);
                        if self.shutdown.wait_timeout(backoff.fail(name, &e)) {
                            break Ok(());
                        }
                        continue;
                    }
                    Err(e) => break Err(e),
                }
            }

            match iterator.next_batch() {
                Ok(None) => {
                    debug!("{name}: no more events");
                    break Ok(());
                }
                Ok(Some(handles)) if handles.is_empty() => {
                    backoff.reset();
                    if self.shutdown.wait_timeout(self.config.poll_interval_std()) {
                        break Ok(());
                    }
                }
                Ok(Some(handles)) => {
                    backoff.reset();
                    self.process_batch(handles, renderer.as_mut(), sink, &mut iterator);
                }
                Err(e) if is_retryable(&e) => {
                    pending_open = Some(iterator.position().clone());
                    if self.shutdown.wait_timeout(backoff.fail(name, &e)) {
                        break Ok(());
                    }
                }
                Err(e) => break Err(e),
            }
        };

        iterator.close();
        match &result {
            Ok(()) => debug!("{name}: reader stopped"),
            Err(e) => warn!("{name}: reader stopped: {e}"),
        }
        result
    }

    fn process_batch(
        &self,
        handles: Vec<RecordHandle>,
        renderer: &mut dyn EventRenderer,
        sink: &mut dyn EventSink,
        iterator: &mut EventIterator,
    ) {
        let name = self.config.name.as_str();
        let mut records = Vec::with_capacity(handles.len());
        let mut last: Option<(Bookmark, Option<Timestamp>)> = None;

        for handle in handles {
            let bookmark = match Bookmark::from_record(handle.as_ref()) {
                Ok(bookmark) => bookmark,
                Err(e) => {
                    warn!("{name}: skipping record without a position: {e}");
                    continue;
                }
            };

            match renderer.render(handle.as_ref()) {
                Ok(rendered) => {
                    for e in &rendered.errors {
                        debug!("{name}: record {}: {e}", bookmark.record_id());
                    }
                    last = Some((bookmark.clone(), rendered.event.time_created));
                    records.push(Record {
                        event: rendered.event,
                        xml: rendered.xml,
                        bookmark,
                        errors: rendered.errors,
                    });
                }
                Err(e) => {
                    warn!(
                        "{name}: dropping record {} that could not be rendered: {e}",
                        bookmark.record_id()
                    );
                    last = Some((bookmark, None));
                }
            }
        }

        trace!("{name}: delivering {} record(s)", records.len());
        sink.deliver(records);

        if let Some((bookmark, time_created)) = last {
            self.checkpoints.persist(CheckpointState {
                name: self.config.checkpoint_key().to_owned(),
                record_number: bookmark.record_id(),
                timestamp: time_created.unwrap_or_else(Timestamp::now),
                bookmark: bookmark.serialize(),
            });
            iterator.commit(bookmark);
        }
    }

    /// Run the reader on a thread named after the log.
    pub fn spawn<S>(self, mut sink: S) -> Result<JoinHandle<Result<()>>>
    where
        S: EventSink + 'static,
    {
        thread::Builder::new()
            .name(format!("eventlog-{}", self.config.name))
            .spawn(move || self.run(&mut sink))
            .map_err(EventLogError::Spawn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensure_env_logger_initialized;
    use crate::err::WinError;
    use crate::iterator::NoMoreEvents;
    use crate::memlog::{FaultPoint, LogRecord, MemoryEventLog};
    use crate::variant::TypedValue;
    use jiff::SignedDuration;
    use pretty_assertions::assert_eq;

    struct Fixture {
        log: MemoryEventLog,
        checkpoints: Arc<CheckpointStore>,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let checkpoints = Arc::new(
                CheckpointStore::open(dir.path().join("registry.yml"), Duration::from_secs(60))
                    .unwrap(),
            );
            Fixture {
                log: MemoryEventLog::new(),
                checkpoints,
                _dir: dir,
            }
        }

        fn reader(&self, config: EventLogConfig, shutdown: Shutdown) -> EventLogReader {
            let session: Arc<dyn Session> = Arc::new(self.log.clone());
            let cache = Arc::new(PublisherMetadataCache::new(Arc::clone(&session), 0));
            EventLogReader::new(config, session, cache, Arc::clone(&self.checkpoints), shutdown)
                .unwrap()
        }
    }

    fn stop_config(name: &str) -> EventLogConfig {
        EventLogConfig::new(name)
            .batch_read_size(2)
            .no_more_events(NoMoreEvents::Stop)
            .poll_interval(SignedDuration::from_millis(10))
            .max_backoff(SignedDuration::from_millis(40))
    }

    fn append(log: &MemoryEventLog, channel: &str, n: u32) {
        for i in 0..n {
            log.append(
                channel,
                LogRecord::new("TestProvider", 100).value("i", TypedValue::UInt32(i)),
            );
        }
    }

    fn collect(reader: &EventLogReader) -> Vec<u64> {
        let mut ids = Vec::new();
        let mut sink = |records: Vec<Record>| {
            ids.extend(records.iter().map(|r| r.event.record_id));
        };
        reader.run(&mut sink).unwrap();
        ids
    }

    #[test]
    fn test_shutdown_wakes_waiters() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.wait_timeout(Duration::from_millis(1)));

        let waiter = {
            let shutdown = shutdown.clone();
            thread::spawn(move || shutdown.wait_timeout(Duration::from_secs(30)))
        };
        shutdown.trigger();
        assert!(waiter.join().unwrap());
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn test_reads_and_checkpoints() {
        let fx = Fixture::new();
        append(&fx.log, "Application", 5);

        let reader = fx.reader(stop_config("Application"), Shutdown::new());
        assert_eq!(collect(&reader), vec![1, 2, 3, 4, 5]);

        let state = fx.checkpoints.get("Application").unwrap();
        assert_eq!(state.record_number, 5);
        assert_eq!(
            Bookmark::from_serialized(&state.bookmark).unwrap(),
            Bookmark::new("Application", 5)
        );
        assert_eq!(fx.log.open_handles(), 0);
    }

    #[test]
    fn test_resumes_from_checkpoint() {
        let fx = Fixture::new();
        append(&fx.log, "Application", 3);
        let reader = fx.reader(stop_config("Application"), Shutdown::new());
        assert_eq!(collect(&reader), vec![1, 2, 3]);

        append(&fx.log, "Application", 2);
        let reader = fx.reader(stop_config("Application"), Shutdown::new());
        assert_eq!(collect(&reader), vec![4, 5]);
    }

    #[test]
    fn test_record_number_without_bookmark() {
        let fx = Fixture::new();
        append(&fx.log, "System", 4);
        fx.checkpoints.persist(CheckpointState {
            name: "System".to_owned(),
            record_number: 2,
            timestamp: Timestamp::UNIX_EPOCH,
            bookmark: String::new(),
        });

        let reader = fx.reader(stop_config("System"), Shutdown::new());
        assert_eq!(
            reader.initial_position(),
            Position::Bookmark(Bookmark::new("System", 2))
        );
        assert_eq!(collect(&reader), vec![3, 4]);
    }

    #[test]
    fn test_fatal_open_error_ends_reader() {
        let fx = Fixture::new();
        fx.log.create_channel("Security");
        fx.log.deny_channel("Security");

        let reader = fx.reader(stop_config("Security"), Shutdown::new());
        let mut sink = |_: Vec<Record>| {};
        let err = reader.run(&mut sink).unwrap_err();
        assert_eq!(err.win_error(), Some(WinError::ACCESS_DENIED));
    }

    #[test]
    fn test_missing_channel_backs_off_until_shutdown() {
        ensure_env_logger_initialized();
        let fx = Fixture::new();
        let shutdown = Shutdown::new();
        let reader = fx.reader(stop_config("Missing"), shutdown.clone());

        let (tx, rx) = std::sync::mpsc::channel();
        let handle = reader
            .spawn(move |records: Vec<Record>| {
                let _ = tx.send(records.len());
            })
            .unwrap();

        thread::sleep(Duration::from_millis(100));
        shutdown.trigger();
        handle.join().unwrap().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_appearing_later_is_read() {
        let fx = Fixture::new();
        let shutdown = Shutdown::new();
        let config = stop_config("Late").no_more_events(NoMoreEvents::Wait);
        let reader = fx.reader(config, shutdown.clone());

        let (tx, rx) = std::sync::mpsc::channel();
        let handle = reader
            .spawn(move |records: Vec<Record>| {
                for r in records {
                    let _ = tx.send(r.event.record_id);
                }
            })
            .unwrap();

        thread::sleep(Duration::from_millis(50));
        append(&fx.log, "Late", 3);

        let ids: Vec<u64> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        shutdown.trigger();
        handle.join().unwrap().unwrap();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_transient_errors_do_not_lose_records() {
        ensure_env_logger_initialized();
        let fx = Fixture::new();
        append(&fx.log, "Application", 6);
        fx.log.inject_error(FaultPoint::Next, WinError::INVALID_HANDLE);
        fx.log.inject_error(FaultPoint::Next, WinError::INVALID_HANDLE);
        fx.log.inject_error(FaultPoint::Subscribe, WinError::RPC_S_SERVER_UNAVAILABLE);

        let reader = fx.reader(stop_config("Application"), Shutdown::new());
        assert_eq!(collect(&reader), vec![1, 2, 3, 4, 5, 6]);
    }
}
