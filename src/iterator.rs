//! Batched reading of record handles from a subscription.

use std::fmt;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::api::{Position, RecordHandle, Subscription};
use crate::bookmark::Bookmark;
use crate::err::{ErrorClass, EventLogError, Result, WinError};

/// `EvtNext` refuses to return more handles than this in one call.
pub const MAX_BATCH_SIZE: usize = 1024;

/// Opens a subscription at a position. Used to (re)open after failures.
pub type SubscriptionFactory =
    Box<dyn FnMut(&Position) -> std::result::Result<Box<dyn Subscription>, WinError> + Send>;

/// What to do when a subscription has nothing left to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoMoreEvents {
    /// Keep polling for new records.
    #[default]
    Wait,
    /// End the stream.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorState {
    Unopened,
    Active,
    Exhausted,
    Closed,
}

/// Reads batches of record handles, recovering from session failures where it can.
///
/// The iterator remembers the last [`commit`](EventIterator::commit)ted bookmark. When the
/// subscription has to be recreated (the batch size was too large for the RPC layer, the handle
/// went stale) it is reopened from that bookmark, so no committed record is read twice and no
/// uncommitted record is skipped.
///
/// Not meant to be shared between readers.
pub struct EventIterator {
    state: IteratorState,
    subscription: Option<Box<dyn Subscription>>,
    factory: Option<SubscriptionFactory>,
    batch_size: usize,
    no_more_events: NoMoreEvents,
    position: Position,
}

impl fmt::Debug for EventIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventIterator")
            .field("state", &self.state)
            .field("batch_size", &self.batch_size)
            .field("no_more_events", &self.no_more_events)
            .field("position", &self.position)
            .field("has_factory", &self.factory.is_some())
            .finish()
    }
}

impl EventIterator {
    /// An iterator that opens (and reopens) its subscription through `factory`.
    pub fn from_factory(
        factory: SubscriptionFactory,
        batch_size: usize,
        no_more_events: NoMoreEvents,
    ) -> Self {
        EventIterator {
            state: IteratorState::Unopened,
            subscription: None,
            factory: Some(factory),
            batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
            no_more_events,
            position: Position::Fresh,
        }
    }

    /// An iterator over an already open subscription.
    ///
    /// Without a factory a bounds failure cannot be recovered from: the failed batch is lost and
    /// the error is returned.
    pub fn from_subscription(
        subscription: Box<dyn Subscription>,
        batch_size: usize,
        no_more_events: NoMoreEvents,
    ) -> Self {
        EventIterator {
            state: IteratorState::Active,
            subscription: Some(subscription),
            factory: None,
            batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
            no_more_events,
            position: Position::Fresh,
        }
    }

    pub fn state(&self) -> IteratorState {
        self.state
    }

    /// The effective batch size, which shrinks after bounds failures.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// The last committed position.
    pub fn position(&self) -> &Position {
        &self.position
    }

    /// Open the subscription at `position`.
    ///
    /// A bookmark whose record no longer exists falls back to reading from the start.
    pub fn open(&mut self, position: Position) -> Result<()> {
        if self.state == IteratorState::Closed {
            return Err(EventLogError::IteratorClosed);
        }
        self.close_subscription();

        let factory = self
            .factory
            .as_mut()
            .ok_or(EventLogError::NoSubscriptionFactory)?;

        let (subscription, position) = match factory(&position) {
            Ok(sub) => (sub, position),
            Err(e) if e.class() == ErrorClass::PositionNotFound => {
                warn!("Bookmarked position not found ({e}), reading from the beginning");
                let sub = factory(&Position::Fresh)
                    .map_err(|e| EventLogError::api("EvtSubscribe", e))?;
                (sub, Position::Fresh)
            }
            Err(e) => return Err(EventLogError::api("EvtSubscribe", e)),
        };

        self.subscription = Some(subscription);
        self.position = position;
        self.state = IteratorState::Active;
        Ok(())
    }

    /// Reopen from the last committed position.
    pub fn reopen(&mut self) -> Result<()> {
        self.open(self.position.clone())
    }

    /// Record that everything up to `bookmark` has been handled.
    pub fn commit(&mut self, bookmark: Bookmark) {
        self.position = Position::Bookmark(bookmark);
    }

    /// Read the next batch of handles in delivery order.
    ///
    /// `Ok(Some(vec![]))` means nothing is available right now; `Ok(None)` means the stream
    /// ended (only with [`NoMoreEvents::Stop`]).
    pub fn next_batch(&mut self) -> Result<Option<Vec<RecordHandle>>> {
        match self.state {
            IteratorState::Closed => return Err(EventLogError::IteratorClosed),
            IteratorState::Unopened => self.reopen()?,
            IteratorState::Exhausted if self.no_more_events == NoMoreEvents::Stop => {
                return Ok(None);
            }
            _ => {}
        }

        let mut reopened = false;
        loop {
            let subscription = match self.subscription.as_mut() {
                Some(sub) => sub,
                None => {
                    self.reopen()?;
                    continue;
                }
            };

            let err = match subscription.next(self.batch_size) {
                Ok(handles) => {
                    self.state = IteratorState::Active;
                    return Ok(Some(handles));
                }
                Err(e) => e,
            };

            match err.class() {
                ErrorClass::NoMoreItems => {
                    self.state = IteratorState::Exhausted;
                    return Ok(match self.no_more_events {
                        NoMoreEvents::Wait => Some(Vec::new()),
                        NoMoreEvents::Stop => None,
                    });
                }
                _ if err == WinError::RPC_S_INVALID_BOUND => self.recover_bounds(err)?,
                ErrorClass::RecoverableSession if !reopened && self.factory.is_some() => {
                    warn!("Reopening subscription after {err}");
                    reopened = true;
                    self.reopen()?;
                }
                _ => return Err(EventLogError::api("EvtNext", err)),
            }
        }
    }

    fn recover_bounds(&mut self, err: WinError) -> Result<()> {
        if self.factory.is_none() || self.batch_size == 1 {
            self.close_subscription();
            return Err(EventLogError::BatchBounds { source: err });
        }

        self.batch_size = (self.batch_size / 2).max(1);
        warn!(
            "EvtNext failed with {err}, reopening the subscription with batch size {}",
            self.batch_size
        );
        self.reopen()
    }

    fn close_subscription(&mut self) {
        if let Some(mut sub) = self.subscription.take() {
            if let Err(e) = sub.close() {
                debug!("Failed to close subscription: {e}");
            }
        }
    }

    /// Close the subscription. The iterator cannot be used afterwards.
    pub fn close(&mut self) {
        self.close_subscription();
        self.state = IteratorState::Closed;
    }
}

impl Drop for EventIterator {
    fn drop(&mut self) {
        self.close_subscription();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Session, SubscribeRequest};
    use crate::ensure_env_logger_initialized;
    use crate::memlog::{FaultPoint, LogRecord, MemoryEventLog};
    use crate::variant::TypedValue;
    use pretty_assertions::assert_eq;

    fn log_with(n: u32) -> MemoryEventLog {
        let log = MemoryEventLog::new();
        for i in 0..n {
            log.append(
                "Application",
                LogRecord::new("TestProvider", 1).value("i", TypedValue::UInt32(i)),
            );
        }
        log
    }

    fn factory(log: &MemoryEventLog) -> SubscriptionFactory {
        let log = log.clone();
        Box::new(move |position: &Position| {
            log.subscribe(&SubscribeRequest::new("Application", position.clone()))
        })
    }

    fn record_ids(handles: &[RecordHandle]) -> Vec<u64> {
        handles.iter().map(|h| h.position().unwrap().1).collect()
    }

    /// Read everything, committing after each batch.
    fn drain(itr: &mut EventIterator) -> Vec<u64> {
        let mut ids = Vec::new();
        while let Some(batch) = itr.next_batch().unwrap() {
            if let Some(last) = batch.last() {
                itr.commit(Bookmark::from_record(last.as_ref()).unwrap());
            }
            ids.extend(record_ids(&batch));
        }
        ids
    }

    #[test]
    fn test_reads_in_batches() {
        let log = log_with(5);
        let mut itr = EventIterator::from_factory(factory(&log), 2, NoMoreEvents::Stop);
        assert_eq!(itr.state(), IteratorState::Unopened);
        assert_eq!(record_ids(&itr.next_batch().unwrap().unwrap()), vec![1, 2]);
        assert_eq!(itr.state(), IteratorState::Active);
        assert_eq!(record_ids(&itr.next_batch().unwrap().unwrap()), vec![3, 4]);
        assert_eq!(record_ids(&itr.next_batch().unwrap().unwrap()), vec![5]);
        assert!(itr.next_batch().unwrap().is_none());
        assert_eq!(itr.state(), IteratorState::Exhausted);
    }

    #[test]
    fn test_wait_policy_returns_empty_batches() {
        let log = log_with(1);
        let mut itr = EventIterator::from_factory(factory(&log), 10, NoMoreEvents::Wait);
        assert_eq!(itr.next_batch().unwrap().unwrap().len(), 1);
        assert_eq!(itr.next_batch().unwrap().unwrap().len(), 0);

        log.append("Application", LogRecord::new("TestProvider", 1));
        assert_eq!(record_ids(&itr.next_batch().unwrap().unwrap()), vec![2]);
    }

    #[test]
    fn test_batch_size_is_clamped() {
        let log = log_with(0);
        let itr = EventIterator::from_factory(factory(&log), 5000, NoMoreEvents::Wait);
        assert_eq!(itr.batch_size(), MAX_BATCH_SIZE);
        let itr = EventIterator::from_factory(factory(&log), 0, NoMoreEvents::Wait);
        assert_eq!(itr.batch_size(), 1);
    }

    #[test]
    fn test_bounds_failure_recovers_with_factory() {
        ensure_env_logger_initialized();
        let log = log_with(20);
        log.set_batch_bound(Some(3));

        let mut itr = EventIterator::from_factory(factory(&log), 16, NoMoreEvents::Stop);
        let ids = drain(&mut itr);
        assert_eq!(ids, (1..=20).collect::<Vec<u64>>());
        assert_eq!(itr.batch_size(), 2);
    }

    #[test]
    fn test_bounds_failure_without_factory_is_reported() {
        let log = log_with(10);
        log.set_batch_bound(Some(3));
        let sub = log
            .subscribe(&SubscribeRequest::new("Application", Position::Fresh))
            .unwrap();

        let mut itr = EventIterator::from_subscription(sub, 8, NoMoreEvents::Stop);
        let err = itr.next_batch().err().expect("expected next_batch to fail");
        assert!(matches!(err, EventLogError::BatchBounds { .. }));
        assert!(err.to_string().contains("reducing the batch size"));
    }

    #[test]
    fn test_missing_bookmark_falls_back_to_start() {
        let log = log_with(3);
        let mut itr = EventIterator::from_factory(factory(&log), 10, NoMoreEvents::Stop);
        itr.open(Position::Bookmark(Bookmark::new("Application", 99)))
            .unwrap();
        assert_eq!(itr.position(), &Position::Fresh);
        assert_eq!(drain(&mut itr), vec![1, 2, 3]);
    }

    #[test]
    fn test_resume_after_bookmark() {
        let log = log_with(4);
        let mut itr = EventIterator::from_factory(factory(&log), 10, NoMoreEvents::Stop);
        itr.open(Position::Bookmark(Bookmark::new("Application", 2)))
            .unwrap();
        assert_eq!(drain(&mut itr), vec![3, 4]);
    }

    #[test]
    fn test_transient_error_reopens_once() {
        let log = log_with(2);
        let mut itr = EventIterator::from_factory(factory(&log), 10, NoMoreEvents::Stop);
        log.inject_error(FaultPoint::Next, WinError::RPC_S_SERVER_UNAVAILABLE);
        assert_eq!(drain(&mut itr), vec![1, 2]);

        log.inject_error(FaultPoint::Next, WinError::ACCESS_DENIED);
        let mut itr = EventIterator::from_factory(factory(&log), 10, NoMoreEvents::Stop);
        assert!(matches!(
            itr.next_batch(),
            Err(EventLogError::Api { source: WinError::ACCESS_DENIED, .. })
        ));
    }

    #[test]
    fn test_closed_iterator() {
        let log = log_with(1);
        let mut itr = EventIterator::from_factory(factory(&log), 10, NoMoreEvents::Stop);
        itr.close();
        assert_eq!(itr.state(), IteratorState::Closed);
        assert!(matches!(
            itr.next_batch(),
            Err(EventLogError::IteratorClosed)
        ));
    }
}
