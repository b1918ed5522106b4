//! The capability interface over an event log backend.
//!
//! The rest of the crate only talks to the event log through these traits, so the native
//! `wevtapi` session, a remote session or the in-memory [`MemoryEventLog`](crate::MemoryEventLog)
//! are interchangeable.

use bitflags::bitflags;

use crate::bookmark::Bookmark;
use crate::err::WinError;
use crate::publisher::ProviderMetadata;
use crate::sid::{Account, Sid};
use crate::variant::RenderContext;

/// A live, unread record. Dropping the handle releases it.
pub type RecordHandle = Box<dyn EventHandle>;

/// Where a subscription starts reading.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Position {
    /// From the oldest record still present in the channel.
    #[default]
    Fresh,
    /// Strictly after the bookmarked record.
    Bookmark(Bookmark),
}

bitflags! {
    /// `EvtSubscribe` flags. The low two bits select where the subscription starts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SubscribeFlags: u32 {
        const TO_FUTURE_EVENTS = 0x1;
        const START_AT_OLDEST_RECORD = 0x2;
        const START_AFTER_BOOKMARK = 0x3;
        const ORIGIN_MASK = 0x3;
        const TOLERATE_QUERY_ERRORS = 0x1000;
        const STRICT = 0x10000;
    }
}

impl SubscribeFlags {
    pub fn origin(self) -> SubscribeFlags {
        self & SubscribeFlags::ORIGIN_MASK
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub channel: String,
    pub query: Option<String>,
    pub position: Position,
    pub flags: SubscribeFlags,
}

impl SubscribeRequest {
    pub fn new(channel: impl Into<String>, position: Position) -> Self {
        // Strict, so that a bookmark whose record is gone is reported instead of silently
        // restarting somewhere else.
        let flags = match position {
            Position::Fresh => SubscribeFlags::START_AT_OLDEST_RECORD,
            Position::Bookmark(_) => SubscribeFlags::START_AFTER_BOOKMARK | SubscribeFlags::STRICT,
        };
        SubscribeRequest {
            channel: channel.into(),
            query: None,
            position,
            flags,
        }
    }

    pub fn with_query(mut self, query: Option<String>) -> Self {
        self.query = query;
        self
    }
}

/// A connection to an event log (local or remote).
pub trait Session: Send + Sync {
    fn subscribe(&self, request: &SubscribeRequest) -> Result<Box<dyn Subscription>, WinError>;

    /// Load the metadata a provider registered, in the given locale (0 for the default).
    fn publisher_metadata(&self, provider: &str, locale: u32) -> Result<ProviderMetadata, WinError>;

    fn lookup_account(&self, sid: &Sid) -> Result<Account, WinError>;
}

/// An open subscription or query result set.
pub trait Subscription: Send {
    /// Fetch up to `max` record handles.
    ///
    /// Returns [`WinError::NO_MORE_ITEMS`] when nothing is available right now.
    fn next(&mut self, max: usize) -> Result<Vec<RecordHandle>, WinError>;

    fn close(&mut self) -> Result<(), WinError>;
}

pub trait EventHandle: Send {
    /// Render the system or user properties into `buf` as an `EVT_VARIANT` array.
    ///
    /// Returns the number of properties written.
    fn render_values(&self, context: RenderContext, buf: &mut Vec<u8>) -> Result<usize, WinError>;

    /// Render the record as event XML into `buf`.
    ///
    /// When provider metadata is given (or the record was forwarded with its rendered text), the
    /// output carries a `RenderingInfo` section.
    fn render_xml(
        &self,
        provider: Option<&ProviderMetadata>,
        buf: &mut Vec<u8>,
    ) -> Result<(), WinError>;

    /// Format the record's message.
    ///
    /// `inserts` replaces the record's own values as substitution strings.
    fn format_message(
        &self,
        provider: Option<&ProviderMetadata>,
        inserts: Option<&[String]>,
    ) -> Result<String, WinError>;

    /// The channel and record id this handle points at.
    fn position(&self) -> Result<(String, u64), WinError>;
}
