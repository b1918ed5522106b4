use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EventLogError>;
pub type DeserializationResult<T> = std::result::Result<T, DeserializationError>;

/// Errors raised while decoding variant buffers, bookmarks and event XML.
#[derive(Debug, Error)]
pub enum DeserializationError {
    #[error("Offset {offset}: truncated {what} (need {need} bytes, have {have})")]
    Truncated {
        what: &'static str,
        offset: u64,
        need: usize,
        have: usize,
    },

    #[error("Offset {offset}: {what} points outside of the render buffer ({pointer:#x}, buffer is {len} bytes)")]
    PointerOutOfBounds {
        what: &'static str,
        offset: u64,
        pointer: u64,
        len: usize,
    },

    #[error("Offset {offset}: unknown variant type `{value:#x}`")]
    UnknownVariantType { value: u32, offset: u64 },

    #[error("Offset {offset}: variant type `{name}` is unsupported")]
    UnsupportedVariantType { name: &'static str, offset: u64 },

    #[error("Offset {offset}: failed to decode UTF-16 string")]
    FailedToDecodeUtf16String { offset: u64 },

    #[error("Offset {offset}: failed to decode ansi string: {message}")]
    FailedToDecodeAnsiString { message: String, offset: u64 },

    #[error("Invalid date time")]
    InvalidDateTimeError,

    #[error("System property `{property}` has unexpected type `{found}`")]
    UnexpectedPropertyType {
        property: &'static str,
        found: &'static str,
    },

    #[error("Render buffer holds {count} properties, expected at least {expected}")]
    MissingProperties { count: usize, expected: usize },

    #[error("Invalid SID `{0}`")]
    InvalidSid(String),

    #[error("Invalid GUID `{0}`")]
    InvalidGuid(String),

    #[error("Invalid bookmark: {0}")]
    InvalidBookmark(String),

    #[error("Invalid event XML: {0}")]
    InvalidEventXml(String),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<quick_xml::events::attributes::AttrError> for DeserializationError {
    fn from(e: quick_xml::events::attributes::AttrError) -> Self {
        DeserializationError::Xml(quick_xml::Error::from(e))
    }
}

/// A Windows error code as returned by the event log API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WinError(pub u32);

impl WinError {
    pub const ACCESS_DENIED: WinError = WinError(5);
    pub const INVALID_HANDLE: WinError = WinError(6);
    pub const INSUFFICIENT_BUFFER: WinError = WinError(122);
    pub const NO_MORE_ITEMS: WinError = WinError(259);
    pub const NOT_FOUND: WinError = WinError(1168);
    pub const NONE_MAPPED: WinError = WinError(1332);
    pub const RPC_S_SERVER_UNAVAILABLE: WinError = WinError(1722);
    pub const RPC_S_INVALID_BOUND: WinError = WinError(1734);
    pub const RPC_S_CALL_CANCELLED: WinError = WinError(1818);
    pub const INVALID_OPERATION: WinError = WinError(4317);
    pub const EVT_PUBLISHER_METADATA_NOT_FOUND: WinError = WinError(15002);
    pub const EVT_INVALID_EVENT_DATA: WinError = WinError(15005);
    pub const EVT_CHANNEL_NOT_FOUND: WinError = WinError(15007);
    pub const EVT_QUERY_RESULT_STALE: WinError = WinError(15011);
    pub const EVT_QUERY_RESULT_INVALID_POSITION: WinError = WinError(15012);
    pub const EVT_MESSAGE_NOT_FOUND: WinError = WinError(15027);
    pub const EVT_MESSAGE_ID_NOT_FOUND: WinError = WinError(15028);
    pub const EVT_UNRESOLVED_VALUE_INSERT: WinError = WinError(15029);
    pub const EVT_UNRESOLVED_PARAMETER_INSERT: WinError = WinError(15030);

    pub fn code(self) -> u32 {
        self.0
    }

    fn message(self) -> Option<&'static str> {
        let msg = match self {
            WinError::ACCESS_DENIED => "Access is denied.",
            WinError::INVALID_HANDLE => "The handle is invalid.",
            WinError::INSUFFICIENT_BUFFER => {
                "The data area passed to a system call is too small."
            }
            WinError::NO_MORE_ITEMS => "No more data is available.",
            WinError::NOT_FOUND => "Element not found.",
            WinError::NONE_MAPPED => "No mapping between account names and security IDs was done.",
            WinError::RPC_S_SERVER_UNAVAILABLE => "The RPC server is unavailable.",
            WinError::RPC_S_INVALID_BOUND => "The array bounds are invalid.",
            WinError::RPC_S_CALL_CANCELLED => "The remote procedure call was cancelled.",
            WinError::INVALID_OPERATION => "The operation identifier is not valid.",
            WinError::EVT_PUBLISHER_METADATA_NOT_FOUND => {
                "The publisher metadata cannot be found in the resource."
            }
            WinError::EVT_INVALID_EVENT_DATA => {
                "The event data raised by the publisher is not compatible with the event template definition in the publisher's manifest."
            }
            WinError::EVT_CHANNEL_NOT_FOUND => "The specified channel could not be found.",
            WinError::EVT_QUERY_RESULT_STALE => "The query result is stale or invalid.",
            WinError::EVT_QUERY_RESULT_INVALID_POSITION => {
                "The query result is currently at an invalid position."
            }
            WinError::EVT_MESSAGE_NOT_FOUND => {
                "The message resource is present but the message was not found in the message table."
            }
            WinError::EVT_MESSAGE_ID_NOT_FOUND => {
                "The message ID for the desired message could not be found."
            }
            WinError::EVT_UNRESOLVED_VALUE_INSERT => {
                "The substitution string for the insert index could not be found."
            }
            WinError::EVT_UNRESOLVED_PARAMETER_INSERT => {
                "The description string for the parameter reference could not be found."
            }
            _ => return None,
        };
        Some(msg)
    }

    /// Where this error lands in the failure taxonomy of a reading session.
    pub fn class(self) -> ErrorClass {
        match self {
            WinError::NO_MORE_ITEMS | WinError::INVALID_OPERATION => ErrorClass::NoMoreItems,
            WinError::INVALID_HANDLE
            | WinError::RPC_S_SERVER_UNAVAILABLE
            | WinError::RPC_S_CALL_CANCELLED
            | WinError::RPC_S_INVALID_BOUND
            | WinError::EVT_QUERY_RESULT_STALE => ErrorClass::RecoverableSession,
            WinError::EVT_CHANNEL_NOT_FOUND => ErrorClass::NotFound,
            WinError::EVT_QUERY_RESULT_INVALID_POSITION | WinError::NOT_FOUND => {
                ErrorClass::PositionNotFound
            }
            _ => ErrorClass::Fatal,
        }
    }
}

impl fmt::Display for WinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{} (error {})", msg, self.0),
            None => write!(f, "Windows error {}", self.0),
        }
    }
}

impl std::error::Error for WinError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Nothing to read right now.
    NoMoreItems,
    /// The subscription can be closed and reopened from the last bookmark.
    RecoverableSession,
    /// The channel does not exist (yet); retry with backoff.
    NotFound,
    /// The bookmarked position is gone; restart from the beginning.
    PositionNotFound,
    Fatal,
}

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("{context}: {source}")]
    Api {
        context: &'static str,
        #[source]
        source: WinError,
    },

    #[error("Failed to render system properties: {source}")]
    RenderSystem {
        #[source]
        source: Box<EventLogError>,
    },

    #[error("Failed to render event data: {source}")]
    RenderUserData {
        #[source]
        source: Box<EventLogError>,
    },

    #[error("Failed to get the event message string: {source}")]
    FormatMessage {
        #[source]
        source: WinError,
    },

    #[error(
        "Failed to load publisher metadata for {provider} (returning an empty metadata store): {source}"
    )]
    PublisherMetadata {
        provider: String,
        #[source]
        source: WinError,
    },

    #[error("Failed to look up account for SID {sid}: {source}")]
    AccountLookup {
        sid: String,
        #[source]
        source: WinError,
    },

    #[error(
        "Failed in EvtNext (try reducing the batch size or providing a subscription factory for automatic recovery; the in-flight batch may have been lost): {source}"
    )]
    BatchBounds {
        #[source]
        source: WinError,
    },

    #[error("Iterator has no subscription factory to open a subscription with")]
    NoSubscriptionFactory,

    #[error("Iterator is closed")]
    IteratorClosed,

    #[error(transparent)]
    Deserialization(#[from] DeserializationError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to spawn reader thread: {0}")]
    Spawn(#[source] io::Error),
}

impl EventLogError {
    pub(crate) fn api(context: &'static str, source: WinError) -> Self {
        EventLogError::Api { context, source }
    }

    /// The underlying Windows error code, if this error carries one.
    pub fn win_error(&self) -> Option<WinError> {
        match self {
            EventLogError::Api { source, .. }
            | EventLogError::FormatMessage { source }
            | EventLogError::PublisherMetadata { source, .. }
            | EventLogError::AccountLookup { source, .. }
            | EventLogError::BatchBounds { source } => Some(*source),
            EventLogError::RenderSystem { source } | EventLogError::RenderUserData { source } => {
                source.win_error()
            }
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint file {} is not writable: {source}", path.display())]
    NotWritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read checkpoint file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed checkpoint file {}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Failed to serialize checkpoint state: {0}")]
    Serialize(#[source] serde_yaml::Error),

    #[error("Failed to write checkpoint file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to spawn checkpoint writer: {0}")]
    Spawn(#[source] io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Event log name must not be empty")]
    EmptyName,

    #[error("batch_read_size must be between 1 and {max}, got {value}")]
    InvalidBatchSize { value: usize, max: usize },

    #[error("{field} must be a positive duration")]
    InvalidDuration { field: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_win_error_display() {
        assert_eq!(
            WinError::RPC_S_INVALID_BOUND.to_string(),
            "The array bounds are invalid. (error 1734)"
        );
        assert_eq!(WinError(42).to_string(), "Windows error 42");
    }

    #[test]
    fn test_win_error_class() {
        assert_eq!(WinError::NO_MORE_ITEMS.class(), ErrorClass::NoMoreItems);
        assert_eq!(
            WinError::INVALID_HANDLE.class(),
            ErrorClass::RecoverableSession
        );
        assert_eq!(WinError::EVT_CHANNEL_NOT_FOUND.class(), ErrorClass::NotFound);
        assert_eq!(
            WinError::EVT_QUERY_RESULT_INVALID_POSITION.class(),
            ErrorClass::PositionNotFound
        );
        assert_eq!(WinError::ACCESS_DENIED.class(), ErrorClass::Fatal);
    }

    #[test]
    fn test_nested_win_error() {
        let err = EventLogError::RenderSystem {
            source: Box::new(EventLogError::api("EvtRender", WinError::INVALID_HANDLE)),
        };
        assert_eq!(err.win_error(), Some(WinError::INVALID_HANDLE));
    }
}
