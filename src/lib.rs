#![deny(unused_must_use)]
#![forbid(unsafe_code)]
//! Reading Windows event logs: batched subscriptions that survive session failures, rendering of
//! records into structured [`Event`]s with provider metadata, and durable per-log checkpoints.
//!
//! The event log itself is reached through the [`Session`] trait. [`MemoryEventLog`] implements
//! it in memory (and over exported XML logs).
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use wineventlog::{
//!     CheckpointStore, EventLogConfig, EventLogReader, LogRecord, MemoryEventLog,
//!     NoMoreEvents, PublisherMetadataCache, Record, Session, Shutdown,
//! };
//!
//! let log = MemoryEventLog::new();
//! log.append("Application", LogRecord::new("MyService", 1000));
//!
//! let dir = tempfile::tempdir().unwrap();
//! let session: Arc<dyn Session> = Arc::new(log);
//! let cache = Arc::new(PublisherMetadataCache::new(Arc::clone(&session), 0));
//! let checkpoints = Arc::new(
//!     CheckpointStore::open(dir.path().join("registry.yml"), Duration::from_secs(5)).unwrap(),
//! );
//!
//! let config = EventLogConfig::new("Application").no_more_events(NoMoreEvents::Stop);
//! let reader = EventLogReader::new(config, session, cache, checkpoints, Shutdown::new()).unwrap();
//!
//! let mut count = 0;
//! reader.run(&mut |records: Vec<Record>| count += records.len()).unwrap();
//! assert_eq!(count, 1);
//! ```

pub mod api;
pub mod bookmark;
pub mod checkpoint;
pub mod config;
pub mod err;
pub mod event;
pub mod event_xml;
pub mod guid;
pub mod iterator;
pub mod memlog;
pub mod publisher;
pub mod reader;
pub mod renderer;
pub mod sid;
pub mod template;
pub mod transcode;
pub mod variant;
pub mod winmeta;

mod utils;

pub use api::{
    EventHandle, Position, RecordHandle, Session, SubscribeFlags, SubscribeRequest, Subscription,
};
pub use bookmark::Bookmark;
pub use checkpoint::{CheckpointState, CheckpointStore};
pub use config::{CheckpointConfig, EventLogConfig, RendererKind};
pub use err::{
    CheckpointError, ConfigError, DeserializationError, ErrorClass, EventLogError, Result,
    WinError,
};
pub use event::{Correlation, Event, Execution, KeyValue, Provider, UserData, UserSid};
pub use event_xml::{EventXmlStream, read_event_stream, unmarshal_event_xml};
pub use guid::Guid;
pub use iterator::{EventIterator, NoMoreEvents, SubscriptionFactory};
pub use memlog::{FaultPoint, LogRecord, MemoryEventLog, RenderingInfo};
pub use publisher::{
    EventDefinition, EventMetadata, MetadataEntry, ProviderMetadata, PublisherMetadataCache,
    PublisherMetadataStore,
};
pub use reader::{EventLogReader, EventSink, Record, Shutdown};
pub use renderer::{EventRenderer, RenderConfig, RenderedEvent, Renderer, XmlRenderer};
pub use sid::{Account, Sid, SidType};
pub use template::MessageTemplate;
pub use transcode::ControlSafeReader;
pub use variant::{Fingerprint, RenderContext, TypedValue, VariantArray};
pub use winmeta::{WinMeta, default_win_meta, enrich_raw_values_with_names};

#[cfg(test)]
pub(crate) fn ensure_env_logger_initialized() {
    use std::io::Write;
    use std::sync::Once;

    static LOGGER_INIT: Once = Once::new();

    LOGGER_INIT.call_once(|| {
        env_logger::Builder::from_default_env()
            .format(|buf, record| writeln!(buf, "[{}] - {}", record.level(), record.args()))
            .init();
    });
}
