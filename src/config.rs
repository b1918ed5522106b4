//! Per-log reading settings and checkpoint settings.
//!
//! Both can be deserialized (missing fields take their defaults) or built in code:
//!
//! ```
//! use wineventlog::EventLogConfig;
//!
//! let config = EventLogConfig::new("Security").batch_read_size(512).include_xml(true);
//! assert!(config.validate().is_ok());
//! ```

use std::path::PathBuf;
use std::time::Duration;

use jiff::SignedDuration;
use serde::{Deserialize, Serialize};

use crate::err::ConfigError;
use crate::iterator::{MAX_BATCH_SIZE, NoMoreEvents};
use crate::renderer::RenderConfig;

/// The channel that Windows Event Forwarding delivers to by default.
pub const FORWARDED_EVENTS_CHANNEL: &str = "ForwardedEvents";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RendererKind {
    /// Decode the record's value arrays.
    #[default]
    Binary,
    /// Decode the record's XML.
    Xml,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogConfig {
    /// Channel name, or the path of an exported log.
    pub name: String,
    /// Key of this log's checkpoint. Defaults to `name`.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_batch_read_size")]
    pub batch_read_size: usize,
    #[serde(default)]
    pub no_more_events: NoMoreEvents,
    #[serde(default)]
    pub include_xml: bool,
    /// Unset means "only for the `ForwardedEvents` channel".
    #[serde(default)]
    pub forwarded: Option<bool>,
    /// LCID used for provider metadata, 0 for the system default.
    #[serde(default)]
    pub language: u32,
    /// Structured XML query. Defaults to every record of the channel.
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: SignedDuration,
    #[serde(default = "default_max_backoff")]
    pub max_backoff: SignedDuration,
    #[serde(default)]
    pub renderer: RendererKind,
}

fn default_batch_read_size() -> usize {
    100
}

fn default_poll_interval() -> SignedDuration {
    SignedDuration::from_secs(1)
}

fn default_max_backoff() -> SignedDuration {
    SignedDuration::from_secs(60)
}

fn default_flush_interval() -> SignedDuration {
    SignedDuration::from_secs(5)
}

fn positive(value: SignedDuration, field: &'static str) -> Result<Duration, ConfigError> {
    if !value.is_positive() {
        return Err(ConfigError::InvalidDuration { field });
    }
    Duration::try_from(value).map_err(|_| ConfigError::InvalidDuration { field })
}

fn to_std(value: SignedDuration) -> Duration {
    Duration::try_from(value).unwrap_or(Duration::ZERO)
}

impl EventLogConfig {
    pub fn new(name: impl Into<String>) -> Self {
        EventLogConfig {
            name: name.into(),
            id: None,
            batch_read_size: default_batch_read_size(),
            no_more_events: NoMoreEvents::default(),
            include_xml: false,
            forwarded: None,
            language: 0,
            query: None,
            poll_interval: default_poll_interval(),
            max_backoff: default_max_backoff(),
            renderer: RendererKind::default(),
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn batch_read_size(mut self, size: usize) -> Self {
        self.batch_read_size = size;
        self
    }

    pub fn no_more_events(mut self, policy: NoMoreEvents) -> Self {
        self.no_more_events = policy;
        self
    }

    pub fn include_xml(mut self, include_xml: bool) -> Self {
        self.include_xml = include_xml;
        self
    }

    pub fn forwarded(mut self, forwarded: bool) -> Self {
        self.forwarded = Some(forwarded);
        self
    }

    pub fn language(mut self, lcid: u32) -> Self {
        self.language = lcid;
        self
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn poll_interval(mut self, interval: SignedDuration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn max_backoff(mut self, max: SignedDuration) -> Self {
        self.max_backoff = max;
        self
    }

    pub fn renderer(mut self, kind: RendererKind) -> Self {
        self.renderer = kind;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_read_size) {
            return Err(ConfigError::InvalidBatchSize {
                value: self.batch_read_size,
                max: MAX_BATCH_SIZE,
            });
        }
        positive(self.poll_interval, "poll_interval")?;
        positive(self.max_backoff, "max_backoff")?;
        Ok(())
    }

    /// The name this log's checkpoint is stored under.
    pub fn checkpoint_key(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }

    pub fn is_forwarded(&self) -> bool {
        self.forwarded
            .unwrap_or_else(|| self.name.eq_ignore_ascii_case(FORWARDED_EVENTS_CHANNEL))
    }

    pub fn render_config(&self) -> RenderConfig {
        RenderConfig {
            forwarded: self.is_forwarded(),
            include_xml: self.include_xml,
        }
    }

    pub(crate) fn poll_interval_std(&self) -> Duration {
        to_std(self.poll_interval)
    }

    pub(crate) fn max_backoff_std(&self) -> Duration {
        to_std(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub path: PathBuf,
    #[serde(default = "default_flush_interval")]
    pub flush_interval: SignedDuration,
}

impl CheckpointConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CheckpointConfig {
            path: path.into(),
            flush_interval: default_flush_interval(),
        }
    }

    pub fn flush_interval(&self) -> Duration {
        to_std(self.flush_interval)
    }

    pub fn with_flush_interval(mut self, interval: SignedDuration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive(self.flush_interval, "flush_interval").map(|_| ())
    }
}
