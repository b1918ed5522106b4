//! An in-process event log.
//!
//! [`MemoryEventLog`] implements [`Session`] over channels held in memory. It renders records the
//! same way the native API does (`EVT_VARIANT` arrays and event XML), so everything above the
//! capability interface runs unchanged against it. Records can be appended one by one or loaded
//! from an exported `<Events>` XML document, which makes it the file-backed source as well.
//!
//! Faults can be injected to exercise recovery paths: one-shot errors, a batch size bound that
//! fails larger requests with `RPC_S_INVALID_BOUND` (consuming the records like the real API
//! does), and channels that deny access.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use jiff::Timestamp;
use log::{debug, trace};
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event as XmlEvent};

use crate::api::{
    EventHandle, Position, RecordHandle, Session, SubscribeFlags, SubscribeRequest, Subscription,
};
use crate::err::{DeserializationResult, WinError};
use crate::event::Event;
use crate::event_xml::EventXmlStream;
use crate::guid::Guid;
use crate::publisher::ProviderMetadata;
use crate::sid::{Account, Sid};
use crate::template::MessageTemplate;
use crate::utils::FastMap;
use crate::variant::{RenderContext, SystemProperty, TypedValue, VariantWriter};
use crate::winmeta::enrich_raw_values_with_names;

const EVENT_NAMESPACE: &str = "http://schemas.microsoft.com/win/2004/08/events/event";

/// Text a forwarding source rendered before the record reached this log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderingInfo {
    pub message: String,
    pub level: String,
    pub task: String,
    pub opcode: String,
    pub keywords: Vec<String>,
}

/// A record to be stored in a [`MemoryEventLog`].
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub provider: String,
    pub provider_guid: Option<Guid>,
    pub event_id: u16,
    pub qualifiers: u16,
    pub version: u8,
    pub level: u8,
    pub task: u16,
    pub opcode: u8,
    pub keywords: u64,
    pub time_created: Timestamp,
    pub activity_id: Option<Guid>,
    pub related_activity_id: Option<Guid>,
    pub process_id: u32,
    pub thread_id: u32,
    pub computer: String,
    pub user: Option<Sid>,
    /// Named values in template order. An empty name renders as an unnamed `<Data>`.
    pub values: Vec<(String, TypedValue)>,
    /// Element name and namespace when the values are `UserData`.
    pub user_data: Option<(String, String)>,
    pub rendering_info: Option<RenderingInfo>,
}

impl LogRecord {
    pub fn new(provider: impl Into<String>, event_id: u16) -> Self {
        LogRecord {
            provider: provider.into(),
            provider_guid: None,
            event_id,
            qualifiers: 0,
            version: 0,
            level: 4,
            task: 0,
            opcode: 0,
            keywords: 0x8000_0000_0000_0000,
            time_created: Timestamp::UNIX_EPOCH,
            activity_id: None,
            related_activity_id: None,
            process_id: 0,
            thread_id: 0,
            computer: "localhost".to_owned(),
            user: None,
            values: Vec::new(),
            user_data: None,
            rendering_info: None,
        }
    }

    pub fn version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    pub fn level(mut self, level: u8) -> Self {
        self.level = level;
        self
    }

    pub fn task(mut self, task: u16) -> Self {
        self.task = task;
        self
    }

    pub fn opcode(mut self, opcode: u8) -> Self {
        self.opcode = opcode;
        self
    }

    pub fn keywords(mut self, keywords: u64) -> Self {
        self.keywords = keywords;
        self
    }

    pub fn time_created(mut self, ts: Timestamp) -> Self {
        self.time_created = ts;
        self
    }

    pub fn computer(mut self, computer: impl Into<String>) -> Self {
        self.computer = computer.into();
        self
    }

    pub fn user(mut self, sid: Sid) -> Self {
        self.user = Some(sid);
        self
    }

    pub fn value(mut self, name: impl Into<String>, value: TypedValue) -> Self {
        self.values.push((name.into(), value));
        self
    }

    pub fn user_data(mut self, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        self.user_data = Some((name.into(), namespace.into()));
        self
    }

    pub fn rendering_info(mut self, info: RenderingInfo) -> Self {
        self.rendering_info = Some(info);
        self
    }

    fn from_event(event: Event) -> LogRecord {
        let mut record = LogRecord::new(event.provider.name, event.event_id as u16);
        record.provider_guid = event.provider.guid.parse().ok();
        record.qualifiers = event.qualifiers;
        record.version = event.version;
        record.level = event.level_raw;
        record.task = event.task_raw;
        record.opcode = event.opcode_raw.unwrap_or(0);
        record.keywords = event.keywords_raw;
        record.time_created = event.time_created.unwrap_or(Timestamp::UNIX_EPOCH);
        record.activity_id = event.correlation.activity_id.parse().ok();
        record.related_activity_id = event.correlation.related_activity_id.parse().ok();
        record.process_id = event.execution.process_id;
        record.thread_id = event.execution.thread_id;
        record.computer = event.computer;
        record.user = event.user.identifier.parse().ok();

        let pairs = match event.user_data {
            Some(user_data) => {
                record.user_data = Some((user_data.name, user_data.namespace));
                user_data.pairs
            }
            None => event.event_data,
        };
        record.values = pairs
            .into_iter()
            .map(|kv| (kv.key, TypedValue::String(kv.value)))
            .collect();

        if !event.message.is_empty() {
            record.rendering_info = Some(RenderingInfo {
                message: event.message,
                level: event.level,
                task: event.task,
                opcode: event.opcode,
                keywords: event.keywords,
            });
        }
        record
    }
}

/// Where a one-shot injected error is raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    Subscribe,
    Next,
}

#[derive(Debug)]
struct StoredRecord {
    channel: String,
    record_id: u64,
    record: LogRecord,
}

#[derive(Debug, Default)]
struct Channel {
    records: Vec<Arc<StoredRecord>>,
    last_record_id: u64,
    /// Bumped by `clear`; handles from older generations are invalid.
    generation: u64,
}

#[derive(Debug, Default)]
struct State {
    channels: BTreeMap<String, Channel>,
    providers: FastMap<String, ProviderMetadata>,
    accounts: FastMap<Sid, Account>,
    faults: VecDeque<(FaultPoint, WinError)>,
    batch_bound: Option<usize>,
    denied: HashSet<String>,
}

impl State {
    fn take_fault(&mut self, point: FaultPoint) -> Option<WinError> {
        let idx = self.faults.iter().position(|(p, _)| *p == point)?;
        self.faults.remove(idx).map(|(_, e)| e)
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: RwLock<State>,
    open_handles: AtomicUsize,
    metadata_opens: AtomicUsize,
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An event log held in memory. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventLog {
    inner: Arc<Inner>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty channel (appending creates channels too).
    pub fn create_channel(&self, channel: &str) {
        self.inner.write().channels.entry(channel.to_owned()).or_default();
    }

    /// Append a record; returns its record id.
    pub fn append(&self, channel: &str, record: LogRecord) -> u64 {
        self.insert(channel, record, None)
    }

    fn insert(&self, channel: &str, record: LogRecord, record_id: Option<u64>) -> u64 {
        let mut state = self.inner.write();
        let ch = state.channels.entry(channel.to_owned()).or_default();
        let record_id = match record_id {
            Some(id) if id > ch.last_record_id => id,
            _ => ch.last_record_id + 1,
        };
        ch.last_record_id = record_id;
        ch.records.push(Arc::new(StoredRecord {
            channel: channel.to_owned(),
            record_id,
            record,
        }));
        record_id
    }

    /// Load every event of an exported `<Events>` document into `channel`, keeping the source
    /// record ids where they still ascend. Returns the number of records loaded.
    pub fn import_xml<R: Read>(&self, channel: &str, source: R) -> DeserializationResult<usize> {
        let mut count = 0;
        for event in EventXmlStream::new(source) {
            let event = event?;
            let record_id = (event.record_id != 0).then_some(event.record_id);
            self.insert(channel, LogRecord::from_event(event), record_id);
            count += 1;
        }
        debug!("Imported {count} records into channel {channel}");
        Ok(count)
    }

    /// Remove every record of a channel. Outstanding handles to them become invalid.
    pub fn clear(&self, channel: &str) {
        if let Some(ch) = self.inner.write().channels.get_mut(channel) {
            ch.records.clear();
            ch.generation += 1;
        }
    }

    pub fn register_provider(&self, metadata: ProviderMetadata) {
        self.inner
            .write()
            .providers
            .insert(metadata.name.clone(), metadata);
    }

    pub fn register_account(&self, sid: Sid, account: Account) {
        self.inner.write().accounts.insert(sid, account);
    }

    /// Fail the next call at `point` with `error`.
    pub fn inject_error(&self, point: FaultPoint, error: WinError) {
        self.inner.write().faults.push_back((point, error));
    }

    /// Fail batch requests for more than `bound` records with `RPC_S_INVALID_BOUND`.
    ///
    /// Like the native API the failed call still consumes the records it would have returned.
    pub fn set_batch_bound(&self, bound: Option<usize>) {
        self.inner.write().batch_bound = bound;
    }

    pub fn deny_channel(&self, channel: &str) {
        self.inner.write().denied.insert(channel.to_owned());
    }

    pub fn record_count(&self, channel: &str) -> usize {
        self.inner
            .read()
            .channels
            .get(channel)
            .map_or(0, |ch| ch.records.len())
    }

    /// Record handles currently alive.
    pub fn open_handles(&self) -> usize {
        self.inner.open_handles.load(Ordering::SeqCst)
    }

    /// How many times provider metadata was loaded.
    pub fn publisher_metadata_opens(&self) -> usize {
        self.inner.metadata_opens.load(Ordering::SeqCst)
    }
}

impl Session for MemoryEventLog {
    fn subscribe(&self, request: &SubscribeRequest) -> Result<Box<dyn Subscription>, WinError> {
        let mut state = self.inner.write();
        if let Some(e) = state.take_fault(FaultPoint::Subscribe) {
            return Err(e);
        }
        if state.denied.contains(&request.channel) {
            return Err(WinError::ACCESS_DENIED);
        }
        let channel = state
            .channels
            .get(&request.channel)
            .ok_or(WinError::EVT_CHANNEL_NOT_FOUND)?;

        let after = match (&request.position, request.flags.origin()) {
            (Position::Bookmark(bookmark), SubscribeFlags::START_AFTER_BOOKMARK) => {
                let exists = bookmark.channel() == request.channel
                    && channel
                        .records
                        .iter()
                        .any(|r| r.record_id == bookmark.record_id());
                if !exists && request.flags.contains(SubscribeFlags::STRICT) {
                    return Err(WinError::EVT_QUERY_RESULT_INVALID_POSITION);
                }
                if exists { bookmark.record_id() } else { 0 }
            }
            (_, SubscribeFlags::TO_FUTURE_EVENTS) => channel.last_record_id,
            _ => 0,
        };

        trace!("Subscribed to {} after record {after}", request.channel);
        Ok(Box::new(MemorySubscription {
            log: Arc::clone(&self.inner),
            channel: request.channel.clone(),
            after,
            closed: false,
        }))
    }

    fn publisher_metadata(&self, provider: &str, _locale: u32) -> Result<ProviderMetadata, WinError> {
        self.inner.metadata_opens.fetch_add(1, Ordering::SeqCst);
        self.inner
            .read()
            .providers
            .get(provider)
            .cloned()
            .ok_or(WinError::EVT_PUBLISHER_METADATA_NOT_FOUND)
    }

    fn lookup_account(&self, sid: &Sid) -> Result<Account, WinError> {
        self.inner
            .read()
            .accounts
            .get(sid)
            .cloned()
            .ok_or(WinError::NONE_MAPPED)
    }
}

struct MemorySubscription {
    log: Arc<Inner>,
    channel: String,
    /// The last record id handed out (or skipped).
    after: u64,
    closed: bool,
}

impl Subscription for MemorySubscription {
    fn next(&mut self, max: usize) -> Result<Vec<RecordHandle>, WinError> {
        if self.closed {
            return Err(WinError::INVALID_HANDLE);
        }

        let mut state = self.log.write();
        if let Some(e) = state.take_fault(FaultPoint::Next) {
            return Err(e);
        }
        let bound = state.batch_bound;
        let channel = state
            .channels
            .get(&self.channel)
            .ok_or(WinError::INVALID_HANDLE)?;

        let after = self.after;
        let pending = channel
            .records
            .iter()
            .filter(|r| r.record_id > after)
            .take(max);

        if bound.is_some_and(|bound| max > bound) {
            if let Some(last) = pending.last() {
                debug!(
                    "Batch of {max} exceeds bound, dropping records up to {}",
                    last.record_id
                );
                self.after = last.record_id;
            }
            return Err(WinError::RPC_S_INVALID_BOUND);
        }

        let generation = channel.generation;
        let records: Vec<Arc<StoredRecord>> = pending.cloned().collect();
        let Some(last) = records.last() else {
            return Err(WinError::NO_MORE_ITEMS);
        };
        self.after = last.record_id;

        Ok(records
            .into_iter()
            .map(|record| MemoryRecordHandle::new(Arc::clone(&self.log), record, generation))
            .collect())
    }

    fn close(&mut self) -> Result<(), WinError> {
        if self.closed {
            return Err(WinError::INVALID_HANDLE);
        }
        self.closed = true;
        Ok(())
    }
}

struct MemoryRecordHandle {
    log: Arc<Inner>,
    record: Arc<StoredRecord>,
    generation: u64,
}

impl MemoryRecordHandle {
    fn new(log: Arc<Inner>, record: Arc<StoredRecord>, generation: u64) -> RecordHandle {
        log.open_handles.fetch_add(1, Ordering::SeqCst);
        Box::new(MemoryRecordHandle {
            log,
            record,
            generation,
        })
    }

    fn check(&self) -> Result<&LogRecord, WinError> {
        let state = self.log.read();
        match state.channels.get(&self.record.channel) {
            Some(ch) if ch.generation == self.generation => Ok(&self.record.record),
            _ => Err(WinError::INVALID_HANDLE),
        }
    }

    fn system_values(&self, record: &LogRecord) -> Vec<TypedValue> {
        let guid = |g: Option<Guid>| g.map_or(TypedValue::Null, TypedValue::Guid);
        SystemProperty::ALL
            .iter()
            .map(|property| match property {
                SystemProperty::ProviderName => TypedValue::String(record.provider.clone()),
                SystemProperty::ProviderGuid => guid(record.provider_guid),
                SystemProperty::EventId => TypedValue::UInt16(record.event_id),
                SystemProperty::Qualifiers => TypedValue::UInt16(record.qualifiers),
                SystemProperty::Level => TypedValue::Byte(record.level),
                SystemProperty::Task => TypedValue::UInt16(record.task),
                SystemProperty::Opcode => TypedValue::Byte(record.opcode),
                SystemProperty::Keywords => TypedValue::HexInt64(record.keywords),
                SystemProperty::TimeCreated => TypedValue::FileTime(record.time_created),
                SystemProperty::EventRecordId => TypedValue::UInt64(self.record.record_id),
                SystemProperty::ActivityId => guid(record.activity_id),
                SystemProperty::RelatedActivityId => guid(record.related_activity_id),
                SystemProperty::ProcessId => TypedValue::UInt32(record.process_id),
                SystemProperty::ThreadId => TypedValue::UInt32(record.thread_id),
                SystemProperty::Channel => TypedValue::String(self.record.channel.clone()),
                SystemProperty::Computer => TypedValue::String(record.computer.clone()),
                SystemProperty::UserId => record
                    .user
                    .clone()
                    .map_or(TypedValue::Null, TypedValue::Sid),
                SystemProperty::Version => TypedValue::Byte(record.version),
            })
            .collect()
    }

    /// The provider metadata to format with: the one passed in, else the registered one.
    fn provider_for(&self, provider: Option<&ProviderMetadata>) -> Option<ProviderMetadata> {
        match provider {
            Some(p) => Some(p.clone()),
            None => self
                .log
                .read()
                .providers
                .get(&self.record.record.provider)
                .cloned(),
        }
    }

    fn write_xml(
        &self,
        record: &LogRecord,
        provider: Option<&ProviderMetadata>,
    ) -> DeserializationResult<Vec<u8>> {
        let mut x = XmlEmitter::new();
        x.open("Event", &[("xmlns", EVENT_NAMESPACE)])?;

        x.open("System", &[])?;
        let guid = record.provider_guid.map(|g| g.to_string());
        let mut provider_attrs = vec![("Name", record.provider.as_str())];
        if let Some(guid) = &guid {
            provider_attrs.push(("Guid", guid.as_str()));
        }
        x.empty("Provider", &provider_attrs)?;
        let qualifiers = record.qualifiers.to_string();
        let mut id_attrs = Vec::new();
        if record.qualifiers != 0 {
            id_attrs.push(("Qualifiers", qualifiers.as_str()));
        }
        x.text("EventID", &id_attrs, &record.event_id.to_string())?;
        x.text("Version", &[], &record.version.to_string())?;
        x.text("Level", &[], &record.level.to_string())?;
        x.text("Task", &[], &record.task.to_string())?;
        x.text("Opcode", &[], &record.opcode.to_string())?;
        x.text("Keywords", &[], &format!("{:#x}", record.keywords))?;
        let time_created = record.time_created.to_string();
        x.empty("TimeCreated", &[("SystemTime", time_created.as_str())])?;
        x.text("EventRecordID", &[], &self.record.record_id.to_string())?;
        let activity = record.activity_id.map(|g| g.to_string());
        let related = record.related_activity_id.map(|g| g.to_string());
        let mut correlation = Vec::new();
        if let Some(a) = &activity {
            correlation.push(("ActivityID", a.as_str()));
        }
        if let Some(r) = &related {
            correlation.push(("RelatedActivityID", r.as_str()));
        }
        x.empty("Correlation", &correlation)?;
        let process_id = record.process_id.to_string();
        let thread_id = record.thread_id.to_string();
        x.empty(
            "Execution",
            &[
                ("ProcessID", process_id.as_str()),
                ("ThreadID", thread_id.as_str()),
            ],
        )?;
        x.text("Channel", &[], &self.record.channel)?;
        x.text("Computer", &[], &record.computer)?;
        match &record.user {
            Some(sid) => {
                let sid = sid.to_string();
                x.empty("Security", &[("UserID", sid.as_str())])?;
            }
            None => x.empty("Security", &[])?,
        }
        x.close("System")?;

        match &record.user_data {
            Some((name, namespace)) => {
                x.open("UserData", &[])?;
                x.open(name, &[("xmlns", namespace.as_str())])?;
                for (key, value) in &record.values {
                    x.text(key, &[], &value.to_string())?;
                }
                x.close(name)?;
                x.close("UserData")?;
            }
            None if !record.values.is_empty() => {
                x.open("EventData", &[])?;
                for (key, value) in &record.values {
                    if key.is_empty() {
                        x.text("Data", &[], &value.to_string())?;
                    } else {
                        x.text("Data", &[("Name", key.as_str())], &value.to_string())?;
                    }
                }
                x.close("EventData")?;
            }
            None => {}
        }

        let info = record
            .rendering_info
            .clone()
            .or_else(|| provider.map(|p| self.rendering_info(record, p)));
        if let Some(info) = info {
            x.open("RenderingInfo", &[("Culture", "en-US")])?;
            x.text("Message", &[], &info.message)?;
            x.text("Level", &[], &info.level)?;
            x.text("Task", &[], &info.task)?;
            x.text("Opcode", &[], &info.opcode)?;
            x.text("Channel", &[], &self.record.channel)?;
            x.text("Provider", &[], &record.provider)?;
            x.open("Keywords", &[])?;
            for keyword in &info.keywords {
                x.text("Keyword", &[], keyword)?;
            }
            x.close("Keywords")?;
            x.close("RenderingInfo")?;
        }

        x.close("Event")?;
        Ok(x.finish())
    }

    fn rendering_info(&self, record: &LogRecord, provider: &ProviderMetadata) -> RenderingInfo {
        let mut names = Event {
            level_raw: record.level,
            task_raw: record.task,
            opcode_raw: Some(record.opcode),
            keywords_raw: record.keywords,
            ..Default::default()
        };
        enrich_raw_values_with_names(Some(&provider.win_meta()), &mut names);
        RenderingInfo {
            message: format_with(record, provider, None).unwrap_or_default(),
            level: names.level,
            task: names.task,
            opcode: names.opcode,
            keywords: names.keywords,
        }
    }
}

fn format_with(
    record: &LogRecord,
    provider: &ProviderMetadata,
    inserts: Option<&[String]>,
) -> Result<String, WinError> {
    let def = provider
        .event(u32::from(record.event_id))
        .filter(|def| !def.message.is_empty())
        .ok_or(WinError::EVT_MESSAGE_NOT_FOUND)?;
    let template = MessageTemplate::compile(&def.message);
    Ok(match inserts {
        Some(inserts) => template.render(inserts),
        None => {
            let values: Vec<String> = record.values.iter().map(|(_, v)| v.to_string()).collect();
            template.render(&values)
        }
    })
}

impl Drop for MemoryRecordHandle {
    fn drop(&mut self) {
        self.log.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EventHandle for MemoryRecordHandle {
    fn render_values(&self, context: RenderContext, buf: &mut Vec<u8>) -> Result<usize, WinError> {
        let record = self.check()?;
        let values = match context {
            RenderContext::System => self.system_values(record),
            RenderContext::User => record.values.iter().map(|(_, v)| v.clone()).collect(),
        };
        let mut writer = VariantWriter::new();
        for value in &values {
            writer.push(value);
        }
        Ok(writer.finish(buf))
    }

    fn render_xml(
        &self,
        provider: Option<&ProviderMetadata>,
        buf: &mut Vec<u8>,
    ) -> Result<(), WinError> {
        let record = self.check()?;
        let xml = self.write_xml(record, provider).map_err(|e| {
            debug!("failed to write xml for record {}: {e}", self.record.record_id);
            WinError::EVT_INVALID_EVENT_DATA
        })?;
        buf.clear();
        buf.extend_from_slice(&xml);
        Ok(())
    }

    fn format_message(
        &self,
        provider: Option<&ProviderMetadata>,
        inserts: Option<&[String]>,
    ) -> Result<String, WinError> {
        let record = self.check()?;
        if provider.is_none() {
            if let Some(info) = &record.rendering_info {
                return Ok(info.message.clone());
            }
        }
        let provider = self
            .provider_for(provider)
            .ok_or(WinError::EVT_PUBLISHER_METADATA_NOT_FOUND)?;
        format_with(record, &provider, inserts)
    }

    fn position(&self) -> Result<(String, u64), WinError> {
        self.check()?;
        Ok((self.record.channel.clone(), self.record.record_id))
    }
}

/// Event XML written through a `quick_xml::Writer`.
struct XmlEmitter {
    writer: Writer<Vec<u8>>,
}

impl XmlEmitter {
    fn new() -> Self {
        XmlEmitter {
            writer: Writer::new(Vec::new()),
        }
    }

    fn element<'n>(name: &'n str, attrs: &[(&str, &str)]) -> BytesStart<'n> {
        BytesStart::new(name).with_attributes(attrs.iter().copied())
    }

    fn open(&mut self, name: &str, attrs: &[(&str, &str)]) -> DeserializationResult<()> {
        self.writer.write_event(XmlEvent::Start(Self::element(name, attrs)))?;
        Ok(())
    }

    fn empty(&mut self, name: &str, attrs: &[(&str, &str)]) -> DeserializationResult<()> {
        self.writer.write_event(XmlEvent::Empty(Self::element(name, attrs)))?;
        Ok(())
    }

    fn text(
        &mut self,
        name: &str,
        attrs: &[(&str, &str)],
        text: &str,
    ) -> DeserializationResult<()> {
        self.open(name, attrs)?;
        self.writer.write_event(XmlEvent::Text(BytesText::new(text)))?;
        self.close(name)
    }

    fn close(&mut self, name: &str) -> DeserializationResult<()> {
        self.writer.write_event(XmlEvent::End(BytesEnd::new(name)))?;
        Ok(())
    }

    fn finish(self) -> Vec<u8> {
        self.writer.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookmark::Bookmark;
    use crate::event_xml::unmarshal_event_xml;
    use crate::variant::VariantArray;
    use pretty_assertions::assert_eq;

    fn log_with(n: usize) -> MemoryEventLog {
        let log = MemoryEventLog::new();
        for i in 0..n {
            log.append(
                "Application",
                LogRecord::new("TestProvider", 1000).value("Index", TypedValue::UInt32(i as u32)),
            );
        }
        log
    }

    fn ids(handles: &[RecordHandle]) -> Vec<u64> {
        handles.iter().map(|h| h.position().unwrap().1).collect()
    }

    #[test]
    fn test_subscribe_and_read() {
        let log = log_with(5);
        let mut sub = log
            .subscribe(&SubscribeRequest::new("Application", Position::Fresh))
            .unwrap();
        assert_eq!(ids(&sub.next(3).unwrap()), vec![1, 2, 3]);
        let rest = sub.next(10).unwrap();
        assert_eq!(ids(&rest), vec![4, 5]);
        assert_eq!(log.open_handles(), 2);
        drop(rest);
        assert_eq!(log.open_handles(), 0);
        assert_eq!(sub.next(10).err(), Some(WinError::NO_MORE_ITEMS));
    }

    #[test]
    fn test_bookmark_positions() {
        let log = log_with(5);
        let request = SubscribeRequest::new(
            "Application",
            Position::Bookmark(Bookmark::new("Application", 2)),
        );
        let mut sub = log.subscribe(&request).unwrap();
        assert_eq!(ids(&sub.next(10).unwrap()), vec![3, 4, 5]);

        let gone = SubscribeRequest::new(
            "Application",
            Position::Bookmark(Bookmark::new("Application", 42)),
        );
        assert_eq!(
            log.subscribe(&gone).err(),
            Some(WinError::EVT_QUERY_RESULT_INVALID_POSITION)
        );
        assert_eq!(
            log.subscribe(&SubscribeRequest::new("Nope", Position::Fresh))
                .err(),
            Some(WinError::EVT_CHANNEL_NOT_FOUND)
        );
    }

    #[test]
    fn test_batch_bound_consumes_records() {
        let log = log_with(6);
        log.set_batch_bound(Some(2));
        let mut sub = log
            .subscribe(&SubscribeRequest::new("Application", Position::Fresh))
            .unwrap();
        assert_eq!(sub.next(4).err(), Some(WinError::RPC_S_INVALID_BOUND));
        assert_eq!(ids(&sub.next(2).unwrap()), vec![5, 6]);
    }

    #[test]
    fn test_clear_invalidates_handles() {
        let log = log_with(2);
        let mut sub = log
            .subscribe(&SubscribeRequest::new("Application", Position::Fresh))
            .unwrap();
        let handles = sub.next(10).unwrap();
        log.clear("Application");
        assert_eq!(handles[0].position().err(), Some(WinError::INVALID_HANDLE));
        assert_eq!(log.record_count("Application"), 0);

        // New records keep counting up.
        assert_eq!(log.append("Application", LogRecord::new("TestProvider", 1)), 3);
    }

    #[test]
    fn test_faults() {
        let log = log_with(1);
        log.inject_error(FaultPoint::Next, WinError::RPC_S_SERVER_UNAVAILABLE);
        log.deny_channel("Security");
        log.create_channel("Security");

        let mut sub = log
            .subscribe(&SubscribeRequest::new("Application", Position::Fresh))
            .unwrap();
        assert_eq!(
            sub.next(1).err(),
            Some(WinError::RPC_S_SERVER_UNAVAILABLE)
        );
        assert_eq!(ids(&sub.next(1).unwrap()), vec![1]);
        assert_eq!(
            log.subscribe(&SubscribeRequest::new("Security", Position::Fresh))
                .err(),
            Some(WinError::ACCESS_DENIED)
        );
    }

    #[test]
    fn test_rendered_values_and_xml() {
        let log = MemoryEventLog::new();
        log.append(
            "Application",
            LogRecord::new("TestProvider", 7)
                .user("S-1-5-18".parse().unwrap())
                .value("Name", TypedValue::String("a <b>".to_string()))
                .value("", TypedValue::UInt16(9)),
        );
        let mut sub = log
            .subscribe(&SubscribeRequest::new("Application", Position::Fresh))
            .unwrap();
        let handle = sub.next(1).unwrap().remove(0);

        let mut buf = Vec::new();
        let count = handle.render_values(RenderContext::System, &mut buf).unwrap();
        assert_eq!(count, SystemProperty::COUNT);
        let system = VariantArray::new(&buf, count).unwrap();
        assert_eq!(
            system.value(SystemProperty::EventRecordId as usize).unwrap(),
            TypedValue::UInt64(1)
        );

        handle.render_xml(None, &mut buf).unwrap();
        let event = unmarshal_event_xml(&buf).unwrap();
        assert_eq!(event.provider.name, "TestProvider");
        assert_eq!(event.event_id, 7);
        assert_eq!(event.record_id, 1);
        assert_eq!(event.channel, "Application");
        assert_eq!(event.user.identifier, "S-1-5-18");
        assert_eq!(event.event_data[0].value, "a <b>");
        assert_eq!(event.event_data[1].key, "");
        assert!(event.message.is_empty());
    }

    #[test]
    fn test_xml_escapes_text_and_attributes() {
        let log = MemoryEventLog::new();
        log.append(
            "Setup",
            LogRecord::new("Vendor & \"Co\"", 3)
                .user_data("Install", "urn:vendor")
                .value("Package", TypedValue::String("<kb&1>".to_owned()))
                .rendering_info(RenderingInfo {
                    message: "Installed <kb&1>".to_owned(),
                    keywords: vec!["Classic".to_owned()],
                    ..Default::default()
                }),
        );
        let handle = log
            .subscribe(&SubscribeRequest::new("Setup", Position::Fresh))
            .unwrap()
            .next(1)
            .unwrap()
            .remove(0);

        let mut buf = Vec::new();
        handle.render_xml(None, &mut buf).unwrap();
        let xml = String::from_utf8(buf.clone()).unwrap();
        assert!(xml.starts_with(&format!("<Event xmlns=\"{EVENT_NAMESPACE}\">")));
        assert!(xml.contains("&lt;kb&amp;1&gt;"));
        assert!(xml.ends_with("</Event>"));

        let event = unmarshal_event_xml(&buf).unwrap();
        assert_eq!(event.provider.name, "Vendor & \"Co\"");
        let user_data = event.user_data.unwrap();
        assert_eq!(user_data.name, "Install");
        assert_eq!(user_data.pairs[0].value, "<kb&1>");
        assert_eq!(event.message, "Installed <kb&1>");
        assert_eq!(event.keywords, vec!["Classic".to_owned()]);
    }

    #[test]
    fn test_import_export_document() {
        let doc = r#"<Events>
<Event><System><Provider Name="Fwd"/><EventID>10</EventID><Level>2</Level><EventRecordID>500</EventRecordID><Channel>ForwardedEvents</Channel></System><EventData><Data Name="x">1</Data></EventData><RenderingInfo><Message>Forwarded text</Message><Level>Error</Level></RenderingInfo></Event>
<Event><System><Provider Name="Fwd"/><EventID>11</EventID><EventRecordID>400</EventRecordID></System></Event>
</Events>"#;
        let log = MemoryEventLog::new();
        assert_eq!(log.import_xml("ForwardedEvents", doc.as_bytes()).unwrap(), 2);

        let mut sub = log
            .subscribe(&SubscribeRequest::new("ForwardedEvents", Position::Fresh))
            .unwrap();
        let handles = sub.next(10).unwrap();
        assert_eq!(ids(&handles), vec![500, 501]);
        assert_eq!(
            handles[0].format_message(None, None).unwrap(),
            "Forwarded text"
        );
        assert_eq!(
            handles[1].format_message(None, None).err(),
            Some(WinError::EVT_PUBLISHER_METADATA_NOT_FOUND)
        );
    }
}
