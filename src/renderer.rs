//! Turning record handles into [`Event`]s.
//!
//! Two renderers implement [`EventRenderer`]:
//!
//! * [`Renderer`] decodes the record's `EVT_VARIANT` arrays and names the values with the
//!   provider's metadata, formatting the message itself from the cached templates.
//! * [`XmlRenderer`] asks the event log for the record's XML (including `RenderingInfo`) and
//!   decodes that. It is the natural choice for forwarded events, which carry their own
//!   rendered text.
//!
//! Both deliver the event whenever the system properties could be read, attaching anything else
//! that went wrong to [`RenderedEvent::errors`] and [`Event::render_errors`].

use std::sync::Arc;

use log::{debug, warn};

use crate::api::{EventHandle, Session};
use crate::err::{DeserializationError, EventLogError, Result, WinError};
use crate::event::{Event, KeyValue, UserData};
use crate::event_xml::unmarshal_event_xml;
use crate::publisher::{
    EventMessage, EventMetadata, ProviderMetadata, PublisherMetadataCache, PublisherMetadataStore,
};
use crate::sid::Sid;
use crate::template::expand_parameter_messages;
use crate::variant::{RenderContext, SystemProperty, TypedValue, VariantArray};
use crate::winmeta::enrich_raw_values_with_names;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderConfig {
    /// Records come from a `ForwardedEvents` style channel; local provider metadata is not used
    /// to format their messages.
    pub forwarded: bool,
    /// Keep the record's XML in [`RenderedEvent::xml`].
    pub include_xml: bool,
}

/// A rendered record and the recoverable problems hit along the way.
#[derive(Debug)]
pub struct RenderedEvent {
    pub event: Event,
    pub xml: Option<String>,
    pub errors: Vec<EventLogError>,
}

pub trait EventRenderer: Send {
    /// Render one record.
    ///
    /// Fails only when the record cannot be delivered at all.
    fn render(&mut self, handle: &dyn EventHandle) -> Result<RenderedEvent>;
}

fn finish(mut event: Event, xml: Option<String>, errors: Vec<EventLogError>) -> RenderedEvent {
    event
        .render_errors
        .extend(errors.iter().map(ToString::to_string));
    RenderedEvent { event, xml, errors }
}

fn render_xml_string(
    handle: &dyn EventHandle,
    provider: Option<&ProviderMetadata>,
    buf: &mut Vec<u8>,
) -> std::result::Result<String, WinError> {
    buf.clear();
    handle.render_xml(provider, buf)?;
    Ok(String::from_utf8_lossy(buf).into_owned())
}

fn populate_account(
    session: &dyn Session,
    sid: &Sid,
    event: &mut Event,
) -> std::result::Result<(), EventLogError> {
    match session.lookup_account(sid) {
        Ok(account) => {
            event.user.name = account.name;
            event.user.domain = account.domain;
            event.user.sid_type = Some(account.sid_type);
            Ok(())
        }
        // Accounts of other machines or deleted accounts are not an error.
        Err(WinError::NONE_MAPPED) => {
            debug!("SID {sid} has no account mapping");
            Ok(())
        }
        Err(source) => Err(EventLogError::AccountLookup {
            sid: sid.to_string(),
            source,
        }),
    }
}

/// Renders records from their binary value arrays.
pub struct Renderer {
    session: Arc<dyn Session>,
    cache: Arc<PublisherMetadataCache>,
    conf: RenderConfig,
    system_buf: Vec<u8>,
    user_buf: Vec<u8>,
    xml_buf: Vec<u8>,
}

impl Renderer {
    pub fn new(
        session: Arc<dyn Session>,
        cache: Arc<PublisherMetadataCache>,
        conf: RenderConfig,
    ) -> Self {
        Renderer {
            session,
            cache,
            conf,
            system_buf: Vec::new(),
            user_buf: Vec::new(),
            xml_buf: Vec::new(),
        }
    }

    fn render_system(
        &mut self,
        handle: &dyn EventHandle,
        event: &mut Event,
    ) -> Result<Option<Sid>> {
        let count = handle
            .render_values(RenderContext::System, &mut self.system_buf)
            .map_err(|e| EventLogError::api("EvtRender", e))?;
        if count < SystemProperty::COUNT {
            return Err(DeserializationError::MissingProperties {
                count,
                expected: SystemProperty::COUNT,
            }
            .into());
        }

        let values = VariantArray::new(&self.system_buf, count)?;
        let mut user = None;
        for property in SystemProperty::ALL {
            let value = values.value(property as usize)?;
            if let Some(sid) = apply_system_property(event, property, value)? {
                user = Some(sid);
            }
        }
        Ok(user)
    }

    /// Decode the user values, returning their display strings and fingerprint.
    fn render_user(
        &mut self,
        handle: &dyn EventHandle,
        store: &PublisherMetadataStore,
        event: &Event,
    ) -> Result<(Vec<String>, u64)> {
        let count = handle
            .render_values(RenderContext::User, &mut self.user_buf)
            .map_err(|e| EventLogError::api("EvtRender", e))?;
        if count == 0 {
            return Ok((Vec::new(), 0));
        }

        let array = VariantArray::new(&self.user_buf, count)?;
        let values = (0..count)
            .map(|i| {
                let value = array.value(i).unwrap_or_else(|e| {
                    warn!(
                        "Failed to read event data value {i} of event {} ({}), using null: {e}",
                        event.event_id, event.provider.name
                    );
                    TypedValue::Null
                });
                match value.as_str() {
                    Some(s) => expand_parameter_messages(s, |id| store.message_by_id(id))
                        .into_owned(),
                    None => value.to_string(),
                }
            })
            .collect();
        Ok((values, array.fingerprint()))
    }

    fn format_message(
        &self,
        handle: &dyn EventHandle,
        store: &PublisherMetadataStore,
        em: Option<&EventMetadata>,
        values: &[String],
        event_id: u32,
    ) -> std::result::Result<String, WinError> {
        match em.map(|em| &em.message) {
            Some(EventMessage::Static(text)) => return Ok(text.clone()),
            Some(EventMessage::Template(template)) => return Ok(template.render(values)),
            _ => {}
        }

        debug!("Falling back to EvtFormatMessage for event ID {event_id}");
        let provider = if self.conf.forwarded {
            None
        } else {
            store.metadata()
        };
        handle.format_message(provider, None)
    }
}

/// Associate parameter names with the values.
fn add_event_data(em: Option<&EventMetadata>, values: Vec<String>, event: &mut Event) {
    if values.is_empty() {
        return;
    }

    match em {
        None => warn!(
            "Event metadata not found for event {} ({})",
            event.event_id, event.provider.name
        ),
        Some(em) if em.params.len() != values.len() => warn!(
            "The number of event data parameters ({}) doesn't match the number of parameters \
             in the template ({}) for event {} ({}), template version {}, event version {}",
            values.len(),
            em.params.len(),
            event.event_id,
            event.provider.name,
            em.version,
            event.version
        ),
        Some(_) => {}
    }

    let params = em.map(|em| em.params.as_slice()).unwrap_or_default();
    let pairs = values
        .into_iter()
        .enumerate()
        .map(|(i, value)| {
            let key = params
                .get(i)
                .filter(|name| !name.is_empty())
                .cloned()
                .unwrap_or_else(|| format!("param{i}"));
            KeyValue { key, value }
        })
        .collect();

    match em.and_then(|em| em.user_data_name.as_ref()) {
        Some(name) => {
            event.user_data = Some(UserData {
                name: name.clone(),
                namespace: String::new(),
                pairs,
            })
        }
        None => event.event_data = pairs,
    }
}

fn unexpected(property: SystemProperty, value: &TypedValue) -> DeserializationError {
    DeserializationError::UnexpectedPropertyType {
        property: property.name(),
        found: value.variant_type().name(),
    }
}

/// Store one system property; returns the user SID when `property` is `UserID`.
fn apply_system_property(
    event: &mut Event,
    property: SystemProperty,
    value: TypedValue,
) -> std::result::Result<Option<Sid>, DeserializationError> {
    if value == TypedValue::Null {
        return Ok(None);
    }

    match (property, value) {
        (SystemProperty::ProviderName, TypedValue::String(s)) => event.provider.name = s,
        (SystemProperty::ProviderGuid, TypedValue::Guid(g)) => event.provider.guid = g.to_string(),
        (SystemProperty::EventId, TypedValue::UInt16(v)) => event.event_id = u32::from(v),
        (SystemProperty::Qualifiers, TypedValue::UInt16(v)) => event.qualifiers = v,
        (SystemProperty::Level, TypedValue::Byte(v)) => event.level_raw = v,
        (SystemProperty::Task, TypedValue::UInt16(v)) => event.task_raw = v,
        (SystemProperty::Opcode, TypedValue::Byte(v)) => event.opcode_raw = Some(v),
        (SystemProperty::Keywords, TypedValue::HexInt64(v)) => event.keywords_raw = v,
        (SystemProperty::TimeCreated, TypedValue::FileTime(ts)) => event.time_created = Some(ts),
        (SystemProperty::EventRecordId, TypedValue::UInt64(v)) => event.record_id = v,
        (SystemProperty::ActivityId, TypedValue::Guid(g)) => {
            if !g.is_nil() {
                event.correlation.activity_id = g.to_string()
            }
        }
        (SystemProperty::RelatedActivityId, TypedValue::Guid(g)) => {
            if !g.is_nil() {
                event.correlation.related_activity_id = g.to_string()
            }
        }
        (SystemProperty::ProcessId, TypedValue::UInt32(v)) => event.execution.process_id = v,
        (SystemProperty::ThreadId, TypedValue::UInt32(v)) => event.execution.thread_id = v,
        (SystemProperty::Channel, TypedValue::String(s)) => event.channel = s,
        (SystemProperty::Computer, TypedValue::String(s)) => event.computer = s,
        (SystemProperty::UserId, TypedValue::Sid(sid)) => {
            event.user.identifier = sid.to_string();
            return Ok(Some(sid));
        }
        (SystemProperty::Version, TypedValue::Byte(v)) => event.version = v,
        (property, value) => return Err(unexpected(property, &value)),
    }
    Ok(None)
}

impl EventRenderer for Renderer {
    fn render(&mut self, handle: &dyn EventHandle) -> Result<RenderedEvent> {
        let mut event = Event::default();
        let user_sid = self
            .render_system(handle, &mut event)
            .map_err(|e| EventLogError::RenderSystem {
                source: Box::new(e),
            })?;

        // From here on the event is always delivered.
        let mut errors = Vec::new();

        let (store, err) = self.cache.get(&event.provider.name);
        errors.extend(err);

        enrich_raw_values_with_names(Some(store.win_meta()), &mut event);

        let (values, fingerprint) = match self.render_user(handle, &store, &event) {
            Ok(rendered) => rendered,
            Err(e) => {
                errors.push(EventLogError::RenderUserData {
                    source: Box::new(e),
                });
                (Vec::new(), 0)
            }
        };

        let em = store.resolve(event.event_id as u16, fingerprint, handle);

        match self.format_message(handle, &store, em.as_deref(), &values, event.event_id) {
            Ok(message) => event.message = message,
            Err(source) => errors.push(EventLogError::FormatMessage { source }),
        }

        add_event_data(em.as_deref(), values, &mut event);

        if let Some(sid) = user_sid {
            if let Err(e) = populate_account(self.session.as_ref(), &sid, &mut event) {
                errors.push(e);
            }
        }

        let xml = if self.conf.include_xml {
            let provider = if self.conf.forwarded {
                None
            } else {
                store.metadata()
            };
            match render_xml_string(handle, provider, &mut self.xml_buf) {
                Ok(xml) => Some(xml),
                Err(e) => {
                    errors.push(EventLogError::api("EvtRender", e));
                    None
                }
            }
        } else {
            None
        };

        Ok(finish(event, xml, errors))
    }
}

/// Renders records through their event XML.
pub struct XmlRenderer {
    session: Arc<dyn Session>,
    cache: Arc<PublisherMetadataCache>,
    conf: RenderConfig,
    system_buf: Vec<u8>,
    xml_buf: Vec<u8>,
}

impl XmlRenderer {
    pub fn new(
        session: Arc<dyn Session>,
        cache: Arc<PublisherMetadataCache>,
        conf: RenderConfig,
    ) -> Self {
        XmlRenderer {
            session,
            cache,
            conf,
            system_buf: Vec::new(),
            xml_buf: Vec::new(),
        }
    }

    /// The provider name, needed to pick metadata before the XML is rendered.
    fn provider_name(&mut self, handle: &dyn EventHandle) -> Option<String> {
        let count = handle
            .render_values(RenderContext::System, &mut self.system_buf)
            .ok()?;
        let values = VariantArray::new(&self.system_buf, count).ok()?;
        match values.value(SystemProperty::ProviderName as usize).ok()? {
            TypedValue::String(name) => Some(name),
            _ => None,
        }
    }
}

impl EventRenderer for XmlRenderer {
    fn render(&mut self, handle: &dyn EventHandle) -> Result<RenderedEvent> {
        let mut errors = Vec::new();

        // Forwarded records carry their own rendering info.
        let store = if self.conf.forwarded {
            None
        } else {
            self.provider_name(handle).map(|name| {
                let (store, err) = self.cache.get(&name);
                errors.extend(err);
                store
            })
        };

        let provider = store.as_ref().and_then(|s| s.metadata());
        let render_err = match render_xml_string(handle, provider, &mut self.xml_buf) {
            Ok(_) => None,
            Err(e) => Some(EventLogError::api("EvtRender", e)),
        };

        let mut event = match unmarshal_event_xml(&self.xml_buf) {
            Ok(event) => event,
            Err(e) => {
                errors.push(e.into());
                Event::default()
            }
        };

        if let Ok(sid) = event.user.identifier.parse::<Sid>() {
            if let Err(e) = populate_account(self.session.as_ref(), &sid, &mut event) {
                debug!("{e}");
            }
        }

        if event.render_error_code != 0 {
            let code = WinError(event.render_error_code);
            event.render_errors.push(code.to_string());
        } else if let Some(e) = render_err {
            errors.push(e);
        }

        let store = match store {
            _ if self.conf.forwarded || event.provider.name.is_empty() => None,
            Some(store) if store.provider() == event.provider.name => Some(store),
            _ => {
                let (store, err) = self.cache.get(&event.provider.name);
                errors.extend(err);
                Some(store)
            }
        };

        enrich_raw_values_with_names(store.as_ref().map(|s| s.win_meta()), &mut event);

        if event.message.is_empty() && !self.conf.forwarded {
            match handle.format_message(store.as_ref().and_then(|s| s.metadata()), None) {
                Ok(message) => event.message = message,
                Err(source) => errors.push(EventLogError::FormatMessage { source }),
            }
        }

        let xml = self
            .conf
            .include_xml
            .then(|| String::from_utf8_lossy(&self.xml_buf).into_owned());
        Ok(finish(event, xml, errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Position, RecordHandle, SubscribeRequest};
    use crate::ensure_env_logger_initialized;
    use crate::memlog::{LogRecord, MemoryEventLog, RenderingInfo};
    use crate::publisher::{EventDefinition, MetadataEntry};
    use crate::sid::{Account, SidType};
    use pretty_assertions::assert_eq;

    const USER_SID: &str = "S-1-5-21-3541430928-2051711210-1391384369-1001";

    const LOGON_TEMPLATE: &str = r#"<template xmlns="http://schemas.microsoft.com/win/2004/08/events">
  <data name="SubjectUserName" inType="win:UnicodeString" outType="xs:string"/>
  <data name="LogonType" inType="win:UInt32" outType="xs:unsignedInt"/>
  <data name="ElevatedToken" inType="win:UnicodeString" outType="xs:string"/>
</template>"#;

    fn security_provider() -> ProviderMetadata {
        let mut provider = ProviderMetadata::new("Microsoft-Windows-Security-Auditing");
        provider
            .tasks
            .push(MetadataEntry::new("SE_ADT_LOGON", 12544, "Logon"));
        provider.events.push(EventDefinition {
            id: 4624,
            task: 12544,
            message: "An account %1 logged on (type %2, elevated %3).".to_owned(),
            template: LOGON_TEMPLATE.to_owned(),
            ..Default::default()
        });
        provider.messages.insert(1842, "Yes".to_owned());
        provider
    }

    fn logon_record() -> LogRecord {
        LogRecord::new("Microsoft-Windows-Security-Auditing", 4624)
            .task(12544)
            .keywords(0x8020_0000_0000_0000)
            .user(USER_SID.parse().unwrap())
            .value("SubjectUserName", TypedValue::String("alice".to_owned()))
            .value("LogonType", TypedValue::UInt32(2))
            .value("ElevatedToken", TypedValue::String("%%1842".to_owned()))
    }

    fn handles(log: &MemoryEventLog, channel: &str) -> Vec<RecordHandle> {
        log.subscribe(&SubscribeRequest::new(channel, Position::Fresh))
            .unwrap()
            .next(100)
            .unwrap()
    }

    fn setup(log: &MemoryEventLog) -> (Arc<dyn Session>, Arc<PublisherMetadataCache>) {
        let session: Arc<dyn Session> = Arc::new(log.clone());
        let cache = Arc::new(PublisherMetadataCache::new(Arc::clone(&session), 0));
        (session, cache)
    }

    #[test]
    fn test_render_with_provider_metadata() {
        ensure_env_logger_initialized();
        let log = MemoryEventLog::new();
        log.register_provider(security_provider());
        log.register_account(
            USER_SID.parse().unwrap(),
            Account {
                name: "alice".to_owned(),
                domain: "CORP".to_owned(),
                sid_type: SidType::User,
            },
        );
        log.append("Security", logon_record());

        let (session, cache) = setup(&log);
        let mut renderer = Renderer::new(
            session,
            cache,
            RenderConfig {
                forwarded: false,
                include_xml: true,
            },
        );

        let handle = handles(&log, "Security").pop().unwrap();
        let rendered = renderer.render(handle.as_ref()).unwrap();
        assert!(rendered.errors.is_empty(), "{:?}", rendered.errors);

        let event = rendered.event;
        assert_eq!(event.event_id, 4624);
        assert_eq!(event.record_id, 1);
        assert_eq!(event.channel, "Security");
        assert_eq!(event.level, "Information");
        assert_eq!(event.task, "Logon");
        assert_eq!(event.keywords, vec!["Audit Success".to_owned()]);
        assert_eq!(
            event.message,
            "An account alice logged on (type 2, elevated Yes)."
        );
        assert_eq!(
            event.event_data,
            vec![
                KeyValue::new("SubjectUserName", "alice"),
                KeyValue::new("LogonType", "2"),
                KeyValue::new("ElevatedToken", "Yes"),
            ]
        );
        assert_eq!(event.user.identifier, USER_SID);
        assert_eq!(event.user.name, "alice");
        assert_eq!(event.user.domain, "CORP");
        assert_eq!(event.user.sid_type, Some(SidType::User));
        assert!(event.render_errors.is_empty());

        let xml = rendered.xml.unwrap();
        assert!(xml.contains("<RenderingInfo"));
        assert!(xml.contains("<Task>Logon</Task>"));
    }

    #[test]
    fn test_unnamed_values_without_metadata() {
        let log = MemoryEventLog::new();
        log.append(
            "Application",
            LogRecord::new("Unregistered", 7)
                .value("", TypedValue::String("first".to_owned()))
                .value("", TypedValue::UInt64(42)),
        );

        let (session, cache) = setup(&log);
        let mut renderer = Renderer::new(session, cache, RenderConfig::default());
        let handle = handles(&log, "Application").pop().unwrap();
        let rendered = renderer.render(handle.as_ref()).unwrap();

        assert_eq!(
            rendered.event.event_data,
            vec![
                KeyValue::new("param0", "first"),
                KeyValue::new("param1", "42"),
            ]
        );
        assert!(rendered.event.message.is_empty());
        assert!(rendered
            .errors
            .iter()
            .any(|e| matches!(e, EventLogError::PublisherMetadata { .. })));
        assert!(rendered.errors.iter().any(|e| matches!(
            e,
            EventLogError::FormatMessage {
                source: WinError::EVT_PUBLISHER_METADATA_NOT_FOUND
            }
        )));
        assert_eq!(rendered.event.render_errors.len(), rendered.errors.len());
    }

    #[test]
    fn test_released_handle_fails_system_render() {
        let log = MemoryEventLog::new();
        log.append("Application", LogRecord::new("Unregistered", 1));
        let handle = handles(&log, "Application").pop().unwrap();
        log.clear("Application");

        let (session, cache) = setup(&log);
        let mut renderer = Renderer::new(session, cache, RenderConfig::default());
        let err = renderer.render(handle.as_ref()).unwrap_err();
        assert!(matches!(err, EventLogError::RenderSystem { .. }));
        assert_eq!(err.win_error(), Some(WinError::INVALID_HANDLE));
    }

    #[test]
    fn test_xml_renderer_with_provider_metadata() {
        let log = MemoryEventLog::new();
        log.register_provider(security_provider());
        log.append("Security", logon_record());

        let (session, cache) = setup(&log);
        let mut renderer = XmlRenderer::new(session, cache, RenderConfig::default());
        let handle = handles(&log, "Security").pop().unwrap();
        let rendered = renderer.render(handle.as_ref()).unwrap();
        assert!(rendered.errors.is_empty(), "{:?}", rendered.errors);
        assert!(rendered.xml.is_none());

        let event = rendered.event;
        assert_eq!(event.provider.name, "Microsoft-Windows-Security-Auditing");
        assert_eq!(event.task, "Logon");
        assert_eq!(
            event.message,
            "An account alice logged on (type 2, elevated %%1842)."
        );
        assert_eq!(event.event_data[1], KeyValue::new("LogonType", "2"));
    }

    #[test]
    fn test_forwarded_event_uses_its_own_rendering_info() {
        let log = MemoryEventLog::new();
        log.append(
            "ForwardedEvents",
            LogRecord::new("Remote-Provider", 300)
                .level(3)
                .computer("dc01.corp.example")
                .value("Detail", TypedValue::String("disk full".to_owned()))
                .rendering_info(RenderingInfo {
                    message: "The disk is full.".to_owned(),
                    level: "Warnung".to_owned(),
                    task: "Speicher".to_owned(),
                    opcode: "Info".to_owned(),
                    keywords: vec!["Klassisch".to_owned()],
                }),
        );

        let (session, cache) = setup(&log);
        let conf = RenderConfig {
            forwarded: true,
            include_xml: true,
        };
        let mut renderer = XmlRenderer::new(session, Arc::clone(&cache), conf);
        let handle = handles(&log, "ForwardedEvents").pop().unwrap();
        let rendered = renderer.render(handle.as_ref()).unwrap();
        assert!(rendered.errors.is_empty(), "{:?}", rendered.errors);

        let event = rendered.event;
        assert_eq!(event.message, "The disk is full.");
        assert_eq!(event.level, "Warnung");
        assert_eq!(event.task, "Speicher");
        assert_eq!(event.keywords, vec!["Klassisch".to_owned()]);
        assert_eq!(event.computer, "dc01.corp.example");
        assert_eq!(event.event_data, vec![KeyValue::new("Detail", "disk full")]);
        assert!(rendered.xml.unwrap().contains("The disk is full."));
        assert_eq!(log.publisher_metadata_opens(), 0);
        assert!(cache.is_empty());
    }
}
