//! Provider (publisher) metadata and the caches built on top of it.
//!
//! A [`PublisherMetadataStore`] holds everything needed to give names to one provider's
//! events: its keyword/opcode/level/task tables, the parameter names and message of every event
//! it declares, and a cache of per-shape [`EventMetadata`] keyed by event id and
//! [`Fingerprint`]. Stores are shared through a [`PublisherMetadataCache`].

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, trace};

use crate::api::{EventHandle, Session};
use crate::err::{DeserializationResult, EventLogError};
use crate::event_xml::{XmlElement, parse_document, unmarshal_event_xml};
use crate::guid::Guid;
use crate::template::MessageTemplate;
use crate::utils::FastMap;
use crate::variant::Fingerprint;
use crate::winmeta::WinMeta;

/// Providers reference at most 99 inserts (`%1`..`%99`).
const MAX_INSERT_STRINGS: usize = 99;

/// One keyword, opcode, level or task a provider declares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataEntry {
    pub name: String,
    pub value: u64,
    pub message: String,
}

impl MetadataEntry {
    pub fn new(name: impl Into<String>, value: u64, message: impl Into<String>) -> Self {
        MetadataEntry {
            name: name.into(),
            value,
            message: message.into(),
        }
    }

    /// The localized message, or the symbolic name if there is none.
    pub fn display_name(&self) -> &str {
        if self.message.is_empty() {
            &self.name
        } else {
            &self.message
        }
    }
}

/// An event a provider declares in its manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventDefinition {
    pub id: u32,
    pub version: u8,
    pub level: u8,
    pub opcode: u8,
    pub task: u16,
    pub keyword: u64,
    /// Message text with `%N` inserts, empty if the event has no message.
    pub message: String,
    /// The `<template>` XML describing the event's data.
    pub template: String,
}

/// Metadata a provider registered with the event log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderMetadata {
    pub name: String,
    pub guid: Option<Guid>,
    pub keywords: Vec<MetadataEntry>,
    pub opcodes: Vec<MetadataEntry>,
    pub levels: Vec<MetadataEntry>,
    pub tasks: Vec<MetadataEntry>,
    pub events: Vec<EventDefinition>,
    /// Parameter messages referenced as `%%NNNN` from event values.
    pub messages: BTreeMap<u32, String>,
}

impl ProviderMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        ProviderMetadata {
            name: name.into(),
            ..Default::default()
        }
    }

    /// The latest declared version of an event.
    pub fn event(&self, id: u32) -> Option<&EventDefinition> {
        self.events
            .iter()
            .filter(|e| e.id == id)
            .max_by_key(|e| e.version)
    }

    pub fn win_meta(&self) -> WinMeta {
        let mut meta = WinMeta::default();
        for k in &self.keywords {
            meta.keywords.insert(k.value, k.display_name().to_owned());
        }
        for o in &self.opcodes {
            // Opcode values carry the task in the high word.
            meta.opcodes
                .insert((o.value & 0xff) as u8, o.display_name().to_owned());
        }
        for l in &self.levels {
            meta.levels.insert(l.value as u8, l.display_name().to_owned());
        }
        for t in &self.tasks {
            meta.tasks.insert(t.value as u16, t.display_name().to_owned());
        }
        meta
    }
}

/// How an event's message is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventMessage {
    None,
    /// Same text for every event.
    Static(String),
    Template(MessageTemplate),
}

impl EventMessage {
    fn from_text(text: &str) -> EventMessage {
        if text.is_empty() {
            return EventMessage::None;
        }
        let template = MessageTemplate::compile(text);
        if template.is_static() {
            EventMessage::Static(template.render::<&str>(&[]))
        } else {
            EventMessage::Template(template)
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, EventMessage::None)
    }
}

/// Names and message for one shape of one event id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMetadata {
    pub event_id: u16,
    pub version: u8,
    /// Parameter names in value order.
    pub params: Vec<String>,
    /// Set when the values belong to `UserData` rather than `EventData`.
    pub user_data_name: Option<String>,
    pub message: EventMessage,
}

impl EventMetadata {
    /// Parse a provider `<template>` definition.
    pub fn from_definition(def: &EventDefinition) -> DeserializationResult<EventMetadata> {
        let mut params = Vec::new();
        let mut user_data_name = None;

        if !def.template.trim().is_empty() {
            let root = parse_document(def.template.as_bytes())?;
            match root.child("UserData").and_then(|u| u.children.first()) {
                Some(inner) => {
                    user_data_name = Some(inner.name.clone());
                    params.extend(inner.children.iter().map(|c| c.name.clone()));
                }
                None => params.extend(data_names(&root)),
            }
        }

        Ok(EventMetadata {
            event_id: def.id as u16,
            version: def.version,
            params,
            user_data_name,
            message: EventMessage::from_text(&def.message),
        })
    }

    /// Derive metadata from a live record: parameter names from its XML and the message by
    /// formatting it with `%1`, `%2`.. as inserts.
    pub fn from_handle(
        event_id: u16,
        provider: Option<&ProviderMetadata>,
        handle: &dyn EventHandle,
    ) -> Result<EventMetadata, EventLogError> {
        let mut buf = Vec::new();
        handle
            .render_xml(None, &mut buf)
            .map_err(|e| EventLogError::api("EvtRender", e))?;
        let event = unmarshal_event_xml(&buf)?;

        let (params, user_data_name) = match event.user_data {
            Some(user_data) => (
                user_data.pairs.into_iter().map(|kv| kv.key).collect(),
                Some(user_data.name),
            ),
            None => (
                event.event_data.into_iter().map(|kv| kv.key).collect(),
                None,
            ),
        };

        let inserts: Vec<String> = (1..=MAX_INSERT_STRINGS).map(|i| format!("%{i}")).collect();
        let message = match handle.format_message(provider, Some(&inserts)) {
            Ok(text) => EventMessage::from_text(&text),
            Err(e) => {
                debug!("No message for event {event_id} from its handle: {e}");
                EventMessage::None
            }
        };

        Ok(EventMetadata {
            event_id,
            version: event.version,
            params,
            user_data_name,
            message,
        })
    }

    /// Same event, version and parameter layout (the message is not compared).
    pub fn same_shape(&self, other: &EventMetadata) -> bool {
        self.event_id == other.event_id
            && self.version == other.version
            && self.user_data_name == other.user_data_name
            && self.params == other.params
    }
}

fn data_names(root: &XmlElement) -> impl Iterator<Item = String> + '_ {
    root.children
        .iter()
        .filter(|c| c.name.eq_ignore_ascii_case("data"))
        .map(|c| c.attr("name").unwrap_or_default().to_owned())
}

/// Metadata for one provider.
#[derive(Debug)]
pub struct PublisherMetadataStore {
    provider: String,
    metadata: Option<ProviderMetadata>,
    win_meta: WinMeta,
    events: FastMap<u16, Arc<EventMetadata>>,
    fingerprints: RwLock<FastMap<(u16, Fingerprint), Arc<EventMetadata>>>,
}

impl PublisherMetadataStore {
    pub fn new(metadata: ProviderMetadata) -> PublisherMetadataStore {
        let mut events = FastMap::default();
        for def in &metadata.events {
            match EventMetadata::from_definition(def) {
                Ok(em) => {
                    // Keep the newest version of each event.
                    let newer = events
                        .get(&em.event_id)
                        .is_none_or(|cur: &Arc<EventMetadata>| cur.version <= em.version);
                    if newer {
                        events.insert(em.event_id, Arc::new(em));
                    }
                }
                Err(e) => debug!(
                    "Skipping template of event {} from provider {}: {e}",
                    def.id, metadata.name
                ),
            }
        }

        PublisherMetadataStore {
            provider: metadata.name.clone(),
            win_meta: metadata.win_meta(),
            events,
            metadata: Some(metadata),
            fingerprints: RwLock::new(FastMap::default()),
        }
    }

    /// A store for a provider without metadata. Names fall back to the standard tables.
    pub fn empty(provider: impl Into<String>) -> PublisherMetadataStore {
        PublisherMetadataStore {
            provider: provider.into(),
            metadata: None,
            win_meta: WinMeta::default(),
            events: FastMap::default(),
            fingerprints: RwLock::new(FastMap::default()),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn metadata(&self) -> Option<&ProviderMetadata> {
        self.metadata.as_ref()
    }

    pub fn win_meta(&self) -> &WinMeta {
        &self.win_meta
    }

    /// Metadata as declared by the provider.
    pub fn declared(&self, event_id: u16) -> Option<&Arc<EventMetadata>> {
        self.events.get(&event_id)
    }

    /// A parameter message (`%%NNNN`) by id.
    pub fn message_by_id(&self, id: u32) -> Option<String> {
        self.metadata.as_ref()?.messages.get(&id).cloned()
    }

    /// Metadata for an event whose values have the given fingerprint.
    ///
    /// On the first sighting of a shape the metadata is derived from the record itself and
    /// compared against the declared metadata: when they agree the declared instance is cached,
    /// so every equivalent shape converges on one instance.
    pub fn resolve(
        &self,
        event_id: u16,
        fingerprint: Fingerprint,
        handle: &dyn EventHandle,
    ) -> Option<Arc<EventMetadata>> {
        let key = (event_id, fingerprint);
        {
            let cache = self
                .fingerprints
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(em) = cache.get(&key) {
                return Some(Arc::clone(em));
            }
        }

        let mut cache = self
            .fingerprints
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(em) = cache.get(&key) {
            return Some(Arc::clone(em));
        }

        let declared = self.events.get(&event_id);
        let derived = match EventMetadata::from_handle(event_id, self.metadata.as_ref(), handle) {
            Ok(derived) => derived,
            Err(e) => {
                debug!(
                    "Failed to derive metadata of event {event_id} ({}) from its handle: {e}",
                    self.provider
                );
                return declared.cloned();
            }
        };

        let em = match declared {
            Some(declared) if declared.same_shape(&derived) => Arc::clone(declared),
            Some(declared) => {
                let mut derived = derived;
                if derived.message.is_none() {
                    derived.message = declared.message.clone();
                }
                Arc::new(derived)
            }
            None => Arc::new(derived),
        };

        trace!(
            "Caching metadata of event {event_id} ({}) for fingerprint {fingerprint:#x}",
            self.provider
        );
        cache.insert(key, Arc::clone(&em));
        Some(em)
    }
}

/// Stores for every provider seen so far, loaded lazily from a [`Session`].
pub struct PublisherMetadataCache {
    session: Arc<dyn Session>,
    locale: u32,
    stores: RwLock<FastMap<String, Arc<PublisherMetadataStore>>>,
}

impl PublisherMetadataCache {
    pub fn new(session: Arc<dyn Session>, locale: u32) -> Self {
        PublisherMetadataCache {
            session,
            locale,
            stores: RwLock::new(FastMap::default()),
        }
    }

    /// The store for `provider`.
    ///
    /// Always returns a store. When the provider's metadata cannot be loaded an empty store is
    /// cached in its place and the error is returned alongside it, once.
    pub fn get(&self, provider: &str) -> (Arc<PublisherMetadataStore>, Option<EventLogError>) {
        {
            let stores = self.stores.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(store) = stores.get(provider) {
                return (Arc::clone(store), None);
            }
        }

        let mut stores = self.stores.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(store) = stores.get(provider) {
            return (Arc::clone(store), None);
        }

        let (store, err) = match self.session.publisher_metadata(provider, self.locale) {
            Ok(metadata) => (PublisherMetadataStore::new(metadata), None),
            Err(source) => {
                let err = EventLogError::PublisherMetadata {
                    provider: provider.to_owned(),
                    source,
                };
                debug!("{err}");
                (PublisherMetadataStore::empty(provider), Some(err))
            }
        };

        let store = Arc::new(store);
        stores.insert(provider.to_owned(), Arc::clone(&store));
        (store, err)
    }

    pub fn len(&self) -> usize {
        self.stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
