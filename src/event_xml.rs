//! Decoding of rendered event XML (`EvtRenderEventXml` output and `<Events>` exports).
//!
//! All input goes through [`ControlSafeReader`] first, so a provider that logged a raw control
//! character produces an escaped `\uNNNN` in the decoded text instead of a parse failure.

use std::io::{BufRead, BufReader, Read};

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event as XmlEvent};

use crate::err::{DeserializationError, DeserializationResult};
use crate::event::{Event, KeyValue, UserData};
use crate::transcode::ControlSafeReader;

/// A parsed element. Names are local names, namespace prefixes are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
    pub text: String,
}

impl XmlElement {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }
}

fn start_element(e: &BytesStart<'_>) -> DeserializationResult<XmlElement> {
    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        attributes.push((key, attr.unescape_value()?.into_owned()));
    }
    Ok(XmlElement {
        name,
        attributes,
        ..Default::default()
    })
}

/// Read the rest of an element whose start tag was just consumed.
fn read_element<R: BufRead>(
    reader: &mut Reader<R>,
    root: XmlElement,
    buf: &mut Vec<u8>,
) -> DeserializationResult<XmlElement> {
    let mut stack = vec![root];
    loop {
        buf.clear();
        match reader.read_event_into(buf)? {
            XmlEvent::Start(e) => stack.push(start_element(&e)?),
            XmlEvent::Empty(e) => {
                let element = start_element(&e)?;
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(element);
                }
            }
            XmlEvent::Text(t) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&t.unescape()?);
                }
            }
            XmlEvent::CData(c) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            XmlEvent::End(_) => {
                let Some(done) = stack.pop() else {
                    return Err(DeserializationError::InvalidEventXml(
                        "unbalanced end tag".to_owned(),
                    ));
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(done),
                    None => return Ok(done),
                }
            }
            XmlEvent::Eof => {
                return Err(DeserializationError::InvalidEventXml(
                    "unexpected end of document".to_owned(),
                ));
            }
            _ => {}
        }
    }
}

/// Parse the first element of a document (through the control-safe transcoder).
pub(crate) fn parse_document(bytes: &[u8]) -> DeserializationResult<XmlElement> {
    let mut reader = Reader::from_reader(BufReader::new(ControlSafeReader::new(bytes)));
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf)? {
            XmlEvent::Start(e) => {
                let root = start_element(&e)?;
                return read_element(&mut reader, root, &mut buf);
            }
            XmlEvent::Empty(e) => return start_element(&e),
            XmlEvent::Eof => {
                return Err(DeserializationError::InvalidEventXml(
                    "document has no root element".to_owned(),
                ));
            }
            _ => {}
        }
    }
}

/// Decode a single `<Event>` document.
pub fn unmarshal_event_xml(bytes: &[u8]) -> DeserializationResult<Event> {
    let root = parse_document(bytes)?;
    if root.name != "Event" {
        return Err(DeserializationError::InvalidEventXml(format!(
            "expected <Event>, found <{}>",
            root.name
        )));
    }
    Ok(event_from_element(&root))
}

/// Decodes every `<Event>` of an exported `<Events>` document, one at a time.
///
/// Iteration stops after the first error.
pub struct EventXmlStream<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    done: bool,
}

impl<R: Read> EventXmlStream<BufReader<ControlSafeReader<R>>> {
    pub fn new(source: R) -> Self {
        EventXmlStream {
            reader: Reader::from_reader(BufReader::new(ControlSafeReader::new(source))),
            buf: Vec::new(),
            done: false,
        }
    }
}

/// Stream the events of an exported `<Events>` document.
pub fn read_event_stream<R: Read>(source: R) -> EventXmlStream<BufReader<ControlSafeReader<R>>> {
    EventXmlStream::new(source)
}

impl<R: BufRead> EventXmlStream<R> {
    fn next_event(&mut self) -> DeserializationResult<Option<Event>> {
        loop {
            self.buf.clear();
            let root = match self.reader.read_event_into(&mut self.buf)? {
                XmlEvent::Start(e) if e.local_name().as_ref() == b"Event" => start_element(&e)?,
                XmlEvent::Empty(e) if e.local_name().as_ref() == b"Event" => {
                    return Ok(Some(event_from_element(&start_element(&e)?)));
                }
                XmlEvent::Eof => return Ok(None),
                _ => continue,
            };
            let element = read_element(&mut self.reader, root, &mut self.buf)?;
            return Ok(Some(event_from_element(&element)));
        }
    }
}

impl<R: BufRead> Iterator for EventXmlStream<R> {
    type Item = DeserializationResult<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_event() {
            Ok(Some(event)) => Some(Ok(event)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn parse_num<T: std::str::FromStr + Default>(s: Option<&str>) -> T {
    s.and_then(|s| s.trim().parse().ok()).unwrap_or_default()
}

fn parse_hex_u64(s: &str) -> u64 {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).unwrap_or_default(),
        None => s.parse().unwrap_or_default(),
    }
}

fn key_values(element: &XmlElement) -> Vec<KeyValue> {
    element
        .children
        .iter()
        .map(|child| {
            let key = if child.name == "Data" {
                child.attr("Name").unwrap_or_default().to_owned()
            } else {
                child.name.clone()
            };
            KeyValue::new(key, child.text.clone())
        })
        .collect()
}

pub(crate) fn event_from_element(root: &XmlElement) -> Event {
    let mut event = Event::default();

    if let Some(system) = root.child("System") {
        if let Some(provider) = system.child("Provider") {
            event.provider.name = provider.attr("Name").unwrap_or_default().to_owned();
            event.provider.guid = provider.attr("Guid").unwrap_or_default().to_owned();
            event.provider.event_source_name = provider
                .attr("EventSourceName")
                .unwrap_or_default()
                .to_owned();
        }
        if let Some(id) = system.child("EventID") {
            event.event_id = parse_num(Some(&id.text));
            event.qualifiers = parse_num(id.attr("Qualifiers"));
        }
        // Some providers log versions like "101.3"; those decode as 0.
        event.version = parse_num(system.child_text("Version"));
        event.level_raw = parse_num(system.child_text("Level"));
        event.task_raw = parse_num(system.child_text("Task"));
        event.opcode_raw = system
            .child_text("Opcode")
            .and_then(|s| s.trim().parse().ok());
        event.keywords_raw = system.child_text("Keywords").map(parse_hex_u64).unwrap_or(0);
        event.time_created = system
            .child("TimeCreated")
            .and_then(|t| t.attr("SystemTime"))
            .and_then(|s| s.parse().ok());
        event.record_id = parse_num(system.child_text("EventRecordID"));
        if let Some(correlation) = system.child("Correlation") {
            event.correlation.activity_id =
                correlation.attr("ActivityID").unwrap_or_default().to_owned();
            event.correlation.related_activity_id = correlation
                .attr("RelatedActivityID")
                .unwrap_or_default()
                .to_owned();
        }
        if let Some(execution) = system.child("Execution") {
            event.execution.process_id = parse_num(execution.attr("ProcessID"));
            event.execution.thread_id = parse_num(execution.attr("ThreadID"));
        }
        event.channel = system
            .child_text("Channel")
            .unwrap_or_default()
            .trim()
            .to_owned();
        event.computer = system
            .child_text("Computer")
            .unwrap_or_default()
            .trim()
            .to_owned();
        if let Some(security) = system.child("Security") {
            event.user.identifier = security.attr("UserID").unwrap_or_default().to_owned();
        }
    }

    if let Some(data) = root.child("EventData") {
        event.event_data = key_values(data);
    }

    if let Some(inner) = root.child("UserData").and_then(|u| u.children.first()) {
        event.user_data = Some(UserData {
            name: inner.name.clone(),
            namespace: inner.attr("xmlns").unwrap_or_default().to_owned(),
            pairs: key_values(inner),
        });
    }

    if let Some(processing) = root.child("ProcessingErrorData") {
        event.render_error_code = parse_num(processing.child_text("ErrorCode"));
        event.render_error_data_item_name = processing
            .child_text("DataItemName")
            .unwrap_or_default()
            .to_owned();
    }

    if let Some(info) = root.child("RenderingInfo") {
        event.message = info.child_text("Message").unwrap_or_default().to_owned();
        event.level = info.child_text("Level").unwrap_or_default().to_owned();
        event.task = info.child_text("Task").unwrap_or_default().to_owned();
        event.opcode = info.child_text("Opcode").unwrap_or_default().to_owned();
        if let Some(keywords) = info.child("Keywords") {
            event.keywords = keywords
                .children
                .iter()
                .filter(|k| k.name == "Keyword")
                .map(|k| k.text.clone())
                .collect();
        }
    }

    event
}
