use std::fmt;
use std::str::FromStr;

use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};

use crate::api::EventHandle;
use crate::err::{DeserializationError, DeserializationResult, EventLogError, Result};

/// Points just after one record of one channel.
///
/// Serializes to the same XML the event log API produces for `EvtRender(EvtRenderBookmark)`:
///
/// ```text
/// <BookmarkList><Bookmark Channel="Application" RecordId="42" IsCurrent="true"/></BookmarkList>
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bookmark {
    channel: String,
    record_id: u64,
}

impl Bookmark {
    pub fn new(channel: impl Into<String>, record_id: u64) -> Self {
        Bookmark {
            channel: channel.into(),
            record_id,
        }
    }

    /// Capture the position of a live record.
    pub fn from_record(handle: &dyn EventHandle) -> Result<Bookmark> {
        let (channel, record_id) = handle
            .position()
            .map_err(|e| EventLogError::api("EvtCreateBookmark", e))?;
        Ok(Bookmark { channel, record_id })
    }

    pub fn from_serialized(text: &str) -> DeserializationResult<Bookmark> {
        let invalid = |msg: &str| DeserializationError::InvalidBookmark(msg.to_owned());

        let mut reader = Reader::from_str(text);
        let mut saw_list = false;
        let mut first = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                    b"BookmarkList" => saw_list = true,
                    b"Bookmark" if saw_list => {
                        let (bookmark, current) = parse_bookmark_element(&e)?;
                        if current {
                            return Ok(bookmark);
                        }
                        first.get_or_insert(bookmark);
                    }
                    _ => return Err(invalid("unexpected element")),
                },
                Event::Eof => break,
                _ => {}
            }
        }

        if !saw_list {
            return Err(invalid("missing BookmarkList"));
        }
        first.ok_or_else(|| invalid("no Bookmark element"))
    }

    pub fn serialize(&self) -> String {
        format!(
            r#"<BookmarkList><Bookmark Channel="{}" RecordId="{}" IsCurrent="true"/></BookmarkList>"#,
            escape(self.channel.as_str()),
            self.record_id
        )
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn record_id(&self) -> u64 {
        self.record_id
    }
}

fn parse_bookmark_element(e: &BytesStart<'_>) -> DeserializationResult<(Bookmark, bool)> {
    let mut channel = None;
    let mut record_id = None;
    let mut current = false;

    for attr in e.attributes() {
        let attr = attr?;
        let value = attr.unescape_value()?;
        match attr.key.local_name().as_ref() {
            b"Channel" => channel = Some(value.into_owned()),
            b"RecordId" => {
                record_id = Some(value.trim().parse::<u64>().map_err(|_| {
                    DeserializationError::InvalidBookmark(format!("invalid RecordId `{value}`"))
                })?)
            }
            b"IsCurrent" => current = value.eq_ignore_ascii_case("true"),
            _ => {}
        }
    }

    match (channel, record_id) {
        (Some(channel), Some(record_id)) => Ok((Bookmark { channel, record_id }, current)),
        _ => Err(DeserializationError::InvalidBookmark(
            "Bookmark requires Channel and RecordId".to_owned(),
        )),
    }
}

impl FromStr for Bookmark {
    type Err = DeserializationError;

    fn from_str(s: &str) -> DeserializationResult<Self> {
        Bookmark::from_serialized(s)
    }
}

impl fmt::Display for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}
