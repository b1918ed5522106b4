use jiff::Timestamp;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::sid::SidType;

const KEYWORD_AUDIT_FAILURE: u64 = 0x0010_0000_0000_0000;
const KEYWORD_AUDIT_SUCCESS: u64 = 0x0020_0000_0000_0000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provider {
    pub name: String,
    pub guid: String,
    pub event_source_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Correlation {
    pub activity_id: String,
    pub related_activity_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Execution {
    pub process_id: u32,
    pub thread_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserSid {
    pub identifier: String,
    pub name: String,
    pub domain: String,
    pub sid_type: Option<SidType>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        KeyValue {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// The single element below `<UserData>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserData {
    pub name: String,
    pub namespace: String,
    pub pairs: Vec<KeyValue>,
}

/// One rendered event log record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Event {
    pub provider: Provider,
    pub event_id: u32,
    pub qualifiers: u16,
    pub version: u8,
    pub level_raw: u8,
    pub task_raw: u16,
    pub opcode_raw: Option<u8>,
    pub keywords_raw: u64,
    pub time_created: Option<Timestamp>,
    pub record_id: u64,
    pub correlation: Correlation,
    pub execution: Execution,
    pub channel: String,
    pub computer: String,
    pub user: UserSid,

    pub event_data: Vec<KeyValue>,
    pub user_data: Option<UserData>,

    pub message: String,
    pub level: String,
    pub task: String,
    pub opcode: String,
    pub keywords: Vec<String>,

    /// `ProcessingErrorData` reported by the event log itself.
    pub render_error_code: u32,
    pub render_error_data_item_name: String,
    /// Problems hit while rendering that did not prevent delivery.
    pub render_errors: Vec<String>,
}

fn put_str(map: &mut Map<String, Value>, key: &str, value: &str) {
    if !value.is_empty() {
        map.insert(key.to_owned(), Value::String(value.to_owned()));
    }
}

fn put_num(map: &mut Map<String, Value>, key: &str, value: u64) {
    if value != 0 {
        map.insert(key.to_owned(), Value::from(value));
    }
}

fn put_map(map: &mut Map<String, Value>, key: &str, value: Map<String, Value>) {
    if !value.is_empty() {
        map.insert(key.to_owned(), Value::Object(value));
    }
}

/// Windows line endings become `\n`, trailing newlines are dropped.
fn remove_windows_line_endings(s: &str) -> String {
    s.replace("\r\n", "\n").trim_end_matches('\n').to_owned()
}

/// Empty values are skipped, unnamed values are called `param<N>` and the first of any
/// duplicate keys wins.
fn pairs_to_map(pairs: &[KeyValue]) -> Map<String, Value> {
    let mut map = Map::new();
    for (i, kv) in pairs.iter().enumerate() {
        if kv.value.is_empty() {
            continue;
        }
        let key = if kv.key.is_empty() || kv.key == "Data" {
            format!("param{i}")
        } else {
            kv.key.clone()
        };
        if map.contains_key(&key) {
            log::debug!("Dropping duplicate event data key `{key}`");
            continue;
        }
        map.insert(key, Value::String(remove_windows_line_endings(&kv.value)));
    }
    map
}

impl Event {
    /// `success`/`failure` for events carrying an audit keyword.
    pub fn outcome(&self) -> Option<&'static str> {
        if self.keywords_raw & KEYWORD_AUDIT_SUCCESS != 0 {
            Some("success")
        } else if self.keywords_raw & KEYWORD_AUDIT_FAILURE != 0 {
            Some("failure")
        } else {
            None
        }
    }

    /// The event as a structured document with stable field names.
    pub fn fields(&self) -> Map<String, Value> {
        let mut win = Map::new();

        put_str(&mut win, "channel", &self.channel);
        put_str(&mut win, "computer_name", &self.computer);
        win.insert("event_id".to_owned(), Value::String(self.event_id.to_string()));

        let mut provider = Map::new();
        put_str(&mut provider, "name", &self.provider.name);
        put_str(&mut provider, "guid", &self.provider.guid);
        put_str(&mut provider, "event_source", &self.provider.event_source_name);
        put_map(&mut win, "provider", provider);

        put_num(&mut win, "record_id", self.record_id);
        put_num(&mut win, "version", u64::from(self.version));
        put_str(&mut win, "level", &self.level.to_lowercase());
        put_str(&mut win, "task", &self.task);
        put_str(&mut win, "opcode", &self.opcode);
        if !self.keywords.is_empty() {
            win.insert("keywords".to_owned(), Value::from(self.keywords.clone()));
        }
        if let Some(outcome) = self.outcome() {
            win.insert("outcome".to_owned(), Value::from(outcome));
        }
        if let Some(ts) = self.time_created {
            win.insert("time_created".to_owned(), Value::String(ts.to_string()));
        }
        put_str(&mut win, "activity_id", &self.correlation.activity_id);
        put_str(
            &mut win,
            "related_activity_id",
            &self.correlation.related_activity_id,
        );

        let mut process = Map::new();
        put_num(&mut process, "pid", u64::from(self.execution.process_id));
        let mut thread = Map::new();
        put_num(&mut thread, "id", u64::from(self.execution.thread_id));
        put_map(&mut process, "thread", thread);
        put_map(&mut win, "process", process);

        let mut user = Map::new();
        put_str(&mut user, "identifier", &self.user.identifier);
        put_str(&mut user, "name", &self.user.name);
        put_str(&mut user, "domain", &self.user.domain);
        if let Some(t) = self.user.sid_type {
            user.insert("type".to_owned(), Value::from(t.as_str()));
        }
        put_map(&mut win, "user", user);

        put_map(&mut win, "event_data", pairs_to_map(&self.event_data));
        if let Some(user_data) = &self.user_data {
            let mut map = pairs_to_map(&user_data.pairs);
            put_str(&mut map, "xml_name", &user_data.name);
            put_map(&mut win, "user_data", map);
        }

        let mut error = Map::new();
        put_num(&mut error, "code", u64::from(self.render_error_code));
        match self.render_errors.as_slice() {
            [] => {}
            [one] => put_str(&mut error, "message", one),
            many => {
                error.insert("message".to_owned(), Value::from(many.to_vec()));
            }
        }
        put_map(&mut win, "error", error);

        put_str(
            &mut win,
            "message",
            &remove_windows_line_endings(&self.message),
        );
        win
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields().serialize(serializer)
    }
}
