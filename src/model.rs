//! Telemetry record types and their wire encoding.
//!
//! Records are designed to live inside a [`RecordPool`](crate::pool::RecordPool)
//! and be rewritten in place: clearing an [`Event`] keeps its parameter slots and
//! their string buffers, so a steady-state producer never allocates.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SerializationError;
use crate::pool::PoolRecord;

/// Timestamp layout used on the wire (millisecond precision, no offset).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Format an instant the way the collector expects it.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a wire timestamp, tolerating surrounding whitespace and JSON quotes.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim().trim_matches('"');
    NaiveDateTime::parse_from_str(trimmed, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// The three record kinds, each with its own pool and endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Event,
    Property,
    Session,
}

impl RecordKind {
    /// Get all record kinds.
    pub fn all() -> &'static [RecordKind] {
        &[RecordKind::Event, RecordKind::Property, RecordKind::Session]
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Event => write!(f, "events"),
            RecordKind::Property => write!(f, "properties"),
            RecordKind::Session => write!(f, "sessions"),
        }
    }
}

/// Type tag carried next to every value on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValueType {
    Int = 0,
    Float = 1,
    Double = 2,
    String = 3,
    Bool = 4,
    DateTime = 5,
}

/// An owned, typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f32),
    Double(f64),
    String(Option<String>),
    Bool(bool),
    DateTime(DateTime<Utc>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Int(0)
    }
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::Double(_) => ValueType::Double,
            Value::String(_) => ValueType::String,
            Value::Bool(_) => ValueType::Bool,
            Value::DateTime(_) => ValueType::DateTime,
        }
    }

    pub fn as_value_ref(&self) -> ValueRef<'_> {
        match self {
            Value::Int(v) => ValueRef::Int(*v),
            Value::Float(v) => ValueRef::Float(*v),
            Value::Double(v) => ValueRef::Double(*v),
            Value::String(v) => ValueRef::Str(v.as_deref()),
            Value::Bool(v) => ValueRef::Bool(*v),
            Value::DateTime(v) => ValueRef::DateTime(*v),
        }
    }

    /// Overwrite this value, reusing the string buffer when both sides are strings.
    pub fn assign(&mut self, value: ValueRef<'_>) {
        match (self, value) {
            (Value::String(Some(buf)), ValueRef::Str(Some(s))) => {
                buf.clear();
                buf.push_str(s);
            }
            (this, value) => *this = value.to_owned_value(),
        }
    }

    /// Text carried in the `value` field of the wire object.
    fn wire_text(&self, name: &str) -> Result<Option<String>, SerializationError> {
        let text = match self {
            Value::Int(v) => v.to_string(),
            Value::Float(v) if v.is_finite() => v.to_string(),
            Value::Double(v) if v.is_finite() => v.to_string(),
            Value::Float(_) | Value::Double(_) => {
                return Err(SerializationError::NonFinite {
                    name: name.to_string(),
                })
            }
            Value::String(None) => return Ok(None),
            Value::String(Some(s)) => s.clone(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::DateTime(ts) => format_timestamp(*ts),
        };
        Ok(Some(text))
    }
}

/// A borrowed value handed in by producers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueRef<'a> {
    Int(i64),
    Float(f32),
    Double(f64),
    Str(Option<&'a str>),
    Bool(bool),
    DateTime(DateTime<Utc>),
}

impl ValueRef<'_> {
    pub fn to_owned_value(self) -> Value {
        match self {
            ValueRef::Int(v) => Value::Int(v),
            ValueRef::Float(v) => Value::Float(v),
            ValueRef::Double(v) => Value::Double(v),
            ValueRef::Str(v) => Value::String(v.map(str::to_string)),
            ValueRef::Bool(v) => Value::Bool(v),
            ValueRef::DateTime(v) => Value::DateTime(v),
        }
    }
}

impl From<i64> for ValueRef<'_> {
    fn from(v: i64) -> Self {
        ValueRef::Int(v)
    }
}

impl From<i32> for ValueRef<'_> {
    fn from(v: i32) -> Self {
        ValueRef::Int(v.into())
    }
}

impl From<u32> for ValueRef<'_> {
    fn from(v: u32) -> Self {
        ValueRef::Int(v.into())
    }
}

impl From<f32> for ValueRef<'_> {
    fn from(v: f32) -> Self {
        ValueRef::Float(v)
    }
}

impl From<f64> for ValueRef<'_> {
    fn from(v: f64) -> Self {
        ValueRef::Double(v)
    }
}

impl From<bool> for ValueRef<'_> {
    fn from(v: bool) -> Self {
        ValueRef::Bool(v)
    }
}

impl<'a> From<&'a str> for ValueRef<'a> {
    fn from(v: &'a str) -> Self {
        ValueRef::Str(Some(v))
    }
}

impl<'a> From<&'a String> for ValueRef<'a> {
    fn from(v: &'a String) -> Self {
        ValueRef::Str(Some(v.as_str()))
    }
}

impl<'a> From<Option<&'a str>> for ValueRef<'a> {
    fn from(v: Option<&'a str>) -> Self {
        ValueRef::Str(v)
    }
}

impl From<DateTime<Utc>> for ValueRef<'_> {
    fn from(v: DateTime<Utc>) -> Self {
        ValueRef::DateTime(v)
    }
}

/// A named, typed value attached to an event or property.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: Value,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Rewrite this parameter in place.
    pub fn write(&mut self, name: &str, value: ValueRef<'_>) {
        self.name.clear();
        self.name.push_str(name);
        self.value.assign(value);
    }

    fn wire(&self) -> Result<WireParameter<'_>, SerializationError> {
        Ok(WireParameter {
            name: &self.name,
            value: self.value.wire_text(&self.name)?,
            kind: self.value.value_type() as u8,
        })
    }
}

/// Records whose timestamps are rewritten once server time is known.
pub trait Timestamped {
    fn is_validated(&self) -> bool;

    fn mark_validated(&mut self);

    /// Visit every instant the record carries, including instant parameters.
    fn for_each_timestamp_mut(&mut self, f: &mut dyn FnMut(&mut DateTime<Utc>));
}

/// Values stamped into every record of a batch at serialization time.
#[derive(Debug, Clone, Copy)]
pub struct WireContext<'a> {
    pub user_id: i64,
    pub app_version: &'a str,
}

/// Records that can be written as one element of a batch array.
pub trait WireRecord {
    fn write_json(&self, ctx: &WireContext<'_>, out: &mut String)
        -> Result<(), SerializationError>;
}

#[derive(Serialize)]
struct WireParameter<'a> {
    name: &'a str,
    value: Option<String>,
    #[serde(rename = "type")]
    kind: u8,
}

fn push_json<T: Serialize>(value: &T, out: &mut String) -> Result<(), SerializationError> {
    let encoded = serde_json::to_string(value)?;
    out.push_str(&encoded);
    Ok(())
}

/// A producer event with its ordered parameter list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(into = "StoredEvent", from = "StoredEvent")]
pub struct Event {
    name: String,
    timestamp: DateTime<Utc>,
    /// Parameter slots; only the first `len` are live, the rest keep their buffers.
    parameters: Vec<Parameter>,
    len: usize,
    validated: bool,
}

impl Event {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters[..self.len]
    }

    pub fn set_name(&mut self, name: &str) {
        self.name.clear();
        self.name.push_str(name);
    }

    pub fn set_timestamp(&mut self, timestamp: DateTime<Utc>) {
        self.timestamp = timestamp;
    }

    /// Append a parameter, reusing a spare slot when one exists.
    pub fn push_param(&mut self, name: &str, value: ValueRef<'_>) {
        if self.len < self.parameters.len() {
            self.parameters[self.len].write(name, value);
        } else {
            let mut param = Parameter::default();
            param.write(name, value);
            self.parameters.push(param);
        }
        self.len += 1;
    }
}

impl PoolRecord for Event {
    fn clear(&mut self) {
        self.name.clear();
        self.len = 0;
        self.validated = false;
    }
}

impl Timestamped for Event {
    fn is_validated(&self) -> bool {
        self.validated
    }

    fn mark_validated(&mut self) {
        self.validated = true;
    }

    fn for_each_timestamp_mut(&mut self, f: &mut dyn FnMut(&mut DateTime<Utc>)) {
        f(&mut self.timestamp);
        for param in &mut self.parameters[..self.len] {
            if let Value::DateTime(ts) = &mut param.value {
                f(ts);
            }
        }
    }
}

#[derive(Serialize)]
struct WireEvent<'a> {
    user_id: i64,
    name: &'a str,
    event_time: String,
    current_app_version: &'a str,
    parameters: Vec<WireParameter<'a>>,
}

impl WireRecord for Event {
    fn write_json(
        &self,
        ctx: &WireContext<'_>,
        out: &mut String,
    ) -> Result<(), SerializationError> {
        let parameters = self
            .parameters()
            .iter()
            .map(Parameter::wire)
            .collect::<Result<Vec<_>, _>>()?;

        push_json(
            &WireEvent {
                user_id: ctx.user_id,
                name: &self.name,
                event_time: format_timestamp(self.timestamp),
                current_app_version: ctx.app_version,
                parameters,
            },
            out,
        )
    }
}

/// Persisted form of an [`Event`]; drops the spare parameter slots.
#[derive(Serialize, Deserialize)]
struct StoredEvent {
    name: String,
    timestamp: DateTime<Utc>,
    parameters: Vec<Parameter>,
    validated: bool,
}

impl From<Event> for StoredEvent {
    fn from(mut event: Event) -> Self {
        event.parameters.truncate(event.len);
        Self {
            name: event.name,
            timestamp: event.timestamp,
            parameters: event.parameters,
            validated: event.validated,
        }
    }
}

impl From<StoredEvent> for Event {
    fn from(stored: StoredEvent) -> Self {
        Self {
            name: stored.name,
            timestamp: stored.timestamp,
            len: stored.parameters.len(),
            parameters: stored.parameters,
            validated: stored.validated,
        }
    }
}

/// A single named value written to a property table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Property {
    table: String,
    parameter: Parameter,
    timestamp: DateTime<Utc>,
    validated: bool,
}

impl Property {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn name(&self) -> &str {
        &self.parameter.name
    }

    pub fn value(&self) -> &Value {
        &self.parameter.value
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Overwrite the whole property; resets validation for the new timestamp.
    pub fn set(&mut self, table: &str, name: &str, value: ValueRef<'_>, timestamp: DateTime<Utc>) {
        self.table.clear();
        self.table.push_str(table);
        self.parameter.write(name, value);
        self.timestamp = timestamp;
        self.validated = false;
    }

    pub fn matches(&self, table: &str, name: &str) -> bool {
        self.table == table && self.parameter.name == name
    }
}

impl PoolRecord for Property {
    fn clear(&mut self) {
        self.table.clear();
        self.parameter.name.clear();
        self.validated = false;
    }
}

impl Timestamped for Property {
    fn is_validated(&self) -> bool {
        self.validated
    }

    fn mark_validated(&mut self) {
        self.validated = true;
    }

    fn for_each_timestamp_mut(&mut self, f: &mut dyn FnMut(&mut DateTime<Utc>)) {
        f(&mut self.timestamp);
        if let Value::DateTime(ts) = &mut self.parameter.value {
            f(ts);
        }
    }
}

#[derive(Serialize)]
struct WireProperty<'a> {
    user_id: i64,
    table: &'a str,
    set_time: String,
    value: WireParameter<'a>,
}

impl WireRecord for Property {
    fn write_json(
        &self,
        ctx: &WireContext<'_>,
        out: &mut String,
    ) -> Result<(), SerializationError> {
        push_json(
            &WireProperty {
                user_id: ctx.user_id,
                table: &self.table,
                set_time: format_timestamp(self.timestamp),
                value: self.parameter.wire()?,
            },
            out,
        )
    }
}

/// One application session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    start: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    session_count: i64,
    area: i32,
    ab_mode: String,
    unregistered: bool,
    validated: bool,
}

impl Session {
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn session_count(&self) -> i64 {
        self.session_count
    }

    pub fn area(&self) -> i32 {
        self.area
    }

    pub fn ab_mode(&self) -> &str {
        &self.ab_mode
    }

    /// True when the server did not confirm this session's number.
    pub fn is_unregistered(&self) -> bool {
        self.unregistered
    }

    pub(crate) fn begin(&mut self, now: DateTime<Utc>, count: i64, unregistered: bool) {
        self.start = now;
        self.last_activity = now;
        self.session_count = count;
        self.unregistered = unregistered;
        self.validated = false;
    }

    pub(crate) fn set_last_activity(&mut self, ts: DateTime<Utc>) {
        self.last_activity = ts;
    }

    pub(crate) fn set_area(&mut self, area: i32) {
        self.area = area;
    }

    pub(crate) fn set_ab_mode(&mut self, mode: &str) {
        self.ab_mode.clear();
        self.ab_mode.push_str(mode);
    }
}

impl PoolRecord for Session {
    fn clear(&mut self) {
        self.ab_mode.clear();
        self.session_count = 0;
        self.area = 0;
        self.unregistered = false;
        self.validated = false;
    }
}

impl Timestamped for Session {
    fn is_validated(&self) -> bool {
        self.validated
    }

    fn mark_validated(&mut self) {
        self.validated = true;
    }

    fn for_each_timestamp_mut(&mut self, f: &mut dyn FnMut(&mut DateTime<Utc>)) {
        f(&mut self.start);
        f(&mut self.last_activity);
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct WireSession<'a> {
    user_id: i64,
    area: i32,
    session_start: String,
    last_activity: String,
    session_count: i64,
    ab_mode: &'a str,
    unregistered: bool,
}

impl WireRecord for Session {
    fn write_json(
        &self,
        ctx: &WireContext<'_>,
        out: &mut String,
    ) -> Result<(), SerializationError> {
        push_json(
            &WireSession {
                user_id: ctx.user_id,
                area: self.area,
                session_start: format_timestamp(self.start),
                last_activity: format_timestamp(self.last_activity),
                session_count: self.session_count,
                ab_mode: &self.ab_mode,
                unregistered: self.unregistered,
            },
            out,
        )
    }
}

/// A serialized batch body plus bookkeeping about what went into it.
#[derive(Debug, Clone, Default)]
pub struct EncodedBatch {
    /// JSON array text
    pub body: String,

    /// Records written into `body`
    pub encoded: usize,

    /// Records skipped because they could not be serialized
    pub skipped: usize,
}

impl EncodedBatch {
    pub fn is_empty(&self) -> bool {
        self.encoded == 0
    }
}

/// Encode records into a JSON array, skipping (and logging) any record that
/// fails to serialize so one bad record never poisons the batch.
pub fn encode_batch<'r, T, I>(records: I, ctx: &WireContext<'_>) -> EncodedBatch
where
    T: WireRecord + 'r,
    I: IntoIterator<Item = &'r T>,
{
    let mut batch = EncodedBatch {
        body: String::from("["),
        ..EncodedBatch::default()
    };
    let mut element = String::new();

    for record in records {
        element.clear();
        match record.write_json(ctx, &mut element) {
            Ok(()) => {
                if batch.encoded > 0 {
                    batch.body.push(',');
                }
                batch.body.push_str(&element);
                batch.encoded += 1;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Skipping record that failed to serialize");
                batch.skipped += 1;
            }
        }
    }

    batch.body.push(']');
    batch
}
