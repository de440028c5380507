use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::geo::{Coordinates, Geotagged};

/// One recorded chat exchange or journal note.
///
/// Records arrive from several producers with slightly different field
/// spellings, so deserialization is lenient: a wrongly typed coordinate or
/// timestamp becomes `None` instead of rejecting the whole record, and keys
/// this struct does not know about are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    #[serde(
        default,
        deserialize_with = "lenient_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub session_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub message: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub response: String,
    #[serde(
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub date: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_coordinate",
        skip_serializing_if = "Option::is_none"
    )]
    pub latitude: Option<f64>,
    #[serde(
        default,
        deserialize_with = "lenient_coordinate",
        skip_serializing_if = "Option::is_none"
    )]
    pub longitude: Option<f64>,
    #[serde(
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub location_name: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub photo_url: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub summary: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub diary: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub category: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The two user-editable text fields of an entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryEdit {
    /// Replaces `message` (shown as the entry title).
    #[serde(default)]
    pub message: Option<String>,
    /// Replaces `response` (shown as the diary body).
    #[serde(default)]
    pub response: Option<String>,
}

impl EntryEdit {
    pub fn is_empty(&self) -> bool {
        self.message.is_none() && self.response.is_none()
    }

    pub fn apply(&self, entry: &mut ConversationEntry) {
        if let Some(message) = &self.message {
            entry.message = message.clone();
        }
        if let Some(response) = &self.response {
            entry.response = response.clone();
        }
    }
}

impl ConversationEntry {
    pub fn new(session_id: impl Into<String>, message: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            message: message.into(),
            response: response.into(),
            ..Self::default()
        }
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    pub fn with_coordinates(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }

    /// Parsed `timestamp`, if present and well formed.
    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp.as_deref().and_then(parse_timestamp)
    }

    /// Calendar day of this entry, from `timestamp` first and `date` second.
    pub fn day(&self) -> Option<NaiveDate> {
        self.recorded_at()
            .map(|at| at.date_naive())
            .or_else(|| self.date.as_deref().and_then(parse_day))
    }

    /// Entry coordinates. Falls back to the nested `coordinates: {lat, lng}`
    /// object older pipeline records carry.
    pub fn coordinates(&self) -> Option<Coordinates> {
        if let (Some(latitude), Some(longitude)) = (self.latitude, self.longitude) {
            return Coordinates::new(latitude, longitude);
        }

        let nested = self.extra.get("coordinates")?.as_object()?;
        let latitude = nested.get("lat").or_else(|| nested.get("latitude"))?;
        let longitude = nested
            .get("lng")
            .or_else(|| nested.get("lon"))
            .or_else(|| nested.get("longitude"))?;
        Coordinates::new(value_as_f64(latitude)?, value_as_f64(longitude)?)
    }
}

impl Geotagged for ConversationEntry {
    fn coordinates(&self) -> Option<Coordinates> {
        ConversationEntry::coordinates(self)
    }

    fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    fn recorded_at(&self) -> Option<DateTime<Utc>> {
        ConversationEntry::recorded_at(self)
    }
}

/// Parse an ISO-8601 timestamp into UTC.
///
/// Offset-less timestamps are read as UTC. A bare `YYYY-MM-DD` is midnight UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    Some(Utc.from_utc_datetime(&day.and_hms_opt(0, 0, 0)?))
}

/// Parse a date key, accepting either a bare date or a full timestamp.
pub fn parse_day(raw: &str) -> Option<NaiveDate> {
    parse_timestamp(raw).map(|at| at.date_naive())
}

fn value_as_f64(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    number.is_finite().then_some(number)
}

fn lenient_coordinate<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_as_f64))
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_text(deserializer)?.unwrap_or_default())
}

/// Ids from some producers are numeric; those are kept as their decimal text.
fn lenient_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        _ => Ok(None),
    }
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Ok(Some(s)),
        _ => Ok(None),
    }
}
