//! Per-day journal bundles.
//!
//! Conversation entries are grouped by UTC calendar day, newest day first.
//! Each bundle carries the day's entries, the distinct places visited, the
//! photos surfaced that day and one diary summary. Bundles are derived on
//! every read and never stored.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use tracing::warn;

use crate::entry::{parse_day, ConversationEntry};
use crate::geo::{missing_last, Coordinates};
use crate::photo::PhotoResolver;

/// Legacy key under which generated diaries were saved.
const LEGACY_DIARY_FIELD: &str = "diary note";

/// Calendar day a bundle is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DayKey {
    Date(NaiveDate),
    /// Entries whose date could not be determined.
    Unknown,
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DayKey::Date(day) => write!(f, "{}", day.format("%Y-%m-%d")),
            DayKey::Unknown => f.write_str("unknown"),
        }
    }
}

impl Serialize for DayKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Materialized data for a day, produced upstream of aggregation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DayDigest {
    /// Already normalized photo URLs, used verbatim when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Digests indexed by day.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DayDigests(HashMap<NaiveDate, DayDigest>);

impl DayDigests {
    pub fn insert(&mut self, day: NaiveDate, digest: DayDigest) {
        self.0.insert(day, digest);
    }

    pub fn get(&self, day: NaiveDate) -> Option<&DayDigest> {
        self.0.get(&day)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build from date-string keys as clients send them. Unparsable keys are
    /// skipped with a warning.
    pub fn from_keyed<I>(keyed: I) -> Self
    where
        I: IntoIterator<Item = (String, DayDigest)>,
    {
        let mut digests = Self::default();
        for (key, digest) in keyed {
            match parse_day(&key) {
                Some(day) => digests.insert(day, digest),
                None => warn!(key = %key, "ignoring day digest with unparsable date"),
            }
        }
        digests
    }
}

/// One day of the journal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyBundle {
    pub date: DayKey,
    pub conversations: Vec<ConversationEntry>,
    pub total_messages: usize,
    pub locations: Vec<String>,
    /// Empty when the day has no text yet; renderers show a placeholder.
    pub diary_summary: String,
    pub images: Vec<String>,
}

/// Ordering of entries inside a bundle.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum EntryOrder {
    #[default]
    Original,
    /// Newest first; entries without a readable timestamp last.
    Recency,
    /// Closest to the reference point first; entries without coordinates last.
    Distance(Coordinates),
}

/// Groups conversation entries into [`DailyBundle`]s.
#[derive(Debug, Clone)]
pub struct DailyAggregator<'a> {
    photos: &'a PhotoResolver,
    digests: Option<&'a DayDigests>,
    order: EntryOrder,
}

impl<'a> DailyAggregator<'a> {
    pub fn new(photos: &'a PhotoResolver) -> Self {
        Self {
            photos,
            digests: None,
            order: EntryOrder::Original,
        }
    }

    pub fn with_digests(mut self, digests: &'a DayDigests) -> Self {
        self.digests = Some(digests);
        self
    }

    pub fn order(mut self, order: EntryOrder) -> Self {
        self.order = order;
        self
    }

    /// Aggregate a flat collection of entries.
    pub fn aggregate<I>(&self, entries: I) -> Vec<DailyBundle>
    where
        I: IntoIterator<Item = ConversationEntry>,
    {
        self.bundle(entries.into_iter().map(|entry| (entry.day(), entry)))
    }

    /// Aggregate entries delivered under producer-side date keys.
    ///
    /// An entry's own timestamp still decides its day; the key it came under
    /// is only used when the entry carries no readable date itself.
    pub fn aggregate_grouped<I, E>(&self, grouped: I) -> Vec<DailyBundle>
    where
        I: IntoIterator<Item = (String, E)>,
        E: IntoIterator<Item = ConversationEntry>,
    {
        self.bundle(grouped.into_iter().flat_map(|(key, entries)| {
            let fallback = parse_day(&key);
            entries
                .into_iter()
                .map(move |entry| (entry.day().or(fallback), entry))
        }))
    }

    fn bundle<I>(&self, dated: I) -> Vec<DailyBundle>
    where
        I: Iterator<Item = (Option<NaiveDate>, ConversationEntry)>,
    {
        let mut days: BTreeMap<NaiveDate, Vec<ConversationEntry>> = BTreeMap::new();
        let mut undated = Vec::new();

        for (day, entry) in dated {
            match day {
                Some(day) => days.entry(day).or_default().push(entry),
                None => {
                    warn!(
                        id = entry.id.as_deref().unwrap_or("-"),
                        timestamp = entry.timestamp.as_deref().unwrap_or(""),
                        "entry has no readable date, filing under unknown"
                    );
                    undated.push(entry);
                }
            }
        }

        let mut bundles: Vec<DailyBundle> = days
            .into_iter()
            .rev()
            .map(|(day, entries)| self.build(DayKey::Date(day), entries))
            .collect();

        if !undated.is_empty() {
            bundles.push(self.build(DayKey::Unknown, undated));
        }
        bundles
    }

    fn build(&self, date: DayKey, mut conversations: Vec<ConversationEntry>) -> DailyBundle {
        sort_entries(&mut conversations, self.order);

        let digest = match date {
            DayKey::Date(day) => self.digests.and_then(|d| d.get(day)),
            DayKey::Unknown => None,
        };

        let images = match digest.and_then(|d| d.images.clone()) {
            Some(images) => images,
            None => collect_photos(self.photos, &conversations),
        };

        let diary_summary = digest
            .and_then(|d| d.summary.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| resolve_summary(&conversations));

        DailyBundle {
            date,
            total_messages: conversations.len(),
            locations: distinct_locations(&conversations),
            diary_summary,
            images,
            conversations,
        }
    }
}

fn sort_entries(entries: &mut [ConversationEntry], order: EntryOrder) {
    match order {
        EntryOrder::Original => {}
        EntryOrder::Recency => {
            entries.sort_by(|a, b| missing_last(a.recorded_at(), b.recorded_at(), |x, y| y.cmp(&x)))
        }
        EntryOrder::Distance(origin) => entries.sort_by(|a, b| {
            let da = a.coordinates().map(|c| origin.distance_to(&c).meters());
            let db = b.coordinates().map(|c| origin.distance_to(&c).meters());
            missing_last(da, db, |x, y| x.total_cmp(&y))
        }),
    }
}

/// The day's diary text: the first explicit diary, else each entry's summary
/// (or response) joined by blank lines.
pub fn resolve_summary(entries: &[ConversationEntry]) -> String {
    if let Some(diary) = entries.iter().find_map(explicit_diary) {
        return diary.to_string();
    }

    entries
        .iter()
        .filter_map(|entry| {
            non_blank(entry.summary.as_deref()).or_else(|| non_blank(Some(entry.response.as_str())))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn explicit_diary(entry: &ConversationEntry) -> Option<&str> {
    if let Some(diary) = non_blank(entry.diary.as_deref()) {
        return Some(diary);
    }
    let legacy = match entry.extra.get(LEGACY_DIARY_FIELD) {
        Some(Value::String(text)) => non_blank(Some(text.as_str()))?,
        _ => return None,
    };
    warn!(field = LEGACY_DIARY_FIELD, "diary read from legacy field");
    Some(legacy)
}

fn non_blank(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|t| !t.is_empty())
}

/// Normalized, de-duplicated photos of the given entries in first-seen order.
pub fn collect_photos(photos: &PhotoResolver, entries: &[ConversationEntry]) -> Vec<String> {
    let mut seen = HashSet::new();
    entries
        .iter()
        .filter_map(|entry| photos.entry_photo(entry))
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

fn distinct_locations(entries: &[ConversationEntry]) -> Vec<String> {
    let mut seen = HashSet::new();
    entries
        .iter()
        .filter_map(|entry| non_blank(entry.location_name.as_deref()))
        .filter(|name| seen.insert(*name))
        .map(str::to_string)
        .collect()
}
