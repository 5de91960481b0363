#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

/// Number of action records retained per entity for point-in-time inspection
/// and compensation. Rollback only reaches records still inside this window.
pub const RECENT_WINDOW: usize = 100;

/// Target recorded for notifications whose content reference could not be
/// resolved to any entity.
pub const UNPARSEABLE_TARGET: &str = "unparseable";

pub const PROCESSED_PREFIX: &str = "processed_at:";
pub const DAILY_PREFIX: &str = "daily_comment:";
pub const STATS_PREFIX: &str = "user:";
pub const RECORD_PREFIX: &str = "record:";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("storage fault during {op}: {detail}")]
pub struct StorageFault {
    pub op: String,
    pub detail: String,
}

impl StorageFault {
    #[must_use]
    pub fn new(op: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Storage(#[from] StorageFault),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct EventId(pub i64);

impl Display for EventId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One category assigned to an analyzed attachment, e.g. a cloud genus with
/// the classifier's confidence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryObservation {
    pub label: String,
    pub confidence: f32,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionRecord {
    pub subject_id: String,
    pub timestamp: OffsetDateTime,
    pub categories: Vec<CategoryObservation>,
    pub unit_count: u32,
    pub summary_text: String,
}

impl ActionRecord {
    /// Validates a record before it is appended to an entity's statistics.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when required fields are empty or a
    /// confidence value falls outside `[0.0, 1.0]`.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.subject_id.trim().is_empty() {
            return Err(CoreError::Validation(
                "subject_id MUST be non-empty".to_string(),
            ));
        }

        if self.summary_text.trim().is_empty() {
            return Err(CoreError::Validation(
                "summary_text MUST be non-empty".to_string(),
            ));
        }

        for category in &self.categories {
            if category.label.trim().is_empty() {
                return Err(CoreError::Validation(
                    "category label MUST be non-empty".to_string(),
                ));
            }
            if !(0.0..=1.0).contains(&category.confidence) {
                return Err(CoreError::Validation(format!(
                    "confidence for '{}' MUST be in [0.0, 1.0]",
                    category.label
                )));
            }
        }

        Ok(())
    }
}

/// Proof that a notification received a terminal disposition. Presence of the
/// row is the dedup signal; the remaining fields are audit context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessedEvent {
    pub event_id: EventId,
    pub resolved_target: String,
    pub processed_at: OffsetDateTime,
    pub source_actor: String,
    pub raw_reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyActionMark {
    pub entity: EntityId,
    pub day: String,
    pub marked_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityStats {
    pub display_name: String,
    pub total_actions: u64,
    pub total_units: u64,
    pub category_histogram: BTreeMap<String, u64>,
    pub first_action_at: OffsetDateTime,
    pub last_action_at: OffsetDateTime,
    pub recent_records: Vec<ActionRecord>,
}

impl EntityStats {
    #[must_use]
    pub fn distinct_categories(&self) -> usize {
        self.category_histogram.len()
    }
}

/// Row of [`StatsAggregator::active_entity_ranking`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EntityActivity {
    pub entity: EntityId,
    pub total_actions: u64,
    pub distinct_categories: usize,
}

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Parses an RFC3339 timestamp and normalizes it to UTC.
///
/// # Errors
/// Returns [`CoreError::Validation`] when parsing fails.
pub fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, CoreError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| CoreError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;
    Ok(parsed.to_offset(UtcOffset::UTC))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`CoreError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, CoreError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| CoreError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

/// Parses an explicit UTC offset of the form `Z`, `+HH:MM` or `-HH:MM`.
///
/// The day boundary for the daily gate is always derived from a configured
/// offset, never from the ambient process timezone.
///
/// # Errors
/// Returns [`CoreError::Validation`] for any other form or an out-of-range
/// offset.
pub fn parse_utc_offset(value: &str) -> Result<UtcOffset, CoreError> {
    if value == "Z" || value == "+00:00" || value == "-00:00" {
        return Ok(UtcOffset::UTC);
    }

    let invalid = || CoreError::Validation(format!("invalid UTC offset '{value}'; use +HH:MM"));

    let (sign, rest) = if let Some(rest) = value.strip_prefix('+') {
        (1_i8, rest)
    } else if let Some(rest) = value.strip_prefix('-') {
        (-1_i8, rest)
    } else {
        return Err(invalid());
    };

    let (raw_hours, raw_minutes) = rest.split_once(':').ok_or_else(invalid)?;
    let hours: i8 = raw_hours.parse().map_err(|_| invalid())?;
    let minutes: i8 = raw_minutes.parse().map_err(|_| invalid())?;
    if !(0..=18).contains(&hours) || !(0..=59).contains(&minutes) {
        return Err(invalid());
    }

    UtcOffset::from_hms(sign * hours, sign * minutes, 0).map_err(|_| invalid())
}

/// Calendar-day key (`YYYY-MM-DD`) of `at` in the configured offset.
#[must_use]
pub fn day_key(at: OffsetDateTime, offset: UtcOffset) -> String {
    let date = at.to_offset(offset).date();
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

// ---------------------------------------------------------------------------
// Keyspace
// ---------------------------------------------------------------------------

#[must_use]
pub fn processed_key(event_id: EventId) -> String {
    format!("{PROCESSED_PREFIX}{event_id}")
}

#[must_use]
pub fn daily_key(entity: &EntityId, day: &str) -> String {
    format!("{DAILY_PREFIX}{entity}:{day}")
}

#[must_use]
pub fn stats_key(entity: &EntityId) -> String {
    format!("{STATS_PREFIX}{entity}")
}

/// Point-lookup key of the action-record mirror.
///
/// # Errors
/// Returns [`CoreError::Validation`] when the timestamp cannot be formatted.
pub fn record_key(entity: &EntityId, timestamp: OffsetDateTime) -> Result<String, CoreError> {
    Ok(format!(
        "{RECORD_PREFIX}{entity}:{}",
        format_rfc3339(timestamp)?
    ))
}

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

/// Ordered, crash-durable mapping from string keys to JSON values. The
/// processing core depends on this contract only; SQLite provides the durable
/// implementation and [`MemoryKvStore`] the volatile one.
pub trait KvStore {
    #[allow(clippy::missing_errors_doc)]
    fn get(&self, key: &str) -> Result<Option<Value>, StorageFault>;

    #[allow(clippy::missing_errors_doc)]
    fn put(&mut self, key: &str, value: &Value) -> Result<(), StorageFault>;

    /// Removes `key`, reporting whether an entry existed.
    #[allow(clippy::missing_errors_doc)]
    fn delete(&mut self, key: &str) -> Result<bool, StorageFault>;

    /// All entries whose key starts with `prefix`, in ascending key order.
    #[allow(clippy::missing_errors_doc)]
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageFault>;
}

/// Volatile store for tests and dry-runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryKvStore {
    entries: BTreeMap<String, Value>,
}

impl MemoryKvStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StorageFault> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: &Value) -> Result<(), StorageFault> {
        self.entries.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<bool, StorageFault> {
        Ok(self.entries.remove(key).is_some())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageFault> {
        Ok(self
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<Value, StorageFault> {
    serde_json::to_value(value)
        .map_err(|err| StorageFault::new("encode", format!("failed to encode {key}: {err}")))
}

fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Result<T, StorageFault> {
    serde_json::from_value(value)
        .map_err(|err| StorageFault::new("decode", format!("invalid stored JSON at {key}: {err}")))
}

// ---------------------------------------------------------------------------
// Event ledger
// ---------------------------------------------------------------------------

/// Durable set of notification ids already given a terminal disposition.
///
/// Consulted before any external action is attempted; written only after a
/// terminal outcome, so a crash mid-action leaves the event eligible for
/// retry on the next cycle.
pub struct EventLedger<'a, S: KvStore> {
    store: &'a mut S,
}

impl<'a, S: KvStore> EventLedger<'a, S> {
    pub fn new(store: &'a mut S) -> Self {
        Self { store }
    }

    /// # Errors
    /// Returns [`StorageFault`] on an underlying store failure. A missing key
    /// is not a failure and reads as `false`.
    pub fn is_processed(&self, event_id: EventId) -> Result<bool, StorageFault> {
        Ok(self.store.get(&processed_key(event_id))?.is_some())
    }

    /// Records a terminal disposition. Overwriting the same `event_id` is
    /// allowed but does not occur in normal operation.
    ///
    /// # Errors
    /// Returns [`StorageFault`] on an underlying store failure.
    pub fn record_processed(&mut self, event: &ProcessedEvent) -> Result<(), StorageFault> {
        let key = processed_key(event.event_id);
        let value = encode(&key, event)?;
        self.store.put(&key, &value)
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn get_processed(&self, event_id: EventId) -> Result<Option<ProcessedEvent>, StorageFault> {
        let key = processed_key(event_id);
        match self.store.get(&key)? {
            Some(value) => Ok(Some(decode(&key, value)?)),
            None => Ok(None),
        }
    }

    /// Removes a ledger record so the notification becomes eligible again.
    /// Operator/manual-replay surface only; the workflow never deletes.
    ///
    /// # Errors
    /// Returns [`StorageFault`] on an underlying store failure.
    pub fn delete_processed(&mut self, event_id: EventId) -> Result<bool, StorageFault> {
        self.store.delete(&processed_key(event_id))
    }

    /// All processed event ids, most recent first.
    ///
    /// # Errors
    /// Returns [`StorageFault`] on an underlying store failure or a corrupt
    /// stored record.
    pub fn list_processed(&self) -> Result<Vec<EventId>, StorageFault> {
        let mut events: Vec<ProcessedEvent> = Vec::new();
        for (key, value) in self.store.scan_prefix(PROCESSED_PREFIX)? {
            events.push(decode(&key, value)?);
        }
        events.sort_by(|lhs, rhs| {
            rhs.processed_at
                .cmp(&lhs.processed_at)
                .then_with(|| rhs.event_id.cmp(&lhs.event_id))
        });
        Ok(events.into_iter().map(|event| event.event_id).collect())
    }
}

// ---------------------------------------------------------------------------
// Daily gate
// ---------------------------------------------------------------------------

/// At most one action per entity per calendar day, independent of which
/// notification triggered it. The day boundary comes from the configured
/// offset, not the process timezone.
pub struct DailyGate<'a, S: KvStore> {
    store: &'a mut S,
    offset: UtcOffset,
}

impl<'a, S: KvStore> DailyGate<'a, S> {
    pub fn new(store: &'a mut S, offset: UtcOffset) -> Self {
        Self { store, offset }
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn has_acted_on(
        &self,
        entity: &EntityId,
        as_of: OffsetDateTime,
    ) -> Result<bool, StorageFault> {
        let key = daily_key(entity, &day_key(as_of, self.offset));
        Ok(self.store.get(&key)?.is_some())
    }

    /// Marks the entity as acted on for the calendar day of `as_of`. Called
    /// only after the action is confirmed successful; old marks are never
    /// purged, they simply stop matching the current day.
    ///
    /// # Errors
    /// Returns [`StorageFault`] on an underlying store failure.
    pub fn mark_acted(&mut self, entity: &EntityId, as_of: OffsetDateTime) -> Result<(), StorageFault> {
        let day = day_key(as_of, self.offset);
        let key = daily_key(entity, &day);
        let mark = DailyActionMark {
            entity: entity.clone(),
            day,
            marked_at: as_of,
        };
        let value = encode(&key, &mark)?;
        self.store.put(&key, &value)
    }
}

// ---------------------------------------------------------------------------
// Statistics aggregator
// ---------------------------------------------------------------------------

/// Owner of every [`EntityStats`] mutation. Guarantees on each append or
/// rollback that `total_actions` equals appends minus rollbacks and that the
/// histogram sum equals the category entries of all counted records.
pub struct StatsAggregator<'a, S: KvStore> {
    store: &'a mut S,
}

impl<'a, S: KvStore> StatsAggregator<'a, S> {
    pub fn new(store: &'a mut S) -> Self {
        Self { store }
    }

    /// Appends a record to the entity's aggregate, creating it on first
    /// action, and mirrors the record for point lookup. The display name is
    /// always overwritten with the latest value (name-change tolerance).
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] for an invalid record and
    /// [`CoreError::Storage`] on store failure.
    pub fn append(
        &mut self,
        entity: &EntityId,
        display_name: &str,
        record: ActionRecord,
    ) -> Result<EntityStats, CoreError> {
        record.validate()?;

        let stats = match self.get_stats(entity)? {
            None => EntityStats {
                display_name: display_name.to_string(),
                total_actions: 1,
                total_units: u64::from(record.unit_count),
                category_histogram: histogram_of(&record),
                first_action_at: record.timestamp,
                last_action_at: record.timestamp,
                recent_records: vec![record.clone()],
            },
            Some(mut stats) => {
                stats.display_name = display_name.to_string();
                stats.total_actions += 1;
                stats.total_units += u64::from(record.unit_count);
                stats.last_action_at = record.timestamp;
                for category in &record.categories {
                    *stats
                        .category_histogram
                        .entry(category.label.clone())
                        .or_insert(0) += 1;
                }
                stats.recent_records.push(record.clone());
                if stats.recent_records.len() > RECENT_WINDOW {
                    stats.recent_records.remove(0);
                }
                stats
            }
        };

        let key = stats_key(entity);
        let value = encode(&key, &stats).map_err(CoreError::Storage)?;
        self.store.put(&key, &value)?;

        let mirror_key = record_key(entity, record.timestamp)?;
        let mirror = encode(&mirror_key, &record).map_err(CoreError::Storage)?;
        self.store.put(&mirror_key, &mirror)?;

        Ok(stats)
    }

    /// Compensates the most recent append. Returns `false` when the entity
    /// has no stats or the retention window is empty.
    ///
    /// Rollback of a record that has already been evicted past the retention
    /// window is not supported: this pops whatever record is last in the
    /// window. Callers must invoke it only immediately after the matching
    /// append, before any further append for the same entity. The workflow
    /// guarantees this by rolling back synchronously within the same
    /// processing step.
    ///
    /// # Errors
    /// Returns [`CoreError::Storage`] on store failure.
    pub fn rollback_last(&mut self, entity: &EntityId) -> Result<bool, CoreError> {
        let Some(mut stats) = self.get_stats(entity)? else {
            return Ok(false);
        };

        let Some(record) = stats.recent_records.pop() else {
            return Ok(false);
        };

        stats.total_actions = stats.total_actions.saturating_sub(1);
        stats.total_units = stats
            .total_units
            .saturating_sub(u64::from(record.unit_count));
        for category in &record.categories {
            if let Some(count) = stats.category_histogram.get_mut(&category.label) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    stats.category_histogram.remove(&category.label);
                }
            }
        }
        stats.last_action_at = stats
            .recent_records
            .last()
            .map_or(stats.first_action_at, |last| last.timestamp);

        let key = stats_key(entity);
        let value = encode(&key, &stats).map_err(CoreError::Storage)?;
        self.store.put(&key, &value)?;

        let mirror_key = record_key(entity, record.timestamp)?;
        let _ = self.store.delete(&mirror_key)?;

        Ok(true)
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn get_stats(&self, entity: &EntityId) -> Result<Option<EntityStats>, StorageFault> {
        let key = stats_key(entity);
        match self.store.get(&key)? {
            Some(value) => Ok(Some(decode(&key, value)?)),
            None => Ok(None),
        }
    }

    /// Most recent records first, at most `limit`.
    ///
    /// # Errors
    /// Returns [`StorageFault`] on store failure.
    pub fn get_recent(
        &self,
        entity: &EntityId,
        limit: usize,
    ) -> Result<Vec<ActionRecord>, StorageFault> {
        let Some(stats) = self.get_stats(entity)? else {
            return Ok(Vec::new());
        };
        Ok(stats
            .recent_records
            .into_iter()
            .rev()
            .take(limit)
            .collect())
    }

    /// Category labels ranked by total count across all entities, ties broken
    /// by label. Full scan; acceptable at single-operator scale.
    ///
    /// # Errors
    /// Returns [`StorageFault`] on store failure.
    pub fn global_category_ranking(&self) -> Result<Vec<(String, u64)>, StorageFault> {
        let mut totals: BTreeMap<String, u64> = BTreeMap::new();
        for (key, value) in self.store.scan_prefix(STATS_PREFIX)? {
            let stats: EntityStats = decode(&key, value)?;
            for (label, count) in stats.category_histogram {
                *totals.entry(label).or_insert(0) += count;
            }
        }
        let mut ranking: Vec<(String, u64)> = totals.into_iter().collect();
        ranking.sort_by(|lhs, rhs| rhs.1.cmp(&lhs.1).then_with(|| lhs.0.cmp(&rhs.0)));
        Ok(ranking)
    }

    /// Entities ranked by total actions, ties broken by entity id.
    ///
    /// # Errors
    /// Returns [`StorageFault`] on store failure.
    pub fn active_entity_ranking(&self, limit: usize) -> Result<Vec<EntityActivity>, StorageFault> {
        let mut rows: Vec<EntityActivity> = Vec::new();
        for (key, value) in self.store.scan_prefix(STATS_PREFIX)? {
            let stats: EntityStats = decode(&key, value)?;
            let entity = EntityId::new(key.trim_start_matches(STATS_PREFIX));
            rows.push(EntityActivity {
                entity,
                total_actions: stats.total_actions,
                distinct_categories: stats.distinct_categories(),
            });
        }
        rows.sort_by(|lhs, rhs| {
            rhs.total_actions
                .cmp(&lhs.total_actions)
                .then_with(|| lhs.entity.cmp(&rhs.entity))
        });
        rows.truncate(limit);
        Ok(rows)
    }
}

fn histogram_of(record: &ActionRecord) -> BTreeMap<String, u64> {
    let mut histogram = BTreeMap::new();
    for category in &record.categories {
        *histogram.entry(category.label.clone()).or_insert(0) += 1;
    }
    histogram
}
