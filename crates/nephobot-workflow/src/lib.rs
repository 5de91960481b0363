#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Result};
use nephobot_core::{
    now_utc, parse_utc_offset, ActionRecord, CoreError, DailyGate, EntityId, EventLedger, KvStore,
    ProcessedEvent, StatsAggregator, StorageFault, UNPARSEABLE_TARGET,
};
use nephobot_provider::{
    resolve_content_ref, ActionPublisher, ContentRepository, DecisionEngine, EndpointConfig,
    FeedSource, MediaRenderer, Notification,
};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, UtcOffset};
use tracing::{debug, error, info, info_span, warn};
use ulid::Ulid;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn default_freshness_hours() -> u32 {
    24
}

fn default_timezone_offset() -> String {
    "+00:00".to_string()
}

fn default_poll_interval_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BotConfig {
    pub db_path: PathBuf,
    /// The bot's own account id, used to detect an existing reply.
    pub bot_author_id: String,
    #[serde(default = "default_freshness_hours")]
    pub freshness_hours: u32,
    /// Calendar-day boundary for the daily gate, e.g. `+08:00`.
    #[serde(default = "default_timezone_offset")]
    pub timezone_offset: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub attach_stats_card: bool,
    pub feed: EndpointConfig,
    pub content: EndpointConfig,
    pub decision: EndpointConfig,
    pub publish: EndpointConfig,
    #[serde(default)]
    pub render: Option<EndpointConfig>,
}

impl BotConfig {
    /// Validates the whole configuration.
    ///
    /// # Errors
    /// Returns an error naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.bot_author_id.trim().is_empty() {
            return Err(anyhow!("bot_author_id MUST be non-empty"));
        }
        if self.freshness_hours == 0 {
            return Err(anyhow!("freshness_hours MUST be >= 1"));
        }
        if self.poll_interval_secs == 0 {
            return Err(anyhow!("poll_interval_secs MUST be >= 1"));
        }
        parse_utc_offset(&self.timezone_offset)
            .map_err(|err| anyhow!("timezone_offset: {err}"))?;

        self.feed.validate("feed")?;
        self.content.validate("content")?;
        self.decision.validate("decision")?;
        self.publish.validate("publish")?;
        match &self.render {
            Some(render) => render.validate("render")?,
            None => {
                if self.attach_stats_card {
                    return Err(anyhow!("attach_stats_card requires a render endpoint"));
                }
            }
        }

        Ok(())
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn utc_offset(&self) -> Result<UtcOffset> {
        parse_utc_offset(&self.timezone_offset).map_err(|err| anyhow!("timezone_offset: {err}"))
    }

    #[must_use]
    pub fn freshness_window(&self) -> Duration {
        Duration::hours(i64::from(self.freshness_hours))
    }

    #[must_use]
    pub fn poll_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.poll_interval_secs)
    }

    /// The subset of configuration the coordinator itself needs.
    ///
    /// # Errors
    /// Returns an error when the timezone offset is invalid.
    pub fn cycle_config(&self) -> Result<CycleConfig> {
        Ok(CycleConfig {
            bot_author_id: self.bot_author_id.clone(),
            freshness_window: self.freshness_window(),
            utc_offset: self.utc_offset()?,
            attach_stats_card: self.attach_stats_card,
        })
    }
}

/// Loads and validates the bot configuration YAML.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, or validated.
pub fn load_config_from_path(path: &Path) -> Result<BotConfig> {
    let content = fs::read_to_string(path)
        .map_err(|err| anyhow!("failed to read config {}: {err}", path.display()))?;
    let config: BotConfig =
        serde_yaml::from_str(&content).map_err(|err| anyhow!("invalid config YAML: {err}"))?;
    config.validate()?;
    Ok(config)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleConfig {
    pub bot_author_id: String,
    pub freshness_window: Duration,
    pub utc_offset: UtcOffset,
    pub attach_stats_card: bool,
}

// ---------------------------------------------------------------------------
// Single-flight guard
// ---------------------------------------------------------------------------

/// Ensures only one feed cycle runs at a time. A cycle requested while one is
/// in flight is dropped, not queued; the next scheduled tick covers it.
#[derive(Debug, Clone, Default)]
pub struct CycleGuard {
    busy: Arc<AtomicBool>,
}

impl CycleGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the in-flight slot, or `None` when a cycle is already running.
    /// The slot is released when the returned value is dropped, including on
    /// panic.
    #[must_use]
    pub fn try_acquire(&self) -> Option<CycleSlot> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleSlot {
                busy: Arc::clone(&self.busy),
            })
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct CycleSlot {
    busy: Arc<AtomicBool>,
}

impl Drop for CycleSlot {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Dispositions & cycle report
// ---------------------------------------------------------------------------

/// Why a notification was left unprocessed for a later cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    DetailUnavailable,
    ContentFetchFailed,
    AnalysisUnavailable,
    PublishFailed,
}

impl DeferReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DetailUnavailable => "detail_unavailable",
            Self::ContentFetchFailed => "content_fetch_failed",
            Self::AnalysisUnavailable => "analysis_unavailable",
            Self::PublishFailed => "publish_failed",
        }
    }
}

/// Terminal state of one notification within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Ledger already contained the event; nothing was touched.
    DuplicateSkipped,
    /// Reference could not be resolved; recorded with the sentinel target.
    RecordedUnparseable,
    /// Left unprocessed for retry on a later cycle; nothing was recorded.
    Deferred(DeferReason),
    RecordedStale,
    RecordedNoAttachment,
    RecordedRateLimited,
    RecordedAlreadyReplied,
    /// Reply posted, daily mark set, ledger written.
    Posted,
}

impl Disposition {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DuplicateSkipped => "duplicate_skipped",
            Self::RecordedUnparseable => "recorded_unparseable",
            Self::Deferred(_) => "deferred",
            Self::RecordedStale => "recorded_stale",
            Self::RecordedNoAttachment => "recorded_no_attachment",
            Self::RecordedRateLimited => "recorded_rate_limited",
            Self::RecordedAlreadyReplied => "recorded_already_replied",
            Self::Posted => "posted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CycleReport {
    pub cycle_id: String,
    pub fetched: usize,
    pub posted: usize,
    pub duplicates: usize,
    pub recorded_noop: usize,
    pub deferred: usize,
    pub failed: usize,
}

impl CycleReport {
    fn new(cycle_id: Ulid, fetched: usize) -> Self {
        Self {
            cycle_id: cycle_id.to_string(),
            fetched,
            posted: 0,
            duplicates: 0,
            recorded_noop: 0,
            deferred: 0,
            failed: 0,
        }
    }

    fn count(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Posted => self.posted += 1,
            Disposition::DuplicateSkipped => self.duplicates += 1,
            Disposition::Deferred(_) => self.deferred += 1,
            Disposition::RecordedUnparseable
            | Disposition::RecordedStale
            | Disposition::RecordedNoAttachment
            | Disposition::RecordedRateLimited
            | Disposition::RecordedAlreadyReplied => self.recorded_noop += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Another cycle was in flight; this request was dropped.
    Busy,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Drives one notification at a time through
/// ledger check → resolve → fetch → gates → evaluate → append → publish,
/// committing or compensating so the aggregate never shows an action that did
/// not become externally visible.
pub struct Coordinator<'a, S: KvStore> {
    store: S,
    feed: &'a dyn FeedSource,
    content: &'a dyn ContentRepository,
    decision: &'a dyn DecisionEngine,
    publisher: &'a dyn ActionPublisher,
    renderer: Option<&'a dyn MediaRenderer>,
    config: CycleConfig,
    guard: CycleGuard,
}

impl<'a, S: KvStore> Coordinator<'a, S> {
    pub fn new(
        store: S,
        feed: &'a dyn FeedSource,
        content: &'a dyn ContentRepository,
        decision: &'a dyn DecisionEngine,
        publisher: &'a dyn ActionPublisher,
        renderer: Option<&'a dyn MediaRenderer>,
        config: CycleConfig,
    ) -> Self {
        Self {
            store,
            feed,
            content,
            decision,
            publisher,
            renderer,
            config,
            guard: CycleGuard::new(),
        }
    }

    #[must_use]
    pub fn guard(&self) -> &CycleGuard {
        &self.guard
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Runs one full pass over the pending feed. Notifications are handled
    /// sequentially in feed order; a failure inside one never aborts the
    /// others.
    ///
    /// # Errors
    /// Returns an error only when the feed itself cannot be fetched.
    pub fn run_cycle(&mut self, as_of: OffsetDateTime) -> Result<CycleOutcome> {
        let Some(_slot) = self.guard.try_acquire() else {
            debug!("cycle already in flight; dropping this request");
            return Ok(CycleOutcome::Busy);
        };

        let cycle_id = Ulid::new();
        let span = info_span!("cycle", %cycle_id);
        let _entered = span.enter();

        let pending = self
            .feed
            .fetch_pending()
            .map_err(|err| anyhow!("feed fetch failed: {err}"))?;
        let mut report = CycleReport::new(cycle_id, pending.len());

        for notification in &pending {
            match self.process_notification(notification, as_of) {
                Ok(disposition) => {
                    info!(
                        event_id = %notification.id,
                        disposition = disposition.as_str(),
                        "notification handled"
                    );
                    report.count(disposition);
                }
                Err(fault) => {
                    error!(event_id = %notification.id, %fault, "notification failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            fetched = report.fetched,
            posted = report.posted,
            duplicates = report.duplicates,
            recorded_noop = report.recorded_noop,
            deferred = report.deferred,
            failed = report.failed,
            "cycle finished"
        );
        Ok(CycleOutcome::Completed(report))
    }

    /// Decides and, when clear, acts on a single notification.
    ///
    /// # Errors
    /// Returns [`StorageFault`] when the ledger or aggregate cannot be read
    /// or written; collaborator failures are absorbed into a deferred
    /// disposition instead.
    #[allow(clippy::too_many_lines)]
    pub fn process_notification(
        &mut self,
        notification: &Notification,
        as_of: OffsetDateTime,
    ) -> Result<Disposition, StorageFault> {
        let event_id = notification.id;

        if EventLedger::new(&mut self.store).is_processed(event_id)? {
            return Ok(Disposition::DuplicateSkipped);
        }

        let Some(reference) = resolve_content_ref(&notification.content_ref) else {
            warn!(
                event_id = %event_id,
                raw = %notification.content_ref,
                "unresolvable content reference"
            );
            EventLedger::new(&mut self.store).record_processed(&ProcessedEvent {
                event_id,
                resolved_target: UNPARSEABLE_TARGET.to_string(),
                processed_at: as_of,
                source_actor: notification.source_actor.clone(),
                raw_reference: notification.content_ref.clone(),
            })?;
            return Ok(Disposition::RecordedUnparseable);
        };

        let detail = match self.content.fetch_detail(&reference) {
            Ok(Some(detail)) => detail,
            Ok(None) => {
                debug!(event_id = %event_id, %reference, "content detail unavailable");
                return Ok(Disposition::Deferred(DeferReason::DetailUnavailable));
            }
            Err(err) => {
                warn!(event_id = %event_id, %reference, %err, "content fetch failed");
                return Ok(Disposition::Deferred(DeferReason::ContentFetchFailed));
            }
        };

        let entity = EntityId::new(detail.author_id.clone());
        let record_terminal = |store: &mut S, as_of: OffsetDateTime| -> Result<(), StorageFault> {
            EventLedger::new(store).record_processed(&ProcessedEvent {
                event_id,
                resolved_target: entity.to_string(),
                processed_at: as_of,
                source_actor: notification.source_actor.clone(),
                raw_reference: notification.content_ref.clone(),
            })
        };

        if as_of - detail.published_at > self.config.freshness_window {
            record_terminal(&mut self.store, as_of)?;
            return Ok(Disposition::RecordedStale);
        }

        let images = detail.image_attachments();
        if images.is_empty() {
            record_terminal(&mut self.store, as_of)?;
            return Ok(Disposition::RecordedNoAttachment);
        }

        if DailyGate::new(&mut self.store, self.config.utc_offset).has_acted_on(&entity, as_of)? {
            record_terminal(&mut self.store, as_of)?;
            return Ok(Disposition::RecordedRateLimited);
        }

        if detail
            .existing_replies
            .iter()
            .any(|reply| reply.author_id == self.config.bot_author_id)
        {
            record_terminal(&mut self.store, as_of)?;
            return Ok(Disposition::RecordedAlreadyReplied);
        }

        let evaluation = match self.decision.evaluate(&images) {
            Ok(evaluation) => evaluation,
            Err(err) => {
                warn!(event_id = %event_id, %reference, %err, "analysis failed");
                return Ok(Disposition::Deferred(DeferReason::AnalysisUnavailable));
            }
        };

        let record = ActionRecord {
            subject_id: reference.as_str().to_string(),
            timestamp: as_of,
            categories: evaluation.categories.clone(),
            unit_count: u32::try_from(images.len()).unwrap_or(u32::MAX),
            summary_text: evaluation.summary_text.clone(),
        };

        // Tentative append: the externally visible post is the commit point,
        // so a failed publish must compensate this.
        let stats = match StatsAggregator::new(&mut self.store).append(
            &entity,
            &detail.author_name,
            record,
        ) {
            Ok(stats) => stats,
            Err(CoreError::Validation(message)) => {
                warn!(event_id = %event_id, %message, "evaluation produced an invalid record");
                return Ok(Disposition::Deferred(DeferReason::AnalysisUnavailable));
            }
            Err(CoreError::Storage(fault)) => return Err(fault),
        };

        let media = if self.config.attach_stats_card {
            match self.renderer {
                Some(renderer) => match renderer.render(&stats) {
                    Ok(path) => Some(path),
                    Err(err) => {
                        warn!(event_id = %event_id, %err, "stats card rendering failed; posting text-only");
                        None
                    }
                },
                None => None,
            }
        } else {
            None
        };

        match self
            .publisher
            .publish(&reference, &evaluation.summary_text, media.as_deref())
        {
            Ok(true) => {
                if let Err(fault) = DailyGate::new(&mut self.store, self.config.utc_offset)
                    .mark_acted(&entity, as_of)
                {
                    // The post already happened; a missing mark risks one
                    // extra attempt tomorrow at worst.
                    error!(event_id = %event_id, %entity, %fault, "daily mark failed after confirmed post; action stands");
                }
                record_terminal(&mut self.store, as_of)?;
                Ok(Disposition::Posted)
            }
            Ok(false) => {
                warn!(event_id = %event_id, %reference, "publish rejected; compensating");
                self.compensate(&entity);
                Ok(Disposition::Deferred(DeferReason::PublishFailed))
            }
            Err(err) => {
                warn!(event_id = %event_id, %reference, %err, "publish failed; compensating");
                self.compensate(&entity);
                Ok(Disposition::Deferred(DeferReason::PublishFailed))
            }
        }
    }

    /// Undoes the tentative append after a failed publish. Failures here are
    /// logged, never re-thrown: an aggregate drift beats a crash loop.
    fn compensate(&mut self, entity: &EntityId) {
        match StatsAggregator::new(&mut self.store).rollback_last(entity) {
            Ok(true) => {}
            Ok(false) => {
                error!(%entity, "rollback found nothing to undo");
            }
            Err(err) => {
                error!(%entity, %err, "rollback failed; aggregate may drift until replay");
            }
        }
    }

    /// Timer loop: one cycle per tick, failures logged and the loop goes on.
    ///
    /// # Errors
    /// Never returns under normal operation.
    pub fn run_forever(&mut self, interval: StdDuration) -> Result<()> {
        info!(interval_secs = interval.as_secs(), "poll loop started");
        loop {
            match self.run_cycle(now_utc()) {
                Ok(CycleOutcome::Completed(report)) => {
                    debug!(cycle_id = %report.cycle_id, "cycle completed");
                }
                Ok(CycleOutcome::Busy) => {
                    warn!("tick skipped: previous cycle still in flight");
                }
                Err(err) => {
                    error!(%err, "cycle failed");
                }
            }
            std::thread::sleep(interval);
        }
    }
}
