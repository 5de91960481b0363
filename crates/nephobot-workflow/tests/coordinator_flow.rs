use std::collections::BTreeMap;
use std::path::PathBuf;

use nephobot_core::{
    parse_rfc3339, parse_utc_offset, CategoryObservation, DailyGate, EntityId, EntityStats,
    EventId, EventLedger, MemoryKvStore, StatsAggregator, UNPARSEABLE_TARGET,
};
use nephobot_provider::{
    Attachment, AttachmentKind, CollaboratorError, ContentDetail, Evaluation, FixedDecisionEngine,
    MediaRenderer, Notification, PublishOutcome, RecordingPublisher, ReplyStub, ScriptedFeed,
    StaticContentRepository,
};
use nephobot_workflow::{
    Coordinator, CycleConfig, CycleOutcome, DeferReason, Disposition,
};
use time::{Duration, OffsetDateTime};

const BOT_ID: &str = "bot-1";
const NOW: &str = "2026-03-05T12:00:00Z";

fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("expected Ok(..), got error: {err}"),
    }
}

fn must_some<T>(value: Option<T>) -> T {
    match value {
        Some(inner) => inner,
        None => panic!("expected Some(..), got None"),
    }
}

fn must_utc(value: &str) -> OffsetDateTime {
    must_ok(parse_rfc3339(value))
}

fn cycle_config() -> CycleConfig {
    CycleConfig {
        bot_author_id: BOT_ID.to_string(),
        freshness_window: Duration::hours(24),
        utc_offset: must_ok(parse_utc_offset("+00:00")),
        attach_stats_card: false,
    }
}

fn notification(id: i64, content_ref: &str) -> Notification {
    Notification {
        id: EventId(id),
        source_actor: "mentioner".to_string(),
        content_ref: content_ref.to_string(),
        trigger_context: "@bot what cloud is this".to_string(),
    }
}

fn detail(author: &str, published_at: &str, images: usize, reply_authors: &[&str]) -> ContentDetail {
    ContentDetail {
        published_at: must_utc(published_at),
        attachments: (0..images)
            .map(|index| Attachment {
                url: format!("https://cdn.example.com/{index}.jpg"),
                kind: AttachmentKind::Image,
            })
            .collect(),
        existing_replies: reply_authors
            .iter()
            .map(|author_id| ReplyStub {
                author_id: (*author_id).to_string(),
            })
            .collect(),
        author_id: author.to_string(),
        author_name: format!("{author}-name"),
    }
}

fn evaluation() -> Evaluation {
    Evaluation {
        categories: vec![CategoryObservation {
            label: "cumulus".to_string(),
            confidence: 0.9,
            note: None,
        }],
        summary_text: "A fine cumulus over the ridge.".to_string(),
    }
}

fn content_repo(entries: &[(&str, ContentDetail)]) -> StaticContentRepository {
    let map: BTreeMap<String, ContentDetail> = entries
        .iter()
        .map(|(reference, detail)| ((*reference).to_string(), detail.clone()))
        .collect();
    StaticContentRepository::new(map)
}

struct FailingRenderer;

impl MediaRenderer for FailingRenderer {
    fn render(&self, _stats: &EntityStats) -> Result<PathBuf, CollaboratorError> {
        Err(CollaboratorError::Transient(
            "scripted render outage".to_string(),
        ))
    }
}

struct PathRenderer(PathBuf);

impl MediaRenderer for PathRenderer {
    fn render(&self, _stats: &EntityStats) -> Result<PathBuf, CollaboratorError> {
        Ok(self.0.clone())
    }
}

#[test]
fn fresh_mention_with_image_is_posted_and_recorded() {
    let feed = ScriptedFeed::new(vec![vec![notification(42, "opus/9")]]);
    let content = content_repo(&[("opus/9", detail("u9", "2026-03-05T10:00:00Z", 1, &[]))]);
    let decision = FixedDecisionEngine::new(evaluation());
    let publisher = RecordingPublisher::new();

    let mut coordinator = Coordinator::new(
        MemoryKvStore::new(),
        &feed,
        &content,
        &decision,
        &publisher,
        None,
        cycle_config(),
    );
    let outcome = must_ok(coordinator.run_cycle(must_utc(NOW)));

    let CycleOutcome::Completed(report) = outcome else {
        panic!("expected a completed cycle");
    };
    assert_eq!(report.fetched, 1);
    assert_eq!(report.posted, 1);
    assert_eq!(publisher.posted().len(), 1);

    let entity = EntityId::new("u9");
    let as_of = must_utc(NOW);
    assert!(must_ok(
        EventLedger::new(coordinator.store_mut()).is_processed(EventId(42))
    ));
    let stats = must_some(must_ok(
        StatsAggregator::new(coordinator.store_mut()).get_stats(&entity)
    ));
    assert_eq!(stats.total_actions, 1);
    assert_eq!(stats.display_name, "u9-name");
    let offset = must_ok(parse_utc_offset("+00:00"));
    assert!(must_ok(
        DailyGate::new(coordinator.store_mut(), offset).has_acted_on(&entity, as_of)
    ));
}

#[test]
fn failed_publish_rolls_back_and_leaves_event_eligible() {
    let feed = ScriptedFeed::new(vec![vec![notification(42, "opus/9")]]);
    let content = content_repo(&[("opus/9", detail("u9", "2026-03-05T10:00:00Z", 1, &[]))]);
    let decision = FixedDecisionEngine::new(evaluation());
    let publisher = RecordingPublisher::new();
    publisher.set_outcome(PublishOutcome::Fail);

    let mut coordinator = Coordinator::new(
        MemoryKvStore::new(),
        &feed,
        &content,
        &decision,
        &publisher,
        None,
        cycle_config(),
    );
    must_ok(coordinator.run_cycle(must_utc(NOW)));

    let entity = EntityId::new("u9");
    let as_of = must_utc(NOW);
    assert!(!must_ok(
        EventLedger::new(coordinator.store_mut()).is_processed(EventId(42))
    ));
    let stats = must_some(must_ok(
        StatsAggregator::new(coordinator.store_mut()).get_stats(&entity)
    ));
    assert_eq!(stats.total_actions, 0);
    assert!(stats.recent_records.is_empty());
    let offset = must_ok(parse_utc_offset("+00:00"));
    assert!(!must_ok(
        DailyGate::new(coordinator.store_mut(), offset).has_acted_on(&entity, as_of)
    ));
}

#[test]
fn rejected_publish_is_compensated_like_a_failure() {
    let feed = ScriptedFeed::new(vec![]);
    let content = content_repo(&[("opus/9", detail("u9", "2026-03-05T10:00:00Z", 1, &[]))]);
    let decision = FixedDecisionEngine::new(evaluation());
    let publisher = RecordingPublisher::new();
    publisher.set_outcome(PublishOutcome::Rejected);

    let mut coordinator = Coordinator::new(
        MemoryKvStore::new(),
        &feed,
        &content,
        &decision,
        &publisher,
        None,
        cycle_config(),
    );
    let disposition = must_ok(
        coordinator.process_notification(&notification(42, "opus/9"), must_utc(NOW)),
    );

    assert_eq!(
        disposition,
        Disposition::Deferred(DeferReason::PublishFailed)
    );
    let stats = must_some(must_ok(
        StatsAggregator::new(coordinator.store_mut()).get_stats(&EntityId::new("u9"))
    ));
    assert_eq!(stats.total_actions, 0);
}

#[test]
fn stale_content_is_recorded_without_acting() {
    let feed = ScriptedFeed::new(vec![]);
    // Published 30 hours before the cycle; freshness window is 24.
    let content = content_repo(&[("opus/9", detail("u9", "2026-03-04T06:00:00Z", 1, &[]))]);
    let decision = FixedDecisionEngine::new(evaluation());
    let publisher = RecordingPublisher::new();

    let mut coordinator = Coordinator::new(
        MemoryKvStore::new(),
        &feed,
        &content,
        &decision,
        &publisher,
        None,
        cycle_config(),
    );
    let disposition = must_ok(
        coordinator.process_notification(&notification(42, "opus/9"), must_utc(NOW)),
    );

    assert_eq!(disposition, Disposition::RecordedStale);
    assert_eq!(decision.call_count(), 0);
    assert_eq!(publisher.call_count(), 0);
    assert!(must_ok(
        EventLedger::new(coordinator.store_mut()).is_processed(EventId(42))
    ));
    assert!(must_ok(
        StatsAggregator::new(coordinator.store_mut()).get_stats(&EntityId::new("u9"))
    )
    .is_none());
}

#[test]
fn second_cycle_skips_processed_event_without_collaborator_calls() {
    let batch = vec![notification(42, "opus/9")];
    let feed = ScriptedFeed::new(vec![batch.clone(), batch]);
    let content = content_repo(&[("opus/9", detail("u9", "2026-03-05T10:00:00Z", 1, &[]))]);
    let decision = FixedDecisionEngine::new(evaluation());
    let publisher = RecordingPublisher::new();

    let mut coordinator = Coordinator::new(
        MemoryKvStore::new(),
        &feed,
        &content,
        &decision,
        &publisher,
        None,
        cycle_config(),
    );
    must_ok(coordinator.run_cycle(must_utc(NOW)));
    assert_eq!(content.call_count(), 1);
    assert_eq!(decision.call_count(), 1);
    assert_eq!(publisher.call_count(), 1);

    let outcome = must_ok(coordinator.run_cycle(must_utc("2026-03-05T12:10:00Z")));
    let CycleOutcome::Completed(report) = outcome else {
        panic!("expected a completed cycle");
    };
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.posted, 0);
    assert_eq!(content.call_count(), 1);
    assert_eq!(decision.call_count(), 1);
    assert_eq!(publisher.call_count(), 1);
}

#[test]
fn content_without_attachments_short_circuits() {
    let feed = ScriptedFeed::new(vec![]);
    let content = content_repo(&[("opus/9", detail("u9", "2026-03-05T10:00:00Z", 0, &[]))]);
    let decision = FixedDecisionEngine::new(evaluation());
    let publisher = RecordingPublisher::new();

    let mut coordinator = Coordinator::new(
        MemoryKvStore::new(),
        &feed,
        &content,
        &decision,
        &publisher,
        None,
        cycle_config(),
    );
    let disposition = must_ok(
        coordinator.process_notification(&notification(42, "opus/9"), must_utc(NOW)),
    );

    assert_eq!(disposition, Disposition::RecordedNoAttachment);
    assert_eq!(decision.call_count(), 0);
    assert_eq!(publisher.call_count(), 0);
    assert!(must_ok(
        EventLedger::new(coordinator.store_mut()).is_processed(EventId(42))
    ));
    assert!(must_ok(
        StatsAggregator::new(coordinator.store_mut()).get_stats(&EntityId::new("u9"))
    )
    .is_none());
}

#[test]
fn rate_limited_entity_short_circuits() {
    let feed = ScriptedFeed::new(vec![]);
    let content = content_repo(&[("opus/9", detail("u9", "2026-03-05T10:00:00Z", 1, &[]))]);
    let decision = FixedDecisionEngine::new(evaluation());
    let publisher = RecordingPublisher::new();

    let mut store = MemoryKvStore::new();
    let offset = must_ok(parse_utc_offset("+00:00"));
    must_ok(DailyGate::new(&mut store, offset).mark_acted(&EntityId::new("u9"), must_utc(NOW)));

    let mut coordinator = Coordinator::new(
        store,
        &feed,
        &content,
        &decision,
        &publisher,
        None,
        cycle_config(),
    );
    let disposition = must_ok(
        coordinator.process_notification(&notification(43, "opus/9"), must_utc(NOW)),
    );

    assert_eq!(disposition, Disposition::RecordedRateLimited);
    assert_eq!(publisher.call_count(), 0);
    assert!(must_ok(
        EventLedger::new(coordinator.store_mut()).is_processed(EventId(43))
    ));
}

#[test]
fn existing_reply_from_bot_short_circuits() {
    let feed = ScriptedFeed::new(vec![]);
    let content = content_repo(&[(
        "opus/9",
        detail("u9", "2026-03-05T10:00:00Z", 1, &["somebody", BOT_ID]),
    )]);
    let decision = FixedDecisionEngine::new(evaluation());
    let publisher = RecordingPublisher::new();

    let mut coordinator = Coordinator::new(
        MemoryKvStore::new(),
        &feed,
        &content,
        &decision,
        &publisher,
        None,
        cycle_config(),
    );
    let disposition = must_ok(
        coordinator.process_notification(&notification(42, "opus/9"), must_utc(NOW)),
    );

    assert_eq!(disposition, Disposition::RecordedAlreadyReplied);
    assert_eq!(publisher.call_count(), 0);
}

#[test]
fn unresolvable_reference_is_recorded_with_sentinel() {
    let feed = ScriptedFeed::new(vec![]);
    let content = content_repo(&[]);
    let decision = FixedDecisionEngine::new(evaluation());
    let publisher = RecordingPublisher::new();

    let mut coordinator = Coordinator::new(
        MemoryKvStore::new(),
        &feed,
        &content,
        &decision,
        &publisher,
        None,
        cycle_config(),
    );
    let disposition = must_ok(
        coordinator.process_notification(&notification(42, "not a reference"), must_utc(NOW)),
    );

    assert_eq!(disposition, Disposition::RecordedUnparseable);
    assert_eq!(content.call_count(), 0);
    let recorded = must_some(must_ok(
        EventLedger::new(coordinator.store_mut()).get_processed(EventId(42))
    ));
    assert_eq!(recorded.resolved_target, UNPARSEABLE_TARGET);
    assert_eq!(recorded.raw_reference, "not a reference");
}

#[test]
fn unavailable_detail_defers_for_retry() {
    let feed = ScriptedFeed::new(vec![]);
    let content = content_repo(&[]);
    let decision = FixedDecisionEngine::new(evaluation());
    let publisher = RecordingPublisher::new();

    let mut coordinator = Coordinator::new(
        MemoryKvStore::new(),
        &feed,
        &content,
        &decision,
        &publisher,
        None,
        cycle_config(),
    );

    let first = must_ok(
        coordinator.process_notification(&notification(42, "opus/9"), must_utc(NOW)),
    );
    assert_eq!(first, Disposition::Deferred(DeferReason::DetailUnavailable));
    assert!(!must_ok(
        EventLedger::new(coordinator.store_mut()).is_processed(EventId(42))
    ));

    // Still eligible: a later cycle reaches the repository again.
    let second = must_ok(
        coordinator.process_notification(&notification(42, "opus/9"), must_utc(NOW)),
    );
    assert_eq!(second, Disposition::Deferred(DeferReason::DetailUnavailable));
    assert_eq!(content.call_count(), 2);
}

#[test]
fn analysis_outage_defers_without_touching_stats() {
    let feed = ScriptedFeed::new(vec![]);
    let content = content_repo(&[("opus/9", detail("u9", "2026-03-05T10:00:00Z", 1, &[]))]);
    let decision = FixedDecisionEngine::new(evaluation());
    decision.set_failing(true);
    let publisher = RecordingPublisher::new();

    let mut coordinator = Coordinator::new(
        MemoryKvStore::new(),
        &feed,
        &content,
        &decision,
        &publisher,
        None,
        cycle_config(),
    );
    let disposition = must_ok(
        coordinator.process_notification(&notification(42, "opus/9"), must_utc(NOW)),
    );

    assert_eq!(
        disposition,
        Disposition::Deferred(DeferReason::AnalysisUnavailable)
    );
    assert_eq!(publisher.call_count(), 0);
    assert!(!must_ok(
        EventLedger::new(coordinator.store_mut()).is_processed(EventId(42))
    ));
    assert!(must_ok(
        StatsAggregator::new(coordinator.store_mut()).get_stats(&EntityId::new("u9"))
    )
    .is_none());
}

#[test]
fn failure_in_one_notification_does_not_abort_the_cycle() {
    let feed = ScriptedFeed::new(vec![vec![
        notification(1, "not a reference"),
        notification(2, "opus/9"),
    ]]);
    let content = content_repo(&[("opus/9", detail("u9", "2026-03-05T10:00:00Z", 1, &[]))]);
    let decision = FixedDecisionEngine::new(evaluation());
    let publisher = RecordingPublisher::new();

    let mut coordinator = Coordinator::new(
        MemoryKvStore::new(),
        &feed,
        &content,
        &decision,
        &publisher,
        None,
        cycle_config(),
    );
    let outcome = must_ok(coordinator.run_cycle(must_utc(NOW)));

    let CycleOutcome::Completed(report) = outcome else {
        panic!("expected a completed cycle");
    };
    assert_eq!(report.recorded_noop, 1);
    assert_eq!(report.posted, 1);
}

#[test]
fn busy_guard_drops_a_concurrent_cycle_request() {
    let feed = ScriptedFeed::new(vec![vec![notification(42, "opus/9")]]);
    let content = content_repo(&[("opus/9", detail("u9", "2026-03-05T10:00:00Z", 1, &[]))]);
    let decision = FixedDecisionEngine::new(evaluation());
    let publisher = RecordingPublisher::new();

    let mut coordinator = Coordinator::new(
        MemoryKvStore::new(),
        &feed,
        &content,
        &decision,
        &publisher,
        None,
        cycle_config(),
    );

    let slot = coordinator.guard().try_acquire();
    assert!(slot.is_some());
    assert_eq!(
        must_ok(coordinator.run_cycle(must_utc(NOW))),
        CycleOutcome::Busy
    );
    assert_eq!(feed.call_count(), 0);

    drop(slot);
    let outcome = must_ok(coordinator.run_cycle(must_utc(NOW)));
    assert!(matches!(outcome, CycleOutcome::Completed(_)));
    assert_eq!(feed.call_count(), 1);
}

#[test]
fn render_failure_downgrades_to_text_only_post() {
    let feed = ScriptedFeed::new(vec![]);
    let content = content_repo(&[("opus/9", detail("u9", "2026-03-05T10:00:00Z", 1, &[]))]);
    let decision = FixedDecisionEngine::new(evaluation());
    let publisher = RecordingPublisher::new();
    let renderer = FailingRenderer;

    let mut config = cycle_config();
    config.attach_stats_card = true;
    let mut coordinator = Coordinator::new(
        MemoryKvStore::new(),
        &feed,
        &content,
        &decision,
        &publisher,
        Some(&renderer),
        config,
    );
    let disposition = must_ok(
        coordinator.process_notification(&notification(42, "opus/9"), must_utc(NOW)),
    );

    assert_eq!(disposition, Disposition::Posted);
    let posted = publisher.posted();
    assert_eq!(posted.len(), 1);
    assert!(posted[0].2.is_none());
}

#[test]
fn rendered_card_is_attached_to_the_post() {
    let feed = ScriptedFeed::new(vec![]);
    let content = content_repo(&[("opus/9", detail("u9", "2026-03-05T10:00:00Z", 1, &[]))]);
    let decision = FixedDecisionEngine::new(evaluation());
    let publisher = RecordingPublisher::new();
    let card = PathBuf::from("/tmp/card.png");
    let renderer = PathRenderer(card.clone());

    let mut config = cycle_config();
    config.attach_stats_card = true;
    let mut coordinator = Coordinator::new(
        MemoryKvStore::new(),
        &feed,
        &content,
        &decision,
        &publisher,
        Some(&renderer),
        config,
    );
    let disposition = must_ok(
        coordinator.process_notification(&notification(42, "opus/9"), must_utc(NOW)),
    );

    assert_eq!(disposition, Disposition::Posted);
    let posted = publisher.posted();
    assert_eq!(posted[0].2.as_deref(), Some(card.as_path()));
}

#[test]
fn next_day_mention_for_same_entity_posts_again() {
    let feed = ScriptedFeed::new(vec![]);
    let content = content_repo(&[
        ("opus/9", detail("u9", "2026-03-05T10:00:00Z", 1, &[])),
        ("opus/10", detail("u9", "2026-03-06T08:00:00Z", 1, &[])),
    ]);
    let decision = FixedDecisionEngine::new(evaluation());
    let publisher = RecordingPublisher::new();

    let mut coordinator = Coordinator::new(
        MemoryKvStore::new(),
        &feed,
        &content,
        &decision,
        &publisher,
        None,
        cycle_config(),
    );

    let first = must_ok(
        coordinator.process_notification(&notification(42, "opus/9"), must_utc(NOW)),
    );
    assert_eq!(first, Disposition::Posted);

    // Same day, different content from the same author: gated.
    let gated = must_ok(coordinator.process_notification(
        &notification(43, "opus/10"),
        must_utc("2026-03-05T18:00:00Z"),
    ));
    assert_eq!(gated, Disposition::RecordedRateLimited);

    // Day rolls over: clear to act again.
    let second = must_ok(coordinator.process_notification(
        &notification(44, "opus/10"),
        must_utc("2026-03-06T09:00:00Z"),
    ));
    assert_eq!(second, Disposition::Posted);

    let stats = must_some(must_ok(
        StatsAggregator::new(coordinator.store_mut()).get_stats(&EntityId::new("u9"))
    ));
    assert_eq!(stats.total_actions, 2);
}
