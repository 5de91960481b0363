#![forbid(unsafe_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fmt::{Display, Formatter};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use nephobot_core::{parse_rfc3339, CategoryObservation, EntityStats, EventId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::debug;
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CollaboratorError {
    #[error("transient collaborator failure: {0}")]
    Transient(String),
    #[error("analysis unavailable: {0}")]
    AnalysisUnavailable(String),
}

/// Normalized reference to a content item, always of the `kind/id` form.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ContentRef(pub String);

impl ContentRef {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContentRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One inbound mention from the feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub id: EventId,
    pub source_actor: String,
    pub content_ref: String,
    pub trigger_context: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Video,
    Other,
}

impl AttachmentKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "image" | "photo" | "picture" => Self::Image,
            "video" => Self::Video,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub url: String,
    pub kind: AttachmentKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyStub {
    pub author_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentDetail {
    pub published_at: OffsetDateTime,
    pub attachments: Vec<Attachment>,
    pub existing_replies: Vec<ReplyStub>,
    pub author_id: String,
    pub author_name: String,
}

impl ContentDetail {
    #[must_use]
    pub fn image_attachments(&self) -> Vec<Attachment> {
        self.attachments
            .iter()
            .filter(|attachment| attachment.kind == AttachmentKind::Image)
            .cloned()
            .collect()
    }
}

/// Output of the decision engine for a set of attachments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evaluation {
    pub categories: Vec<CategoryObservation>,
    pub summary_text: String,
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

pub trait FeedSource {
    #[allow(clippy::missing_errors_doc)]
    fn fetch_pending(&self) -> Result<Vec<Notification>, CollaboratorError>;
}

pub trait ContentRepository {
    /// `Ok(None)` means the content detail is currently unavailable; the
    /// caller defers the notification rather than recording it.
    #[allow(clippy::missing_errors_doc)]
    fn fetch_detail(&self, reference: &ContentRef)
        -> Result<Option<ContentDetail>, CollaboratorError>;
}

pub trait DecisionEngine {
    #[allow(clippy::missing_errors_doc)]
    fn evaluate(&self, attachments: &[Attachment]) -> Result<Evaluation, CollaboratorError>;
}

pub trait ActionPublisher {
    /// Posts the reply; `Ok(false)` is a rejected post, distinct from a
    /// transport failure.
    #[allow(clippy::missing_errors_doc)]
    fn publish(
        &self,
        reference: &ContentRef,
        summary_text: &str,
        media: Option<&Path>,
    ) -> Result<bool, CollaboratorError>;
}

pub trait MediaRenderer {
    /// Renders a stats card for the entity and returns a local media handle.
    #[allow(clippy::missing_errors_doc)]
    fn render(&self, stats: &EntityStats) -> Result<PathBuf, CollaboratorError>;
}

// ---------------------------------------------------------------------------
// Content reference resolution
// ---------------------------------------------------------------------------

const KNOWN_REF_KINDS: &[&str] = &["opus", "status", "post"];

/// Normalizes a raw mention reference to `kind/id`, trying the known
/// historical shapes in order: a bare `kind/id` pair, a colon-separated
/// legacy pair, then the trailing path of a full URL. First success wins.
#[must_use]
pub fn resolve_content_ref(raw: &str) -> Option<ContentRef> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    parse_pair(trimmed, '/')
        .or_else(|| parse_pair(trimmed, ':'))
        .or_else(|| parse_url_path(trimmed))
        .map(|(kind, id)| ContentRef(format!("{kind}/{id}")))
}

fn parse_pair(value: &str, separator: char) -> Option<(String, String)> {
    let (kind, id) = value.split_once(separator)?;
    if !KNOWN_REF_KINDS.contains(&kind) {
        return None;
    }
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some((kind.to_string(), id.to_string()))
}

fn parse_url_path(value: &str) -> Option<(String, String)> {
    let rest = value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"))?;
    let path = rest.split_once('/')?.1;
    let mut segments: Vec<&str> = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();
    let id = segments.pop()?;
    let kind = segments.pop()?;
    parse_pair(&format!("{kind}/{id}"), '/')
}

// ---------------------------------------------------------------------------
// Author extraction over historical payload shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorRef {
    pub id: String,
    pub name: String,
}

/// One strategy for recovering the author identity from a content payload.
/// Strategies are tried in a fixed order; the first hit wins.
pub trait AuthorIdExtractor {
    fn source(&self) -> &'static str;
    fn extract(&self, payload: &Value) -> Option<AuthorRef>;
}

struct ModernAuthorExtractor;

impl AuthorIdExtractor for ModernAuthorExtractor {
    fn source(&self) -> &'static str {
        "author"
    }

    fn extract(&self, payload: &Value) -> Option<AuthorRef> {
        let author = payload.get("author")?;
        let id = author.get("id")?.as_str()?.to_string();
        let name = author
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some(AuthorRef { id, name })
    }
}

struct LegacyUserExtractor;

impl AuthorIdExtractor for LegacyUserExtractor {
    fn source(&self) -> &'static str {
        "user"
    }

    fn extract(&self, payload: &Value) -> Option<AuthorRef> {
        let user = payload.get("user")?;
        let id = match user.get("uid")? {
            Value::String(value) => value.clone(),
            Value::Number(value) => value.to_string(),
            _ => return None,
        };
        let name = user
            .get("screen_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some(AuthorRef { id, name })
    }
}

struct OwnerModuleExtractor;

impl AuthorIdExtractor for OwnerModuleExtractor {
    fn source(&self) -> &'static str {
        "module.owner"
    }

    fn extract(&self, payload: &Value) -> Option<AuthorRef> {
        let owner = payload.get("module")?.get("owner")?;
        let id = match owner.get("mid")? {
            Value::String(value) => value.clone(),
            Value::Number(value) => value.to_string(),
            _ => return None,
        };
        let name = owner
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some(AuthorRef { id, name })
    }
}

/// Recovers the author identity from any known payload shape.
#[must_use]
pub fn extract_author(payload: &Value) -> Option<AuthorRef> {
    let extractors: [&dyn AuthorIdExtractor; 3] = [
        &ModernAuthorExtractor,
        &LegacyUserExtractor,
        &OwnerModuleExtractor,
    ];
    for extractor in extractors {
        if let Some(author) = extractor.extract(payload) {
            debug!(source = extractor.source(), "resolved content author");
            return Some(author);
        }
    }
    None
}

/// Strips up to two levels of `{"data": ...}` envelope wrapping, which older
/// endpoint revisions added around the payload body.
#[must_use]
pub fn unwrap_envelope(payload: &Value) -> &Value {
    let mut body = payload;
    for _ in 0..2 {
        match body.get("data") {
            Some(inner) if inner.is_object() => body = inner,
            _ => break,
        }
    }
    body
}

#[derive(Debug, Deserialize)]
struct ModernDetailShape {
    published_at: String,
    #[serde(default)]
    attachments: Vec<ModernAttachmentShape>,
    #[serde(default)]
    replies: Vec<ModernReplyShape>,
}

#[derive(Debug, Deserialize)]
struct ModernAttachmentShape {
    url: String,
    #[serde(default)]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModernReplyShape {
    author_id: String,
}

#[derive(Debug, Deserialize)]
struct LegacyDetailShape {
    created_at: String,
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    comments: Vec<LegacyCommentShape>,
}

#[derive(Debug, Deserialize)]
struct LegacyCommentShape {
    uid: Value,
}

/// The known content payload bodies, newest first.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DetailShape {
    Modern(ModernDetailShape),
    Legacy(LegacyDetailShape),
}

/// Decodes a content payload of any known shape into a [`ContentDetail`].
///
/// Returns `Ok(None)` when the payload matches no known shape or carries no
/// recoverable author, which the caller treats as detail-unavailable.
///
/// # Errors
/// Returns [`CollaboratorError::Transient`] for a timestamp that cannot be
/// parsed.
pub fn decode_content_detail(payload: &Value) -> Result<Option<ContentDetail>, CollaboratorError> {
    let body = unwrap_envelope(payload);
    let Some(author) = extract_author(body) else {
        return Ok(None);
    };

    let Ok(shape) = serde_json::from_value::<DetailShape>(body.clone()) else {
        return Ok(None);
    };

    let detail = match shape {
        DetailShape::Modern(modern) => ContentDetail {
            published_at: parse_rfc3339(&modern.published_at)
                .map_err(|err| CollaboratorError::Transient(err.to_string()))?,
            attachments: modern
                .attachments
                .into_iter()
                .map(|attachment| Attachment {
                    url: attachment.url,
                    kind: attachment
                        .kind
                        .as_deref()
                        .map_or(AttachmentKind::Image, AttachmentKind::parse),
                })
                .collect(),
            existing_replies: modern
                .replies
                .into_iter()
                .map(|reply| ReplyStub {
                    author_id: reply.author_id,
                })
                .collect(),
            author_id: author.id,
            author_name: author.name,
        },
        DetailShape::Legacy(legacy) => ContentDetail {
            published_at: parse_rfc3339(&legacy.created_at)
                .map_err(|err| CollaboratorError::Transient(err.to_string()))?,
            attachments: legacy
                .images
                .into_iter()
                .map(|url| Attachment {
                    url,
                    kind: AttachmentKind::Image,
                })
                .collect(),
            existing_replies: legacy
                .comments
                .into_iter()
                .filter_map(|comment| match comment.uid {
                    Value::String(value) => Some(ReplyStub { author_id: value }),
                    Value::Number(value) => Some(ReplyStub {
                        author_id: value.to_string(),
                    }),
                    _ => None,
                })
                .collect(),
            author_id: author.id,
            author_name: author.name,
        },
    };

    Ok(Some(detail))
}

// ---------------------------------------------------------------------------
// HTTP implementations
// ---------------------------------------------------------------------------

fn default_timeout_ms() -> u64 {
    10_000
}

/// One HTTP collaborator endpoint: base URL, optional bearer token named by
/// environment variable, bounded per-call timeout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    pub base_url: String,
    #[serde(default)]
    pub auth_bearer_env: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl EndpointConfig {
    /// Validates the endpoint definition.
    ///
    /// # Errors
    /// Returns an error naming the offending field.
    pub fn validate(&self, section: &str) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(anyhow::anyhow!("{section}.base_url MUST be non-empty"));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(anyhow::anyhow!(
                "{section}.base_url MUST start with http:// or https://"
            ));
        }
        if self.timeout_ms == 0 {
            return Err(anyhow::anyhow!("{section}.timeout_ms MUST be >= 1"));
        }
        Ok(())
    }
}

struct HttpEndpoint {
    agent: ureq::Agent,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpEndpoint {
    fn new(config: &EndpointConfig, section: &str) -> Result<Self> {
        config.validate(section)?;

        let bearer_token = match &config.auth_bearer_env {
            Some(env_name) => Some(std::env::var(env_name).map_err(|_| {
                anyhow::anyhow!("missing env var '{env_name}' required by {section}.auth_bearer_env")
            })?),
            None => None,
        };

        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build();

        Ok(Self {
            agent,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            bearer_token,
        })
    }

    fn request(&self, method: &str, path: &str) -> ureq::Request {
        let mut req = self.agent.request(method, &format!("{}{path}", self.base_url));
        if let Some(token) = &self.bearer_token {
            req = req.set("authorization", &format!("Bearer {token}"));
        }
        req
    }
}

fn transient(op: &str, err: &ureq::Error) -> CollaboratorError {
    match err {
        ureq::Error::Status(code, _) => {
            CollaboratorError::Transient(format!("{op}: http status {code}"))
        }
        ureq::Error::Transport(transport) => {
            CollaboratorError::Transient(format!("{op}: transport failure: {transport}"))
        }
    }
}

fn read_json(op: &str, response: ureq::Response) -> Result<Value, CollaboratorError> {
    response
        .into_json()
        .map_err(|err| CollaboratorError::Transient(format!("{op}: invalid response body: {err}")))
}

pub struct HttpFeedSource {
    endpoint: HttpEndpoint,
}

impl HttpFeedSource {
    #[allow(clippy::missing_errors_doc)]
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        Ok(Self {
            endpoint: HttpEndpoint::new(config, "feed")?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct FeedEnvelope {
    #[serde(default)]
    items: Vec<FeedItemShape>,
}

#[derive(Debug, Deserialize)]
struct FeedItemShape {
    id: i64,
    #[serde(default)]
    source_actor: String,
    #[serde(default)]
    content_ref: String,
    #[serde(default)]
    trigger_context: String,
}

impl FeedSource for HttpFeedSource {
    fn fetch_pending(&self) -> Result<Vec<Notification>, CollaboratorError> {
        let response = self
            .endpoint
            .request("GET", "/notifications/pending")
            .call()
            .map_err(|err| transient("fetch_pending", &err))?;
        let payload = read_json("fetch_pending", response)?;
        let envelope: FeedEnvelope = serde_json::from_value(unwrap_envelope(&payload).clone())
            .map_err(|err| {
                CollaboratorError::Transient(format!("fetch_pending: unexpected shape: {err}"))
            })?;

        Ok(envelope
            .items
            .into_iter()
            .map(|item| Notification {
                id: EventId(item.id),
                source_actor: item.source_actor,
                content_ref: item.content_ref,
                trigger_context: item.trigger_context,
            })
            .collect())
    }
}

pub struct HttpContentRepository {
    endpoint: HttpEndpoint,
}

impl HttpContentRepository {
    #[allow(clippy::missing_errors_doc)]
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        Ok(Self {
            endpoint: HttpEndpoint::new(config, "content")?,
        })
    }
}

impl ContentRepository for HttpContentRepository {
    fn fetch_detail(
        &self,
        reference: &ContentRef,
    ) -> Result<Option<ContentDetail>, CollaboratorError> {
        let response = self
            .endpoint
            .request("GET", &format!("/contents/{reference}"))
            .call();

        let response = match response {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(err) => return Err(transient("fetch_detail", &err)),
        };

        let payload = read_json("fetch_detail", response)?;
        decode_content_detail(&payload)
    }
}

pub struct HttpDecisionEngine {
    endpoint: HttpEndpoint,
}

impl HttpDecisionEngine {
    #[allow(clippy::missing_errors_doc)]
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        Ok(Self {
            endpoint: HttpEndpoint::new(config, "decision")?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct EvaluationShape {
    #[serde(default)]
    categories: Vec<CategoryShape>,
    summary_text: String,
}

#[derive(Debug, Deserialize)]
struct CategoryShape {
    label: String,
    confidence: f32,
    #[serde(default)]
    note: Option<String>,
}

impl DecisionEngine for HttpDecisionEngine {
    fn evaluate(&self, attachments: &[Attachment]) -> Result<Evaluation, CollaboratorError> {
        let urls: Vec<&str> = attachments
            .iter()
            .map(|attachment| attachment.url.as_str())
            .collect();
        let response = self
            .endpoint
            .request("POST", "/evaluations")
            .set("content-type", "application/json")
            .send_json(json!({ "attachments": urls }))
            .map_err(|err| match err {
                ureq::Error::Status(code, _) => {
                    CollaboratorError::AnalysisUnavailable(format!("http status {code}"))
                }
                ureq::Error::Transport(transport) => {
                    CollaboratorError::AnalysisUnavailable(format!("transport failure: {transport}"))
                }
            })?;

        let payload = read_json("evaluate", response)?;
        let shape: EvaluationShape = serde_json::from_value(unwrap_envelope(&payload).clone())
            .map_err(|err| {
                CollaboratorError::AnalysisUnavailable(format!("unexpected shape: {err}"))
            })?;

        Ok(Evaluation {
            categories: shape
                .categories
                .into_iter()
                .map(|category| CategoryObservation {
                    label: category.label,
                    confidence: category.confidence,
                    note: category.note,
                })
                .collect(),
            summary_text: shape.summary_text,
        })
    }
}

pub struct HttpPublisher {
    endpoint: HttpEndpoint,
}

impl HttpPublisher {
    #[allow(clippy::missing_errors_doc)]
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        Ok(Self {
            endpoint: HttpEndpoint::new(config, "publish")?,
        })
    }

    fn upload_media(&self, media: &Path) -> Result<String, CollaboratorError> {
        let bytes = std::fs::read(media).map_err(|err| {
            CollaboratorError::Transient(format!(
                "publish: failed to read media {}: {err}",
                media.display()
            ))
        })?;

        let response = self
            .endpoint
            .request("POST", "/media")
            .set("content-type", "application/octet-stream")
            .send_bytes(&bytes)
            .map_err(|err| transient("publish.media", &err))?;
        let payload = read_json("publish.media", response)?;
        payload
            .get("media_id")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| {
                CollaboratorError::Transient("publish.media: response missing media_id".to_string())
            })
    }
}

impl ActionPublisher for HttpPublisher {
    fn publish(
        &self,
        reference: &ContentRef,
        summary_text: &str,
        media: Option<&Path>,
    ) -> Result<bool, CollaboratorError> {
        let media_id = match media {
            Some(path) => Some(self.upload_media(path)?),
            None => None,
        };

        let response = self
            .endpoint
            .request("POST", "/replies")
            .set("content-type", "application/json")
            .send_json(json!({
                "content_ref": reference.as_str(),
                "summary_text": summary_text,
                "media_id": media_id,
            }))
            .map_err(|err| transient("publish", &err))?;

        let payload = read_json("publish", response)?;
        Ok(payload
            .get("posted")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }
}

/// Renders a stats card through the render endpoint and stores the returned
/// bytes as a temporary file.
pub struct HttpStatsCardRenderer {
    endpoint: HttpEndpoint,
}

impl HttpStatsCardRenderer {
    #[allow(clippy::missing_errors_doc)]
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        Ok(Self {
            endpoint: HttpEndpoint::new(config, "render")?,
        })
    }
}

impl MediaRenderer for HttpStatsCardRenderer {
    fn render(&self, stats: &EntityStats) -> Result<PathBuf, CollaboratorError> {
        let stats_json = serde_json::to_value(stats)
            .map_err(|err| CollaboratorError::Transient(format!("render: encode: {err}")))?;
        let response = self
            .endpoint
            .request("POST", "/cards")
            .set("content-type", "application/json")
            .send_json(stats_json)
            .map_err(|err| transient("render", &err))?;

        let mut bytes: Vec<u8> = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut bytes)
            .map_err(|err| CollaboratorError::Transient(format!("render: read body: {err}")))?;

        let path = std::env::temp_dir().join(format!("nephobot-card-{}.png", Ulid::new()));
        std::fs::write(&path, bytes).map_err(|err| {
            CollaboratorError::Transient(format!("render: write {}: {err}", path.display()))
        })?;
        Ok(path)
    }
}

// ---------------------------------------------------------------------------
// Scripted implementations (dry-runs and tests)
// ---------------------------------------------------------------------------

/// Feed that serves pre-arranged batches, one per call, then empty batches.
#[derive(Debug, Default)]
pub struct ScriptedFeed {
    batches: RefCell<VecDeque<Vec<Notification>>>,
    calls: Cell<usize>,
}

impl ScriptedFeed {
    #[must_use]
    pub fn new(batches: Vec<Vec<Notification>>) -> Self {
        Self {
            batches: RefCell::new(batches.into_iter().collect()),
            calls: Cell::new(0),
        }
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.get()
    }
}

impl FeedSource for ScriptedFeed {
    fn fetch_pending(&self) -> Result<Vec<Notification>, CollaboratorError> {
        self.calls.set(self.calls.get() + 1);
        Ok(self.batches.borrow_mut().pop_front().unwrap_or_default())
    }
}

/// Content repository backed by a fixed reference → detail map.
#[derive(Debug, Default)]
pub struct StaticContentRepository {
    by_ref: BTreeMap<String, ContentDetail>,
    calls: Cell<usize>,
}

impl StaticContentRepository {
    #[must_use]
    pub fn new(by_ref: BTreeMap<String, ContentDetail>) -> Self {
        Self {
            by_ref,
            calls: Cell::new(0),
        }
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.get()
    }
}

impl ContentRepository for StaticContentRepository {
    fn fetch_detail(
        &self,
        reference: &ContentRef,
    ) -> Result<Option<ContentDetail>, CollaboratorError> {
        self.calls.set(self.calls.get() + 1);
        Ok(self.by_ref.get(reference.as_str()).cloned())
    }
}

/// Decision engine returning one fixed evaluation, or a scripted failure.
#[derive(Debug)]
pub struct FixedDecisionEngine {
    evaluation: Evaluation,
    fail: Cell<bool>,
    calls: Cell<usize>,
}

impl FixedDecisionEngine {
    #[must_use]
    pub fn new(evaluation: Evaluation) -> Self {
        Self {
            evaluation,
            fail: Cell::new(false),
            calls: Cell::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.set(failing);
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.get()
    }
}

impl DecisionEngine for FixedDecisionEngine {
    fn evaluate(&self, _attachments: &[Attachment]) -> Result<Evaluation, CollaboratorError> {
        self.calls.set(self.calls.get() + 1);
        if self.fail.get() {
            return Err(CollaboratorError::AnalysisUnavailable(
                "scripted analysis outage".to_string(),
            ));
        }
        Ok(self.evaluation.clone())
    }
}

/// Publisher that records every publish attempt and returns a scripted
/// outcome (default: success).
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    posted: RefCell<Vec<(ContentRef, String, Option<PathBuf>)>>,
    outcome: Cell<PublishOutcome>,
    calls: Cell<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PublishOutcome {
    #[default]
    Success,
    Rejected,
    Fail,
}

impl RecordingPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_outcome(&self, outcome: PublishOutcome) {
        self.outcome.set(outcome);
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.get()
    }

    #[must_use]
    pub fn posted(&self) -> Vec<(ContentRef, String, Option<PathBuf>)> {
        self.posted.borrow().clone()
    }
}

impl ActionPublisher for RecordingPublisher {
    fn publish(
        &self,
        reference: &ContentRef,
        summary_text: &str,
        media: Option<&Path>,
    ) -> Result<bool, CollaboratorError> {
        self.calls.set(self.calls.get() + 1);
        match self.outcome.get() {
            PublishOutcome::Fail => Err(CollaboratorError::Transient(
                "scripted publish outage".to_string(),
            )),
            PublishOutcome::Rejected => Ok(false),
            PublishOutcome::Success => {
                self.posted.borrow_mut().push((
                    reference.clone(),
                    summary_text.to_string(),
                    media.map(Path::to_path_buf),
                ));
                Ok(true)
            }
        }
    }
}
