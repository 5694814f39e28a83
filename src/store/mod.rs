//! Store layer for annotation broker persistence.
//!
//! This module owns the data model (sessions, annotations, thread messages,
//! events) and the `Store` trait its two backings implement: a durable
//! single-file SQLite store and a volatile in-memory store.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

/// A page-annotation context shared by a set of annotations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Unique session identifier.
    pub id: String,
    /// Absolute origin URL of the annotated page.
    pub url: String,
    /// Optional project the session belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Current session status.
    pub status: SessionStatus,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
}

/// A session together with its annotations in insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDetail {
    /// The session record.
    #[serde(flatten)]
    pub session: Session,
    /// Annotations in creation order, ties broken by id.
    pub annotations: Vec<Annotation>,
}

/// Status of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Session is open for new annotations.
    #[default]
    Active,
    /// Session has been closed.
    Closed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(SessionStatus::Active),
            "closed" => Ok(SessionStatus::Closed),
            _ => Err(format!("Unknown session status: {}", s)),
        }
    }
}

/// A single piece of feedback attached to one page element.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    /// Unique annotation identifier.
    pub id: String,
    /// Parent session ID.
    pub session_id: String,
    /// Free-text feedback comment.
    pub comment: String,
    /// Tag name of the annotated element.
    pub element: String,
    /// CSS-selector-like path to the element.
    pub element_path: String,
    /// Page URL at annotation time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Bounding box of the element in page coordinates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
    /// What the annotator wants done.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    /// How important the feedback is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    /// Current lifecycle status.
    pub status: AnnotationStatus,
    /// Who resolved or dismissed the annotation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<Resolver>,
    /// When the annotation was resolved or dismissed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// When the annotation was created.
    pub created_at: DateTime<Utc>,
    /// When the annotation was last updated.
    pub updated_at: DateTime<Utc>,
    /// Reply thread in append order.
    pub thread: Vec<ThreadMessage>,
    /// Extra context strings (computed styles, nearby text, component tree,
    /// ...) captured verbatim and returned unchanged.
    #[serde(flatten)]
    pub context: BTreeMap<String, String>,
}

/// Element bounding box in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Annotator intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Fix,
    Change,
    Question,
    Approve,
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Intent::Fix => write!(f, "fix"),
            Intent::Change => write!(f, "change"),
            Intent::Question => write!(f, "question"),
            Intent::Approve => write!(f, "approve"),
        }
    }
}

impl std::str::FromStr for Intent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fix" => Ok(Intent::Fix),
            "change" => Ok(Intent::Change),
            "question" => Ok(Intent::Question),
            "approve" => Ok(Intent::Approve),
            _ => Err(format!("Unknown intent: {}", s)),
        }
    }
}

/// Annotation severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Blocking,
    Important,
    Suggestion,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Blocking => write!(f, "blocking"),
            Severity::Important => write!(f, "important"),
            Severity::Suggestion => write!(f, "suggestion"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "blocking" => Ok(Severity::Blocking),
            "important" => Ok(Severity::Important),
            "suggestion" => Ok(Severity::Suggestion),
            _ => Err(format!("Unknown severity: {}", s)),
        }
    }
}

/// Lifecycle status of an annotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationStatus {
    /// Freshly created, awaiting attention.
    #[default]
    Pending,
    /// An agent or human has picked it up.
    Acknowledged,
    /// The underlying feedback has been addressed.
    Resolved,
    /// The feedback will not be acted on.
    Dismissed,
}

impl std::fmt::Display for AnnotationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnnotationStatus::Pending => write!(f, "pending"),
            AnnotationStatus::Acknowledged => write!(f, "acknowledged"),
            AnnotationStatus::Resolved => write!(f, "resolved"),
            AnnotationStatus::Dismissed => write!(f, "dismissed"),
        }
    }
}

impl std::str::FromStr for AnnotationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(AnnotationStatus::Pending),
            "acknowledged" => Ok(AnnotationStatus::Acknowledged),
            "resolved" => Ok(AnnotationStatus::Resolved),
            "dismissed" => Ok(AnnotationStatus::Dismissed),
            _ => Err(format!("Unknown annotation status: {}", s)),
        }
    }
}

/// Who resolved or dismissed an annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolver {
    Human,
    Agent,
}

impl std::fmt::Display for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolver::Human => write!(f, "human"),
            Resolver::Agent => write!(f, "agent"),
        }
    }
}

impl std::str::FromStr for Resolver {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" => Ok(Resolver::Human),
            "agent" => Ok(Resolver::Agent),
            _ => Err(format!("Unknown resolver: {}", s)),
        }
    }
}

/// Author role of a thread message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Agent,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Human => write!(f, "human"),
            Role::Agent => write!(f, "agent"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" => Ok(Role::Human),
            "agent" => Ok(Role::Agent),
            _ => Err(format!("Unknown role: {}", s)),
        }
    }
}

/// A reply on an annotation. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadMessage {
    /// Unique message identifier.
    pub id: String,
    /// Parent annotation ID.
    pub annotation_id: String,
    /// Who wrote the message.
    pub role: Role,
    /// Message content.
    pub content: String,
    /// When the message was appended.
    pub created_at: DateTime<Utc>,
}

impl ThreadMessage {
    /// Create a new thread message for an annotation.
    pub fn new(annotation_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            annotation_id: annotation_id.into(),
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Fields accepted when creating an annotation.
///
/// Unrecognized string fields land in `context` and are persisted verbatim,
/// so browser clients can attach arbitrary extra context without a schema
/// change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAnnotation {
    pub comment: String,
    pub element: String,
    pub element_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(flatten)]
    pub context: BTreeMap<String, String>,
}

/// Partial annotation update. Fields present overwrite, fields absent are
/// preserved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AnnotationStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<Resolver>,
    #[serde(flatten)]
    pub context: BTreeMap<String, String>,
}

impl AnnotationPatch {
    /// A patch that only changes the status.
    pub fn status(status: AnnotationStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

impl Session {
    /// Create a new active session for the given origin URL.
    pub fn new(url: impl Into<String>, project_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url: url.into(),
            project_id,
            status: SessionStatus::Active,
            created_at: Utc::now(),
        }
    }
}

impl Annotation {
    /// Create a pending annotation in a session from submitted fields.
    pub fn new(session_id: impl Into<String>, new: NewAnnotation) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            comment: new.comment,
            element: new.element,
            element_path: new.element_path,
            url: new.url,
            bounding_box: new.bounding_box,
            intent: new.intent,
            severity: new.severity,
            status: AnnotationStatus::Pending,
            resolved_by: None,
            resolved_at: None,
            created_at: now,
            updated_at: now,
            thread: Vec::new(),
            context: new.context,
        }
    }

    /// Apply a partial update, enforcing the status transition lattice.
    ///
    /// `resolved_at`/`resolved_by` are set exactly while the status is
    /// `resolved` or `dismissed` and cleared on reopen. Any patch bumps
    /// `updated_at`.
    pub fn apply_patch(&mut self, patch: AnnotationPatch) -> StoreResult<()> {
        if let Some(next) = patch.status {
            if !transition_allowed(self.status, next) {
                return Err(StoreError::validation(format!(
                    "illegal status transition: {} -> {}",
                    self.status, next
                )));
            }
            let changed = next != self.status;
            self.status = next;
            match next {
                AnnotationStatus::Resolved | AnnotationStatus::Dismissed => {
                    if changed || self.resolved_at.is_none() {
                        self.resolved_at = Some(Utc::now());
                    }
                    if let Some(resolver) = patch.resolved_by {
                        self.resolved_by = Some(resolver);
                    }
                }
                AnnotationStatus::Pending | AnnotationStatus::Acknowledged => {
                    self.resolved_at = None;
                    self.resolved_by = None;
                }
            }
        } else if let Some(resolver) = patch.resolved_by {
            // Resolver identity only exists alongside a terminal status.
            if matches!(
                self.status,
                AnnotationStatus::Resolved | AnnotationStatus::Dismissed
            ) {
                self.resolved_by = Some(resolver);
            }
        }

        if let Some(comment) = patch.comment {
            self.comment = comment;
        }
        if let Some(element) = patch.element {
            self.element = element;
        }
        if let Some(element_path) = patch.element_path {
            self.element_path = element_path;
        }
        if let Some(url) = patch.url {
            self.url = Some(url);
        }
        if let Some(bounding_box) = patch.bounding_box {
            self.bounding_box = Some(bounding_box);
        }
        if let Some(intent) = patch.intent {
            self.intent = Some(intent);
        }
        if let Some(severity) = patch.severity {
            self.severity = Some(severity);
        }
        for (key, value) in patch.context {
            self.context.insert(key, value);
        }

        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Whether a status transition is legal.
///
/// Self-transitions are accepted as no-ops; everything else must be an edge
/// of the lattice: pending may be acknowledged or dismissed, acknowledged
/// may be resolved or dismissed, and both terminal states may be reopened.
pub fn transition_allowed(from: AnnotationStatus, to: AnnotationStatus) -> bool {
    use AnnotationStatus::*;
    from == to
        || matches!(
            (from, to),
            (Pending, Acknowledged)
                | (Pending, Dismissed)
                | (Acknowledged, Resolved)
                | (Acknowledged, Dismissed)
                | (Resolved, Pending)
                | (Dismissed, Pending)
        )
}

/// Broker event types, one per mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "annotation.created")]
    AnnotationCreated,
    #[serde(rename = "annotation.updated")]
    AnnotationUpdated,
    #[serde(rename = "annotation.deleted")]
    AnnotationDeleted,
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "session.closed")]
    SessionClosed,
    #[serde(rename = "thread.message")]
    ThreadMessage,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::AnnotationCreated => write!(f, "annotation.created"),
            EventType::AnnotationUpdated => write!(f, "annotation.updated"),
            EventType::AnnotationDeleted => write!(f, "annotation.deleted"),
            EventType::SessionCreated => write!(f, "session.created"),
            EventType::SessionUpdated => write!(f, "session.updated"),
            EventType::SessionClosed => write!(f, "session.closed"),
            EventType::ThreadMessage => write!(f, "thread.message"),
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "annotation.created" => Ok(EventType::AnnotationCreated),
            "annotation.updated" => Ok(EventType::AnnotationUpdated),
            "annotation.deleted" => Ok(EventType::AnnotationDeleted),
            "session.created" => Ok(EventType::SessionCreated),
            "session.updated" => Ok(EventType::SessionUpdated),
            "session.closed" => Ok(EventType::SessionClosed),
            "thread.message" => Ok(EventType::ThreadMessage),
            _ => Err(format!("Unknown event type: {}", s)),
        }
    }
}

/// A durable record of a single mutation, also the SSE wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// What happened.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// The session the mutation belongs to.
    pub session_id: String,
    /// Process-wide monotonic sequence number, starting at 1.
    pub sequence: u64,
    /// The affected entity at the moment of the mutation (the pre-delete
    /// snapshot for deletes).
    pub payload: serde_json::Value,
}

/// Store trait shared by the durable and volatile backings.
///
/// The store is the only component that mutates entities. Reads return
/// `None` for missing entities; illegal updates surface as
/// [`StoreError::Validation`].
#[async_trait]
pub trait Store: Send + Sync {
    // Session operations

    /// Create a new active session.
    async fn create_session(&self, url: &str, project_id: Option<String>)
        -> StoreResult<Session>;
    /// All sessions in creation order.
    async fn list_sessions(&self) -> StoreResult<Vec<Session>>;
    /// Look up a session by ID.
    async fn get_session(&self, id: &str) -> StoreResult<Option<Session>>;
    /// A session with its annotations embedded in insertion order.
    async fn get_session_detail(&self, id: &str) -> StoreResult<Option<SessionDetail>>;
    /// Change a session's status.
    async fn update_session_status(
        &self,
        id: &str,
        status: SessionStatus,
    ) -> StoreResult<Option<Session>>;

    // Annotation operations

    /// Create a pending annotation in a session. `None` if the session does
    /// not exist.
    async fn add_annotation(
        &self,
        session_id: &str,
        new: NewAnnotation,
    ) -> StoreResult<Option<Annotation>>;
    /// Look up an annotation by ID, thread included.
    async fn get_annotation(&self, id: &str) -> StoreResult<Option<Annotation>>;
    /// Apply a partial update; status changes are validated against the
    /// transition lattice.
    async fn update_annotation(
        &self,
        id: &str,
        patch: AnnotationPatch,
    ) -> StoreResult<Option<Annotation>>;
    /// Delete an annotation and its thread, returning the pre-delete
    /// snapshot.
    async fn delete_annotation(&self, id: &str) -> StoreResult<Option<Annotation>>;
    /// Pending annotations, optionally limited to one session, in insertion
    /// order.
    async fn pending_annotations(&self, session_id: Option<&str>)
        -> StoreResult<Vec<Annotation>>;

    // Thread operations

    /// Append a reply to an annotation's thread and bump its update
    /// timestamp. Returns the whole annotation.
    async fn add_thread_message(
        &self,
        annotation_id: &str,
        role: Role,
        content: &str,
    ) -> StoreResult<Option<Annotation>>;

    // Event log operations

    /// Append an event to the log.
    async fn append_event(&self, event: &EventEnvelope) -> StoreResult<()>;
    /// Events with sequence strictly greater than `after`, in sequence
    /// order, optionally limited to one session.
    async fn events_since(
        &self,
        session_id: Option<&str>,
        after: u64,
        limit: u32,
    ) -> StoreResult<Vec<EventEnvelope>>;
    /// Delete events older than the cutoff. Returns how many were removed.
    async fn prune_events(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
    /// Highest sequence number in the log, 0 when empty.
    async fn max_sequence(&self) -> StoreResult<u64>;

    /// Flush and release resources. Called once at shutdown.
    async fn close(&self) {}
}
