use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    Annotation, AnnotationPatch, AnnotationStatus, EventEnvelope, NewAnnotation, Role, Session,
    SessionDetail, SessionStatus, Store, ThreadMessage,
};
use crate::error::StoreResult;

/// Volatile in-memory backing with the same semantics as the SQLite store.
///
/// State lives for the process lifetime only. A single write guard per
/// mutation gives the same mutation-plus-event atomicity the durable
/// backing gets from its write lock.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    annotations: HashMap<String, Annotation>,
    events: Vec<EventEnvelope>,
}

impl MemoryStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn insertion_order(a: &Annotation, b: &Annotation) -> std::cmp::Ordering {
    a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id))
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_session(
        &self,
        url: &str,
        project_id: Option<String>,
    ) -> StoreResult<Session> {
        let session = Session::new(url, project_id);
        let mut inner = self.inner.write().await;
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn list_sessions(&self) -> StoreResult<Vec<Session>> {
        let inner = self.inner.read().await;
        let mut sessions: Vec<Session> = inner.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(sessions)
    }

    async fn get_session(&self, id: &str) -> StoreResult<Option<Session>> {
        let inner = self.inner.read().await;
        Ok(inner.sessions.get(id).cloned())
    }

    async fn get_session_detail(&self, id: &str) -> StoreResult<Option<SessionDetail>> {
        let inner = self.inner.read().await;
        let Some(session) = inner.sessions.get(id).cloned() else {
            return Ok(None);
        };

        let mut annotations: Vec<Annotation> = inner
            .annotations
            .values()
            .filter(|a| a.session_id == id)
            .cloned()
            .collect();
        annotations.sort_by(insertion_order);

        Ok(Some(SessionDetail {
            session,
            annotations,
        }))
    }

    async fn update_session_status(
        &self,
        id: &str,
        status: SessionStatus,
    ) -> StoreResult<Option<Session>> {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.sessions.get_mut(id) else {
            return Ok(None);
        };
        session.status = status;
        Ok(Some(session.clone()))
    }

    async fn add_annotation(
        &self,
        session_id: &str,
        new: NewAnnotation,
    ) -> StoreResult<Option<Annotation>> {
        let mut inner = self.inner.write().await;
        if !inner.sessions.contains_key(session_id) {
            return Ok(None);
        }

        let annotation = Annotation::new(session_id, new);
        inner
            .annotations
            .insert(annotation.id.clone(), annotation.clone());
        Ok(Some(annotation))
    }

    async fn get_annotation(&self, id: &str) -> StoreResult<Option<Annotation>> {
        let inner = self.inner.read().await;
        Ok(inner.annotations.get(id).cloned())
    }

    async fn update_annotation(
        &self,
        id: &str,
        patch: AnnotationPatch,
    ) -> StoreResult<Option<Annotation>> {
        let mut inner = self.inner.write().await;
        let Some(annotation) = inner.annotations.get_mut(id) else {
            return Ok(None);
        };
        annotation.apply_patch(patch)?;
        Ok(Some(annotation.clone()))
    }

    async fn delete_annotation(&self, id: &str) -> StoreResult<Option<Annotation>> {
        let mut inner = self.inner.write().await;
        Ok(inner.annotations.remove(id))
    }

    async fn pending_annotations(
        &self,
        session_id: Option<&str>,
    ) -> StoreResult<Vec<Annotation>> {
        let inner = self.inner.read().await;
        let mut pending: Vec<Annotation> = inner
            .annotations
            .values()
            .filter(|a| a.status == AnnotationStatus::Pending)
            .filter(|a| session_id.map_or(true, |s| a.session_id == s))
            .cloned()
            .collect();
        pending.sort_by(insertion_order);
        Ok(pending)
    }

    async fn add_thread_message(
        &self,
        annotation_id: &str,
        role: Role,
        content: &str,
    ) -> StoreResult<Option<Annotation>> {
        let mut inner = self.inner.write().await;
        let Some(annotation) = inner.annotations.get_mut(annotation_id) else {
            return Ok(None);
        };

        annotation
            .thread
            .push(ThreadMessage::new(annotation_id, role, content));
        annotation.updated_at = Utc::now();
        Ok(Some(annotation.clone()))
    }

    async fn append_event(&self, event: &EventEnvelope) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.events.push(event.clone());
        Ok(())
    }

    async fn events_since(
        &self,
        session_id: Option<&str>,
        after: u64,
        limit: u32,
    ) -> StoreResult<Vec<EventEnvelope>> {
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .iter()
            .filter(|e| e.sequence > after)
            .filter(|e| session_id.map_or(true, |s| e.session_id == s))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn prune_events(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.events.len();
        inner.events.retain(|e| e.timestamp >= cutoff);
        Ok((before - inner.events.len()) as u64)
    }

    async fn max_sequence(&self) -> StoreResult<u64> {
        let inner = self.inner.read().await;
        Ok(inner.events.iter().map(|e| e.sequence).max().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EventType;
    use std::collections::BTreeMap;

    fn new_annotation(comment: &str) -> NewAnnotation {
        NewAnnotation {
            comment: comment.to_string(),
            element: "div".to_string(),
            element_path: "body>div".to_string(),
            url: None,
            bounding_box: None,
            intent: None,
            severity: None,
            context: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_session_and_annotation_lifecycle() {
        let store = MemoryStore::new();
        let session = store
            .create_session("http://localhost:3000", Some("proj".to_string()))
            .await
            .unwrap();
        assert_eq!(session.project_id.as_deref(), Some("proj"));

        let annotation = store
            .add_annotation(&session.id, new_annotation("fix me"))
            .await
            .unwrap()
            .unwrap();

        let detail = store.get_session_detail(&session.id).await.unwrap().unwrap();
        assert_eq!(detail.annotations.len(), 1);
        assert_eq!(detail.annotations[0].id, annotation.id);

        let snapshot = store
            .delete_annotation(&annotation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.id, annotation.id);
        assert!(store.delete_annotation(&annotation.id).await.unwrap().is_none());

        // Session survives annotation deletion
        assert!(store.get_session(&session.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_annotation_rejects_missing_session() {
        let store = MemoryStore::new();
        assert!(store
            .add_annotation("missing", new_annotation("x"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_pending_ordering_across_sessions() {
        let store = MemoryStore::new();
        let s1 = store.create_session("http://a", None).await.unwrap();
        let s2 = store.create_session("http://b", None).await.unwrap();

        store
            .add_annotation(&s1.id, new_annotation("one"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        store
            .add_annotation(&s2.id, new_annotation("two"))
            .await
            .unwrap();

        let all = store.pending_annotations(None).await.unwrap();
        let comments: Vec<_> = all.iter().map(|a| a.comment.clone()).collect();
        assert_eq!(comments, vec!["one", "two"]);

        let only_s2 = store.pending_annotations(Some(&s2.id)).await.unwrap();
        assert_eq!(only_s2.len(), 1);
        assert_eq!(only_s2[0].comment, "two");
    }

    #[tokio::test]
    async fn test_event_log_replay_and_prune() {
        let store = MemoryStore::new();
        for sequence in 1..=3u64 {
            store
                .append_event(&EventEnvelope {
                    event_type: EventType::AnnotationCreated,
                    timestamp: Utc::now(),
                    session_id: "s-1".to_string(),
                    sequence,
                    payload: serde_json::Value::Null,
                })
                .await
                .unwrap();
        }

        assert_eq!(store.max_sequence().await.unwrap(), 3);
        let replay = store.events_since(Some("s-1"), 1, 10).await.unwrap();
        let sequences: Vec<_> = replay.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![2, 3]);

        let removed = store
            .prune_events(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.max_sequence().await.unwrap(), 0);
    }
}
