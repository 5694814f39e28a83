use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde::Deserialize;
use tracing::debug;

use super::{ApiError, AppState};
use crate::bus::Subscription;
use crate::store::{EventEnvelope, Store};

/// Upper bound on events replayed per reconnect. A client further behind
/// than this reconnects again with the last sequence it received.
const REPLAY_LIMIT: u32 = 1000;

fn last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn frame(envelope: &EventEnvelope) -> Event {
    let data = serde_json::to_string(envelope).unwrap_or_else(|_| "{}".to_string());
    Event::default()
        .event(envelope.event_type.to_string())
        .id(envelope.sequence.to_string())
        .data(data)
}

/// The `host[:port]` component of an origin URL, `None` when unparseable.
pub fn origin_host(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Per-session event stream: replay from `Last-Event-ID`, then live events.
pub async fn session_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if state.store.get_session(&id).await?.is_none() {
        return Err(ApiError::not_found("session", &id));
    }

    // Without Last-Event-ID the client starts at the live edge; with it,
    // everything after that sequence is replayed first.
    let after = match last_event_id(&headers) {
        Some(n) => n,
        None => state.store.max_sequence().await?,
    };
    // Subscribe before reading the replay so nothing published in between
    // can be missed; duplicates are filtered by sequence below.
    let subscription = state.bus.subscribe_session(&id);
    let replay = state
        .store
        .events_since(Some(&id), after, REPLAY_LIMIT)
        .await?;

    debug!(session_id = %id, after, replayed = replay.len(), "SSE session stream opened");

    let stream = event_stream(state.store.clone(), replay, subscription, after, None);
    Ok(Sse::new(stream).keep_alive(keep_alive()))
}

#[derive(Debug, Deserialize)]
pub struct DomainQuery {
    domain: Option<String>,
}

/// Domain-filtered event stream across all sessions.
pub async fn domain_events(
    State(state): State<AppState>,
    Query(query): Query<DomainQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let domain = query
        .domain
        .filter(|d| !d.trim().is_empty())
        .ok_or_else(|| ApiError::validation("domain is required"))?;

    let after = match last_event_id(&headers) {
        Some(n) => n,
        None => state.store.max_sequence().await?,
    };
    let subscription = state.bus.subscribe();
    let replay = state.store.events_since(None, after, REPLAY_LIMIT).await?;

    debug!(domain = %domain, after, "SSE domain stream opened");

    let stream = event_stream(
        state.store.clone(),
        replay,
        subscription,
        after,
        Some(domain),
    );
    Ok(Sse::new(stream).keep_alive(keep_alive()))
}

fn keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(30))
        .text("ping")
}

/// Stitch a replay batch and a live subscription into one SSE stream.
///
/// Events are delivered in strictly increasing sequence order: live events
/// at or below the last replayed sequence are duplicates from the
/// subscribe-before-replay window and get skipped. When `domain` is set,
/// events are kept only if their owning session's origin host matches;
/// sessions with unparseable origin URLs are skipped silently.
fn event_stream(
    store: Arc<dyn Store>,
    replay: Vec<EventEnvelope>,
    mut subscription: Subscription,
    mut last: u64,
    domain: Option<String>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        yield Ok(Event::default().comment("connected"));

        let mut hosts: HashMap<String, Option<String>> = HashMap::new();

        for envelope in replay {
            if !matches_domain(&store, &mut hosts, domain.as_deref(), &envelope).await {
                continue;
            }
            last = envelope.sequence;
            yield Ok(frame(&envelope));
        }

        while let Some(envelope) = subscription.recv().await {
            if envelope.sequence <= last {
                continue;
            }
            if !matches_domain(&store, &mut hosts, domain.as_deref(), &envelope).await {
                continue;
            }
            last = envelope.sequence;
            yield Ok(frame(&envelope));
        }

        // Bus shut down: say goodbye so the client sees a clean close.
        yield Ok(Event::default().comment("closing"));
    }
}

async fn matches_domain(
    store: &Arc<dyn Store>,
    hosts: &mut HashMap<String, Option<String>>,
    domain: Option<&str>,
    envelope: &EventEnvelope,
) -> bool {
    let Some(domain) = domain else {
        return true;
    };

    let host = match hosts.get(&envelope.session_id) {
        Some(cached) => cached.clone(),
        None => {
            let resolved = match store.get_session(&envelope.session_id).await {
                Ok(Some(session)) => origin_host(&session.url),
                _ => None,
            };
            hosts.insert(envelope.session_id.clone(), resolved.clone());
            resolved
        }
    };

    host.as_deref() == Some(domain)
}
