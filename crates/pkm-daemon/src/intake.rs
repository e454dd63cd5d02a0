//! Intake HTTP surface
//!
//! Endpoints:
//! - POST /visit: compressed page payload from the browser companion
//! - POST /tab-event: tab lifecycle events feeding the tracker
//! - GET /status: liveness, version, queue/orphan/filter counters
//!
//! The intake handler owns referrer resolution: it consults the tab tracker,
//! parks visits with unknown openers in the orphan manager, and enqueues
//! everything else. It never blocks on analysis outcomes.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use pkm_core::{
    EnhancedFilter, OrphanManager, Storage, TabTracker, Visit, VisitQueue,
};

// ============================================================================
// STATE
// ============================================================================

pub struct AppState {
    pub queue: Arc<VisitQueue>,
    pub storage: Arc<Storage>,
    pub tracker: Arc<Mutex<TabTracker>>,
    pub orphans: Arc<Mutex<OrphanManager>>,
    pub filter: Arc<EnhancedFilter>,
    pub started_at: Instant,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/visit", post(handle_visit))
        .route("/tab-event", post(handle_tab_event))
        .route("/status", get(handle_status))
        .with_state(state)
}

// ============================================================================
// PAYLOADS
// ============================================================================

/// Inbound visit submission. Permissive at the serde layer; real validation
/// happens in [`ValidatedVisit::try_from_payload`] so a 400 can list every
/// issue at once.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct VisitPayload {
    pub url: Option<String>,
    pub page_loaded_at: Option<String>,
    pub referrer: Option<String>,
    pub referrer_timestamp: Option<String>,
    /// base64-encoded zstd-compressed HTML.
    pub content: Option<String>,
    pub tab_id: Option<i64>,
    pub opener_tab_id: Option<i64>,
}

#[derive(Debug)]
struct ValidatedVisit {
    visit: Visit,
    tab_id: Option<i64>,
}

impl ValidatedVisit {
    fn try_from_payload(payload: VisitPayload) -> Result<Self, Vec<String>> {
        let mut issues = Vec::new();

        let url = match payload.url.as_deref() {
            Some(url) if !url.trim().is_empty() => Some(url.to_string()),
            _ => {
                issues.push("url: required non-empty string".to_string());
                None
            }
        };

        let loaded_raw = payload.page_loaded_at.clone();
        let loaded_at = match loaded_raw.as_deref().map(DateTime::parse_from_rfc3339) {
            Some(Ok(ts)) => Some(ts.with_timezone(&Utc)),
            Some(Err(e)) => {
                issues.push(format!("page_loaded_at: not an ISO timestamp ({})", e));
                None
            }
            None => {
                issues.push("page_loaded_at: required ISO timestamp".to_string());
                None
            }
        };

        let content = match payload.content.as_deref() {
            Some(content) if !content.is_empty() => Some(decode_content(content)),
            _ => {
                issues.push("content: required base64 zstd payload".to_string());
                None
            }
        };

        let referrer_timestamp = match payload.referrer_timestamp.as_deref() {
            Some(raw) => match DateTime::parse_from_rfc3339(raw) {
                Ok(ts) => Some(ts.with_timezone(&Utc)),
                Err(e) => {
                    issues.push(format!("referrer_timestamp: not an ISO timestamp ({})", e));
                    None
                }
            },
            None => None,
        };

        if !issues.is_empty() {
            return Err(issues);
        }

        // All Some() past this point by construction.
        let (url, loaded_at, content) = (
            url.unwrap_or_default(),
            loaded_at.unwrap_or_else(Utc::now),
            content.unwrap_or_default(),
        );
        let mut visit = Visit::new(
            url,
            loaded_raw.as_deref().unwrap_or_default(),
            loaded_at,
            content,
        );
        visit.referrer = payload
            .referrer
            .filter(|r| !r.is_empty() && r != "about:blank");
        visit.referrer_timestamp = referrer_timestamp;
        visit.opener_tab_id = payload.opener_tab_id;

        Ok(Self {
            visit,
            tab_id: payload.tab_id,
        })
    }
}

/// Decode base64 + zstd, degrading gracefully: a bad zstd frame falls back
/// to the decoded bytes, a bad base64 string falls back to the raw text.
fn decode_content(content: &str) -> String {
    match base64::engine::general_purpose::STANDARD.decode(content) {
        Ok(bytes) => match zstd::stream::decode_all(bytes.as_slice()) {
            Ok(decompressed) => String::from_utf8_lossy(&decompressed).into_owned(),
            Err(e) => {
                warn!(error = %e, "Payload not zstd-compressed; using raw bytes");
                String::from_utf8_lossy(&bytes).into_owned()
            }
        },
        Err(e) => {
            warn!(error = %e, "Payload not base64; using raw content");
            content.to_string()
        }
    }
}

// ============================================================================
// VISIT INTAKE
// ============================================================================

#[derive(Debug, Serialize)]
struct QueuedResponse {
    status: &'static str,
    position: usize,
}

#[derive(Debug, Serialize)]
struct ValidationErrorResponse {
    status: &'static str,
    issues: Vec<String>,
}

async fn handle_visit(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<VisitPayload>,
) -> Response {
    if state.queue.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }

    let ValidatedVisit { mut visit, tab_id } = match ValidatedVisit::try_from_payload(payload) {
        Ok(validated) => validated,
        Err(issues) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ValidationErrorResponse {
                    status: "invalid",
                    issues,
                }),
            )
                .into_response();
        }
    };

    // Persist first: whatever happens to referrer resolution, the visit
    // exists. Resubmissions of the same (url, load time) are ignored.
    if let Err(e) = state.storage.insert_visit(&visit) {
        warn!(visit_id = %visit.id, error = %e, "Failed to persist visit");
        return (StatusCode::INTERNAL_SERVER_ERROR, "storage failure").into_response();
    }

    // True-referrer resolution through the tracker snapshot: the tab's own
    // chain first, then the opener's current page.
    let opener_known = {
        let tracker = state.tracker.lock().await;
        if visit.referrer.is_none() {
            if let Some(tab) = tab_id {
                if let Some((url, at)) = tracker.get_referrer(tab) {
                    visit.referrer = Some(url);
                    visit.referrer_timestamp = Some(at);
                }
            }
        }
        if visit.referrer.is_none() {
            if let Some(opener) = visit.opener_tab_id {
                if let Some((url, at)) = tracker.current_of(opener) {
                    visit.referrer = Some(url);
                    visit.referrer_timestamp = Some(at);
                }
            }
        }
        visit
            .opener_tab_id
            .map(|opener| tracker.current_of(opener).is_some())
            .unwrap_or(true)
    };

    if visit.referrer.is_some() {
        if let Err(e) = state.storage.update_visit_referrer(
            &visit.id,
            visit.referrer.as_deref().unwrap_or_default(),
            visit.referrer_timestamp,
        ) {
            warn!(visit_id = %visit.id, error = %e, "Failed to persist resolved referrer");
        }
    }

    // A visit citing an unseen opener waits for it; everything else goes
    // straight to analysis.
    if visit.referrer.is_none() && !opener_known {
        let opener = visit.opener_tab_id.unwrap_or_default();
        let projected = state.queue.depth() + 1;
        info!(visit_id = %visit.id, opener_tab_id = opener, "Visit parked awaiting opener");
        state.orphans.lock().await.add(visit, opener);
        return (
            StatusCode::OK,
            Json(QueuedResponse {
                status: "queued",
                position: projected,
            }),
        )
            .into_response();
    }

    match state.queue.enqueue(visit) {
        Ok(position) => (
            StatusCode::OK,
            Json(QueuedResponse {
                status: "queued",
                position,
            }),
        )
            .into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response(),
    }
}

// ============================================================================
// TAB EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum TabEventKind {
    Created,
    Updated,
    Removed,
    InPage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct TabEvent {
    kind: TabEventKind,
    tab_id: i64,
    url: Option<String>,
    opener_tab_id: Option<i64>,
}

async fn handle_tab_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<TabEvent>,
) -> Response {
    {
        let mut tracker = state.tracker.lock().await;
        match event.kind {
            TabEventKind::Created => {
                tracker.on_tab_created(event.tab_id, event.url.clone(), event.opener_tab_id)
            }
            TabEventKind::Updated => {
                tracker.on_tab_updated(event.tab_id, event.url.clone(), event.opener_tab_id)
            }
            TabEventKind::Removed => tracker.on_tab_removed(event.tab_id),
            TabEventKind::InPage => {
                if let Some(url) = event.url.clone() {
                    tracker.on_in_page_navigation(event.tab_id, url);
                }
            }
        }
    }

    // A tab that now has a page may be the opener some orphans are waiting
    // for.
    if matches!(event.kind, TabEventKind::Created | TabEventKind::Updated) {
        reparent_orphans_for(&state, event.tab_id).await;
    }

    StatusCode::OK.into_response()
}

async fn reparent_orphans_for(state: &AppState, tab_id: i64) {
    let opener_page = state.tracker.lock().await.current_of(tab_id);
    let Some((url, at)) = opener_page else {
        return;
    };

    let (taken, _swept) = state.orphans.lock().await.take_for(tab_id);
    for mut orphan in taken {
        if let Err(e) = state
            .storage
            .update_visit_referrer(&orphan.visit.id, &url, Some(at))
        {
            warn!(visit_id = %orphan.visit.id, error = %e, "Failed to persist repaired referrer");
        }
        orphan.visit.referrer = Some(url.clone());
        orphan.visit.referrer_timestamp = Some(at);
        info!(visit_id = %orphan.visit.id, referrer = %url, "Orphan reparented on tab event");
        if let Err(e) = state.queue.enqueue(orphan.visit) {
            warn!(error = %e, "Could not enqueue reparented visit");
        }
    }
}

// ============================================================================
// STATUS
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
struct StatusResponse {
    status: &'static str,
    version: String,
    uptime_seconds: u64,
    queue_depth: usize,
    open_tabs: usize,
    orphans: pkm_core::OrphanStats,
    filter: pkm_core::FilterMetricsSnapshot,
    store: Option<pkm_core::StoreStats>,
}

async fn handle_status(State(state): State<Arc<AppState>>) -> Response {
    let response = StatusResponse {
        status: "running",
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        queue_depth: state.queue.depth(),
        open_tabs: state.tracker.lock().await.len(),
        orphans: state.orphans.lock().await.stats(),
        filter: state.filter.metrics(),
        store: state.storage.stats().ok(),
    };
    (StatusCode::OK, Json(response)).into_response()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn compress(html: &str) -> String {
        let compressed = zstd::stream::encode_all(html.as_bytes(), 3).unwrap();
        base64::engine::general_purpose::STANDARD.encode(compressed)
    }

    #[test]
    fn test_decode_content_roundtrip() {
        let html = "<html><body>Hello</body></html>";
        assert_eq!(decode_content(&compress(html)), html);
    }

    #[test]
    fn test_decode_content_falls_back_on_plain_base64() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("<html>raw</html>");
        assert_eq!(decode_content(&encoded), "<html>raw</html>");
    }

    #[test]
    fn test_decode_content_falls_back_on_raw_text() {
        // Not valid base64 at all
        assert_eq!(decode_content("<html>!</html>"), "<html>!</html>");
    }

    #[test]
    fn test_payload_validation_collects_all_issues() {
        let payload = VisitPayload {
            url: None,
            page_loaded_at: Some("yesterday".to_string()),
            referrer: None,
            referrer_timestamp: None,
            content: None,
            tab_id: None,
            opener_tab_id: None,
        };
        let issues = ValidatedVisit::try_from_payload(payload).unwrap_err();
        assert_eq!(issues.len(), 3);
        assert!(issues.iter().any(|i| i.starts_with("url:")));
        assert!(issues.iter().any(|i| i.starts_with("page_loaded_at:")));
        assert!(issues.iter().any(|i| i.starts_with("content:")));
    }

    #[test]
    fn test_payload_produces_deterministic_id() {
        let make = || {
            ValidatedVisit::try_from_payload(VisitPayload {
                url: Some("https://docs.example.com/intro".to_string()),
                page_loaded_at: Some("2024-01-15T10:00:00Z".to_string()),
                referrer: None,
                referrer_timestamp: None,
                content: Some(compress("<h1>Intro</h1>")),
                tab_id: None,
                opener_tab_id: None,
            })
            .unwrap()
        };
        assert_eq!(make().visit.id, make().visit.id);
    }

    #[test]
    fn test_blank_referrer_is_dropped() {
        let validated = ValidatedVisit::try_from_payload(VisitPayload {
            url: Some("https://a.example.com".to_string()),
            page_loaded_at: Some("2024-01-15T10:00:00Z".to_string()),
            referrer: Some("about:blank".to_string()),
            referrer_timestamp: None,
            content: Some(compress("<p>x</p>")),
            tab_id: Some(3),
            opener_tab_id: None,
        })
        .unwrap();
        assert!(validated.visit.referrer.is_none());
        assert_eq!(validated.tab_id, Some(3));
    }
}
