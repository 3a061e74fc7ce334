use std::collections::BTreeSet;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::{
    AppState,
    routing::{self, Presence, RoutingDecision},
};
use crate::{
    approvals::{ApprovalId, Decision, Resolution},
    channels::ChannelKind,
    errors::{AppError, Result},
    models::event::{EventKind, NotificationEvent},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationResponse {
    pub decision: &'static str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub filtered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub channels: BTreeSet<ChannelKind>,
}

impl NotificationResponse {
    fn filtered() -> Self {
        Self {
            decision: "ok",
            filtered: true,
            reason: None,
            approval_id: None,
            channels: BTreeSet::new(),
        }
    }

    fn routed(decision: &RoutingDecision) -> Self {
        Self {
            decision: "ok",
            filtered: false,
            reason: decision.reason.map(|reason| reason.as_str()),
            approval_id: None,
            channels: decision.channels.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RespondRequest {
    request_id: String,
    decision: Decision,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/notification", post(notification))
        .route("/permission", post(permission))
        .route("/permission/respond", post(respond))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn notification(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<NotificationResponse>> {
    let event = NotificationEvent::from_slice(&body, None)?;
    Ok(Json(handle_event(&state, event).await))
}

async fn permission(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<NotificationResponse>> {
    let event = NotificationEvent::from_slice(&body, Some(EventKind::PermissionRequest))?;
    Ok(Json(handle_event(&state, event).await))
}

async fn respond(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>> {
    let request: RespondRequest = serde_json::from_slice(&body)
        .map_err(|err| AppError::InvalidEvent(format!("invalid respond body: {err}")))?;

    let resolved = request
        .request_id
        .parse::<ApprovalId>()
        .is_ok_and(|id| state.registry.resolve(id, request.decision));
    if !resolved {
        return Err(AppError::ApprovalNotFound(request.request_id));
    }
    Ok(Json(json!({"status": "ok", "decision": request.decision})))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "pending_approvals": state.registry.pending_count(),
        "desktop": state.desktop.is_some(),
        "telegram": state.telegram.is_some(),
    }))
}

pub async fn handle_event(state: &AppState, event: NotificationEvent) -> NotificationResponse {
    if !state.config.kind_enabled(event.kind) {
        debug!(kind = %event.kind, session_id = %event.session_id, "event kind disabled");
        return NotificationResponse::filtered();
    }

    let presence = Presence {
        idle_seconds: state.idle.idle_seconds().await,
        screen_locked: state.config.telegram.send_on_screen_lock
            && state.idle.screen_locked().await,
    };
    let decision = routing::decide(
        &state.config,
        event.kind,
        presence,
        state.telegram.is_some(),
    );
    info!(
        kind = %event.kind,
        session_id = %event.session_id,
        idle_seconds = presence.idle_seconds,
        channels = ?decision.channels,
        reason = ?decision.reason,
        "routing event"
    );

    if decision.includes(ChannelKind::Desktop)
        && let Some(desktop) = state.desktop.clone()
    {
        let event = event.clone();
        tokio::spawn(async move {
            if let Err(err) = desktop.send(&event, None).await {
                warn!(channel = ?desktop.kind(), error = %err, session_id = %event.session_id, "notification failed");
            }
        });
    }

    let mut response = NotificationResponse::routed(&decision);
    let Some(telegram) = state
        .telegram
        .clone()
        .filter(|_| decision.includes(ChannelKind::Telegram))
    else {
        return response;
    };

    if !event.requires_decision() {
        tokio::spawn(async move {
            if let Err(err) = telegram.send(&event, None).await {
                warn!(channel = ?telegram.kind(), error = %err, session_id = %event.session_id, "notification failed");
            }
        });
        return response;
    }

    let approval = state.registry.create(event);
    response.approval_id = Some(approval.id.to_string());

    let open = approval.resolution == Resolution::Pending;
    let delivered = if open {
        telegram.send(&approval.event, Some(approval.id)).await
    } else {
        debug!(approval_id = %approval.id, "shutting down, approval prompt skipped");
        Ok(())
    };
    if let Err(err) = &delivered {
        warn!(approval_id = %approval.id, error = %err, "approval prompt not delivered");
        state.registry.expire(approval.id);
    }

    let outcome = state
        .registry
        .await_resolution(approval.id, approval.deadline)
        .await;
    info!(
        approval_id = %approval.id,
        decision = outcome.decision(),
        waited_ms = approval.created_at.elapsed().as_millis() as u64,
        "approval finished"
    );

    response.decision = outcome.decision();
    response.reason = if delivered.is_err() {
        Some("delivery_failed")
    } else if !open {
        Some("shutting_down")
    } else {
        outcome.reason().or(response.reason)
    };
    response
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, sync::Arc, time::Duration};

    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use serde_json::{Value, json};
    use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
    use tower::ServiceExt;

    use super::router;
    use crate::{
        approvals::{ApprovalId, ApprovalRegistry, Decision},
        channels::{ChannelKind, Notifier},
        config::Config,
        daemon::AppState,
        errors::{AppError, Result},
        idle::IdleDetector,
        models::event::{EventKind, NotificationEvent},
    };

    type Sent = (NotificationEvent, Option<ApprovalId>);

    struct FakeChannel {
        kind: ChannelKind,
        fail: bool,
        sent: UnboundedSender<Sent>,
    }

    #[async_trait]
    impl Notifier for FakeChannel {
        fn kind(&self) -> ChannelKind {
            self.kind
        }

        async fn send(&self, event: &NotificationEvent, approval: Option<ApprovalId>) -> Result<()> {
            let _ = self.sent.send((event.clone(), approval));
            if self.fail {
                return Err(AppError::TelegramApi("fake outage".to_string()));
            }
            Ok(())
        }
    }

    struct FixedIdle(u64);

    #[async_trait]
    impl IdleDetector for FixedIdle {
        async fn idle_seconds(&self) -> u64 {
            self.0
        }
    }

    struct Harness {
        state: AppState,
        desktop_rx: UnboundedReceiver<Sent>,
        telegram_rx: UnboundedReceiver<Sent>,
    }

    fn harness(config: Config, idle_seconds: u64, desktop_fails: bool, telegram_fails: bool) -> Harness {
        let (desktop_tx, desktop_rx) = mpsc::unbounded_channel();
        let (telegram_tx, telegram_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(ApprovalRegistry::new(
            config.approval_timeout(),
            config.approval_grace(),
        ));
        let state = AppState {
            config: Arc::new(config),
            idle: Arc::new(FixedIdle(idle_seconds)),
            desktop: Some(Arc::new(FakeChannel {
                kind: ChannelKind::Desktop,
                fail: desktop_fails,
                sent: desktop_tx,
            })),
            telegram: Some(Arc::new(FakeChannel {
                kind: ChannelKind::Telegram,
                fail: telegram_fails,
                sent: telegram_tx,
            })),
            registry,
        };
        Harness {
            state,
            desktop_rx,
            telegram_rx,
        }
    }

    fn config(threshold: u64) -> Config {
        let mut config = Config::default();
        config.telegram.idle_threshold_seconds = threshold;
        config
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn call(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
        let response = router(state.clone())
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, serde_json::from_slice(&bytes).expect("json body"))
    }

    #[tokio::test]
    async fn disabled_kind_is_filtered_without_dispatch() {
        let mut config = config(0);
        config.enabled_kinds = BTreeSet::from([EventKind::PermissionRequest]);
        let mut harness = harness(config, 9_999, false, false);

        let (status, body) = call(
            &harness.state,
            post("/notification", json!({"kind": "idle_prompt", "session_id": "abc"})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"decision": "ok", "filtered": true}));
        tokio::task::yield_now().await;
        assert!(harness.desktop_rx.try_recv().is_err());
        assert!(harness.telegram_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_body_is_rejected() {
        let harness = harness(config(300), 0, false, false);

        let request = Request::builder()
            .method("POST")
            .uri("/notification")
            .body(Body::from("{not json"))
            .expect("request");
        let (status, body) = call(&harness.state, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "invalid_event");
        assert_eq!(harness.state.registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn present_operator_gets_desktop_only() {
        let mut harness = harness(config(300), 299, false, false);

        let (status, body) = call(
            &harness.state,
            post("/notification", json!({"kind": "idle_prompt", "session_id": "abc"})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"decision": "ok", "channels": ["desktop"]}));
        let (event, approval) = harness.desktop_rx.recv().await.expect("desktop send");
        assert_eq!(event.session_id, "abc");
        assert!(approval.is_none());
        assert!(harness.telegram_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn idle_operator_also_gets_telegram() {
        let mut harness = harness(config(300), 301, false, false);

        let (_, body) = call(
            &harness.state,
            post("/notification", json!({"kind": "idle_prompt", "session_id": "abc"})),
        )
        .await;

        assert_eq!(
            body,
            json!({"decision": "ok", "reason": "idle", "channels": ["desktop", "telegram"]})
        );
        assert!(harness.desktop_rx.recv().await.is_some());
        assert!(harness.telegram_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn tap_allow_releases_the_caller() {
        let mut harness = harness(config(300), 0, false, false);
        let state = harness.state.clone();
        let pending = tokio::spawn(async move {
            call(
                &state,
                post(
                    "/notification",
                    json!({"kind": "permission_request", "session_id": "abc", "tool_name": "Bash"}),
                ),
            )
            .await
        });

        let (event, approval) = harness.telegram_rx.recv().await.expect("telegram send");
        let approval_id = approval.expect("approval attached");
        assert_eq!(event.session_id, "abc");

        assert!(
            harness
                .state
                .registry
                .resolve(approval_id, Decision::Allow)
        );
        let (status, body) = pending.await.expect("join");

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["decision"], "allow");
        assert_eq!(body["approval_id"], approval_id.to_string());
        assert!(harness.state.registry.get(approval_id).is_none());
        assert!(
            !harness
                .state
                .registry
                .resolve(approval_id, Decision::Deny)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_approval_times_out() {
        let mut harness = harness(config(300), 0, false, false);

        let (status, body) = call(
            &harness.state,
            post("/permission", json!({"session_id": "abc", "tool_name": "Bash"})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["decision"], "timed_out");
        let (_, approval) = harness.telegram_rx.recv().await.expect("telegram send");
        let approval_id = approval.expect("approval attached");
        assert!(harness.state.registry.get(approval_id).is_none());
        assert_eq!(harness.state.registry.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delivery_answers_without_waiting() {
        let harness = harness(config(300), 0, false, true);
        let started = tokio::time::Instant::now();

        let (_, body) = call(
            &harness.state,
            post("/permission", json!({"session_id": "abc"})),
        )
        .await;

        assert_eq!(body["decision"], "timed_out");
        assert_eq!(body["reason"], "delivery_failed");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(harness.state.registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn desktop_failure_leaves_plain_events_untouched() {
        let mut harness = harness(config(300), 301, true, false);

        let (status, body) = call(
            &harness.state,
            post("/notification", json!({"kind": "idle_prompt", "session_id": "abc"})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"decision": "ok", "reason": "idle", "channels": ["desktop", "telegram"]})
        );
        assert!(harness.desktop_rx.recv().await.is_some());
        let (event, approval) = harness.telegram_rx.recv().await.expect("telegram send");
        assert_eq!(event.session_id, "abc");
        assert!(approval.is_none());
    }

    #[tokio::test]
    async fn approvals_for_different_sessions_resolve_independently() {
        let mut harness = harness(config(300), 0, false, false);
        let spawn_request = |session_id: &'static str| {
            let state = harness.state.clone();
            tokio::spawn(async move {
                call(
                    &state,
                    post("/permission", json!({"session_id": session_id, "tool_name": "Bash"})),
                )
                .await
            })
        };
        let first = spawn_request("a");
        let second = spawn_request("b");

        let mut ids = std::collections::HashMap::new();
        for _ in 0..2 {
            let (event, approval) = harness.telegram_rx.recv().await.expect("telegram send");
            ids.insert(event.session_id, approval.expect("approval attached"));
        }
        assert_eq!(harness.state.registry.pending_count(), 2);

        assert!(harness.state.registry.resolve(ids["b"], Decision::Deny));
        let (_, body) = second.await.expect("join");
        assert_eq!(body["decision"], "deny");
        assert_eq!(body["approval_id"], ids["b"].to_string());
        assert_eq!(harness.state.registry.pending_count(), 1);

        assert!(harness.state.registry.resolve(ids["a"], Decision::Allow));
        let (_, body) = first.await.expect("join");
        assert_eq!(body["decision"], "allow");
        assert_eq!(body["approval_id"], ids["a"].to_string());
    }

    #[tokio::test(start_paused = true)]
    async fn approvals_during_shutdown_answer_immediately() {
        let mut harness = harness(config(300), 0, false, false);
        harness.state.registry.close();
        let started = tokio::time::Instant::now();

        let (status, body) = call(
            &harness.state,
            post("/permission", json!({"session_id": "abc", "tool_name": "Bash"})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["decision"], "timed_out");
        assert_eq!(body["reason"], "shutting_down");
        assert!(started.elapsed() < Duration::from_secs(1));
        tokio::task::yield_now().await;
        assert!(harness.telegram_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn desktop_failure_does_not_block_local_resolution() {
        let mut harness = harness(config(300), 0, true, false);
        let state = harness.state.clone();
        let pending = tokio::spawn(async move {
            call(&state, post("/permission", json!({"session_id": "abc"}))).await
        });

        assert!(harness.desktop_rx.recv().await.is_some());
        let (_, approval) = harness.telegram_rx.recv().await.expect("telegram send");
        let approval_id = approval.expect("approval attached").to_string();

        let (status, body) = call(
            &harness.state,
            post(
                "/permission/respond",
                json!({"request_id": approval_id, "decision": "deny"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok", "decision": "deny"}));

        let (status, body) = pending.await.expect("join");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["decision"], "deny");

        let (status, body) = call(
            &harness.state,
            post(
                "/permission/respond",
                json!({"request_id": approval_id, "decision": "allow"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn respond_rejects_bad_bodies() {
        let harness = harness(config(300), 0, false, false);

        let (status, _) = call(
            &harness.state,
            post("/permission/respond", json!({"request_id": "x", "decision": "maybe"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &harness.state,
            post("/permission/respond", json!({"request_id": "nope", "decision": "allow"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_reports_channels_and_pending_count() {
        let harness = harness(config(300), 0, false, false);
        harness.state.registry.create(
            NotificationEvent::from_value(json!({"kind": "permission_request"}), None)
                .expect("event"),
        );

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .expect("request");
        let (status, body) = call(&harness.state, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"status": "healthy", "pending_approvals": 1, "desktop": true, "telegram": true})
        );
    }
}
