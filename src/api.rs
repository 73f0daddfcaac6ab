//! HTTP surface.
//!
//! # Routes
//!
//! - `GET /api/v1/mail/attachment` - start the listener if it is not running, otherwise
//!   request a manual pass
//! - `GET /api/v1/mail/health` - service and listener state
//!
//! Every response uses the same envelope:
//!
//! ```json
//! {"statusCode": 200, "data": {...}, "message": "...", "success": true}
//! ```
//!
//! Failures carry an extra `errors` array.
//!
//! Each client address may send 100 requests per 15 minutes; further requests get a
//! `429` in the same envelope. Requests are logged through `tower-http`'s trace layer.

use crate::error::{Error, Result};
use crate::listener::{ConnectionState, ListenerHandle};
use crate::trigger::Trigger;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, info, instrument, warn, Level};

/// Response envelope shared by all routes.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse {
    /// HTTP status code, repeated in the body.
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    /// Route-specific payload.
    pub data: Value,
    /// Human-readable summary.
    pub message: String,
    /// `statusCode < 400`.
    pub success: bool,
    /// Error details, only on failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

impl ApiResponse {
    /// Builds a response; `success` follows the status code.
    pub fn new(status: StatusCode, data: Value, message: impl Into<String>) -> Self {
        Self {
            status_code: status.as_u16(),
            data,
            message: message.into(),
            success: status.as_u16() < 400,
            errors: None,
        }
    }

    /// Builds an error response.
    pub fn error(status: StatusCode, message: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            errors: Some(errors),
            ..Self::new(status, Value::Null, message)
        }
    }
}

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

/// What a manual request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualOutcome {
    /// No listener was running; a new one was started.
    Started,
    /// A manual pass was queued on the running listener.
    Queued,
    /// A pass is already pending or running; the request was dropped.
    Busy,
}

type ListenerFactory = Box<dyn Fn() -> Result<ListenerHandle> + Send + Sync>;

/// Keeps track of the current listener and (re)starts it on demand.
pub struct ListenerSupervisor {
    factory: ListenerFactory,
    current: Mutex<Option<ListenerHandle>>,
}

impl ListenerSupervisor {
    /// Creates a supervisor that builds listeners with `factory`.
    ///
    /// The factory must spawn the listener and return its handle.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<ListenerHandle> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            current: Mutex::new(None),
        }
    }

    /// Starts a listener unless one is live, in which case a manual pass is requested.
    ///
    /// A listener that gave up (`Failed`) or was shut down is replaced.
    #[instrument(name = "api::ensure_running", skip_all)]
    pub async fn ensure_running(&self) -> Result<ManualOutcome> {
        let mut current = self.current.lock().await;

        if let Some(handle) = current.as_ref().filter(|handle| !handle.is_stopped()) {
            let outcome = if handle.trigger(Trigger::Manual) {
                ManualOutcome::Queued
            } else {
                ManualOutcome::Busy
            };
            info!(?outcome, state = %handle.state(), "Manual trigger");
            return Ok(outcome);
        }

        let handle = (self.factory)()?;
        info!("Listener started");
        *current = Some(handle);
        Ok(ManualOutcome::Started)
    }

    /// State of the current listener, `None` before the first start.
    pub async fn state(&self) -> Option<ConnectionState> {
        self.current.lock().await.as_ref().map(ListenerHandle::state)
    }

    /// Asks the current listener to stop and waits until it has.
    ///
    /// A pass in flight is finished first.
    pub async fn shutdown(&self) {
        let Some(mut handle) = self.current.lock().await.clone() else {
            return;
        };
        handle.shutdown();
        handle
            .wait_for(|state| {
                matches!(state, ConnectionState::Disconnected | ConnectionState::Failed)
            })
            .await;
    }
}

impl std::fmt::Debug for ListenerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSupervisor").finish_non_exhaustive()
    }
}

/// Request budget per client address.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests allowed per window.
    pub max_requests: u32,
    /// Window length, counted from the client's first request.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(15 * 60),
        }
    }
}

/// Fixed-window request counter keyed by client address.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<IpAddr, (u32, Instant)>>,
}

impl RateLimiter {
    /// Creates a limiter with `config`.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Counts a request from `client`.
    ///
    /// # Errors
    ///
    /// Returns the time until the client's window ends when its budget is spent.
    pub async fn check(&self, client: IpAddr) -> std::result::Result<(), Duration> {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        let window = self.config.window;

        windows.retain(|_, (_, start)| now.duration_since(*start) < window);
        let (count, start) = windows.entry(client).or_insert((0, now));

        if *count >= self.config.max_requests {
            return Err(window.saturating_sub(now.duration_since(*start)));
        }
        *count += 1;
        Ok(())
    }
}

/// Builds the router with the default rate limit.
pub fn router(supervisor: Arc<ListenerSupervisor>) -> Router {
    router_with_limit(supervisor, RateLimitConfig::default())
}

/// Builds the router with a custom rate limit.
pub fn router_with_limit(supervisor: Arc<ListenerSupervisor>, limit: RateLimitConfig) -> Router {
    let mail = Router::new()
        .route("/attachment", get(manual_trigger))
        .route("/health", get(health));

    Router::new()
        .nest("/api/v1/mail", mail)
        .layer(middleware::from_fn_with_state(
            Arc::new(RateLimiter::new(limit)),
            rate_limit,
        ))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(supervisor)
}

/// Serves the router on `addr` until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, supervisor: Arc<ListenerSupervisor>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| Error::HttpBind {
            addr: addr.to_string(),
            source,
        })?;

    info!(%addr, "HTTP server listening");

    let app = router(supervisor).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|source| Error::HttpServe { source })
}

async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    // Requests that did not come through a socket (in-process calls) share one budget
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or(IpAddr::V4(Ipv4Addr::LOCALHOST), |ConnectInfo(addr)| addr.ip());

    match limiter.check(client).await {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            let retry_secs = retry_after.as_secs().max(1);
            warn!(%client, retry_after_secs = retry_secs, "Rate limit exceeded");

            let mut response = ApiResponse::error(
                StatusCode::TOO_MANY_REQUESTS,
                "Too many requests, please try again later.",
                vec![format!("Retry after {retry_secs} seconds")],
            )
            .into_response();
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_secs));
            response
        }
    }
}

async fn manual_trigger(State(supervisor): State<Arc<ListenerSupervisor>>) -> ApiResponse {
    match supervisor.ensure_running().await {
        Ok(outcome) => {
            let message = match outcome {
                ManualOutcome::Started => "Mail listener started",
                ManualOutcome::Queued => "Mailbox check queued",
                ManualOutcome::Busy => "A mailbox check is already pending",
            };
            let state = supervisor.state().await.map(|s| s.to_string());
            ApiResponse::new(
                StatusCode::OK,
                json!({ "trigger": outcome, "state": state }),
                message,
            )
        }
        Err(e) => {
            error!(error = %e, category = %e.category(), "Failed to start listener");
            ApiResponse::error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to start mail listener",
                vec![e.to_string()],
            )
        }
    }
}

async fn health(State(supervisor): State<Arc<ListenerSupervisor>>) -> ApiResponse {
    let state = supervisor.state().await;
    let failed = state.is_some_and(ConnectionState::is_terminal);
    let listener = state.map_or_else(|| "not_started".to_string(), |s| s.to_string());
    let status = if failed { "degraded" } else { "ok" };
    let data = json!({
        "status": status,
        "listener": listener,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });

    if failed {
        return ApiResponse::new(
            StatusCode::SERVICE_UNAVAILABLE,
            data,
            "Mail listener gave up reconnecting",
        );
    }
    ApiResponse::new(StatusCode::OK, data, "Service is healthy")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ListenerConfig, NotificationConfig};
    use crate::listener::Listener;
    use crate::processor::MessageProcessor;
    use crate::testing::{FakeConnector, FakeMailbox, FakeTickets, RecordingTransport};
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    fn listener_config(max_reconnect_attempts: u32) -> ListenerConfig {
        ListenerConfig {
            max_reconnect_attempts,
            reconnect_delay: Duration::from_secs(60),
            idle_refresh_interval: Duration::from_secs(300),
            poll_interval: Duration::from_secs(60),
        }
    }

    fn spawn_fake(connector: FakeConnector, max_reconnect_attempts: u32) -> ListenerHandle {
        let processor = MessageProcessor::new(
            Arc::new(FakeTickets::default()),
            Arc::new(RecordingTransport::default()),
            NotificationConfig::default(),
        );
        let (listener, handle) = Listener::new(
            Arc::new(connector),
            processor,
            listener_config(max_reconnect_attempts),
        );
        tokio::spawn(listener.run());
        handle
    }

    fn supervisor_with_calls(
        failing_connect: bool,
    ) -> (Arc<ListenerSupervisor>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let supervisor = ListenerSupervisor::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let connector = if failing_connect {
                FakeConnector::always_failing()
            } else {
                FakeConnector::new([Some(FakeMailbox::with_messages(vec![]))])
            };
            Ok(spawn_fake(connector, 0))
        });
        (Arc::new(supervisor), calls)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn test_envelope_shape() {
        let ok = serde_json::to_value(ApiResponse::new(StatusCode::OK, json!({}), "fine")).unwrap();
        assert_eq!(ok["statusCode"], 200);
        assert_eq!(ok["success"], true);
        assert!(ok.get("errors").is_none());

        let err = serde_json::to_value(ApiResponse::error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "broken",
            vec!["cause".into()],
        ))
        .unwrap();
        assert_eq!(err["statusCode"], 500);
        assert_eq!(err["success"], false);
        assert_eq!(err["errors"][0], "cause");
    }

    #[tokio::test]
    async fn test_health_before_start() {
        let (supervisor, _) = supervisor_with_calls(false);
        let (status, body) = get(router(supervisor), "/api/v1/mail/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "ok");
        assert_eq!(body["data"]["listener"], "not_started");
    }

    #[tokio::test]
    async fn test_attachment_starts_then_triggers() {
        let (supervisor, calls) = supervisor_with_calls(false);

        let (status, body) = get(router(Arc::clone(&supervisor)), "/api/v1/mail/attachment").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["trigger"], "started");

        let (status, body) = get(router(Arc::clone(&supervisor)), "/api/v1/mail/attachment").await;
        assert_eq!(status, StatusCode::OK);
        let trigger = body["data"]["trigger"].as_str().unwrap();
        assert!(trigger == "queued" || trigger == "busy", "{trigger}");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_listener_is_restarted() {
        let (supervisor, calls) = supervisor_with_calls(true);

        assert_eq!(supervisor.ensure_running().await.unwrap(), ManualOutcome::Started);
        let mut handle = supervisor.current.lock().await.clone().unwrap();
        handle.wait_for(|s| s.is_terminal()).await;

        let (status, body) = get(router(Arc::clone(&supervisor)), "/api/v1/mail/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["data"]["listener"], "failed");
        assert_eq!(body["success"], false);

        assert_eq!(supervisor.ensure_running().await.unwrap(), ManualOutcome::Started);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_requests_over_limit_get_429() {
        let (supervisor, _) = supervisor_with_calls(false);
        let app = router_with_limit(
            supervisor,
            RateLimitConfig {
                max_requests: 2,
                window: Duration::from_secs(60),
            },
        );

        for _ in 0..2 {
            let (status, _) = get(app.clone(), "/api/v1/mail/health").await;
            assert_eq!(status, StatusCode::OK);
        }

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/mail/attachment")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = response.headers()[RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=60).contains(&retry_after));

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["statusCode"], 429);
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "Too many requests, please try again later.");
    }

    #[tokio::test]
    async fn test_rejected_request_does_not_reach_handler() {
        let (supervisor, calls) = supervisor_with_calls(false);
        let app = router_with_limit(
            Arc::clone(&supervisor),
            RateLimitConfig {
                max_requests: 1,
                window: Duration::from_secs(60),
            },
        );

        let (status, _) = get(app.clone(), "/api/v1/mail/health").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = get(app, "/api/v1/mail/attachment").await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_window() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 2,
            window: Duration::from_secs(15 * 60),
        });
        let client: IpAddr = "192.0.2.7".parse().unwrap();
        let other: IpAddr = "192.0.2.8".parse().unwrap();

        assert!(limiter.check(client).await.is_ok());
        assert!(limiter.check(client).await.is_ok());

        tokio::time::advance(Duration::from_secs(60)).await;
        let retry_after = limiter.check(client).await.unwrap_err();
        assert_eq!(retry_after, Duration::from_secs(14 * 60));

        // Other clients have their own budget
        assert!(limiter.check(other).await.is_ok());

        tokio::time::advance(Duration::from_secs(14 * 60)).await;
        assert!(limiter.check(client).await.is_ok());
    }

    #[test]
    fn test_default_rate_limit() {
        let limit = RateLimitConfig::default();
        assert_eq!(limit.max_requests, 100);
        assert_eq!(limit.window, Duration::from_secs(900));
    }

    #[tokio::test]
    async fn test_factory_error_is_reported() {
        let supervisor = Arc::new(ListenerSupervisor::new(|| {
            Err(Error::InvalidConfig {
                message: "SMTP_SERVER is empty".into(),
            })
        }));

        let (status, body) = get(router(supervisor), "/api/v1/mail/attachment").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert!(body["errors"][0].as_str().unwrap().contains("SMTP_SERVER"));
    }
}
