//! HTTP in-side connector.
//!
//! Two JSON endpoints, both keyed by a caller-chosen `ID` that is echoed back:
//!
//! - `POST /udp/send` with `{"ID": 7, "wait": true, "request": [..bytes..]}`
//!   answers `{"ID": 7, "reply": [..bytes..]}` with the first reply. With
//!   `"wait": false` the request is fire-and-forget and the answer is
//!   `{"ID": 7}`.
//! - `POST /udp/broadcast` with `{"ID": 7, "wait": "500ms", "request": [..]}`
//!   collects every reply that arrives within `wait` and answers
//!   `{"ID": 7, "replies": [[..], ..]}`.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use udptunnel_core::config::parse_duration;
use udptunnel_core::{
    Backoff, BackoffPolicy, Connector, ConnectorError, Lifecycle, PendingTable, ReplyHandler,
    Routed, Switch, next_id,
};

use crate::stream::bind_with_retry;

const fn default_wait() -> bool {
    true
}

/// Body of `POST /udp/send`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    #[serde(rename = "ID", default)]
    pub id: i64,
    /// Wait for the reply. `false` relays the request and returns at once.
    #[serde(default = "default_wait")]
    pub wait: bool,
    pub request: Vec<u8>,
}

/// Response of `POST /udp/send`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResponse {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<Vec<u8>>,
}

/// Body of `POST /udp/broadcast`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastRequest {
    #[serde(rename = "ID", default)]
    pub id: i64,
    /// How long to collect replies, e.g. `500ms`. Defaults to the UDP timeout.
    #[serde(default)]
    pub wait: Option<String>,
    pub request: Vec<u8>,
}

/// Response of `POST /udp/broadcast`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastResponse {
    #[serde(rename = "ID")]
    pub id: i64,
    pub replies: Vec<Vec<u8>>,
}

/// Shared handler state.
#[derive(Clone)]
pub struct HttpState {
    pub switch: Switch,
    pub timeout: Duration,
}

pub fn build_router(state: HttpState) -> axum::Router {
    axum::Router::new()
        .route("/udp/send", post(udp_send))
        .route("/udp/broadcast", post(udp_broadcast))
        .with_state(state)
}

fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, message.into()).into_response()
}

fn rate_limited() -> Response {
    (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response()
}

/// Handler that forwards its reply to a waiting request.
fn forward_to(tx: mpsc::UnboundedSender<Vec<u8>>) -> ReplyHandler {
    ReplyHandler::new(move |reply| async move {
        let _ = tx.send(reply);
    })
}

/// Period at which a waiting request refreshes its pending entry, well inside
/// the idle timeout so the sweep never evicts it.
fn keep_alive_period(idle_timeout: Duration) -> Duration {
    (idle_timeout / 4).max(Duration::from_millis(10))
}

/// `POST /udp/send`
async fn udp_send(
    State(state): State<HttpState>,
    body: Result<Json<SendRequest>, JsonRejection>,
) -> Response {
    let body = match body {
        Ok(Json(body)) => body,
        Err(e) => {
            warn!(error = %e.body_text(), "Invalid /udp/send request");
            return bad_request(e.body_text());
        }
    };
    if body.request.is_empty() {
        return bad_request("Empty request");
    }

    let id = next_id();
    if !body.wait {
        if state.switch.received(id, body.request, None).await == Routed::RateLimited {
            return rate_limited();
        }
        return Json(SendResponse { id: body.id, reply: None }).into_response();
    }

    let (tx, rx) = oneshot::channel();
    let handler = ReplyHandler::new(move |reply| async move {
        let _ = tx.send(reply);
    });
    if state.switch.received(id, body.request, Some(handler)).await == Routed::RateLimited {
        return rate_limited();
    }

    match tokio::time::timeout(state.timeout, rx).await {
        Ok(Ok(reply)) => Json(SendResponse {
            id: body.id,
            reply: Some(reply),
        })
        .into_response(),
        _ => {
            debug!(id, timeout_ms = state.timeout.as_millis(), "No reply to /udp/send");
            state.switch.router().pending().take(id).await;
            (StatusCode::GATEWAY_TIMEOUT, "No reply").into_response()
        }
    }
}

/// `POST /udp/broadcast`
async fn udp_broadcast(
    State(state): State<HttpState>,
    body: Result<Json<BroadcastRequest>, JsonRejection>,
) -> Response {
    let body = match body {
        Ok(Json(body)) => body,
        Err(e) => {
            warn!(error = %e.body_text(), "Invalid /udp/broadcast request");
            return bad_request(e.body_text());
        }
    };
    if body.request.is_empty() {
        return bad_request("Empty request");
    }
    let wait = match body.wait.as_deref().map(parse_duration).transpose() {
        Ok(wait) => wait.unwrap_or(state.timeout),
        Err(e) => return bad_request(e.to_string()),
    };

    let id = next_id();
    let (tx, rx) = mpsc::unbounded_channel();
    if state.switch.received(id, body.request, Some(forward_to(tx.clone()))).await
        == Routed::RateLimited
    {
        return rate_limited();
    }

    let replies = collect_replies(state.switch.router().pending(), id, wait, tx, rx).await;
    debug!(id, replies = replies.len(), "Broadcast wait finished");
    Json(BroadcastResponse {
        id: body.id,
        replies,
    })
    .into_response()
}

/// Gather replies to `id` until `wait` elapses.
///
/// Each handler delivers one reply, so a fresh one is registered after every
/// reply. The entry is refreshed while waiting and removed at the end.
async fn collect_replies(
    pending: &PendingTable,
    id: u32,
    wait: Duration,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) -> Vec<Vec<u8>> {
    let mut replies = Vec::new();
    let mut keep_alive = tokio::time::interval(keep_alive_period(pending.idle_timeout()));
    keep_alive.tick().await;
    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            Some(reply) = rx.recv() => {
                replies.push(reply);
                pending.put(id, forward_to(tx.clone())).await;
            }
            _ = keep_alive.tick() => {
                pending.touch(id).await;
            }
            () = &mut deadline => break,
        }
    }

    pending.take(id).await;
    replies
}

/// `http/<address>` connector.
pub struct HttpConnector {
    lifecycle: Lifecycle,
    addr: SocketAddr,
    policy: BackoffPolicy,
    timeout: Duration,
    bound: watch::Sender<Option<SocketAddr>>,
}

impl HttpConnector {
    pub fn new(addr: SocketAddr, policy: BackoffPolicy, timeout: Duration) -> Self {
        let (bound, _) = watch::channel(None);
        Self {
            lifecycle: Lifecycle::new(format!("http/{addr}")),
            addr,
            policy,
            timeout,
            bound,
        }
    }

    /// Address of the listening socket, once bound.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let mut rx = self.bound.subscribe();
        rx.wait_for(Option::is_some).await.ok().and_then(|addr| *addr)
    }
}

#[async_trait]
impl Connector for HttpConnector {
    fn tag(&self) -> &str {
        self.lifecycle.tag()
    }

    async fn run(&self, switch: Switch) -> Result<(), ConnectorError> {
        let _guard = self.lifecycle.guard();
        let cancel = self.lifecycle.token();
        let mut backoff = Backoff::new(self.policy);

        let Some(listener) = bind_with_retry(self.tag(), self.addr, &mut backoff, cancel).await? else {
            return Ok(());
        };
        let local = listener.local_addr().map_err(|e| ConnectorError::io(self.tag(), e))?;
        self.bound.send_replace(Some(local));
        info!(connector = %self.tag(), addr = %local, "HTTP server listening");

        let app = build_router(HttpState {
            switch,
            timeout: self.timeout,
        });
        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.clone().cancelled_owned())
            .await
            .map_err(|e| ConnectorError::io(self.tag(), e))?;

        self.bound.send_replace(None);
        info!(connector = %self.tag(), "HTTP server stopped");
        Ok(())
    }

    fn send(&self, id: u32, _payload: Vec<u8>) {
        debug!(connector = %self.tag(), id, "Ignoring message for HTTP connector");
    }

    async fn close(&self) {
        self.lifecycle.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;
    use udptunnel_core::{Router, RouterConfig};

    fn router() -> Arc<Router> {
        Router::start(RouterConfig {
            rate_limit: None,
            ..RouterConfig::default()
        })
    }

    /// A switch whose other side answers every request with each of
    /// `answers(payload)`, `delay` apart.
    fn answering_switch<F>(router: &Arc<Router>, delay: Duration, answers: F) -> Switch
    where
        F: Fn(Vec<u8>) -> Vec<Vec<u8>> + Send + Sync + 'static,
    {
        let answering = Arc::clone(router);
        Switch::new(Arc::clone(router), move |id, payload| {
            let peer = Switch::new(Arc::clone(&answering), |_, _| {});
            let replies = answers(payload);
            tokio::spawn(async move {
                for reply in replies {
                    tokio::time::sleep(delay).await;
                    peer.received(id, reply, None).await;
                }
            });
        })
    }

    fn reversing_switch(router: &Arc<Router>) -> Switch {
        answering_switch(router, Duration::ZERO, |mut payload| {
            payload.reverse();
            vec![payload]
        })
    }

    fn app(switch: Switch, timeout: Duration) -> axum::Router {
        build_router(HttpState { switch, timeout })
    }

    async fn post(app: axum::Router, uri: &str, content_type: &str, body: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", content_type)
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.oneshot(request).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn post_json(app: axum::Router, uri: &str, body: &str) -> (StatusCode, Vec<u8>) {
        post(app, uri, "application/json", body).await
    }

    #[tokio::test]
    async fn send_returns_reply_with_caller_id() {
        let router = router();
        let app = app(reversing_switch(&router), Duration::from_secs(2));

        let (status, body) = post_json(app, "/udp/send", r#"{"ID": 7, "wait": true, "request": [1, 2, 3]}"#).await;
        assert_eq!(status, StatusCode::OK);
        let resp: SendResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp, SendResponse { id: 7, reply: Some(vec![3, 2, 1]) });
        assert!(router.pending().is_empty().await);
    }

    #[tokio::test]
    async fn send_waits_by_default() {
        let router = router();
        let app = app(reversing_switch(&router), Duration::from_secs(2));

        let (status, body) = post_json(app, "/udp/send", r#"{"request": [4, 5]}"#).await;
        assert_eq!(status, StatusCode::OK);
        let resp: SendResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp, SendResponse { id: 0, reply: Some(vec![5, 4]) });
    }

    #[tokio::test]
    async fn send_without_wait_only_echoes_id() {
        let router = router();
        let (tx, mut relayed) = mpsc::unbounded_channel();
        let switch = Switch::new(Arc::clone(&router), move |id, payload| {
            let _ = tx.send((id, payload));
        });

        let (status, body) = post_json(app(switch, Duration::from_secs(2)), "/udp/send", r#"{"ID": 3, "wait": false, "request": [9]}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_slice::<serde_json::Value>(&body).unwrap(), serde_json::json!({"ID": 3}));
        assert_eq!(relayed.recv().await.unwrap().1, vec![9]);
        assert!(router.pending().is_empty().await);
    }

    #[tokio::test]
    async fn send_without_reply_times_out() {
        let router = router();
        let switch = Switch::new(Arc::clone(&router), |_, _| {});

        let (status, _) = post_json(app(switch, Duration::from_millis(50)), "/udp/send", r#"{"ID": 1, "request": [9]}"#).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert!(router.pending().is_empty().await);
    }

    #[tokio::test]
    async fn broadcast_collects_every_reply() {
        let router = router();
        let switch = answering_switch(&router, Duration::from_millis(20), |payload| {
            vec![[b"a".as_slice(), payload.as_slice()].concat(), [b"b".as_slice(), payload.as_slice()].concat()]
        });

        let (status, body) = post_json(app(switch, Duration::from_secs(5)), "/udp/broadcast", r#"{"ID": 11, "wait": "300ms", "request": [1]}"#).await;
        assert_eq!(status, StatusCode::OK);
        let resp: BroadcastResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.id, 11);
        assert_eq!(resp.replies, vec![vec![b'a', 1], vec![b'b', 1]]);
        assert!(router.pending().is_empty().await);
    }

    #[tokio::test]
    async fn broadcast_without_replies_returns_empty_list() {
        let router = router();
        let switch = Switch::new(Arc::clone(&router), |_, _| {});

        let (status, body) = post_json(app(switch, Duration::from_secs(30)), "/udp/broadcast", r#"{"ID": 2, "wait": "50ms", "request": [9]}"#).await;
        assert_eq!(status, StatusCode::OK);
        let resp: BroadcastResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp, BroadcastResponse { id: 2, replies: Vec::new() });
        assert!(router.pending().is_empty().await);
    }

    #[tokio::test]
    async fn broadcast_outlives_the_idle_timeout() {
        let router = Router::start(RouterConfig {
            idle_timeout: Duration::from_millis(200),
            sweep_interval: Duration::from_millis(100),
            rate_limit: None,
        });
        let switch = answering_switch(&router, Duration::from_millis(500), |payload| vec![payload]);

        let (status, body) = post_json(app(switch, Duration::from_secs(5)), "/udp/broadcast", r#"{"wait": "800ms", "request": [6]}"#).await;
        assert_eq!(status, StatusCode::OK);
        let resp: BroadcastResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.replies, vec![vec![6]]);
        router.close().await;
    }

    #[tokio::test]
    async fn malformed_requests_are_rejected() {
        let cases = [
            ("/udp/send", "application/json", r#"{"request": []}"#),
            ("/udp/send", "application/json", r#"{"wait": "2s", "request": [1]}"#),
            ("/udp/send", "text/plain", r#"{"request": [1]}"#),
            ("/udp/broadcast", "application/json", r#"{"request": []}"#),
            ("/udp/broadcast", "application/json", r#"{"wait": "soon", "request": [1]}"#),
            ("/udp/broadcast", "application/x-www-form-urlencoded", "request=1"),
            ("/udp/broadcast", "application/json", "{not json"),
        ];
        for (uri, content_type, body) in cases {
            let app = app(Switch::new(router(), |_, _| {}), Duration::from_secs(1));
            let (status, _) = post(app, uri, content_type, body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri} {content_type} {body}");
        }
    }

    #[tokio::test]
    async fn rate_limited_request_is_refused() {
        let router = Router::start(RouterConfig {
            rate_limit: Some((0.001, 1)),
            ..RouterConfig::default()
        });
        let app = app(Switch::new(Arc::clone(&router), |_, _| {}), Duration::from_millis(50));

        let (status, _) = post_json(app.clone(), "/udp/send", r#"{"wait": false, "request": [1]}"#).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = post_json(app, "/udp/broadcast", r#"{"wait": "10ms", "request": [1]}"#).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn connector_stops_on_close() {
        let connector = Arc::new(HttpConnector::new(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            BackoffPolicy::default(),
            Duration::from_secs(1),
        ));
        assert!(connector.tag().starts_with("http/127.0.0.1"));
        let run = tokio::spawn({
            let connector = Arc::clone(&connector);
            let switch = Switch::new(router(), |_, _| {});
            async move { connector.run(switch).await }
        });
        assert!(connector.local_addr().await.is_some());

        connector.close().await;
        run.await.unwrap().unwrap();
    }
}
