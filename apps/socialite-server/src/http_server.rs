use std::sync::Arc;

use axum::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{FromRequestParts, Path, State, WebSocketUpgrade};
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::future::{ready, Ready};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::json;
use socialite_presence::session::{drive_party_session, drive_status_session, Frame};
use socialite_presence::{PartyId, PresenceEngine, PresenceError, UserId};
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<PresenceEngine>,
    pub service_name: String,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/liveness", get(health))
        .route("/metrics", get(metrics))
        .route("/ws/status", get(status_ws))
        .route("/ws/party/:party_id", get(party_ws))
        .with_state(state)
}

/// Caller identity from `Authorization: Bearer <name>`; the login token is
/// the user name itself.
pub struct AuthUser(pub UserId);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let token = raw.strip_prefix("Bearer ").unwrap_or(raw);
        match UserId::parse(token) {
            Some(user) => Ok(AuthUser(user)),
            None => Err(message(StatusCode::UNAUTHORIZED, "unauthorized")),
        }
    }
}

fn message(status: StatusCode, text: &str) -> Response {
    (status, Json(json!({ "message": text }))).into_response()
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "service": state.service_name,
        "engine": state.engine.health(),
    }))
}

async fn status_ws(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let Some(ws) = ws else {
        return message(StatusCode::UPGRADE_REQUIRED, "websocket upgrade required");
    };
    ws.on_upgrade(move |socket| async move {
        let session = match state.engine.open_status_session(user.clone()).await {
            Ok(session) => session,
            Err(err) => {
                info!(user = %user, "status session refused: {err}");
                return;
            }
        };
        let (sink, stream) = socket.split();
        drive_status_session(&state.engine, session, frames(stream), texts(sink)).await;
    })
}

async fn party_ws(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(party_id): Path<String>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let Some(party) = PartyId::parse(&party_id) else {
        return message(StatusCode::BAD_REQUEST, "invalid party id");
    };
    let membership = match state.engine.authorize_party(&party, &user).await {
        Ok(membership) => membership,
        Err(PresenceError::NotPartyMember { party, user }) => {
            info!(party = %party, user = %user, "party session refused");
            return message(StatusCode::NOT_FOUND, "party membership not found");
        }
        Err(PresenceError::ShutDown) => {
            return message(StatusCode::SERVICE_UNAVAILABLE, "shutting down");
        }
        Err(err) => {
            error!("party membership check failed: {err}");
            return message(StatusCode::INTERNAL_SERVER_ERROR, "internal server error");
        }
    };
    let Some(ws) = ws else {
        return message(StatusCode::UPGRADE_REQUIRED, "websocket upgrade required");
    };
    ws.on_upgrade(move |socket| async move {
        let session = match state.engine.start_party_session(membership).await {
            Ok(session) => session,
            Err(err) => {
                info!(party = %party, user = %user, "party session not started: {err}");
                return;
            }
        };
        let (sink, stream) = socket.split();
        drive_party_session(&state.engine, session, frames(stream), texts(sink)).await;
    })
}

fn frame_from(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text),
        Message::Close(_) => Frame::Close,
        _ => Frame::Other,
    }
}

fn frames(
    stream: SplitStream<WebSocket>,
) -> impl Stream<Item = Result<Frame, axum::Error>> + Unpin {
    stream.map(|message| message.map(frame_from))
}

fn texts(
    sink: SplitSink<WebSocket, Message>,
) -> impl Sink<String, Error = axum::Error> + Unpin {
    sink.with(|text: String| -> Ready<Result<Message, axum::Error>> {
        ready(Ok(Message::Text(text)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http::Request;
    use socialite_presence::{MembershipStatus, PresenceConfig};
    use socialite_store::SqliteRelationshipStore;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let store = SqliteRelationshipStore::open_in_memory().unwrap();
        store
            .put_party_membership(
                &PartyId::parse("raid").unwrap(),
                &UserId::parse("alice").unwrap(),
                MembershipStatus::Active,
            )
            .unwrap();
        AppState {
            engine: Arc::new(
                PresenceEngine::start(PresenceConfig::default(), Arc::new(store)).unwrap(),
            ),
            service_name: "socialite-test".to_string(),
        }
    }

    async fn get(app: Router, uri: &str, token: Option<&str>) -> Response {
        let mut request = Request::builder().uri(uri);
        if let Some(token) = token {
            request = request.header("authorization", format!("Bearer {token}"));
        }
        app.oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_routes_report_ok() {
        let state = test_state();
        for uri in ["/health", "/liveness"] {
            let response = get(build_router(state.clone()), uri, None).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_json(response).await, json!({ "status": "ok" }));
        }
    }

    #[tokio::test]
    async fn metrics_include_engine_counters() {
        let response = get(build_router(test_state()), "/metrics", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["service"], "socialite-test");
        assert_eq!(body["engine"]["metrics"]["sessions_opened"], 0);
    }

    #[tokio::test]
    async fn sessions_require_a_token() {
        let state = test_state();
        let response = get(build_router(state.clone()), "/ws/status", None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = get(build_router(state), "/ws/party/raid", Some("  ")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn plain_request_to_status_route_needs_upgrade() {
        let response = get(build_router(test_state()), "/ws/status", Some("alice")).await;
        assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
    }

    #[tokio::test]
    async fn non_member_gets_not_found() {
        let response = get(build_router(test_state()), "/ws/party/raid", Some("mallory")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(response).await,
            json!({ "message": "party membership not found" })
        );
    }

    #[tokio::test]
    async fn member_passes_membership_check_before_upgrade() {
        let state = test_state();
        for _ in 0..3 {
            let response = get(build_router(state.clone()), "/ws/party/RAID", Some("Alice")).await;
            assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let metrics = state.engine.metrics_snapshot();
        assert_eq!(metrics.sessions_opened, 0);
        assert_eq!(metrics.events_processed, 0);
        assert!(!state
            .engine
            .status()
            .is_online(&UserId::parse("alice").unwrap()));
    }

    #[tokio::test]
    async fn party_route_refuses_after_shutdown() {
        let state = test_state();
        state.engine.shutdown().await;
        let response = get(build_router(state), "/ws/party/raid", Some("alice")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
