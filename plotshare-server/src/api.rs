//! HTTP surface over [`PlotShareService`](crate::PlotShareService).
//!
//! Identity is asserted by the fronting gateway in the `X-Actor-Id` header.
//! When an API token is configured, every call except `/health` must also
//! carry `Authorization: Bearer <token>`.

use std::sync::Arc;

use axum::{
    async_trait,
    extract::{
        rejection::{JsonRejection, PathRejection},
        FromRequest, FromRequestParts, Path, Request, State,
    },
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream, StreamExt};
use plotshare_core::{ChatMessage, RequestId, RequestStatus, Space, SpaceId, SpaceRequest, UserId};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::chat::{Subscription, SubscriptionError};
use crate::error::{ErrorKind, ServiceError};
use crate::lifecycle::TransitionOutcome;
use crate::service::{OpenChannel, PendingCount};
use crate::AppState;

/// Header carrying the caller's identity.
pub const ACTOR_HEADER: &str = "x-actor-id";

/// An error response: `{ "error": <kind>, "message": <short text> }`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    message: String,
}

impl ApiError {
    fn unauthenticated(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            error: "unauthenticated",
            message: message.into(),
        }
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
        ErrorKind::InvalidTransition | ErrorKind::SpaceOccupied | ErrorKind::DuplicateRequest => {
            StatusCode::CONFLICT
        }
        ErrorKind::EmptyMessage | ErrorKind::InvalidInput => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::PersistenceFailure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let kind = err.kind();
        if kind == ErrorKind::PersistenceFailure {
            error!("Storage failure while serving request: {}", err);
        } else {
            debug!("Refused: {}", err);
        }
        Self {
            status: status_for(kind),
            error: kind.as_str(),
            message: kind.user_message().to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        debug!("Rejected request body: {}", rejection.body_text());
        Self {
            status: rejection.status(),
            error: ErrorKind::InvalidInput.as_str(),
            message: rejection.body_text(),
        }
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        debug!("Rejected request path: {}", rejection.body_text());
        Self {
            status: rejection.status(),
            error: ErrorKind::InvalidInput.as_str(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "error": self.error,
                "message": self.message,
            })),
        )
            .into_response()
    }
}

/// Validate the authorization header against the configured API token.
///
/// With no token configured the check is skipped.
fn validate_auth(headers: &HeaderMap, auth_token: &Option<String>) -> Result<(), ApiError> {
    let Some(expected_token) = auth_token else {
        return Ok(());
    };

    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match auth_header {
        Some(value) if value.starts_with("Bearer ") => {
            let provided_token = &value[7..];
            if provided_token == expected_token {
                Ok(())
            } else {
                Err(ApiError::unauthenticated("Invalid token"))
            }
        }
        Some(_) => Err(ApiError::unauthenticated(
            "Invalid Authorization header format. Expected: Bearer <token>",
        )),
        None => Err(ApiError::unauthenticated(
            "Missing Authorization header. Expected: Bearer <token>",
        )),
    }
}

fn actor_from_headers(headers: &HeaderMap) -> Result<UserId, ApiError> {
    let value = headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::unauthenticated("Missing X-Actor-Id header"))?;

    let actor = UserId::from(value);
    if actor.is_reserved() {
        return Err(ApiError::unauthenticated("Reserved actor id"));
    }
    Ok(actor)
}

/// `Json` whose rejection uses the API error shape.
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

/// `Path` whose rejection uses the API error shape.
pub struct PathParam<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for PathParam<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

/// The authenticated caller of an API route.
pub struct Caller(pub UserId);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        validate_auth(&parts.headers, &state.api_auth_token)?;
        actor_from_headers(&parts.headers).map(Caller)
    }
}

#[derive(Debug, Deserialize)]
pub struct NewSpaceBody {
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct NewRequestBody {
    pub space_id: SpaceId,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransitionBody {
    pub status: RequestStatus,
}

#[derive(Debug, Deserialize)]
pub struct PostMessageBody {
    pub body: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/spaces", post(register_space))
        .route("/spaces/:id/occupancy", get(space_occupancy))
        .route("/spaces/:id/requests", get(space_requests))
        .route("/requests", post(create_request))
        .route("/requests/:id", get(get_request))
        .route("/requests/:id/transition", post(transition_request))
        .route(
            "/requests/:id/messages",
            get(list_messages).post(post_message),
        )
        .route("/requests/:id/stream", get(stream_messages))
        .route("/me/requests", get(my_requests))
        .route("/me/spaces", get(my_spaces))
        .with_state(state)
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "plotshare",
        "version": crate::get_service_version(),
    }))
}

async fn register_space(
    State(state): State<Arc<AppState>>,
    Caller(actor): Caller,
    JsonBody(body): JsonBody<NewSpaceBody>,
) -> Result<(StatusCode, Json<Space>), ApiError> {
    let space = state.service.register_space(&actor, &body.title).await?;
    Ok((StatusCode::CREATED, Json(space)))
}

async fn space_occupancy(
    State(state): State<Arc<AppState>>,
    Caller(_actor): Caller,
    PathParam(space_id): PathParam<SpaceId>,
) -> Result<Json<Value>, ApiError> {
    let occupied = state.service.is_space_occupied(&space_id).await?;
    Ok(Json(json!({ "space_id": space_id, "occupied": occupied })))
}

async fn space_requests(
    State(state): State<Arc<AppState>>,
    Caller(actor): Caller,
    PathParam(space_id): PathParam<SpaceId>,
) -> Result<Json<Vec<SpaceRequest>>, ApiError> {
    Ok(Json(
        state.service.requests_for_space(&actor, &space_id).await?,
    ))
}

async fn create_request(
    State(state): State<Arc<AppState>>,
    Caller(actor): Caller,
    JsonBody(body): JsonBody<NewRequestBody>,
) -> Result<(StatusCode, Json<SpaceRequest>), ApiError> {
    let request = state
        .service
        .create_request(&actor, &body.space_id, body.message.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn get_request(
    State(state): State<Arc<AppState>>,
    Caller(actor): Caller,
    PathParam(request_id): PathParam<RequestId>,
) -> Result<Json<SpaceRequest>, ApiError> {
    Ok(Json(state.service.get_request(&actor, &request_id).await?))
}

async fn transition_request(
    State(state): State<Arc<AppState>>,
    Caller(actor): Caller,
    PathParam(request_id): PathParam<RequestId>,
    JsonBody(body): JsonBody<TransitionBody>,
) -> Result<Json<TransitionOutcome>, ApiError> {
    Ok(Json(
        state
            .service
            .request_transition(&actor, &request_id, body.status)
            .await?,
    ))
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    Caller(actor): Caller,
    PathParam(request_id): PathParam<RequestId>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    Ok(Json(state.service.history(&actor, &request_id).await?))
}

async fn post_message(
    State(state): State<Arc<AppState>>,
    Caller(actor): Caller,
    PathParam(request_id): PathParam<RequestId>,
    JsonBody(body): JsonBody<PostMessageBody>,
) -> Result<(StatusCode, Json<ChatMessage>), ApiError> {
    let message = state
        .service
        .send_message(&actor, &request_id, &body.body)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

fn message_event(message: &ChatMessage) -> Result<Event, axum::Error> {
    Event::default()
        .event("message")
        .id(message.seq.to_string())
        .json_data(message)
}

/// Live half of a channel stream. Ends when the channel closes; a lagging
/// subscriber gets one `lagged` event and then the end of the stream.
fn live_events(live: Subscription) -> impl Stream<Item = Result<Event, axum::Error>> {
    stream::unfold(Some(live), |state| async move {
        let mut live = state?;
        match live.recv().await {
            Ok(Some(message)) => Some((message_event(&message), Some(live))),
            Ok(None) => {
                debug!("Chat stream for request {} ended", live.request_id());
                None
            }
            Err(SubscriptionError::Lagged { missed }) => {
                info!(
                    "Chat stream for request {} lagged by {} messages",
                    live.request_id(),
                    missed
                );
                let event = Event::default()
                    .event("lagged")
                    .data(json!({ "missed": missed }).to_string());
                Some((Ok(event), None))
            }
        }
    })
}

async fn stream_messages(
    State(state): State<Arc<AppState>>,
    Caller(actor): Caller,
    PathParam(request_id): PathParam<RequestId>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let OpenChannel { history, live } = state.service.open_channel(&actor, &request_id).await?;
    let replay = stream::iter(history.into_iter().map(|message| message_event(&message)));
    Ok(Sse::new(replay.chain(live_events(live))).keep_alive(KeepAlive::default()))
}

async fn my_requests(
    State(state): State<Arc<AppState>>,
    Caller(actor): Caller,
) -> Result<Json<Vec<SpaceRequest>>, ApiError> {
    Ok(Json(state.service.requests_for_gardener(&actor).await?))
}

async fn my_spaces(
    State(state): State<Arc<AppState>>,
    Caller(actor): Caller,
) -> Result<Json<Vec<PendingCount>>, ApiError> {
    Ok(Json(state.service.pending_request_counts(&actor).await?))
}
