use std::sync::Arc;
use std::time::Instant;

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, HeaderMap, Method, StatusCode},
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use parley_shared::constants::PROTOCOL_VERSION;
use parley_shared::protocol::{ChatMessage, SendIntent, SendTarget};
use parley_shared::types::{ConversationId, FileRef, MessageId, MessageKind, UserId};
use parley_shared::ChatError;
use parley_store::{
    ContentFlag, Conversation, ConversationSummary, NewUser, StoreError, StoreHandle, User,
};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::presence::PresenceInfo;
use crate::rate_limit::{rate_limit_middleware, RateLimiter, UserRateLimiter};
use crate::router::ConversationRouter;
use crate::ws::ws_handler;

/// Header carrying the acting user on REST calls.
pub const USER_HEADER: &str = "x-user-id";

const MAX_USERNAME_LEN: usize = 32;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<ConversationRouter>,
    pub store: StoreHandle,
    pub rate_limiter: RateLimiter,
    pub user_limiter: UserRateLimiter,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/ws", get(ws_handler))
        .route("/users", post(create_user).get(search_users))
        .route("/users/:id", get(get_user))
        .route("/users/:id/block", post(block_user).delete(unblock_user))
        .route("/conversations", get(list_conversations))
        .route("/conversations/direct", post(open_direct))
        .route("/conversations/group", post(create_group))
        .route(
            "/conversations/:id/messages",
            get(load_history).post(send_message),
        )
        .route("/conversations/:id/unread", get(unread_count))
        .route("/messages/:id/read", post(mark_read))
        .route("/messages/:id", delete(delete_message))
        .route("/admin/status", get(admin_status))
        .route("/admin/flags", get(admin_flags))
        .route("/admin/flags/:id/review", post(admin_review_flag))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The user on whose behalf a REST call acts, from `X-User-Id`.
pub struct ActingUser(pub UserId);

#[async_trait]
impl<S> FromRequestParts<S> for ActingUser
where
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<UserId>().ok())
            .map(ActingUser)
            .ok_or(ServerError::Unauthenticated)
    }
}

// ─── Responses and bodies ───

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    protocol: &'static str,
    online_users: usize,
}

#[derive(Serialize)]
struct AdminStatusResponse {
    name: String,
    uptime_secs: u64,
    online_users: usize,
    connections: Vec<PresenceInfo>,
    moderation_enabled: bool,
}

#[derive(Deserialize)]
struct CreateUserRequest {
    username: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
    #[serde(default)]
    limit: Option<u32>,
}

#[derive(Deserialize)]
struct DirectRequest {
    user_id: UserId,
}

#[derive(Deserialize)]
struct GroupRequest {
    name: String,
    #[serde(default)]
    members: Vec<UserId>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    limit: Option<u32>,
    #[serde(default)]
    before: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct SendRequest {
    #[serde(default)]
    content: String,
    #[serde(default)]
    kind: MessageKind,
    #[serde(default)]
    file: Option<FileRef>,
    #[serde(default)]
    client_ref: Option<String>,
}

#[derive(Serialize)]
struct UnreadResponse {
    conversation_id: ConversationId,
    unread: u64,
}

#[derive(Deserialize)]
struct FlagsQuery {
    #[serde(default)]
    all: bool,
    #[serde(default)]
    limit: Option<u32>,
}

// ─── Public endpoints ───

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
        online_users: state.router.presence().len(),
    })
}

// ─── Users ───

async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<User>), ServerError> {
    let username = req.username.trim().to_string();
    if username.is_empty()
        || username.len() > MAX_USERNAME_LEN
        || username.chars().any(char::is_whitespace)
    {
        return Err(ServerError::BadRequest(format!(
            "username must be 1 to {MAX_USERNAME_LEN} characters without spaces"
        )));
    }
    let display_name = req
        .display_name
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| username.clone());

    let mut new = NewUser::new(username, display_name);
    new.avatar_url = req.avatar_url;

    let user = state.store.run(move |db| db.create_user(&new)).await?;
    info!(user = %user.id, username = %user.username, "user registered");
    Ok((StatusCode::CREATED, Json(user)))
}

async fn search_users(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<User>>, ServerError> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let mut users = state
        .store
        .run(move |db| db.search_users(&query.q, limit))
        .await?;
    for user in &mut users {
        user.is_online = state.router.presence().is_online(user.id);
    }
    Ok(Json(users))
}

async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<User>, ServerError> {
    let id = parse_user_id(&id)?;
    let mut user = state
        .store
        .run(move |db| db.find_user(id))
        .await?
        .ok_or_else(|| ChatError::NotFound(format!("user {id}")))?;
    // The registry is authoritative while the process is up.
    user.is_online = state.router.presence().is_online(user.id);
    Ok(Json(user))
}

async fn block_user(
    State(state): State<AppState>,
    ActingUser(me): ActingUser,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let target = parse_user_id(&id)?;
    let blocked = state
        .store
        .run(move |db| -> Result<bool, ServerError> {
            if db.find_user(target)?.is_none() {
                return Err(ChatError::NotFound(format!("user {target}")).into());
            }
            Ok(db.block_user(me, target)?)
        })
        .await?;
    info!(blocker = %me, blocked = %target, "user blocked");
    Ok(Json(serde_json::json!({ "blocked": blocked })))
}

async fn unblock_user(
    State(state): State<AppState>,
    ActingUser(me): ActingUser,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let target = parse_user_id(&id)?;
    let removed = state
        .store
        .run(move |db| db.unblock_user(me, target))
        .await?;
    Ok(Json(serde_json::json!({ "unblocked": removed })))
}

// ─── Conversations ───

async fn list_conversations(
    State(state): State<AppState>,
    ActingUser(me): ActingUser,
) -> Result<Json<Vec<ConversationSummary>>, ServerError> {
    Ok(Json(state.router.list_conversations(me).await?))
}

async fn open_direct(
    State(state): State<AppState>,
    ActingUser(me): ActingUser,
    Json(req): Json<DirectRequest>,
) -> Result<Json<Conversation>, ServerError> {
    Ok(Json(state.router.open_direct(me, req.user_id).await?))
}

async fn create_group(
    State(state): State<AppState>,
    ActingUser(me): ActingUser,
    Json(req): Json<GroupRequest>,
) -> Result<(StatusCode, Json<Conversation>), ServerError> {
    let conversation = state.router.create_group(me, req.name, req.members).await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn load_history(
    State(state): State<AppState>,
    ActingUser(me): ActingUser,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ChatMessage>>, ServerError> {
    let id = ConversationId::parse(&id)?;
    let page = state
        .router
        .load_history(&id, me, query.limit, query.before)
        .await?;
    Ok(Json(page))
}

async fn send_message(
    State(state): State<AppState>,
    ActingUser(me): ActingUser,
    Path(id): Path<String>,
    Json(req): Json<SendRequest>,
) -> Result<(StatusCode, Json<ChatMessage>), ServerError> {
    let id = ConversationId::parse(&id)?;
    if !state.user_limiter.check(me).await {
        tracing::warn!(user = %me, "send rate limit exceeded");
        return Err(ServerError::RateLimited);
    }
    let message = state
        .router
        .send_message(SendIntent {
            sender_id: me,
            target: SendTarget::Conversation(id),
            content: req.content,
            kind: req.kind,
            file: req.file,
            client_ref: req.client_ref,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn unread_count(
    State(state): State<AppState>,
    ActingUser(me): ActingUser,
    Path(id): Path<String>,
) -> Result<Json<UnreadResponse>, ServerError> {
    let id = ConversationId::parse(&id)?;
    let unread = state.router.unread_count(&id, me).await?;
    Ok(Json(UnreadResponse {
        conversation_id: id,
        unread,
    }))
}

// ─── Messages ───

async fn mark_read(
    State(state): State<AppState>,
    ActingUser(me): ActingUser,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let id = parse_message_id(&id)?;
    let updated = state.router.mark_read(id, me).await?;
    Ok(Json(serde_json::json!({ "updated": updated })))
}

async fn delete_message(
    State(state): State<AppState>,
    ActingUser(me): ActingUser,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let id = parse_message_id(&id)?;
    state.router.delete_message(id, me).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

// ─── Admin ───

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

async fn admin_status(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AdminStatusResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let presence = state.router.presence();
    Ok(Json(AdminStatusResponse {
        name: state.config.instance_name.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        online_users: presence.len(),
        connections: presence.snapshot(),
        moderation_enabled: state.config.keyword_filter().is_some(),
    }))
}

async fn admin_flags(
    headers: HeaderMap,
    State(state): State<AppState>,
    Query(query): Query<FlagsQuery>,
) -> Result<Json<Vec<ContentFlag>>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let limit = query.limit.unwrap_or(100).clamp(1, 500);
    let flags = state
        .store
        .run(move |db| db.list_flags(!query.all, limit))
        .await?;
    Ok(Json(flags))
}

async fn admin_review_flag(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    if !state.store.run(move |db| db.mark_flag_reviewed(id)).await? {
        return Err(StoreError::NotFound.into());
    }
    info!(flag = %id, "Admin reviewed content flag");
    Ok(Json(serde_json::json!({ "reviewed": true })))
}

fn parse_user_id(raw: &str) -> Result<UserId, ServerError> {
    raw.parse::<UserId>()
        .map_err(|_| ServerError::BadRequest(format!("invalid user id '{raw}'")))
}

fn parse_message_id(raw: &str) -> Result<MessageId, ServerError> {
    raw.parse::<MessageId>()
        .map_err(|_| ServerError::BadRequest(format!("invalid message id '{raw}'")))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
