use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use murmur_shared::constants::USER_ID_HEADER;
use murmur_shared::types::{ConversationId, UserId};
use murmur_store::Database;
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::delivery::DeliveryService;
use crate::directory::{Directory, Registration};
use crate::error::ServerError;
use crate::membership::{CreateGroup, FirstRemaining, LeaveOutcome, MembershipService};
use crate::presence::PresenceRegistry;
use crate::router::EventRouter;
use crate::ws::ws_handler;
use crate::SharedDb;

#[derive(Clone)]
pub struct AppState {
    pub db: SharedDb,
    pub presence: PresenceRegistry,
    pub router: EventRouter,
    pub delivery: DeliveryService,
    pub membership: MembershipService,
    pub directory: Directory,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Wire every service around one store handle and one presence registry.
    pub fn new(db: Database, config: ServerConfig) -> Self {
        let db: SharedDb = Arc::new(tokio::sync::Mutex::new(db));
        let presence = PresenceRegistry::new();
        let delivery = DeliveryService::new(db.clone(), presence.clone(), config.max_message_len);
        let router = EventRouter::new(db.clone(), presence.clone(), delivery.clone());
        let membership = MembershipService::new(
            db.clone(),
            presence.clone(),
            delivery.clone(),
            Arc::new(FirstRemaining),
            config.min_group_invitees,
        );
        let directory = Directory::new(db.clone(), router.clone());

        Self {
            db,
            presence,
            router,
            delivery,
            membership,
            directory,
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let origins = if state.config.allows_any_origin() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(
            state
                .config
                .allowed_origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok()),
        )
    };
    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    let api = Router::new()
        // Users and friendships
        .route("/user/register", post(register))
        .route("/user/profile", get(profile))
        .route("/user/all", get(all_users))
        .route("/user/friends", get(friends))
        .route("/user/friend-requests", get(friend_requests))
        .route("/user/friend-request/:receiver_id", post(send_friend_request))
        .route("/user/friend-request/accept/:request_id", put(accept_friend_request))
        .route("/user/friend-request/reject/:request_id", put(reject_friend_request))
        .route("/user/remove-friend/:friend_id", put(remove_friend))
        // Messages
        .route("/message/send/:receiver_id", post(send_message))
        .route("/message/seen/:sender_id", post(mark_seen))
        .route("/message/unread/all", get(unread))
        .route("/message/:other_id", get(history))
        // Conversations
        .route("/conversation/create-group", post(create_group))
        .route("/conversation/accept-invite/:group_id", put(accept_invite))
        .route("/conversation/reject-invite/:group_id", put(reject_invite))
        .route("/conversation/leave-group/:group_id", put(leave_group))
        .route("/conversation/add-member/:group_id", put(add_members))
        .route("/conversation/my-conversations", get(my_conversations))
        .route("/conversation/:id", get(conversation));

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .nest("/api/v1", api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ServerError>;

fn ok<T>(message: &'static str, data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse {
        success: true,
        message,
        data: Some(data),
    }))
}

fn done(message: &'static str) -> ApiResult<()> {
    Ok(Json(ApiResponse {
        success: true,
        message,
        data: None,
    }))
}

/// Resolve the caller from the identity header set by the auth layer.
async fn caller(headers: &HeaderMap, state: &AppState) -> Result<UserId, ServerError> {
    let user: UserId = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or(ServerError::Unauthorized)?;

    if !state.db.lock().await.user_exists(user)? {
        return Err(ServerError::NotFound("User not found".to_string()));
    }
    Ok(user)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    online_users: usize,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        online_users: state.presence.online_users().await.len(),
    })
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

async fn register(
    State(state): State<AppState>,
    Json(req): Json<Registration>,
) -> Result<(StatusCode, Json<ApiResponse<murmur_shared::models::User>>), ServerError> {
    let user = state.directory.register(req).await?;
    let Json(body) = ok("User registered successfully", user)?;
    Ok((StatusCode::CREATED, Json(body)))
}

async fn profile(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> ApiResult<murmur_shared::models::User> {
    let me = caller(&headers, &state).await?;
    ok("User profile fetched successfully", state.directory.profile(me).await?)
}

async fn all_users(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> ApiResult<Vec<murmur_shared::models::User>> {
    let me = caller(&headers, &state).await?;
    ok("All users fetched successfully", state.directory.all_users(me).await?)
}

async fn friends(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> ApiResult<Vec<murmur_shared::models::User>> {
    let me = caller(&headers, &state).await?;
    ok("Friends fetched successfully", state.directory.friends(me).await?)
}

async fn friend_requests(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> ApiResult<Vec<murmur_shared::protocol::FriendRequestNotice>> {
    let me = caller(&headers, &state).await?;
    ok(
        "Friend requests fetched successfully",
        state.directory.pending_requests(me).await?,
    )
}

async fn send_friend_request(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(receiver_id): Path<UserId>,
) -> ApiResult<murmur_shared::models::FriendRequest> {
    let me = caller(&headers, &state).await?;
    ok(
        "Friend request sent successfully",
        state.directory.send_friend_request(me, receiver_id).await?,
    )
}

async fn accept_friend_request(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
) -> ApiResult<()> {
    let me = caller(&headers, &state).await?;
    state.directory.accept_friend_request(me, request_id).await?;
    done("Friend request accepted successfully")
}

async fn reject_friend_request(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
) -> ApiResult<()> {
    let me = caller(&headers, &state).await?;
    state.directory.reject_friend_request(me, request_id).await?;
    done("Friend request rejected successfully")
}

async fn remove_friend(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(friend_id): Path<UserId>,
) -> ApiResult<()> {
    let me = caller(&headers, &state).await?;
    state.directory.remove_friend(me, friend_id).await?;
    done("Friend removed successfully")
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SendMessageRequest {
    #[serde(default)]
    message: String,
}

async fn send_message(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(receiver_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<murmur_shared::models::Message> {
    let me = caller(&headers, &state).await?;
    let message = state.delivery.send(me, receiver_id, &req.message).await?;
    ok("Message sent successfully", message)
}

async fn mark_seen(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(sender_id): Path<UserId>,
) -> ApiResult<()> {
    let me = caller(&headers, &state).await?;
    state.delivery.mark_seen(me, sender_id).await?;
    done("Messages marked as seen")
}

async fn unread(headers: HeaderMap, State(state): State<AppState>) -> ApiResult<Vec<UserId>> {
    let me = caller(&headers, &state).await?;
    ok(
        "Unread messages fetched successfully",
        state.delivery.unread_senders(me).await?,
    )
}

async fn history(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(other_id): Path<Uuid>,
) -> ApiResult<crate::delivery::History> {
    let me = caller(&headers, &state).await?;
    ok(
        "Messages fetched successfully",
        state.delivery.history(me, other_id).await?,
    )
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct AddMembersRequest {
    #[serde(default)]
    participants: Vec<UserId>,
}

async fn create_group(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<CreateGroup>,
) -> Result<(StatusCode, Json<ApiResponse<murmur_shared::models::Conversation>>), ServerError> {
    let me = caller(&headers, &state).await?;
    let group = state.membership.create_group(me, req).await?;
    let Json(body) = ok("Group created successfully. Invites sent.", group)?;
    Ok((StatusCode::CREATED, Json(body)))
}

async fn accept_invite(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(group_id): Path<ConversationId>,
) -> ApiResult<murmur_shared::models::Conversation> {
    let me = caller(&headers, &state).await?;
    ok(
        "Joined group successfully",
        state.membership.accept_invite(me, group_id).await?,
    )
}

async fn reject_invite(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(group_id): Path<ConversationId>,
) -> ApiResult<()> {
    let me = caller(&headers, &state).await?;
    state.membership.reject_invite(me, group_id).await?;
    done("Invite rejected")
}

async fn leave_group(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(group_id): Path<ConversationId>,
) -> ApiResult<()> {
    let me = caller(&headers, &state).await?;
    match state.membership.leave_group(me, group_id).await? {
        LeaveOutcome::Dissolved => done("Group deleted as last member left"),
        LeaveOutcome::Left { .. } => done("Left group successfully"),
    }
}

async fn add_members(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(group_id): Path<ConversationId>,
    Json(req): Json<AddMembersRequest>,
) -> ApiResult<murmur_shared::models::Conversation> {
    let me = caller(&headers, &state).await?;
    ok(
        "Members invited successfully",
        state
            .membership
            .add_members(me, group_id, &req.participants)
            .await?,
    )
}

async fn my_conversations(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> ApiResult<Vec<murmur_shared::models::Conversation>> {
    let me = caller(&headers, &state).await?;
    ok(
        "Conversations fetched successfully",
        state.membership.my_conversations(me).await?,
    )
}

async fn conversation(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<ConversationId>,
) -> ApiResult<murmur_shared::models::Conversation> {
    let me = caller(&headers, &state).await?;
    ok(
        "Conversation fetched successfully",
        state.membership.get_conversation(me, id).await?,
    )
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
