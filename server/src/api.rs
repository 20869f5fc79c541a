use crate::{auth, config::Config, files, ws};
use anyhow::{Context, Result};
use axum::{
    body::StreamBody,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chatline_core::model::{Chat, ChatKind, ChatSummary, EnrichedMessage, LinkPreview, User};
use chatline_core::{
    ChatError, ChatService, Dispatcher, LinkPreviewResolver, MessageService, ReactionService,
    RoomBroadcaster, Store,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio_util::io::ReaderStream;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub chats: ChatService,
    pub messages: MessageService,
    pub previews: Option<Arc<LinkPreviewResolver>>,
    pub dispatcher: Dispatcher,
    pub file_dir: PathBuf,
    pub config: Config,
    pub login_limiter: auth::LoginRateLimiter,
}

impl AppState {
    /// Open the database under the configured data dir and wire up services.
    pub async fn new(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("cannot create {}", config.data_dir.display()))?;
        let store = Store::open(config.db_path()).context("cannot open database")?;
        Self::with_store(config, store).await
    }

    pub async fn with_store(config: Config, store: Store) -> Result<Self> {
        let file_dir = config.file_dir();
        tokio::fs::create_dir_all(&file_dir).await?;
        let previews = if config.preview_enabled {
            Some(Arc::new(LinkPreviewResolver::new(config.preview_timeout)?))
        } else {
            None
        };
        let messages = MessageService::new(store.clone(), previews.clone());
        let dispatcher = Dispatcher::new(
            messages.clone(),
            ReactionService::new(store.clone()),
            RoomBroadcaster::new(),
        );
        Ok(Self {
            chats: ChatService::new(store.clone()),
            store,
            messages,
            previews,
            dispatcher,
            file_dir,
            config,
            login_limiter: auth::LoginRateLimiter::default(),
        })
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes() as usize;
    Router::new()
        .route("/api/health", get(health))
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/users", get(list_users))
        .route("/chats", post(create_chat))
        .route("/chats/:user_id", get(list_chats))
        .route("/messages/:chat_id", get(list_messages))
        .route("/mark-read/:chat_id/:user_id", post(mark_read))
        .route("/upload", post(upload_file))
        .route("/upload-base64", post(upload_base64))
        .route("/uploads/:file_ref", get(download_file))
        .route("/preview", post(preview))
        .route("/ws", get(ws::ws_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// JSON error body `{"kind": ..., "error": ...}` with a status per kind.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_argument", message)
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        error!(error = %err, "request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", "internal error")
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        let status = match err {
            ChatError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Conflict(_) => StatusCode::CONFLICT,
            ChatError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            ChatError::Storage(_) | ChatError::Pool(_) | ChatError::Encoding(_) => {
                return Self::internal(err)
            }
        };
        Self::new(status, err.kind(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "kind": self.kind, "error": self.message })),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

async fn health() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct Credentials {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Serialize)]
struct AuthResp {
    user_id: i64,
    username: String,
}

impl From<User> for AuthResp {
    fn from(user: User) -> Self {
        Self {
            user_id: user.id,
            username: user.username,
        }
    }
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<Credentials>,
) -> ApiResult<(StatusCode, Json<AuthResp>)> {
    let username = req.username.trim();
    if username.is_empty() || req.password.is_empty() {
        return Err(ApiError::bad_request("username and password are required"));
    }
    let hash = auth::hash_passphrase(&req.password).map_err(ApiError::internal)?;
    let user = state.store.create_user(username, &hash)?;
    info!(user_id = user.id, username = %user.username, "user registered");
    Ok((StatusCode::CREATED, Json(user.into())))
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<Credentials>,
) -> ApiResult<Json<AuthResp>> {
    let username = req.username.trim();
    if !state.login_limiter.check(username).await {
        return Err(ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "too many login attempts, try again later",
        ));
    }
    match state.store.find_credentials(username)? {
        Some((user, hash)) if auth::verify_passphrase(&req.password, &hash) => {
            info!(user_id = user.id, "login");
            Ok(Json(user.into()))
        }
        _ => Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "invalid credentials",
        )),
    }
}

async fn list_users(State(state): State<AppState>) -> ApiResult<Json<Vec<User>>> {
    Ok(Json(state.store.list_users()?))
}

#[derive(Deserialize)]
struct CreateChatReq {
    #[serde(rename = "type")]
    kind: ChatKind,
    members: Vec<i64>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Serialize)]
struct CreateChatResp {
    chat_id: i64,
    chat: Chat,
}

async fn create_chat(
    State(state): State<AppState>,
    Json(req): Json<CreateChatReq>,
) -> ApiResult<(StatusCode, Json<CreateChatResp>)> {
    let (chat, created) =
        state
            .chats
            .create_or_get_chat(req.kind, &req.members, req.name.as_deref())?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(CreateChatResp {
            chat_id: chat.id,
            chat,
        }),
    ))
}

async fn list_chats(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> ApiResult<Json<Vec<ChatSummary>>> {
    Ok(Json(state.chats.list_chats_for_user(user_id)?))
}

async fn list_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<i64>,
) -> ApiResult<Json<Vec<EnrichedMessage>>> {
    Ok(Json(state.messages.list_messages(chat_id)?))
}

#[derive(Deserialize)]
struct MarkReadReq {
    #[serde(default)]
    up_to: Option<i64>,
}

async fn mark_read(
    State(state): State<AppState>,
    Path((chat_id, user_id)): Path<(i64, i64)>,
    body: Option<Json<MarkReadReq>>,
) -> ApiResult<Json<serde_json::Value>> {
    let up_to = body.and_then(|Json(req)| req.up_to);
    let last_read = state.chats.mark_read(chat_id, user_id, up_to)?;
    Ok(Json(
        json!({ "success": true, "last_read_message_id": last_read }),
    ))
}

#[derive(Serialize)]
struct UploadResp {
    file_path: String,
}

async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadResp>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let name = field.file_name().unwrap_or("upload").to_owned();
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
        return store_upload(&state, data, &name).await;
    }
    Err(ApiError::bad_request("missing multipart field `file`"))
}

#[derive(Deserialize)]
struct Base64Upload {
    #[serde(default)]
    data: String,
}

/// Accepts raw base64 or a `data:<mime>;base64,` URL and stores it as PNG.
async fn upload_base64(
    State(state): State<AppState>,
    Json(req): Json<Base64Upload>,
) -> ApiResult<Json<UploadResp>> {
    let payload = match req.data.split_once("base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => req.data.as_str(),
    };
    let data = STANDARD
        .decode(payload.trim())
        .map_err(|_| ApiError::bad_request("data is not valid base64"))?;
    store_upload(&state, Bytes::from(data), "upload.png").await
}

async fn store_upload(state: &AppState, data: Bytes, name: &str) -> ApiResult<Json<UploadResp>> {
    if data.is_empty() {
        return Err(ApiError::bad_request("empty upload"));
    }
    let size = data.len();
    let file_path = files::save_file(&state.file_dir, data, name)
        .await
        .map_err(ApiError::internal)?;
    info!(file_ref = %file_path, size, "upload stored");
    Ok(Json(UploadResp { file_path }))
}

async fn download_file(
    State(state): State<AppState>,
    Path(file_ref): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let path = files::file_path(&state.file_dir, &file_ref).ok_or(ChatError::NotFound("file"))?;
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|_| ChatError::NotFound("file"))?;
    let mime = mime_guess::from_path(&file_ref).first_or_octet_stream();
    let body = StreamBody::new(ReaderStream::new(file));
    Ok(([(header::CONTENT_TYPE, mime.to_string())], body))
}

#[derive(Deserialize)]
struct PreviewReq {
    #[serde(default)]
    url: Option<String>,
}

async fn preview(
    State(state): State<AppState>,
    Json(req): Json<PreviewReq>,
) -> ApiResult<Json<LinkPreview>> {
    let url = req
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ApiError::bad_request("url is required"))?;
    let resolver = state
        .previews
        .as_ref()
        .ok_or_else(|| ChatError::UpstreamUnavailable("link previews are disabled".into()))?;
    match resolver.resolve(url).await {
        Some(preview) => Ok(Json(preview)),
        None => Err(ChatError::UpstreamUnavailable(format!("could not fetch {url}")).into()),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

/// Run the HTTP server on the configured bind address.
pub async fn run_http_server(config: Config) -> Result<()> {
    let addr: SocketAddr = config
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind))?;
    let state = AppState::new(config).await?;
    info!(%addr, data_dir = %state.config.data_dir.display(), "chatline listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
