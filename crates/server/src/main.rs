use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use server_api::{list_messages, process_media, sync_channel, ApiContext, MediaPolicy};
use shared::{
    domain::ChannelId,
    error::{ApiError, ErrorCode},
    protocol::{ErrorBody, MessagesPage, ProcessMediaRequest, ProcessMediaResponse, SyncResponse},
};
use source::{FsBlobStore, HttpMessageSource};
use storage::Storage;
use tracing::{error, info};

mod config;

use config::{load_settings, normalize_database_url};

const DEFAULT_PAGE_LIMIT: u32 = 50;
const MAX_PAGE_LIMIT: u32 = 100;

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    /// Channel this deployment archives; sync routes fail until configured.
    target: Option<ChannelId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMessagesQuery {
    channel_id: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let settings = load_settings();
    let database_url = normalize_database_url(&settings.database_url);
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let target = settings
        .target_channel
        .as_deref()
        .map(ChannelId::parse)
        .transpose()
        .map_err(|error| anyhow::anyhow!("invalid target_channel: {error}"))?;

    let source = Arc::new(HttpMessageSource::new(
        &settings.source_url,
        settings.download_timeout(),
    )?);
    let blobs = Arc::new(FsBlobStore::new(&settings.blob_root));
    let api = ApiContext::new(storage, source, blobs).with_policy(MediaPolicy {
        approved_kinds: settings.approved_media_kinds.clone(),
        max_bytes: settings.max_media_bytes,
        download_timeout: settings.download_timeout(),
    });

    let state = AppState { api, target };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "archive server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sync", post(http_sync))
        .route("/process-media", post(http_process_media))
        .route("/messages", get(http_list_messages))
        .route("/media/*key", get(http_get_media))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    match state.api.storage.health_check().await {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(error) => {
            error!(%error, "health check failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable").into_response()
        }
    }
}

async fn http_sync(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SyncResponse>, (StatusCode, Json<ErrorBody>)> {
    let channel = target_channel(&state)?;
    sync_channel(&state.api, &channel)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn http_process_media(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ProcessMediaRequest>>,
) -> Result<Json<ProcessMediaResponse>, (StatusCode, Json<ErrorBody>)> {
    let channel = target_channel(&state)?;
    let batch = body.and_then(|Json(req)| req.batch);
    process_media(&state.api, &channel, batch)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<MessagesPage>, (StatusCode, Json<ErrorBody>)> {
    let channel = match query.channel_id.as_deref() {
        Some(raw) => ChannelId::parse(raw).map_err(|error| {
            error_response(ApiError::new(ErrorCode::Validation, error.to_string()))
        })?,
        None => target_channel(&state)?,
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_LIMIT)
        .clamp(1, MAX_PAGE_LIMIT);
    let offset = query.offset.unwrap_or(0);

    list_messages(&state.api, &channel, limit, offset)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn http_get_media(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Response, (StatusCode, Json<ErrorBody>)> {
    let blob = state.api.blobs.get(&key).await.map_err(|error| {
        error_response(ApiError::new(ErrorCode::Internal, error.to_string()))
    })?;

    match blob {
        Some((bytes, mime_type)) => Ok(([(header::CONTENT_TYPE, mime_type)], bytes).into_response()),
        None => Err(error_response(ApiError::new(
            ErrorCode::NotFound,
            format!("no media stored under key '{key}'"),
        ))),
    }
}

fn target_channel(state: &AppState) -> Result<ChannelId, (StatusCode, Json<ErrorBody>)> {
    state.target.clone().ok_or_else(|| {
        error_response(ApiError::new(
            ErrorCode::Validation,
            "no target channel configured",
        ))
    })
}

fn error_response(error: ApiError) -> (StatusCode, Json<ErrorBody>) {
    let status = match error.code {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::Credential => StatusCode::UNAUTHORIZED,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut body = ErrorBody::new(error.message);
    body.retry_after_seconds = error.retry_after_seconds;
    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body, body::Body, http::Request};
    use chrono::{TimeZone, Utc};
    use shared::domain::ExternalId;
    use source::{MemoryBlobStore, MemoryMessageSource, SourceError, SourceMedia, SourceMessage};
    use tower::ServiceExt;

    const CHANNEL: &str = "1001234567890";

    async fn test_app() -> (Router, Arc<MemoryMessageSource>, Arc<MemoryBlobStore>) {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let source = Arc::new(MemoryMessageSource::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let api = ApiContext::new(storage, source.clone(), blobs.clone());
        let state = AppState {
            api,
            target: Some(ChannelId::parse(CHANNEL).expect("channel")),
        };
        (build_router(Arc::new(state)), source, blobs)
    }

    fn photo_message(id: u64) -> SourceMessage {
        SourceMessage {
            id: ExternalId::from_u64(id),
            text: Some("with a photo".into()),
            date: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            group_id: None,
            media: Some(SourceMedia {
                kind: "photo".into(),
                file_type: "jpg".into(),
                mime_type: "image/jpeg".into(),
                size: 64,
            }),
        }
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn healthz_reports_ok_when_storage_is_ready() {
        let (app, _source, _blobs) = test_app().await;
        let request = Request::get("/healthz")
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn sync_route_reports_ingested_window_in_wire_casing() {
        let (app, source, _blobs) = test_app().await;
        let channel = ChannelId::parse(CHANNEL).expect("channel");
        source.push_message(&channel, photo_message(101)).await;

        let request = Request::post("/sync").body(Body::empty()).expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["synced"], 1);
        assert_eq!(json["media"], 1);
        assert_eq!(json["hasNewMessages"], true);
        assert_eq!(json["mode"], "forward");
        assert_eq!(json["messages"][0]["mediaStatus"], "pending");
    }

    #[tokio::test]
    async fn process_media_route_completes_backlog_and_serves_the_blob() {
        let (app, source, _blobs) = test_app().await;
        let channel = ChannelId::parse(CHANNEL).expect("channel");
        source.push_message(&channel, photo_message(101)).await;
        source
            .set_media_payload(&channel, &ExternalId::from_u64(101), vec![7; 64])
            .await;

        let sync = Request::post("/sync").body(Body::empty()).expect("request");
        app.clone().oneshot(sync).await.expect("response");

        let request = Request::post("/process-media")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::json!({ "batch": 3 }).to_string()))
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["remaining"], 0);
        assert_eq!(json["outcomes"][0]["status"], "completed");
        let key = json["outcomes"][0]["mediaKey"]
            .as_str()
            .expect("media key")
            .to_string();

        let request = Request::get(format!("/media/{key}"))
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some("image/jpeg")
        );
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        assert_eq!(bytes.len(), 64);
    }

    #[tokio::test]
    async fn messages_route_pages_with_camel_case_pagination() {
        let (app, source, _blobs) = test_app().await;
        let channel = ChannelId::parse(CHANNEL).expect("channel");
        for id in 1..=5u64 {
            let mut message = photo_message(id);
            message.media = None;
            source.push_message(&channel, message).await;
        }
        let sync = Request::post("/sync").body(Body::empty()).expect("request");
        app.clone().oneshot(sync).await.expect("response");

        let request = Request::get(format!("/messages?channelId={CHANNEL}&limit=2&offset=0"))
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json["pagination"]["total"], 5);
        assert_eq!(json["pagination"]["hasMore"], true);
        assert_eq!(json["messages"][0]["externalMessageId"], "5");
    }

    #[tokio::test]
    async fn provider_rate_limit_maps_to_429_with_retry_hint() {
        let (app, source, _blobs) = test_app().await;
        source
            .fail_next_with(SourceError::RateLimited {
                retry_after_seconds: 17,
            })
            .await;

        let request = Request::post("/sync").body(Body::empty()).expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let json = json_body(response).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["retryAfterSeconds"], 17);
    }

    #[tokio::test]
    async fn sync_without_target_channel_is_a_validation_error() {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let api = ApiContext::new(
            storage,
            Arc::new(MemoryMessageSource::new()),
            Arc::new(MemoryBlobStore::new()),
        );
        let app = build_router(Arc::new(AppState { api, target: None }));

        let request = Request::post("/sync").body(Body::empty()).expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_media_key_is_not_found() {
        let (app, _source, _blobs) = test_app().await;
        let request = Request::get("/media/channel/1/absent.jpg")
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
