use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::{NaiveDate, Utc};
use portal_schedule_core::{Error, Provider, UserId, service::ScheduleService};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// 应用状态
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ScheduleService>,
}

/// 健康检查响应
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// 错误响应
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

#[derive(Deserialize)]
struct SubscribeBody {
    url: String,
}

#[derive(Deserialize)]
struct ProfileBody {
    grade: u8,
}

/// 课表请求参数
#[derive(Deserialize)]
struct ScheduleQuery {
    date: Option<String>, // 格式：YYYY-MM-DD，缺省为学校时区的今天
}

#[derive(Deserialize)]
struct ResolveQuery {
    remote: String,
}

#[derive(Deserialize)]
struct CreateAliasBody {
    provider: Provider,
    remote_class: String,
    native_class_id: String,
}

pub fn create_app(service: Arc<ScheduleService>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/templates", get(list_templates_handler))
        .route("/users/{user}/profile", put(put_profile_handler))
        .route("/users/{user}/schedule", get(get_schedule_handler))
        .route(
            "/users/{user}/feeds/{provider}",
            put(subscribe_handler).get(feed_status_handler),
        )
        .route(
            "/users/{user}/feeds/{provider}/refresh",
            post(refresh_handler),
        )
        .route("/aliases", post(create_alias_handler))
        .route("/aliases/{provider}/resolve", get(resolve_alias_handler))
        .with_state(AppState { service })
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

/// 根路径处理器
async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "Portal Schedule Service",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Calendar feed synchronization and merged daily schedules",
        "endpoints": {
            "health": "/health",
            "templates": "/templates",
            "profile": "/users/{user}/profile",
            "schedule": "/users/{user}/schedule?date=YYYY-MM-DD",
            "feed": "/users/{user}/feeds/{provider}",
            "refresh": "/users/{user}/feeds/{provider}/refresh",
            "aliases": "/aliases",
            "resolve": "/aliases/{provider}/resolve?remote=..."
        }
    }))
}

/// 健康检查处理器
async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn list_templates_handler(State(state): State<AppState>) -> impl IntoResponse {
    let templates = state.service.templates();
    let keys: Vec<_> = templates
        .keys()
        .into_iter()
        .map(|key| {
            serde_json::json!({
                "level": key.level,
                "rotationDay": key.rotation_day,
                "lateStart": key.late_start,
            })
        })
        .collect();
    Json(serde_json::json!({ "templates": keys }))
}

async fn put_profile_handler(
    Path(user): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<ProfileBody>,
) -> Result<impl IntoResponse, AppError> {
    let profile = state
        .service
        .set_profile(&UserId::new(user), body.grade)
        .await?;
    Ok(Json(profile))
}

async fn get_schedule_handler(
    Path(user): Path<String>,
    Query(params): Query<ScheduleQuery>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let date = match params.date {
        Some(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .map_err(|e| Error::Config(format!("Invalid date '{}': {}", raw, e)))?,
        None => Utc::now()
            .with_timezone(&state.service.config().timezone())
            .date_naive(),
    };

    let schedule = state
        .service
        .request_schedule(&UserId::new(user), date)
        .await?;
    Ok(Json(schedule))
}

async fn subscribe_handler(
    Path((user, provider)): Path<(String, String)>,
    State(state): State<AppState>,
    Json(body): Json<SubscribeBody>,
) -> Result<impl IntoResponse, AppError> {
    let provider: Provider = provider.parse()?;
    let url = state
        .service
        .subscribe(&UserId::new(user), provider, &body.url)
        .await?;
    Ok(Json(serde_json::json!({ "provider": provider, "url": url })))
}

async fn feed_status_handler(
    Path((user, provider)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let provider: Provider = provider.parse()?;
    let user = UserId::new(user);

    let feed = state
        .service
        .feed_state(&user, provider)
        .await?
        .ok_or_else(|| Error::NotSubscribed {
            user: user.to_string(),
            provider,
        })?;
    let snapshot = state.service.cached_feed(&user, provider).await?;

    Ok(Json(serde_json::json!({
        "feed": feed,
        "cachedEvents": snapshot.events.len(),
        "skipped": snapshot.skipped,
        "refreshedAt": snapshot.refreshed_at,
    })))
}

async fn refresh_handler(
    Path((user, provider)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let provider: Provider = provider.parse()?;
    let outcome = state
        .service
        .request_refresh(&UserId::new(user), provider)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "outcome": outcome })),
    ))
}

async fn resolve_alias_handler(
    Path(provider): Path<String>,
    Query(params): Query<ResolveQuery>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let provider: Provider = provider.parse()?;
    let identity = state
        .service
        .resolve_alias(provider, &params.remote)
        .await?;
    Ok(Json(identity))
}

async fn create_alias_handler(
    State(state): State<AppState>,
    Json(body): Json<CreateAliasBody>,
) -> Result<impl IntoResponse, AppError> {
    let id = state
        .service
        .create_alias(body.provider, &body.remote_class, &body.native_class_id)
        .await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))))
}

/// 应用错误类型
#[derive(Debug)]
struct AppError(Error);

impl AppError {
    fn status(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            Error::Config(_) | Error::InvalidFeedUrl { .. } | Error::InvalidRotationDay(_) => {
                (StatusCode::BAD_REQUEST, "invalid request")
            }
            Error::NotSubscribed { .. } | Error::ProfileMissing(_) => {
                (StatusCode::NOT_FOUND, "not found")
            }
            Error::DuplicateAlias { .. } => (StatusCode::CONFLICT, "duplicate alias"),
            Error::UnsupportedSchoolLevel(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "unsupported school level")
            }
            Error::QueueClosed => (StatusCode::SERVICE_UNAVAILABLE, "shutting down"),
            Error::Timeout => (StatusCode::GATEWAY_TIMEOUT, "request timeout"),
            err if err.is_feed_error() => (StatusCode::BAD_GATEWAY, "feed error"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal server error"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }

        let body = Json(ErrorResponse {
            error: error_message.to_string(),
            message: self.0.to_string(),
        });

        (status, body).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
