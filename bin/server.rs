// Doc Inc Core - Web Server
// REST API with Axum over the core services

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use doc_inc::config::LOG_ENV_VAR;
use doc_inc::{
    Account, AuditAction, AuditFilter, CoreConfig, CoreError, CoreServices, Database,
    IssuedStatement, LinkOutcome, LogEntry, LogTransport, NewStatement, NewUser, Notification,
    UnlinkOutcome, User,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Shared application state
#[derive(Clone)]
struct AppState {
    services: CoreServices,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    fn err(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

/// Core errors mapped onto HTTP status codes
struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Validation { .. } => StatusCode::BAD_REQUEST,
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            CoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "request failed");
            "internal storage error".to_string()
        } else {
            self.0.to_string()
        };

        (status, Json(ApiResponse::err(message))).into_response()
    }
}

type ApiResult<T> = Result<(StatusCode, Json<ApiResponse<T>>), ApiError>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok((StatusCode::OK, Json(ApiResponse::ok(data))))
}

fn created<T>(data: T) -> ApiResult<T> {
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(data))))
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Deserialize)]
struct RegisterAccountRequest {
    account_number: String,
    last4_ssn: String,
}

#[derive(Deserialize)]
struct LinkRequest {
    user_id: String,
    last4_ssn: String,
}

#[derive(Deserialize, Default)]
struct UnlinkRequest {
    user_id: Option<String>,
}

#[derive(Deserialize)]
struct AuditParams {
    action: Option<String>,
    account: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /api/accounts - Register an account
async fn register_account(
    State(state): State<AppState>,
    Json(req): Json<RegisterAccountRequest>,
) -> ApiResult<Account> {
    let account = state
        .services
        .accounts
        .register(&req.account_number, &req.last4_ssn)?;
    created(account)
}

/// POST /api/accounts/:account_number/link - Verify and link
async fn link_account(
    State(state): State<AppState>,
    Path(account_number): Path<String>,
    Json(req): Json<LinkRequest>,
) -> ApiResult<LinkOutcome> {
    let outcome = state
        .services
        .linking
        .link_account(&req.user_id, &account_number, &req.last4_ssn)
        .await?;
    ok(outcome)
}

/// POST /api/accounts/:account_number/unlink
async fn unlink_account(
    State(state): State<AppState>,
    Path(account_number): Path<String>,
    body: Option<Json<UnlinkRequest>>,
) -> ApiResult<UnlinkOutcome> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let outcome = state
        .services
        .linking
        .unlink_account(&account_number, req.user_id.as_deref())
        .await?;
    ok(outcome)
}

/// GET /api/audit?action=&account=&from=&to=
async fn query_audit(
    State(state): State<AppState>,
    Query(params): Query<AuditParams>,
) -> ApiResult<Vec<LogEntry>> {
    let mut filter = AuditFilter::new();
    if let Some(action) = params.action {
        filter = filter.action(action.parse::<AuditAction>()?);
    }
    if let Some(account) = params.account {
        filter = filter.account(account);
    }
    filter.from = params.from;
    filter.to = params.to;

    let entries = state.services.audit.query(filter).collect_all()?;
    ok(entries)
}

/// POST /api/users - Register a user
async fn register_user(
    State(state): State<AppState>,
    Json(req): Json<NewUser>,
) -> ApiResult<User> {
    // argon2 hashing and the sqlite write stay off the async workers
    let users = state.services.users.clone();
    let user = tokio::task::spawn_blocking(move || users.register(req))
        .await
        .map_err(|e| CoreError::Storage(format!("registration task failed: {}", e)))??;
    created(user)
}

/// POST /api/statements - Record a generated statement and notify its holder
async fn issue_statement(
    State(state): State<AppState>,
    Json(req): Json<NewStatement>,
) -> ApiResult<IssuedStatement> {
    let issued = state.services.issue_statement(req).await?;
    created(issued)
}

/// GET /api/users/:user_id/notifications
async fn user_notifications(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Vec<Notification>> {
    state.services.users.get(&user_id)?;
    let notifications = state.services.dispatcher.list_for_user(&user_id)?;
    ok(notifications)
}

/// POST /api/notifications/:notification_id/read
async fn mark_notification_read(
    State(state): State<AppState>,
    Path(notification_id): Path<String>,
) -> ApiResult<bool> {
    let read = state.services.dispatcher.mark_read(&notification_id)?;
    ok(read)
}

fn build_router(services: CoreServices) -> Router {
    let state = AppState { services };

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/accounts", post(register_account))
        .route("/accounts/:account_number/link", post(link_account))
        .route("/accounts/:account_number/unlink", post(unlink_account))
        .route("/audit", get(query_audit))
        .route("/statements", post(issue_statement))
        .route("/users", post(register_user))
        .route("/users/:user_id/notifications", get(user_notifications))
        .route(
            "/notifications/:notification_id/read",
            post(mark_notification_read),
        )
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1);
    let config = CoreConfig::load(config_path.as_deref())?;

    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let db = Database::open(&config.database_path)
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))?;
    info!(path = %config.database_path.display(), "database opened");

    let services = CoreServices::new(db, &config, Arc::new(LogTransport));
    services.seed(&config)?;

    let app = build_router(services);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, version = doc_inc::VERSION, "server running");

    axum::serve(listener, app)
        .await
        .context("Server terminated")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn test_app() -> (Router, CoreServices) {
        let services = CoreServices::new(
            Database::open_in_memory().unwrap(),
            &CoreConfig::for_test(),
            Arc::new(LogTransport),
        );
        (build_router(services.clone()), services)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(json) => request.body(Body::from(json.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn register_jsmith(app: &Router) -> String {
        let (status, body) = call(
            app,
            "POST",
            "/api/users",
            Some(json!({
                "username": "jsmith",
                "email": "jsmith@docincorp.com",
                "password": "SecurePass1"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["data"]["user_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = test_app();
        let (status, body) = call(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], "OK");
    }

    #[tokio::test]
    async fn test_link_flow_over_http() {
        let (app, _) = test_app();
        let user_id = register_jsmith(&app).await;

        let (status, body) = call(
            &app,
            "POST",
            "/api/accounts",
            Some(json!({"account_number": "ACC123", "last4_ssn": "6789"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["last4_ssn"], "****");

        let (status, body) = call(
            &app,
            "POST",
            "/api/accounts/ACC123/link",
            Some(json!({"user_id": user_id, "last4_ssn": "6789"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["state"], "LINKED");
        assert_eq!(body["data"]["notification"]["delivery"], "delivered");

        let (_, body) = call(&app, "GET", "/api/audit?account=ACC123", None).await;
        let actions: Vec<&str> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["action"].as_str().unwrap())
            .collect();
        assert_eq!(actions, vec!["VERIFY", "LINK"]);

        let (status, body) = call(&app, "POST", "/api/accounts/ACC123/unlink", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["unlinked"], true);

        let (_, body) = call(
            &app,
            "GET",
            &format!("/api/users/{}/notifications", user_id),
            None,
        )
        .await;
        assert_eq!(body["data"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let (app, _) = test_app();
        let user_id = register_jsmith(&app).await;

        let (status, body) = call(
            &app,
            "POST",
            "/api/accounts",
            Some(json!({"account_number": "ACC123", "last4_ssn": "67"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, _) = call(
            &app,
            "POST",
            "/api/accounts/ACC404/link",
            Some(json!({"user_id": user_id, "last4_ssn": "6789"})),
        )
        .await;
        // Unknown account fails verify, so the attempt is rejected
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(&app, "POST", "/api/accounts/ACC404/unlink", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, "POST", "/api/notifications/missing/read", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, "GET", "/api/audit?action=DELETE", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app,
            "POST",
            "/api/users",
            Some(json!({
                "username": "jsmith",
                "email": "other@docincorp.com",
                "password": "SecurePass1"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_registrations() {
        let (app, services) = test_app();
        let mut handles = Vec::new();
        for i in 0..4 {
            let app = app.clone();
            handles.push(tokio::spawn(async move {
                call(
                    &app,
                    "POST",
                    "/api/users",
                    Some(json!({
                        "username": format!("user{}", i),
                        "email": format!("user{}@docincorp.com", i),
                        "password": "SecurePass1"
                    })),
                )
                .await
            }));
        }
        for handle in handles {
            let (status, body) = handle.await.unwrap();
            assert_eq!(status, StatusCode::CREATED);
            let user_id = body["data"]["user_id"].as_str().unwrap();
            assert!(services.users.get(user_id).unwrap().is_active());
        }
    }

    #[tokio::test]
    async fn test_issue_statement_notifies_holder() {
        let (app, services) = test_app();
        let user_id = register_jsmith(&app).await;
        services.accounts.register("ACC123", "6789").unwrap();
        call(
            &app,
            "POST",
            "/api/accounts/ACC123/link",
            Some(json!({"user_id": user_id, "last4_ssn": "6789"})),
        )
        .await;

        let statement = json!({
            "statement_id": "ST-1",
            "account_number": "ACC123",
            "statement_date": "2025-01-31",
            "document_ref": "s3://statements/ST-1.pdf",
            "statement_type": "monthly"
        });
        let (status, body) = call(&app, "POST", "/api/statements", Some(statement.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["statement"]["statement_id"], "ST-1");
        assert_eq!(body["data"]["notification"]["user_id"], user_id.as_str());

        let (status, _) = call(&app, "POST", "/api/statements", Some(statement)).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_mark_read() {
        let (app, services) = test_app();
        let user_id = register_jsmith(&app).await;
        let n = services
            .dispatcher
            .send(&user_id, doc_inc::NotificationType::EmailChanged)
            .await
            .unwrap();

        let uri = format!("/api/notifications/{}/read", n.notification_id);
        let (status, body) = call(&app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], true);
        assert!(services.dispatcher.get(&n.notification_id).unwrap().read);
    }
}
