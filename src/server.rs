//! HTTP server with shared-mailbox operation handlers
//!
//! Registers the five mailbox routes behind the API-key middleware plus the
//! public `/` and `/health` routes. Handlers validate input, compose a
//! [`ScriptPlan`], hand it to the [`ScriptExecutor`], and shape the
//! [`ExecutionResult`] into a JSON response.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::rejection::{BytesRejection, JsonRejection, QueryRejection};
use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use regex::Regex;
use secrecy::ExposeSecret;
use serde_json::{Value, json};
use subtle::ConstantTimeEq;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::errors::{AppError, AppResult};
use crate::executor::{ExchangeExecutor, ScriptExecutor};
use crate::models::{
    AddMembersInput, CreateMailboxInput, DeleteMailboxInput, ExecutionResult, MailboxQuery, Meta,
    RemoveMembersInput,
};
use crate::script::{NewMailbox, PermissionSet, ScriptPlan};

/// Maximum request body size (64KB)
pub const MAX_BODY_SIZE: usize = 65_536;
/// Maximum length of any identity-like field
const MAX_IDENTITY_LEN: usize = 256;

const SERVICE_NAME: &str = "Exchange Online Shared Mailbox API";
const UNAUTHORIZED_MESSAGE: &str = "Unauthorized. Provide valid X-API-Key header.";

/// Shared state for all handlers
///
/// Configuration is read-only after start-up; the executor owns the
/// concurrency bound for subprocesses.
#[derive(Clone)]
pub struct AppState {
    config: Arc<ServerConfig>,
    executor: Arc<dyn ScriptExecutor>,
}

impl AppState {
    pub fn new(config: ServerConfig, executor: Arc<dyn ScriptExecutor>) -> Self {
        Self {
            config: Arc::new(config),
            executor,
        }
    }

    /// Render and execute a plan, logging the outcome
    async fn run(&self, plan: ScriptPlan) -> ExecutionResult {
        let operation = plan.operation();
        let statements = plan.statements().len();
        let changes = plan.permission_changes().count();
        let request = plan.into_request();
        let mailbox = request.mailbox.clone();
        tracing::info!(%operation, %mailbox, statements, changes, "executing mailbox operation");

        let result = self.executor.run(request).await;
        if result.success {
            tracing::info!(%operation, %mailbox, "mailbox operation completed");
        } else {
            tracing::warn!(
                %operation,
                %mailbox,
                error = result.error.as_deref().unwrap_or_default(),
                "mailbox operation failed"
            );
        }
        result
    }
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/shared-mailbox/create", post(create_mailbox))
        .route("/api/shared-mailbox/add-members", post(add_members))
        .route("/api/shared-mailbox/remove-members", post(remove_members))
        .route("/api/shared-mailbox/permissions", get(list_permissions))
        .route("/api/shared-mailbox", delete(delete_mailbox))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/", get(service_info))
        .route("/health", get(health))
        .merge(api)
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(middleware::map_response(json_error_envelope))
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until Ctrl-C / SIGTERM
///
/// # Errors
///
/// Returns `Internal` if the listener cannot be bound or the server fails.
pub async fn serve(config: ServerConfig) -> AppResult<()> {
    let addr = SocketAddr::new(config.bind, config.port);
    let executor: Arc<dyn ScriptExecutor> = Arc::new(ExchangeExecutor::from_config(&config));
    tracing::info!(
        %addr,
        organization = %config.exchange.organization,
        tenant = config.exchange.tenant_id.as_deref().unwrap_or("-"),
        interpreter = %config.execution.interpreter,
        timeout_ms = config.execution.timeout.as_millis() as u64,
        max_concurrent = config.execution.max_concurrent,
        "starting shared mailbox API"
    );
    let app = router(AppState::new(config, executor));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::Internal(format!("failed to bind {addr}: {e}")))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| AppError::Internal(format!("server error: {e}")))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

/// Reject requests without the shared secret
///
/// Accepts `X-API-Key: <key>` or `Authorization: Bearer <key>`; comparison is
/// constant-time.
async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let authorized = supplied_api_key(request.headers()).is_some_and(|key| {
        let expected = state.config.api_key.expose_secret();
        !key.is_empty() && bool::from(key.as_bytes().ct_eq(expected.as_bytes()))
    });
    if !authorized {
        tracing::warn!(path = %request.uri().path(), "rejected request without valid API key");
        return AppError::Unauthorized(UNAUTHORIZED_MESSAGE.to_owned()).into_response();
    }
    next.run(request).await
}

fn supplied_api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.strip_prefix("Bearer ").unwrap_or(v))
        })
        .map(str::trim)
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "environment": state.config.environment,
    }))
}

/// GET /
async fn service_info() -> Json<Value> {
    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": [
            "POST /api/shared-mailbox/create",
            "POST /api/shared-mailbox/add-members",
            "POST /api/shared-mailbox/remove-members",
            "GET  /api/shared-mailbox/permissions?email=...",
            "DELETE /api/shared-mailbox?email=...",
            "GET  /health"
        ],
        "documentation": "Include X-API-Key header for authentication",
    }))
}

/// POST /api/shared-mailbox/create
async fn create_mailbox(
    State(state): State<AppState>,
    body: Result<Json<CreateMailboxInput>, JsonRejection>,
) -> AppResult<Response> {
    let started = Instant::now();
    let input = parse_body(body)?;
    let name = required_field(input.mailbox_name, "mailboxName is required")?;
    let email = required_field(input.mailbox_email, "mailboxEmail is required")?;
    validate_identity(&name, "mailboxName")?;
    validate_identity(&email, "mailboxEmail")?;
    let alias = input
        .mailbox_alias
        .map(|a| a.trim().to_owned())
        .filter(|a| !a.is_empty());
    if let Some(alias) = &alias {
        validate_alias(alias)?;
    }
    let members = input.members.normalize();
    validate_members(&members)?;

    let permissions = PermissionSet {
        full_access: input.full_access,
        send_as: input.send_as,
        send_on_behalf: input.send_on_behalf,
    };
    let mailbox = NewMailbox {
        name: name.clone(),
        email: email.clone(),
        alias,
    };
    let plan = ScriptPlan::create_mailbox(&mailbox, &members, permissions, input.auto_mapping);
    let result = state.run(plan).await;

    let agent_message = if result.success {
        format!(
            "✅ Shared mailbox \"{name}\" ({email}) created successfully with {} member(s).",
            members.len()
        )
    } else {
        failure_message("create shared mailbox", &result)
    };
    let shared_mailbox = result
        .data
        .clone()
        .unwrap_or_else(|| json!({ "name": name, "email": email }));

    Ok(respond(
        started,
        &result,
        json!({
            "sharedMailbox": shared_mailbox,
            "members": members,
            "permissions": {
                "fullAccess": input.full_access,
                "sendAs": input.send_as,
                "sendOnBehalf": input.send_on_behalf,
                "autoMapping": input.auto_mapping,
            },
            "agentMessage": agent_message,
        }),
    ))
}

/// POST /api/shared-mailbox/add-members
async fn add_members(
    State(state): State<AppState>,
    body: Result<Json<AddMembersInput>, JsonRejection>,
) -> AppResult<Response> {
    let started = Instant::now();
    let input = parse_body(body)?;
    let email = required_field(input.mailbox_email, "mailboxEmail is required")?;
    validate_identity(&email, "mailboxEmail")?;
    let members = input.members.normalize();
    validate_members(&members)?;

    let permissions = PermissionSet {
        full_access: input.full_access,
        send_as: input.send_as,
        send_on_behalf: input.send_on_behalf,
    };
    let plan = ScriptPlan::add_members(&email, &members, permissions, input.auto_mapping)?;
    let result = state.run(plan).await;

    let agent_message = if result.success {
        format!("✅ Added {} member(s) to \"{email}\".", members.len())
    } else {
        failure_message("add members", &result)
    };

    Ok(respond(
        started,
        &result,
        json!({
            "mailbox": email,
            "membersAdded": members,
            "data": result.data,
            "agentMessage": agent_message,
        }),
    ))
}

/// POST /api/shared-mailbox/remove-members
async fn remove_members(
    State(state): State<AppState>,
    body: Result<Json<RemoveMembersInput>, JsonRejection>,
) -> AppResult<Response> {
    let started = Instant::now();
    let input = parse_body(body)?;
    let email = required_field(input.mailbox_email, "mailboxEmail is required")?;
    validate_identity(&email, "mailboxEmail")?;
    let members = input.members.normalize();
    validate_members(&members)?;
    validate_no_controls(&input.reason, "reason")?;

    let permissions = PermissionSet {
        full_access: input.remove_full_access,
        send_as: input.remove_send_as,
        send_on_behalf: input.remove_send_on_behalf,
    };
    let plan = ScriptPlan::remove_members(&email, &members, permissions, &input.reason)?;
    let result = state.run(plan).await;

    let agent_message = if result.success {
        format!(
            "🔒 Removed {} member(s) from \"{email}\". Reason: {}",
            members.len(),
            input.reason
        )
    } else {
        failure_message("remove members", &result)
    };

    Ok(respond(
        started,
        &result,
        json!({
            "mailbox": email,
            "membersRemoved": members,
            "reason": input.reason,
            "data": result.data,
            "agentMessage": agent_message,
        }),
    ))
}

/// GET /api/shared-mailbox/permissions?email=...
async fn list_permissions(
    State(state): State<AppState>,
    query: Result<Query<MailboxQuery>, QueryRejection>,
) -> AppResult<Response> {
    let started = Instant::now();
    let query = parse_query(query)?;
    let email = required_field(query.email, "email query parameter is required")?;
    validate_identity(&email, "email")?;

    let result = state.run(ScriptPlan::list_permissions(&email)).await;

    let agent_message = if result.success {
        format!("Permissions retrieved for \"{email}\".")
    } else {
        failure_message("get permissions", &result)
    };
    let mut extra = match &result.data {
        Some(Value::Object(fields)) => Value::Object(fields.clone()),
        _ => json!({}),
    };
    extra["agentMessage"] = json!(agent_message);

    Ok(respond(started, &result, extra))
}

/// DELETE /api/shared-mailbox?email=... with body `{"confirm": true}`
async fn delete_mailbox(
    State(state): State<AppState>,
    query: Result<Query<MailboxQuery>, QueryRejection>,
    body: Result<Bytes, BytesRejection>,
) -> AppResult<Response> {
    let started = Instant::now();
    let query = parse_query(query)?;
    let body = body.map_err(|e| rejected(e.status(), "request body", e.body_text()))?;
    let input = if body.iter().all(u8::is_ascii_whitespace) {
        DeleteMailboxInput::default()
    } else {
        serde_json::from_slice::<DeleteMailboxInput>(&body)
            .map_err(|e| AppError::invalid(format!("invalid JSON body: {e}")))?
    };

    let email = required_field(
        query.email.filter(|e| !e.trim().is_empty()).or(input.mailbox_email),
        "email is required",
    )?;
    validate_identity(&email, "email")?;
    if input.confirm != Value::Bool(true) {
        return Err(AppError::invalid(
            "Please confirm deletion by setting confirm: true in request body",
        ));
    }

    let result = state.run(ScriptPlan::delete_mailbox(&email)).await;

    let agent_message = if result.success {
        format!("🗑️ Shared mailbox \"{email}\" deleted.")
    } else {
        failure_message("delete", &result)
    };

    Ok(respond(
        started,
        &result,
        json!({
            "deleted": email,
            "data": result.data,
            "agentMessage": agent_message,
        }),
    ))
}

/// Merge the common result fields into an operation-specific body
///
/// 200 when the session completed, 500 otherwise. Per-principal failures live
/// in `data.errors` and do not change the status.
fn respond(started: Instant, result: &ExecutionResult, mut body: Value) -> Response {
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    body["success"] = json!(result.success);
    body["logs"] = json!(result.logs);
    body["error"] = json!(result.error);
    if let Some(raw) = &result.raw_output {
        body["rawOutput"] = json!(raw);
    }
    body["meta"] = json!(Meta::now(duration_ms(started)));
    (status, Json(body)).into_response()
}

fn failure_message(action: &str, result: &ExecutionResult) -> String {
    format!(
        "❌ Failed to {action}: {}",
        result.error.as_deref().unwrap_or("unknown error")
    )
}

/// Calculate elapsed milliseconds
fn duration_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> AppResult<T> {
    body.map(|Json(input)| input)
        .map_err(|e| rejected(e.status(), "JSON body", e.body_text()))
}

fn parse_query(query: Result<Query<MailboxQuery>, QueryRejection>) -> AppResult<MailboxQuery> {
    query
        .map(|Query(query)| query)
        .map_err(|e| rejected(e.status(), "query string", e.body_text()))
}

/// Map an extractor rejection onto the JSON error envelope
fn rejected(status: StatusCode, what: &str, detail: String) -> AppError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(format!("request body exceeds {MAX_BODY_SIZE} bytes"))
    } else {
        AppError::InvalidInput(format!("invalid {what}: {detail}"))
    }
}

/// Wrap responses produced outside the handlers (body-limit layer, routing
/// errors) in the same `{success, error}` envelope handler errors use
async fn json_error_envelope(response: Response) -> Response {
    let status = response.status();
    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    if is_json || !(status.is_client_error() || status.is_server_error()) {
        return response;
    }

    let detail = axum::body::to_bytes(response.into_body(), MAX_BODY_SIZE)
        .await
        .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_owned())
        .unwrap_or_default();
    let error = if status == StatusCode::PAYLOAD_TOO_LARGE {
        format!("request body exceeds {MAX_BODY_SIZE} bytes")
    } else if detail.is_empty() {
        status.canonical_reason().unwrap_or("request failed").to_owned()
    } else {
        detail
    };
    (status, Json(json!({ "success": false, "error": error }))).into_response()
}

/// Trimmed, non-empty value or the given validation message
fn required_field(value: Option<String>, message: &str) -> AppResult<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::invalid(message))
}

/// Validate an identity-like value (mailbox, principal)
fn validate_identity(value: &str, field: &str) -> AppResult<()> {
    if value.chars().count() > MAX_IDENTITY_LEN {
        return Err(AppError::InvalidInput(format!(
            "{field} must be at most {MAX_IDENTITY_LEN} characters"
        )));
    }
    validate_no_controls(value, field)
}

fn validate_members(members: &[String]) -> AppResult<()> {
    for member in members {
        validate_identity(member, "members")?;
    }
    Ok(())
}

/// Reject control characters in user-provided values
fn validate_no_controls(value: &str, field: &str) -> AppResult<()> {
    if value.chars().any(char::is_control) {
        return Err(AppError::InvalidInput(format!(
            "{field} must not contain control characters"
        )));
    }
    Ok(())
}

fn validate_alias(alias: &str) -> AppResult<()> {
    let pattern = Regex::new(r"^[A-Za-z0-9._-]{1,64}$")
        .map_err(|e| AppError::Internal(format!("invalid alias regex: {e}")))?;
    if !pattern.is_match(alias) {
        return Err(AppError::invalid(
            "mailboxAlias must be 1..64 characters of [A-Za-z0-9._-]",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::net::IpAddr;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use secrecy::{SecretSlice, SecretString};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::{AppState, MAX_BODY_SIZE, router, validate_alias, validate_identity};
    use crate::config::{ExchangeCredentials, ExecutionConfig, ServerConfig};
    use crate::executor::ScriptExecutor;
    use crate::models::ExecutionResult;
    use crate::script::{Operation, ScriptRequest};

    const KEY: &str = "test-key";

    /// Records requests and replays a canned result
    struct FakeExecutor {
        result: ExecutionResult,
        calls: Mutex<Vec<ScriptRequest>>,
    }

    impl FakeExecutor {
        fn new(result: ExecutionResult) -> Arc<Self> {
            Arc::new(Self {
                result,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<ScriptRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ScriptExecutor for FakeExecutor {
        fn run<'a>(
            &'a self,
            request: ScriptRequest,
        ) -> Pin<Box<dyn Future<Output = ExecutionResult> + Send + 'a>> {
            self.calls.lock().unwrap().push(request);
            let result = self.result.clone();
            Box::pin(async move { result })
        }
    }

    fn config() -> ServerConfig {
        ServerConfig {
            api_key: SecretString::new(KEY.into()),
            exchange: ExchangeCredentials {
                app_id: "app".to_owned(),
                tenant_id: None,
                organization: "contoso.onmicrosoft.com".to_owned(),
                certificate: Arc::new(SecretSlice::from(vec![1])),
                certificate_password: SecretString::new("pw".into()),
            },
            execution: ExecutionConfig {
                interpreter: "pwsh".to_owned(),
                timeout: Duration::from_secs(1),
                max_concurrent: 1,
                work_dir: std::env::temp_dir(),
            },
            bind: IpAddr::from([127, 0, 0, 1]),
            port: 0,
            environment: "test".to_owned(),
        }
    }

    fn ok(data: Value) -> ExecutionResult {
        ExecutionResult {
            success: true,
            data: Some(data),
            error: None,
            logs: vec!["Connected successfully!".to_owned()],
            raw_output: None,
        }
    }

    async fn send(
        executor: Arc<FakeExecutor>,
        method: &str,
        uri: &str,
        body: Option<Value>,
        key: Option<&str>,
    ) -> (StatusCode, Value) {
        let app = router(AppState::new(config(), executor));
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header("x-api-key", key);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_and_root_are_public() {
        let executor = FakeExecutor::new(ok(json!({})));
        let (status, body) = send(executor.clone(), "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["environment"], "test");

        let (status, body) = send(executor.clone(), "GET", "/", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["endpoints"].as_array().unwrap().len(), 6);
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn rejects_missing_or_wrong_api_key() {
        let executor = FakeExecutor::new(ok(json!({})));
        for key in [None, Some("wrong"), Some("")] {
            let (status, body) = send(
                executor.clone(),
                "GET",
                "/api/shared-mailbox/permissions?email=s@x.com",
                None,
                key,
            )
            .await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body["success"], false);
            assert_eq!(body["error"], "Unauthorized. Provide valid X-API-Key header.");
        }
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn accepts_bearer_token() {
        let executor = FakeExecutor::new(ok(json!({ "fullAccess": [] })));
        let app = router(AppState::new(config(), executor.clone()));
        let request = Request::builder()
            .uri("/api/shared-mailbox/permissions?email=s@x.com")
            .header("authorization", format!("Bearer {KEY}"))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn create_reports_mailbox_members_and_message() {
        let executor = FakeExecutor::new(ok(json!({
            "name": "Support",
            "email": "support@x.com",
            "permissionsGranted": ["FullAccess:a@x.com"],
            "errors": [],
        })));
        let (status, body) = send(
            executor.clone(),
            "POST",
            "/api/shared-mailbox/create",
            Some(json!({
                "mailboxName": "Support",
                "mailboxEmail": "support@x.com",
                "members": "a@x.com, b@x.com"
            })),
            Some(KEY),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["sharedMailbox"]["email"], "support@x.com");
        assert_eq!(body["members"], json!(["a@x.com", "b@x.com"]));
        assert!(body["agentMessage"].as_str().unwrap().contains("2 member(s)"));
        assert_eq!(body["permissions"]["autoMapping"], true);

        let calls = executor.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].operation, Operation::CreateMailbox);
        let script = &calls[0].body;
        let order: Vec<usize> = [
            "'FullAccess:a@x.com'",
            "'SendAs:a@x.com'",
            "'SendOnBehalf:a@x.com'",
            "'FullAccess:b@x.com'",
            "'SendAs:b@x.com'",
            "'SendOnBehalf:b@x.com'",
        ]
        .iter()
        .map(|entry| script.find(entry).expect("grant present"))
        .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn create_with_no_members_is_allowed() {
        let executor = FakeExecutor::new(ok(json!({ "email": "s@x.com" })));
        let (status, body) = send(
            executor.clone(),
            "POST",
            "/api/shared-mailbox/create",
            Some(json!({ "mailboxName": "S", "mailboxEmail": "s@x.com" })),
            Some(KEY),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["members"], json!([]));
        assert!(body["agentMessage"].as_str().unwrap().contains("0 member(s)"));
        assert_eq!(executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn create_validates_required_fields() {
        let executor = FakeExecutor::new(ok(json!({})));
        let cases = [
            (json!({ "mailboxEmail": "s@x.com" }), "mailboxName is required"),
            (json!({ "mailboxName": "S", "mailboxEmail": "  " }), "mailboxEmail is required"),
        ];
        for (payload, message) in cases {
            let (status, body) = send(
                executor.clone(),
                "POST",
                "/api/shared-mailbox/create",
                Some(payload),
                Some(KEY),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["error"], message);
        }
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn partial_failure_keeps_success() {
        let executor = FakeExecutor::new(ok(json!({
            "mailbox": "s@x.com",
            "permissionsGranted": ["FullAccess:a@x.com", "SendAs:a@x.com", "SendOnBehalf:a@x.com"],
            "errors": ["FullAccess:b@x.com:User not found"],
        })));
        let (status, body) = send(
            executor,
            "POST",
            "/api/shared-mailbox/add-members",
            Some(json!({ "mailboxEmail": "s@x.com", "members": ["a@x.com", "b@x.com"] })),
            Some(KEY),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["membersAdded"], json!(["a@x.com", "b@x.com"]));
        assert!(body["data"]["errors"][0].as_str().unwrap().contains("b@x.com"));
    }

    #[tokio::test]
    async fn membership_changes_require_members() {
        let executor = FakeExecutor::new(ok(json!({})));
        for uri in [
            "/api/shared-mailbox/add-members",
            "/api/shared-mailbox/remove-members",
        ] {
            for members in [json!(""), json!(" , "), json!([]), json!(["  "])] {
                let (status, body) = send(
                    executor.clone(),
                    "POST",
                    uri,
                    Some(json!({ "mailboxEmail": "s@x.com", "members": members })),
                    Some(KEY),
                )
                .await;
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(body["error"], "At least one member is required");
            }
        }
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn remove_members_echoes_reason() {
        let executor = FakeExecutor::new(ok(json!({ "permissionsRevoked": [] })));
        let (status, body) = send(
            executor.clone(),
            "POST",
            "/api/shared-mailbox/remove-members",
            Some(json!({
                "mailboxEmail": "s@x.com",
                "members": "a@x.com",
                "removeSendAs": false,
                "reason": "Left team"
            })),
            Some(KEY),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reason"], "Left team");
        assert_eq!(
            body["agentMessage"],
            "🔒 Removed 1 member(s) from \"s@x.com\". Reason: Left team"
        );
        let script = &executor.calls()[0].body;
        assert!(!script.contains("Remove-RecipientPermission"));
        assert!(script.contains("Remove-MailboxPermission"));
    }

    #[tokio::test]
    async fn failed_execution_maps_to_500() {
        let executor = FakeExecutor::new(ExecutionResult {
            success: false,
            data: None,
            error: Some("No structured output from script".to_owned()),
            logs: vec!["garbage".to_owned()],
            raw_output: Some("garbage".to_owned()),
        });
        let (status, body) = send(
            executor,
            "POST",
            "/api/shared-mailbox/create",
            Some(json!({ "mailboxName": "S", "mailboxEmail": "s@x.com" })),
            Some(KEY),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "No structured output from script");
        assert_eq!(body["rawOutput"], "garbage");
        assert_eq!(body["sharedMailbox"], json!({ "name": "S", "email": "s@x.com" }));
        assert!(body["agentMessage"].as_str().unwrap().starts_with("❌ Failed to create"));
    }

    #[tokio::test]
    async fn permissions_flattens_data() {
        let executor = FakeExecutor::new(ok(json!({
            "mailbox": { "email": "s@x.com" },
            "fullAccess": ["a@x.com"],
            "sendAs": [],
            "sendOnBehalf": ["b@x.com"],
        })));
        let (status, body) = send(
            executor.clone(),
            "GET",
            "/api/shared-mailbox/permissions?email=s@x.com",
            None,
            Some(KEY),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mailbox"]["email"], "s@x.com");
        assert_eq!(body["fullAccess"], json!(["a@x.com"]));
        assert_eq!(body["sendOnBehalf"], json!(["b@x.com"]));
        assert_eq!(executor.calls()[0].operation, Operation::ListPermissions);

        let (status, body) = send(
            executor.clone(),
            "GET",
            "/api/shared-mailbox/permissions",
            None,
            Some(KEY),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "email query parameter is required");
        assert_eq!(executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn delete_requires_literal_confirm_true() {
        let executor = FakeExecutor::new(ok(json!({ "email": "s@x.com" })));
        let payloads = [
            None,
            Some(json!({})),
            Some(json!({ "confirm": "true" })),
            Some(json!({ "confirm": false })),
        ];
        for payload in payloads {
            let (status, body) = send(
                executor.clone(),
                "DELETE",
                "/api/shared-mailbox?email=s@x.com",
                payload,
                Some(KEY),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(
                body["error"],
                "Please confirm deletion by setting confirm: true in request body"
            );
        }
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn delete_accepts_email_from_query_or_body() {
        let executor = FakeExecutor::new(ok(json!({ "email": "s@x.com" })));
        let (status, body) = send(
            executor.clone(),
            "DELETE",
            "/api/shared-mailbox",
            Some(json!({ "mailboxEmail": "s@x.com", "confirm": true })),
            Some(KEY),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], "s@x.com");
        assert_eq!(executor.calls()[0].operation, Operation::DeleteMailbox);

        let (status, body) = send(
            executor.clone(),
            "DELETE",
            "/api/shared-mailbox",
            Some(json!({ "confirm": true })),
            Some(KEY),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "email is required");
        assert_eq!(executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn malformed_json_is_a_validation_error() {
        let executor = FakeExecutor::new(ok(json!({})));
        let app = router(AppState::new(config(), executor.clone()));
        let request = Request::builder()
            .method("POST")
            .uri("/api/shared-mailbox/create")
            .header("x-api-key", KEY)
            .header("content-type", "application/json")
            .body(Body::from("{\"mailboxName\": "))
            .unwrap();
        let (status, body) = into_json(app.oneshot(request).await.unwrap()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("invalid JSON body"));
        assert!(executor.calls().is_empty());
    }

    async fn into_json(response: axum::response::Response) -> (StatusCode, Value) {
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            panic!("non-JSON {status} body {:?}: {e}", String::from_utf8_lossy(&bytes))
        });
        (status, body)
    }

    #[tokio::test]
    async fn malformed_query_is_a_json_validation_error() {
        let executor = FakeExecutor::new(ok(json!({})));
        let (status, body) = send(
            executor.clone(),
            "GET",
            "/api/shared-mailbox/permissions?email=a@x.com&email=b@x.com",
            None,
            Some(KEY),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().starts_with("invalid query string"));
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn oversized_delete_body_is_a_json_error() {
        let executor = FakeExecutor::new(ok(json!({})));
        let app = router(AppState::new(config(), executor.clone()));
        let padding = "x".repeat(MAX_BODY_SIZE);
        let request = Request::builder()
            .method("DELETE")
            .uri("/api/shared-mailbox?email=s@x.com")
            .header("x-api-key", KEY)
            .body(Body::from(format!("{{\"confirm\":true,\"pad\":\"{padding}\"}}")))
            .unwrap();
        let (status, body) = into_json(app.oneshot(request).await.unwrap()).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("exceeds"));
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn declared_oversized_body_is_a_json_error() {
        let executor = FakeExecutor::new(ok(json!({})));
        let app = router(AppState::new(config(), executor.clone()));
        let payload = "x".repeat(MAX_BODY_SIZE + 1);
        let request = Request::builder()
            .method("POST")
            .uri("/api/shared-mailbox/create")
            .header("x-api-key", KEY)
            .header("content-type", "application/json")
            .header("content-length", payload.len())
            .body(Body::from(payload))
            .unwrap();
        let (status, body) = into_json(app.oneshot(request).await.unwrap()).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["success"], false);
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn rejects_control_characters_in_members() {
        let executor = FakeExecutor::new(ok(json!({})));
        let (status, body) = send(
            executor.clone(),
            "POST",
            "/api/shared-mailbox/add-members",
            Some(json!({ "mailboxEmail": "s@x.com", "members": ["a@x.com\nRemove-Mailbox"] })),
            Some(KEY),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("control characters"));
        assert!(executor.calls().is_empty());
    }

    #[test]
    fn validates_alias_and_identity_length() {
        validate_alias("support.team-1").expect("valid alias");
        assert!(validate_alias("has space").is_err());
        assert!(validate_identity(&"a".repeat(257), "members").is_err());
        validate_identity(&"a".repeat(256), "members").expect("boundary length is valid");
    }
}
