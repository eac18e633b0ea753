
use std::{
    env,
    net::SocketAddr,
    sync::Arc,
    time::SystemTime,
};

use anyhow::{anyhow, Context};
use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, ConnectInfo, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    auth::{self, Caller, KeyScope, Role},
    conf::{self, Conf},
    data::{PaymentCredit, PaymentOutcome, Storage},
    docs::ApiDoc,
    gateway::{Gateway, GatewayError},
    keys,
    ledger::{self, LedgerError},
    payments::{self, Handled, WebhookError},
    provider::{fal::FalClient, ProviderError},
    registry,
    types::{
        ApiKeyCreate, ApiKeyCreated, ApiKeyInfo, Balance, GenerationRecord,
        GrantRequest, GrantResponse, InvokeRequest, InvokeResponse,
        OrchestrateRequest, OrchestrateResponse, ReconcileReport, ToolInfo,
        WebhookAck, WorkflowInfo,
    },
};

const IDEMPOTENCY_HEADER: &str = "idempotency-key";

#[derive(Clone)]
pub struct AppState {
    pub conf: Arc<Conf>,
    pub storage: Storage,
    pub gateway: Gateway,
}

#[derive(Debug, serde::Serialize)]
pub struct ErrorResponse {
    error: String,
    details: Option<String>,
}

#[derive(Debug)]
pub struct ApiError(StatusCode, Json<ErrorResponse>);

impl ApiError {
    fn new(status: StatusCode, details: impl ToString) -> Self {
        Self(
            status,
            Json(ErrorResponse {
                error: status
                    .canonical_reason()
                    .unwrap_or("Unknown error")
                    .to_string(),
                details: Some(details.to_string()),
            }),
        )
    }
}

impl From<StatusCode> for ApiError {
    fn from(status: StatusCode) -> Self {
        ApiError(
            status,
            Json(ErrorResponse {
                error: status
                    .canonical_reason()
                    .unwrap_or("Unknown error")
                    .to_string(),
                details: None,
            }),
        )
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!(?error, "Internal error.");
        StatusCode::INTERNAL_SERVER_ERROR.into()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, rejection.body_text())
    }
}

impl From<LedgerError> for ApiError {
    fn from(error: LedgerError) -> Self {
        let status = match &error {
            LedgerError::InvalidAmount(_) => StatusCode::BAD_REQUEST,
            LedgerError::UnknownAccount(_) | LedgerError::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            LedgerError::InsufficientCredits { .. }
            | LedgerError::KeyBudgetExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            LedgerError::NotPending { .. } => StatusCode::CONFLICT,
            LedgerError::Storage(_) | LedgerError::Other(_) => {
                tracing::error!(?error, "Ledger failure.");
                return StatusCode::INTERNAL_SERVER_ERROR.into();
            }
        };
        Self::new(status, error)
    }
}

impl From<GatewayError> for ApiError {
    fn from(error: GatewayError) -> Self {
        if let GatewayError::Ledger(error) = error {
            return error.into();
        }
        let status = match &error {
            GatewayError::UnknownTool(_) | GatewayError::NoWorkflow(_) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::ToolNotAllowed(_) => StatusCode::FORBIDDEN,
            GatewayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            GatewayError::InProgress | GatewayError::AlreadyRefunded => {
                StatusCode::CONFLICT
            }
            GatewayError::IdempotencyMismatch { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            GatewayError::Provider(ProviderError::Request(e)) if e.is_timeout() => {
                StatusCode::GATEWAY_TIMEOUT
            }
            GatewayError::Provider(ProviderError::Request(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Provider(ProviderError::Timeout(_)) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            GatewayError::Provider(
                ProviderError::Api { .. }
                | ProviderError::Decode(_)
                | ProviderError::Failed(_),
            ) => StatusCode::BAD_GATEWAY,
            GatewayError::Ledger(_) | GatewayError::Internal(_) => {
                tracing::error!(?error, "Gateway failure.");
                return StatusCode::INTERNAL_SERVER_ERROR.into();
            }
        };
        Self::new(status, error)
    }
}

impl From<WebhookError> for ApiError {
    fn from(error: WebhookError) -> Self {
        let status = match &error {
            WebhookError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            WebhookError::MalformedEvent(_) => StatusCode::BAD_REQUEST,
            WebhookError::MissingSignature
            | WebhookError::MalformedSignature
            | WebhookError::SignatureMismatch
            | WebhookError::Expired => StatusCode::UNAUTHORIZED,
        };
        Self::new(status, error)
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError(status, body) = self;
        (status, body).into_response()
    }
}

#[tracing::instrument(name = "server", skip_all)]
pub async fn run(conf: Arc<Conf>) -> anyhow::Result<()> {
    let dir = env::current_dir()?;
    tracing::info!(?dir, ?conf, "Starting.");
    let addr = SocketAddr::from((conf.addr, conf.port));

    // XXX One MUST do this manual init of rustls provider when using
    //     more than a single dep which itself depends on rustls.
    //     Here we using 2:
    //     - axum_server
    //     - reqwest
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|crypto_provider| {
            anyhow!(
                "Failed to install default crypto provider: \
                {crypto_provider:?}"
            )
        })?;

    let storage = Storage::connect(&conf).await?;
    let refunded = storage
        .recover_stale(stale_cutoff(&conf))
        .await
        .context("Failed to recover stale reservations")?;
    if !refunded.is_empty() {
        tracing::warn!(count = refunded.len(), "Refunded stale reservations.");
    }
    tokio::spawn(ledger::reconcile_forever(
        storage.clone(),
        conf.ledger.reservation_ttl(),
        conf.ledger.reconcile_interval(),
    ));

    let provider = Arc::new(
        FalClient::new(&conf.provider).context("Failed to build provider client")?,
    );
    let gateway = Gateway::new(storage.clone(), provider, conf.clone());
    let state = AppState {
        conf: conf.clone(),
        storage,
        gateway,
    };
    let service =
        router(state)?.into_make_service_with_connect_info::<SocketAddr>();

    match &conf.tls {
        None => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::warn!(?addr, "Listening unencrypted.");
            axum::serve(listener, service).await?;
        }
        Some(conf::Tls {
            cert_file,
            key_file,
        }) => {
            let config =
                axum_server::tls_rustls::RustlsConfig::from_pem_file(
                    cert_file, key_file,
                )
                .await
                .context(format!(
                    "Failed to construct RustlsConfig. \
                    cert_file={cert_file:?}, key_file={key_file:?}"
                ))?;

            tracing::info!(
                ?addr,
                ?cert_file,
                ?key_file,
                "Listening with TLS."
            );
            axum_server::bind_rustls(addr, config)
                .serve(service)
                .await?;
        }
    }

    Ok(())
}

pub fn router(state: AppState) -> anyhow::Result<Router> {
    let cors = cors(&state.conf)?;
    let authed = Router::new()
        .route("/api/credits", get(credits_handler))
        .route("/api/history", get(history_handler))
        .route("/api/gateway/invoke/:tool_id", post(invoke_handler))
        .route("/api/gateway/orchestrate", post(orchestrate_handler))
        .route("/api/keys", get(list_keys_handler).post(create_key_handler))
        .route("/api/keys/:key_id", delete(revoke_key_handler))
        .route("/api/admin/credits", post(grant_handler))
        .route("/api/admin/reconcile", post(reconcile_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_layer));
    let routes = Router::new()
        .route("/health", get(health_check))
        .route("/api/gateway/tools", get(tools_handler))
        .route("/api/gateway/tools/:tool_id", get(tool_handler))
        .route("/api/gateway/workflows", get(workflows_handler))
        .route("/api/stripe/webhook", post(webhook_handler))
        .merge(authed)
        .route_layer(middleware::from_fn(req_id_layer))
        .merge(
            SwaggerUi::new("/swagger-ui")
                .url("/api-docs/openapi.json", ApiDoc::openapi()),
        )
        .layer(cors)
        .with_state(state);
    Ok(routes)
}

fn cors(conf: &Conf) -> anyhow::Result<CorsLayer> {
    let origins = conf
        .cors_origins
        .iter()
        .map(|origin| {
            origin
                .parse::<HeaderValue>()
                .context(format!("Invalid CORS origin: {origin:?}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let layer = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::ORIGIN,
            HeaderName::from_static(keys::HEADER),
            HeaderName::from_static(IDEMPOTENCY_HEADER),
        ])
        .allow_credentials(true)
        .expose_headers([header::CONTENT_TYPE, header::CONTENT_LENGTH]);
    Ok(layer)
}

fn stale_cutoff(conf: &Conf) -> SystemTime {
    SystemTime::now()
        .checked_sub(conf.ledger.reservation_ttl())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

async fn health_check() -> &'static str {
    "OK"
}

#[tracing::instrument(skip_all, fields(req_id = %REQ_ID.get().req_id))]
#[utoipa::path(
    get,
    path = "/api/gateway/tools",
    responses(
        (status = 200, description = "Tool catalog with credit prices", body = Vec<ToolInfo>),
    )
)]
pub async fn tools_handler(State(state): State<AppState>) -> Json<Vec<ToolInfo>> {
    let tools = registry::TOOLS
        .iter()
        .map(|tool| ToolInfo::new(tool, state.gateway.quote(tool)))
        .collect();
    Json(tools)
}

#[tracing::instrument(skip_all, fields(req_id = %REQ_ID.get().req_id))]
#[utoipa::path(
    get,
    path = "/api/gateway/tools/{tool_id}",
    params(("tool_id" = String, Path, description = "Tool id, e.g. 'flux-schnell'")),
    responses(
        (status = 200, description = "Tool details and input schema", body = ToolInfo),
        (status = 404, description = "Unknown tool"),
    )
)]
pub async fn tool_handler(
    State(state): State<AppState>,
    Path(tool_id): Path<String>,
) -> Result<Json<ToolInfo>, ApiError> {
    let tool = registry::tool(&tool_id)
        .ok_or_else(|| GatewayError::UnknownTool(tool_id.clone()))?;
    Ok(Json(ToolInfo::new(tool, state.gateway.quote(tool))))
}

#[tracing::instrument(skip_all, fields(req_id = %REQ_ID.get().req_id))]
#[utoipa::path(
    get,
    path = "/api/gateway/workflows",
    responses(
        (status = 200, description = "Workflow templates", body = Vec<WorkflowInfo>),
    )
)]
pub async fn workflows_handler(
    State(state): State<AppState>,
) -> Json<Vec<WorkflowInfo>> {
    let workflows = registry::WORKFLOWS
        .iter()
        .map(|workflow| {
            let credits = workflow
                .steps
                .iter()
                .filter_map(|step| registry::tool(step.tool))
                .map(|tool| state.gateway.quote(tool))
                .sum();
            WorkflowInfo::new(workflow, credits)
        })
        .collect();
    Json(workflows)
}

#[tracing::instrument(
    skip_all,
    fields(
        req_id = %REQ_ID.get().req_id,
        uid = %USER.get().uid,
    )
)]
#[utoipa::path(
    get,
    path = "/api/credits",
    responses(
        (status = 200, description = "Current balance and lifetime totals", body = Balance),
        (status = 401, description = "Missing or invalid credentials"),
    ),
    security(("jwt" = []), ("api_key" = []))
)]
pub async fn credits_handler(
    State(state): State<AppState>,
) -> Result<Json<Balance>, ApiError> {
    let caller = USER.get();
    let user = state
        .storage
        .user(&caller.uid)
        .await?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(user.into()))
}

#[derive(serde::Deserialize, Debug)]
pub struct HistoryQuery {
    limit: Option<u32>,
}

#[tracing::instrument(
    skip_all,
    fields(
        req_id = %REQ_ID.get().req_id,
        uid = %USER.get().uid,
    )
)]
#[utoipa::path(
    get,
    path = "/api/history",
    params(("limit" = Option<u32>, Query, description = "Max records, newest first")),
    responses(
        (status = 200, description = "Recent generations", body = Vec<GenerationRecord>),
        (status = 401, description = "Missing or invalid credentials"),
    ),
    security(("jwt" = []), ("api_key" = []))
)]
pub async fn history_handler(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<GenerationRecord>>, ApiError> {
    let caller = USER.get();
    let max = state.conf.ledger.history_limit;
    let limit = query.limit.map_or(max, |l| l.min(max));
    let history = state.storage.history(&caller.uid, limit).await?;
    Ok(Json(history.into_iter().map(GenerationRecord::from).collect()))
}

#[tracing::instrument(
    skip_all,
    fields(
        req_id = %REQ_ID.get().req_id,
        uid = %USER.get().uid,
        tool_id = tracing::field::Empty,
    )
)]
#[utoipa::path(
    post,
    path = "/api/gateway/invoke/{tool_id}",
    params(
        ("tool_id" = String, Path, description = "Tool to run"),
        ("Idempotency-Key" = Option<String>, Header, description = "Alternative to the body field"),
    ),
    request_body = InvokeRequest,
    responses(
        (status = 200, description = "Generation output", body = InvokeResponse),
        (status = 400, description = "Input does not match the tool's schema"),
        (status = 401, description = "Missing or invalid credentials"),
        (status = 402, description = "Insufficient credits or key budget"),
        (status = 403, description = "Tool not allowed for this API key"),
        (status = 404, description = "Unknown tool"),
        (status = 409, description = "Idempotency key belongs to an unfinished or refunded request"),
        (status = 422, description = "Idempotency key was used for a different tool or price"),
        (status = 502, description = "Provider rejected or failed the job; credits refunded"),
        (status = 503, description = "Provider unreachable; credits refunded"),
        (status = 504, description = "Provider timed out; credits refunded"),
    ),
    security(("jwt" = []), ("api_key" = []))
)]
pub async fn invoke_handler(
    State(state): State<AppState>,
    Path(tool_id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<InvokeRequest>, JsonRejection>,
) -> Result<Json<InvokeResponse>, ApiError> {
    tracing::Span::current().record("tool_id", tool_id.as_str());
    let Json(InvokeRequest {
        input,
        idempotency_key,
    }) = payload?;
    let idempotency_key = match idempotency_key {
        Some(key) => Some(key),
        None => headers
            .get(IDEMPOTENCY_HEADER)
            .map(|v| v.to_str().map(str::to_string))
            .transpose()
            .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e))?,
    };
    let caller = USER.get();
    let invocation = state
        .gateway
        .invoke(&caller, &tool_id, input, idempotency_key.as_deref())
        .await?;
    tracing::info!(
        reservation_id = invocation.reservation_id,
        credits = invocation.credits_charged,
        replayed = invocation.replayed,
        "Invocation done."
    );
    Ok(Json(invocation.into()))
}

#[tracing::instrument(
    skip_all,
    fields(
        req_id = %REQ_ID.get().req_id,
        uid = %USER.get().uid,
    )
)]
#[utoipa::path(
    post,
    path = "/api/gateway/orchestrate",
    request_body = OrchestrateRequest,
    responses(
        (status = 200, description = "Workflow result; may report a failed later step", body = OrchestrateResponse),
        (status = 400, description = "Empty goal or bad input"),
        (status = 401, description = "Missing or invalid credentials"),
        (status = 402, description = "Balance or key budget does not cover the workflow"),
        (status = 404, description = "No workflow matches the goal"),
        (status = 502, description = "First step failed; credits refunded"),
    ),
    security(("jwt" = []), ("api_key" = []))
)]
pub async fn orchestrate_handler(
    State(state): State<AppState>,
    payload: Result<Json<OrchestrateRequest>, JsonRejection>,
) -> Result<Json<OrchestrateResponse>, ApiError> {
    let Json(OrchestrateRequest { goal, input }) = payload?;
    if goal.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Goal is empty."));
    }
    let caller = USER.get();
    let orchestration = state.gateway.orchestrate(&caller, &goal, input).await?;
    Ok(Json(orchestration.into()))
}

#[tracing::instrument(
    skip_all,
    fields(
        req_id = %REQ_ID.get().req_id,
        uid = %USER.get().uid,
    )
)]
#[utoipa::path(
    get,
    path = "/api/keys",
    responses(
        (status = 200, description = "The caller's API keys", body = Vec<ApiKeyInfo>),
        (status = 403, description = "API keys cannot manage keys"),
    ),
    security(("jwt" = []))
)]
pub async fn list_keys_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<ApiKeyInfo>>, ApiError> {
    let caller = user_session()?;
    let keys = state
        .storage
        .api_keys(&caller.uid)
        .await?
        .into_iter()
        .map(ApiKeyInfo::try_from)
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Json(keys))
}

#[tracing::instrument(
    skip_all,
    fields(
        req_id = %REQ_ID.get().req_id,
        uid = %USER.get().uid,
    )
)]
#[utoipa::path(
    post,
    path = "/api/keys",
    request_body = ApiKeyCreate,
    responses(
        (status = 200, description = "Created key; plaintext shown once", body = ApiKeyCreated),
        (status = 400, description = "Bad name, limit or tool id"),
        (status = 403, description = "API keys cannot manage keys"),
    ),
    security(("jwt" = []))
)]
pub async fn create_key_handler(
    State(state): State<AppState>,
    payload: Result<Json<ApiKeyCreate>, JsonRejection>,
) -> Result<Json<ApiKeyCreated>, ApiError> {
    let caller = user_session()?;
    let Json(ApiKeyCreate {
        name,
        allowed_tools,
        credit_limit,
    }) = payload?;
    if let Some(unknown) = allowed_tools.iter().find(|t| registry::tool(t).is_none()) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("Unknown tool: {unknown}"),
        ));
    }
    if name.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Name is empty."));
    }
    if credit_limit.is_some_and(|limit| limit <= 0) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "Credit limit must be positive.",
        ));
    }
    let (row, key) = keys::create(
        &state.storage,
        &keys::NewKey {
            uid: &caller.uid,
            name: &name,
            allowed_tools: &allowed_tools,
            credit_limit,
        },
    )
    .await?;
    Ok(Json(ApiKeyCreated {
        key,
        info: row.try_into()?,
    }))
}

#[tracing::instrument(
    skip_all,
    fields(
        req_id = %REQ_ID.get().req_id,
        uid = %USER.get().uid,
    )
)]
#[utoipa::path(
    delete,
    path = "/api/keys/{key_id}",
    params(("key_id" = String, Path, description = "Key to revoke")),
    responses(
        (status = 204, description = "Revoked"),
        (status = 403, description = "API keys cannot manage keys"),
        (status = 404, description = "No such live key"),
    ),
    security(("jwt" = []))
)]
pub async fn revoke_key_handler(
    State(state): State<AppState>,
    Path(key_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let caller = user_session()?;
    if state.storage.revoke_api_key(&caller.uid, &key_id).await? {
        tracing::info!(key_id, "API key revoked.");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND.into())
    }
}

#[tracing::instrument(
    skip_all,
    fields(
        req_id = %REQ_ID.get().req_id,
        uid = %USER.get().uid,
    )
)]
#[utoipa::path(
    post,
    path = "/api/admin/credits",
    request_body = GrantRequest,
    responses(
        (status = 200, description = "Grant applied, or already applied for this reference", body = GrantResponse),
        (status = 400, description = "Non-positive credits or empty reference"),
        (status = 403, description = "Not an admin"),
    ),
    security(("jwt" = []))
)]
pub async fn grant_handler(
    State(state): State<AppState>,
    payload: Result<Json<GrantRequest>, JsonRejection>,
) -> Result<Json<GrantResponse>, ApiError> {
    admin()?;
    let Json(GrantRequest {
        uid,
        credits,
        reference,
    }) = payload?;
    if credits <= 0 {
        return Err(LedgerError::InvalidAmount(credits).into());
    }
    if uid.trim().is_empty() || reference.trim().is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "uid and reference are required.",
        ));
    }
    let payment_id = format!("admin:{reference}");
    let outcome = state
        .storage
        .credit_payment(&PaymentCredit {
            payment_id: &payment_id,
            uid: &uid,
            source: "admin",
            credits,
            amount_cents: None,
        })
        .await?;
    let (granted, balance) = match outcome {
        PaymentOutcome::Credited { balance } => (true, balance),
        PaymentOutcome::Duplicate => {
            let balance = state
                .storage
                .user(&uid)
                .await?
                .map_or(0, |user| user.credits);
            (false, balance)
        }
    };
    tracing::info!(target_uid = uid, credits, granted, "Admin grant.");
    Ok(Json(GrantResponse {
        uid,
        granted,
        balance,
    }))
}

#[tracing::instrument(
    skip_all,
    fields(
        req_id = %REQ_ID.get().req_id,
        uid = %USER.get().uid,
    )
)]
#[utoipa::path(
    post,
    path = "/api/admin/reconcile",
    responses(
        (status = 200, description = "Stale reservations that were refunded", body = ReconcileReport),
        (status = 403, description = "Not an admin"),
    ),
    security(("jwt" = []))
)]
pub async fn reconcile_handler(
    State(state): State<AppState>,
) -> Result<Json<ReconcileReport>, ApiError> {
    admin()?;
    let refunded = state.storage.recover_stale(stale_cutoff(&state.conf)).await?;
    Ok(Json(ReconcileReport {
        refunded: refunded.into_iter().map(Into::into).collect(),
    }))
}

#[tracing::instrument(skip_all, fields(req_id = %REQ_ID.get().req_id))]
#[utoipa::path(
    post,
    path = "/api/stripe/webhook",
    request_body(content = String, description = "Raw Stripe event", content_type = "application/json"),
    params(("Stripe-Signature" = String, Header, description = "t=<unix>,v1=<hex hmac>")),
    responses(
        (status = 200, description = "Event accepted", body = WebhookAck),
        (status = 400, description = "Event lacks payment metadata"),
        (status = 401, description = "Missing, invalid or expired signature"),
        (status = 503, description = "Webhook secret not configured"),
    )
)]
pub async fn webhook_handler(
    State(state): State<AppState>,
    ConnectInfo(from): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let signature = headers
        .get(payments::SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    let event = payments::verify(
        &body,
        signature,
        &state.conf.stripe.webhook_secret,
        state.conf.stripe.tolerance,
        SystemTime::now(),
    )
    .inspect_err(|error| {
        tracing::warn!(?from, ?error, "Rejected webhook.");
    })?;
    tracing::info!(?from, id = event.id, kind = event.kind, "Webhook received.");
    let outcome = match payments::handle(&state.storage, &event).await?? {
        Handled::Credited { .. } => "credited",
        Handled::Duplicate { .. } => "duplicate",
        Handled::Ignored { .. } => "ignored",
    };
    Ok(Json(WebhookAck {
        received: true,
        outcome: outcome.to_string(),
    }))
}

/// The caller, unless it authenticated with an API key.
fn user_session() -> Result<Caller, ApiError> {
    let caller = USER.get();
    if caller.key.is_some() {
        tracing::warn!("API key attempted a session-only operation.");
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "API keys cannot manage API keys.",
        ));
    }
    Ok(caller)
}

fn admin() -> Result<Caller, ApiError> {
    let caller = user_session()?;
    if caller.role != Role::Admin {
        tracing::warn!(role = ?caller.role, "Non-admin attempted admin operation.");
        return Err(StatusCode::FORBIDDEN.into());
    }
    Ok(caller)
}

#[derive(Debug, Clone)]
pub struct ReqId {
    pub req_id: String,
}

impl ReqId {
    fn new() -> Self {
        let req_id = cuid2::create_id();
        Self { req_id }
    }
}

tokio::task_local! {
    pub static USER: Caller;
    pub static REQ_ID: ReqId;
}

async fn req_id_layer(req: Request, next: Next) -> Response {
    REQ_ID.scope(ReqId::new(), next.run(req)).await
}

async fn auth_layer(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let caller = authenticate(&state, req.headers()).await?;
    if state
        .storage
        .ensure_user(&caller.uid, state.conf.ledger.signup_credits)
        .await?
    {
        tracing::info!(uid = caller.uid, "First request from new user.");
    }
    tracing::debug!(uid = caller.uid, role = ?caller.role, key_id = caller.key_id(), "Authenticated.");
    Ok(USER.scope(caller, next.run(req)).await)
}

/// An `X-API-Key` header takes precedence over a bearer token.
async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Caller, ApiError> {
    if let Some(key) = headers.get(keys::HEADER) {
        let key = key.to_str().map_err(|error| {
            tracing::warn!(?error, "Invalid API key header encoding.");
            StatusCode::UNAUTHORIZED
        })?;
        let row = keys::authenticate(&state.storage, key)
            .await?
            .ok_or_else(|| {
                tracing::warn!(
                    prefix = ?key.get(..9).unwrap_or(""),
                    "Unknown or revoked API key."
                );
                StatusCode::UNAUTHORIZED
            })?;
        return Ok(Caller {
            key: Some(KeyScope {
                allowed_tools: row.allowed_tools()?,
                key_id: row.id,
            }),
            ..Caller::user(&row.uid, Role::User)
        });
    }

    let auth_token = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| {
            tracing::warn!("Missing credentials.");
            StatusCode::UNAUTHORIZED
        })?
        .to_str()
        .map_err(|error| {
            tracing::warn!(?error, "Invalid Authorization header encoding.");
            StatusCode::UNAUTHORIZED
        })?
        .strip_prefix("Bearer ")
        .ok_or_else(|| {
            tracing::warn!("Authorization header missing 'Bearer ' prefix.");
            StatusCode::UNAUTHORIZED
        })?;
    authorize(auth_token, &state.conf.jwt).ok_or_else(|| StatusCode::UNAUTHORIZED.into())
}

fn authorize(auth_token: &str, jwt_conf: &conf::ConfJwt) -> Option<Caller> {
    auth::Claims::from_str(auth_token, jwt_conf)
        .inspect_err(|error| {
            tracing::warn!(
                ?error,
                token_prefix = ?auth_token.get(..10).unwrap_or(""),
                "JWT validation failed."
            );
        })
        .ok()
        .filter(|claims| !claims.sub.is_empty())
        .map(|claims| Caller::user(&claims.sub, claims.role))
}
