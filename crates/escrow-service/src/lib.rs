#![deny(unsafe_code)]

pub mod queue;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use escrow_adapters::{MockPaymentProcessor, TracingNotificationSink};
use escrow_core::{
    ActionOutcome, Actor, ActorRole, AllocationSummary, Escrow, EscrowDraft, EscrowError,
    FundingOutcome, JournalEntry, Milestone, MilestoneAction, MilestoneDraft, MilestonePatch,
    NotificationSink, PaymentProcessor, PendingRelease, ReleaseDisposition, RetryReport,
    ScheduledRelease, TickReport, WorkflowConfig, WorkflowOrchestrator,
};
use queue::{PersistedReleaseQueue, QueueError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";
/// Shared secret presented by the payment processor and operators.
pub const SERVICE_TOKEN_HEADER: &str = "x-service-token";

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub queue_path: PathBuf,
    pub tick_interval: Duration,
    /// Required on funding callbacks and release listings. `None` disables those routes.
    pub service_token: Option<String>,
    pub workflow: WorkflowConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            queue_path: PathBuf::from("escrow/data/releases.json"),
            tick_interval: Duration::from_secs(60),
            service_token: None,
            workflow: WorkflowConfig::default(),
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub orchestrator: Arc<WorkflowOrchestrator>,
    pub queue: Arc<Mutex<PersistedReleaseQueue>>,
    service_token: Option<blake3::Hash>,
}

impl ServiceState {
    /// Bootstrap with the mock processor and log-only notifications.
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        Self::bootstrap_with(
            config,
            Arc::new(MockPaymentProcessor::new()),
            Arc::new(TracingNotificationSink),
        )
        .await
    }

    pub async fn bootstrap_with(
        config: ServiceConfig,
        processor: Arc<dyn PaymentProcessor>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self, ServiceError> {
        let ServiceConfig {
            queue_path,
            service_token,
            workflow,
            ..
        } = config;
        let orchestrator = WorkflowOrchestrator::bootstrap(workflow, processor, notifier).await?;
        let queue = PersistedReleaseQueue::load(queue_path)?;
        orchestrator.restore_pending_releases(queue.list()).await;

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            queue: Arc::new(Mutex::new(queue)),
            service_token: service_token
                .as_deref()
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(|token| blake3::hash(token.as_bytes())),
        })
    }

    /// Admit processor callbacks and operator reads. Fails closed when no token is configured.
    fn authorize_service(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let Some(expected) = self.service_token else {
            return Err(ApiError::forbidden("service endpoints are disabled"));
        };
        let presented = headers
            .get(SERVICE_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ApiError::forbidden(format!("missing {SERVICE_TOKEN_HEADER} header")))?;

        // blake3::Hash equality is constant-time.
        if blake3::hash(presented.trim().as_bytes()) != expected {
            warn!("rejected service request with an unknown token");
            return Err(ApiError::forbidden("invalid service token"));
        }
        Ok(())
    }

    /// Write the live retry queue to the queue file.
    pub async fn sync_queue(&self) -> Result<(), QueueError> {
        let entries = self.orchestrator.pending_releases().await;
        self.queue.lock().await.replace(entries)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackgroundReport {
    pub tick: TickReport,
    pub retries: RetryReport,
}

/// One scheduler pass: auto-approve overdue milestones, then retry due releases.
pub async fn run_background_pass(
    state: &ServiceState,
    now: DateTime<Utc>,
) -> Result<BackgroundReport, ServiceError> {
    let tick = state.orchestrator.tick(now).await;
    let retries = state.orchestrator.retry_releases(now).await;
    state.sync_queue().await?;
    Ok(BackgroundReport { tick, retries })
}

pub fn spawn_scheduler(state: ServiceState, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match run_background_pass(&state, Utc::now()).await {
                Ok(report) => debug!(
                    auto_approved = report.tick.auto_approved.len(),
                    released = report.retries.released.len(),
                    rescheduled = report.retries.rescheduled.len(),
                    "background pass complete"
                ),
                Err(err) => warn!(error = %err, "background pass failed"),
            }
        }
    })
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/escrows", post(create_escrow))
        .route("/v1/escrows/:escrow_id", get(get_escrow))
        .route(
            "/v1/escrows/:escrow_id/milestones",
            get(list_milestones).post(add_milestone),
        )
        .route(
            "/v1/escrows/:escrow_id/milestones/:milestone_id",
            patch(update_milestone).delete(remove_milestone),
        )
        .route("/v1/escrows/:escrow_id/allocation", get(allocation_summary))
        .route("/v1/escrows/:escrow_id/distribute", post(distribute_evenly))
        .route("/v1/escrows/:escrow_id/funding", post(record_funding))
        .route("/v1/milestones/:milestone_id", get(get_milestone))
        .route("/v1/milestones/:milestone_id/actions", post(execute_action))
        .route("/v1/milestones/:milestone_id/journal", get(milestone_journal))
        .route("/v1/releases/pending", get(pending_releases))
        .route("/v1/releases/scheduled", get(scheduled_releases))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Resolve the caller asserted by the identity gateway. Fails closed.
pub fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, ApiError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    let actor_id = header(ACTOR_ID_HEADER)
        .ok_or_else(|| ApiError::forbidden(format!("missing {ACTOR_ID_HEADER} header")))?;
    let role = match header(ACTOR_ROLE_HEADER) {
        Some("payer") => ActorRole::Payer,
        Some("payee") => ActorRole::Payee,
        Some(other) => {
            return Err(ApiError::forbidden(format!(
                "role '{other}' cannot be asserted by callers"
            )))
        }
        None => {
            return Err(ApiError::forbidden(format!(
                "missing {ACTOR_ROLE_HEADER} header"
            )))
        }
    };

    Ok(Actor {
        actor_id: actor_id.to_string(),
        role,
    })
}

/// JSON body extractor whose rejections use the service error body.
#[derive(Debug, FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("escrow core error: {0}")]
    Core(#[from] EscrowError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http {
        status: StatusCode,
        code: &'static str,
        message: String,
    },
    #[error(transparent)]
    Core(#[from] EscrowError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl ApiError {
    fn forbidden(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::FORBIDDEN,
            code: "forbidden",
            message: message.into(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            code: "validation_error",
            message: rejection.body_text(),
        }
    }
}

fn status_for(err: &EscrowError) -> StatusCode {
    match err {
        EscrowError::Validation(_) => StatusCode::BAD_REQUEST,
        EscrowError::Forbidden(_) => StatusCode::FORBIDDEN,
        EscrowError::NotFound(_) => StatusCode::NOT_FOUND,
        EscrowError::InvalidState { .. }
        | EscrowError::InvalidTransition { .. }
        | EscrowError::Conflict(_) => StatusCode::CONFLICT,
        EscrowError::Allocation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EscrowError::ExternalTransfer { .. } => StatusCode::BAD_GATEWAY,
        EscrowError::Storage(_) | EscrowError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Http {
                status,
                code,
                message,
            } => (status, code, message),
            ApiError::Core(err) => (status_for(&err), err.code(), err.to_string()),
            ApiError::Queue(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "queue_error",
                err.to_string(),
            ),
        };
        (
            status,
            Json(serde_json::json!({ "error": message, "code": code })),
        )
            .into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage_backend: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "escrow-service",
        storage_backend: state.orchestrator.storage_backend().await,
    })
}

async fn create_escrow(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    ApiJson(draft): ApiJson<EscrowDraft>,
) -> Result<(StatusCode, Json<Escrow>), ApiError> {
    let actor = actor_from_headers(&headers)?;
    if actor.role != ActorRole::Payer || actor.actor_id != draft.payer_id.trim() {
        return Err(ApiError::forbidden(
            "only the paying party can open an escrow",
        ));
    }
    let escrow = state.orchestrator.create_escrow(draft).await?;
    Ok((StatusCode::CREATED, Json(escrow)))
}

async fn get_escrow(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(escrow_id): Path<String>,
) -> Result<Json<Escrow>, ApiError> {
    let actor = actor_from_headers(&headers)?;
    Ok(Json(state.orchestrator.escrow(&actor, &escrow_id).await?))
}

#[derive(Debug, Clone, Serialize)]
struct MilestoneListResponse {
    escrow_id: String,
    items: Vec<Milestone>,
}

async fn list_milestones(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(escrow_id): Path<String>,
) -> Result<Json<MilestoneListResponse>, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let items = state
        .orchestrator
        .list_milestones(&actor, &escrow_id)
        .await?;
    Ok(Json(MilestoneListResponse { escrow_id, items }))
}

async fn add_milestone(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(escrow_id): Path<String>,
    ApiJson(draft): ApiJson<MilestoneDraft>,
) -> Result<(StatusCode, Json<Milestone>), ApiError> {
    let actor = actor_from_headers(&headers)?;
    let milestone = state
        .orchestrator
        .add_milestone(&actor, &escrow_id, draft)
        .await?;
    Ok((StatusCode::CREATED, Json(milestone)))
}

async fn update_milestone(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path((escrow_id, milestone_id)): Path<(String, String)>,
    ApiJson(patch): ApiJson<MilestonePatch>,
) -> Result<Json<Milestone>, ApiError> {
    let actor = actor_from_headers(&headers)?;
    Ok(Json(
        state
            .orchestrator
            .update_milestone(&actor, &escrow_id, &milestone_id, patch)
            .await?,
    ))
}

async fn remove_milestone(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path((escrow_id, milestone_id)): Path<(String, String)>,
) -> Result<Json<Milestone>, ApiError> {
    let actor = actor_from_headers(&headers)?;
    Ok(Json(
        state
            .orchestrator
            .remove_milestone(&actor, &escrow_id, &milestone_id)
            .await?,
    ))
}

async fn allocation_summary(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(escrow_id): Path<String>,
) -> Result<Json<AllocationSummary>, ApiError> {
    let actor = actor_from_headers(&headers)?;
    Ok(Json(
        state
            .orchestrator
            .allocation_summary(&actor, &escrow_id)
            .await?,
    ))
}

async fn distribute_evenly(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(escrow_id): Path<String>,
) -> Result<Json<MilestoneListResponse>, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let items = state
        .orchestrator
        .distribute_evenly(&actor, &escrow_id)
        .await?;
    Ok(Json(MilestoneListResponse { escrow_id, items }))
}

#[derive(Debug, Clone, Deserialize)]
struct FundingRequest {
    amount_minor: u64,
}

/// Processor callback for cleared funds; not an actor-driven operation.
async fn record_funding(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(escrow_id): Path<String>,
    ApiJson(request): ApiJson<FundingRequest>,
) -> Result<Json<FundingOutcome>, ApiError> {
    state.authorize_service(&headers)?;
    Ok(Json(
        state
            .orchestrator
            .record_funding(&escrow_id, request.amount_minor)
            .await?,
    ))
}

async fn get_milestone(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(milestone_id): Path<String>,
) -> Result<Json<Milestone>, ApiError> {
    let actor = actor_from_headers(&headers)?;
    Ok(Json(
        state.orchestrator.milestone(&actor, &milestone_id).await?,
    ))
}

async fn execute_action(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(milestone_id): Path<String>,
    ApiJson(action): ApiJson<MilestoneAction>,
) -> Result<Json<ActionOutcome>, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let outcome = state
        .orchestrator
        .execute(&actor, &milestone_id, &action)
        .await?;

    if matches!(
        outcome.release,
        Some(ReleaseDisposition::RetryScheduled { .. })
    ) {
        state.sync_queue().await?;
    }
    if outcome.applied {
        info!(
            milestone_id = %milestone_id,
            status = %outcome.milestone.status,
            "action accepted"
        );
    }
    Ok(Json(outcome))
}

#[derive(Debug, Clone, Serialize)]
struct JournalResponse {
    milestone_id: String,
    items: Vec<JournalEntry>,
}

async fn milestone_journal(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(milestone_id): Path<String>,
) -> Result<Json<JournalResponse>, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let items = state
        .orchestrator
        .journal_entries(&actor, &milestone_id)
        .await?;
    Ok(Json(JournalResponse {
        milestone_id,
        items,
    }))
}

#[derive(Debug, Clone, Serialize)]
struct PendingReleasesResponse {
    escalated: usize,
    items: Vec<PendingRelease>,
}

async fn pending_releases(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<PendingReleasesResponse>, ApiError> {
    state.authorize_service(&headers)?;
    let items = state.orchestrator.pending_releases().await;
    Ok(Json(PendingReleasesResponse {
        escalated: items.iter().filter(|entry| entry.escalated).count(),
        items,
    }))
}

#[derive(Debug, Clone, Serialize)]
struct ScheduledReleasesResponse {
    items: Vec<ScheduledRelease>,
}

async fn scheduled_releases(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ScheduledReleasesResponse>, ApiError> {
    state.authorize_service(&headers)?;
    Ok(Json(ScheduledReleasesResponse {
        items: state.orchestrator.scheduled_releases().await,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use escrow_adapters::AlwaysFailProcessor;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    const PAYER: (&str, &str) = ("client-7", "payer");
    const PAYEE: (&str, &str) = ("pro-3", "payee");
    const SERVICE_TOKEN: &str = "processor-secret";

    fn temp_queue(label: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("escrow-service-{label}-{}", Uuid::new_v4()))
            .join("releases.json")
    }

    async fn app_with(queue_path: PathBuf, processor: Arc<dyn PaymentProcessor>) -> Router {
        let state = ServiceState::bootstrap_with(
            ServiceConfig {
                queue_path,
                service_token: Some(SERVICE_TOKEN.to_string()),
                ..ServiceConfig::default()
            },
            processor,
            Arc::new(TracingNotificationSink),
        )
        .await
        .unwrap();
        build_router(state)
    }

    async fn app(label: &str) -> Router {
        app_with(temp_queue(label), Arc::new(MockPaymentProcessor::new())).await
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        actor: Option<(&str, &str)>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some((actor_id, role)) = actor {
            request = request
                .header(ACTOR_ID_HEADER, actor_id)
                .header(ACTOR_ROLE_HEADER, role);
        }
        dispatch(app, request, body).await
    }

    async fn send_service(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(SERVICE_TOKEN_HEADER, SERVICE_TOKEN);
        dispatch(app, request, body).await
    }

    async fn dispatch(
        app: &Router,
        request: axum::http::request::Builder,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    /// Escrow of 25,000 with three evenly split milestones, fully funded.
    async fn funded_escrow(app: &Router) -> (String, Vec<String>) {
        let (status, escrow) = send(
            app,
            "POST",
            "/v1/escrows",
            Some(PAYER),
            Some(json!({
                "payer_id": "client-7",
                "payee_id": "pro-3",
                "payee_account": "acct-pro-3",
                "currency": "INR",
                "total_minor": 25_000
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let escrow_id = escrow["escrow_id"].as_str().unwrap().to_string();

        for title in ["Research", "Design", "Build"] {
            let (status, _) = send(
                app,
                "POST",
                &format!("/v1/escrows/{escrow_id}/milestones"),
                Some(PAYER),
                Some(json!({ "title": title })),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, split) = send(
            app,
            "POST",
            &format!("/v1/escrows/{escrow_id}/distribute"),
            Some(PAYER),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let amounts: Vec<u64> = split["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["amount_minor"].as_u64().unwrap())
            .collect();
        assert_eq!(amounts, vec![8_333, 8_333, 8_334]);

        let (status, funding) = send_service(
            app,
            "POST",
            &format!("/v1/escrows/{escrow_id}/funding"),
            Some(json!({ "amount_minor": 25_000 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let ids = funding["funded_milestones"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["milestone_id"].as_str().unwrap().to_string())
            .collect();
        (escrow_id, ids)
    }

    async fn act(app: &Router, milestone_id: &str, actor: (&str, &str), body: Value) -> (StatusCode, Value) {
        send(
            app,
            "POST",
            &format!("/v1/milestones/{milestone_id}/actions"),
            Some(actor),
            Some(body),
        )
        .await
    }

    #[tokio::test]
    async fn milestone_lifecycle_over_http() {
        let app = app("lifecycle").await;
        let (escrow_id, ids) = funded_escrow(&app).await;
        let first = &ids[0];

        let (status, _) = act(&app, first, PAYEE, json!({ "action": "start_work" })).await;
        assert_eq!(status, StatusCode::OK);
        let (status, submitted) = act(&app, first, PAYEE, json!({ "action": "submit_work" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(submitted["milestone"]["status"], "work_submitted");

        let (_, scheduled) = send_service(&app, "GET", "/v1/releases/scheduled", None).await;
        assert_eq!(scheduled["items"].as_array().unwrap().len(), 1);

        let (status, approved) = act(
            &app,
            first,
            PAYER,
            json!({ "action": "approve", "rating": 5, "feedback": "Great work" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(approved["applied"], true);
        assert_eq!(approved["milestone"]["status"], "released");
        assert_eq!(approved["release"]["status"], "released");

        let (status, list) = send(
            &app,
            "GET",
            &format!("/v1/escrows/{escrow_id}/milestones"),
            Some(PAYEE),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let statuses: Vec<&str> = list["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["status"].as_str().unwrap())
            .collect();
        assert_eq!(statuses, vec!["released", "funded", "funded"]);

        let (_, allocation) = send(
            &app,
            "GET",
            &format!("/v1/escrows/{escrow_id}/allocation"),
            Some(PAYER),
            None,
        )
        .await;
        assert_eq!(allocation["allocated_minor"], 25_000);
        assert_eq!(allocation["released_minor"], 8_333);

        let (status, journal) = send(
            &app,
            "GET",
            &format!("/v1/milestones/{first}/journal"),
            Some(PAYER),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(journal["items"].as_array().unwrap().len() >= 4);
    }

    #[tokio::test]
    async fn missing_or_system_identity_fails_closed() {
        let app = app("identity").await;
        let (_, ids) = funded_escrow(&app).await;

        let (status, body) = send(
            &app,
            "POST",
            &format!("/v1/milestones/{}/actions", ids[0]),
            None,
            Some(json!({ "action": "start_work" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "forbidden");

        let (status, _) = act(&app, &ids[0], ("system", "system"), json!({ "action": "start_work" })).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = act(&app, &ids[0], PAYER, json!({ "action": "start_work" })).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = act(&app, &ids[0], PAYER, json!({ "action": "auto_approve" })).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "forbidden");
    }

    #[tokio::test]
    async fn out_of_order_and_invalid_payloads_map_to_typed_errors() {
        let app = app("errors").await;
        let (_, ids) = funded_escrow(&app).await;

        let (status, body) = act(&app, &ids[0], PAYEE, json!({ "action": "submit_work" })).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "invalid_transition");

        act(&app, &ids[0], PAYEE, json!({ "action": "start_work" })).await;
        act(&app, &ids[0], PAYEE, json!({ "action": "submit_work" })).await;
        let (status, body) =
            act(&app, &ids[0], PAYER, json!({ "action": "approve", "rating": 0 })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "validation_error");

        for rating in [json!(300), json!(-1), json!("five")] {
            let (status, body) = act(
                &app,
                &ids[0],
                PAYER,
                json!({ "action": "approve", "rating": rating.clone() }),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "rating {rating}");
            assert_eq!(body["code"], "validation_error");
        }

        let (_, milestone) = send(
            &app,
            "GET",
            &format!("/v1/milestones/{}", ids[0]),
            Some(PAYEE),
            None,
        )
        .await;
        assert_eq!(milestone["status"], "work_submitted");
    }

    #[tokio::test]
    async fn processor_and_operator_routes_require_the_service_token() {
        let app = app("service-token").await;
        let (escrow_id, _) = funded_escrow(&app).await;
        let funding = format!("/v1/escrows/{escrow_id}/funding");

        let (status, body) = send(
            &app,
            "POST",
            &funding,
            None,
            Some(json!({ "amount_minor": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "forbidden");

        let (status, _) = send(
            &app,
            "POST",
            &funding,
            Some(PAYER),
            Some(json!({ "amount_minor": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let wrong_token = Request::builder()
            .method("GET")
            .uri("/v1/releases/pending")
            .header(SERVICE_TOKEN_HEADER, "guess");
        let (status, _) = dispatch(&app, wrong_token, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        for uri in ["/v1/releases/pending", "/v1/releases/scheduled"] {
            let (status, _) = send(&app, "GET", uri, None, None).await;
            assert_eq!(status, StatusCode::FORBIDDEN, "{uri}");
            let (status, _) = send_service(&app, "GET", uri, None).await;
            assert_eq!(status, StatusCode::OK, "{uri}");
        }

        let (_, escrow) = send(
            &app,
            "GET",
            &format!("/v1/escrows/{escrow_id}"),
            Some(PAYER),
            None,
        )
        .await;
        assert_eq!(escrow["funded_minor"], 25_000);
    }

    #[tokio::test]
    async fn service_routes_stay_closed_without_a_configured_token() {
        let state = ServiceState::bootstrap(ServiceConfig {
            queue_path: temp_queue("no-token"),
            ..ServiceConfig::default()
        })
        .await
        .unwrap();
        let app = build_router(state);

        let (status, _) = send_service(&app, "GET", "/v1/releases/pending", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unbalanced_plans_cannot_be_funded() {
        let app = app("allocation").await;
        let (_, escrow) = send(
            &app,
            "POST",
            "/v1/escrows",
            Some(PAYER),
            Some(json!({
                "payer_id": "client-7",
                "payee_id": "pro-3",
                "payee_account": "acct-pro-3",
                "currency": "INR",
                "total_minor": 10_000
            })),
        )
        .await;
        let escrow_id = escrow["escrow_id"].as_str().unwrap();
        send(
            &app,
            "POST",
            &format!("/v1/escrows/{escrow_id}/milestones"),
            Some(PAYER),
            Some(json!({ "title": "Only", "amount_minor": 6_000 })),
        )
        .await;

        let (status, body) = send_service(
            &app,
            "POST",
            &format!("/v1/escrows/{escrow_id}/funding"),
            Some(json!({ "amount_minor": 10_000 })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "allocation_error");

        let (status, _) = send_service(
            &app,
            "POST",
            &format!("/v1/escrows/{escrow_id}/funding"),
            Some(json!({ "amount_minor": 20_000 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn failed_release_is_queued_and_persisted() {
        let path = temp_queue("retry");
        let app = app_with(path.clone(), Arc::new(AlwaysFailProcessor::new("bank offline"))).await;
        let (_, ids) = funded_escrow(&app).await;

        act(&app, &ids[0], PAYEE, json!({ "action": "start_work" })).await;
        act(&app, &ids[0], PAYEE, json!({ "action": "submit_work" })).await;
        let (status, outcome) =
            act(&app, &ids[0], PAYER, json!({ "action": "approve", "rating": 4 })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["milestone"]["status"], "approved");
        assert_eq!(outcome["release"]["status"], "retry_scheduled");

        let (_, pending) = send_service(&app, "GET", "/v1/releases/pending", None).await;
        assert_eq!(pending["items"].as_array().unwrap().len(), 1);

        let persisted = PersistedReleaseQueue::load(&path).unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted.list()[0].attempts, 1);
    }

    #[tokio::test]
    async fn background_pass_auto_approves_overdue_work() {
        let state = ServiceState::bootstrap(ServiceConfig {
            queue_path: temp_queue("background"),
            service_token: Some(SERVICE_TOKEN.to_string()),
            ..ServiceConfig::default()
        })
        .await
        .unwrap();
        let app = build_router(state.clone());
        let (_, ids) = funded_escrow(&app).await;

        act(&app, &ids[1], PAYEE, json!({ "action": "start_work" })).await;
        act(&app, &ids[1], PAYEE, json!({ "action": "submit_work" })).await;

        let report = run_background_pass(&state, Utc::now() + chrono::Duration::days(8))
            .await
            .unwrap();
        assert_eq!(report.tick.auto_approved.len(), 1);

        let (_, milestone) = send(
            &app,
            "GET",
            &format!("/v1/milestones/{}", ids[1]),
            Some(PAYER),
            None,
        )
        .await;
        assert_eq!(milestone["status"], "released");
        assert_eq!(milestone["rating"], Value::Null);
        assert_eq!(milestone["auto_approved"], true);
    }

    #[tokio::test]
    async fn health_reports_storage_backend() {
        let app = app("health").await;
        let (status, body) = send(&app, "GET", "/v1/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["storage_backend"], "memory");
    }
}
