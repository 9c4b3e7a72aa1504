use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::authorization::{ensure_capability, AuthorizationError, Capability, CallerRole};
use super::domain::{
    parse_deadline, ClassId, ConsentDraft, ConsentRequest, ConsentRequestId, DocumentRef, ParentId,
    StudentId, SubmissionRecord,
};
use super::report::ReportingAggregator;
use super::repository::{ConsentStore, NotificationSink};
use super::service::{ConsentError, ConsentLifecycleService};
use super::sweeper::{DeadlineSweeper, SweepKind};

/// Header carrying the role the upstream gateway authenticated the caller with.
pub const ROLE_HEADER: &str = "x-consent-role";

/// Everything the HTTP surface needs, shared across handlers.
pub struct ConsentApi<S, N> {
    pub service: ConsentLifecycleService<S, N>,
    pub reports: ReportingAggregator<S>,
    pub sweeper: Arc<DeadlineSweeper<S, N>>,
    /// Timezone date-only deadlines are interpreted in.
    pub reference_offset: FixedOffset,
}

/// Router builder exposing the consent lifecycle over HTTP.
pub fn consent_router<S, N>(api: Arc<ConsentApi<S, N>>) -> Router
where
    S: ConsentStore + 'static,
    N: NotificationSink + 'static,
{
    Router::new()
        .route("/api/v1/consents", post(create_handler::<S, N>))
        .route("/api/v1/consents/:consent_id", get(detail_handler::<S, N>))
        .route(
            "/api/v1/consents/:consent_id/submissions",
            post(submit_handler::<S, N>),
        )
        .route(
            "/api/v1/consents/:consent_id/report",
            get(status_report_handler::<S, N>),
        )
        .route(
            "/api/v1/classes/:class_id/consents",
            get(class_consents_handler::<S, N>),
        )
        .route(
            "/api/v1/parents/:parent_id/consents",
            get(parent_consents_handler::<S, N>),
        )
        .route(
            "/api/v1/parents/:parent_id/consents/:consent_id/submissions",
            post(parent_submit_handler::<S, N>),
        )
        .route("/api/v1/reports/fleet", get(fleet_report_handler::<S, N>))
        .route("/api/v1/sweeps/:kind", post(sweep_handler::<S, N>))
        .with_state(api)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreateConsentPayload {
    pub name: String,
    pub document: String,
    /// RFC 3339 timestamp, `YYYY-MM-DD`, or `DD.MM.YYYY`.
    pub deadline: String,
    pub class_id: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubmissionPayload {
    pub student_id: u64,
    pub document: String,
    /// Pre-extracted text; when absent the configured extractor reads the document.
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ParentSubmissionPayload {
    pub document: String,
    pub text: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct FleetQuery {
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Serialize)]
struct ConsentDetail {
    request: ConsentRequest,
    submissions: Vec<SubmissionRecord>,
}

pub(crate) async fn create_handler<S, N>(
    State(api): State<Arc<ConsentApi<S, N>>>,
    headers: HeaderMap,
    Json(payload): Json<CreateConsentPayload>,
) -> Response
where
    S: ConsentStore + 'static,
    N: NotificationSink + 'static,
{
    if let Err(err) = authorize(&headers, Capability::IssueConsent) {
        return authorization_response(err);
    }

    let deadline = match parse_deadline(&payload.deadline, &api.reference_offset) {
        Ok(deadline) => deadline,
        Err(message) => {
            let body = json!({ "error": message });
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    };

    let draft = ConsentDraft {
        name: payload.name,
        document: DocumentRef(payload.document),
        deadline,
        class_id: ClassId(payload.class_id),
    };

    let result = api.service.create_consent_request(draft).and_then(|id| {
        let request = api.service.get_consent(id)?;
        let submissions = api.service.ledger().list_by_request(id)?;
        Ok(ConsentDetail {
            request,
            submissions,
        })
    });

    match result {
        Ok(detail) => (StatusCode::CREATED, Json(detail)).into_response(),
        Err(err) => consent_error_response(err),
    }
}

pub(crate) async fn detail_handler<S, N>(
    State(api): State<Arc<ConsentApi<S, N>>>,
    headers: HeaderMap,
    Path(consent_id): Path<u64>,
) -> Response
where
    S: ConsentStore + 'static,
    N: NotificationSink + 'static,
{
    if let Err(err) = authorize(&headers, Capability::ViewStatusReport) {
        return authorization_response(err);
    }

    let id = ConsentRequestId(consent_id);
    let result = api.service.get_consent(id).and_then(|request| {
        let submissions = api.service.ledger().list_by_request(id)?;
        Ok(ConsentDetail {
            request,
            submissions,
        })
    });

    match result {
        Ok(detail) => (StatusCode::OK, Json(detail)).into_response(),
        Err(err) => consent_error_response(err),
    }
}

pub(crate) async fn submit_handler<S, N>(
    State(api): State<Arc<ConsentApi<S, N>>>,
    headers: HeaderMap,
    Path(consent_id): Path<u64>,
    Json(payload): Json<SubmissionPayload>,
) -> Response
where
    S: ConsentStore + 'static,
    N: NotificationSink + 'static,
{
    if let Err(err) = authorize(&headers, Capability::SubmitConsent) {
        return authorization_response(err);
    }

    let request_id = ConsentRequestId(consent_id);
    let student_id = StudentId(payload.student_id);
    let document = DocumentRef(payload.document);
    let result = match payload.text {
        Some(text) => api
            .service
            .submit_for_student(student_id, request_id, &text, document),
        None => api.service.submit_document(student_id, request_id, document),
    };

    match result {
        Ok(status) => {
            let body = json!({
                "consent_id": request_id,
                "student_id": student_id,
                "status": status,
            });
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => consent_error_response(err),
    }
}

pub(crate) async fn parent_submit_handler<S, N>(
    State(api): State<Arc<ConsentApi<S, N>>>,
    headers: HeaderMap,
    Path((parent_id, consent_id)): Path<(u64, u64)>,
    Json(payload): Json<ParentSubmissionPayload>,
) -> Response
where
    S: ConsentStore + 'static,
    N: NotificationSink + 'static,
{
    if let Err(err) = authorize(&headers, Capability::SubmitConsent) {
        return authorization_response(err);
    }

    let request_id = ConsentRequestId(consent_id);
    match api.service.submit_for_parent(
        ParentId(parent_id),
        request_id,
        &payload.text,
        DocumentRef(payload.document),
    ) {
        Ok(status) => {
            let body = json!({ "consent_id": request_id, "status": status });
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => consent_error_response(err),
    }
}

pub(crate) async fn status_report_handler<S, N>(
    State(api): State<Arc<ConsentApi<S, N>>>,
    headers: HeaderMap,
    Path(consent_id): Path<u64>,
) -> Response
where
    S: ConsentStore + 'static,
    N: NotificationSink + 'static,
{
    if let Err(err) = authorize(&headers, Capability::ViewStatusReport) {
        return authorization_response(err);
    }

    match api.reports.status_report(ConsentRequestId(consent_id)) {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(err) => consent_error_response(err),
    }
}

pub(crate) async fn class_consents_handler<S, N>(
    State(api): State<Arc<ConsentApi<S, N>>>,
    headers: HeaderMap,
    Path(class_id): Path<u64>,
) -> Response
where
    S: ConsentStore + 'static,
    N: NotificationSink + 'static,
{
    if let Err(err) = authorize(&headers, Capability::ViewClassConsents) {
        return authorization_response(err);
    }

    match api.service.list_consents_for_class(ClassId(class_id)) {
        Ok(requests) => (StatusCode::OK, Json(requests)).into_response(),
        Err(err) => consent_error_response(err),
    }
}

pub(crate) async fn parent_consents_handler<S, N>(
    State(api): State<Arc<ConsentApi<S, N>>>,
    headers: HeaderMap,
    Path(parent_id): Path<u64>,
) -> Response
where
    S: ConsentStore + 'static,
    N: NotificationSink + 'static,
{
    if let Err(err) = authorize(&headers, Capability::ViewOwnConsents) {
        return authorization_response(err);
    }

    match api.service.get_consents_for_parent(ParentId(parent_id)) {
        Ok(entries) => (StatusCode::OK, Json(entries)).into_response(),
        Err(err) => consent_error_response(err),
    }
}

pub(crate) async fn fleet_report_handler<S, N>(
    State(api): State<Arc<ConsentApi<S, N>>>,
    headers: HeaderMap,
    Query(query): Query<FleetQuery>,
) -> Response
where
    S: ConsentStore + 'static,
    N: NotificationSink + 'static,
{
    if let Err(err) = authorize(&headers, Capability::ViewFleetReport) {
        return authorization_response(err);
    }

    let report = match api.reports.fleet_report() {
        Ok(report) => report,
        Err(err) => return consent_error_response(err),
    };

    match query.format.as_deref() {
        Some("csv") => {
            let mut buffer = Vec::new();
            match report.write_csv(&mut buffer) {
                Ok(()) => (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
                    buffer,
                )
                    .into_response(),
                Err(err) => {
                    let body = json!({ "error": err.to_string() });
                    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
                }
            }
        }
        Some("text") => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            report.render(),
        )
            .into_response(),
        _ => (StatusCode::OK, Json(report)).into_response(),
    }
}

pub(crate) async fn sweep_handler<S, N>(
    State(api): State<Arc<ConsentApi<S, N>>>,
    headers: HeaderMap,
    Path(kind): Path<String>,
) -> Response
where
    S: ConsentStore + 'static,
    N: NotificationSink + 'static,
{
    if let Err(err) = authorize(&headers, Capability::TriggerSweep) {
        return authorization_response(err);
    }

    let kind = match kind.as_str() {
        "expiry" => SweepKind::Expiry,
        "reminders" | "reminder" => SweepKind::Reminder,
        other => {
            let body = json!({ "error": format!("unknown sweep '{other}'") });
            return (StatusCode::NOT_FOUND, Json(body)).into_response();
        }
    };

    let sweeper = Arc::clone(&api.sweeper);
    match tokio::task::spawn_blocking(move || sweeper.run(kind)).await {
        Ok(Ok(run)) => (StatusCode::OK, Json(run)).into_response(),
        Ok(Err(err)) => {
            let body = json!({ "error": err.to_string() });
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
        Err(err) => {
            let body = json!({ "error": format!("sweep task failed: {err}") });
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}

/// Resolve the caller's role from [`ROLE_HEADER`] and check it against a capability.
pub fn authorize(
    headers: &HeaderMap,
    capability: Capability,
) -> Result<CallerRole, AuthorizationError> {
    let role = match headers.get(ROLE_HEADER) {
        Some(value) => Some(
            value
                .to_str()
                .map_err(|_| AuthorizationError::UnknownRole("<non-ascii>".to_string()))?
                .parse::<CallerRole>()?,
        ),
        None => None,
    };
    ensure_capability(role, capability)
}

pub fn authorization_response(err: AuthorizationError) -> Response {
    let status = match err {
        AuthorizationError::Unauthenticated | AuthorizationError::UnknownRole(_) => {
            StatusCode::UNAUTHORIZED
        }
        AuthorizationError::Forbidden { .. } => StatusCode::FORBIDDEN,
    };
    let body = json!({ "error": err.to_string() });
    (status, Json(body)).into_response()
}

/// Map lifecycle outcomes to distinct HTTP statuses so clients can tell them apart.
pub fn consent_error_response(err: ConsentError) -> Response {
    let (status, kind) = match &err {
        ConsentError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
        ConsentError::InvalidTransition { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, "invalid_transition")
        }
        ConsentError::AlreadyFinalized { .. } => (StatusCode::CONFLICT, "already_finalized"),
        ConsentError::Persistence(_) => (StatusCode::INTERNAL_SERVER_ERROR, "persistence_failure"),
    };
    let body = json!({ "error": err.to_string(), "kind": kind });
    (status, Json(body)).into_response()
}
