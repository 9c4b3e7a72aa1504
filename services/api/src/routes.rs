use crate::infra::{AppState, ConsentRuntime};
use axum::extract::Path;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use consent_tracker::workflows::consent::{
    authorization_response, authorize, consent_router, Capability, ClassId, ContactHandle,
    InMemoryConsentStore, ParentAccount, ParentId, RepositoryError, Student, StudentId, TeacherId,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub(crate) struct TeacherPayload {
    pub(crate) full_name: String,
    #[serde(default)]
    pub(crate) contact: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ClassPayload {
    pub(crate) name: String,
    pub(crate) teacher_id: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EnrollmentPayload {
    pub(crate) full_name: String,
    #[serde(default)]
    pub(crate) parent_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RegistrationPayload {
    pub(crate) contact: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct EnrollmentResponse {
    pub(crate) student: Student,
    /// Placeholder account the parent later registers against.
    pub(crate) parent: ParentAccount,
}

pub(crate) fn with_consent_routes(runtime: &ConsentRuntime) -> Router {
    consent_router(runtime.api.clone())
        .route("/health", get(healthcheck))
        .route("/ready", get(readiness_endpoint))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/v1/admin/teachers", post(create_teacher_endpoint))
        .route("/api/v1/admin/classes", post(create_class_endpoint))
        .route(
            "/api/v1/admin/classes/:class_id/students",
            post(enroll_student_endpoint),
        )
        .route(
            "/api/v1/admin/parents/:parent_id/registration",
            put(register_parent_endpoint),
        )
        .route(
            "/api/v1/admin/parents/:parent_id/students/:student_id",
            put(link_parent_endpoint),
        )
        .layer(Extension(runtime.store.clone()))
}

pub(crate) async fn healthcheck() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn readiness_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let ready = state.readiness.load(std::sync::atomic::Ordering::Relaxed);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let payload = if ready {
        json!({ "status": "ready" })
    } else {
        json!({ "status": "initializing" })
    };

    (status, Json(payload))
}

pub(crate) async fn metrics_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

pub(crate) async fn create_teacher_endpoint(
    Extension(store): Extension<Arc<InMemoryConsentStore>>,
    headers: HeaderMap,
    Json(payload): Json<TeacherPayload>,
) -> Response {
    if let Err(err) = authorize(&headers, Capability::ManageEnrollment) {
        return authorization_response(err);
    }

    match store.add_teacher(&payload.full_name, payload.contact.map(ContactHandle)) {
        Ok(teacher) => (StatusCode::CREATED, Json(teacher)).into_response(),
        Err(err) => enrollment_error(err),
    }
}

pub(crate) async fn create_class_endpoint(
    Extension(store): Extension<Arc<InMemoryConsentStore>>,
    headers: HeaderMap,
    Json(payload): Json<ClassPayload>,
) -> Response {
    if let Err(err) = authorize(&headers, Capability::ManageEnrollment) {
        return authorization_response(err);
    }

    match store.add_class(&payload.name, TeacherId(payload.teacher_id)) {
        Ok(class) => (StatusCode::CREATED, Json(class)).into_response(),
        Err(err) => enrollment_error(err),
    }
}

pub(crate) async fn enroll_student_endpoint(
    Extension(store): Extension<Arc<InMemoryConsentStore>>,
    headers: HeaderMap,
    Path(class_id): Path<u64>,
    Json(payload): Json<EnrollmentPayload>,
) -> Response {
    if let Err(err) = authorize(&headers, Capability::ManageEnrollment) {
        return authorization_response(err);
    }

    match store.enroll_student(
        ClassId(class_id),
        &payload.full_name,
        payload.parent_name.as_deref(),
    ) {
        Ok((student, parent)) => (
            StatusCode::CREATED,
            Json(EnrollmentResponse { student, parent }),
        )
            .into_response(),
        Err(err) => enrollment_error(err),
    }
}

pub(crate) async fn register_parent_endpoint(
    Extension(store): Extension<Arc<InMemoryConsentStore>>,
    headers: HeaderMap,
    Path(parent_id): Path<u64>,
    Json(payload): Json<RegistrationPayload>,
) -> Response {
    if let Err(err) = authorize(&headers, Capability::ManageEnrollment) {
        return authorization_response(err);
    }

    match store.register_parent(ParentId(parent_id), ContactHandle(payload.contact)) {
        Ok(parent) => (StatusCode::OK, Json(parent)).into_response(),
        Err(err) => enrollment_error(err),
    }
}

pub(crate) async fn link_parent_endpoint(
    Extension(store): Extension<Arc<InMemoryConsentStore>>,
    headers: HeaderMap,
    Path((parent_id, student_id)): Path<(u64, u64)>,
) -> Response {
    if let Err(err) = authorize(&headers, Capability::ManageEnrollment) {
        return authorization_response(err);
    }

    match store.link_parent(ParentId(parent_id), StudentId(student_id)) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => enrollment_error(err),
    }
}

fn enrollment_error(err: RepositoryError) -> Response {
    let status = match err {
        RepositoryError::NotFound => StatusCode::NOT_FOUND,
        RepositoryError::Conflict => StatusCode::CONFLICT,
        RepositoryError::Unavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}
