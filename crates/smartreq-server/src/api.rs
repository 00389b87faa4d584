// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP routes and the JSON envelope.
//!
//! Successful responses are `{"success": true, "data": ...}`; failures are
//! `{"success": false, "error": message, "code": CODE}` with the status
//! picked from the error's [`ErrorKind`].

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use smartreq_core::error::{CoreError, ErrorKind};
use smartreq_core::handlers::{self, EvaluateRequest, HandlerState, UpdateSampleTestStatus};
use smartreq_core::model::{NewAdvancedRequest, NewCapability, NewReservation, Submission};
use smartreq_core::persistence::ListRequestsFilter;

/// Shared router state.
pub type AppState = Arc<HandlerState>;

// ============================================================================
// Envelope
// ============================================================================

#[derive(Serialize)]
struct Success<T> {
    success: bool,
    data: T,
}

#[derive(Serialize)]
struct Failure {
    success: bool,
    error: String,
    code: &'static str,
}

fn respond<T: Serialize>(status: StatusCode, data: T) -> Response {
    (status, Json(Success { success: true, data })).into_response()
}

/// A [`CoreError`] on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(CoreError::validation("body", rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(CoreError::validation("query", rejection.body_text()))
    }
}

/// HTTP status for an error class.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Invalid => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind());
        if status.is_server_error() {
            error!(error = %self.0, code = self.0.error_code(), "Request failed");
        } else {
            warn!(error = %self.0, code = self.0.error_code(), "Request rejected");
        }

        let body = Failure {
            success: false,
            error: self.0.to_string(),
            code: self.0.error_code(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

// ============================================================================
// Router
// ============================================================================

/// Build the API router over `state`.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/capabilities",
            get(list_capabilities).post(create_capability),
        )
        .route("/api/requests", get(list_requests).post(submit_request))
        .route("/api/requests/{number}", get(get_request))
        .route("/api/requests/{number}/sample-tests", get(list_sample_tests))
        .route("/api/requests/{number}/receive", post(receive_request))
        .route("/api/requests/{number}/terminate", post(terminate_request))
        .route("/api/requests/{number}/complete", post(complete_request))
        .route("/api/requests/{number}/evaluate", post(evaluate_request))
        .route("/api/sample-tests/{id}", patch(update_sample_test))
        .route("/api/asr", post(create_advanced_request))
        .route(
            "/api/reservations",
            get(list_reservations).post(create_reservation),
        )
        .route("/api/reservations/{number}/cancel", post(cancel_reservation))
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(state): State<AppState>) -> ApiResult {
    let health = handlers::handle_health_check(&state).await?;
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(respond(status, health))
}

async fn list_capabilities(State(state): State<AppState>) -> ApiResult {
    let capabilities = handlers::handle_list_capabilities(&state).await?;
    Ok(respond(StatusCode::OK, capabilities))
}

async fn create_capability(
    State(state): State<AppState>,
    payload: Result<Json<NewCapability>, JsonRejection>,
) -> ApiResult {
    let Json(capability) = payload?;
    let record = handlers::handle_create_capability(&state, capability).await?;
    Ok(respond(StatusCode::CREATED, record))
}

async fn submit_request(
    State(state): State<AppState>,
    payload: Result<Json<Submission>, JsonRejection>,
) -> ApiResult {
    let Json(submission) = payload?;
    let response = handlers::handle_submit_request(&state, submission).await?;
    Ok(respond(StatusCode::CREATED, response))
}

/// Query string of `GET /api/requests`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRequestsParams {
    pub status: Option<String>,
    pub capability_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl From<ListRequestsParams> for ListRequestsFilter {
    fn from(params: ListRequestsParams) -> Self {
        let defaults = ListRequestsFilter::default();
        Self {
            status: params.status,
            capability_id: params.capability_id,
            limit: params.limit.unwrap_or(defaults.limit),
            offset: params.offset.unwrap_or(defaults.offset),
        }
    }
}

async fn list_requests(
    State(state): State<AppState>,
    params: Result<Query<ListRequestsParams>, QueryRejection>,
) -> ApiResult {
    let Query(params) = params?;
    let requests = handlers::handle_list_requests(&state, params.into()).await?;
    Ok(respond(StatusCode::OK, requests))
}

async fn get_request(State(state): State<AppState>, Path(number): Path<String>) -> ApiResult {
    let request = handlers::handle_get_request(&state, &number).await?;
    Ok(respond(StatusCode::OK, request))
}

async fn list_sample_tests(
    State(state): State<AppState>,
    Path(number): Path<String>,
) -> ApiResult {
    let rows = handlers::handle_list_sample_tests(&state, &number).await?;
    Ok(respond(StatusCode::OK, rows))
}

async fn receive_request(State(state): State<AppState>, Path(number): Path<String>) -> ApiResult {
    let request = handlers::handle_receive_request(&state, &number).await?;
    Ok(respond(StatusCode::OK, request))
}

async fn terminate_request(
    State(state): State<AppState>,
    Path(number): Path<String>,
) -> ApiResult {
    let request = handlers::handle_terminate_request(&state, &number).await?;
    Ok(respond(StatusCode::OK, request))
}

async fn complete_request(
    State(state): State<AppState>,
    Path(number): Path<String>,
) -> ApiResult {
    let request = handlers::handle_complete_request(&state, &number).await?;
    Ok(respond(StatusCode::OK, request))
}

async fn evaluate_request(
    State(state): State<AppState>,
    Path(number): Path<String>,
    payload: Result<Json<EvaluateRequest>, JsonRejection>,
) -> ApiResult {
    let Json(evaluation) = payload?;
    let request = handlers::handle_evaluate_request(&state, &number, evaluation).await?;
    Ok(respond(StatusCode::OK, request))
}

async fn update_sample_test(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<UpdateSampleTestStatus>, JsonRejection>,
) -> ApiResult {
    let Json(update) = payload?;
    let row = handlers::handle_update_sample_test_status(&state, &id, update).await?;
    Ok(respond(StatusCode::OK, row))
}

async fn create_advanced_request(
    State(state): State<AppState>,
    payload: Result<Json<NewAdvancedRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = payload?;
    let record = handlers::handle_create_advanced_request(&state, request).await?;
    Ok(respond(StatusCode::CREATED, record))
}

async fn create_reservation(
    State(state): State<AppState>,
    payload: Result<Json<NewReservation>, JsonRejection>,
) -> ApiResult {
    let Json(reservation) = payload?;
    let record = handlers::handle_create_reservation(&state, reservation).await?;
    Ok(respond(StatusCode::CREATED, record))
}

/// Query string of `GET /api/reservations`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListReservationsParams {
    pub equipment_id: String,
}

async fn list_reservations(
    State(state): State<AppState>,
    params: Result<Query<ListReservationsParams>, QueryRejection>,
) -> ApiResult {
    let Query(params) = params?;
    let records = handlers::handle_list_reservations(&state, &params.equipment_id).await?;
    Ok(respond(StatusCode::OK, records))
}

async fn cancel_reservation(
    State(state): State<AppState>,
    Path(number): Path<String>,
) -> ApiResult {
    let record = handlers::handle_cancel_reservation(&state, &number).await?;
    Ok(respond(StatusCode::OK, record))
}
