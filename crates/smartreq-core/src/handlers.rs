// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request handlers for smartreq-core.
//!
//! Transport-independent entry points. Each handler validates its input,
//! loads what it needs through [`Persistence`], and enforces the status
//! rules before asking the backend for a guarded update:
//!
//! - Submissions are split by capability and written in one transaction
//! - Request lifecycle: receive, terminate, complete, evaluate
//! - Sample-test status updates (forward-only)
//! - Capabilities, advanced requests and equipment reservations

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::allocator::SequenceScope;
use crate::error::{CoreError, Result};
use crate::fanout::{self, RejectedMethod};
use crate::model::{
    NewAdvancedRequest, NewCapability, NewReservation, RequestStatus, SampleTestStatus,
    Submission,
};
use crate::persistence::{
    AdvancedRequestRecord, CapabilityRecord, ListRequestsFilter, Persistence, RequestRecord,
    ReservationRecord, ReservationSlot, SampleTestRecord,
};

/// Largest page `handle_list_requests` returns.
pub const MAX_PAGE_SIZE: i64 = 200;

/// Shared state for request handlers.
///
/// Contains the persistence backend and server metadata for health checks.
#[derive(Clone)]
pub struct HandlerState {
    /// Persistence backend.
    pub persistence: Arc<dyn Persistence>,
    /// How NTR request-number counters are scoped.
    pub sequence_scope: SequenceScope,
    /// When the server started (for uptime calculation).
    pub start_time: std::time::Instant,
    /// Server version string.
    pub version: String,
}

impl HandlerState {
    /// Create a new handler state with the given persistence backend.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            persistence,
            sequence_scope: SequenceScope::default(),
            start_time: std::time::Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Use `scope` for NTR counters.
    pub fn with_sequence_scope(mut self, scope: SequenceScope) -> Self {
        self.sequence_scope = scope;
        self
    }

    /// Get the server uptime in milliseconds.
    pub fn uptime_ms(&self) -> i64 {
        self.start_time.elapsed().as_millis() as i64
    }
}

// ============================================================================
// Request / Response Types
// ============================================================================

/// Result of an NTR submission.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequestResponse {
    /// One number per capability group, in group order.
    pub request_numbers: Vec<String>,
    /// Ids matching `request_numbers` position by position.
    pub request_ids: Vec<String>,
    /// Methods that were left out, with the reason. Empty when replayed.
    pub rejected_methods: Vec<RejectedMethod>,
}

/// Sample-test status change.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateSampleTestStatus {
    /// Target status spelling, e.g. `entry-results`.
    pub status: String,
}

/// Requester evaluation of a completed request.
#[derive(Debug, Clone, Deserialize)]
pub struct EvaluateRequest {
    /// 1 (worst) to 5 (best).
    pub score: i32,
    #[serde(default)]
    pub comment: Option<String>,
}

/// Health check result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResponse {
    pub healthy: bool,
    pub version: String,
    pub uptime_ms: i64,
}

// ============================================================================
// Helpers
// ============================================================================

async fn load_request(state: &HandlerState, request_number: &str) -> Result<RequestRecord> {
    state
        .persistence
        .get_request_by_number(request_number)
        .await?
        .ok_or_else(|| CoreError::RequestNotFound {
            reference: request_number.to_string(),
        })
}

async fn reload_request(state: &HandlerState, request: &RequestRecord) -> Result<RequestRecord> {
    state
        .persistence
        .get_request(&request.id)
        .await?
        .ok_or_else(|| CoreError::RequestNotFound {
            reference: request.request_number.clone(),
        })
}

async fn load_capability(state: &HandlerState, capability_id: &str) -> Result<CapabilityRecord> {
    state
        .persistence
        .get_capability(capability_id)
        .await?
        .ok_or_else(|| CoreError::CapabilityNotFound {
            capability_id: capability_id.to_string(),
        })
}

fn request_transition_error(request: &RequestRecord, to: RequestStatus) -> CoreError {
    CoreError::InvalidStatusTransition {
        entity: "request",
        from: request.status.clone(),
        to: to.as_str().to_string(),
    }
}

fn require_text(field: &str, value: &str, label: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CoreError::validation(field, format!("{} is required", label)));
    }
    Ok(())
}

// ============================================================================
// NTR Submission
// ============================================================================

/// Handle an NTR submission.
///
/// Splits the submission by capability, expands every group into sample-test
/// rows and persists the whole plan atomically. Re-posting a submission with
/// the same `submissionId` returns the requests created the first time.
#[instrument(
    skip(state, submission),
    fields(submission_id = ?submission.submission_id, methods = submission.test_methods.len())
)]
pub async fn handle_submit_request(
    state: &HandlerState,
    submission: Submission,
) -> Result<SubmitRequestResponse> {
    fanout::validate_submission(&submission)?;

    let mut capabilities = HashMap::new();
    for capability_id in fanout::referenced_capabilities(&submission) {
        if let Some(capability) = state.persistence.get_capability(&capability_id).await? {
            capabilities.insert(capability_id, capability);
        }
    }

    let plan = fanout::plan_submission(&submission, &capabilities)?;

    let outcome = state
        .persistence
        .create_submission(&plan, state.sequence_scope, Utc::now())
        .await?;
    let created = &outcome.requests;
    let numbers: Vec<&str> = created.iter().map(|r| r.request_number.as_str()).collect();

    // A replay answers with what was stored; the resent payload is not reported on.
    let rejected_methods = if outcome.replayed {
        info!(requests = created.len(), numbers = ?numbers, "Submission replayed");
        Vec::new()
    } else {
        if !plan.rejected.is_empty() {
            warn!(rejected = plan.rejected.len(), "Some methods were left out of the submission");
        }
        info!(
            requests = created.len(),
            sample_tests = plan.sample_test_count(),
            numbers = ?numbers,
            "Submission accepted"
        );
        plan.rejected
    };

    Ok(SubmitRequestResponse {
        request_numbers: created.iter().map(|r| r.request_number.clone()).collect(),
        request_ids: created.iter().map(|r| r.id.clone()).collect(),
        rejected_methods,
    })
}

// ============================================================================
// Request Queries
// ============================================================================

/// Get a request by its number.
#[instrument(skip(state))]
pub async fn handle_get_request(state: &HandlerState, request_number: &str) -> Result<RequestRecord> {
    load_request(state, request_number).await
}

/// List requests, newest first.
///
/// `limit` is clamped to `1..=MAX_PAGE_SIZE`; an unknown status is rejected.
#[instrument(skip(state, filter), fields(status = ?filter.status))]
pub async fn handle_list_requests(
    state: &HandlerState,
    mut filter: ListRequestsFilter,
) -> Result<Vec<RequestRecord>> {
    if let Some(status) = filter.status.as_deref() {
        status.parse::<RequestStatus>()?;
    }
    if filter.offset < 0 {
        return Err(CoreError::validation("offset", "must not be negative"));
    }
    filter.limit = filter.limit.clamp(1, MAX_PAGE_SIZE);

    state.persistence.list_requests(&filter).await
}

/// List the sample tests of a request.
#[instrument(skip(state))]
pub async fn handle_list_sample_tests(
    state: &HandlerState,
    request_number: &str,
) -> Result<Vec<SampleTestRecord>> {
    let request = load_request(state, request_number).await?;
    state.persistence.list_sample_tests(&request.id).await
}

// ============================================================================
// Request Lifecycle
// ============================================================================

/// Mark a request's samples as received.
///
/// Only `Pending Receive` requests can be received; their pending sample
/// tests move to `received`.
#[instrument(skip(state))]
pub async fn handle_receive_request(
    state: &HandlerState,
    request_number: &str,
) -> Result<RequestRecord> {
    let request = load_request(state, request_number).await?;

    if !state.persistence.receive_request(&request.id, Utc::now()).await? {
        let current = reload_request(state, &request).await?;
        return Err(request_transition_error(&current, RequestStatus::InProgress));
    }

    info!("Request received");
    reload_request(state, &request).await
}

/// Terminate a request before its samples arrive.
///
/// Once a request has been received it can no longer be terminated.
#[instrument(skip(state))]
pub async fn handle_terminate_request(
    state: &HandlerState,
    request_number: &str,
) -> Result<RequestRecord> {
    let request = load_request(state, request_number).await?;

    if !state.persistence.terminate_request(&request.id, Utc::now()).await? {
        let current = reload_request(state, &request).await?;
        return Err(request_transition_error(&current, RequestStatus::Terminated));
    }

    info!("Request terminated");
    reload_request(state, &request).await
}

/// Complete an in-progress request whose sample tests are all finished.
#[instrument(skip(state))]
pub async fn handle_complete_request(
    state: &HandlerState,
    request_number: &str,
) -> Result<RequestRecord> {
    let request = load_request(state, request_number).await?;

    if !state.persistence.complete_request(&request.id, Utc::now()).await? {
        let current = reload_request(state, &request).await?;
        if current.status == RequestStatus::InProgress.as_str() {
            let open = state
                .persistence
                .list_sample_tests(&current.id)
                .await?
                .iter()
                .filter(|row| {
                    row.status
                        .parse::<SampleTestStatus>()
                        .map(|s| !s.is_terminal())
                        .unwrap_or(true)
                })
                .count();
            warn!(open, "Request still has unfinished sample tests");
        }
        return Err(request_transition_error(&current, RequestStatus::Completed));
    }

    info!("Request completed");
    reload_request(state, &request).await
}

/// Record the requester's evaluation of a completed request.
#[instrument(skip(state, evaluation), fields(score = evaluation.score))]
pub async fn handle_evaluate_request(
    state: &HandlerState,
    request_number: &str,
    evaluation: EvaluateRequest,
) -> Result<RequestRecord> {
    if !(1..=5).contains(&evaluation.score) {
        return Err(CoreError::validation("score", "Score must be between 1 and 5"));
    }

    let request = load_request(state, request_number).await?;
    if request.evaluation_score.is_some() {
        return Err(CoreError::AlreadyEvaluated {
            request_number: request.request_number,
        });
    }
    if request.status != RequestStatus::Completed.as_str() {
        return Err(CoreError::InvalidStatusTransition {
            entity: "request",
            from: request.status,
            to: "evaluated".to_string(),
        });
    }

    let comment = evaluation.comment.as_deref().map(str::trim).filter(|c| !c.is_empty());
    let recorded = state
        .persistence
        .evaluate_request(&request.id, evaluation.score, comment, Utc::now())
        .await?;
    if !recorded {
        return Err(CoreError::AlreadyEvaluated {
            request_number: request.request_number,
        });
    }

    info!("Request evaluated");
    reload_request(state, &request).await
}

// ============================================================================
// Sample Tests
// ============================================================================

/// Move a sample test to a new status.
///
/// Progress is forward-only; `terminated` and `cancelled` are reachable
/// from any non-terminal status.
#[instrument(skip(state, update), fields(to = %update.status))]
pub async fn handle_update_sample_test_status(
    state: &HandlerState,
    sample_test_id: &str,
    update: UpdateSampleTestStatus,
) -> Result<SampleTestRecord> {
    let next: SampleTestStatus = update.status.parse()?;

    let row = state
        .persistence
        .get_sample_test(sample_test_id)
        .await?
        .ok_or_else(|| CoreError::SampleTestNotFound {
            sample_test_id: sample_test_id.to_string(),
        })?;

    let transition_error = |from: &str| CoreError::InvalidStatusTransition {
        entity: "sample test",
        from: from.to_string(),
        to: next.as_str().to_string(),
    };

    let current: SampleTestStatus = row.status.parse()?;
    if !current.can_transition_to(next) {
        return Err(transition_error(&row.status));
    }

    let updated = state
        .persistence
        .update_sample_test_status(&row.id, current.as_str(), next.as_str(), Utc::now())
        .await?;
    if !updated {
        // Someone else moved it first.
        let latest = state.persistence.get_sample_test(&row.id).await?;
        let from = latest.map(|r| r.status).unwrap_or(row.status);
        return Err(transition_error(&from));
    }

    debug!(from = %current, "Sample test status updated");

    state
        .persistence
        .get_sample_test(&row.id)
        .await?
        .ok_or_else(|| CoreError::SampleTestNotFound {
            sample_test_id: sample_test_id.to_string(),
        })
}

// ============================================================================
// Capabilities
// ============================================================================

/// Register a capability.
///
/// The short code must be two uppercase letters and not in use.
#[instrument(skip(state, capability), fields(short_code = %capability.short_code))]
pub async fn handle_create_capability(
    state: &HandlerState,
    capability: NewCapability,
) -> Result<CapabilityRecord> {
    let name = capability.name.trim();
    require_text("name", name, "Name")?;

    let short_code = capability.short_code.trim();
    if short_code.len() != 2 || !short_code.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(CoreError::validation(
            "shortCode",
            "Short code must be two uppercase letters",
        ));
    }

    let existing = state.persistence.list_capabilities().await?;
    if existing.iter().any(|c| c.short_code == short_code) {
        return Err(CoreError::validation(
            "shortCode",
            format!("Short code '{}' is already in use", short_code),
        ));
    }

    let record = state
        .persistence
        .create_capability(
            &NewCapability {
                name: name.to_string(),
                short_code: short_code.to_string(),
            },
            Utc::now(),
        )
        .await?;

    info!(capability_id = %record.id, "Capability created");
    Ok(record)
}

/// List all capabilities.
#[instrument(skip(state))]
pub async fn handle_list_capabilities(state: &HandlerState) -> Result<Vec<CapabilityRecord>> {
    state.persistence.list_capabilities().await
}

// ============================================================================
// Advanced Requests (ASR)
// ============================================================================

/// Create an advanced request with the next `ASR-{YYYY}-{seq}` number.
#[instrument(skip(state, request), fields(project = %request.project_name))]
pub async fn handle_create_advanced_request(
    state: &HandlerState,
    request: NewAdvancedRequest,
) -> Result<AdvancedRequestRecord> {
    require_text("projectName", &request.project_name, "Project name")?;
    require_text("requesterName", &request.requester_name, "Requester name")?;

    if let Some(capability_id) = request.capability_id.as_deref() {
        load_capability(state, capability_id).await?;
    }

    let record = state
        .persistence
        .create_advanced_request(&request, Utc::now())
        .await?;

    info!(request_number = %record.request_number, "Advanced request created");
    Ok(record)
}

// ============================================================================
// Equipment Reservations (ER)
// ============================================================================

/// Book equipment for `[start_at, end_at)`.
///
/// Times are truncated to whole seconds. Overlapping an active reservation
/// of the same equipment is a conflict and consumes no number.
#[instrument(skip(state, reservation), fields(equipment_id = %reservation.equipment_id))]
pub async fn handle_create_reservation(
    state: &HandlerState,
    reservation: NewReservation,
) -> Result<ReservationRecord> {
    require_text("equipmentId", &reservation.equipment_id, "Equipment id")?;
    require_text("requesterName", &reservation.requester_name, "Requester name")?;

    let start_at = reservation.start_at.trunc_subsecs(0);
    let end_at = reservation.end_at.trunc_subsecs(0);
    if end_at <= start_at {
        return Err(CoreError::validation("endAt", "End must be after start"));
    }

    let capability = load_capability(state, &reservation.capability_id).await?;
    let slot = ReservationSlot {
        capability,
        equipment_id: reservation.equipment_id.trim().to_string(),
        requester_name: reservation.requester_name.trim().to_string(),
        purpose: reservation.purpose,
        start_at,
        end_at,
    };

    let record = state
        .persistence
        .create_reservation(&slot, Utc::now())
        .await?
        .ok_or_else(|| CoreError::ReservationConflict {
            equipment_id: slot.equipment_id.clone(),
        })?;

    info!(reservation_number = %record.reservation_number, "Equipment reserved");
    Ok(record)
}

/// Cancel an active reservation.
#[instrument(skip(state))]
pub async fn handle_cancel_reservation(
    state: &HandlerState,
    reservation_number: &str,
) -> Result<ReservationRecord> {
    let not_found = || CoreError::RequestNotFound {
        reference: reservation_number.to_string(),
    };

    let reservation = state
        .persistence
        .get_reservation(reservation_number)
        .await?
        .ok_or_else(not_found)?;

    if !state
        .persistence
        .cancel_reservation(reservation_number, Utc::now())
        .await?
    {
        return Err(CoreError::InvalidStatusTransition {
            entity: "reservation",
            from: reservation.status,
            to: crate::model::reservation_status::CANCELLED.to_string(),
        });
    }

    info!("Reservation cancelled");
    state
        .persistence
        .get_reservation(reservation_number)
        .await?
        .ok_or_else(not_found)
}

/// Reservations of one piece of equipment, cancelled ones included.
#[instrument(skip(state))]
pub async fn handle_list_reservations(
    state: &HandlerState,
    equipment_id: &str,
) -> Result<Vec<ReservationRecord>> {
    require_text("equipmentId", equipment_id, "Equipment id")?;
    state.persistence.list_reservations(equipment_id.trim()).await
}

// ============================================================================
// Health Check
// ============================================================================

/// Handle health check request.
///
/// Reports database connectivity, server version and uptime.
#[instrument(skip(state))]
pub async fn handle_health_check(state: &HandlerState) -> Result<HealthCheckResponse> {
    debug!("Health check requested");

    let healthy = state.persistence.health_check_db().await.unwrap_or(false);

    Ok(HealthCheckResponse {
        healthy,
        version: state.version.clone(),
        uptime_ms: state.uptime_ms(),
    })
}
