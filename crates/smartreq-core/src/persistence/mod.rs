// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for smartreq-core.
//!
//! This module defines the persistence abstraction and backend implementations.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::types::Json;

use crate::allocator::{SequenceKey, SequenceScope};
use crate::error::CoreError;
use crate::fanout::SubmissionPlan;
use crate::model::{NewAdvancedRequest, NewCapability, SampleInput, TestMethodInput};

/// Capability record from the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityRecord {
    /// Unique identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Two-letter request-number prefix.
    pub short_code: String,
    /// Next value of the capability-wide NTR counter.
    pub req_run_no: i64,
    /// When the capability was created.
    pub created_at: DateTime<Utc>,
}

/// Parent request record (one per capability group per submission).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    /// Unique identifier.
    pub id: String,
    /// Human-readable number, e.g. `RH-N-0326-00001`.
    pub request_number: String,
    /// Client idempotency key of the originating submission.
    pub submission_id: Option<String>,
    /// Capability this request was fanned out to.
    pub capability_id: String,
    /// Current status (see [`crate::model::RequestStatus`]).
    pub status: String,
    /// `normal` or `urgent`.
    pub priority: String,
    pub requester_name: String,
    pub requester_email: Option<String>,
    pub cost_center: Option<String>,
    /// All samples of the submission.
    pub samples: Json<Vec<SampleInput>>,
    /// Only this capability's methods.
    pub test_methods: Json<Vec<TestMethodInput>>,
    /// Urgent requests start unapproved.
    pub is_approved: bool,
    /// Requester satisfaction score (1-5), set once.
    pub evaluation_score: Option<i32>,
    pub evaluation_comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub received_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub evaluated_at: Option<DateTime<Utc>>,
}

/// Sample-test record (one per sample × method × repeat).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SampleTestRecord {
    /// Unique identifier.
    pub id: String,
    /// Parent request id.
    pub request_id: String,
    /// Parent request number.
    pub request_number: String,
    pub sample_name: String,
    /// `{sample}_{methodCode}_R{repeat_index}`.
    pub full_sample_name: String,
    pub method_id: Option<String>,
    pub method_code: String,
    pub capability_id: String,
    pub repeat_index: i32,
    pub requirements: Option<String>,
    /// Current status (see [`crate::model::SampleTestStatus`]).
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Advanced (ASR) request record.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedRequestRecord {
    pub id: String,
    /// `ASR-{YYYY}-{seq}`.
    pub request_number: String,
    pub project_name: String,
    pub requester_name: String,
    pub requester_email: Option<String>,
    pub capability_id: Option<String>,
    pub description: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Equipment reservation (ER) record.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ReservationRecord {
    pub id: String,
    /// `{code}-ER-{MM}{YY}-{seq}`.
    pub reservation_number: String,
    pub capability_id: String,
    pub equipment_id: String,
    pub requester_name: String,
    pub purpose: Option<String>,
    /// Inclusive slot start.
    pub start_at: DateTime<Utc>,
    /// Exclusive slot end.
    pub end_at: DateTime<Utc>,
    /// `reserved` or `cancelled`.
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// Validated reservation ready to be booked.
#[derive(Debug, Clone)]
pub struct ReservationSlot {
    /// Capability owning the equipment.
    pub capability: CapabilityRecord,
    pub equipment_id: String,
    pub requester_name: String,
    pub purpose: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

/// Requests written (or found) by `create_submission`, in group order.
#[derive(Debug, Clone)]
pub struct SubmissionOutcome {
    pub requests: Vec<RequestRecord>,
    /// The submission id was seen before and `requests` are the stored ones.
    pub replayed: bool,
}

/// Filter options for listing requests.
#[derive(Debug, Clone)]
pub struct ListRequestsFilter {
    /// Only requests in this status.
    pub status: Option<String>,
    /// Only requests of this capability.
    pub capability_id: Option<String>,
    /// Maximum rows to return.
    pub limit: i64,
    /// Rows to skip.
    pub offset: i64,
}

impl Default for ListRequestsFilter {
    fn default() -> Self {
        Self {
            status: None,
            capability_id: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// Persistence interface used by the request handlers.
///
/// Every method that changes more than one row does so inside a single
/// transaction. Conditional status changes return `false` when the guard
/// did not match; the caller decides which error that is.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ------------------------------------------------------------------
    // Capabilities
    // ------------------------------------------------------------------

    /// Insert a capability with its counter at 1.
    async fn create_capability(
        &self,
        capability: &NewCapability,
        now: DateTime<Utc>,
    ) -> Result<CapabilityRecord, CoreError>;

    async fn get_capability(&self, id: &str) -> Result<Option<CapabilityRecord>, CoreError>;

    async fn list_capabilities(&self) -> Result<Vec<CapabilityRecord>, CoreError>;

    // ------------------------------------------------------------------
    // Sequences
    // ------------------------------------------------------------------

    /// Atomically take the next value of a counter.
    ///
    /// Counters start at 1. The returned value is the one to use; the stored
    /// counter is left one higher.
    async fn allocate_sequence(&self, key: &SequenceKey) -> Result<i64, CoreError>;

    // ------------------------------------------------------------------
    // NTR requests
    // ------------------------------------------------------------------

    /// Allocate numbers for and write every request and sample test of a plan.
    ///
    /// All-or-nothing: on error nothing is written and no counter moves.
    /// When the plan's `submission_id` was seen before, the requests of that
    /// earlier submission are returned as a replay and nothing is written.
    async fn create_submission(
        &self,
        plan: &SubmissionPlan,
        scope: SequenceScope,
        now: DateTime<Utc>,
    ) -> Result<SubmissionOutcome, CoreError>;

    /// Requests created by an earlier submission with this id.
    async fn find_submission(&self, submission_id: &str) -> Result<Vec<RequestRecord>, CoreError>;

    async fn get_request(&self, id: &str) -> Result<Option<RequestRecord>, CoreError>;

    async fn get_request_by_number(
        &self,
        request_number: &str,
    ) -> Result<Option<RequestRecord>, CoreError>;

    /// Newest first.
    async fn list_requests(
        &self,
        filter: &ListRequestsFilter,
    ) -> Result<Vec<RequestRecord>, CoreError>;

    /// Ordered by method, repeat index, then sample.
    async fn list_sample_tests(&self, request_id: &str)
    -> Result<Vec<SampleTestRecord>, CoreError>;

    async fn get_sample_test(&self, id: &str) -> Result<Option<SampleTestRecord>, CoreError>;

    /// Set a sample test's status if it is still `expected`.
    async fn update_sample_test_status(
        &self,
        id: &str,
        expected: &str,
        status: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// `Pending Receive → in-progress`; pending children become `received`.
    async fn receive_request(&self, id: &str, now: DateTime<Utc>) -> Result<bool, CoreError>;

    /// `Pending Receive → terminated`; pending children become `terminated`.
    async fn terminate_request(&self, id: &str, now: DateTime<Utc>) -> Result<bool, CoreError>;

    /// `in-progress → completed`, only if every child is finished.
    async fn complete_request(&self, id: &str, now: DateTime<Utc>) -> Result<bool, CoreError>;

    /// Record the evaluation of a completed, not yet evaluated request.
    async fn evaluate_request(
        &self,
        id: &str,
        score: i32,
        comment: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    // ------------------------------------------------------------------
    // ASR requests
    // ------------------------------------------------------------------

    /// Allocate an ASR number and insert the request in one transaction.
    async fn create_advanced_request(
        &self,
        request: &NewAdvancedRequest,
        now: DateTime<Utc>,
    ) -> Result<AdvancedRequestRecord, CoreError>;

    async fn get_advanced_request(
        &self,
        request_number: &str,
    ) -> Result<Option<AdvancedRequestRecord>, CoreError>;

    // ------------------------------------------------------------------
    // Equipment reservations
    // ------------------------------------------------------------------

    /// Book a slot. Returns `None` when it overlaps an active reservation
    /// of the same equipment; no number is consumed in that case.
    async fn create_reservation(
        &self,
        slot: &ReservationSlot,
        now: DateTime<Utc>,
    ) -> Result<Option<ReservationRecord>, CoreError>;

    async fn get_reservation(
        &self,
        reservation_number: &str,
    ) -> Result<Option<ReservationRecord>, CoreError>;

    /// Reservations of one equipment, by start time.
    async fn list_reservations(
        &self,
        equipment_id: &str,
    ) -> Result<Vec<ReservationRecord>, CoreError>;

    /// Release an active reservation.
    async fn cancel_reservation(
        &self,
        reservation_number: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    async fn health_check_db(&self) -> Result<bool, CoreError>;
}
