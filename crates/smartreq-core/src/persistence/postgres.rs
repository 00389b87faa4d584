// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence operations for smartreq-core.
//!
//! Provides durable storage access for capabilities, request-number counters,
//! fanned-out requests and their sample tests, advanced requests and
//! equipment reservations.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::allocator::{
    Period, SequenceKey, SequenceScope, format_asr_number, format_er_number, format_ntr_number,
};
use crate::error::CoreError;
use crate::fanout::SubmissionPlan;
use crate::model::{
    ASR_INITIAL_STATUS, NewAdvancedRequest, NewCapability, RequestStatus, SampleTestStatus,
    reservation_status,
};

use super::{
    AdvancedRequestRecord, CapabilityRecord, ListRequestsFilter, Persistence, RequestRecord,
    ReservationRecord, ReservationSlot, SampleTestRecord, SubmissionOutcome,
};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const REQUEST_COLUMNS: &str = "id, request_number, submission_id, capability_id, status, priority, \
     requester_name, requester_email, cost_center, samples, test_methods, is_approved, \
     evaluation_score, evaluation_comment, created_at, received_at, terminated_at, \
     completed_at, evaluated_at";

const SAMPLE_TEST_COLUMNS: &str = "id, request_id, request_number, sample_name, full_sample_name, \
     method_id, method_code, capability_id, repeat_index, requirements, status, created_at, \
     updated_at";

const RESERVATION_COLUMNS: &str = "id, reservation_number, capability_id, equipment_id, \
     requester_name, purpose, start_at, end_at, status, created_at, cancelled_at";

// ============================================================================
// Capability Operations
// ============================================================================

/// Insert a capability with its counter at 1.
pub async fn create_capability(
    pool: &PgPool,
    capability: &NewCapability,
    now: DateTime<Utc>,
) -> Result<CapabilityRecord, CoreError> {
    let record = sqlx::query_as::<_, CapabilityRecord>(
        r#"
        INSERT INTO capabilities (id, name, short_code, req_run_no, created_at)
        VALUES ($1, $2, $3, 1, $4)
        RETURNING id, name, short_code, req_run_no, created_at
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&capability.name)
    .bind(&capability.short_code)
    .bind(now)
    .fetch_one(pool)
    .await?;

    Ok(record)
}

/// Get a capability by id.
pub async fn get_capability(pool: &PgPool, id: &str) -> Result<Option<CapabilityRecord>, CoreError> {
    let record = sqlx::query_as::<_, CapabilityRecord>(
        r#"
        SELECT id, name, short_code, req_run_no, created_at
        FROM capabilities
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// List all capabilities by short code.
pub async fn list_capabilities(pool: &PgPool) -> Result<Vec<CapabilityRecord>, CoreError> {
    let records = sqlx::query_as::<_, CapabilityRecord>(
        r#"
        SELECT id, name, short_code, req_run_no, created_at
        FROM capabilities
        ORDER BY short_code
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(records)
}

// ============================================================================
// Sequence Operations
// ============================================================================

/// Take the next value of a counter on the given connection.
///
/// The row lock taken by the update is held until the surrounding
/// transaction ends, so concurrent allocators queue behind each other.
pub async fn next_sequence(conn: &mut PgConnection, key: &SequenceKey) -> Result<i64, CoreError> {
    match key {
        SequenceKey::Capability { capability_id } => {
            let seq: Option<i64> = sqlx::query_scalar(
                r#"
                UPDATE capabilities
                SET req_run_no = req_run_no + 1
                WHERE id = $1
                RETURNING req_run_no - 1
                "#,
            )
            .bind(capability_id)
            .fetch_optional(&mut *conn)
            .await?;

            seq.ok_or_else(|| CoreError::CapabilityNotFound {
                capability_id: capability_id.clone(),
            })
        }
        SequenceKey::Scoped { scope, period } => {
            let seq: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO sequences (scope, period, next_value)
                VALUES ($1, $2, 2)
                ON CONFLICT (scope, period)
                DO UPDATE SET next_value = sequences.next_value + 1
                RETURNING next_value - 1
                "#,
            )
            .bind(scope)
            .bind(period)
            .fetch_one(&mut *conn)
            .await?;

            Ok(seq)
        }
    }
}

// ============================================================================
// Request Operations
// ============================================================================

async fn fetch_submission(
    conn: &mut PgConnection,
    submission_id: &str,
) -> Result<Vec<RequestRecord>, CoreError> {
    let records = sqlx::query_as::<_, RequestRecord>(&format!(
        "SELECT {} FROM requests WHERE submission_id = $1 ORDER BY group_index",
        REQUEST_COLUMNS
    ))
    .bind(submission_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(records)
}

/// Allocate numbers for and insert every request and sample test of a plan.
pub async fn create_submission(
    pool: &PgPool,
    plan: &SubmissionPlan,
    scope: SequenceScope,
    now: DateTime<Utc>,
) -> Result<SubmissionOutcome, CoreError> {
    let mut tx = pool.begin().await?;

    if let Some(submission_id) = plan.submission_id.as_deref() {
        // Serialize concurrent retries of the same submission.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(submission_id)
            .execute(&mut *tx)
            .await?;

        let existing = fetch_submission(&mut tx, submission_id).await?;
        if !existing.is_empty() {
            info!(
                submission_id,
                requests = existing.len(),
                "Submission already recorded, returning existing requests"
            );
            return Ok(SubmissionOutcome {
                requests: existing,
                replayed: true,
            });
        }
    }

    let period = Period::of(now);
    let mut created = Vec::with_capacity(plan.groups.len());

    for (group_index, group) in (0i32..).zip(&plan.groups) {
        let capability = &group.capability;
        let seq = next_sequence(&mut tx, &SequenceKey::ntr(scope, &capability.id, period)).await?;
        let request_number = format_ntr_number(&capability.short_code, plan.priority, period, seq);

        let request = sqlx::query_as::<_, RequestRecord>(&format!(
            r#"
            INSERT INTO requests (
                id, request_number, submission_id, group_index, capability_id, status,
                priority, requester_name, requester_email, cost_center, samples,
                test_methods, is_approved, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {}
            "#,
            REQUEST_COLUMNS
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(&request_number)
        .bind(&plan.submission_id)
        .bind(group_index)
        .bind(&capability.id)
        .bind(RequestStatus::PendingReceive.as_str())
        .bind(plan.priority.as_str())
        .bind(&plan.requester_name)
        .bind(&plan.requester_email)
        .bind(&plan.cost_center)
        .bind(Json(&plan.samples))
        .bind(Json(&group.test_methods))
        .bind(plan.is_approved())
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        for planned in &group.sample_tests {
            sqlx::query(
                r#"
                INSERT INTO sample_tests (
                    id, request_id, request_number, sample_name, full_sample_name, method_id,
                    method_code, capability_id, repeat_index, requirements, status,
                    created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&request.id)
            .bind(&request.request_number)
            .bind(&planned.sample_name)
            .bind(&planned.full_sample_name)
            .bind(&planned.method_id)
            .bind(&planned.method_code)
            .bind(&capability.id)
            .bind(planned.repeat_index)
            .bind(&planned.requirements)
            .bind(SampleTestStatus::PendingReceive.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        debug!(
            request_number = %request.request_number,
            sample_tests = group.sample_tests.len(),
            "Request staged"
        );
        created.push(request);
    }

    tx.commit().await?;

    Ok(SubmissionOutcome {
        requests: created,
        replayed: false,
    })
}

/// Get a request by id.
pub async fn get_request(pool: &PgPool, id: &str) -> Result<Option<RequestRecord>, CoreError> {
    let record = sqlx::query_as::<_, RequestRecord>(&format!(
        "SELECT {} FROM requests WHERE id = $1",
        REQUEST_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Get a request by its number.
pub async fn get_request_by_number(
    pool: &PgPool,
    request_number: &str,
) -> Result<Option<RequestRecord>, CoreError> {
    let record = sqlx::query_as::<_, RequestRecord>(&format!(
        "SELECT {} FROM requests WHERE request_number = $1",
        REQUEST_COLUMNS
    ))
    .bind(request_number)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// List requests with optional filtering, newest first.
pub async fn list_requests(
    pool: &PgPool,
    filter: &ListRequestsFilter,
) -> Result<Vec<RequestRecord>, CoreError> {
    let records = sqlx::query_as::<_, RequestRecord>(&format!(
        r#"
        SELECT {}
        FROM requests
        WHERE ($1::TEXT IS NULL OR status = $1)
          AND ($2::TEXT IS NULL OR capability_id = $2)
        ORDER BY created_at DESC, request_number DESC
        LIMIT $3 OFFSET $4
        "#,
        REQUEST_COLUMNS
    ))
    .bind(&filter.status)
    .bind(&filter.capability_id)
    .bind(filter.limit)
    .bind(filter.offset)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Apply a guarded status change to a request and its still-pending children.
async fn cascade_transition(
    pool: &PgPool,
    id: &str,
    (from, to): (RequestStatus, RequestStatus),
    stamp_column: &'static str,
    (child_from, child_to): (SampleTestStatus, SampleTestStatus),
    now: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query(&format!(
        "UPDATE requests SET status = $1, {} = $2 WHERE id = $3 AND status = $4",
        stamp_column
    ))
    .bind(to.as_str())
    .bind(now)
    .bind(id)
    .bind(from.as_str())
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(false);
    }

    let children = sqlx::query(
        r#"
        UPDATE sample_tests
        SET status = $1, updated_at = $2
        WHERE request_id = $3 AND status = $4
        "#,
    )
    .bind(child_to.as_str())
    .bind(now)
    .bind(id)
    .bind(child_from.as_str())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    debug!(
        request_id = id,
        status = %to,
        sample_tests = children.rows_affected(),
        "Request transitioned"
    );

    Ok(true)
}

/// `in-progress → completed` if no child is still open.
pub async fn complete_request(
    pool: &PgPool,
    id: &str,
    now: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE requests
        SET status = $1, completed_at = $2
        WHERE id = $3 AND status = $4
          AND NOT EXISTS (
              SELECT 1 FROM sample_tests
              WHERE sample_tests.request_id = requests.id
                AND sample_tests.status NOT IN ($5, $6, $7)
          )
        "#,
    )
    .bind(RequestStatus::Completed.as_str())
    .bind(now)
    .bind(id)
    .bind(RequestStatus::InProgress.as_str())
    .bind(SampleTestStatus::Completed.as_str())
    .bind(SampleTestStatus::Terminated.as_str())
    .bind(SampleTestStatus::Cancelled.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Record the evaluation of a completed request, once.
pub async fn evaluate_request(
    pool: &PgPool,
    id: &str,
    score: i32,
    comment: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE requests
        SET evaluation_score = $1, evaluation_comment = $2, evaluated_at = $3
        WHERE id = $4 AND status = $5 AND evaluation_score IS NULL
        "#,
    )
    .bind(score)
    .bind(comment)
    .bind(now)
    .bind(id)
    .bind(RequestStatus::Completed.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

// ============================================================================
// Sample Test Operations
// ============================================================================

/// List the sample tests of a request.
pub async fn list_sample_tests(
    pool: &PgPool,
    request_id: &str,
) -> Result<Vec<SampleTestRecord>, CoreError> {
    let records = sqlx::query_as::<_, SampleTestRecord>(&format!(
        r#"
        SELECT {}
        FROM sample_tests
        WHERE request_id = $1
        ORDER BY method_code, repeat_index, sample_name
        "#,
        SAMPLE_TEST_COLUMNS
    ))
    .bind(request_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Get a sample test by id.
pub async fn get_sample_test(pool: &PgPool, id: &str) -> Result<Option<SampleTestRecord>, CoreError> {
    let record = sqlx::query_as::<_, SampleTestRecord>(&format!(
        "SELECT {} FROM sample_tests WHERE id = $1",
        SAMPLE_TEST_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Set a sample test's status if it still has the expected one.
pub async fn update_sample_test_status(
    pool: &PgPool,
    id: &str,
    expected: &str,
    status: &str,
    now: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE sample_tests
        SET status = $1, updated_at = $2
        WHERE id = $3 AND status = $4
        "#,
    )
    .bind(status)
    .bind(now)
    .bind(id)
    .bind(expected)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

// ============================================================================
// Advanced Request Operations
// ============================================================================

/// Allocate an ASR number and insert the request.
pub async fn create_advanced_request(
    pool: &PgPool,
    request: &NewAdvancedRequest,
    now: DateTime<Utc>,
) -> Result<AdvancedRequestRecord, CoreError> {
    let mut tx = pool.begin().await?;

    let period = Period::of(now);
    let seq = next_sequence(&mut tx, &SequenceKey::advanced_request(period)).await?;

    let record = sqlx::query_as::<_, AdvancedRequestRecord>(
        r#"
        INSERT INTO advanced_requests (
            id, request_number, project_name, requester_name, requester_email,
            capability_id, description, status, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING id, request_number, project_name, requester_name, requester_email,
                  capability_id, description, status, created_at
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(format_asr_number(period, seq))
    .bind(request.project_name.trim())
    .bind(request.requester_name.trim())
    .bind(&request.requester_email)
    .bind(&request.capability_id)
    .bind(&request.description)
    .bind(ASR_INITIAL_STATUS)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(record)
}

/// Get an advanced request by number.
pub async fn get_advanced_request(
    pool: &PgPool,
    request_number: &str,
) -> Result<Option<AdvancedRequestRecord>, CoreError> {
    let record = sqlx::query_as::<_, AdvancedRequestRecord>(
        r#"
        SELECT id, request_number, project_name, requester_name, requester_email,
               capability_id, description, status, created_at
        FROM advanced_requests
        WHERE request_number = $1
        "#,
    )
    .bind(request_number)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

// ============================================================================
// Equipment Reservation Operations
// ============================================================================

/// Book an equipment slot unless it overlaps an active reservation.
pub async fn create_reservation(
    pool: &PgPool,
    slot: &ReservationSlot,
    now: DateTime<Utc>,
) -> Result<Option<ReservationRecord>, CoreError> {
    let mut tx = pool.begin().await?;

    // One booking per equipment at a time until commit.
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(&slot.equipment_id)
        .execute(&mut *tx)
        .await?;

    let overlapping: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM equipment_reservations
            WHERE equipment_id = $1 AND status = $2 AND start_at < $3 AND $4 < end_at
        )
        "#,
    )
    .bind(&slot.equipment_id)
    .bind(reservation_status::RESERVED)
    .bind(slot.end_at)
    .bind(slot.start_at)
    .fetch_one(&mut *tx)
    .await?;

    if overlapping {
        return Ok(None);
    }

    let period = Period::of(slot.start_at);
    let key = SequenceKey::equipment_reservation(&slot.capability.id, period);
    let seq = next_sequence(&mut tx, &key).await?;

    let record = sqlx::query_as::<_, ReservationRecord>(&format!(
        r#"
        INSERT INTO equipment_reservations (
            id, reservation_number, capability_id, equipment_id, requester_name,
            purpose, start_at, end_at, status, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING {}
        "#,
        RESERVATION_COLUMNS
    ))
    .bind(Uuid::new_v4().to_string())
    .bind(format_er_number(&slot.capability.short_code, period, seq))
    .bind(&slot.capability.id)
    .bind(&slot.equipment_id)
    .bind(&slot.requester_name)
    .bind(&slot.purpose)
    .bind(slot.start_at)
    .bind(slot.end_at)
    .bind(reservation_status::RESERVED)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(Some(record))
}

/// Get a reservation by number.
pub async fn get_reservation(
    pool: &PgPool,
    reservation_number: &str,
) -> Result<Option<ReservationRecord>, CoreError> {
    let record = sqlx::query_as::<_, ReservationRecord>(&format!(
        "SELECT {} FROM equipment_reservations WHERE reservation_number = $1",
        RESERVATION_COLUMNS
    ))
    .bind(reservation_number)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// List reservations of one equipment by start time.
pub async fn list_reservations(
    pool: &PgPool,
    equipment_id: &str,
) -> Result<Vec<ReservationRecord>, CoreError> {
    let records = sqlx::query_as::<_, ReservationRecord>(&format!(
        "SELECT {} FROM equipment_reservations WHERE equipment_id = $1 ORDER BY start_at",
        RESERVATION_COLUMNS
    ))
    .bind(equipment_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Release an active reservation.
pub async fn cancel_reservation(
    pool: &PgPool,
    reservation_number: &str,
    now: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE equipment_reservations
        SET status = $1, cancelled_at = $2
        WHERE reservation_number = $3 AND status = $4
        "#,
    )
    .bind(reservation_status::CANCELLED)
    .bind(now)
    .bind(reservation_number)
    .bind(reservation_status::RESERVED)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Check database health.
pub async fn health_check_db(pool: &PgPool) -> Result<bool, CoreError> {
    let result: Result<(i32,), _> = sqlx::query_as("SELECT 1").fetch_one(pool).await;
    Ok(result.is_ok())
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn create_capability(
        &self,
        capability: &NewCapability,
        now: DateTime<Utc>,
    ) -> Result<CapabilityRecord, CoreError> {
        create_capability(&self.pool, capability, now).await
    }

    async fn get_capability(&self, id: &str) -> Result<Option<CapabilityRecord>, CoreError> {
        get_capability(&self.pool, id).await
    }

    async fn list_capabilities(&self) -> Result<Vec<CapabilityRecord>, CoreError> {
        list_capabilities(&self.pool).await
    }

    async fn allocate_sequence(&self, key: &SequenceKey) -> Result<i64, CoreError> {
        let mut conn = self.pool.acquire().await?;
        next_sequence(&mut conn, key).await
    }

    async fn create_submission(
        &self,
        plan: &SubmissionPlan,
        scope: SequenceScope,
        now: DateTime<Utc>,
    ) -> Result<SubmissionOutcome, CoreError> {
        create_submission(&self.pool, plan, scope, now).await
    }

    async fn find_submission(&self, submission_id: &str) -> Result<Vec<RequestRecord>, CoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_submission(&mut conn, submission_id).await
    }

    async fn get_request(&self, id: &str) -> Result<Option<RequestRecord>, CoreError> {
        get_request(&self.pool, id).await
    }

    async fn get_request_by_number(
        &self,
        request_number: &str,
    ) -> Result<Option<RequestRecord>, CoreError> {
        get_request_by_number(&self.pool, request_number).await
    }

    async fn list_requests(
        &self,
        filter: &ListRequestsFilter,
    ) -> Result<Vec<RequestRecord>, CoreError> {
        list_requests(&self.pool, filter).await
    }

    async fn list_sample_tests(
        &self,
        request_id: &str,
    ) -> Result<Vec<SampleTestRecord>, CoreError> {
        list_sample_tests(&self.pool, request_id).await
    }

    async fn get_sample_test(&self, id: &str) -> Result<Option<SampleTestRecord>, CoreError> {
        get_sample_test(&self.pool, id).await
    }

    async fn update_sample_test_status(
        &self,
        id: &str,
        expected: &str,
        status: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        update_sample_test_status(&self.pool, id, expected, status, now).await
    }

    async fn receive_request(&self, id: &str, now: DateTime<Utc>) -> Result<bool, CoreError> {
        cascade_transition(
            &self.pool,
            id,
            (RequestStatus::PendingReceive, RequestStatus::InProgress),
            "received_at",
            (SampleTestStatus::PendingReceive, SampleTestStatus::Received),
            now,
        )
        .await
    }

    async fn terminate_request(&self, id: &str, now: DateTime<Utc>) -> Result<bool, CoreError> {
        cascade_transition(
            &self.pool,
            id,
            (RequestStatus::PendingReceive, RequestStatus::Terminated),
            "terminated_at",
            (SampleTestStatus::PendingReceive, SampleTestStatus::Terminated),
            now,
        )
        .await
    }

    async fn complete_request(&self, id: &str, now: DateTime<Utc>) -> Result<bool, CoreError> {
        complete_request(&self.pool, id, now).await
    }

    async fn evaluate_request(
        &self,
        id: &str,
        score: i32,
        comment: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        evaluate_request(&self.pool, id, score, comment, now).await
    }

    async fn create_advanced_request(
        &self,
        request: &NewAdvancedRequest,
        now: DateTime<Utc>,
    ) -> Result<AdvancedRequestRecord, CoreError> {
        create_advanced_request(&self.pool, request, now).await
    }

    async fn get_advanced_request(
        &self,
        request_number: &str,
    ) -> Result<Option<AdvancedRequestRecord>, CoreError> {
        get_advanced_request(&self.pool, request_number).await
    }

    async fn create_reservation(
        &self,
        slot: &ReservationSlot,
        now: DateTime<Utc>,
    ) -> Result<Option<ReservationRecord>, CoreError> {
        create_reservation(&self.pool, slot, now).await
    }

    async fn get_reservation(
        &self,
        reservation_number: &str,
    ) -> Result<Option<ReservationRecord>, CoreError> {
        get_reservation(&self.pool, reservation_number).await
    }

    async fn list_reservations(
        &self,
        equipment_id: &str,
    ) -> Result<Vec<ReservationRecord>, CoreError> {
        list_reservations(&self.pool, equipment_id).await
    }

    async fn cancel_reservation(
        &self,
        reservation_number: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        cancel_reservation(&self.pool, reservation_number, now).await
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        health_check_db(&self.pool).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::plan_submission;
    use crate::migrations;
    use crate::model::{Priority, SampleInput, Submission, TestMethodInput};
    use chrono::Duration;
    use std::collections::{HashMap, HashSet};

    // Helper to get a test database pool
    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        migrations::run_postgres(&pool).await.ok()?;
        Some(pool)
    }

    // Short codes are unique; tests share one database across runs.
    async fn create_test_capability(pool: &PgPool) -> CapabilityRecord {
        let code = format!("T{}", &Uuid::new_v4().simple().to_string()[..7]);
        create_capability(
            pool,
            &NewCapability {
                name: "Test lab".to_string(),
                short_code: code,
            },
            Utc::now(),
        )
        .await
        .expect("Failed to create test capability")
    }

    fn one_method_plan(capability: &CapabilityRecord, submission_id: Option<String>) -> SubmissionPlan {
        let submission = Submission {
            submission_id,
            requester_name: "Ann".to_string(),
            requester_email: None,
            cost_center: None,
            priority: Priority::Normal,
            test_methods: vec![TestMethodInput {
                id: None,
                method_code: "MFI".to_string(),
                name: None,
                capability_id: Some(capability.id.clone()),
                selected: true,
                is_deleted: false,
                samples: vec!["s1".to_string(), "s2".to_string()],
                instances: Vec::new(),
                requirements: None,
            }],
            samples: ["s1", "s2"]
                .iter()
                .map(|name| SampleInput {
                    generated_name: name.to_string(),
                    details: serde_json::Map::new(),
                })
                .collect(),
        };
        let catalogue = HashMap::from([(capability.id.clone(), capability.clone())]);
        plan_submission(&submission, &catalogue).expect("Plan should be valid")
    }

    #[tokio::test]
    async fn test_next_sequence_increments() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };
        let capability = create_test_capability(&pool).await;
        let persistence = PostgresPersistence::new(pool);
        let key = SequenceKey::Capability {
            capability_id: capability.id.clone(),
        };

        let first = persistence.allocate_sequence(&key).await.unwrap();
        let second = persistence.allocate_sequence(&key).await.unwrap();

        assert_eq!((first, second), (1, 2));
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_unique() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };
        let capability = create_test_capability(&pool).await;
        let persistence = PostgresPersistence::new(pool);
        let key = SequenceKey::Capability {
            capability_id: capability.id.clone(),
        };

        let mut handles = Vec::new();
        for _ in 0..20 {
            let persistence = persistence.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                persistence.allocate_sequence(&key).await
            }));
        }

        let mut values = HashSet::new();
        for handle in handles {
            let value = handle.await.unwrap().unwrap();
            assert!(values.insert(value), "Duplicate sequence value {}", value);
        }
        assert_eq!(values, (1..=20).collect::<HashSet<i64>>());
    }

    #[tokio::test]
    async fn test_create_submission_and_receive() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };
        let capability = create_test_capability(&pool).await;
        let persistence = PostgresPersistence::new(pool);
        let plan = one_method_plan(&capability, None);

        let created = persistence
            .create_submission(&plan, SequenceScope::Capability, Utc::now())
            .await
            .unwrap()
            .requests;
        assert_eq!(created.len(), 1);
        assert!(created[0].request_number.starts_with(&capability.short_code));
        assert!(created[0].request_number.ends_with("-00001"));

        let request = &created[0];
        assert_eq!(persistence.list_sample_tests(&request.id).await.unwrap().len(), 2);

        assert!(persistence.receive_request(&request.id, Utc::now()).await.unwrap());
        assert!(!persistence.terminate_request(&request.id, Utc::now()).await.unwrap());

        let rows = persistence.list_sample_tests(&request.id).await.unwrap();
        assert!(rows.iter().all(|r| r.status == "received"));
    }

    #[tokio::test]
    async fn test_resubmission_is_idempotent() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };
        let capability = create_test_capability(&pool).await;
        let persistence = PostgresPersistence::new(pool);
        let plan = one_method_plan(&capability, Some(Uuid::new_v4().to_string()));

        let first = persistence
            .create_submission(&plan, SequenceScope::Capability, Utc::now())
            .await
            .unwrap();
        let second = persistence
            .create_submission(&plan, SequenceScope::Capability, Utc::now())
            .await
            .unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.requests[0].id, second.requests[0].id);
    }

    #[tokio::test]
    async fn test_reservation_overlap() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };
        let capability = create_test_capability(&pool).await;
        let persistence = PostgresPersistence::new(pool);
        let start = Utc::now() + Duration::days(1);
        let slot = ReservationSlot {
            capability: capability.clone(),
            equipment_id: Uuid::new_v4().to_string(),
            requester_name: "Ann".to_string(),
            purpose: None,
            start_at: start,
            end_at: start + Duration::hours(2),
        };

        let first = persistence.create_reservation(&slot, Utc::now()).await.unwrap();
        assert!(first.is_some());

        let clash = ReservationSlot {
            start_at: start + Duration::hours(1),
            end_at: start + Duration::hours(3),
            ..slot.clone()
        };
        assert!(persistence.create_reservation(&clash, Utc::now()).await.unwrap().is_none());
    }
}
