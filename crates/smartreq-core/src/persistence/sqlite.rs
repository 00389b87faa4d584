// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::allocator::{
    Period, SequenceKey, SequenceScope, format_asr_number, format_er_number, format_ntr_number,
};
use crate::error::CoreError;
use crate::fanout::SubmissionPlan;
use crate::migrations;
use crate::model::{
    ASR_INITIAL_STATUS, NewAdvancedRequest, NewCapability, RequestStatus, SampleTestStatus,
    reservation_status,
};

use super::{
    AdvancedRequestRecord, CapabilityRecord, ListRequestsFilter, Persistence, RequestRecord,
    ReservationRecord, ReservationSlot, SampleTestRecord, SubmissionOutcome,
};

const REQUEST_COLUMNS: &str = "id, request_number, submission_id, capability_id, status, priority, \
     requester_name, requester_email, cost_center, samples, test_methods, is_approved, \
     evaluation_score, evaluation_comment, created_at, received_at, terminated_at, \
     completed_at, evaluated_at";

const SAMPLE_TEST_COLUMNS: &str = "id, request_id, request_number, sample_name, full_sample_name, \
     method_id, method_code, capability_id, repeat_index, requirements, status, created_at, \
     updated_at";

const RESERVATION_COLUMNS: &str = "id, reservation_number, capability_id, equipment_id, \
     requester_name, purpose, start_at, end_at, status, created_at, cancelled_at";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// This convenience constructor handles all setup:
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Switches the file to WAL so writers queue instead of failing
    /// - Connects to the database with sensible defaults
    /// - Runs all migrations
    ///
    /// # Example
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/smartreq.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        migrations::run_sqlite(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ============================================================================
// Connection-level helpers (usable inside a transaction)
// ============================================================================

async fn next_sequence(conn: &mut SqliteConnection, key: &SequenceKey) -> Result<i64, CoreError> {
    match key {
        SequenceKey::Capability { capability_id } => {
            let seq: Option<i64> = sqlx::query_scalar(
                r#"
                UPDATE capabilities
                SET req_run_no = req_run_no + 1
                WHERE id = ?
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
                VALUES (?, ?, 2)
                ON CONFLICT (scope, period) DO UPDATE SET next_value = next_value + 1
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

async fn fetch_submission(
    conn: &mut SqliteConnection,
    submission_id: &str,
) -> Result<Vec<RequestRecord>, CoreError> {
    let records = sqlx::query_as::<_, RequestRecord>(&format!(
        "SELECT {} FROM requests WHERE submission_id = ? ORDER BY group_index",
        REQUEST_COLUMNS
    ))
    .bind(submission_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(records)
}

async fn insert_request(
    conn: &mut SqliteConnection,
    record: &RequestRecord,
    group_index: i32,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO requests (
            id, request_number, submission_id, group_index, capability_id, status,
            priority, requester_name, requester_email, cost_center, samples,
            test_methods, is_approved, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(&record.request_number)
    .bind(&record.submission_id)
    .bind(group_index)
    .bind(&record.capability_id)
    .bind(&record.status)
    .bind(&record.priority)
    .bind(&record.requester_name)
    .bind(&record.requester_email)
    .bind(&record.cost_center)
    .bind(&record.samples)
    .bind(&record.test_methods)
    .bind(record.is_approved)
    .bind(record.created_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn insert_sample_test(
    conn: &mut SqliteConnection,
    record: &SampleTestRecord,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO sample_tests (
            id, request_id, request_number, sample_name, full_sample_name, method_id,
            method_code, capability_id, repeat_index, requirements, status,
            created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(&record.request_id)
    .bind(&record.request_number)
    .bind(&record.sample_name)
    .bind(&record.full_sample_name)
    .bind(&record.method_id)
    .bind(&record.method_code)
    .bind(&record.capability_id)
    .bind(record.repeat_index)
    .bind(&record.requirements)
    .bind(&record.status)
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

impl SqlitePersistence {
    /// Move a request from `from` to `to`, stamping `stamp_column`, and move
    /// its children still in `child_from` to `child_to`.
    #[allow(clippy::too_many_arguments)]
    async fn cascade_transition(
        &self,
        id: &str,
        from: RequestStatus,
        to: RequestStatus,
        stamp_column: &'static str,
        child_from: SampleTestStatus,
        child_to: SampleTestStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(&format!(
            "UPDATE requests SET status = ?, {} = ? WHERE id = ? AND status = ?",
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
            SET status = ?, updated_at = ?
            WHERE request_id = ? AND status = ?
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
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn create_capability(
        &self,
        capability: &NewCapability,
        now: DateTime<Utc>,
    ) -> Result<CapabilityRecord, CoreError> {
        let record = CapabilityRecord {
            id: Uuid::new_v4().to_string(),
            name: capability.name.clone(),
            short_code: capability.short_code.clone(),
            req_run_no: 1,
            created_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO capabilities (id, name, short_code, req_run_no, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.short_code)
        .bind(record.req_run_no)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_capability(&self, id: &str) -> Result<Option<CapabilityRecord>, CoreError> {
        let record = sqlx::query_as::<_, CapabilityRecord>(
            r#"
            SELECT id, name, short_code, req_run_no, created_at
            FROM capabilities
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_capabilities(&self) -> Result<Vec<CapabilityRecord>, CoreError> {
        let records = sqlx::query_as::<_, CapabilityRecord>(
            r#"
            SELECT id, name, short_code, req_run_no, created_at
            FROM capabilities
            ORDER BY short_code
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
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
        let mut tx = self.pool.begin().await?;

        if let Some(submission_id) = plan.submission_id.as_deref() {
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
            let key = SequenceKey::ntr(scope, &capability.id, period);
            let seq = next_sequence(&mut tx, &key).await?;

            let request = RequestRecord {
                id: Uuid::new_v4().to_string(),
                request_number: format_ntr_number(&capability.short_code, plan.priority, period, seq),
                submission_id: plan.submission_id.clone(),
                capability_id: capability.id.clone(),
                status: RequestStatus::PendingReceive.as_str().to_string(),
                priority: plan.priority.as_str().to_string(),
                requester_name: plan.requester_name.clone(),
                requester_email: plan.requester_email.clone(),
                cost_center: plan.cost_center.clone(),
                samples: Json(plan.samples.clone()),
                test_methods: Json(group.test_methods.clone()),
                is_approved: plan.is_approved(),
                evaluation_score: None,
                evaluation_comment: None,
                created_at: now,
                received_at: None,
                terminated_at: None,
                completed_at: None,
                evaluated_at: None,
            };
            insert_request(&mut tx, &request, group_index).await?;

            for planned in &group.sample_tests {
                let row = SampleTestRecord {
                    id: Uuid::new_v4().to_string(),
                    request_id: request.id.clone(),
                    request_number: request.request_number.clone(),
                    sample_name: planned.sample_name.clone(),
                    full_sample_name: planned.full_sample_name.clone(),
                    method_id: planned.method_id.clone(),
                    method_code: planned.method_code.clone(),
                    capability_id: capability.id.clone(),
                    repeat_index: planned.repeat_index,
                    requirements: planned.requirements.clone(),
                    status: SampleTestStatus::PendingReceive.as_str().to_string(),
                    created_at: now,
                    updated_at: now,
                };
                insert_sample_test(&mut tx, &row).await?;
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

    async fn find_submission(&self, submission_id: &str) -> Result<Vec<RequestRecord>, CoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_submission(&mut conn, submission_id).await
    }

    async fn get_request(&self, id: &str) -> Result<Option<RequestRecord>, CoreError> {
        let record = sqlx::query_as::<_, RequestRecord>(&format!(
            "SELECT {} FROM requests WHERE id = ?",
            REQUEST_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_request_by_number(
        &self,
        request_number: &str,
    ) -> Result<Option<RequestRecord>, CoreError> {
        let record = sqlx::query_as::<_, RequestRecord>(&format!(
            "SELECT {} FROM requests WHERE request_number = ?",
            REQUEST_COLUMNS
        ))
        .bind(request_number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_requests(
        &self,
        filter: &ListRequestsFilter,
    ) -> Result<Vec<RequestRecord>, CoreError> {
        let records = sqlx::query_as::<_, RequestRecord>(&format!(
            r#"
            SELECT {}
            FROM requests
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 IS NULL OR capability_id = ?2)
            ORDER BY created_at DESC, request_number DESC
            LIMIT ?3 OFFSET ?4
            "#,
            REQUEST_COLUMNS
        ))
        .bind(&filter.status)
        .bind(&filter.capability_id)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_sample_tests(
        &self,
        request_id: &str,
    ) -> Result<Vec<SampleTestRecord>, CoreError> {
        let records = sqlx::query_as::<_, SampleTestRecord>(&format!(
            r#"
            SELECT {}
            FROM sample_tests
            WHERE request_id = ?
            ORDER BY method_code, repeat_index, sample_name
            "#,
            SAMPLE_TEST_COLUMNS
        ))
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn get_sample_test(&self, id: &str) -> Result<Option<SampleTestRecord>, CoreError> {
        let record = sqlx::query_as::<_, SampleTestRecord>(&format!(
            "SELECT {} FROM sample_tests WHERE id = ?",
            SAMPLE_TEST_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_sample_test_status(
        &self,
        id: &str,
        expected: &str,
        status: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sample_tests
            SET status = ?, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(status)
        .bind(now)
        .bind(id)
        .bind(expected)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn receive_request(&self, id: &str, now: DateTime<Utc>) -> Result<bool, CoreError> {
        self.cascade_transition(
            id,
            RequestStatus::PendingReceive,
            RequestStatus::InProgress,
            "received_at",
            SampleTestStatus::PendingReceive,
            SampleTestStatus::Received,
            now,
        )
        .await
    }

    async fn terminate_request(&self, id: &str, now: DateTime<Utc>) -> Result<bool, CoreError> {
        self.cascade_transition(
            id,
            RequestStatus::PendingReceive,
            RequestStatus::Terminated,
            "terminated_at",
            SampleTestStatus::PendingReceive,
            SampleTestStatus::Terminated,
            now,
        )
        .await
    }

    async fn complete_request(&self, id: &str, now: DateTime<Utc>) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE requests
            SET status = ?1, completed_at = ?2
            WHERE id = ?3 AND status = ?4
              AND NOT EXISTS (
                  SELECT 1 FROM sample_tests
                  WHERE sample_tests.request_id = requests.id
                    AND sample_tests.status NOT IN (?5, ?6, ?7)
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
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn evaluate_request(
        &self,
        id: &str,
        score: i32,
        comment: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE requests
            SET evaluation_score = ?, evaluation_comment = ?, evaluated_at = ?
            WHERE id = ? AND status = ? AND evaluation_score IS NULL
            "#,
        )
        .bind(score)
        .bind(comment)
        .bind(now)
        .bind(id)
        .bind(RequestStatus::Completed.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn create_advanced_request(
        &self,
        request: &NewAdvancedRequest,
        now: DateTime<Utc>,
    ) -> Result<AdvancedRequestRecord, CoreError> {
        let mut tx = self.pool.begin().await?;

        let period = Period::of(now);
        let seq = next_sequence(&mut tx, &SequenceKey::advanced_request(period)).await?;

        let record = AdvancedRequestRecord {
            id: Uuid::new_v4().to_string(),
            request_number: format_asr_number(period, seq),
            project_name: request.project_name.trim().to_string(),
            requester_name: request.requester_name.trim().to_string(),
            requester_email: request.requester_email.clone(),
            capability_id: request.capability_id.clone(),
            description: request.description.clone(),
            status: ASR_INITIAL_STATUS.to_string(),
            created_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO advanced_requests (
                id, request_number, project_name, requester_name, requester_email,
                capability_id, description, status, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.request_number)
        .bind(&record.project_name)
        .bind(&record.requester_name)
        .bind(&record.requester_email)
        .bind(&record.capability_id)
        .bind(&record.description)
        .bind(&record.status)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(record)
    }

    async fn get_advanced_request(
        &self,
        request_number: &str,
    ) -> Result<Option<AdvancedRequestRecord>, CoreError> {
        let record = sqlx::query_as::<_, AdvancedRequestRecord>(
            r#"
            SELECT id, request_number, project_name, requester_name, requester_email,
                   capability_id, description, status, created_at
            FROM advanced_requests
            WHERE request_number = ?
            "#,
        )
        .bind(request_number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn create_reservation(
        &self,
        slot: &ReservationSlot,
        now: DateTime<Utc>,
    ) -> Result<Option<ReservationRecord>, CoreError> {
        let mut tx = self.pool.begin().await?;

        // Taking the number first makes this transaction the writer, so the
        // overlap check below cannot race another booking.
        let period = Period::of(slot.start_at);
        let key = SequenceKey::equipment_reservation(&slot.capability.id, period);
        let seq = next_sequence(&mut tx, &key).await?;

        let overlapping: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM equipment_reservations
            WHERE equipment_id = ? AND status = ? AND start_at < ? AND ? < end_at
            "#,
        )
        .bind(&slot.equipment_id)
        .bind(reservation_status::RESERVED)
        .bind(slot.end_at)
        .bind(slot.start_at)
        .fetch_one(&mut *tx)
        .await?;

        if overlapping > 0 {
            return Ok(None);
        }

        let record = ReservationRecord {
            id: Uuid::new_v4().to_string(),
            reservation_number: format_er_number(&slot.capability.short_code, period, seq),
            capability_id: slot.capability.id.clone(),
            equipment_id: slot.equipment_id.clone(),
            requester_name: slot.requester_name.clone(),
            purpose: slot.purpose.clone(),
            start_at: slot.start_at,
            end_at: slot.end_at,
            status: reservation_status::RESERVED.to_string(),
            created_at: now,
            cancelled_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO equipment_reservations (
                id, reservation_number, capability_id, equipment_id, requester_name,
                purpose, start_at, end_at, status, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.reservation_number)
        .bind(&record.capability_id)
        .bind(&record.equipment_id)
        .bind(&record.requester_name)
        .bind(&record.purpose)
        .bind(record.start_at)
        .bind(record.end_at)
        .bind(&record.status)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(record))
    }

    async fn get_reservation(
        &self,
        reservation_number: &str,
    ) -> Result<Option<ReservationRecord>, CoreError> {
        let record = sqlx::query_as::<_, ReservationRecord>(&format!(
            "SELECT {} FROM equipment_reservations WHERE reservation_number = ?",
            RESERVATION_COLUMNS
        ))
        .bind(reservation_number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_reservations(
        &self,
        equipment_id: &str,
    ) -> Result<Vec<ReservationRecord>, CoreError> {
        let records = sqlx::query_as::<_, ReservationRecord>(&format!(
            "SELECT {} FROM equipment_reservations WHERE equipment_id = ? ORDER BY start_at",
            RESERVATION_COLUMNS
        ))
        .bind(equipment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn cancel_reservation(
        &self,
        reservation_number: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE equipment_reservations
            SET status = ?, cancelled_at = ?
            WHERE reservation_number = ? AND status = ?
            "#,
        )
        .bind(reservation_status::CANCELLED)
        .bind(now)
        .bind(reservation_number)
        .bind(reservation_status::RESERVED)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let result: Result<(i64,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::sequence_suffix;
    use crate::fanout::plan_submission;
    use crate::model::{Priority, RepeatInstance, SampleInput, Submission, TestMethodInput};
    use chrono::{Duration, TimeZone};
    use std::collections::HashMap;

    /// Create an in-memory SQLite pool for testing.
    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");

        pool
    }

    fn at(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap()
    }

    async fn seed_capability(persistence: &SqlitePersistence, code: &str) -> CapabilityRecord {
        persistence
            .create_capability(
                &NewCapability {
                    name: format!("{} lab", code),
                    short_code: code.to_string(),
                },
                at(2026, 1, 1, 0),
            )
            .await
            .expect("Failed to create capability")
    }

    fn method(code: &str, capability_id: &str, samples: &[&str]) -> TestMethodInput {
        TestMethodInput {
            id: None,
            method_code: code.to_string(),
            name: None,
            capability_id: Some(capability_id.to_string()),
            selected: true,
            is_deleted: false,
            samples: samples.iter().map(|s| s.to_string()).collect(),
            instances: Vec::new(),
            requirements: None,
        }
    }

    fn submission(methods: Vec<TestMethodInput>) -> Submission {
        Submission {
            submission_id: None,
            requester_name: "Ann".to_string(),
            requester_email: Some("ann@example.com".to_string()),
            cost_center: None,
            priority: Priority::Normal,
            test_methods: methods,
            samples: ["s1", "s2"]
                .iter()
                .map(|name| SampleInput {
                    generated_name: name.to_string(),
                    details: serde_json::Map::new(),
                })
                .collect(),
        }
    }

    fn catalogue(capabilities: &[&CapabilityRecord]) -> HashMap<String, CapabilityRecord> {
        capabilities
            .iter()
            .map(|c| (c.id.clone(), (*c).clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_create_and_get_capability() {
        let persistence = SqlitePersistence::new(test_pool().await);

        let created = seed_capability(&persistence, "RH").await;
        let loaded = persistence
            .get_capability(&created.id)
            .await
            .expect("Query should succeed")
            .expect("Capability should exist");

        assert_eq!(loaded, created);
        assert_eq!(loaded.req_run_no, 1);
        assert!(persistence.get_capability("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_short_code_is_rejected() {
        let persistence = SqlitePersistence::new(test_pool().await);
        seed_capability(&persistence, "RH").await;

        let err = persistence
            .create_capability(
                &NewCapability {
                    name: "Other".to_string(),
                    short_code: "RH".to_string(),
                },
                at(2026, 1, 1, 0),
            )
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "DATABASE_ERROR");
    }

    #[tokio::test]
    async fn test_allocate_capability_sequence_counts_from_one() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let capability = seed_capability(&persistence, "RH").await;
        let key = SequenceKey::Capability {
            capability_id: capability.id.clone(),
        };

        let values = [
            persistence.allocate_sequence(&key).await.unwrap(),
            persistence.allocate_sequence(&key).await.unwrap(),
            persistence.allocate_sequence(&key).await.unwrap(),
        ];
        assert_eq!(values, [1, 2, 3]);

        let stored = persistence.get_capability(&capability.id).await.unwrap().unwrap();
        assert_eq!(stored.req_run_no, 4);
    }

    #[tokio::test]
    async fn test_allocate_unknown_capability() {
        let persistence = SqlitePersistence::new(test_pool().await);

        let err = persistence
            .allocate_sequence(&SequenceKey::Capability {
                capability_id: "missing".to_string(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::CapabilityNotFound { .. }));
    }

    #[tokio::test]
    async fn test_scoped_sequences_are_independent() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let march = Period::of(at(2026, 3, 1, 0));
        let april = Period::of(at(2026, 4, 1, 0));

        let a1 = persistence
            .allocate_sequence(&SequenceKey::equipment_reservation("cap", march))
            .await
            .unwrap();
        let a2 = persistence
            .allocate_sequence(&SequenceKey::equipment_reservation("cap", march))
            .await
            .unwrap();
        let b1 = persistence
            .allocate_sequence(&SequenceKey::equipment_reservation("cap", april))
            .await
            .unwrap();
        let c1 = persistence
            .allocate_sequence(&SequenceKey::advanced_request(march))
            .await
            .unwrap();

        assert_eq!((a1, a2, b1, c1), (1, 2, 1, 1));
    }

    #[tokio::test]
    async fn test_create_submission_writes_parents_and_children() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let rh = seed_capability(&persistence, "RH").await;
        let mc = seed_capability(&persistence, "MC").await;

        let mut mfi = method("MFI", &rh.id, &["s1", "s2"]);
        mfi.instances.push(RepeatInstance {
            samples: vec!["s1".to_string()],
            requirements: Some("190C".to_string()),
        });
        let sub = submission(vec![mfi, method("XRD", &mc.id, &["s2"])]);
        let plan = plan_submission(&sub, &catalogue(&[&rh, &mc])).unwrap();

        let now = at(2026, 3, 14, 9);
        let created = persistence
            .create_submission(&plan, SequenceScope::Capability, now)
            .await
            .expect("Submission should be stored")
            .requests;

        let numbers: Vec<&str> = created.iter().map(|r| r.request_number.as_str()).collect();
        assert_eq!(numbers, vec!["RH-N-0326-00001", "MC-N-0326-00001"]);
        assert!(created.iter().all(|r| r.is_approved));
        assert!(created.iter().all(|r| r.status == "Pending Receive"));

        let rh_request = persistence
            .get_request_by_number("RH-N-0326-00001")
            .await
            .unwrap()
            .expect("Request should exist");
        assert_eq!(rh_request.samples.0.len(), 2);
        assert_eq!(rh_request.test_methods.0.len(), 1);
        assert_eq!(rh_request.test_methods.0[0].method_code, "MFI");

        let rows = persistence.list_sample_tests(&rh_request.id).await.unwrap();
        let names: Vec<&str> = rows.iter().map(|r| r.full_sample_name.as_str()).collect();
        assert_eq!(names, vec!["s1_MFI_R1", "s2_MFI_R1", "s1_MFI_R2"]);
        assert!(rows.iter().all(|r| r.request_number == "RH-N-0326-00001"));
        assert_eq!(rows[2].requirements.as_deref(), Some("190C"));

        let mc_request = persistence
            .get_request_by_number("MC-N-0326-00001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persistence.list_sample_tests(&mc_request.id).await.unwrap().len(), 1);

        let rh_after = persistence.get_capability(&rh.id).await.unwrap().unwrap();
        assert_eq!(rh_after.req_run_no, 2);
    }

    #[tokio::test]
    async fn test_capability_scope_ignores_month_boundaries() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let rh = seed_capability(&persistence, "RH").await;
        let plan = plan_submission(
            &submission(vec![method("MFI", &rh.id, &["s1"])]),
            &catalogue(&[&rh]),
        )
        .unwrap();

        let march = persistence
            .create_submission(&plan, SequenceScope::Capability, at(2026, 3, 31, 23))
            .await
            .unwrap();
        let april = persistence
            .create_submission(&plan, SequenceScope::Capability, at(2026, 4, 1, 0))
            .await
            .unwrap();

        assert_eq!(march.requests[0].request_number, "RH-N-0326-00001");
        assert_eq!(april.requests[0].request_number, "RH-N-0426-00002");
    }

    #[tokio::test]
    async fn test_monthly_scope_restarts_each_month() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let rh = seed_capability(&persistence, "RH").await;
        let plan = plan_submission(
            &submission(vec![method("MFI", &rh.id, &["s1"])]),
            &catalogue(&[&rh]),
        )
        .unwrap();

        let mut numbers = Vec::new();
        for now in [at(2026, 3, 2, 8), at(2026, 3, 20, 8), at(2026, 4, 1, 8)] {
            let created = persistence
                .create_submission(&plan, SequenceScope::Monthly, now)
                .await
                .unwrap();
            numbers.push(created.requests[0].request_number.clone());
        }

        assert_eq!(
            numbers,
            vec!["RH-N-0326-00001", "RH-N-0326-00002", "RH-N-0426-00001"]
        );

        // The capability-wide counter is untouched under monthly scoping.
        let stored = persistence.get_capability(&rh.id).await.unwrap().unwrap();
        assert_eq!(stored.req_run_no, 1);
    }

    #[tokio::test]
    async fn test_failed_submission_rolls_back_everything() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let rh = seed_capability(&persistence, "RH").await;

        // A capability that passed planning but is gone from the store makes
        // the second group fail after the first was staged.
        let ghost = CapabilityRecord {
            id: "ghost".to_string(),
            name: "Ghost".to_string(),
            short_code: "GH".to_string(),
            req_run_no: 1,
            created_at: at(2026, 1, 1, 0),
        };
        let sub = submission(vec![
            method("MFI", &rh.id, &["s1"]),
            method("XRD", &ghost.id, &["s1"]),
        ]);
        let plan = plan_submission(&sub, &catalogue(&[&rh, &ghost])).unwrap();

        let err = persistence
            .create_submission(&plan, SequenceScope::Capability, at(2026, 3, 1, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::CapabilityNotFound { .. }));

        let all = persistence
            .list_requests(&ListRequestsFilter::default())
            .await
            .unwrap();
        assert!(all.is_empty(), "No request may survive a failed submission");

        let rh_after = persistence.get_capability(&rh.id).await.unwrap().unwrap();
        assert_eq!(rh_after.req_run_no, 1, "Counter increment must be rolled back");
    }

    #[tokio::test]
    async fn test_resubmission_with_same_id_is_idempotent() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let rh = seed_capability(&persistence, "RH").await;
        let mc = seed_capability(&persistence, "MC").await;
        let mut sub = submission(vec![
            method("MFI", &rh.id, &["s1"]),
            method("XRD", &mc.id, &["s1"]),
        ]);
        sub.submission_id = Some("client-42".to_string());
        let plan = plan_submission(&sub, &catalogue(&[&rh, &mc])).unwrap();

        let first = persistence
            .create_submission(&plan, SequenceScope::Capability, at(2026, 3, 1, 0))
            .await
            .unwrap();
        let second = persistence
            .create_submission(&plan, SequenceScope::Capability, at(2026, 3, 1, 1))
            .await
            .unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);

        // Replays keep group order, not number order.
        let numbers = |requests: &[RequestRecord]| -> Vec<String> {
            requests.iter().map(|r| r.request_number.clone()).collect()
        };
        let ids = |requests: &[RequestRecord]| -> Vec<String> {
            requests.iter().map(|r| r.id.clone()).collect()
        };
        assert_eq!(
            numbers(&first.requests),
            vec!["RH-N-0326-00001", "MC-N-0326-00001"]
        );
        assert_eq!(numbers(&second.requests), numbers(&first.requests));
        assert_eq!(ids(&second.requests), ids(&first.requests));

        let found = persistence.find_submission("client-42").await.unwrap();
        assert_eq!(ids(&found), ids(&first.requests));

        let rh_after = persistence.get_capability(&rh.id).await.unwrap().unwrap();
        assert_eq!(rh_after.req_run_no, 2);
    }

    #[tokio::test]
    async fn test_urgent_submission_is_not_approved() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let rh = seed_capability(&persistence, "RH").await;
        let mut sub = submission(vec![method("MFI", &rh.id, &["s1"])]);
        sub.priority = Priority::Urgent;
        let plan = plan_submission(&sub, &catalogue(&[&rh])).unwrap();

        let created = persistence
            .create_submission(&plan, SequenceScope::Capability, at(2026, 3, 1, 0))
            .await
            .unwrap()
            .requests;

        assert_eq!(created[0].request_number, "RH-U-0326-00001");
        assert!(!created[0].is_approved);
        assert_eq!(created[0].priority, "urgent");
    }

    async fn stored_request(persistence: &SqlitePersistence) -> RequestRecord {
        let rh = seed_capability(persistence, "RH").await;
        let plan = plan_submission(
            &submission(vec![method("MFI", &rh.id, &["s1", "s2"])]),
            &catalogue(&[&rh]),
        )
        .unwrap();
        persistence
            .create_submission(&plan, SequenceScope::Capability, at(2026, 3, 1, 0))
            .await
            .unwrap()
            .requests
            .remove(0)
    }

    #[tokio::test]
    async fn test_terminate_only_from_pending_receive() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let request = stored_request(&persistence).await;
        let now = at(2026, 3, 2, 0);

        assert!(persistence.terminate_request(&request.id, now).await.unwrap());
        assert!(!persistence.terminate_request(&request.id, now).await.unwrap());

        let loaded = persistence.get_request(&request.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, "terminated");
        assert_eq!(loaded.terminated_at, Some(now));

        let rows = persistence.list_sample_tests(&request.id).await.unwrap();
        assert!(rows.iter().all(|r| r.status == "terminated"));
    }

    #[tokio::test]
    async fn test_receive_then_terminate_is_refused() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let request = stored_request(&persistence).await;
        let now = at(2026, 3, 2, 0);

        assert!(persistence.receive_request(&request.id, now).await.unwrap());
        assert!(!persistence.terminate_request(&request.id, now).await.unwrap());

        let loaded = persistence.get_request(&request.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, "in-progress");
        assert_eq!(loaded.received_at, Some(now));

        let rows = persistence.list_sample_tests(&request.id).await.unwrap();
        assert!(rows.iter().all(|r| r.status == "received"));
    }

    #[tokio::test]
    async fn test_complete_requires_finished_children() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let request = stored_request(&persistence).await;
        let now = at(2026, 3, 2, 0);
        persistence.receive_request(&request.id, now).await.unwrap();

        let rows = persistence.list_sample_tests(&request.id).await.unwrap();
        assert!(
            persistence
                .update_sample_test_status(&rows[0].id, "received", "completed", now)
                .await
                .unwrap()
        );
        assert!(!persistence.complete_request(&request.id, now).await.unwrap());

        assert!(
            persistence
                .update_sample_test_status(&rows[1].id, "received", "cancelled", now)
                .await
                .unwrap()
        );
        assert!(persistence.complete_request(&request.id, now).await.unwrap());

        let loaded = persistence.get_request(&request.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, "completed");
    }

    #[tokio::test]
    async fn test_update_sample_test_status_is_conditional() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let request = stored_request(&persistence).await;
        let rows = persistence.list_sample_tests(&request.id).await.unwrap();
        let now = at(2026, 3, 2, 0);

        assert!(
            !persistence
                .update_sample_test_status(&rows[0].id, "in-progress", "entry-results", now)
                .await
                .unwrap()
        );
        assert!(
            persistence
                .update_sample_test_status(&rows[0].id, "Pending Receive", "received", now)
                .await
                .unwrap()
        );

        let row = persistence.get_sample_test(&rows[0].id).await.unwrap().unwrap();
        assert_eq!(row.status, "received");
        assert_eq!(row.updated_at, now);
    }

    #[tokio::test]
    async fn test_evaluate_only_once_and_only_when_completed() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let request = stored_request(&persistence).await;
        let now = at(2026, 3, 2, 0);

        assert!(
            !persistence
                .evaluate_request(&request.id, 5, None, now)
                .await
                .unwrap()
        );

        persistence.receive_request(&request.id, now).await.unwrap();
        for row in persistence.list_sample_tests(&request.id).await.unwrap() {
            persistence
                .update_sample_test_status(&row.id, "received", "completed", now)
                .await
                .unwrap();
        }
        assert!(persistence.complete_request(&request.id, now).await.unwrap());

        assert!(
            persistence
                .evaluate_request(&request.id, 4, Some("fast"), now)
                .await
                .unwrap()
        );
        assert!(
            !persistence
                .evaluate_request(&request.id, 1, None, now)
                .await
                .unwrap()
        );

        let loaded = persistence.get_request(&request.id).await.unwrap().unwrap();
        assert_eq!(loaded.evaluation_score, Some(4));
        assert_eq!(loaded.evaluation_comment.as_deref(), Some("fast"));
    }

    #[tokio::test]
    async fn test_list_requests_by_status() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let request = stored_request(&persistence).await;
        persistence
            .terminate_request(&request.id, at(2026, 3, 2, 0))
            .await
            .unwrap();

        let terminated = persistence
            .list_requests(&ListRequestsFilter {
                status: Some("terminated".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let pending = persistence
            .list_requests(&ListRequestsFilter {
                status: Some("Pending Receive".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(terminated.len(), 1);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_advanced_request_numbers_per_year() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let request = NewAdvancedRequest {
            project_name: "Recycled PP".to_string(),
            requester_name: "Ann".to_string(),
            requester_email: None,
            capability_id: None,
            description: None,
        };

        let first = persistence
            .create_advanced_request(&request, at(2026, 2, 1, 0))
            .await
            .unwrap();
        let second = persistence
            .create_advanced_request(&request, at(2026, 11, 1, 0))
            .await
            .unwrap();
        let next_year = persistence
            .create_advanced_request(&request, at(2027, 1, 5, 0))
            .await
            .unwrap();

        assert_eq!(first.request_number, "ASR-2026-0001");
        assert_eq!(second.request_number, "ASR-2026-0002");
        assert_eq!(next_year.request_number, "ASR-2027-0001");
        assert_eq!(sequence_suffix(&second.request_number), Some(2));

        let loaded = persistence
            .get_advanced_request("ASR-2026-0002")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.id, second.id);
        assert_eq!(loaded.status, "pending");
    }

    #[tokio::test]
    async fn test_reservation_overlap_is_refused() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let th = seed_capability(&persistence, "TH").await;
        let start = at(2026, 5, 4, 9);
        let slot = |start_at: DateTime<Utc>, hours: i64| ReservationSlot {
            capability: th.clone(),
            equipment_id: "dsc-01".to_string(),
            requester_name: "Ann".to_string(),
            purpose: None,
            start_at,
            end_at: start_at + Duration::hours(hours),
        };
        let now = at(2026, 5, 1, 0);

        let first = persistence
            .create_reservation(&slot(start, 2), now)
            .await
            .unwrap()
            .expect("First booking succeeds");
        assert_eq!(first.reservation_number, "TH-ER-0526-00001");

        let overlapping = persistence
            .create_reservation(&slot(start + Duration::hours(1), 2), now)
            .await
            .unwrap();
        assert!(overlapping.is_none());

        // Back-to-back slots do not overlap.
        let adjacent = persistence
            .create_reservation(&slot(start + Duration::hours(2), 1), now)
            .await
            .unwrap()
            .expect("Adjacent booking succeeds");
        assert_eq!(
            adjacent.reservation_number, "TH-ER-0526-00002",
            "A refused booking must not consume a number"
        );

        assert!(
            persistence
                .cancel_reservation(&first.reservation_number, now)
                .await
                .unwrap()
        );
        assert!(
            !persistence
                .cancel_reservation(&first.reservation_number, now)
                .await
                .unwrap()
        );

        let rebooked = persistence
            .create_reservation(&slot(start + Duration::hours(1), 1), now)
            .await
            .unwrap();
        assert!(rebooked.is_some());

        let all = persistence.list_reservations("dsc-01").await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].status, "cancelled");
    }

    #[tokio::test]
    async fn test_from_path_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("smartreq.db");

        let persistence = SqlitePersistence::from_path(&path).await.unwrap();

        assert!(path.exists());
        assert!(persistence.health_check_db().await.unwrap());
    }
}
