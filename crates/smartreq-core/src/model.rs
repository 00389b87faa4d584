// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain vocabulary shared by the allocator, the fan-out planner and the
//! persistence backends.
//!
//! Status values are stored as plain text; the enums here are the only place
//! that knows their spelling.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ============================================================================
// Priority
// ============================================================================

/// Request priority as chosen by the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Regular turnaround, auto-approved on submission.
    #[default]
    Normal,
    /// Expedited turnaround, requires manager sign-off.
    Urgent,
}

impl Priority {
    /// Single-letter code embedded in NTR request numbers.
    pub fn code(self) -> char {
        match self {
            Self::Normal => 'N',
            Self::Urgent => 'U',
        }
    }

    /// Storage spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Urgent => "urgent",
        }
    }
}

impl FromStr for Priority {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "urgent" => Ok(Self::Urgent),
            other => Err(CoreError::ValidationError {
                field: "priority".to_string(),
                message: format!("unknown priority '{}'", other),
            }),
        }
    }
}

// ============================================================================
// Request Status
// ============================================================================

/// Lifecycle of a parent request.
///
/// ```text
///   Pending Receive ──receive──▶ in-progress ──complete──▶ completed
///         │
///         └──terminate──▶ terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    /// Initial state: submitted, samples not yet at the lab.
    PendingReceive,
    /// Waiting on an external step.
    Pending,
    /// Samples received and work started.
    InProgress,
    /// All sample tests finished.
    Completed,
    /// Rejected by lab staff.
    Rejected,
    /// Terminated by the requester before receipt.
    Terminated,
    /// Cancelled.
    Cancelled,
}

impl RequestStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [RequestStatus; 7] = [
        Self::PendingReceive,
        Self::Pending,
        Self::InProgress,
        Self::Completed,
        Self::Rejected,
        Self::Terminated,
        Self::Cancelled,
    ];

    /// Storage spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingReceive => "Pending Receive",
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Terminated => "terminated",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::ValidationError {
                field: "status".to_string(),
                message: format!("unknown request status '{}'", s),
            })
    }
}

// ============================================================================
// Sample Test Status
// ============================================================================

/// Lifecycle of a single sample-test row.
///
/// Progress is forward-only along
/// `Pending Receive → received → in-progress → entry-results → completed`.
/// `terminated` and `cancelled` can be reached from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SampleTestStatus {
    /// Created by fan-out, waiting for the sample.
    PendingReceive,
    /// Sample is at the lab.
    Received,
    /// Test is running.
    InProgress,
    /// Results are being entered.
    EntryResults,
    /// Results released.
    Completed,
    /// Parent terminated before receipt.
    Terminated,
    /// Cancelled by lab staff.
    Cancelled,
}

impl SampleTestStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [SampleTestStatus; 7] = [
        Self::PendingReceive,
        Self::Received,
        Self::InProgress,
        Self::EntryResults,
        Self::Completed,
        Self::Terminated,
        Self::Cancelled,
    ];

    /// Storage spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingReceive => "Pending Receive",
            Self::Received => "received",
            Self::InProgress => "in-progress",
            Self::EntryResults => "entry-results",
            Self::Completed => "completed",
            Self::Terminated => "terminated",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Terminated | Self::Cancelled)
    }

    /// Whether a row in `self` may move to `next`.
    pub fn can_transition_to(self, next: SampleTestStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Terminated | Self::Cancelled => true,
            _ => next > self,
        }
    }
}

impl fmt::Display for SampleTestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SampleTestStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::ValidationError {
                field: "status".to_string(),
                message: format!("unknown sample test status '{}'", s),
            })
    }
}

/// Reservation state of an equipment booking.
pub mod reservation_status {
    /// Slot is held.
    pub const RESERVED: &str = "reserved";
    /// Slot was released.
    pub const CANCELLED: &str = "cancelled";
}

/// Initial status of an advanced (ASR) request.
pub const ASR_INITIAL_STATUS: &str = "pending";

// ============================================================================
// Submission Payload
// ============================================================================

/// One NTR submission as posted by the requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    /// Client-supplied idempotency key. Re-posting the same id returns the
    /// requests created the first time.
    #[serde(default)]
    pub submission_id: Option<String>,
    /// Who is asking.
    pub requester_name: String,
    /// Contact address of the requester.
    #[serde(default)]
    pub requester_email: Option<String>,
    /// Cost center charged for the work.
    #[serde(default)]
    pub cost_center: Option<String>,
    /// Normal or urgent.
    #[serde(default)]
    pub priority: Priority,
    /// Methods picked on the form, across all capabilities.
    #[serde(default)]
    pub test_methods: Vec<TestMethodInput>,
    /// Samples shipped with the submission.
    #[serde(default)]
    pub samples: Vec<SampleInput>,
}

/// A test method entry on the submission form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestMethodInput {
    /// Catalogue id of the method.
    #[serde(default)]
    pub id: Option<String>,
    /// Short method code used in sample-test display names.
    pub method_code: String,
    /// Human-readable method name.
    #[serde(default)]
    pub name: Option<String>,
    /// Capability that performs this method.
    #[serde(default)]
    pub capability_id: Option<String>,
    /// Main selection flag.
    #[serde(default)]
    pub selected: bool,
    /// Soft-deleted on the form; ignored entirely.
    #[serde(default)]
    pub is_deleted: bool,
    /// Samples the main selection applies to.
    #[serde(default)]
    pub samples: Vec<String>,
    /// Additional runs of the same method.
    #[serde(default)]
    pub instances: Vec<RepeatInstance>,
    /// Free-text requirements for the main selection.
    #[serde(default)]
    pub requirements: Option<String>,
}

impl TestMethodInput {
    /// A method contributes rows if it is selected or has repeat instances.
    pub fn is_requested(&self) -> bool {
        self.selected || !self.instances.is_empty()
    }
}

/// An extra run of a method, possibly with different requirements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatInstance {
    /// Samples this run applies to.
    #[serde(default)]
    pub samples: Vec<String>,
    /// Requirements specific to this run.
    #[serde(default)]
    pub requirements: Option<String>,
}

/// A sample shipped with the submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleInput {
    /// Display name generated by the form; methods refer to samples by it.
    pub generated_name: String,
    /// Descriptive metadata (category, description, ...), kept verbatim.
    #[serde(flatten)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

// ============================================================================
// Other Inputs
// ============================================================================

/// Capability registration payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCapability {
    /// Display name.
    pub name: String,
    /// Two-letter code used as request-number prefix.
    pub short_code: String,
}

/// Advanced (ASR) request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAdvancedRequest {
    pub project_name: String,
    pub requester_name: String,
    #[serde(default)]
    pub requester_email: Option<String>,
    #[serde(default)]
    pub capability_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Equipment reservation (ER) payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReservation {
    pub capability_id: String,
    pub equipment_id: String,
    pub requester_name: String,
    #[serde(default)]
    pub purpose: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}
