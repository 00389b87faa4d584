// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for smartreq-core.
//!
//! Provides a unified error type with stable machine-readable codes. The HTTP
//! layer maps [`ErrorKind`] onto status codes.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Coarse classification used by transports to pick a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller sent something unusable.
    Invalid,
    /// A referenced record does not exist.
    NotFound,
    /// The record exists but its state forbids the operation.
    Conflict,
    /// Storage failed.
    Internal,
}

/// Core errors that can occur during request processing.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Capability was not found.
    CapabilityNotFound {
        /// The capability ID that was not found.
        capability_id: String,
    },

    /// Request (NTR, ASR or ER) was not found.
    RequestNotFound {
        /// Request number or id used in the lookup.
        reference: String,
    },

    /// Sample-test row was not found.
    SampleTestNotFound {
        /// The sample test ID that was not found.
        sample_test_id: String,
    },

    /// The record is in a state that does not allow the requested change.
    InvalidStatusTransition {
        /// What kind of record (request, sample test, reservation).
        entity: &'static str,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// The request already carries an evaluation.
    AlreadyEvaluated {
        /// The evaluated request.
        request_number: String,
    },

    /// Equipment slot overlaps an active reservation.
    ReservationConflict {
        /// Equipment that is already booked.
        equipment_id: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Shorthand for a [`CoreError::ValidationError`].
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::CapabilityNotFound { .. } => "CAPABILITY_NOT_FOUND",
            Self::RequestNotFound { .. } => "REQUEST_NOT_FOUND",
            Self::SampleTestNotFound { .. } => "SAMPLE_TEST_NOT_FOUND",
            Self::InvalidStatusTransition { .. } => "INVALID_STATUS_TRANSITION",
            Self::AlreadyEvaluated { .. } => "ALREADY_EVALUATED",
            Self::ReservationConflict { .. } => "RESERVATION_CONFLICT",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Classify the error for transport mapping.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ValidationError { .. } => ErrorKind::Invalid,
            Self::CapabilityNotFound { .. }
            | Self::RequestNotFound { .. }
            | Self::SampleTestNotFound { .. } => ErrorKind::NotFound,
            Self::InvalidStatusTransition { .. }
            | Self::AlreadyEvaluated { .. }
            | Self::ReservationConflict { .. } => ErrorKind::Conflict,
            Self::DatabaseError { .. } => ErrorKind::Internal,
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::CapabilityNotFound { capability_id } => {
                write!(f, "Capability '{}' not found", capability_id)
            }
            Self::RequestNotFound { reference } => {
                write!(f, "Request '{}' not found", reference)
            }
            Self::SampleTestNotFound { sample_test_id } => {
                write!(f, "Sample test '{}' not found", sample_test_id)
            }
            Self::InvalidStatusTransition { entity, from, to } => {
                write!(f, "Cannot move {} from '{}' to '{}'", entity, from, to)
            }
            Self::AlreadyEvaluated { request_number } => {
                write!(f, "Request '{}' has already been evaluated", request_number)
            }
            Self::ReservationConflict { equipment_id } => {
                write!(
                    f,
                    "Equipment '{}' is already reserved for an overlapping slot",
                    equipment_id
                )
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        let operation = match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => "insert",
            _ => "query",
        };
        CoreError::DatabaseError {
            operation: operation.to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
