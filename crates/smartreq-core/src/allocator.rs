// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request-number allocation.
//!
//! Three number shapes are minted here:
//!
//! | Kind | Shape | Counter |
//! |------|-------|---------|
//! | NTR  | `{code}-{N\|U}-{MM}{YY}-{seq:05}` | capability `req_run_no`, or per (capability, MM/YY) |
//! | ER   | `{code}-ER-{MM}{YY}-{seq:05}` | per (capability, MM/YY) |
//! | ASR  | `ASR-{YYYY}-{seq:04}` | per year |
//!
//! Sequence values come from [`Persistence::allocate_sequence`], which
//! increments and returns in a single statement. Two callers can never
//! observe the same value for the same [`SequenceKey`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc};
use tracing::debug;

use crate::error::CoreError;
use crate::model::Priority;
use crate::persistence::{CapabilityRecord, Persistence};

/// Zero-padded width of NTR sequence suffixes.
pub const NTR_SEQUENCE_WIDTH: usize = 5;
/// Zero-padded width of ER sequence suffixes.
pub const ER_SEQUENCE_WIDTH: usize = 5;
/// Zero-padded width of ASR sequence suffixes.
pub const ASR_SEQUENCE_WIDTH: usize = 4;

/// Calendar month a number is minted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    /// 1-12.
    pub month: u32,
    /// Four-digit year.
    pub year: i32,
}

impl Period {
    /// Period containing `at`.
    pub fn of(at: DateTime<Utc>) -> Self {
        Self {
            month: at.month(),
            year: at.year(),
        }
    }

    /// `MMYY`, e.g. `0326` for March 2026.
    pub fn mmyy(&self) -> String {
        format!("{:02}{:02}", self.month, self.year.rem_euclid(100))
    }

    /// `YYYY`.
    pub fn yyyy(&self) -> String {
        format!("{:04}", self.year)
    }
}

/// How NTR counters are scoped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequenceScope {
    /// One counter per capability (`req_run_no`), never reset. Numbers from
    /// different months share a single sequence.
    #[default]
    Capability,
    /// One counter per capability per calendar month.
    Monthly,
}

impl FromStr for SequenceScope {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "capability" => Ok(Self::Capability),
            "monthly" => Ok(Self::Monthly),
            other => Err(CoreError::validation(
                "sequence_scope",
                format!("unknown sequence scope '{}'", other),
            )),
        }
    }
}

/// Identifies one independent counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceKey {
    /// The `req_run_no` column of a capability.
    Capability {
        /// Capability owning the counter.
        capability_id: String,
    },
    /// A row of the `sequences` table.
    Scoped {
        /// Counter family, e.g. `er:{capability_id}` or `asr`.
        scope: String,
        /// Reset period, e.g. `0326` or `2026`.
        period: String,
    },
}

impl SequenceKey {
    /// Counter for an NTR request of `capability_id` minted in `period`.
    pub fn ntr(scope: SequenceScope, capability_id: &str, period: Period) -> Self {
        match scope {
            SequenceScope::Capability => Self::Capability {
                capability_id: capability_id.to_string(),
            },
            SequenceScope::Monthly => Self::Scoped {
                scope: format!("ntr:{}", capability_id),
                period: period.mmyy(),
            },
        }
    }

    /// Counter for equipment reservations of `capability_id` in `period`.
    pub fn equipment_reservation(capability_id: &str, period: Period) -> Self {
        Self::Scoped {
            scope: format!("er:{}", capability_id),
            period: period.mmyy(),
        }
    }

    /// Counter for advanced requests in the year of `period`.
    pub fn advanced_request(period: Period) -> Self {
        Self::Scoped {
            scope: "asr".to_string(),
            period: period.yyyy(),
        }
    }
}

impl fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capability { capability_id } => write!(f, "capability:{}", capability_id),
            Self::Scoped { scope, period } => write!(f, "{}@{}", scope, period),
        }
    }
}

/// Format an NTR request number.
pub fn format_ntr_number(short_code: &str, priority: Priority, period: Period, seq: i64) -> String {
    format!(
        "{}-{}-{}-{:0width$}",
        short_code,
        priority.code(),
        period.mmyy(),
        seq,
        width = NTR_SEQUENCE_WIDTH
    )
}

/// Format an equipment reservation number.
pub fn format_er_number(short_code: &str, period: Period, seq: i64) -> String {
    format!(
        "{}-ER-{}-{:0width$}",
        short_code,
        period.mmyy(),
        seq,
        width = ER_SEQUENCE_WIDTH
    )
}

/// Format an advanced request number.
pub fn format_asr_number(period: Period, seq: i64) -> String {
    format!(
        "ASR-{}-{:0width$}",
        period.yyyy(),
        seq,
        width = ASR_SEQUENCE_WIDTH
    )
}

/// Numeric suffix of any number minted here.
pub fn sequence_suffix(number: &str) -> Option<i64> {
    number.rsplit_once('-')?.1.parse().ok()
}

/// Allocate the next NTR number for `capability`.
///
/// Consumes one value of the capability's counter. The fan-out path does not
/// call this: it allocates inside its own transaction so that a failed
/// submission gives its numbers back.
pub async fn next_request_number(
    persistence: &dyn Persistence,
    capability: &CapabilityRecord,
    priority: Priority,
    scope: SequenceScope,
    now: DateTime<Utc>,
) -> Result<String, CoreError> {
    let period = Period::of(now);
    let key = SequenceKey::ntr(scope, &capability.id, period);
    let seq = persistence.allocate_sequence(&key).await?;
    let number = format_ntr_number(&capability.short_code, priority, period, seq);

    debug!(key = %key, seq, number = %number, "Allocated request number");

    Ok(number)
}
