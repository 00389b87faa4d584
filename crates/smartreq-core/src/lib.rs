// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Smart Request Core - Request Numbering and Capability Fan-Out
//!
//! This crate turns a lab test submission into durable, individually numbered
//! requests. A single submission may pick test methods served by several lab
//! capabilities; it is split into one request per capability, and every
//! request is expanded into one sample-test row per (sample, method, run).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    smartreq-server (HTTP)                    │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          handlers                            │
//! │      validate, resolve capabilities, guard status changes    │
//! └──────────────────────────────────────────────────────────────┘
//!          │                                    │
//!          ▼                                    ▼
//! ┌──────────────────┐              ┌────────────────────────────┐
//! │      fanout      │─── plan ────▶│        persistence         │
//! │  (pure planning) │              │  one transaction: numbers, │
//! └──────────────────┘              │  requests, sample tests    │
//!                                   └────────────────────────────┘
//!                                        │                │
//!                                        ▼                ▼
//!                                   PostgreSQL          SQLite
//! ```
//!
//! # Request Numbers
//!
//! | Kind | Example | Counter |
//! |------|---------|---------|
//! | NTR (normal test request) | `RH-N-0326-00001` | per capability, or per capability and month |
//! | ER (equipment reservation) | `TH-ER-0326-00007` | per capability and month |
//! | ASR (advanced request) | `ASR-2026-0012` | per year |
//!
//! Counters are incremented and read in one statement, so concurrent
//! submissions never share a number. A failed submission rolls its
//! increments back together with its rows.
//!
//! # Request Status
//!
//! ```text
//!   Pending Receive ──receive──▶ in-progress ──complete──▶ completed ──evaluate──▶ (scored)
//!         │
//!         └──terminate──▶ terminated
//! ```
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `SMARTREQ_DATABASE_URL` | Yes | - | PostgreSQL or SQLite connection string |
//! | `SMARTREQ_HTTP_PORT` | No | `8080` | HTTP listen port |
//! | `SMARTREQ_MAX_CONNECTIONS` | No | `10` | Database pool size |
//! | `SMARTREQ_SEQUENCE_SCOPE` | No | `capability` | `capability` or `monthly` NTR counters |

/// Request-number formats and counter keys.
pub mod allocator;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types with stable codes and transport classification.
pub mod error;

/// Splitting a submission by capability and expanding sample-test rows.
pub mod fanout;

/// Request handlers shared by every transport.
pub mod handlers;

/// Embedded database migrations.
pub mod migrations;

/// Statuses, priorities and input payloads.
pub mod model;

/// Persistence trait and its PostgreSQL and SQLite backends.
pub mod persistence;
