// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Smart Request Server - HTTP API
//!
//! Exposes the smartreq-core handlers over JSON/HTTP.
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | GET | `/health` | Database connectivity, version, uptime |
//! | GET, POST | `/api/capabilities` | List / register capabilities |
//! | GET, POST | `/api/requests` | List / submit NTR requests |
//! | GET | `/api/requests/{number}` | One request |
//! | GET | `/api/requests/{number}/sample-tests` | Its sample tests |
//! | POST | `/api/requests/{number}/receive` | Samples arrived |
//! | POST | `/api/requests/{number}/terminate` | Withdraw before receipt |
//! | POST | `/api/requests/{number}/complete` | Close a finished request |
//! | POST | `/api/requests/{number}/evaluate` | Requester score (1-5) |
//! | PATCH | `/api/sample-tests/{id}` | Sample-test status |
//! | POST | `/api/asr` | Advanced request |
//! | GET, POST | `/api/reservations` | List by `equipmentId` / book equipment |
//! | POST | `/api/reservations/{number}/cancel` | Release a reservation |

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;

use smartreq_core::handlers::HandlerState;

/// Routes, envelope and error mapping.
pub mod api;

/// Request tracing middleware.
pub mod middleware;

/// Build the full application router with middleware applied.
pub fn build_router(state: HandlerState) -> Router {
    api::routes(Arc::new(state))
        .layer(axum::middleware::from_fn(
            middleware::request_tracing_middleware,
        ))
        .layer(CorsLayer::permissive())
}
