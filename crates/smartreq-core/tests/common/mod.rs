// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for smartreq-core integration tests.
//!
//! Provides TestContext backed by a file SQLite database so that several
//! pool connections can write concurrently, plus payload builders.

#![allow(dead_code)]

use std::sync::Arc;

use sqlx::PgPool;
use tempfile::TempDir;

use smartreq_core::handlers::{self, HandlerState};
use smartreq_core::model::{
    NewCapability, Priority, RepeatInstance, SampleInput, Submission, TestMethodInput,
};
use smartreq_core::persistence::{
    CapabilityRecord, Persistence, PostgresPersistence, SqlitePersistence,
};

/// Test context owning a throwaway SQLite database.
pub struct TestContext {
    pub state: HandlerState,
    pub sqlite: Arc<SqlitePersistence>,
    // Keeps the database file alive for the duration of the test.
    _dir: TempDir,
}

impl TestContext {
    /// Create a fresh database under a temporary directory.
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let sqlite = Arc::new(
            SqlitePersistence::from_path(dir.path().join("smartreq.db"))
                .await
                .expect("Failed to open SQLite database"),
        );
        let state = HandlerState::new(sqlite.clone() as Arc<dyn Persistence>);

        Self {
            state,
            sqlite,
            _dir: dir,
        }
    }

    /// Register a capability through the handler.
    pub async fn capability(&self, code: &str) -> CapabilityRecord {
        handlers::handle_create_capability(
            &self.state,
            NewCapability {
                name: format!("{} lab", code),
                short_code: code.to_string(),
            },
        )
        .await
        .expect("Failed to create capability")
    }
}

/// Connect to TEST_DATABASE_URL, if set, and run migrations.
pub async fn postgres() -> Option<PostgresPersistence> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;
    smartreq_core::migrations::run_postgres(&pool).await.ok()?;
    Some(PostgresPersistence::new(pool))
}

#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

// ============================================================================
// Payload Builders
// ============================================================================

pub fn method(code: &str, capability_id: Option<&str>, samples: &[&str]) -> TestMethodInput {
    TestMethodInput {
        id: Some(format!("m-{}", code.to_lowercase())),
        method_code: code.to_string(),
        name: None,
        capability_id: capability_id.map(str::to_string),
        selected: true,
        is_deleted: false,
        samples: samples.iter().map(|s| s.to_string()).collect(),
        instances: Vec::new(),
        requirements: None,
    }
}

pub fn instance(samples: &[&str], requirements: &str) -> RepeatInstance {
    RepeatInstance {
        samples: samples.iter().map(|s| s.to_string()).collect(),
        requirements: Some(requirements.to_string()),
    }
}

pub fn submission(methods: Vec<TestMethodInput>, samples: &[&str]) -> Submission {
    Submission {
        submission_id: None,
        requester_name: "Ann Example".to_string(),
        requester_email: Some("ann@example.com".to_string()),
        cost_center: None,
        priority: Priority::Normal,
        test_methods: methods,
        samples: samples
            .iter()
            .map(|name| {
                let mut details = serde_json::Map::new();
                details.insert("category".to_string(), serde_json::json!("resin"));
                SampleInput {
                    generated_name: name.to_string(),
                    details,
                }
            })
            .collect(),
    }
}
