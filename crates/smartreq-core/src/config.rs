// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;

use crate::allocator::SequenceScope;

/// Smart Request configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Database pool size
    pub max_connections: u32,
    /// How NTR request-number counters are scoped
    pub sequence_scope: SequenceScope,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `SMARTREQ_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `SMARTREQ_HTTP_PORT`: HTTP server port (default: 8080)
    /// - `SMARTREQ_MAX_CONNECTIONS`: Database pool size (default: 10)
    /// - `SMARTREQ_SEQUENCE_SCOPE`: `capability` or `monthly` (default: capability)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("SMARTREQ_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("SMARTREQ_DATABASE_URL"))?;

        let http_port: u16 = std::env::var("SMARTREQ_HTTP_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("SMARTREQ_HTTP_PORT", "must be a valid port number")
            })?;

        let max_connections: u32 = std::env::var("SMARTREQ_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "SMARTREQ_MAX_CONNECTIONS",
                "must be a positive integer",
            ))?;

        let sequence_scope = match std::env::var("SMARTREQ_SEQUENCE_SCOPE") {
            Ok(value) => value.parse().map_err(|_| {
                ConfigError::Invalid(
                    "SMARTREQ_SEQUENCE_SCOPE",
                    "must be 'capability' or 'monthly'",
                )
            })?,
            Err(_) => SequenceScope::default(),
        };

        Ok(Self {
            database_url,
            http_addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            max_connections,
            sequence_scope,
        })
    }

    /// Whether the configured URL points at SQLite.
    pub fn is_sqlite(&self) -> bool {
        self.database_url.starts_with("sqlite:")
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
