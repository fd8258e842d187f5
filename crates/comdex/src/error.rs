// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy.
//!
//! Transport failures ([`BrokerError`]) are kept apart from operation
//! outcomes ([`ContextError`]) so that "the broker could not be reached"
//! never collapses into "the entity does not exist".

use crate::config::ConfigError;
use crate::filter::FilterError;
use crate::geo::GeoError;
use thiserror::Error;

/// Transport-level failures reported by a [`crate::broker::Connector`]
/// or an open [`crate::broker::Session`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker {endpoint} unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },

    #[error("broker {endpoint} refused credentials")]
    NotAuthorized { endpoint: String },

    #[error("session disconnected: {0}")]
    Disconnected(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Outcome taxonomy of every library operation.
#[derive(Debug, Error)]
pub enum ContextError {
    /// Rejected before any broker I/O.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("entity {0} already exists")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Broker unreachable or session lost; retryable by the caller.
    #[error("connection failure: {0}")]
    Connection(String),

    /// Credentials refused; fatal.
    #[error("authentication failure: {0}")]
    Auth(String),

    #[error("malformed payload on {topic}: {reason}")]
    Decode { topic: String, reason: String },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ContextError {
    /// True when retrying with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// True when the operation must abort without retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

impl From<BrokerError> for ContextError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::NotAuthorized { .. } => Self::Auth(err.to_string()),
            other => Self::Connection(other.to_string()),
        }
    }
}

impl From<FilterError> for ContextError {
    fn from(err: FilterError) -> Self {
        Self::InvalidInput(err.to_string())
    }
}

impl From<GeoError> for ContextError {
    fn from(err: GeoError) -> Self {
        Self::InvalidInput(err.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T, E = ContextError> = std::result::Result<T, E>;
