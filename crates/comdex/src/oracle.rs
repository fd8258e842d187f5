// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Existence oracle.
//!
//! Answers "does a retained message matching this pattern hold a
//! payload right now?" with a short listening window. A connection or
//! authentication failure is an error, never a `false`.

use crate::broker::{Connector, Endpoint, QoS};
use crate::error::Result;
use crate::session::{Listener, Wait};
use std::time::Duration;
use tracing::{debug, trace};

/// Pattern probes against one endpoint.
#[derive(Clone)]
pub struct ExistenceOracle<C: Connector> {
    connector: C,
    endpoint: Endpoint,
}

impl<C: Connector> ExistenceOracle<C> {
    pub fn new(connector: C, endpoint: Endpoint) -> Self {
        Self {
            connector,
            endpoint,
        }
    }

    /// First topic matching `pattern` that carries a payload, or `None`
    /// once `budget` elapses.
    pub async fn probe(&self, pattern: &str, budget: Duration) -> Result<Option<String>> {
        let mut listener = Listener::open(
            &self.connector,
            &self.endpoint,
            &[pattern.to_string()],
            QoS::AtMostOnce,
            budget,
        )
        .await?;

        let found = loop {
            match listener.next().await {
                Wait::Message(msg) if !msg.is_retraction() => break Ok(Some(msg.topic)),
                Wait::Message(msg) => trace!("probe ignoring retraction on {}", msg.topic),
                Wait::Expired => break Ok(None),
                Wait::Closed => break Err(listener.lost()),
            }
        };
        listener.close().await;
        let found = found?;

        debug!(
            "probe {} on {}: {}",
            pattern,
            self.endpoint,
            found.as_deref().unwrap_or("nothing")
        );
        Ok(found)
    }

    pub async fn exists(&self, pattern: &str, budget: Duration) -> Result<bool> {
        Ok(self.probe(pattern, budget).await?.is_some())
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}
