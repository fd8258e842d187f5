// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Retained-message retraction.

use crate::broker::{Connector, Endpoint, QoS, Session};
use crate::error::Result;
use crate::session::{Listener, Wait};
use std::time::Duration;
use tracing::debug;

/// Clear every retained message currently matching `pattern`.
///
/// Each replayed retained path gets an empty retained publish on the
/// same connection; each clear extends the window by `grace` so a large
/// subtree replayed in bursts is fully drained. Returns the cleared
/// paths.
pub async fn clear_retained<C: Connector>(
    connector: &C,
    endpoint: &Endpoint,
    pattern: &str,
    window: Duration,
    grace: Duration,
) -> Result<Vec<String>> {
    let mut listener = Listener::open(
        connector,
        endpoint,
        &[pattern.to_string()],
        QoS::AtLeastOnce,
        window,
    )
    .await?;

    let mut cleared = Vec::new();
    let outcome: Result<()> = loop {
        match listener.next().await {
            // Live traffic (including our own empty publishes) is not retained state.
            Wait::Message(msg) if !msg.retain || msg.is_retraction() => {}
            Wait::Message(msg) => {
                if let Err(e) = listener
                    .session_mut()
                    .publish(&msg.topic, Vec::new(), QoS::AtLeastOnce, true)
                    .await
                {
                    break Err(e.into());
                }
                listener.extend(grace);
                cleared.push(msg.topic);
            }
            Wait::Expired => break Ok(()),
            Wait::Closed => break Err(listener.lost()),
        }
    };
    listener.close().await;
    outcome?;

    debug!("cleared {} retained paths under {}", cleared.len(), pattern);
    Ok(cleared)
}
