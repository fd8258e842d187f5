// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Listening sessions.
//!
//! A [`Listener`] is a broker session subscribed to a set of patterns
//! and bounded by a movable deadline. Every wait races the next
//! delivered message against the deadline timer, so an idle window
//! costs nothing until one of them fires.

use crate::broker::{Connector, Endpoint, InboundMessage, QoS, Session};
use crate::error::{ContextError, Result};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// Deadline used when a window would overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(window: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(window).unwrap_or(now + FAR_FUTURE)
}

/// Outcome of one wait on a listener.
#[derive(Debug)]
pub enum Wait {
    Message(InboundMessage),
    /// Deadline reached with nothing delivered.
    Expired,
    /// The broker ended the connection.
    Closed,
}

/// Deadline-bounded subscription.
pub struct Listener<S: Session> {
    session: S,
    deadline: Instant,
    label: String,
}

impl<S: Session> Listener<S> {
    /// Connect, subscribe to every pattern and start the deadline.
    pub async fn open<C>(
        connector: &C,
        endpoint: &Endpoint,
        patterns: &[String],
        qos: QoS,
        window: Duration,
    ) -> Result<Self>
    where
        C: Connector<Session = S>,
    {
        let mut session = connector.connect(endpoint).await?;
        for pattern in patterns {
            session.subscribe(pattern, qos).await?;
        }
        debug!("Listening on {} for {:?} ({:?})", endpoint, patterns, window);
        Ok(Self {
            session,
            deadline: deadline_after(window),
            label: endpoint.to_string(),
        })
    }

    /// Wait for the next message or the deadline, whichever comes first.
    pub async fn next(&mut self) -> Wait {
        tokio::select! {
            msg = self.session.recv() => match msg {
                Some(msg) => Wait::Message(msg),
                None => Wait::Closed,
            },
            () = sleep_until(self.deadline) => Wait::Expired,
        }
    }

    /// Push the deadline back by `grace`.
    pub fn extend(&mut self, grace: Duration) {
        if let Some(later) = self.deadline.checked_add(grace) {
            self.deadline = later;
        }
    }

    /// Pull the deadline in to at most `remaining` from now.
    pub fn shorten(&mut self, remaining: Duration) {
        self.deadline = self.deadline.min(deadline_after(remaining));
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Error for a connection the broker ended before the deadline.
    pub fn lost(&self) -> ContextError {
        ContextError::Connection(format!("{}: connection lost mid-window", self.label))
    }

    /// Underlying session, for publishing on the same connection.
    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    /// Release the broker subscription and connection.
    pub async fn close(mut self) {
        if let Err(e) = self.session.close().await {
            warn!("Closing session on {} failed: {}", self.label, e);
        }
        debug!("Stopped listening on {}", self.label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn local() -> Endpoint {
        Endpoint::new("localhost", 1026)
    }

    #[tokio::test(start_paused = true)]
    async fn test_expires_without_messages() {
        let broker = MemoryBroker::new();
        let mut listener = Listener::open(
            &broker.connector(),
            &local(),
            &["t/#".to_string()],
            QoS::AtMostOnce,
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        let start = Instant::now();
        assert!(matches!(listener.next().await, Wait::Expired));
        assert!(Instant::now() - start >= Duration::from_millis(100));
        listener.close().await;
        assert_eq!(broker.session_count("localhost", 1026), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retained_delivered_before_deadline() {
        let broker = MemoryBroker::new();
        broker.publish("localhost", 1026, "t/1", b"x", true);
        let mut listener = Listener::open(
            &broker.connector(),
            &local(),
            &["t/+".to_string()],
            QoS::AtMostOnce,
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        match listener.next().await {
            Wait::Message(msg) => assert_eq!(msg.topic, "t/1"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(listener.next().await, Wait::Expired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_and_shorten() {
        let broker = MemoryBroker::new();
        let mut listener = Listener::open(
            &broker.connector(),
            &local(),
            &[],
            QoS::AtMostOnce,
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        let base = listener.deadline();
        listener.extend(Duration::from_millis(50));
        assert_eq!(listener.deadline(), base + Duration::from_millis(50));
        listener.shorten(Duration::from_millis(10));
        assert!(listener.deadline() <= Instant::now() + Duration::from_millis(10));
        // Shortening never pushes the deadline out.
        let before = listener.deadline();
        listener.shorten(Duration::from_secs(60));
        assert_eq!(listener.deadline(), before);
    }

    #[tokio::test]
    async fn test_connect_failure_is_not_empty_result() {
        let broker = MemoryBroker::new();
        broker.set_reachable("localhost", 1026, false);
        let result = Listener::open(
            &broker.connector(),
            &local(),
            &["#".to_string()],
            QoS::AtMostOnce,
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(ContextError::Connection(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_window_saturates() {
        let broker = MemoryBroker::new();
        let mut listener = Listener::open(
            &broker.connector(),
            &local(),
            &[],
            QoS::AtMostOnce,
            Duration::MAX,
        )
        .await
        .unwrap();
        assert!(listener.deadline() > Instant::now() + Duration::from_secs(86_400 * 365));
        let before = listener.deadline();
        listener.extend(Duration::MAX);
        assert_eq!(listener.deadline(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_connection_is_closed() {
        let broker = MemoryBroker::new();
        let mut listener = Listener::open(
            &broker.connector(),
            &local(),
            &["t/#".to_string()],
            QoS::AtMostOnce,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        broker.set_reachable("localhost", 1026, false);
        assert!(matches!(listener.next().await, Wait::Closed));
        assert!(matches!(listener.lost(), ContextError::Connection(_)));
    }
}
