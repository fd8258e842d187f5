// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pub/sub broker abstraction.
//!
//! Every component talks to the broker through [`Connector`] and
//! [`Session`], so the context store runs unchanged against a real MQTT
//! broker ([`MqttConnector`]) or the in-process [`MemoryBroker`].
//!
//! Required semantics:
//! - a retained publish replaces the stored value of its exact path, and
//!   an empty retained publish clears it;
//! - a new subscriber receives the retained values matching its pattern
//!   right after subscribing, flagged `retain = true`;
//! - `+` matches one path level and a trailing `#` the remaining levels;
//! - refused credentials surface as [`BrokerError::NotAuthorized`].

pub mod memory;
pub mod mqtt;

pub use memory::{MemoryBroker, MemoryConnector};
pub use mqtt::MqttConnector;

use crate::error::BrokerError;
use async_trait::async_trait;
use std::fmt;

/// Delivery assurance level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }
}

/// Username/password pair presented at connect.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Broker address plus the credentials to present.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Host and port, credentials dropped.
    pub fn address(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Message delivered to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Replayed from the retained store rather than published live.
    pub retain: bool,
    pub qos: QoS,
}

impl InboundMessage {
    /// Empty payloads are retraction notices.
    pub fn is_retraction(&self) -> bool {
        self.payload.is_empty()
    }
}

/// One broker connection.
///
/// `recv` must be cancel safe: it is raced against deadlines with
/// `tokio::select!`.
#[async_trait]
pub trait Session: Send + 'static {
    async fn subscribe(&mut self, pattern: &str, qos: QoS) -> Result<(), BrokerError>;

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), BrokerError>;

    /// Next delivered message, or `None` once the connection has ended.
    async fn recv(&mut self) -> Option<InboundMessage>;

    /// Flush pending acknowledgements and disconnect.
    async fn close(&mut self) -> Result<(), BrokerError>;
}

/// Opens sessions against broker endpoints.
#[async_trait]
pub trait Connector: Clone + Send + Sync + 'static {
    type Session: Session;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Session, BrokerError>;
}
