// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process broker network.
//!
//! Emulates any number of brokers, keyed by `host:port`, with MQTT
//! retained-message and wildcard semantics. Used by the test suites and
//! by offline demos; endpoints spring into existence on first connect.

use super::{Connector, Endpoint, InboundMessage, QoS, Session};
use crate::error::BrokerError;
use crate::topic::topic_matches;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

type Address = (String, u16);

#[derive(Default)]
struct Network {
    brokers: HashMap<Address, BrokerState>,
    next_session: u64,
}

#[derive(Default)]
struct BrokerState {
    retained: BTreeMap<String, (Vec<u8>, QoS)>,
    sessions: HashMap<u64, SessionSlot>,
    /// `Some` once a user is registered; anonymous connects are then refused.
    users: Option<HashMap<String, String>>,
    unreachable: bool,
}

struct SessionSlot {
    filters: Vec<(String, QoS)>,
    tx: mpsc::UnboundedSender<InboundMessage>,
}

impl SessionSlot {
    /// Granted QoS for `topic`, if any filter matches.
    fn granted(&self, topic: &str) -> Option<QoS> {
        self.filters
            .iter()
            .filter(|(pattern, _)| topic_matches(pattern, topic))
            .map(|(_, qos)| *qos)
            .max()
    }
}

impl BrokerState {
    fn fan_out(&mut self, topic: &str, payload: &[u8], qos: QoS) {
        self.sessions.retain(|_, slot| match slot.granted(topic) {
            Some(granted) => slot
                .tx
                .send(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                    retain: false,
                    qos: granted.min(qos),
                })
                .is_ok(),
            None => !slot.tx.is_closed(),
        });
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) {
        if retain {
            if payload.is_empty() {
                self.retained.remove(topic);
            } else {
                self.retained
                    .insert(topic.to_string(), (payload.to_vec(), qos));
            }
        }
        self.fan_out(topic, payload, qos);
    }
}

/// Handle to a shared in-process broker network.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Network>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector opening sessions on this network.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    /// Register a user; from then on the endpoint refuses other credentials.
    pub fn add_user(&self, host: &str, port: u16, username: &str, password: &str) {
        let mut net = self.inner.lock();
        net.brokers
            .entry((host.to_string(), port))
            .or_default()
            .users
            .get_or_insert_with(HashMap::new)
            .insert(username.to_string(), password.to_string());
    }

    /// Mark an endpoint (un)reachable. Going down drops its open sessions.
    pub fn set_reachable(&self, host: &str, port: u16, reachable: bool) {
        let mut net = self.inner.lock();
        let state = net.brokers.entry((host.to_string(), port)).or_default();
        state.unreachable = !reachable;
        if !reachable {
            state.sessions.clear();
        }
    }

    /// Publish from outside any session.
    pub fn publish(&self, host: &str, port: u16, topic: &str, payload: &[u8], retain: bool) {
        let mut net = self.inner.lock();
        net.brokers
            .entry((host.to_string(), port))
            .or_default()
            .publish(topic, payload, QoS::AtLeastOnce, retain);
    }

    /// Retained payload stored at `topic`.
    pub fn retained(&self, host: &str, port: u16, topic: &str) -> Option<Vec<u8>> {
        let net = self.inner.lock();
        net.brokers
            .get(&(host.to_string(), port))
            .and_then(|b| b.retained.get(topic))
            .map(|(payload, _)| payload.clone())
    }

    /// Retained topics matching `pattern`, sorted.
    pub fn retained_topics(&self, host: &str, port: u16, pattern: &str) -> Vec<String> {
        let net = self.inner.lock();
        net.brokers
            .get(&(host.to_string(), port))
            .map(|b| {
                b.retained
                    .keys()
                    .filter(|t| topic_matches(pattern, t))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Open sessions on an endpoint.
    pub fn session_count(&self, host: &str, port: u16) -> usize {
        let net = self.inner.lock();
        net.brokers
            .get(&(host.to_string(), port))
            .map(|b| b.sessions.values().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn open(&self, endpoint: &Endpoint) -> Result<MemorySession, BrokerError> {
        let mut net = self.inner.lock();
        net.next_session += 1;
        let id = net.next_session;
        let address = endpoint.address();
        let state = net.brokers.entry(address.clone()).or_default();

        if state.unreachable {
            return Err(BrokerError::Unreachable {
                endpoint: endpoint.to_string(),
                reason: "connection refused".into(),
            });
        }
        if let Some(users) = &state.users {
            let accepted = endpoint
                .credentials
                .as_ref()
                .is_some_and(|c| users.get(&c.username) == Some(&c.password));
            if !accepted {
                return Err(BrokerError::NotAuthorized {
                    endpoint: endpoint.to_string(),
                });
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.sessions.insert(
            id,
            SessionSlot {
                filters: Vec::new(),
                tx,
            },
        );
        trace!("memory session {} opened on {}", id, endpoint);

        Ok(MemorySession {
            broker: self.clone(),
            address,
            id,
            rx,
        })
    }

    fn with_slot<R>(
        &self,
        address: &Address,
        id: u64,
        f: impl FnOnce(&mut BrokerState) -> R,
    ) -> Result<R, BrokerError> {
        let mut net = self.inner.lock();
        match net.brokers.get_mut(address) {
            Some(state) if state.sessions.contains_key(&id) => Ok(f(state)),
            _ => Err(BrokerError::Disconnected(format!(
                "{}:{} session {}",
                address.0, address.1, id
            ))),
        }
    }

    fn release(&self, address: &Address, id: u64) {
        let mut net = self.inner.lock();
        if let Some(state) = net.brokers.get_mut(address) {
            if state.sessions.remove(&id).is_some() {
                trace!("memory session {} closed", id);
            }
        }
    }
}

/// [`Connector`] over a [`MemoryBroker`] network.
#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    type Session = MemorySession;

    async fn connect(&self, endpoint: &Endpoint) -> Result<MemorySession, BrokerError> {
        self.broker.open(endpoint)
    }
}

/// Session on a [`MemoryBroker`]; released on close or drop.
pub struct MemorySession {
    broker: MemoryBroker,
    address: Address,
    id: u64,
    rx: mpsc::UnboundedReceiver<InboundMessage>,
}

#[async_trait]
impl Session for MemorySession {
    async fn subscribe(&mut self, pattern: &str, qos: QoS) -> Result<(), BrokerError> {
        let id = self.id;
        self.broker.with_slot(&self.address, id, |state| {
            let replay: Vec<InboundMessage> = state
                .retained
                .iter()
                .filter(|(topic, _)| topic_matches(pattern, topic))
                .map(|(topic, (payload, stored))| InboundMessage {
                    topic: topic.clone(),
                    payload: payload.clone(),
                    retain: true,
                    qos: qos.min(*stored),
                })
                .collect();
            if let Some(slot) = state.sessions.get_mut(&id) {
                slot.filters.push((pattern.to_string(), qos));
                for msg in replay {
                    let _ = slot.tx.send(msg);
                }
            }
        })
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), BrokerError> {
        if topic.contains(['+', '#']) {
            return Err(BrokerError::Protocol(format!(
                "wildcard in publish topic '{topic}'"
            )));
        }
        self.broker.with_slot(&self.address, self.id, |state| {
            state.publish(topic, &payload, qos, retain);
        })
    }

    async fn recv(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.broker.release(&self.address, self.id);
        self.rx.close();
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.broker.release(&self.address, self.id);
    }
}
