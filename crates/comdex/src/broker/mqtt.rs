// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT 3.1.1 adapter.
//!
//! One `rumqttc` client per session. A driver task polls the event loop,
//! forwards inbound publishes over a channel and counts QoS>0
//! acknowledgements so that `close` can wait for in-flight writes.

use super::{Connector, Endpoint, InboundMessage, QoS, Session};
use crate::error::BrokerError;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const MAX_PACKET: usize = 1024 * 1024;
const REQUEST_CAPACITY: usize = 64;
const INBOUND_CAPACITY: usize = 256;

static NEXT_CLIENT: AtomicU64 = AtomicU64::new(1);

fn to_mqtt(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn from_mqtt(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
        rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn refused(endpoint: &Endpoint, code: ConnectReturnCode) -> BrokerError {
    match code {
        ConnectReturnCode::NotAuthorized | ConnectReturnCode::BadUserNamePassword => {
            BrokerError::NotAuthorized {
                endpoint: endpoint.to_string(),
            }
        }
        other => BrokerError::Unreachable {
            endpoint: endpoint.to_string(),
            reason: format!("connection refused: {other:?}"),
        },
    }
}

/// Connector for real MQTT brokers.
#[derive(Debug, Clone, Default)]
pub struct MqttConnector {
    client_prefix: Option<String>,
}

impl MqttConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix for generated client ids (default `comdex`).
    pub fn with_client_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.client_prefix = Some(prefix.into());
        self
    }

    fn client_id(&self) -> String {
        format!(
            "{}-{}-{}",
            self.client_prefix.as_deref().unwrap_or("comdex"),
            std::process::id(),
            NEXT_CLIENT.fetch_add(1, Ordering::Relaxed)
        )
    }
}

async fn await_connack(endpoint: &Endpoint, eventloop: &mut EventLoop) -> Result<(), BrokerError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(refused(endpoint, code)),
                };
            }
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => return Err(refused(endpoint, code)),
            Err(e) => {
                return Err(BrokerError::Unreachable {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl Connector for MqttConnector {
    type Session = MqttSession;

    async fn connect(&self, endpoint: &Endpoint) -> Result<MqttSession, BrokerError> {
        let mut options = MqttOptions::new(self.client_id(), endpoint.host.clone(), endpoint.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        options.set_max_packet_size(MAX_PACKET, MAX_PACKET);
        if let Some(creds) = &endpoint.credentials {
            options.set_credentials(creds.username.clone(), creds.password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        match tokio::time::timeout(CONNECT_TIMEOUT, await_connack(endpoint, &mut eventloop)).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(BrokerError::Unreachable {
                    endpoint: endpoint.to_string(),
                    reason: "CONNACK timeout".into(),
                })
            }
        }
        debug!("Connected to MQTT broker {}", endpoint);

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (acked_tx, acked_rx) = watch::channel(0u64);
        let driver = tokio::spawn(drive(endpoint.to_string(), eventloop, inbound_tx, acked_tx));

        Ok(MqttSession {
            endpoint: endpoint.to_string(),
            client,
            inbound: inbound_rx,
            acked: acked_rx,
            published: 0,
            driver,
        })
    }
}

async fn drive(
    endpoint: String,
    mut eventloop: EventLoop,
    inbound: mpsc::Sender<InboundMessage>,
    acked: watch::Sender<u64>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let msg = InboundMessage {
                    topic: p.topic,
                    payload: p.payload.to_vec(),
                    retain: p.retain,
                    qos: from_mqtt(p.qos),
                };
                if inbound.send(msg).await.is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::PubAck(_) | Packet::PubComp(_))) => {
                acked.send_modify(|n| *n += 1);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                trace!("Disconnect sent to {}", endpoint);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection to {} ended: {}", endpoint, e);
                break;
            }
        }
    }
}

/// Session on a real MQTT broker.
pub struct MqttSession {
    endpoint: String,
    client: AsyncClient,
    inbound: mpsc::Receiver<InboundMessage>,
    acked: watch::Receiver<u64>,
    /// QoS>0 publishes awaiting acknowledgement.
    published: u64,
    driver: JoinHandle<()>,
}

impl MqttSession {
    fn disconnected(&self, e: impl std::fmt::Display) -> BrokerError {
        BrokerError::Disconnected(format!("{}: {}", self.endpoint, e))
    }
}

#[async_trait]
impl Session for MqttSession {
    async fn subscribe(&mut self, pattern: &str, qos: QoS) -> Result<(), BrokerError> {
        self.client
            .subscribe(pattern, to_mqtt(qos))
            .await
            .map_err(|e| self.disconnected(e))
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), BrokerError> {
        self.client
            .publish(topic, to_mqtt(qos), retain, payload)
            .await
            .map_err(|e| self.disconnected(e))?;
        if qos != QoS::AtMostOnce {
            self.published += 1;
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<InboundMessage> {
        self.inbound.recv().await
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        let target = self.published;
        let acked = &mut self.acked;
        let flushed = tokio::time::timeout(CLOSE_TIMEOUT, async move {
            loop {
                let done = *acked.borrow_and_update() >= target;
                if done {
                    return true;
                }
                if acked.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;
        if flushed != Ok(true) {
            warn!(
                "Closing {} with {} unacknowledged publishes",
                self.endpoint,
                target.saturating_sub(*self.acked.borrow())
            );
        }
        self.client
            .disconnect()
            .await
            .map_err(|e| self.disconnected(e))?;
        self.inbound.close();
        Ok(())
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
