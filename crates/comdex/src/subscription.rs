// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscription manager.
//!
//! A subscription listens on the advertisement namespace of the local
//! broker. Each newly advertised `(endpoint, area, context, type)` key
//! gets one listening task against that endpoint; retracting the last
//! advertisement of a key stops its task. Everything runs until the
//! subscription expires or is cancelled.
//!
//! ```text
//!   local broker ──adverts──► supervisor ──spawn/stop──► source task (per key)
//!                                  │                          │
//!                                  └────── notifications ◄────┘
//! ```

use crate::broker::{Connector, Endpoint, InboundMessage, QoS, Session};
use crate::config::{CredentialStore, Granularity, NodeConfig};
use crate::entity::{encode_payload, group_messages, Entity};
use crate::error::{ContextError, Result};
use crate::session::{Listener, Wait};
use crate::topic::{
    advertisement_pattern, subscription_record, AdvertisementTopic, AttributeSelector,
    DiscoveryKey, EntityPattern, EntityTopic,
};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const NOTIFICATION_CAPACITY: usize = 256;

/// A validated subscription document.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRequest {
    pub id: String,
    /// `None` watches every context.
    pub context: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub watched_attributes: Vec<String>,
    /// Empty watches every area.
    pub areas: Vec<String>,
    pub expires: Duration,
    /// Document as received; published at the record path.
    pub document: Value,
}

fn string_field(obj: &serde_json::Map<String, Value>, key: &str) -> Result<Option<String>> {
    match obj.get(key) {
        None => Ok(None),
        Some(Value::String(s)) if !s.is_empty() => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(ContextError::InvalidInput(format!(
            "subscription field '{key}' is malformed: {other}"
        ))),
    }
}

fn string_list(value: &Value, what: &str) -> Result<Vec<String>> {
    let items = value
        .as_array()
        .ok_or_else(|| ContextError::InvalidInput(format!("{what} must be a list")))?;
    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| ContextError::InvalidInput(format!("{what} must hold strings")))
        })
        .collect()
}

impl SubscriptionRequest {
    /// Validate a subscription document.
    pub fn from_json(
        doc: &Value,
        fallback_context: Option<&str>,
        default_expiry: Duration,
    ) -> Result<Self> {
        let obj = doc
            .as_object()
            .ok_or_else(|| ContextError::InvalidInput("subscription must be a JSON object".into()))?;

        match obj.get("type").and_then(Value::as_str) {
            Some("Subscription") => {}
            other => {
                return Err(ContextError::InvalidInput(format!(
                    "subscription has invalid type {other:?}"
                )))
            }
        }
        let id = string_field(obj, "id")?
            .ok_or_else(|| ContextError::InvalidInput("subscription without an id".into()))?;

        let context = match obj.get("@context") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Array(items)) => items.first().and_then(Value::as_str).map(str::to_string),
            Some(_) => {
                return Err(ContextError::InvalidInput(
                    "subscription has a malformed @context".into(),
                ))
            }
            None => fallback_context.map(str::to_string),
        };

        let (entity_type, entity_id) = match obj.get("entities") {
            None => (None, None),
            Some(Value::Array(list)) => match list.first() {
                Some(Value::Object(first)) => {
                    (string_field(first, "type")?, string_field(first, "id")?)
                }
                Some(_) => {
                    return Err(ContextError::InvalidInput(
                        "subscription entities must be objects".into(),
                    ))
                }
                None => (None, None),
            },
            Some(_) => {
                return Err(ContextError::InvalidInput(
                    "subscription entities must be a list".into(),
                ))
            }
        };

        let watched_attributes = match obj.get("watchedAttributes") {
            None => Vec::new(),
            Some(value) => {
                let attrs = string_list(value, "watchedAttributes")?;
                if attrs.is_empty() {
                    return Err(ContextError::InvalidInput(
                        "watchedAttributes without content".into(),
                    ));
                }
                attrs
            }
        };

        let areas = match obj.get("area") {
            None => Vec::new(),
            Some(value) => string_list(value, "area")?,
        };

        let expires = match obj.get("expires") {
            None => default_expiry,
            Some(v) => v.as_u64().map(Duration::from_secs).ok_or_else(|| {
                ContextError::InvalidInput(format!("expires '{v}' is not a number of seconds"))
            })?,
        };

        if entity_type.is_none() && entity_id.is_none() && watched_attributes.is_empty() {
            return Err(ContextError::InvalidInput(
                "subscription names no entity type, id or watched attribute".into(),
            ));
        }

        let request = Self {
            id,
            context,
            entity_type,
            entity_id,
            watched_attributes,
            areas,
            expires,
            document: doc.clone(),
        };
        // Surface bad segments now rather than on the first advertisement.
        request.advertisement_patterns(false)?;
        request.entity_patterns("area", "ctx", None)?;
        Ok(request)
    }

    /// Path the subscription document is recorded at. A subscription
    /// watching every context has no publishable record path.
    pub fn record_topic(&self, area: &str) -> Result<Option<String>> {
        self.context
            .as_deref()
            .map(|ctx| subscription_record(area, ctx, &self.id))
            .transpose()
    }

    /// Advertisement patterns, one per watched area.
    pub fn advertisement_patterns(&self, per_entity: bool) -> Result<Vec<String>> {
        let areas: Vec<Option<&str>> = if self.areas.is_empty() {
            vec![None]
        } else {
            self.areas.iter().map(|a| Some(a.as_str())).collect()
        };
        areas
            .into_iter()
            .map(|area| {
                advertisement_pattern(
                    area,
                    self.context.as_deref(),
                    self.entity_type.as_deref(),
                    self.entity_id.as_deref(),
                    per_entity,
                )
            })
            .collect()
    }

    /// Entity patterns for one discovered area.
    ///
    /// Type and id narrow the path when known; watched attributes yield
    /// one pattern each, otherwise the whole entity subtree is watched.
    pub fn entity_patterns(
        &self,
        area: &str,
        context: &str,
        entity_type: Option<&str>,
    ) -> Result<Vec<String>> {
        let mut base = EntityPattern::any().area(area).context(context);
        if let Some(t) = entity_type.or(self.entity_type.as_deref()) {
            base = base.entity_type(t);
        }
        if let Some(id) = &self.entity_id {
            base = base.id(id);
        }
        if self.watched_attributes.is_empty() {
            return Ok(vec![base.build()?]);
        }
        self.watched_attributes
            .iter()
            .map(|attr| {
                base.clone()
                    .attribute(AttributeSelector::Named(attr.clone()))
                    .build()
            })
            .collect()
    }
}

/// Event delivered to the subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// An attribute update, as a single-attribute entity document.
    Entity(Entity),
    /// A watched attribute was cleared.
    Retracted { topic: String },
    SourceAdded(DiscoveryKey),
    SourceRemoved(DiscoveryKey),
    /// The source could not be reached; its key stays recorded.
    SourceFailed { key: DiscoveryKey, reason: String },
}

/// Live subscription.
///
/// Dropping the handle cancels the subscription.
pub struct SubscriptionHandle {
    notifications: mpsc::Receiver<Notification>,
    sources: watch::Receiver<BTreeSet<DiscoveryKey>>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    /// Next notification; `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.notifications.recv().await
    }

    /// Keys with a listening task.
    pub fn sources(&self) -> BTreeSet<DiscoveryKey> {
        self.sources.borrow().clone()
    }

    pub fn watch_sources(&self) -> watch::Receiver<BTreeSet<DiscoveryKey>> {
        self.sources.clone()
    }

    /// Stop every listening task and wait for their sessions to close.
    ///
    /// Undelivered notifications are discarded.
    pub async fn cancel(mut self) {
        self.notifications.close();
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("Subscription supervisor ended abnormally: {}", e);
        }
    }
}

/// Starts subscriptions against the local broker.
#[derive(Clone)]
pub struct SubscriptionManager<C: Connector> {
    connector: C,
    config: Arc<NodeConfig>,
    credentials: Arc<CredentialStore>,
}

impl<C: Connector> SubscriptionManager<C> {
    pub fn new(connector: C, config: Arc<NodeConfig>, credentials: Arc<CredentialStore>) -> Self {
        Self {
            connector,
            config,
            credentials,
        }
    }

    /// Record the subscription document, then start listening for
    /// advertisements. Connection and authentication failures against
    /// the local broker are returned here.
    pub async fn start(&self, request: SubscriptionRequest) -> Result<SubscriptionHandle> {
        let record = request.record_topic(&self.config.area)?;
        let per_entity = self.config.advertisement.granularity == Granularity::PerEntity;
        let patterns = request.advertisement_patterns(per_entity)?;
        let endpoint = self.config.endpoint();

        let mut session = self.connector.connect(&endpoint).await?;
        let published = match &record {
            Some(topic) => {
                session
                    .publish(
                        topic,
                        encode_payload(&request.document),
                        self.config.write_qos(),
                        false,
                    )
                    .await
            }
            None => Ok(()),
        };
        if let Err(e) = session.close().await {
            warn!("Closing record session failed: {}", e);
        }
        published?;
        match &record {
            Some(topic) => info!("Recorded subscription {} at {}", request.id, topic),
            None => debug!("Subscription {} spans every context; not recorded", request.id),
        }

        let discovery = Listener::open(
            &self.connector,
            &endpoint,
            &patterns,
            QoS::ExactlyOnce,
            request.expires,
        )
        .await?;

        let (tx, rx) = mpsc::channel(NOTIFICATION_CAPACITY);
        let (sources_tx, sources_rx) = watch::channel(BTreeSet::new());
        let (stop_tx, stop_rx) = oneshot::channel();

        let supervisor = Supervisor {
            connector: self.connector.clone(),
            config: Arc::clone(&self.config),
            credentials: Arc::clone(&self.credentials),
            request: Arc::new(request),
            deadline: discovery.deadline(),
            notifications: tx,
            sources: sources_tx,
            active: HashMap::new(),
        };
        let task = tokio::spawn(supervisor.run(discovery, stop_rx));

        Ok(SubscriptionHandle {
            notifications: rx,
            sources: sources_rx,
            stop: Some(stop_tx),
            task,
        })
    }
}

/// Listening task of one discovery key.
struct Source {
    /// Advertisement paths currently backing the key.
    adverts: HashSet<String>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct Supervisor<C: Connector> {
    connector: C,
    config: Arc<NodeConfig>,
    credentials: Arc<CredentialStore>,
    request: Arc<SubscriptionRequest>,
    deadline: Instant,
    notifications: mpsc::Sender<Notification>,
    sources: watch::Sender<BTreeSet<DiscoveryKey>>,
    active: HashMap<DiscoveryKey, Source>,
}

impl<C: Connector> Supervisor<C> {
    async fn run(mut self, mut discovery: Listener<C::Session>, mut stop: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                _ = &mut stop => {
                    debug!("Subscription {} cancelled", self.request.id);
                    break;
                }
                wait = discovery.next() => match wait {
                    Wait::Message(msg) => self.on_advertisement(msg).await,
                    Wait::Expired => {
                        info!("Subscription {} expired", self.request.id);
                        break;
                    }
                    Wait::Closed => {
                        warn!("Advertisement session of subscription {} lost", self.request.id);
                        break;
                    }
                },
            }
        }
        discovery.close().await;

        let keys: Vec<DiscoveryKey> = self.active.keys().cloned().collect();
        for key in keys {
            self.stop_source(&key).await;
        }
    }

    async fn on_advertisement(&mut self, msg: InboundMessage) {
        let advert = match AdvertisementTopic::decode(&msg.topic) {
            Ok(a) => a,
            Err(e) => {
                debug!("Ignoring advertisement {}: {}", msg.topic, e);
                return;
            }
        };
        let key = advert.key();

        if msg.is_retraction() {
            let last = match self.active.get_mut(&key) {
                Some(source) => {
                    source.adverts.remove(&msg.topic);
                    source.adverts.is_empty()
                }
                None => false,
            };
            if last {
                info!("Advertisement for {} retracted", key);
                self.stop_source(&key).await;
            }
            return;
        }

        if let Some(source) = self.active.get_mut(&key) {
            source.adverts.insert(msg.topic);
            debug!("Advertisement for {} already followed", key);
            return;
        }

        info!("New advertisement for {}", key);
        let _ = self
            .notifications
            .send(Notification::SourceAdded(key.clone()))
            .await;
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(listen_source(
            self.connector.clone(),
            self.config
                .provider_endpoint(&key.host, key.port, &self.credentials),
            Arc::clone(&self.request),
            key.clone(),
            self.deadline,
            self.notifications.clone(),
            stop_rx,
        ));
        self.active.insert(
            key.clone(),
            Source {
                adverts: HashSet::from([msg.topic]),
                stop: stop_tx,
                task,
            },
        );
        self.publish_sources();
    }

    async fn stop_source(&mut self, key: &DiscoveryKey) {
        let Some(source) = self.active.remove(key) else {
            return;
        };
        let _ = source.stop.send(());
        if let Err(e) = source.task.await {
            warn!("Listener for {} ended abnormally: {}", key, e);
        }
        self.publish_sources();
        let _ = self
            .notifications
            .send(Notification::SourceRemoved(key.clone()))
            .await;
    }

    fn publish_sources(&self) {
        let keys: BTreeSet<DiscoveryKey> = self.active.keys().cloned().collect();
        self.sources.send_replace(keys);
    }
}

async fn listen_source<C: Connector>(
    connector: C,
    endpoint: Endpoint,
    request: Arc<SubscriptionRequest>,
    key: DiscoveryKey,
    deadline: Instant,
    notifications: mpsc::Sender<Notification>,
    mut stop: oneshot::Receiver<()>,
) {
    let patterns = match request.entity_patterns(&key.area, &key.context, Some(&key.entity_type)) {
        Ok(p) => p,
        Err(e) => {
            let _ = notifications
                .send(Notification::SourceFailed {
                    key,
                    reason: e.to_string(),
                })
                .await;
            return;
        }
    };
    let window = deadline.saturating_duration_since(Instant::now());
    let mut listener =
        match Listener::open(&connector, &endpoint, &patterns, QoS::AtLeastOnce, window).await {
            Ok(l) => l,
            Err(e) => {
                warn!("Cannot follow {} on {}: {}", key, endpoint, e);
                let _ = notifications
                    .send(Notification::SourceFailed {
                        key,
                        reason: e.to_string(),
                    })
                    .await;
                return;
            }
        };
    info!("Following {} on {}", key, endpoint);

    loop {
        let notification = tokio::select! {
            _ = &mut stop => break,
            wait = listener.next() => match wait {
                Wait::Message(msg) => match notification_for(msg) {
                    Some(notification) => notification,
                    None => continue,
                },
                Wait::Expired => break,
                Wait::Closed => {
                    let reason = listener.lost().to_string();
                    warn!("Lost {} on {}: {}", key, endpoint, reason);
                    let failed = Notification::SourceFailed {
                        key: key.clone(),
                        reason,
                    };
                    tokio::select! {
                        _ = &mut stop => {}
                        _ = notifications.send(failed) => {}
                    }
                    break;
                }
            },
        };
        // A full channel must not hold off a stop request.
        tokio::select! {
            _ = &mut stop => break,
            sent = notifications.send(notification) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    listener.close().await;
}

/// Lineage and non-entity topics yield nothing.
fn notification_for(msg: InboundMessage) -> Option<Notification> {
    let topic = EntityTopic::decode(&msg.topic).ok()?;
    if topic.segment()?.is_lineage() {
        return None;
    }
    if msg.is_retraction() {
        return Some(Notification::Retracted { topic: msg.topic });
    }
    group_messages([msg])
        .first()
        .map(|group| Notification::Entity(group.reassemble(false)))
}
