// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Entity writer.
//!
//! An entity is stored as one retained message per attribute, each with
//! two lineage siblings (`createdAt`, `modifiedAt`). The writer also
//! keeps the discovery advertisement of the entity's shape current.
//!
//! Every operation validates and encodes all of its paths before the
//! first broker connection is opened.

use crate::broker::{Connector, Endpoint, QoS, Session};
use crate::config::{Granularity, NodeConfig};
use crate::entity::{encode_payload, Entity, RESERVED_KEYS};
use crate::error::{ContextError, Result};
use crate::oracle::ExistenceOracle;
use crate::retract::clear_retained;
use crate::topic::{
    AdvertisementTopic, AttributeSegment, AttributeSelector, EntityPattern, EntityTopic,
    LOCAL_ORIGIN,
};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a batch operation: per-entity outcomes, never all-or-nothing.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl BatchOutcome {
    fn record(&mut self, id: &str, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => self.succeeded.push(id.to_string()),
            // Refused credentials will refuse every other entity too.
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("Batch entry {} failed: {}", id, e);
                self.failed.push((id.to_string(), e.to_string()));
            }
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Encoded retained publishes of one operation.
type Writes = Vec<(String, Vec<u8>)>;

/// Writes entities to the local broker.
#[derive(Clone)]
pub struct EntityWriter<C: Connector> {
    connector: C,
    config: Arc<NodeConfig>,
    endpoint: Endpoint,
    oracle: ExistenceOracle<C>,
}

impl<C: Connector> EntityWriter<C> {
    pub fn new(connector: C, config: Arc<NodeConfig>) -> Self {
        let endpoint = config.endpoint();
        let oracle = ExistenceOracle::new(connector.clone(), endpoint.clone());
        Self {
            connector,
            config,
            endpoint,
            oracle,
        }
    }

    /// Create an entity; `AlreadyExists` if its id is taken for this
    /// context and type in any area.
    pub async fn create(&self, entity: &Entity) -> Result<()> {
        self.create_with(entity, false, None).await
    }

    /// Create or overwrite, skipping the existence check.
    pub async fn upsert(&self, entity: &Entity) -> Result<()> {
        self.create_with(entity, true, None).await
    }

    async fn create_with(
        &self,
        entity: &Entity,
        bypass_existence_check: bool,
        advertised: Option<&mut HashSet<(String, String)>>,
    ) -> Result<()> {
        let base = EntityTopic::new(
            &self.config.area,
            &entity.context,
            &entity.entity_type,
            LOCAL_ORIGIN,
            &entity.id,
        )?;
        // An entity lives only in its attribute messages.
        if entity.attributes.is_empty() {
            return Err(ContextError::InvalidInput(format!(
                "entity {} carries no attributes",
                entity.id
            )));
        }
        let ts = Value::String(timestamp());
        let writes = attribute_writes(&base, &entity.attributes, Some(&ts), &ts)?;
        let advert = self.advertisement(entity)?;

        if !bypass_existence_check {
            let pattern = EntityPattern::any()
                .context(&entity.context)
                .entity_type(&entity.entity_type)
                .id(&entity.id)
                .build()?;
            if self.oracle.exists(&pattern, self.config.timing.probe()).await? {
                return Err(ContextError::AlreadyExists(entity.id.clone()));
            }
        }

        self.publish_all(&writes).await?;
        info!(
            "Created entity {} ({} attributes) under {}",
            entity.id,
            entity.attributes.len(),
            base
        );

        let shape = (entity.context.clone(), entity.entity_type.clone());
        let already = advertised.as_ref().is_some_and(|set| set.contains(&shape));
        if !already {
            self.advertise(&advert, bypass_existence_check, &ts).await?;
        }
        if let Some(set) = advertised {
            set.insert(shape);
        }
        Ok(())
    }

    fn advertisement(&self, entity: &Entity) -> Result<AdvertisementTopic> {
        let id = match self.config.advertisement.granularity {
            Granularity::Coarse => None,
            Granularity::PerEntity => Some(entity.id.clone()),
        };
        AdvertisementTopic::new(
            &self.config.broker.host,
            self.config.broker.port,
            &self.config.area,
            &entity.context,
            &entity.entity_type,
            id,
        )
    }

    /// Publish the advertisement unless a coarse one already exists.
    async fn advertise(&self, advert: &AdvertisementTopic, force: bool, ts: &Value) -> Result<()> {
        let path = advert.encode();
        let per_entity = advert.id.is_some();
        if !force
            && !per_entity
            && self
                .oracle
                .exists(&path, self.config.timing.advertisement())
                .await?
        {
            debug!("Advertisement {} already present", path);
            return Ok(());
        }
        let payload = encode_payload(&json!({
            "createdAt": ts,
            "location": self.config.location,
        }));

        let mut session = self.connector.connect(&self.endpoint).await?;
        let published = session
            .publish(&path, payload, QoS::ExactlyOnce, true)
            .await;
        close(&mut session).await;
        published?;
        info!("Advertised {}", path);
        Ok(())
    }

    /// Locate an entity by id. Searches every area unless `area` is given.
    async fn locate(&self, id: &str, context: Option<&str>, area: Option<&str>) -> Result<EntityTopic> {
        let mut pattern = EntityPattern::any().id(id);
        if let Some(ctx) = context {
            pattern = pattern.context(ctx);
        }
        if let Some(area) = area {
            pattern = pattern.area(area);
        }
        let pattern = pattern.build()?;
        let topic = self
            .oracle
            .probe(&pattern, self.config.timing.probe())
            .await?
            .ok_or_else(|| ContextError::NotFound(id.to_string()))?;
        Ok(EntityTopic::decode(&topic)?.entity())
    }

    /// Patch the given attributes of an existing entity. Only the
    /// `modifiedAt` lineage is refreshed.
    pub async fn update(
        &self,
        id: &str,
        context: Option<&str>,
        attributes: &Map<String, Value>,
    ) -> Result<EntityTopic> {
        let attributes: Map<String, Value> = attributes
            .iter()
            .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if attributes.is_empty() {
            return Err(ContextError::InvalidInput(format!(
                "update of {id} carries no attributes"
            )));
        }
        // Reject malformed names before probing.
        let probe_base = EntityTopic::new("a", context.unwrap_or("c"), "t", LOCAL_ORIGIN, id)?;
        let ts = Value::String(timestamp());
        attribute_writes(&probe_base, &attributes, None, &ts)?;

        let located = self.locate(id, context, None).await?;
        let writes = attribute_writes(&located, &attributes, None, &ts)?;
        self.publish_all(&writes).await?;
        info!("Updated {} attributes of {}", attributes.len(), located);
        Ok(located)
    }

    /// Patch a single attribute.
    pub async fn update_attribute(
        &self,
        id: &str,
        context: Option<&str>,
        name: &str,
        value: Value,
    ) -> Result<EntityTopic> {
        let mut attrs = Map::new();
        attrs.insert(name.to_string(), value);
        self.update(id, context, &attrs).await
    }

    /// Delete an entity of the local area and, when it was the last of
    /// its shape, retract the advertisement.
    pub async fn delete_entity(&self, id: &str, context: Option<&str>) -> Result<()> {
        let located = self.locate(id, context, Some(&self.config.area)).await?;
        let timing = &self.config.timing;
        let cleared = clear_retained(
            &self.connector,
            &self.endpoint,
            &located.subtree(),
            timing.clear(),
            timing.clear_grace(),
        )
        .await?;
        info!("Deleted {} ({} paths cleared)", located, cleared.len());

        match self.config.advertisement.granularity {
            Granularity::PerEntity => {
                let advert = self.located_advertisement(&located, Some(id.to_string()))?;
                self.retract(&advert).await?;
            }
            Granularity::Coarse if self.config.advertisement.retract_on_last_delete => {
                let remaining = EntityPattern::any()
                    .area(&located.area)
                    .context(&located.context)
                    .entity_type(&located.entity_type)
                    .build()?;
                if !self.oracle.exists(&remaining, timing.probe()).await? {
                    let advert = self.located_advertisement(&located, None)?;
                    self.retract(&advert).await?;
                }
            }
            Granularity::Coarse => {}
        }
        Ok(())
    }

    fn located_advertisement(
        &self,
        located: &EntityTopic,
        id: Option<String>,
    ) -> Result<AdvertisementTopic> {
        AdvertisementTopic::new(
            &self.config.broker.host,
            self.config.broker.port,
            &located.area,
            &located.context,
            &located.entity_type,
            id,
        )
    }

    async fn retract(&self, advert: &AdvertisementTopic) -> Result<()> {
        let timing = &self.config.timing;
        let cleared = clear_retained(
            &self.connector,
            &self.endpoint,
            &advert.encode(),
            timing.clear(),
            timing.clear_grace(),
        )
        .await?;
        if !cleared.is_empty() {
            info!("Retracted advertisement {}", advert.encode());
        }
        Ok(())
    }

    /// Delete one attribute and its lineage.
    pub async fn delete_attribute(&self, id: &str, context: Option<&str>, name: &str) -> Result<()> {
        if AttributeSegment::classify(name).is_lineage() {
            return Err(ContextError::InvalidInput(format!(
                "'{name}' is a lineage path, not an attribute"
            )));
        }
        let mut pattern = EntityPattern::any()
            .area(&self.config.area)
            .id(id)
            .attribute(AttributeSelector::Named(name.to_string()));
        if let Some(ctx) = context {
            pattern = pattern.context(ctx);
        }
        let pattern = pattern.build()?;

        let topic = self
            .oracle
            .probe(&pattern, self.config.timing.probe())
            .await?
            .ok_or_else(|| ContextError::NotFound(format!("{id}/{name}")))?;
        let located = EntityTopic::decode(&topic)?;

        let timing = &self.config.timing;
        for path in [
            located.encode(),
            located.entity().created_at(name)?.encode(),
            located.entity().modified_at(name)?.encode(),
        ] {
            clear_retained(
                &self.connector,
                &self.endpoint,
                &path,
                timing.clear(),
                timing.clear_grace(),
            )
            .await?;
        }
        info!("Deleted attribute {} of {}", name, located.entity());
        Ok(())
    }

    /// Create each entity; shapes advertised earlier in the batch are
    /// not probed again.
    pub async fn batch_create(&self, entities: &[Entity]) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let mut advertised = HashSet::new();
        for entity in entities {
            let result = self.create_with(entity, false, Some(&mut advertised)).await;
            outcome.record(&entity.id, result)?;
        }
        Ok(outcome)
    }

    pub async fn batch_upsert(&self, entities: &[Entity]) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let mut advertised = HashSet::new();
        for entity in entities {
            let result = self.create_with(entity, true, Some(&mut advertised)).await;
            outcome.record(&entity.id, result)?;
        }
        Ok(outcome)
    }

    /// Update existing entities; missing ids fail individually.
    pub async fn batch_update(&self, entities: &[Entity]) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for entity in entities {
            let result = self
                .update(&entity.id, Some(&entity.context), &entity.attributes)
                .await
                .map(|_| ());
            outcome.record(&entity.id, result)?;
        }
        Ok(outcome)
    }

    pub async fn batch_delete(&self, ids: &[String], context: Option<&str>) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for id in ids {
            let result = self.delete_entity(id, context).await;
            outcome.record(id, result)?;
        }
        Ok(outcome)
    }

    async fn publish_all(&self, writes: &Writes) -> Result<()> {
        let qos = self.config.write_qos();
        let mut session = self.connector.connect(&self.endpoint).await?;
        let mut outcome = Ok(());
        for (topic, payload) in writes {
            if let Err(e) = session.publish(topic, payload.clone(), qos, true).await {
                outcome = Err(e.into());
                break;
            }
            debug!("Published {}", topic);
        }
        close(&mut session).await;
        outcome
    }
}

async fn close<S: Session>(session: &mut S) {
    if let Err(e) = session.close().await {
        warn!("Closing writer session failed: {}", e);
    }
}

/// Encode attribute and lineage publishes; `created` is written only
/// on create.
fn attribute_writes(
    base: &EntityTopic,
    attributes: &Map<String, Value>,
    created: Option<&Value>,
    modified: &Value,
) -> Result<Writes> {
    let mut writes = Vec::with_capacity(attributes.len() * 3);
    for (name, value) in attributes {
        if AttributeSegment::classify(name).is_lineage() {
            return Err(ContextError::InvalidInput(format!(
                "attribute name '{name}' collides with a lineage suffix"
            )));
        }
        writes.push((base.attribute(name)?.encode(), encode_payload(value)));
        if let Some(ts) = created {
            writes.push((base.created_at(name)?.encode(), encode_payload(ts)));
        }
        writes.push((base.modified_at(name)?.encode(), encode_payload(modified)));
    }
    Ok(writes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, MemoryConnector};
    use crate::entity::decode_payload;
    use serde_json::json;

    const CTX: &str = "ctx";

    fn config(granularity: Granularity) -> Arc<NodeConfig> {
        let mut config = NodeConfig {
            area: "zoneA".into(),
            location: "lab".into(),
            ..NodeConfig::default()
        };
        config.advertisement.granularity = granularity;
        Arc::new(config)
    }

    fn writer(broker: &MemoryBroker, granularity: Granularity) -> EntityWriter<MemoryConnector> {
        EntityWriter::new(broker.connector(), config(granularity))
    }

    fn sensor(id: &str, temp: i64) -> Entity {
        Entity::new(id, "Sensor", CTX).with_attribute("temp", json!(temp))
    }

    fn retained(broker: &MemoryBroker, pattern: &str) -> Vec<String> {
        broker.retained_topics("localhost", 1026, pattern)
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_writes_attributes_lineage_and_advert() {
        let broker = MemoryBroker::new();
        writer(&broker, Granularity::Coarse)
            .create(&sensor("s1", 21))
            .await
            .unwrap();

        assert_eq!(
            retained(&broker, "zoneA/entities/ctx/Sensor/LNA/s1/#"),
            vec![
                "zoneA/entities/ctx/Sensor/LNA/s1/temp",
                "zoneA/entities/ctx/Sensor/LNA/s1/temp_timerelsystem_CreatedAt",
                "zoneA/entities/ctx/Sensor/LNA/s1/temp_timerelsystem_modifiedAt",
            ]
        );
        let advert = broker
            .retained("localhost", 1026, "provider/localhost/1026/zoneA/ctx/Sensor")
            .unwrap();
        let advert = decode_payload("advert", &advert).unwrap();
        assert_eq!(advert["location"], json!("lab"));
        assert!(advert["createdAt"].is_string());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_twice_is_already_exists() {
        let broker = MemoryBroker::new();
        let w = writer(&broker, Granularity::Coarse);
        w.create(&sensor("s1", 21)).await.unwrap();
        let err = w.create(&sensor("s1", 22)).await.unwrap_err();
        assert!(matches!(err, ContextError::AlreadyExists(_)));

        w.upsert(&sensor("s1", 23)).await.unwrap();
        let temp = broker
            .retained("localhost", 1026, "zoneA/entities/ctx/Sensor/LNA/s1/temp")
            .unwrap();
        assert_eq!(temp, b"23".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_entity_touches_nothing() {
        let broker = MemoryBroker::new();
        broker.set_reachable("localhost", 1026, false);
        let bad = Entity::new("s/1", "Sensor", CTX).with_attribute("temp", json!(1));
        let err = writer(&broker, Granularity::Coarse)
            .create(&bad)
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::InvalidInput(_)));

        let lineage_named = Entity::new("s1", "Sensor", CTX)
            .with_attribute("temp_timerelsystem_CreatedAt", json!(1));
        let err = writer(&broker, Granularity::Coarse)
            .create(&lineage_named)
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::InvalidInput(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entity_without_attributes_is_rejected() {
        let broker = MemoryBroker::new();
        let w = writer(&broker, Granularity::Coarse);
        let bare = Entity::new("s1", "Sensor", CTX);
        for _ in 0..2 {
            let err = w.create(&bare).await.unwrap_err();
            assert!(matches!(err, ContextError::InvalidInput(_)));
        }
        assert!(matches!(
            w.upsert(&bare).await,
            Err(ContextError::InvalidInput(_))
        ));
        assert!(retained(&broker, "#").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_refreshes_only_modified_at() {
        let broker = MemoryBroker::new();
        let w = writer(&broker, Granularity::Coarse);
        w.create(&sensor("s1", 21)).await.unwrap();
        let created_before = broker.retained(
            "localhost",
            1026,
            "zoneA/entities/ctx/Sensor/LNA/s1/temp_timerelsystem_CreatedAt",
        );

        let mut attrs = Map::new();
        attrs.insert("temp".into(), json!(30));
        attrs.insert("hum".into(), json!(55));
        let located = w.update("s1", None, &attrs).await.unwrap();
        assert_eq!(located.entity_type, "Sensor");

        assert_eq!(
            broker.retained("localhost", 1026, "zoneA/entities/ctx/Sensor/LNA/s1/temp"),
            Some(b"30".to_vec())
        );
        assert_eq!(
            broker.retained(
                "localhost",
                1026,
                "zoneA/entities/ctx/Sensor/LNA/s1/temp_timerelsystem_CreatedAt"
            ),
            created_before
        );
        assert!(broker
            .retained("localhost", 1026, "zoneA/entities/ctx/Sensor/LNA/s1/hum_timerelsystem_CreatedAt")
            .is_none());
        assert!(broker
            .retained("localhost", 1026, "zoneA/entities/ctx/Sensor/LNA/s1/hum_timerelsystem_modifiedAt")
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_missing_is_not_found() {
        let broker = MemoryBroker::new();
        let err = writer(&broker, Granularity::Coarse)
            .update_attribute("ghost", None, "temp", json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_last_entity_retracts_coarse_advert() {
        let broker = MemoryBroker::new();
        let w = writer(&broker, Granularity::Coarse);
        w.create(&sensor("s1", 21)).await.unwrap();
        w.create(&sensor("s2", 22)).await.unwrap();
        let advert = "provider/localhost/1026/zoneA/ctx/Sensor";

        w.delete_entity("s1", None).await.unwrap();
        assert!(retained(&broker, "zoneA/entities/ctx/Sensor/LNA/s1/#").is_empty());
        assert!(broker.retained("localhost", 1026, advert).is_some());

        w.delete_entity("s2", Some(CTX)).await.unwrap();
        assert!(broker.retained("localhost", 1026, advert).is_none());

        let err = w.delete_entity("s2", None).await.unwrap_err();
        assert!(matches!(err, ContextError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_advert_kept_when_retraction_disabled() {
        let broker = MemoryBroker::new();
        let mut cfg = (*config(Granularity::Coarse)).clone();
        cfg.advertisement.retract_on_last_delete = false;
        let w = EntityWriter::new(broker.connector(), Arc::new(cfg));
        w.create(&sensor("s1", 21)).await.unwrap();
        w.delete_entity("s1", None).await.unwrap();
        assert!(broker
            .retained("localhost", 1026, "provider/localhost/1026/zoneA/ctx/Sensor")
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_entity_adverts() {
        let broker = MemoryBroker::new();
        let w = writer(&broker, Granularity::PerEntity);
        w.create(&sensor("s1", 21)).await.unwrap();
        w.create(&sensor("s2", 22)).await.unwrap();
        assert_eq!(
            retained(&broker, "provider/#"),
            vec![
                "provider/localhost/1026/zoneA/ctx/Sensor/s1",
                "provider/localhost/1026/zoneA/ctx/Sensor/s2",
            ]
        );
        w.delete_entity("s1", None).await.unwrap();
        assert_eq!(
            retained(&broker, "provider/#"),
            vec!["provider/localhost/1026/zoneA/ctx/Sensor/s2"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_attribute_keeps_siblings() {
        let broker = MemoryBroker::new();
        let w = writer(&broker, Granularity::Coarse);
        let entity = sensor("s1", 21).with_attribute("hum", json!(40));
        w.create(&entity).await.unwrap();

        w.delete_attribute("s1", None, "temp").await.unwrap();
        assert_eq!(
            retained(&broker, "zoneA/entities/ctx/Sensor/LNA/s1/#"),
            vec![
                "zoneA/entities/ctx/Sensor/LNA/s1/hum",
                "zoneA/entities/ctx/Sensor/LNA/s1/hum_timerelsystem_CreatedAt",
                "zoneA/entities/ctx/Sensor/LNA/s1/hum_timerelsystem_modifiedAt",
            ]
        );
        let err = w.delete_attribute("s1", None, "temp").await.unwrap_err();
        assert!(matches!(err, ContextError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_outcomes() {
        let broker = MemoryBroker::new();
        let w = writer(&broker, Granularity::Coarse);
        w.create(&sensor("s2", 1)).await.unwrap();

        let outcome = w
            .batch_create(&[sensor("s1", 1), sensor("s2", 2), sensor("s3", 3)])
            .await
            .unwrap();
        assert_eq!(outcome.succeeded, vec!["s1", "s3"]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, "s2");

        let outcome = w
            .batch_update(&[sensor("s1", 10), sensor("s9", 9)])
            .await
            .unwrap();
        assert_eq!(outcome.succeeded, vec!["s1"]);
        assert_eq!(outcome.failed[0].0, "s9");

        let outcome = w
            .batch_delete(&["s1".to_string(), "s9".to_string()], None)
            .await
            .unwrap();
        assert_eq!(outcome.succeeded, vec!["s1"]);
        assert!(!outcome.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_aborts_on_auth_failure() {
        let broker = MemoryBroker::new();
        broker.add_user("localhost", 1026, "alice", "pw");
        let err = writer(&broker, Granularity::Coarse)
            .batch_upsert(&[sensor("s1", 1), sensor("s2", 2)])
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::Auth(_)));
    }
}
