// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Entity reader and query engine.
//!
//! A query is answered in two steps. With forwarding on, providers are
//! first discovered from the advertisements held by the local broker;
//! then one bounded listening window per provider collects retained
//! attribute messages, which are grouped, reassembled and filtered.
//!
//! The listening window tolerates retained replays arriving in bursts:
//! each message for a new entity pushes the deadline back by a grace
//! increment, and seeing one more entity than the limit closes it.

use crate::broker::{Connector, Endpoint, InboundMessage, QoS, Session};
use crate::config::{CredentialStore, Granularity, NodeConfig};
use crate::entity::{group_messages, Entity};
use crate::error::{ContextError, Result};
use crate::filter::QueryFilter;
use crate::geo::GeoQuery;
use crate::session::{Listener, Wait};
use crate::topic::{
    advertisement_pattern, AdvertisementTopic, AttributeSelector, EntityPattern, EntityTopic,
    CREATED_AT_SUFFIX, MODIFIED_AT_SUFFIX,
};
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Parsed `GET/entities` query.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub id: Option<String>,
    /// Applied to ids after reassembly.
    pub id_pattern: Option<Regex>,
    /// Each type is queried in turn; empty means any type.
    pub types: Vec<String>,
    /// Projection; empty keeps every attribute.
    pub attrs: Vec<String>,
    pub filter: Option<QueryFilter>,
    pub geo: Option<GeoQuery>,
    /// Empty means any area.
    pub areas: Vec<String>,
    pub limit: usize,
    /// Nest lineage timestamps under each attribute.
    pub time: bool,
    pub context: Option<String>,
}

fn list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl QueryParams {
    /// Parse a query string (`id=..&type=..`), with or without its
    /// leading `?`. Every problem is reported before any broker I/O.
    pub fn parse(query: &str, default_limit: usize) -> Result<Self> {
        let mut params = Self {
            limit: default_limit,
            ..Self::default()
        };
        let (mut georel, mut geometry, mut coordinates, mut geoproperty) =
            (None, None, None, None);

        for pair in query.trim_start_matches('?').split('&') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "id" => params.id = Some(value.to_string()).filter(|v| !v.is_empty()),
                "idPattern" => {
                    let re = Regex::new(value).map_err(|e| {
                        ContextError::InvalidInput(format!("idPattern '{value}': {e}"))
                    })?;
                    params.id_pattern = Some(re);
                }
                "type" => params.types = list(value),
                "attrs" => params.attrs = list(value),
                "q" => params.filter = Some(QueryFilter::parse(value)?),
                "area" => params.areas = list(value),
                "limit" => {
                    params.limit = value
                        .parse::<usize>()
                        .ok()
                        .filter(|l| *l > 0)
                        .ok_or_else(|| {
                            ContextError::InvalidInput(format!("limit '{value}' is not a positive integer"))
                        })?;
                }
                "time" => params.time = !matches!(value, "" | "0" | "false"),
                "georel" => georel = Some(value),
                "geometry" => geometry = Some(value),
                "coordinates" => coordinates = Some(value),
                "geoproperty" => geoproperty = Some(value).filter(|v| !v.is_empty()),
                other => {
                    return Err(ContextError::InvalidInput(format!(
                        "unknown query key '{other}'"
                    )))
                }
            }
        }
        params.geo = GeoQuery::from_params(georel, geometry, coordinates, geoproperty)?;
        Ok(params)
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Whether entities must be fetched whole before being judged.
    fn needs_full_entity(&self) -> bool {
        self.attrs.is_empty() || self.filter.is_some() || self.geo.is_some()
    }

    /// Attribute selectors to subscribe per provider.
    fn selectors(&self) -> Vec<AttributeSelector> {
        if self.needs_full_entity() {
            return vec![AttributeSelector::All];
        }
        let mut selectors = Vec::new();
        for attr in &self.attrs {
            selectors.push(AttributeSelector::Named(attr.clone()));
            if self.time {
                selectors.push(AttributeSelector::Named(format!("{attr}{CREATED_AT_SUFFIX}")));
                selectors.push(AttributeSelector::Named(format!("{attr}{MODIFIED_AT_SUFFIX}")));
            }
        }
        selectors
    }

    /// Apply pattern, filter, geoquery and projection to a candidate.
    fn admit(&self, mut entity: Entity) -> Option<Entity> {
        if let Some(re) = &self.id_pattern {
            if !re.is_match(&entity.id) {
                return None;
            }
        }
        if let Some(filter) = &self.filter {
            if !filter.matches(&entity) {
                return None;
            }
        }
        if let Some(geo) = &self.geo {
            if !geo.matches(&entity) {
                return None;
            }
        }
        if !self.attrs.is_empty() {
            entity.project(&self.attrs);
        }
        Some(entity)
    }
}

/// Where one listening window is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Provider {
    endpoint: Endpoint,
    /// `None` queries every area of the endpoint.
    area: Option<String>,
}

/// Collect messages for up to `limit` distinct entity ids.
///
/// Entity messages are keyed by id, so one id under several types or
/// areas counts once; other topics are keyed by their own path.
/// Messages of ids beyond the limit are dropped. A connection lost
/// before the window closes is an error, not a short result.
pub async fn collect<C: Connector>(
    connector: &C,
    endpoint: &Endpoint,
    patterns: &[String],
    window: Duration,
    grace: Duration,
    limit: usize,
) -> Result<Vec<InboundMessage>> {
    let listener = Listener::open(connector, endpoint, patterns, QoS::AtLeastOnce, window).await?;
    gather(listener, grace, limit).await
}

async fn gather<S: Session>(
    mut listener: Listener<S>,
    grace: Duration,
    limit: usize,
) -> Result<Vec<InboundMessage>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut overflow: HashSet<String> = HashSet::new();
    let mut messages = Vec::new();

    let outcome = loop {
        match listener.next().await {
            Wait::Message(msg) if msg.is_retraction() => {
                trace!("window ignoring retraction on {}", msg.topic);
            }
            Wait::Message(msg) => {
                let key = match EntityTopic::decode(&msg.topic) {
                    Ok(topic) => topic.id,
                    Err(_) => msg.topic.clone(),
                };
                if seen.contains(&key) {
                    messages.push(msg);
                } else if seen.len() < limit {
                    seen.insert(key);
                    listener.extend(grace);
                    messages.push(msg);
                } else if overflow.insert(key) {
                    // One past the limit: the result set is complete.
                    listener.shorten(Duration::ZERO);
                }
            }
            Wait::Expired => break Ok(()),
            Wait::Closed => break Err(listener.lost()),
        }
    };
    listener.close().await;
    outcome.map(|()| messages)
}

/// Query engine over one local broker and the providers it advertises.
#[derive(Clone)]
pub struct EntityReader<C: Connector> {
    connector: C,
    config: Arc<NodeConfig>,
    credentials: Arc<CredentialStore>,
}

impl<C: Connector> EntityReader<C> {
    pub fn new(connector: C, config: Arc<NodeConfig>, credentials: Arc<CredentialStore>) -> Self {
        Self {
            connector,
            config,
            credentials,
        }
    }

    /// Run a query. At most `params.limit` entity ids are returned.
    pub async fn query(&self, params: &QueryParams) -> Result<Vec<Entity>> {
        let types: Vec<Option<&str>> = if params.types.is_empty() {
            vec![None]
        } else {
            params.types.iter().map(|t| Some(t.as_str())).collect()
        };

        let mut results = Vec::new();
        for entity_type in types {
            let providers = self.providers(params, entity_type).await?;
            debug!(
                "Query for type {} resolved {} providers",
                entity_type.unwrap_or("*"),
                providers.len()
            );
            for provider in providers {
                let remaining = params.limit.saturating_sub(results.len());
                if remaining == 0 {
                    return Ok(results);
                }
                let found = self.query_provider(params, entity_type, &provider, remaining).await?;
                results.extend(found);
            }
        }
        info!("Query returned {} entities", results.len());
        Ok(results)
    }

    async fn query_provider(
        &self,
        params: &QueryParams,
        entity_type: Option<&str>,
        provider: &Provider,
        limit: usize,
    ) -> Result<Vec<Entity>> {
        let mut base = EntityPattern::any();
        if let Some(area) = &provider.area {
            base = base.area(area);
        }
        if let Some(ctx) = &params.context {
            base = base.context(ctx);
        }
        if let Some(t) = entity_type {
            base = base.entity_type(t);
        }
        if let Some(id) = &params.id {
            base = base.id(id);
        }
        let patterns = params
            .selectors()
            .into_iter()
            .map(|sel| base.clone().attribute(sel).build())
            .collect::<Result<Vec<_>>>()?;

        let timing = &self.config.timing;
        let messages = collect(
            &self.connector,
            &provider.endpoint,
            &patterns,
            timing.query(),
            timing.query_grace(),
            limit,
        )
        .await?;

        Ok(group_messages(messages)
            .into_iter()
            .filter_map(|group| params.admit(group.reassemble(params.time)))
            .collect())
    }

    /// Providers to query: advertised ones, deduplicated by endpoint
    /// and area, or the local broker when forwarding is off.
    async fn providers(&self, params: &QueryParams, entity_type: Option<&str>) -> Result<Vec<Provider>> {
        let areas: Vec<Option<&str>> = if params.areas.is_empty() {
            vec![None]
        } else {
            params.areas.iter().map(|a| Some(a.as_str())).collect()
        };

        if !self.config.forwarding {
            let endpoint = self.config.endpoint();
            return Ok(areas
                .into_iter()
                .map(|area| Provider {
                    endpoint: endpoint.clone(),
                    area: area.map(str::to_string),
                })
                .collect());
        }

        let per_entity = self.config.advertisement.granularity == Granularity::PerEntity;
        let patterns = areas
            .into_iter()
            .map(|area| {
                advertisement_pattern(
                    area,
                    params.context.as_deref(),
                    entity_type,
                    params.id.as_deref(),
                    per_entity,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let timing = &self.config.timing;
        let adverts = collect(
            &self.connector,
            &self.config.endpoint(),
            &patterns,
            timing.advertisement(),
            timing.advertisement(),
            usize::MAX,
        )
        .await?;

        let mut seen = HashSet::new();
        let mut providers = Vec::new();
        for msg in adverts {
            let advert = match AdvertisementTopic::decode(&msg.topic) {
                Ok(a) => a,
                Err(e) => {
                    debug!("Ignoring advertisement {}: {}", msg.topic, e);
                    continue;
                }
            };
            if !seen.insert((advert.host.clone(), advert.port, advert.area.clone())) {
                continue;
            }
            providers.push(Provider {
                endpoint: self
                    .config
                    .provider_endpoint(&advert.host, advert.port, &self.credentials),
                area: Some(advert.area),
            });
        }
        Ok(providers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, MemoryConnector};
    use crate::writer::EntityWriter;
    use serde_json::json;

    fn config(area: &str) -> Arc<NodeConfig> {
        Arc::new(NodeConfig {
            area: area.into(),
            ..NodeConfig::default()
        })
    }

    fn reader(broker: &MemoryBroker, config: Arc<NodeConfig>) -> EntityReader<MemoryConnector> {
        EntityReader::new(broker.connector(), config, Arc::new(CredentialStore::default()))
    }

    fn params(query: &str) -> QueryParams {
        QueryParams::parse(query, 1800).unwrap()
    }

    async fn seed(broker: &MemoryBroker, area: &str, entities: &[Entity]) {
        let writer = EntityWriter::new(broker.connector(), config(area));
        for e in entities {
            writer.create(e).await.unwrap();
        }
    }

    fn sensor(id: &str, temp: f64) -> Entity {
        Entity::new(id, "Sensor", "ctx").with_attribute("temp", json!(temp))
    }

    #[test]
    fn test_parse_query() {
        let p = params("?id=s1&type=Sensor,Room&attrs=temp&q=temp>10&area=zoneA&limit=5&time=1");
        assert_eq!(p.id.as_deref(), Some("s1"));
        assert_eq!(p.types, vec!["Sensor", "Room"]);
        assert_eq!(p.attrs, vec!["temp"]);
        assert_eq!(p.areas, vec!["zoneA"]);
        assert_eq!(p.limit, 5);
        assert!(p.time);
        assert_eq!(p.filter.as_ref().map(|f| f.source()), Some("temp>10"));
        assert!(p.geo.is_none());
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        for bad in [
            "colour=red",
            "limit=ten",
            "limit=0",
            "q=temp>",
            "idPattern=(",
            "georel=within&geometry=Point",
            "georel=sideways&geometry=Point&coordinates=[1,2]",
        ] {
            assert!(
                matches!(QueryParams::parse(bad, 10), Err(ContextError::InvalidInput(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_selectors() {
        let p = params("attrs=temp&time=1");
        assert_eq!(
            p.selectors(),
            vec![
                AttributeSelector::Named("temp".into()),
                AttributeSelector::Named("temp_timerelsystem_CreatedAt".into()),
                AttributeSelector::Named("temp_timerelsystem_modifiedAt".into()),
            ]
        );
        // A filter needs the whole entity even when projecting.
        assert_eq!(params("attrs=temp&q=hum<3").selectors(), vec![AttributeSelector::All]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_respects_limit() {
        let broker = MemoryBroker::new();
        for i in 0..5 {
            broker.publish(
                "localhost",
                1026,
                &format!("zoneA/entities/ctx/Sensor/LNA/s{i}/temp"),
                b"1",
                true,
            );
        }
        let messages = collect(
            &broker.connector(),
            &Endpoint::new("localhost", 1026),
            &["zoneA/entities/+/+/+/+/#".to_string()],
            Duration::from_millis(500),
            Duration::from_millis(500),
            3,
        )
        .await
        .unwrap();
        assert_eq!(group_messages(messages).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_counts_ids_not_paths() {
        let broker = MemoryBroker::new();
        for topic in [
            "zoneA/entities/ctx/Room/LNA/s1/temp",
            "zoneA/entities/ctx/Sensor/LNA/s1/temp",
            "zoneA/entities/ctx/Sensor/LNA/s2/temp",
            "zoneA/entities/ctx/Sensor/LNA/s3/temp",
        ] {
            broker.publish("localhost", 1026, topic, b"1", true);
        }
        let messages = collect(
            &broker.connector(),
            &Endpoint::new("localhost", 1026),
            &["zoneA/entities/+/+/+/+/#".to_string()],
            Duration::from_millis(500),
            Duration::from_millis(500),
            2,
        )
        .await
        .unwrap();
        let mut ids: Vec<_> = group_messages(messages)
            .into_iter()
            .map(|group| group.key.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["s1", "s1", "s2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_lost_connection_is_an_error() {
        let broker = MemoryBroker::new();
        broker.publish("localhost", 1026, "zoneA/entities/ctx/Sensor/LNA/s1/temp", b"1", true);
        let connector = broker.connector();
        let pending = tokio::spawn(async move {
            collect(
                &connector,
                &Endpoint::new("localhost", 1026),
                &["zoneA/entities/+/+/+/+/#".to_string()],
                Duration::from_millis(500),
                Duration::from_millis(500),
                10,
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.set_reachable("localhost", 1026, false);

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, ContextError::Connection(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_by_type_and_area() {
        let broker = MemoryBroker::new();
        seed(&broker, "zoneA", &[sensor("s1", 21.0), sensor("s2", 30.0)]).await;
        seed(&broker, "zoneB", &[sensor("s3", 15.0)]).await;

        let r = reader(&broker, config("zoneA"));
        let found = r.query(&params("type=Sensor&area=zoneA")).await.unwrap();
        let mut ids: Vec<_> = found.iter().map(|e| e.id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["s1", "s2"]);

        let all = r.query(&params("type=Sensor")).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_filter_and_projection() {
        let broker = MemoryBroker::new();
        seed(
            &broker,
            "zoneA",
            &[
                sensor("s1", 15.0).with_attribute("hum", json!(40)),
                sensor("s2", 25.0).with_attribute("hum", json!(60)),
            ],
        )
        .await;

        let found = reader(&broker, config("zoneA"))
            .query(&params("type=Sensor&q=temp>10;temp<20&attrs=hum"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "s1");
        assert_eq!(found[0].attributes.len(), 1);
        assert_eq!(found[0].attributes["hum"], json!(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_geo_within() {
        let broker = MemoryBroker::new();
        let point = |x: f64, y: f64| json!({"type": "GeoProperty", "value": {"type": "Point", "coordinates": [x, y]}});
        seed(
            &broker,
            "zoneA",
            &[
                Entity::new("in", "Spot", "ctx").with_attribute("location", point(2.0, 2.0)),
                Entity::new("out", "Spot", "ctx").with_attribute("location", point(20.0, 20.0)),
            ],
        )
        .await;

        let found = reader(&broker, config("zoneA"))
            .query(&params(
                "type=Spot&georel=within&geometry=Polygon&coordinates=[[0,0],[0,10],[10,10],[10,0],[0,0]]",
            ))
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["in"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_limit_and_id_pattern() {
        let broker = MemoryBroker::new();
        let entities: Vec<_> = (0..6).map(|i| sensor(&format!("s{i}"), i as f64)).collect();
        seed(&broker, "zoneA", &entities).await;
        let r = reader(&broker, config("zoneA"));

        assert_eq!(r.query(&params("type=Sensor&limit=4")).await.unwrap().len(), 4);
        let matched = r.query(&params("type=Sensor&idPattern=^s[12]$")).await.unwrap();
        assert_eq!(matched.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_time_nests_lineage() {
        let broker = MemoryBroker::new();
        seed(
            &broker,
            "zoneA",
            &[Entity::new("s1", "Sensor", "ctx")
                .with_attribute("temp", json!({"type": "Property", "value": 21}))],
        )
        .await;
        let found = reader(&broker, config("zoneA"))
            .query(&params("id=s1&attrs=temp&time=1"))
            .await
            .unwrap();
        let temp = &found[0].attributes["temp"];
        assert_eq!(temp["value"], json!(21));
        assert!(temp["createdAt"].is_string());
        assert!(temp["modifiedAt"].is_string());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwarding_reaches_remote_provider() {
        let broker = MemoryBroker::new();
        broker.publish(
            "localhost",
            1026,
            "provider/edge/1883/zoneB/ctx/Sensor",
            br#"{"location": "field"}"#,
            true,
        );
        broker.publish("edge", 1883, "zoneB/entities/ctx/Sensor/LNA/r1/temp", b"7", true);

        let found = reader(&broker, config("zoneA"))
            .query(&params("type=Sensor"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "r1");
        assert_eq!(found[0].attributes["temp"], json!(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_forwarding_queries_local_broker() {
        let broker = MemoryBroker::new();
        broker.publish("localhost", 1026, "zoneA/entities/ctx/Sensor/LNA/s1/temp", b"3", true);
        let mut cfg = (*config("zoneA")).clone();
        cfg.forwarding = false;

        let found = reader(&broker, Arc::new(cfg))
            .query(&params("type=Sensor"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_an_error() {
        let broker = MemoryBroker::new();
        broker.set_reachable("localhost", 1026, false);
        let err = reader(&broker, config("zoneA"))
            .query(&params("type=Sensor"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
