// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Entity documents and their reassembly from attribute messages.

use crate::broker::InboundMessage;
use crate::error::{ContextError, Result};
use crate::topic::{AttributeSegment, EntityTopic};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

/// Core context appended to every reassembled document whose own
/// context differs.
pub const DEFAULT_CONTEXT: &str = "https://uri.etsi.org/ngsi-ld/v1/ngsi-ld-core-context.jsonld";

/// Document keys that are identity, not attributes.
pub const RESERVED_KEYS: [&str; 3] = ["id", "type", "@context"];

/// A context entity: identity plus attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: String,
    pub entity_type: String,
    /// Context URI.
    pub context: String,
    pub attributes: Map<String, Value>,
}

impl Entity {
    pub fn new(
        id: impl Into<String>,
        entity_type: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            context: context.into(),
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Parse an entity document.
    ///
    /// `@context` may be a string or a list whose first element is used;
    /// `fallback_context` applies when the document carries none.
    pub fn from_json(doc: &Value, fallback_context: Option<&str>) -> Result<Self> {
        let obj = doc
            .as_object()
            .ok_or_else(|| ContextError::InvalidInput("entity must be a JSON object".into()))?;

        let id = required_str(obj, "id")?;
        let entity_type = required_str(obj, "type")?;
        let context = match obj.get("@context") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(items)) => items
                .first()
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    ContextError::InvalidInput(format!("entity {id} has an empty @context list"))
                })?,
            Some(_) => {
                return Err(ContextError::InvalidInput(format!(
                    "entity {id} has a malformed @context"
                )))
            }
            None => fallback_context.map(str::to_string).ok_or_else(|| {
                ContextError::InvalidInput(format!("entity {id} has no @context"))
            })?,
        };

        let attributes = obj
            .iter()
            .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            id,
            entity_type,
            context,
            attributes,
        })
    }

    /// Render as a document. The core context is appended when distinct.
    pub fn to_json(&self) -> Value {
        let mut doc = Map::new();
        doc.insert("id".into(), Value::String(self.id.clone()));
        doc.insert("type".into(), Value::String(self.entity_type.clone()));
        for (k, v) in &self.attributes {
            doc.insert(k.clone(), v.clone());
        }
        let mut contexts = vec![Value::String(self.context.clone())];
        if self.context != DEFAULT_CONTEXT {
            contexts.push(Value::String(DEFAULT_CONTEXT.into()));
        }
        doc.insert("@context".into(), Value::Array(contexts));
        Value::Object(doc)
    }

    /// Comparable value of an attribute: the `value` member of a
    /// property object, else the attribute itself.
    pub fn attribute_value(&self, name: &str) -> Option<&Value> {
        match self.attributes.get(name)? {
            Value::Object(prop) if prop.contains_key("value") => prop.get("value"),
            other => Some(other),
        }
    }

    /// Keep only the named attributes.
    pub fn project(&mut self, names: &[String]) {
        self.attributes.retain(|k, _| names.iter().any(|n| n == k));
    }
}

fn required_str(obj: &Map<String, Value>, key: &str) -> Result<String> {
    match obj.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        _ => Err(ContextError::InvalidInput(format!(
            "entity is missing a non-empty '{key}'"
        ))),
    }
}

/// Decode a JSON payload, retrying with single quotes swapped for
/// double quotes.
pub fn decode_payload(topic: &str, payload: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(payload).map_err(|e| ContextError::Decode {
        topic: topic.to_string(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(text)
        .or_else(|_| serde_json::from_str(&text.replace('\'', "\"")))
        .map_err(|e: serde_json::Error| ContextError::Decode {
            topic: topic.to_string(),
            reason: e.to_string(),
        })
}

pub fn encode_payload(value: &Value) -> Vec<u8> {
    value.to_string().into_bytes()
}

#[derive(Debug, Default, Clone)]
struct Lineage {
    created_at: Option<Value>,
    modified_at: Option<Value>,
}

/// Attribute messages collected for one entity path.
#[derive(Debug, Clone)]
pub struct EntityGroup {
    /// Entity path, attribute stripped.
    pub key: EntityTopic,
    values: Vec<(String, Value)>,
    lineage: BTreeMap<String, Lineage>,
}

impl EntityGroup {
    fn new(key: EntityTopic) -> Self {
        Self {
            key,
            values: Vec::new(),
            lineage: BTreeMap::new(),
        }
    }

    fn push(&mut self, segment: AttributeSegment<'_>, value: Value) {
        match segment {
            AttributeSegment::Value(name) => {
                match self.values.iter_mut().find(|(n, _)| n == name) {
                    Some(slot) => slot.1 = value,
                    None => self.values.push((name.to_string(), value)),
                }
            }
            AttributeSegment::CreatedAt(name) => {
                self.lineage.entry(name.to_string()).or_default().created_at = Some(value);
            }
            AttributeSegment::ModifiedAt(name) => {
                self.lineage.entry(name.to_string()).or_default().modified_at = Some(value);
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.key.id
    }

    /// Attribute names seen, lineage excluded.
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(n, _)| n.as_str())
    }

    /// Build the document. With `include_lineage`, timestamps are nested
    /// as `createdAt`/`modifiedAt` under object-valued attributes.
    pub fn reassemble(&self, include_lineage: bool) -> Entity {
        let mut entity = Entity::new(
            self.key.id.clone(),
            self.key.entity_type.clone(),
            self.key.context.clone(),
        );
        for (name, value) in &self.values {
            entity.attributes.insert(name.clone(), value.clone());
        }
        if include_lineage {
            for (name, lineage) in &self.lineage {
                if let Some(Value::Object(prop)) = entity.attributes.get_mut(name) {
                    if let Some(ts) = &lineage.created_at {
                        prop.insert("createdAt".into(), ts.clone());
                    }
                    if let Some(ts) = &lineage.modified_at {
                        prop.insert("modifiedAt".into(), ts.clone());
                    }
                }
            }
        }
        entity
    }
}

/// Group attribute messages by entity path, in order of first arrival.
///
/// Retractions, non-entity topics and undecodable payloads are skipped;
/// the latter are logged.
pub fn group_messages<I>(messages: I) -> Vec<EntityGroup>
where
    I: IntoIterator<Item = InboundMessage>,
{
    let mut groups: Vec<EntityGroup> = Vec::new();
    for msg in messages {
        if msg.is_retraction() {
            continue;
        }
        let topic = match EntityTopic::decode(&msg.topic) {
            Ok(t) => t,
            Err(_) => continue,
        };
        let Some(segment) = topic.segment() else {
            continue;
        };
        let value = match decode_payload(&msg.topic, &msg.payload) {
            Ok(v) => v,
            Err(e) => {
                warn!("Skipping message: {}", e);
                continue;
            }
        };
        let key = topic.entity();
        let idx = match groups.iter().position(|g| g.key == key) {
            Some(idx) => idx,
            None => {
                groups.push(EntityGroup::new(key));
                groups.len() - 1
            }
        };
        groups[idx].push(segment, value);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::QoS;
    use serde_json::json;

    fn msg(topic: &str, payload: &str) -> InboundMessage {
        InboundMessage {
            topic: topic.into(),
            payload: payload.as_bytes().to_vec(),
            retain: true,
            qos: QoS::AtMostOnce,
        }
    }

    #[test]
    fn test_from_json_requires_identity() {
        assert!(Entity::from_json(&json!({"type": "T", "@context": "c"}), None).is_err());
        assert!(Entity::from_json(&json!({"id": "s1", "@context": "c"}), None).is_err());
        assert!(Entity::from_json(&json!({"id": "s1", "type": "T"}), None).is_err());
        assert!(Entity::from_json(&json!({"id": "", "type": "T", "@context": "c"}), None).is_err());
        assert!(Entity::from_json(&json!([1, 2]), None).is_err());
    }

    #[test]
    fn test_from_json_context_forms() {
        let e = Entity::from_json(&json!({"id": "s1", "type": "T", "@context": ["a", "b"]}), None)
            .unwrap();
        assert_eq!(e.context, "a");

        let e = Entity::from_json(&json!({"id": "s1", "type": "T"}), Some("link")).unwrap();
        assert_eq!(e.context, "link");
    }

    #[test]
    fn test_attributes_exclude_identity() {
        let e = Entity::from_json(
            &json!({"id": "s1", "type": "T", "@context": "c", "temp": 21, "hum": {"value": 40}}),
            None,
        )
        .unwrap();
        assert_eq!(e.attributes.len(), 2);
        assert_eq!(e.attribute_value("temp"), Some(&json!(21)));
        assert_eq!(e.attribute_value("hum"), Some(&json!(40)));
        assert_eq!(e.attribute_value("missing"), None);
    }

    #[test]
    fn test_to_json_appends_core_context() {
        let doc = Entity::new("s1", "T", "ctx").to_json();
        assert_eq!(doc["@context"], json!(["ctx", DEFAULT_CONTEXT]));
        let doc = Entity::new("s1", "T", DEFAULT_CONTEXT).to_json();
        assert_eq!(doc["@context"], json!([DEFAULT_CONTEXT]));
    }

    #[test]
    fn test_decode_payload_quote_fallback() {
        assert_eq!(decode_payload("t", b"{\"a\": 1}").unwrap(), json!({"a": 1}));
        assert_eq!(
            decode_payload("t", b"{'type': 'Property', 'value': 'ok'}").unwrap(),
            json!({"type": "Property", "value": "ok"})
        );
        assert!(matches!(
            decode_payload("t", b"{not json"),
            Err(ContextError::Decode { .. })
        ));
    }

    #[test]
    fn test_reassemble_strips_lineage() {
        let base = "zoneA/entities/ctx/Sensor/LNA/s1";
        let groups = group_messages(vec![
            msg(&format!("{base}/temp_timerelsystem_modifiedAt"), "\"2026-01-02T00:00:00Z\""),
            msg(&format!("{base}/temp"), "{\"type\":\"Property\",\"value\":21}"),
            msg(&format!("{base}/temp_timerelsystem_CreatedAt"), "\"2026-01-01T00:00:00Z\""),
            msg(&format!("{base}/name"), "\"probe\""),
        ]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].attribute_names().collect::<Vec<_>>(), vec!["temp", "name"]);

        let plain = groups[0].reassemble(false);
        assert_eq!(plain.id, "s1");
        assert_eq!(plain.entity_type, "Sensor");
        assert_eq!(plain.attributes["temp"], json!({"type": "Property", "value": 21}));
        assert_eq!(plain.attributes.len(), 2);

        let timed = groups[0].reassemble(true);
        assert_eq!(
            timed.attributes["temp"],
            json!({
                "type": "Property",
                "value": 21,
                "createdAt": "2026-01-01T00:00:00Z",
                "modifiedAt": "2026-01-02T00:00:00Z"
            })
        );
        // Non-object attributes carry no lineage.
        assert_eq!(timed.attributes["name"], json!("probe"));
    }

    #[test]
    fn test_group_keeps_types_apart() {
        let groups = group_messages(vec![
            msg("zoneA/entities/ctx/Sensor/LNA/x1/temp", "1"),
            msg("zoneA/entities/ctx/Room/LNA/x1/temp", "2"),
            msg("zoneA/entities/ctx/Sensor/LNA/x2/temp", "3"),
            msg("zoneA/entities/ctx/Sensor/LNA/x1/hum", "4"),
        ]);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].key.entity_type, "Sensor");
        assert_eq!(groups[0].reassemble(false).attributes.len(), 2);
        assert_eq!(groups[1].key.entity_type, "Room");
    }

    #[test]
    fn test_group_skips_bad_messages() {
        let groups = group_messages(vec![
            msg("zoneA/entities/ctx/T/LNA/s1/temp", ""),
            msg("zoneA/entities/ctx/T/LNA/s1/hum", "{broken"),
            msg("provider/h/1/zoneA/ctx/T", "{}"),
            msg("zoneA/entities/ctx/T/LNA/s1/ok", "true"),
        ]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].attribute_names().collect::<Vec<_>>(), vec!["ok"]);
    }
}
