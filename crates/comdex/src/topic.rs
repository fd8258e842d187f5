// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic codec.
//!
//! Maps entity identities to routing paths and back, and builds the
//! wildcard patterns used for lookups.
//!
//! ```text
//! {area}/entities/{context}/{type}/{origin}/{id}[/{attribute}]
//! provider/{host}/{port}/{area}/{context}/{type}[/{id}]
//! {area}/Subscriptions/{context}/Subscription/LNA/{subscription_id}
//! ```
//!
//! `context` is usually a URI, so its `/` separators are replaced by
//! [`CONTEXT_SEPARATOR_PLACEHOLDER`]. Every other segment must be free
//! of separators and wildcards.

use crate::error::{ContextError, Result};
use std::fmt;

/// Second segment of every entity path.
pub const ENTITIES_SEGMENT: &str = "entities";

/// Origin tag written by the local writer.
pub const LOCAL_ORIGIN: &str = "LNA";

/// Root segment of the advertisement namespace.
pub const ADVERTISEMENT_ROOT: &str = "provider";

/// Second segment of subscription record paths.
pub const SUBSCRIPTIONS_SEGMENT: &str = "Subscriptions";

/// Stand-in for `/` inside an escaped context segment.
pub const CONTEXT_SEPARATOR_PLACEHOLDER: char = '§';

/// Lineage suffix carrying an attribute's creation time.
pub const CREATED_AT_SUFFIX: &str = "_timerelsystem_CreatedAt";

/// Lineage suffix carrying an attribute's last modification time.
pub const MODIFIED_AT_SUFFIX: &str = "_timerelsystem_modifiedAt";

pub const SINGLE_LEVEL_WILDCARD: &str = "+";
pub const MULTI_LEVEL_WILDCARD: &str = "#";

const SEPARATOR: char = '/';

/// Escape a context URI into a single path segment.
pub fn escape_context(context: &str) -> String {
    context.replace(SEPARATOR, &CONTEXT_SEPARATOR_PLACEHOLDER.to_string())
}

/// Reverse of [`escape_context`].
pub fn unescape_context(segment: &str) -> String {
    segment.replace(CONTEXT_SEPARATOR_PLACEHOLDER, &SEPARATOR.to_string())
}

fn validate_segment(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(ContextError::InvalidInput(format!("empty {kind}")));
    }
    if value.contains([SEPARATOR, '+', '#']) {
        return Err(ContextError::InvalidInput(format!(
            "{kind} '{value}' contains a routing separator or wildcard"
        )));
    }
    Ok(())
}

fn validate_context(context: &str) -> Result<()> {
    if context.is_empty() {
        return Err(ContextError::InvalidInput("empty context".into()));
    }
    if context.contains([CONTEXT_SEPARATOR_PLACEHOLDER, '+', '#']) {
        return Err(ContextError::InvalidInput(format!(
            "context '{context}' contains a reserved character"
        )));
    }
    Ok(())
}

/// Kind of the trailing segment of an entity path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeSegment<'a> {
    /// Plain attribute content.
    Value(&'a str),
    /// `createdAt` lineage of the named attribute.
    CreatedAt(&'a str),
    /// `modifiedAt` lineage of the named attribute.
    ModifiedAt(&'a str),
}

impl<'a> AttributeSegment<'a> {
    pub fn classify(segment: &'a str) -> Self {
        if let Some(name) = segment.strip_suffix(CREATED_AT_SUFFIX) {
            Self::CreatedAt(name)
        } else if let Some(name) = segment.strip_suffix(MODIFIED_AT_SUFFIX) {
            Self::ModifiedAt(name)
        } else {
            Self::Value(segment)
        }
    }

    /// Attribute the segment belongs to.
    pub fn attribute(&self) -> &'a str {
        match self {
            Self::Value(name) | Self::CreatedAt(name) | Self::ModifiedAt(name) => name,
        }
    }

    pub fn is_lineage(&self) -> bool {
        !matches!(self, Self::Value(_))
    }
}

/// Fully-specified entity (or entity attribute) path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityTopic {
    pub area: String,
    /// Context URI, unescaped.
    pub context: String,
    pub entity_type: String,
    pub origin: String,
    pub id: String,
    /// Trailing segment, possibly lineage-suffixed.
    pub attribute: Option<String>,
}

impl EntityTopic {
    /// Build a validated entity path without attribute.
    pub fn new(
        area: impl Into<String>,
        context: impl Into<String>,
        entity_type: impl Into<String>,
        origin: impl Into<String>,
        id: impl Into<String>,
    ) -> Result<Self> {
        let topic = Self {
            area: area.into(),
            context: context.into(),
            entity_type: entity_type.into(),
            origin: origin.into(),
            id: id.into(),
            attribute: None,
        };
        validate_segment("area", &topic.area)?;
        validate_context(&topic.context)?;
        validate_segment("type", &topic.entity_type)?;
        validate_segment("origin", &topic.origin)?;
        validate_segment("id", &topic.id)?;
        Ok(topic)
    }

    /// Same entity, addressing one attribute segment.
    pub fn attribute(&self, name: &str) -> Result<Self> {
        validate_segment("attribute", name)?;
        Ok(Self {
            attribute: Some(name.to_string()),
            ..self.clone()
        })
    }

    /// `createdAt` lineage sibling of an attribute.
    pub fn created_at(&self, name: &str) -> Result<Self> {
        self.attribute(&format!("{name}{CREATED_AT_SUFFIX}"))
    }

    /// `modifiedAt` lineage sibling of an attribute.
    pub fn modified_at(&self, name: &str) -> Result<Self> {
        self.attribute(&format!("{name}{MODIFIED_AT_SUFFIX}"))
    }

    /// Path of the entity itself, attribute stripped.
    pub fn entity(&self) -> Self {
        Self {
            attribute: None,
            ..self.clone()
        }
    }

    pub fn encode(&self) -> String {
        let mut path = format!(
            "{}/{}/{}/{}/{}/{}",
            self.area,
            ENTITIES_SEGMENT,
            escape_context(&self.context),
            self.entity_type,
            self.origin,
            self.id
        );
        if let Some(attr) = &self.attribute {
            path.push(SEPARATOR);
            path.push_str(attr);
        }
        path
    }

    /// Pattern covering this entity's whole attribute subtree.
    pub fn subtree(&self) -> String {
        format!("{}/{}", self.entity().encode(), MULTI_LEVEL_WILDCARD)
    }

    pub fn decode(path: &str) -> Result<Self> {
        let parts: Vec<&str> = path.split(SEPARATOR).collect();
        if !(parts.len() == 6 || parts.len() == 7) || parts[1] != ENTITIES_SEGMENT {
            return Err(ContextError::InvalidInput(format!(
                "'{path}' is not an entity path"
            )));
        }
        let mut topic = Self::new(
            parts[0],
            unescape_context(parts[2]),
            parts[3],
            parts[4],
            parts[5],
        )?;
        if let Some(attr) = parts.get(6) {
            topic = topic.attribute(attr)?;
        }
        Ok(topic)
    }

    /// Classification of the trailing segment, if any.
    pub fn segment(&self) -> Option<AttributeSegment<'_>> {
        self.attribute.as_deref().map(AttributeSegment::classify)
    }
}

impl fmt::Display for EntityTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Attribute selector of an [`EntityPattern`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AttributeSelector {
    /// Whole subtree (`#`).
    #[default]
    All,
    /// Any single attribute segment (`+`).
    Any,
    /// One named segment.
    Named(String),
}

/// Wildcard pattern over entity paths. `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityPattern {
    pub area: Option<String>,
    pub context: Option<String>,
    pub entity_type: Option<String>,
    pub origin: Option<String>,
    pub id: Option<String>,
    pub attribute: AttributeSelector,
}

impl EntityPattern {
    /// Pattern matching every entity attribute.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn area(mut self, area: impl Into<String>) -> Self {
        self.area = Some(area.into());
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn attribute(mut self, selector: AttributeSelector) -> Self {
        self.attribute = selector;
        self
    }

    /// Render the pattern, validating each concrete segment.
    pub fn build(&self) -> Result<String> {
        fn part(kind: &str, value: &Option<String>) -> Result<String> {
            match value {
                Some(v) => {
                    validate_segment(kind, v)?;
                    Ok(v.clone())
                }
                None => Ok(SINGLE_LEVEL_WILDCARD.to_string()),
            }
        }

        let context = match &self.context {
            Some(c) => {
                validate_context(c)?;
                escape_context(c)
            }
            None => SINGLE_LEVEL_WILDCARD.to_string(),
        };
        let attribute = match &self.attribute {
            AttributeSelector::All => MULTI_LEVEL_WILDCARD.to_string(),
            AttributeSelector::Any => SINGLE_LEVEL_WILDCARD.to_string(),
            AttributeSelector::Named(name) => {
                validate_segment("attribute", name)?;
                name.clone()
            }
        };

        Ok(format!(
            "{}/{}/{}/{}/{}/{}/{}",
            part("area", &self.area)?,
            ENTITIES_SEGMENT,
            context,
            part("type", &self.entity_type)?,
            part("origin", &self.origin)?,
            part("id", &self.id)?,
            attribute
        ))
    }
}

/// Identity of an advertised data shape; one live listener per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiscoveryKey {
    pub host: String,
    pub port: u16,
    pub area: String,
    /// Context URI, unescaped.
    pub context: String,
    pub entity_type: String,
}

impl fmt::Display for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}/{}/{}",
            self.host, self.port, self.area, self.context, self.entity_type
        )
    }
}

/// Advertisement path announcing that an endpoint holds entities of a shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AdvertisementTopic {
    pub host: String,
    pub port: u16,
    pub area: String,
    pub context: String,
    pub entity_type: String,
    /// Present in per-entity granularity.
    pub id: Option<String>,
}

impl AdvertisementTopic {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        area: impl Into<String>,
        context: impl Into<String>,
        entity_type: impl Into<String>,
        id: Option<String>,
    ) -> Result<Self> {
        let topic = Self {
            host: host.into(),
            port,
            area: area.into(),
            context: context.into(),
            entity_type: entity_type.into(),
            id,
        };
        validate_segment("host", &topic.host)?;
        validate_segment("area", &topic.area)?;
        validate_context(&topic.context)?;
        validate_segment("type", &topic.entity_type)?;
        if let Some(id) = &topic.id {
            validate_segment("id", id)?;
        }
        Ok(topic)
    }

    pub fn encode(&self) -> String {
        let mut path = format!(
            "{}/{}/{}/{}/{}/{}",
            ADVERTISEMENT_ROOT,
            self.host,
            self.port,
            self.area,
            escape_context(&self.context),
            self.entity_type
        );
        if let Some(id) = &self.id {
            path.push(SEPARATOR);
            path.push_str(id);
        }
        path
    }

    pub fn decode(path: &str) -> Result<Self> {
        let parts: Vec<&str> = path.split(SEPARATOR).collect();
        if !(parts.len() == 6 || parts.len() == 7) || parts[0] != ADVERTISEMENT_ROOT {
            return Err(ContextError::InvalidInput(format!(
                "'{path}' is not an advertisement path"
            )));
        }
        let port = parts[2].parse::<u16>().map_err(|_| {
            ContextError::InvalidInput(format!("advertisement port '{}' is not a port", parts[2]))
        })?;
        Self::new(
            parts[1],
            port,
            parts[3],
            unescape_context(parts[4]),
            parts[5],
            parts.get(6).map(|s| (*s).to_string()),
        )
    }

    pub fn key(&self) -> DiscoveryKey {
        DiscoveryKey {
            host: self.host.clone(),
            port: self.port,
            area: self.area.clone(),
            context: self.context.clone(),
            entity_type: self.entity_type.clone(),
        }
    }
}

/// Build an advertisement lookup pattern.
///
/// Coarse mode matches `provider/+/+/{area}/{context}/{type}`, or the
/// whole shape subtree when the type is open. Per-entity mode appends
/// the id level.
pub fn advertisement_pattern(
    area: Option<&str>,
    context: Option<&str>,
    entity_type: Option<&str>,
    id: Option<&str>,
    per_entity: bool,
) -> Result<String> {
    let area = match area {
        Some(a) => {
            validate_segment("area", a)?;
            a.to_string()
        }
        None => SINGLE_LEVEL_WILDCARD.to_string(),
    };
    let context = match context {
        Some(c) => {
            validate_context(c)?;
            escape_context(c)
        }
        None => SINGLE_LEVEL_WILDCARD.to_string(),
    };
    if let Some(t) = entity_type {
        validate_segment("type", t)?;
    }
    if let Some(i) = id {
        validate_segment("id", i)?;
    }

    let prefix = format!("{ADVERTISEMENT_ROOT}/+/+/{area}/{context}");
    Ok(match (per_entity, entity_type, id) {
        (false, Some(t), _) => format!("{prefix}/{t}"),
        (false, None, _) => format!("{prefix}/{MULTI_LEVEL_WILDCARD}"),
        (true, t, i) => format!(
            "{prefix}/{}/{}",
            t.unwrap_or(SINGLE_LEVEL_WILDCARD),
            i.unwrap_or(MULTI_LEVEL_WILDCARD)
        ),
    })
}

/// Path at which a subscription document is recorded.
pub fn subscription_record(area: &str, context: &str, subscription_id: &str) -> Result<String> {
    validate_segment("area", area)?;
    validate_segment("subscription id", subscription_id)?;
    let context = if context == SINGLE_LEVEL_WILDCARD {
        context.to_string()
    } else {
        validate_context(context)?;
        escape_context(context)
    };
    Ok(format!(
        "{area}/{SUBSCRIPTIONS_SEGMENT}/{context}/Subscription/{LOCAL_ORIGIN}/{subscription_id}"
    ))
}

/// MQTT topic filter matching (`+` single level, `#` trailing multi level).
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_parts = pattern.split(SEPARATOR);
    let mut topic_parts = topic.split(SEPARATOR);

    loop {
        match (pattern_parts.next(), topic_parts.next()) {
            (Some(MULTI_LEVEL_WILDCARD), _) => return true,
            (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CTX: &str = "https://uri.etsi.org/ngsi-ld/v1/ngsi-ld-core-context.jsonld";

    #[test]
    fn test_encode_entity_attribute() {
        let topic = EntityTopic::new("zoneA", CTX, "Sensor", LOCAL_ORIGIN, "s1")
            .unwrap()
            .attribute("temp")
            .unwrap();
        assert_eq!(
            topic.encode(),
            "zoneA/entities/https:§§uri.etsi.org§ngsi-ld§v1§ngsi-ld-core-context.jsonld/Sensor/LNA/s1/temp"
        );
    }

    #[test]
    fn test_decode_entity_attribute() {
        let topic = EntityTopic::decode("zoneA/entities/ctx§a/Sensor/LNA/s1/temp").unwrap();
        assert_eq!(topic.area, "zoneA");
        assert_eq!(topic.context, "ctx/a");
        assert_eq!(topic.entity_type, "Sensor");
        assert_eq!(topic.origin, "LNA");
        assert_eq!(topic.id, "s1");
        assert_eq!(topic.attribute.as_deref(), Some("temp"));
    }

    #[test]
    fn test_decode_rejects_foreign_paths() {
        assert!(EntityTopic::decode("provider/h/1/a/c/T").is_err());
        assert!(EntityTopic::decode("zoneA/entities/ctx").is_err());
        assert!(EntityTopic::decode("zoneA/things/ctx/T/LNA/s1/temp").is_err());
    }

    #[test]
    fn test_rejects_separator_in_segments() {
        assert!(EntityTopic::new("zone/A", "ctx", "T", LOCAL_ORIGIN, "s1").is_err());
        assert!(EntityTopic::new("zoneA", "ctx", "T/x", LOCAL_ORIGIN, "s1").is_err());
        assert!(EntityTopic::new("zoneA", "ctx", "T", "L/NA", "s1").is_err());
        assert!(EntityTopic::new("zoneA", "ctx", "T", LOCAL_ORIGIN, "s+1").is_err());
        assert!(EntityTopic::new("zoneA", "ctx", "T", LOCAL_ORIGIN, "").is_err());
        // Context separators are escaped, not rejected.
        assert!(EntityTopic::new("zoneA", "a/b/c", "T", LOCAL_ORIGIN, "s1").is_ok());
    }

    #[test]
    fn test_lineage_siblings() {
        let base = EntityTopic::new("zoneA", "ctx", "T", LOCAL_ORIGIN, "s1").unwrap();
        let created = base.created_at("temp").unwrap();
        let modified = base.modified_at("temp").unwrap();
        assert_eq!(
            created.segment(),
            Some(AttributeSegment::CreatedAt("temp"))
        );
        assert_eq!(
            modified.segment(),
            Some(AttributeSegment::ModifiedAt("temp"))
        );
        assert!(created.segment().unwrap().is_lineage());
        assert_eq!(created.segment().unwrap().attribute(), "temp");
    }

    #[test]
    fn test_entity_pattern_wildcards() {
        let pattern = EntityPattern::any()
            .context("ctx")
            .entity_type("Sensor")
            .id("s1")
            .build()
            .unwrap();
        assert_eq!(pattern, "+/entities/ctx/Sensor/+/s1/#");

        let pattern = EntityPattern::any()
            .area("zoneA")
            .attribute(AttributeSelector::Named("temp".into()))
            .build()
            .unwrap();
        assert_eq!(pattern, "zoneA/entities/+/+/+/+/temp");
    }

    #[test]
    fn test_subtree_pattern() {
        let base = EntityTopic::new("zoneA", "ctx", "T", LOCAL_ORIGIN, "s1").unwrap();
        assert_eq!(base.subtree(), "zoneA/entities/ctx/T/LNA/s1/#");
    }

    #[test]
    fn test_advertisement_roundtrip_and_key() {
        let adv = AdvertisementTopic::new("localhost", 1026, "zoneA", "a/b", "Sensor", None).unwrap();
        assert_eq!(adv.encode(), "provider/localhost/1026/zoneA/a§b/Sensor");
        let decoded = AdvertisementTopic::decode(&adv.encode()).unwrap();
        assert_eq!(decoded, adv);
        assert_eq!(decoded.key().context, "a/b");

        let fine =
            AdvertisementTopic::new("localhost", 1026, "zoneA", "ctx", "Sensor", Some("s1".into()))
                .unwrap();
        assert_eq!(fine.encode(), "provider/localhost/1026/zoneA/ctx/Sensor/s1");
        assert_eq!(fine.key(), adv_key("ctx"));
    }

    fn adv_key(context: &str) -> DiscoveryKey {
        DiscoveryKey {
            host: "localhost".into(),
            port: 1026,
            area: "zoneA".into(),
            context: context.into(),
            entity_type: "Sensor".into(),
        }
    }

    #[test]
    fn test_advertisement_patterns() {
        assert_eq!(
            advertisement_pattern(Some("zoneA"), Some("ctx"), Some("Sensor"), None, false).unwrap(),
            "provider/+/+/zoneA/ctx/Sensor"
        );
        assert_eq!(
            advertisement_pattern(None, None, None, None, false).unwrap(),
            "provider/+/+/+/+/#"
        );
        assert_eq!(
            advertisement_pattern(None, Some("ctx"), None, Some("s1"), true).unwrap(),
            "provider/+/+/+/ctx/+/s1"
        );
        assert_eq!(
            advertisement_pattern(Some("zoneA"), Some("ctx"), Some("T"), None, true).unwrap(),
            "provider/+/+/zoneA/ctx/T/#"
        );
    }

    #[test]
    fn test_subscription_record_path() {
        assert_eq!(
            subscription_record("zoneA", "a/b", "sub1").unwrap(),
            "zoneA/Subscriptions/a§b/Subscription/LNA/sub1"
        );
        assert_eq!(
            subscription_record("zoneA", "+", "sub1").unwrap(),
            "zoneA/Subscriptions/+/Subscription/LNA/sub1"
        );
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(!topic_matches("a/+/c", "a/b/d"));
        assert!(topic_matches("a/#", "a/b/c/d"));
        assert!(topic_matches("a/#", "a"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("a/+", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b"));
        assert!(topic_matches(
            "+/entities/ctx/Sensor/+/s1/#",
            "zoneA/entities/ctx/Sensor/LNA/s1/temp"
        ));
        assert!(!topic_matches(
            "+/entities/ctx/Sensor/+/s1/#",
            "zoneA/entities/ctx/Room/LNA/s1/temp"
        ));
    }

    fn segment() -> impl Strategy<Value = String> {
        "[A-Za-z0-9_.:-]{1,12}"
    }

    fn context() -> impl Strategy<Value = String> {
        "[a-z]{1,6}(:/{0,2}[a-z0-9.-]{1,8}){0,4}"
    }

    proptest! {
        #[test]
        fn prop_entity_topic_roundtrip(
            area in segment(),
            ctx in context(),
            entity_type in segment(),
            origin in segment(),
            id in segment(),
            attr in proptest::option::of(segment()),
        ) {
            let mut topic = EntityTopic::new(area, ctx, entity_type, origin, id).unwrap();
            if let Some(attr) = attr {
                topic = topic.attribute(&attr).unwrap();
            }
            let decoded = EntityTopic::decode(&topic.encode()).unwrap();
            prop_assert_eq!(decoded, topic);
        }
    }
}
