// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Context node: the writer, reader, subscription manager and oracle
//! of one local broker, driven by [`Command`]s.

use crate::broker::Connector;
use crate::command::{BatchKind, Command};
use crate::config::{CredentialStore, NodeConfig};
use crate::entity::Entity;
use crate::error::{ContextError, Result};
use crate::oracle::ExistenceOracle;
use crate::reader::{EntityReader, QueryParams};
use crate::subscription::{SubscriptionHandle, SubscriptionManager, SubscriptionRequest};
use crate::topic::EntityPattern;
use crate::writer::{BatchOutcome, EntityWriter};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;

/// Result of one executed command.
pub enum Outcome {
    Created(String),
    Updated(String),
    Deleted(String),
    Entities(Vec<Entity>),
    Batch(BatchOutcome),
    Subscribed(SubscriptionHandle),
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Created(id) => f.debug_tuple("Created").field(id).finish(),
            Outcome::Updated(id) => f.debug_tuple("Updated").field(id).finish(),
            Outcome::Deleted(id) => f.debug_tuple("Deleted").field(id).finish(),
            Outcome::Entities(e) => f.debug_tuple("Entities").field(&e.len()).finish(),
            Outcome::Batch(b) => f.debug_tuple("Batch").field(b).finish(),
            Outcome::Subscribed(h) => f.debug_tuple("Subscribed").field(&h.sources()).finish(),
        }
    }
}

/// Facade over one local broker.
pub struct ContextNode<C: Connector> {
    config: Arc<NodeConfig>,
    writer: EntityWriter<C>,
    reader: EntityReader<C>,
    subscriptions: SubscriptionManager<C>,
    oracle: ExistenceOracle<C>,
}

impl<C: Connector> ContextNode<C> {
    pub fn new(connector: C, config: NodeConfig, credentials: CredentialStore) -> Self {
        let config = Arc::new(config);
        let credentials = Arc::new(credentials);
        Self {
            writer: EntityWriter::new(connector.clone(), Arc::clone(&config)),
            reader: EntityReader::new(
                connector.clone(),
                Arc::clone(&config),
                Arc::clone(&credentials),
            ),
            subscriptions: SubscriptionManager::new(
                connector.clone(),
                Arc::clone(&config),
                credentials,
            ),
            oracle: ExistenceOracle::new(connector, config.endpoint()),
            config,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn writer(&self) -> &EntityWriter<C> {
        &self.writer
    }

    pub fn reader(&self) -> &EntityReader<C> {
        &self.reader
    }

    pub fn subscriptions(&self) -> &SubscriptionManager<C> {
        &self.subscriptions
    }

    /// Whether any attribute of entity `id` is retained, in any area.
    pub async fn exists(&self, id: &str, context: Option<&str>) -> Result<bool> {
        let mut pattern = EntityPattern::any().id(id);
        if let Some(ctx) = context {
            pattern = pattern.context(ctx);
        }
        self.oracle
            .exists(&pattern.build()?, self.config.timing.probe())
            .await
    }

    /// Execute a command. `input` is the parsed input file, `context`
    /// the context link given on the command line.
    pub async fn execute(
        &self,
        command: &Command,
        input: Option<&Value>,
        context: Option<&str>,
    ) -> Result<Outcome> {
        info!("Executing {}", command);
        let require_input = || {
            input.ok_or_else(|| {
                ContextError::InvalidInput(format!("{command} requires an input file"))
            })
        };

        match command {
            Command::CreateEntity => {
                let entity = Entity::from_json(require_input()?, context)?;
                self.writer.create(&entity).await?;
                Ok(Outcome::Created(entity.id))
            }
            Command::CreateSubscription => {
                let request = SubscriptionRequest::from_json(
                    require_input()?,
                    context,
                    self.config.timing.subscription_expiry(),
                )?;
                Ok(Outcome::Subscribed(self.subscriptions.start(request).await?))
            }
            Command::DeleteEntity { id } => {
                self.writer.delete_entity(id, context).await?;
                Ok(Outcome::Deleted(id.clone()))
            }
            Command::DeleteAttribute { id, attribute } => {
                self.writer.delete_attribute(id, context, attribute).await?;
                Ok(Outcome::Deleted(format!("{id}/{attribute}")))
            }
            Command::PatchEntity { id } => {
                let attrs = as_object(require_input()?)?;
                self.writer.update(id, context, attrs).await?;
                Ok(Outcome::Updated(id.clone()))
            }
            Command::PatchAttribute { id, attribute } => {
                let body = require_input()?;
                // Either `{attr: value}` or the bare value.
                let value = body
                    .as_object()
                    .and_then(|obj| obj.get(attribute))
                    .unwrap_or(body)
                    .clone();
                self.writer
                    .update_attribute(id, context, attribute, value)
                    .await?;
                Ok(Outcome::Updated(format!("{id}/{attribute}")))
            }
            Command::Query(query) => {
                let mut params = QueryParams::parse(query, self.config.default_limit)?;
                if let Some(ctx) = context {
                    params = params.with_context(ctx);
                }
                Ok(Outcome::Entities(self.reader.query(&params).await?))
            }
            Command::Batch(BatchKind::Delete) => {
                let ids = as_id_list(require_input()?)?;
                Ok(Outcome::Batch(self.writer.batch_delete(&ids, context).await?))
            }
            Command::Batch(kind) => {
                let entities = as_entity_list(require_input()?, context)?;
                let outcome = match kind {
                    BatchKind::Create => self.writer.batch_create(&entities).await?,
                    BatchKind::Update => self.writer.batch_update(&entities).await?,
                    _ => self.writer.batch_upsert(&entities).await?,
                };
                Ok(Outcome::Batch(outcome))
            }
        }
    }
}

fn as_object(value: &Value) -> Result<&Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| ContextError::InvalidInput("input must be a JSON object".into()))
}

/// Every entry is validated before the batch starts.
fn as_entity_list(value: &Value, context: Option<&str>) -> Result<Vec<Entity>> {
    value
        .as_array()
        .ok_or_else(|| ContextError::InvalidInput("batch input must be a JSON list".into()))?
        .iter()
        .map(|doc| Entity::from_json(doc, context))
        .collect()
}

/// Ids as strings, or as entity documents carrying an `id`.
fn as_id_list(value: &Value) -> Result<Vec<String>> {
    value
        .as_array()
        .ok_or_else(|| ContextError::InvalidInput("batch delete input must be a JSON list".into()))?
        .iter()
        .map(|item| match item {
            Value::String(id) => Ok(id.clone()),
            Value::Object(obj) => obj
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| ContextError::InvalidInput("batch delete entry without id".into())),
            other => Err(ContextError::InvalidInput(format!(
                "batch delete entry {other} is not an id"
            ))),
        })
        .collect()
}
