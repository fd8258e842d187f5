// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker-Emulated Context Store
//!
//! Turns a publish/subscribe broker into a context entity store using
//! nothing but retained messages and wildcard subscriptions.
//!
//! # Features
//!
//! - **Entity CRUD**: one retained message per attribute, with
//!   `createdAt`/`modifiedAt` lineage siblings
//! - **Queries**: bounded listening windows, `q` filters, geoqueries,
//!   projection and pagination
//! - **Discovery**: per-shape advertisements announce which broker holds
//!   which entities, so queries and subscriptions reach remote brokers
//! - **Subscriptions**: one listening task per advertised source, started
//!   and stopped as advertisements come and go
//!
//! # Quick Start
//!
//! ```bash
//! # Create an entity
//! comdex -c POST/entities -f sensor.json
//!
//! # Query it back
//! comdex -c "GET/entities/?type=Sensor&q=temp>10"
//!
//! # Using config file
//! comdex --config comdex.toml -c DELETE/entities/s1
//! ```
//!
//! # Topic Layout
//!
//! ```text
//! {area}/entities/{context}/{type}/{origin}/{id}/{attribute}
//! {area}/entities/{context}/{type}/{origin}/{id}/{attribute}_timerelsystem_CreatedAt
//! provider/{host}/{port}/{area}/{context}/{type}[/{id}]
//! ```

pub mod broker;
pub mod command;
pub mod config;
pub mod entity;
pub mod error;
pub mod filter;
pub mod geo;
pub mod node;
pub mod oracle;
pub mod reader;
pub mod retract;
pub mod session;
pub mod subscription;
pub mod topic;
pub mod writer;

pub use broker::{Connector, Endpoint, MemoryBroker, MqttConnector, QoS, Session};
pub use command::{BatchKind, Command};
pub use config::{CredentialStore, Granularity, LocationAwareness, NodeConfig};
pub use entity::Entity;
pub use error::{BrokerError, ContextError, Result};
pub use node::{ContextNode, Outcome};
pub use oracle::ExistenceOracle;
pub use reader::{EntityReader, QueryParams};
pub use subscription::{Notification, SubscriptionHandle, SubscriptionManager, SubscriptionRequest};
pub use topic::{DiscoveryKey, EntityTopic};
pub use writer::{BatchOutcome, EntityWriter};
