// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Action handler command vocabulary.
//!
//! | Command                                  | Input file            |
//! |------------------------------------------|-----------------------|
//! | `POST/entities`                          | entity document       |
//! | `POST/Subscriptions`                     | subscription document |
//! | `DELETE/entities/{id}`                   | -                     |
//! | `DELETE/entities/{id}/attrs/{attr}`      | -                     |
//! | `PATCH/entities/{id}/attr/`              | attribute object      |
//! | `PATCH/entities/{id}/attr/{attr}`        | attribute object      |
//! | `GET/entities/?{query}`                  | -                     |
//! | `entityOperations/{create,update,upsert}`| list of entities      |
//! | `entityOperations/delete`                | list of ids           |

use crate::error::{ContextError, Result};
use std::fmt;
use std::str::FromStr;

/// Batch operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Create,
    Update,
    Upsert,
    Delete,
}

impl BatchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchKind::Create => "create",
            BatchKind::Update => "update",
            BatchKind::Upsert => "upsert",
            BatchKind::Delete => "delete",
        }
    }
}

/// One parsed action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CreateEntity,
    CreateSubscription,
    DeleteEntity { id: String },
    DeleteAttribute { id: String, attribute: String },
    /// Patch every attribute of the input object.
    PatchEntity { id: String },
    PatchAttribute { id: String, attribute: String },
    /// Raw query string, without the leading `?`.
    Query(String),
    Batch(BatchKind),
}

fn invalid(command: &str, hint: &str) -> ContextError {
    ContextError::InvalidInput(format!("command '{command}': {hint}"))
}

fn non_empty<'a>(command: &str, what: &str, value: Option<&'a str>) -> Result<&'a str> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| invalid(command, &format!("missing {what}")))
}

impl Command {
    pub fn parse(command: &str) -> Result<Self> {
        let raw = command.trim();

        if let Some(rest) = raw.strip_prefix("GET/entities") {
            let rest = rest.strip_prefix('/').unwrap_or(rest);
            return Ok(Command::Query(rest.trim_start_matches('?').to_string()));
        }
        if raw == "POST/entities" || raw == "POST/entities/" {
            return Ok(Command::CreateEntity);
        }
        if raw == "POST/Subscriptions" || raw == "POST/Subscriptions/" {
            return Ok(Command::CreateSubscription);
        }
        if let Some(rest) = raw.strip_prefix("DELETE/entities/") {
            let parts: Vec<&str> = rest.split('/').collect();
            let id = non_empty(raw, "entity id", parts.first().copied())?.to_string();
            return match parts.as_slice() {
                [_] => Ok(Command::DeleteEntity { id }),
                [_, "attrs", attr] => Ok(Command::DeleteAttribute {
                    id,
                    attribute: non_empty(raw, "attribute", Some(attr))?.to_string(),
                }),
                _ => Err(invalid(raw, "expected DELETE/entities/{id}[/attrs/{attr}]")),
            };
        }
        if let Some(rest) = raw.strip_prefix("PATCH/entities/") {
            let parts: Vec<&str> = rest.split('/').collect();
            let id = non_empty(raw, "entity id", parts.first().copied())?.to_string();
            return match parts.as_slice() {
                [_, "attr" | "attrs"] | [_, "attr" | "attrs", ""] => Ok(Command::PatchEntity { id }),
                [_, "attr" | "attrs", attr] => Ok(Command::PatchAttribute {
                    id,
                    attribute: (*attr).to_string(),
                }),
                _ => Err(invalid(raw, "expected PATCH/entities/{id}/attr/[{attr}]")),
            };
        }

        let batch = raw.strip_prefix("POST/").unwrap_or(raw);
        if let Some(kind) = batch.strip_prefix("entityOperations/") {
            return match kind.trim_end_matches('/') {
                "create" => Ok(Command::Batch(BatchKind::Create)),
                "update" => Ok(Command::Batch(BatchKind::Update)),
                "upsert" => Ok(Command::Batch(BatchKind::Upsert)),
                "delete" => Ok(Command::Batch(BatchKind::Delete)),
                _ => Err(invalid(raw, "unknown entity operation")),
            };
        }

        Err(invalid(raw, "unknown command"))
    }

    /// Whether the command reads an input file.
    pub fn needs_input(&self) -> bool {
        !matches!(
            self,
            Command::DeleteEntity { .. } | Command::DeleteAttribute { .. } | Command::Query(_)
        )
    }
}

impl FromStr for Command {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::CreateEntity => write!(f, "POST/entities"),
            Command::CreateSubscription => write!(f, "POST/Subscriptions"),
            Command::DeleteEntity { id } => write!(f, "DELETE/entities/{id}"),
            Command::DeleteAttribute { id, attribute } => {
                write!(f, "DELETE/entities/{id}/attrs/{attribute}")
            }
            Command::PatchEntity { id } => write!(f, "PATCH/entities/{id}/attr/"),
            Command::PatchAttribute { id, attribute } => {
                write!(f, "PATCH/entities/{id}/attr/{attribute}")
            }
            Command::Query(q) => write!(f, "GET/entities/?{q}"),
            Command::Batch(kind) => write!(f, "entityOperations/{}", kind.as_str()),
        }
    }
}
