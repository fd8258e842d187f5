// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Attribute Filter Expressions
//!
//! Parser and evaluator for the `q` query parameter.
//!
//! # Supported Syntax
//!
//! ```text
//! expression ::= term ( '|' term )*
//! term       ::= factor ( ';' factor )*
//! factor     ::= '(' expression ')' | comparison
//! comparison ::= attribute operator literal
//! operator   ::= '==' | '>' | '<' | '>=' | '<='
//! literal    ::= number | quoted-string | word
//! ```
//!
//! `;` binds tighter than `|`. Equality against a list-valued attribute
//! is set membership. A comparison on an absent attribute is false.
//!
//! # Example
//!
//! ```ignore
//! let filter = QueryFilter::parse("temp>10;temp<20|status==alarm")?;
//! if filter.matches(&entity) { /* ... */ }
//! ```

mod evaluator;
mod parser;

pub use parser::{parse_expression, Expression, Literal, Operator};

use crate::entity::Entity;

/// Parsed `q` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFilter {
    source: String,
    expression: Expression,
}

impl QueryFilter {
    pub fn parse(source: &str) -> Result<Self, FilterError> {
        Ok(Self {
            source: source.to_string(),
            expression: parse_expression(source)?,
        })
    }

    /// Whether the entity satisfies the expression.
    pub fn matches(&self, entity: &Entity) -> bool {
        evaluator::evaluate(&self.expression, entity)
    }

    /// Attributes referenced anywhere in the expression.
    pub fn attributes(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.expression.collect_attributes(&mut names);
        names.sort_unstable();
        names.dedup();
        names
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expression(&self) -> &Expression {
        &self.expression
    }
}

/// Errors raised while parsing a filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterError {
    /// Invalid filter expression syntax.
    ParseError(String),
    /// Empty expression.
    EmptyExpression,
}

impl std::fmt::Display for FilterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterError::ParseError(msg) => write!(f, "Filter parse error: {}", msg),
            FilterError::EmptyExpression => write!(f, "Empty filter expression"),
        }
    }
}

impl std::error::Error for FilterError {}
