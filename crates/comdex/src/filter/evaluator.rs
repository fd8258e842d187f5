// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Filter Expression Evaluator
//!
//! Evaluates parsed expressions against reassembled entities.

use super::parser::{Expression, Literal, Operator};
use crate::entity::Entity;
use serde_json::Value;
use std::cmp::Ordering;

pub(super) fn evaluate(expr: &Expression, entity: &Entity) -> bool {
    match expr {
        Expression::Comparison {
            attribute,
            op,
            value,
        } => match entity.attribute_value(attribute) {
            Some(actual) => compare(actual, *op, value),
            None => false,
        },
        Expression::And(l, r) => evaluate(l, entity) && evaluate(r, entity),
        Expression::Or(l, r) => evaluate(l, entity) || evaluate(r, entity),
    }
}

fn compare(actual: &Value, op: Operator, literal: &Literal) -> bool {
    match (op, actual) {
        (Operator::Eq, Value::Array(items)) => items.iter().any(|item| equals(item, literal)),
        (Operator::Eq, _) => equals(actual, literal),
        (_, _) => order(actual, literal).is_some_and(|ord| satisfies(ord, op)),
    }
}

fn equals(actual: &Value, literal: &Literal) -> bool {
    match actual {
        Value::String(s) => *s == literal.text,
        Value::Number(n) => match (n.as_f64(), literal.number) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        Value::Bool(b) => literal.text == if *b { "true" } else { "false" },
        _ => false,
    }
}

/// Numeric when both sides read as numbers, lexicographic for text.
fn order(actual: &Value, literal: &Literal) -> Option<Ordering> {
    match actual {
        Value::Number(n) => n.as_f64()?.partial_cmp(&literal.number?),
        Value::String(s) => match (s.parse::<f64>().ok(), literal.number) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => Some(s.as_str().cmp(literal.text.as_str())),
        },
        _ => None,
    }
}

fn satisfies(ord: Ordering, op: Operator) -> bool {
    match op {
        Operator::Gt => ord == Ordering::Greater,
        Operator::Lt => ord == Ordering::Less,
        Operator::Ge => ord != Ordering::Less,
        Operator::Le => ord != Ordering::Greater,
        Operator::Eq => ord == Ordering::Equal,
    }
}
