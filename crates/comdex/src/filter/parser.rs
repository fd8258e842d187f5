// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Filter Expression Parser
//!
//! Parses `q` expressions into an AST.

use super::FilterError;

/// Comparison operators supported in filter expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// Greater than (>)
    Gt,
    /// Less than (<)
    Lt,
    /// Greater than or equal (>=)
    Ge,
    /// Less than or equal (<=)
    Le,
    /// Equal (==)
    Eq,
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct Literal {
    /// Literal text, quotes removed.
    pub text: String,
    /// Numeric reading of an unquoted literal.
    pub number: Option<f64>,
}

impl Literal {
    fn word(text: String) -> Self {
        let number = text.parse::<f64>().ok().filter(|n| n.is_finite());
        Self { text, number }
    }

    fn quoted(text: String) -> Self {
        Self { text, number: None }
    }
}

/// Parsed filter expression AST node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Comparison: attribute op literal
    Comparison {
        attribute: String,
        op: Operator,
        value: Literal,
    },
    /// Logical AND (`;`)
    And(Box<Expression>, Box<Expression>),
    /// Logical OR (`|`)
    Or(Box<Expression>, Box<Expression>),
}

impl Expression {
    pub(super) fn collect_attributes<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expression::Comparison { attribute, .. } => out.push(attribute),
            Expression::And(l, r) | Expression::Or(l, r) => {
                l.collect_attributes(out);
                r.collect_attributes(out);
            }
        }
    }
}

/// Token types for the lexer.
#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Operator(Operator),
    And,
    Or,
    LParen,
    RParen,
    Eof,
}

const DELIMITERS: &[char] = &['=', '<', '>', ';', '|', '(', ')', '"', '\''];

struct Lexer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn next_char(&mut self) -> Option<char> {
        let ch = self.peek_char()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek_char() {
            if ch.is_whitespace() {
                self.next_char();
            } else {
                break;
            }
        }
    }

    fn read_word(&mut self) -> String {
        let start = self.pos;
        while let Some(ch) = self.peek_char() {
            if ch.is_whitespace() || DELIMITERS.contains(&ch) {
                break;
            }
            self.next_char();
        }
        self.input[start..self.pos].to_string()
    }

    fn read_quoted(&mut self, quote: char) -> Result<String, FilterError> {
        self.next_char(); // opening quote
        let start = self.pos;

        while let Some(ch) = self.peek_char() {
            if ch == quote {
                let s = self.input[start..self.pos].to_string();
                self.next_char();
                return Ok(s);
            }
            self.next_char();
        }

        Err(FilterError::ParseError("Unterminated string".to_string()))
    }

    fn next_token(&mut self) -> Result<Token, FilterError> {
        self.skip_whitespace();

        let ch = match self.peek_char() {
            Some(c) => c,
            None => return Ok(Token::Eof),
        };

        match ch {
            '>' | '<' => {
                self.next_char();
                let inclusive = self.peek_char() == Some('=');
                if inclusive {
                    self.next_char();
                }
                Ok(Token::Operator(match (ch, inclusive) {
                    ('>', false) => Operator::Gt,
                    ('>', true) => Operator::Ge,
                    ('<', false) => Operator::Lt,
                    _ => Operator::Le,
                }))
            }
            '=' => {
                self.next_char();
                if self.next_char() == Some('=') {
                    Ok(Token::Operator(Operator::Eq))
                } else {
                    Err(FilterError::ParseError(
                        "Expected '==' for equality".to_string(),
                    ))
                }
            }
            ';' => {
                self.next_char();
                Ok(Token::And)
            }
            '|' => {
                self.next_char();
                Ok(Token::Or)
            }
            '(' => {
                self.next_char();
                Ok(Token::LParen)
            }
            ')' => {
                self.next_char();
                Ok(Token::RParen)
            }
            '"' | '\'' => Ok(Token::Quoted(self.read_quoted(ch)?)),
            _ => Ok(Token::Word(self.read_word())),
        }
    }
}

/// Parser for filter expressions.
struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Result<Self, FilterError> {
        let mut lexer = Lexer::new(input);
        let current = lexer.next_token()?;
        Ok(Self { lexer, current })
    }

    fn advance(&mut self) -> Result<(), FilterError> {
        self.current = self.lexer.next_token()?;
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Expression, FilterError> {
        let mut left = self.parse_and()?;

        while self.current == Token::Or {
            self.advance()?;
            let right = self.parse_and()?;
            left = Expression::Or(Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expression, FilterError> {
        let mut left = self.parse_primary()?;

        while self.current == Token::And {
            self.advance()?;
            let right = self.parse_primary()?;
            left = Expression::And(Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expression, FilterError> {
        if self.current == Token::LParen {
            self.advance()?;
            let expr = self.parse_or()?;
            if self.current != Token::RParen {
                return Err(FilterError::ParseError(
                    "Expected closing parenthesis".to_string(),
                ));
            }
            self.advance()?;
            return Ok(expr);
        }

        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expression, FilterError> {
        let attribute = match &self.current {
            Token::Word(name) => name.clone(),
            other => {
                return Err(FilterError::ParseError(format!(
                    "Expected attribute name, got {:?}",
                    other
                )))
            }
        };
        self.advance()?;

        let op = match &self.current {
            Token::Operator(op) => *op,
            other => {
                return Err(FilterError::ParseError(format!(
                    "Expected operator after '{}', got {:?}",
                    attribute, other
                )))
            }
        };
        self.advance()?;

        let value = match &self.current {
            Token::Word(w) => Literal::word(w.clone()),
            Token::Quoted(s) => Literal::quoted(s.clone()),
            other => {
                return Err(FilterError::ParseError(format!(
                    "Expected value for '{}', got {:?}",
                    attribute, other
                )))
            }
        };
        self.advance()?;

        Ok(Expression::Comparison {
            attribute,
            op,
            value,
        })
    }
}

/// Parse a filter expression string into an AST.
pub fn parse_expression(expression: &str) -> Result<Expression, FilterError> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return Err(FilterError::EmptyExpression);
    }

    let mut parser = Parser::new(trimmed)?;
    let expr = parser.parse_or()?;
    if parser.current != Token::Eof {
        return Err(FilterError::ParseError(format!(
            "Unexpected trailing input: {:?}",
            parser.current
        )));
    }
    Ok(expr)
}
