//! Recursive descent parser for OData filter expressions
//!
//! Operator precedence, highest to lowest:
//!   1. Unary: not, -
//!   2. Multiplicative: mul, div, mod
//!   3. Additive: add, sub
//!   4. Comparison: eq, ne, gt, ge, lt, le
//!   5. Logical AND
//!   6. Logical OR

use super::ast::*;
use crate::lexer::{Token, TokenKind};
use crate::types::Value;
use chrono::{DateTime, NaiveDate, Utc};
use localbus_core::{FilterError, SourcePosition};
use uuid::Uuid;

/// Recursive descent parser over a token stream.
///
/// Not thread-safe; create one instance per parse.
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    /// Create a parser for a token stream (must end with an EOF token).
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    /// Parse the token stream. Empty input yields `None`, meaning the filter
    /// matches everything.
    pub fn parse(&mut self) -> Result<Option<Expr>, FilterError> {
        if self.tokens.len() == 1 && self.tokens[0].kind == TokenKind::Eof {
            return Ok(None);
        }

        let expr = self.parse_or()?;

        if !self.is_at_end() {
            return Err(FilterError::Syntax {
                message: format!("Unexpected token: {}", self.current().kind.describe()),
                position: self.current().position,
                suggestion: Some("Check for missing operators or parentheses".to_string()),
            });
        }

        Ok(Some(expr))
    }

    fn current(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or_else(|| {
            self.tokens
                .last()
                .expect("token stream always holds an EOF token")
        })
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.pos.saturating_sub(1)]
    }

    fn is_at_end(&self) -> bool {
        self.current().kind == TokenKind::Eof
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if !self.is_at_end() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        !self.is_at_end() && &self.current().kind == kind
    }

    fn matches(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, message: &str) -> Result<Token, FilterError> {
        if self.check(&kind) {
            Ok(self.advance())
        } else {
            Err(FilterError::Syntax {
                message: message.to_string(),
                position: self.current().position,
                suggestion: None,
            })
        }
    }

    fn parse_or(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.parse_and()?;

        while self.matches(&TokenKind::Or) {
            let position = self.previous().position;
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
                position,
            };
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.parse_unary()?;

        while self.matches(&TokenKind::And) {
            let position = self.previous().position;
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
                position,
            };
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, FilterError> {
        if self.matches(&TokenKind::Not) {
            let position = self.previous().position;
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
                position,
            });
        }

        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, FilterError> {
        if self.matches(&TokenKind::LParen) {
            let expr = self.parse_or()?;
            self.expect(TokenKind::RParen, "Expected closing parenthesis ')'")?;
            return Ok(expr);
        }

        self.parse_comparison()
    }

    fn comparison_op(kind: &TokenKind) -> Option<BinaryOp> {
        match kind {
            TokenKind::Eq => Some(BinaryOp::Eq),
            TokenKind::Ne => Some(BinaryOp::Ne),
            TokenKind::Gt => Some(BinaryOp::Gt),
            TokenKind::Ge => Some(BinaryOp::Ge),
            TokenKind::Lt => Some(BinaryOp::Lt),
            TokenKind::Le => Some(BinaryOp::Le),
            _ => None,
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, FilterError> {
        let left = if matches!(self.current().kind, TokenKind::Function(_)) {
            self.parse_function_call()?
        } else {
            self.parse_additive()?
        };

        if let Some(op) = Self::comparison_op(&self.current().kind) {
            let position = self.advance().position;
            let right = if matches!(self.current().kind, TokenKind::Function(_)) {
                self.parse_function_call()?
            } else {
                self.parse_additive()?
            };
            return Ok(Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                position,
            });
        }

        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.parse_multiplicative()?;

        loop {
            let op = match self.current().kind {
                TokenKind::Add => BinaryOp::Add,
                TokenKind::Sub => BinaryOp::Sub,
                _ => break,
            };
            let position = self.advance().position;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                position,
            };
        }

        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.parse_operand()?;

        loop {
            let op = match self.current().kind {
                TokenKind::Mul => BinaryOp::Mul,
                TokenKind::Div => BinaryOp::Div,
                TokenKind::Mod => BinaryOp::Mod,
                _ => break,
            };
            let position = self.advance().position;
            let right = self.parse_operand()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                position,
            };
        }

        Ok(left)
    }

    /// Parse a literal, property access, parenthesized value, or nested
    /// function call, with an optional leading sign.
    ///
    /// Signed numeric literals (`-5`) arrive pre-folded from the lexer;
    /// a standalone `-` negates whatever operand follows, binding tighter
    /// than the multiplicative operators. A standalone `+` is the identity.
    fn parse_operand(&mut self) -> Result<Expr, FilterError> {
        if self.matches(&TokenKind::Minus) {
            let position = self.previous().position;
            let operand = self.parse_operand()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
                position,
            });
        }
        if self.matches(&TokenKind::Plus) {
            return self.parse_operand();
        }

        let token = self.current().clone();

        match token.kind {
            TokenKind::String(_)
            | TokenKind::Integer(_)
            | TokenKind::Float(_)
            | TokenKind::Boolean(_)
            | TokenKind::Null
            | TokenKind::DateTime(_)
            | TokenKind::Guid(_) => {
                self.advance();
                Ok(Expr::Literal {
                    value: Self::literal_value(&token)?,
                    position: token.position,
                })
            }
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(Expr::Property {
                    name,
                    position: token.position,
                })
            }
            TokenKind::Function(_) => self.parse_function_call(),
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_or()?;
                self.expect(TokenKind::RParen, "Expected closing parenthesis ')'")?;
                Ok(expr)
            }
            _ => Err(FilterError::Syntax {
                message: format!(
                    "Expected literal or property name, got {}",
                    token.kind.describe()
                ),
                position: token.position,
                suggestion: Some("Check expression syntax".to_string()),
            }),
        }
    }

    fn parse_function_call(&mut self) -> Result<Expr, FilterError> {
        let token = self.advance();
        let function = match token.kind {
            TokenKind::Function(name) => name,
            other => {
                return Err(FilterError::Syntax {
                    message: format!("Expected function name, got {}", other.describe()),
                    position: token.position,
                    suggestion: None,
                });
            }
        };

        self.expect(
            TokenKind::LParen,
            &format!("Expected '(' after function name '{}'", function),
        )?;

        let mut args = Vec::new();
        if !self.check(&TokenKind::RParen) {
            args.push(self.parse_or()?);
            while self.matches(&TokenKind::Comma) {
                args.push(self.parse_or()?);
            }
        }

        self.expect(TokenKind::RParen, "Expected ')' after function arguments")?;

        Ok(Expr::Call {
            function,
            args,
            position: token.position,
        })
    }

    fn literal_value(token: &Token) -> Result<Value, FilterError> {
        match &token.kind {
            TokenKind::String(s) => Ok(Value::String(s.clone())),
            TokenKind::Integer(n) => Ok(Value::from_int(*n)),
            TokenKind::Float(f) => Ok(Value::Double(*f)),
            TokenKind::Boolean(b) => Ok(Value::Bool(*b)),
            TokenKind::Null => Ok(Value::Null),
            TokenKind::DateTime(raw) => Self::parse_datetime(raw, token.position),
            TokenKind::Guid(raw) => Uuid::parse_str(raw)
                .map(Value::Guid)
                .map_err(|_| FilterError::Syntax {
                    message: format!("Invalid GUID format: {}", raw),
                    position: token.position,
                    suggestion: None,
                }),
            other => Err(FilterError::Syntax {
                message: format!("Not a literal: {}", other.describe()),
                position: token.position,
                suggestion: None,
            }),
        }
    }

    fn parse_datetime(raw: &str, position: SourcePosition) -> Result<Value, FilterError> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Ok(Value::DateTime(dt.with_timezone(&Utc)));
        }
        // Date-only form: YYYY-MM-DD, midnight UTC
        if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            if let Some(dt) = date.and_hms_opt(0, 0, 0) {
                return Ok(Value::DateTime(DateTime::from_naive_utc_and_offset(dt, Utc)));
            }
        }
        Err(FilterError::Syntax {
            message: format!("Invalid datetime format: {}", raw),
            position,
            suggestion: Some("Use ISO 8601 format: YYYY-MM-DDTHH:MM:SSZ".to_string()),
        })
    }
}
