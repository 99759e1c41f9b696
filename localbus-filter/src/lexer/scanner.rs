//! Lexer implementation
//!
//! DFA-style scanner over UTF-8 input producing typed tokens with positions.
//! Keywords and function names are case-insensitive; identifiers keep their
//! case.

use super::token::*;
use localbus_core::{FilterError, SourcePosition};

/// Reserved function names (case-insensitive).
const FUNCTIONS: &[&str] = &[
    // String functions
    "startswith",
    "endswith",
    "contains",
    "substringof",
    "tolower",
    "toupper",
    "trim",
    "concat",
    "substring",
    "length",
    "indexof",
    "replace",
    // Date functions
    "year",
    "month",
    "day",
    "hour",
    "minute",
    "second",
    // Math functions
    "round",
    "floor",
    "ceiling",
    // Type functions
    "isof",
    "cast",
];

/// Lexer for OData filter expressions.
///
/// Positions are tracked in characters; `pos` is the character offset
/// reported in diagnostics. Not thread-safe; create one instance per input.
pub struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
}

impl Lexer {
    /// Create a new lexer for the given filter expression.
    pub fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    /// Tokenize the whole input, returning tokens plus a trailing EOF token.
    pub fn tokenize(&mut self) -> Result<Vec<Token>, FilterError> {
        let mut tokens = Vec::new();

        while self.pos < self.chars.len() {
            let c = self.peek(0).unwrap();

            if c.is_whitespace() {
                self.skip_whitespace();
                continue;
            }

            if c == '\'' {
                tokens.push(self.read_string()?);
            } else if c.is_ascii_digit()
                || ((c == '+' || c == '-')
                    && self.peek(1).map(|n| n.is_ascii_digit()).unwrap_or(false))
            {
                tokens.push(self.read_number()?);
            } else if c.is_alphabetic() || c == '_' {
                tokens.push(self.read_identifier()?);
            } else if c == '(' {
                tokens.push(self.punctuation(TokenKind::LParen));
            } else if c == ')' {
                tokens.push(self.punctuation(TokenKind::RParen));
            } else if c == ',' {
                tokens.push(self.punctuation(TokenKind::Comma));
            } else if c == '-' {
                // Not attached to a digit (handled above): standalone sign.
                tokens.push(self.punctuation(TokenKind::Minus));
            } else if c == '+' {
                tokens.push(self.punctuation(TokenKind::Plus));
            } else if matches!(c, '=' | '!' | '<' | '>') {
                tokens.push(self.read_symbolic_operator()?);
            } else {
                return Err(FilterError::Syntax {
                    message: format!("Unexpected character: '{}'", c),
                    position: self.position(),
                    suggestion: Some(
                        "Only alphanumerics, operators, and punctuation are allowed".to_string(),
                    ),
                });
            }
        }

        tokens.push(Token {
            kind: TokenKind::Eof,
            position: self.position(),
            length: 0,
        });

        Ok(tokens)
    }

    fn position(&self) -> SourcePosition {
        SourcePosition::new(self.line, self.column, self.pos)
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while self.peek(0).map(|c| c.is_whitespace()).unwrap_or(false) {
            self.advance();
        }
    }

    fn punctuation(&mut self, kind: TokenKind) -> Token {
        let position = self.position();
        self.advance();
        Token {
            kind,
            position,
            length: 1,
        }
    }

    /// Read a SQL-style comparison operator. Rule filters use the SQL
    /// dialect (`=`, `!=`, `<>`, `<`, `>`, `<=`, `>=`) alongside the OData
    /// keywords.
    fn read_symbolic_operator(&mut self) -> Result<Token, FilterError> {
        let start = self.position();
        let first = self.advance().unwrap();

        let kind = match first {
            '=' => {
                // Tolerate a doubled '=='.
                if self.peek(0) == Some('=') {
                    self.advance();
                }
                TokenKind::Eq
            }
            '!' => {
                if self.peek(0) == Some('=') {
                    self.advance();
                    TokenKind::Ne
                } else {
                    return Err(FilterError::Syntax {
                        message: "Unexpected character: '!'".to_string(),
                        position: start,
                        suggestion: Some("Use '!=' or 'ne' for inequality".to_string()),
                    });
                }
            }
            '<' => match self.peek(0) {
                Some('=') => {
                    self.advance();
                    TokenKind::Le
                }
                Some('>') => {
                    self.advance();
                    TokenKind::Ne
                }
                _ => TokenKind::Lt,
            },
            '>' => {
                if self.peek(0) == Some('=') {
                    self.advance();
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            other => {
                return Err(FilterError::Syntax {
                    message: format!("Unexpected character: '{}'", other),
                    position: start,
                    suggestion: None,
                });
            }
        };

        Ok(Token {
            kind,
            position: start,
            length: self.pos - start.offset,
        })
    }

    /// Read a single-quoted string literal; `''` inside is an escaped quote.
    fn read_string(&mut self) -> Result<Token, FilterError> {
        let start = self.position();
        self.advance(); // opening quote

        let mut value = String::new();
        loop {
            match self.peek(0) {
                None => {
                    return Err(FilterError::Syntax {
                        message: "Unclosed string literal".to_string(),
                        position: start,
                        suggestion: Some("Add closing single quote (')".to_string()),
                    });
                }
                Some('\'') => {
                    self.advance();
                    if self.peek(0) == Some('\'') {
                        value.push('\'');
                        self.advance();
                    } else {
                        break;
                    }
                }
                Some(c) => {
                    value.push(c);
                    self.advance();
                }
            }
        }

        let length = self.pos - start.offset;
        Ok(Token {
            kind: TokenKind::String(value),
            position: start,
            length,
        })
    }

    /// Read an integer or float literal, with optional sign and scientific
    /// notation.
    fn read_number(&mut self) -> Result<Token, FilterError> {
        let start = self.position();
        let mut text = String::new();
        let mut has_dot = false;
        let mut has_exp = false;

        if matches!(self.peek(0), Some('+') | Some('-')) {
            text.push(self.advance().unwrap());
        }

        while let Some(c) = self.peek(0) {
            if c.is_ascii_digit() {
                text.push(self.advance().unwrap());
            } else if c == '.' && !has_dot && !has_exp {
                has_dot = true;
                text.push(self.advance().unwrap());
            } else if (c == 'e' || c == 'E') && !has_exp && !text.is_empty() {
                has_exp = true;
                text.push(self.advance().unwrap());
                if matches!(self.peek(0), Some('+') | Some('-')) {
                    text.push(self.advance().unwrap());
                }
            } else {
                break;
            }
        }

        let length = self.pos - start.offset;
        let kind = if has_dot || has_exp {
            match text.parse::<f64>() {
                Ok(n) => TokenKind::Float(n),
                Err(_) => {
                    return Err(FilterError::Syntax {
                        message: format!("Invalid number format: {}", text),
                        position: start,
                        suggestion: Some(
                            "Check for malformed scientific notation or decimal point".to_string(),
                        ),
                    });
                }
            }
        } else {
            match text.parse::<i64>() {
                Ok(n) => TokenKind::Integer(n),
                Err(_) => {
                    return Err(FilterError::Syntax {
                        message: format!("Invalid number format: {}", text),
                        position: start,
                        suggestion: None,
                    });
                }
            }
        };

        Ok(Token {
            kind,
            position: start,
            length,
        })
    }

    /// Read an identifier, keyword, function name, or a prefixed
    /// `datetime'...'` / `guid'...'` literal.
    fn read_identifier(&mut self) -> Result<Token, FilterError> {
        let start = self.position();
        let mut text = String::new();

        while let Some(c) = self.peek(0) {
            if c.is_alphanumeric() || c == '_' {
                text.push(self.advance().unwrap());
            } else {
                break;
            }
        }

        let lower = text.to_lowercase();

        let kind = match lower.as_str() {
            "eq" => TokenKind::Eq,
            "ne" => TokenKind::Ne,
            "gt" => TokenKind::Gt,
            "ge" => TokenKind::Ge,
            "lt" => TokenKind::Lt,
            "le" => TokenKind::Le,
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "not" => TokenKind::Not,
            "add" => TokenKind::Add,
            "sub" => TokenKind::Sub,
            "mul" => TokenKind::Mul,
            "div" => TokenKind::Div,
            "mod" => TokenKind::Mod,
            "true" => TokenKind::Boolean(true),
            "false" => TokenKind::Boolean(false),
            "null" => TokenKind::Null,
            // A standalone "datetime" or "guid" (no quote following) is a
            // plain property name.
            "datetime" if self.peek(0) == Some('\'') => {
                return self.read_prefixed_literal(start, true);
            }
            "guid" if self.peek(0) == Some('\'') => {
                return self.read_prefixed_literal(start, false);
            }
            _ if FUNCTIONS.contains(&lower.as_str()) => TokenKind::Function(lower),
            _ => TokenKind::Identifier(text),
        };

        let length = self.pos - start.offset;
        Ok(Token {
            kind,
            position: start,
            length,
        })
    }

    /// Read the quoted tail of a `datetime'...'` or `guid'...'` literal.
    fn read_prefixed_literal(
        &mut self,
        start: SourcePosition,
        is_datetime: bool,
    ) -> Result<Token, FilterError> {
        self.advance(); // opening quote

        let mut value = String::new();
        loop {
            match self.peek(0) {
                None => {
                    return Err(FilterError::Syntax {
                        message: format!(
                            "Unclosed {} literal",
                            if is_datetime { "datetime" } else { "guid" }
                        ),
                        position: start,
                        suggestion: None,
                    });
                }
                Some('\'') => {
                    self.advance();
                    break;
                }
                Some(c) => {
                    value.push(c);
                    self.advance();
                }
            }
        }

        let length = self.pos - start.offset;

        if is_datetime {
            // Minimum ISO-8601 date: YYYY-MM-DD
            if value.len() < 10 {
                return Err(FilterError::Syntax {
                    message: format!("Invalid datetime format: {}", value),
                    position: start,
                    suggestion: Some("Use ISO 8601 format: YYYY-MM-DDTHH:MM:SSZ".to_string()),
                });
            }
            Ok(Token {
                kind: TokenKind::DateTime(value),
                position: start,
                length,
            })
        } else {
            if value.len() != 36 || value.matches('-').count() != 4 {
                return Err(FilterError::Syntax {
                    message: format!("Invalid GUID format: {}", value),
                    position: start,
                    suggestion: Some(
                        "Use format: guid'12345678-1234-1234-1234-123456789012'".to_string(),
                    ),
                });
            }
            Ok(Token {
                kind: TokenKind::Guid(value),
                position: start,
                length,
            })
        }
    }
}
