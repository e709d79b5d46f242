//! Selection expressions
//!
//! Replication rules select destination storage elements with a boolean
//! expression over element attributes, e.g. `tier=1&country=de\tape=true`.
//!
//! Grammar (conventional precedence, `!` > `&`/`\` > `|`):
//!
//! ```text
//! expr    := and ( '|' and )*
//! and     := unary ( ('&' | '\') unary )*
//! unary   := '!' unary | primary
//! primary := '*' | KEY '=' VALUE | TOKEN | '(' expr ')'
//! ```
//!
//! A bare `TOKEN` matches an element whose `name` attribute equals the
//! token, or an element carrying the token as a boolean tag attribute set
//! to `true`. The expression is a plain typed tree evaluated against an
//! attribute mapping; it is independent of any storage-layer query
//! language.

use crate::error::{GridFlowError, Result};
use std::collections::HashMap;
use std::fmt;

/// A parsed selection expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    /// Matches every element (`*`)
    All,
    /// `key=value` attribute equality
    Equals { key: String, value: String },
    /// Bare token: element name or boolean tag
    Tag(String),
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    /// `a\b`: matches a but not b
    AndNot(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
}

impl Expression {
    /// Parse an expression from its textual form
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            let (token, position) = parser.peek_raw();
            return Err(GridFlowError::UnexpectedToken { token, position });
        }
        Ok(expr)
    }

    /// Evaluate the expression against an element's attribute mapping
    pub fn matches(&self, attributes: &HashMap<String, String>) -> bool {
        match self {
            Self::All => true,
            Self::Equals { key, value } => {
                attributes.get(key).map(String::as_str) == Some(value.as_str())
            }
            Self::Tag(tag) => {
                attributes.get("name").map(String::as_str) == Some(tag.as_str())
                    || attributes.get(tag).map(String::as_str) == Some("true")
            }
            Self::And(a, b) => a.matches(attributes) && b.matches(attributes),
            Self::Or(a, b) => a.matches(attributes) || b.matches(attributes),
            Self::AndNot(a, b) => a.matches(attributes) && !b.matches(attributes),
            Self::Not(a) => !a.matches(attributes),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "*"),
            Self::Equals { key, value } => write!(f, "{}={}", key, value),
            Self::Tag(tag) => write!(f, "{}", tag),
            Self::And(a, b) => write!(f, "({}&{})", a, b),
            Self::Or(a, b) => write!(f, "({}|{})", a, b),
            Self::AndNot(a, b) => write!(f, "({}\\{})", a, b),
            Self::Not(a) => write!(f, "!{}", a),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Equals,
    And,
    Or,
    Backslash,
    Bang,
    Star,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '=' => {
                chars.next();
                tokens.push((Token::Equals, pos));
            }
            '&' => {
                chars.next();
                tokens.push((Token::And, pos));
            }
            '|' => {
                chars.next();
                tokens.push((Token::Or, pos));
            }
            '\\' => {
                chars.next();
                tokens.push((Token::Backslash, pos));
            }
            '!' => {
                chars.next();
                tokens.push((Token::Bang, pos));
            }
            '*' => {
                chars.next();
                tokens.push((Token::Star, pos));
            }
            '(' => {
                chars.next();
                tokens.push((Token::LParen, pos));
            }
            ')' => {
                chars.next();
                tokens.push((Token::RParen, pos));
            }
            c if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' => {
                let mut word = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((Token::Word(word), pos));
            }
            _ => {
                return Err(GridFlowError::UnexpectedToken {
                    token: c.to_string(),
                    position: pos,
                })
            }
        }
    }

    if tokens.is_empty() {
        return Err(GridFlowError::Expression("empty expression".to_string()));
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_raw(&self) -> (String, usize) {
        match self.tokens.get(self.pos) {
            Some((Token::Word(w), p)) => (w.clone(), *p),
            Some((t, p)) => (format!("{:?}", t), *p),
            None => ("<eof>".to_string(), 0),
        }
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Expression> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expression::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expression> {
        let mut left = self.parse_unary()?;
        loop {
            match self.peek() {
                Some(Token::And) => {
                    self.advance();
                    let right = self.parse_unary()?;
                    left = Expression::And(Box::new(left), Box::new(right));
                }
                Some(Token::Backslash) => {
                    self.advance();
                    let right = self.parse_unary()?;
                    left = Expression::AndNot(Box::new(left), Box::new(right));
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expression> {
        if self.peek() == Some(&Token::Bang) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expression::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expression> {
        match self.advance() {
            Some(Token::Star) => Ok(Expression::All),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                if self.advance() != Some(Token::RParen) {
                    return Err(GridFlowError::UnbalancedParentheses);
                }
                Ok(inner)
            }
            Some(Token::Word(key)) => {
                if self.peek() == Some(&Token::Equals) {
                    self.advance();
                    match self.advance() {
                        Some(Token::Word(value)) => Ok(Expression::Equals { key, value }),
                        _ => Err(GridFlowError::Expression(format!(
                            "missing value after '{}='",
                            key
                        ))),
                    }
                } else {
                    Ok(Expression::Tag(key))
                }
            }
            _ => {
                let (token, position) = self.peek_raw();
                Err(GridFlowError::UnexpectedToken { token, position })
            }
        }
    }
}
