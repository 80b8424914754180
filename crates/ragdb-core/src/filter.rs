//! Metadata filter expressions.
//!
//! Grammar (conjunctions only):
//!
//! ```text
//! expr    := pred (("and" | "&&") pred)*
//! pred    := field "==" literal
//!          | field "in" "[" literal ("," literal)* "]"
//! literal := 'single quoted' | "double quoted" | bare-word
//! ```
//!
//! Fields resolve against chunk metadata. `chunk_id`, `doc_id` and
//! `citation_url` are built in and read from the chunk itself.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::types::Chunk;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Predicate {
    Eq { field: String, value: String },
    In { field: String, values: BTreeSet<String> },
}

impl Predicate {
    pub fn field(&self) -> &str {
        match self {
            Predicate::Eq { field, .. } | Predicate::In { field, .. } => field,
        }
    }

    fn matches_value(&self, actual: Option<&str>) -> bool {
        let Some(actual) = actual else { return false };
        match self {
            Predicate::Eq { value, .. } => value == actual,
            Predicate::In { values, .. } => values.contains(actual),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    predicates: Vec<Predicate>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.predicates.push(Predicate::Eq { field: field.into(), value: value.into() });
        self
    }

    pub fn one_of<I, S>(mut self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.predicates.push(Predicate::In { field: field.into(), values });
        self
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn parse(expr: &str) -> Result<Self> {
        Parser::new(expr)?.parse()
    }

    pub fn matches(&self, chunk: &Chunk) -> bool {
        self.predicates.iter().all(|p| p.matches_value(resolve_field(chunk, p.field())))
    }
}

fn resolve_field<'a>(chunk: &'a Chunk, field: &str) -> Option<&'a str> {
    match field {
        "chunk_id" => Some(chunk.id.as_str()),
        "doc_id" | "source_doc_id" => Some(chunk.source_doc_id.as_str()),
        "citation_url" => Some(chunk.citation_url.as_str()),
        _ => chunk.metadata.get(field).map(String::as_str),
    }
}

impl FromStr for Filter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, p) in self.predicates.iter().enumerate() {
            if i > 0 {
                f.write_str(" and ")?;
            }
            match p {
                Predicate::Eq { field, value } => write!(f, "{field} == '{}'", value.replace('\'', "\\'"))?,
                Predicate::In { field, values } => {
                    let list: Vec<String> = values.iter().map(|v| format!("'{}'", v.replace('\'', "\\'"))).collect();
                    write!(f, "{field} in [{}]", list.join(", "))?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Literal(String),
    EqEq,
    In,
    And,
    LBracket,
    RBracket,
    Comma,
}

fn tokenize(expr: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expr.char_indices().peekable();
    while let Some(&(pos, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' => {
                chars.next();
                match chars.next() {
                    Some((_, '=')) => tokens.push(Token::EqEq),
                    _ => return Err(Error::validation(format!("expected '==' at offset {pos}"))),
                }
            }
            '&' => {
                chars.next();
                match chars.next() {
                    Some((_, '&')) => tokens.push(Token::And),
                    _ => return Err(Error::validation(format!("expected '&&' at offset {pos}"))),
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some((_, ch)) = chars.next() {
                    match ch {
                        '\\' => match chars.next() {
                            Some((_, escaped)) => value.push(escaped),
                            None => break,
                        },
                        ch if ch == quote => {
                            closed = true;
                            break;
                        }
                        ch => value.push(ch),
                    }
                }
                if !closed {
                    return Err(Error::validation(format!("unterminated string starting at offset {pos}")));
                }
                tokens.push(Token::Literal(value));
            }
            c if is_word_char(c) => {
                let mut word = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if !is_word_char(ch) {
                        break;
                    }
                    word.push(ch);
                    chars.next();
                }
                let token = match word.to_ascii_lowercase().as_str() {
                    "and" => Token::And,
                    "in" => Token::In,
                    _ => Token::Ident(word),
                };
                tokens.push(token);
            }
            other => return Err(Error::validation(format!("unexpected character '{other}' at offset {pos}"))),
        }
    }
    Ok(tokens)
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '-' | '/' | ':')
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(expr: &str) -> Result<Self> {
        if expr.trim().is_empty() {
            return Err(Error::validation("empty filter expression"));
        }
        Ok(Self { tokens: tokenize(expr)?, pos: 0 })
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse(mut self) -> Result<Filter> {
        let mut filter = Filter::new();
        loop {
            filter.predicates.push(self.predicate()?);
            match self.next() {
                None => return Ok(filter),
                Some(Token::And) => continue,
                Some(other) => return Err(Error::validation(format!("expected 'and', found {other:?}"))),
            }
        }
    }

    fn predicate(&mut self) -> Result<Predicate> {
        let field = match self.next() {
            Some(Token::Ident(name)) => name,
            other => return Err(Error::validation(format!("expected field name, found {other:?}"))),
        };
        match self.next() {
            Some(Token::EqEq) => Ok(Predicate::Eq { field, value: self.literal()? }),
            Some(Token::In) => {
                if self.next() != Some(Token::LBracket) {
                    return Err(Error::validation(format!("expected '[' after '{field} in'")));
                }
                let mut values = BTreeSet::new();
                loop {
                    values.insert(self.literal()?);
                    match self.next() {
                        Some(Token::Comma) => continue,
                        Some(Token::RBracket) => break,
                        other => return Err(Error::validation(format!("expected ',' or ']', found {other:?}"))),
                    }
                }
                Ok(Predicate::In { field, values })
            }
            other => Err(Error::validation(format!("expected '==' or 'in' after '{field}', found {other:?}"))),
        }
    }

    fn literal(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Literal(v)) | Some(Token::Ident(v)) => Ok(v),
            other => Err(Error::validation(format!("expected literal, found {other:?}"))),
        }
    }
}
