//! Platform predicate parsing and evaluation.
//!
//! A predicate is a boolean expression over named facts:
//!
//! ```text
//! linux_target? || osx_target?
//! unix_target && !arm_target
//! (linux_target or windows_target) and not fips_mode
//! ```
//!
//! A trailing `?` on a fact name is accepted and ignored. `&&`/`and`,
//! `||`/`or` and `!`/`not` are interchangeable. Evaluation short-circuits
//! left to right.

mod facts;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub use facts::FactSet;

/// Errors raised while parsing or evaluating predicates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PredicateError {
  /// The predicate refers to a fact the session does not know.
  #[error("unknown predicate '{0}'")]
  UnknownPredicate(String),

  /// The expression text is malformed.
  #[error("invalid predicate '{expr}' at position {position}: {message}")]
  Parse {
    expr: String,
    position: usize,
    message: String,
  },
}

/// A parsed predicate expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
  Const(bool),
  Fact(String),
  Not(Box<Predicate>),
  All(Vec<Predicate>),
  Any(Vec<Predicate>),
}

impl Predicate {
  pub fn fact(name: impl Into<String>) -> Self {
    Self::Fact(name.into())
  }

  /// Conjunction of two predicates, flattening nested `All`.
  pub fn and(self, other: Predicate) -> Self {
    let mut items = match self {
      Predicate::All(items) => items,
      p => vec![p],
    };
    match other {
      Predicate::All(more) => items.extend(more),
      p => items.push(p),
    }
    Predicate::All(items)
  }

  /// Disjunction of two predicates, flattening nested `Any`.
  pub fn or(self, other: Predicate) -> Self {
    let mut items = match self {
      Predicate::Any(items) => items,
      p => vec![p],
    };
    match other {
      Predicate::Any(more) => items.extend(more),
      p => items.push(p),
    }
    Predicate::Any(items)
  }

  /// Evaluate against a fact set, short-circuiting left to right.
  pub fn evaluate(&self, facts: &FactSet) -> Result<bool, PredicateError> {
    match self {
      Predicate::Const(value) => Ok(*value),
      Predicate::Fact(name) => facts
        .get(name)
        .ok_or_else(|| PredicateError::UnknownPredicate(name.clone())),
      Predicate::Not(inner) => Ok(!inner.evaluate(facts)?),
      Predicate::All(items) => {
        for item in items {
          if !item.evaluate(facts)? {
            return Ok(false);
          }
        }
        Ok(true)
      }
      Predicate::Any(items) => {
        for item in items {
          if item.evaluate(facts)? {
            return Ok(true);
          }
        }
        Ok(false)
      }
    }
  }

  /// Check every fact name against the fact set without evaluating.
  ///
  /// Unlike [`Predicate::evaluate`] this visits branches that short-circuiting
  /// would skip, so a misspelled fact is caught before any build starts.
  pub fn validate(&self, facts: &FactSet) -> Result<(), PredicateError> {
    match self {
      Predicate::Const(_) => Ok(()),
      Predicate::Fact(name) if facts.contains(name) => Ok(()),
      Predicate::Fact(name) => Err(PredicateError::UnknownPredicate(name.clone())),
      Predicate::Not(inner) => inner.validate(facts),
      Predicate::All(items) | Predicate::Any(items) => items.iter().try_for_each(|p| p.validate(facts)),
    }
  }

  /// Fact names referenced by this predicate, in first-seen order.
  pub fn fact_names(&self) -> Vec<&str> {
    let mut names = Vec::new();
    self.collect_names(&mut names);
    names
  }

  fn collect_names<'a>(&'a self, names: &mut Vec<&'a str>) {
    match self {
      Predicate::Const(_) => {}
      Predicate::Fact(name) => {
        if !names.contains(&name.as_str()) {
          names.push(name);
        }
      }
      Predicate::Not(inner) => inner.collect_names(names),
      Predicate::All(items) | Predicate::Any(items) => items.iter().for_each(|p| p.collect_names(names)),
    }
  }
}

/// Evaluate `predicate` against `facts`.
pub fn evaluate(predicate: &Predicate, facts: &FactSet) -> Result<bool, PredicateError> {
  predicate.evaluate(facts)
}

impl fmt::Display for Predicate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Predicate::Const(value) => write!(f, "{}", value),
      Predicate::Fact(name) => write!(f, "{}", name),
      Predicate::Not(inner) => match inner.as_ref() {
        Predicate::All(_) | Predicate::Any(_) => write!(f, "!({})", inner),
        _ => write!(f, "!{}", inner),
      },
      Predicate::All(items) => write_joined(f, items, " && ", |p| matches!(p, Predicate::Any(_))),
      Predicate::Any(items) => write_joined(f, items, " || ", |_| false),
    }
  }
}

fn write_joined(
  f: &mut fmt::Formatter<'_>,
  items: &[Predicate],
  sep: &str,
  needs_parens: impl Fn(&Predicate) -> bool,
) -> fmt::Result {
  for (i, item) in items.iter().enumerate() {
    if i > 0 {
      f.write_str(sep)?;
    }
    if needs_parens(item) {
      write!(f, "({})", item)?;
    } else {
      write!(f, "{}", item)?;
    }
  }
  Ok(())
}

impl FromStr for Predicate {
  type Err = PredicateError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    parse(s)
  }
}

impl Serialize for Predicate {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for Predicate {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let text = String::deserialize(deserializer)?;
    parse(&text).map_err(serde::de::Error::custom)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
  Ident(String),
  And,
  Or,
  Not,
  LParen,
  RParen,
}

fn tokenize(expr: &str) -> Result<Vec<(usize, Token)>, PredicateError> {
  let mut tokens = Vec::new();
  let mut chars = expr.char_indices().peekable();

  while let Some((pos, ch)) = chars.next() {
    match ch {
      c if c.is_whitespace() => {}
      '(' => tokens.push((pos, Token::LParen)),
      ')' => tokens.push((pos, Token::RParen)),
      '!' => tokens.push((pos, Token::Not)),
      '&' | '|' => {
        if chars.next_if(|&(_, next)| next == ch).is_none() {
          return Err(parse_error(expr, pos, format!("expected '{}{}'", ch, ch)));
        }
        tokens.push((pos, if ch == '&' { Token::And } else { Token::Or }));
      }
      c if c.is_ascii_alphanumeric() || c == '_' => {
        let mut ident = String::from(c);
        while let Some((_, next)) = chars.next_if(|&(_, n)| n.is_ascii_alphanumeric() || n == '_') {
          ident.push(next);
        }
        // Ruby-style `linux_target?`
        chars.next_if(|&(_, n)| n == '?');
        let token = match ident.as_str() {
          "and" => Token::And,
          "or" => Token::Or,
          "not" => Token::Not,
          _ => Token::Ident(ident),
        };
        tokens.push((pos, token));
      }
      other => return Err(parse_error(expr, pos, format!("unexpected character '{}'", other))),
    }
  }

  Ok(tokens)
}

fn parse_error(expr: &str, position: usize, message: impl Into<String>) -> PredicateError {
  PredicateError::Parse {
    expr: expr.to_string(),
    position,
    message: message.into(),
  }
}

struct Parser<'a> {
  expr: &'a str,
  tokens: Vec<(usize, Token)>,
  pos: usize,
}

impl Parser<'_> {
  fn peek(&self) -> Option<&Token> {
    self.tokens.get(self.pos).map(|(_, t)| t)
  }

  fn offset(&self) -> usize {
    self.tokens.get(self.pos).map(|(p, _)| *p).unwrap_or(self.expr.len())
  }

  fn parse_or(&mut self) -> Result<Predicate, PredicateError> {
    let mut items = vec![self.parse_and()?];
    while self.peek() == Some(&Token::Or) {
      self.pos += 1;
      items.push(self.parse_and()?);
    }
    Ok(if items.len() == 1 { items.remove(0) } else { Predicate::Any(items) })
  }

  fn parse_and(&mut self) -> Result<Predicate, PredicateError> {
    let mut items = vec![self.parse_unary()?];
    while self.peek() == Some(&Token::And) {
      self.pos += 1;
      items.push(self.parse_unary()?);
    }
    Ok(if items.len() == 1 { items.remove(0) } else { Predicate::All(items) })
  }

  fn parse_unary(&mut self) -> Result<Predicate, PredicateError> {
    if self.peek() == Some(&Token::Not) {
      self.pos += 1;
      return Ok(Predicate::Not(Box::new(self.parse_unary()?)));
    }
    self.parse_primary()
  }

  fn parse_primary(&mut self) -> Result<Predicate, PredicateError> {
    let offset = self.offset();
    match self.tokens.get(self.pos).map(|(_, t)| t.clone()) {
      Some(Token::Ident(name)) => {
        self.pos += 1;
        Ok(match name.as_str() {
          "true" => Predicate::Const(true),
          "false" => Predicate::Const(false),
          _ => Predicate::Fact(name),
        })
      }
      Some(Token::LParen) => {
        self.pos += 1;
        let inner = self.parse_or()?;
        if self.peek() != Some(&Token::RParen) {
          return Err(parse_error(self.expr, self.offset(), "expected ')'"));
        }
        self.pos += 1;
        Ok(inner)
      }
      Some(_) => Err(parse_error(self.expr, offset, "expected a fact name or '('")),
      None => Err(parse_error(self.expr, offset, "unexpected end of expression")),
    }
  }
}

/// Parse a predicate expression.
pub fn parse(expr: &str) -> Result<Predicate, PredicateError> {
  let tokens = tokenize(expr)?;
  let mut parser = Parser { expr, tokens, pos: 0 };
  let predicate = parser.parse_or()?;
  if parser.pos != parser.tokens.len() {
    return Err(parse_error(expr, parser.offset(), "unexpected trailing input"));
  }
  Ok(predicate)
}
