//! Typed label selectors.
//!
//! A [Selector] is parsed once from the Kubernetes label-selector grammar and then evaluated
//! against anything that implements [Labels], independent of where the labels came from.
//!
//! Supported requirements (comma-separated, all must hold):
//!
//! - `key=value` / `key==value`
//! - `key!=value`
//! - `key in (a,b)` / `key notin (a,b)`
//! - `key` (exists) / `!key` (does not exist)

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    str::FromStr,
};
use thiserror::Error;

/// Errors that can occur when parsing a [Selector].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("empty requirement at position {0}")]
    EmptyRequirement(usize),
    #[error("invalid key: {0:?}")]
    InvalidKey(String),
    #[error("invalid value: {0:?}")]
    InvalidValue(String),
    #[error("unterminated value set: {0}")]
    UnterminatedSet(String),
    #[error("unsupported operator in: {0}")]
    UnsupportedOperator(String),
}

/// Read-only access to a set of string labels.
pub trait Labels {
    /// Returns the value of `key`, if present.
    fn label(&self, key: &str) -> Option<&str>;
}

impl Labels for HashMap<String, String> {
    fn label(&self, key: &str) -> Option<&str> {
        self.get(key).map(String::as_str)
    }
}

impl Labels for BTreeMap<String, String> {
    fn label(&self, key: &str) -> Option<&str> {
        self.get(key).map(String::as_str)
    }
}

/// A single predicate over a label.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    /// Returns the label key this requirement inspects.
    pub fn key(&self) -> &str {
        match self {
            Self::Equals(key, _)
            | Self::NotEquals(key, _)
            | Self::In(key, _)
            | Self::NotIn(key, _)
            | Self::Exists(key)
            | Self::DoesNotExist(key) => key,
        }
    }

    /// Evaluate the requirement against `labels`.
    pub fn matches(&self, labels: &impl Labels) -> bool {
        let value = labels.label(self.key());
        match self {
            Self::Equals(_, expected) => value == Some(expected.as_str()),
            // Absent keys satisfy inequality (matches Kubernetes semantics)
            Self::NotEquals(_, expected) => value != Some(expected.as_str()),
            Self::In(_, set) => value.is_some_and(|v| set.contains(v)),
            Self::NotIn(_, set) => !value.is_some_and(|v| set.contains(v)),
            Self::Exists(_) => value.is_some(),
            Self::DoesNotExist(_) => value.is_none(),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |set: &BTreeSet<String>| set.iter().cloned().collect::<Vec<_>>().join(",");
        match self {
            Self::Equals(key, value) => write!(f, "{key}={value}"),
            Self::NotEquals(key, value) => write!(f, "{key}!={value}"),
            Self::In(key, set) => write!(f, "{key} in ({})", join(set)),
            Self::NotIn(key, set) => write!(f, "{key} notin ({})", join(set)),
            Self::Exists(key) => write!(f, "{key}"),
            Self::DoesNotExist(key) => write!(f, "!{key}"),
        }
    }
}

/// A conjunction of [Requirement]s. The empty selector matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// A selector that matches every label set.
    pub fn everything() -> Self {
        Self::default()
    }

    /// Parse a selector from its string form.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let mut requirements = Vec::new();
        for (position, raw) in split_top_level(input)?.into_iter().enumerate() {
            let raw = raw.trim();
            if raw.is_empty() {
                if input.trim().is_empty() {
                    break;
                }
                return Err(Error::EmptyRequirement(position));
            }
            requirements.push(parse_requirement(raw)?);
        }
        Ok(Self { requirements })
    }

    /// Whether this selector has no requirements.
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// The parsed requirements, in input order.
    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    /// Evaluate every requirement against `labels`.
    pub fn matches(&self, labels: &impl Labels) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl FromStr for Selector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self
            .requirements
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        write!(f, "{}", parts.join(","))
    }
}

/// Split on commas that are not inside a parenthesized value set.
fn split_top_level(input: &str) -> Result<Vec<&str>, Error> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| Error::UnsupportedOperator(input.to_string()))?;
            }
            ',' if depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(Error::UnterminatedSet(input.to_string()));
    }
    parts.push(&input[start..]);
    Ok(parts)
}

fn parse_requirement(raw: &str) -> Result<Requirement, Error> {
    if let Some(key) = raw.strip_prefix('!') {
        return Ok(Requirement::DoesNotExist(validate_key(key.trim())?));
    }
    if let Some((key, value)) = raw.split_once("!=") {
        return Ok(Requirement::NotEquals(
            validate_key(key.trim())?,
            validate_value(value.trim())?,
        ));
    }
    if let Some((key, value)) = raw.split_once("==").or_else(|| raw.split_once('=')) {
        return Ok(Requirement::Equals(
            validate_key(key.trim())?,
            validate_value(value.trim())?,
        ));
    }

    // Set-based requirements have the form `key <op> (values)`
    let mut tokens = raw.splitn(2, char::is_whitespace);
    let key = tokens.next().unwrap_or_default();
    let Some(rest) = tokens.next() else {
        return Ok(Requirement::Exists(validate_key(key)?));
    };
    let rest = rest.trim_start();
    let (negated, set) = if let Some(set) = rest.strip_prefix("notin") {
        (true, set)
    } else if let Some(set) = rest.strip_prefix("in") {
        (false, set)
    } else {
        return Err(Error::UnsupportedOperator(raw.to_string()));
    };
    let set = set
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| Error::UnterminatedSet(raw.to_string()))?;
    let values = set
        .split(',')
        .map(|v| validate_value(v.trim()))
        .collect::<Result<BTreeSet<_>, _>>()?;
    let key = validate_key(key)?;
    Ok(if negated {
        Requirement::NotIn(key, values)
    } else {
        Requirement::In(key, values)
    })
}

fn validate_key(key: &str) -> Result<String, Error> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if !valid {
        return Err(Error::InvalidKey(key.to_string()));
    }
    Ok(key.to_string())
}

fn validate_value(value: &str) -> Result<String, Error> {
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(Error::InvalidValue(value.to_string()));
    }
    Ok(value.to_string())
}
