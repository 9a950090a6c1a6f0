//! Label selectors, as evaluated by listers and the object store
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    iter::FromIterator,
    str::FromStr,
};
use thiserror::Error;

// local type aliases
type Map = BTreeMap<String, String>;
type Expressions = Vec<Expression>;

/// A selector string could not be parsed
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid label selector {selector:?}: {reason}")]
pub struct ParseSelectorError {
    /// The offending selector string
    pub selector: String,
    /// What was wrong with it
    pub reason: &'static str,
}

/// A selector expression with existing operations
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Expression {
    /// The label exists and its value is in the set
    In(String, BTreeSet<String>),
    /// The label is missing, or its value is not in the set
    NotIn(String, BTreeSet<String>),
    /// The label exists with exactly this value
    Equal(String, String),
    /// The label is missing, or has a different value
    NotEqual(String, String),
    /// The label exists
    Exists(String),
    /// The label does not exist
    DoesNotExist(String),
    /// An unrecognised requirement, never matches
    Invalid,
}

/// Perform selection on a list of expressions
///
/// All expressions must match for the selector to match. The empty selector matches everything.
#[derive(Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize)]
pub struct Selector(Expressions);

impl Selector {
    /// Create a selector from a vector of expressions
    fn from_expressions(exprs: Expressions) -> Self {
        Self(exprs)
    }

    /// Create a selector from a map of key=value label matches
    fn from_map(map: Map) -> Self {
        Self(map.into_iter().map(|(k, v)| Expression::Equal(k, v)).collect())
    }

    /// A selector that matches every label set
    pub fn everything() -> Self {
        Self::default()
    }

    /// Convert a selector to a string for the API
    pub fn to_selector_string(&self) -> String {
        let selectors: Vec<String> = self
            .0
            .iter()
            .filter(|&e| e != &Expression::Invalid)
            .map(|e| e.to_string())
            .collect();
        selectors.join(",")
    }

    /// Indicates whether this label selector matches all objects
    pub fn selects_all(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the label set satisfies every expression
    pub fn matches(&self, labels: &Map) -> bool {
        self.0.iter().all(|expr| expr.matches(labels))
    }

    /// Extend the selector with another expression
    pub fn extend(&mut self, exprs: impl IntoIterator<Item = Expression>) -> &mut Self {
        self.0.extend(exprs);
        self
    }
}

// === Expression ===

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::In(key, values) => {
                write!(f, "{key} in ({})", values.iter().cloned().collect::<Vec<_>>().join(","))
            }
            Expression::NotIn(key, values) => {
                write!(f, "{key} notin ({})", values.iter().cloned().collect::<Vec<_>>().join(","))
            }
            Expression::Equal(key, value) => write!(f, "{key}={value}"),
            Expression::NotEqual(key, value) => write!(f, "{key}!={value}"),
            Expression::Exists(key) => write!(f, "{key}"),
            Expression::DoesNotExist(key) => write!(f, "!{key}"),
            Expression::Invalid => Ok(()),
        }
    }
}

impl Expression {
    fn matches(&self, labels: &Map) -> bool {
        match self {
            Expression::In(key, values) => match labels.get(key) {
                Some(v) => values.contains(v),
                None => false,
            },
            Expression::NotIn(key, values) => match labels.get(key) {
                Some(v) => !values.contains(v),
                None => true,
            },
            Expression::Exists(key) => labels.contains_key(key),
            Expression::DoesNotExist(key) => !labels.contains_key(key),
            Expression::Equal(key, value) => labels.get(key) == Some(value),
            Expression::NotEqual(key, value) => labels.get(key) != Some(value),
            Expression::Invalid => false,
        }
    }

    fn parse(raw: &str, selector: &str) -> Result<Self, ParseSelectorError> {
        let err = |reason| ParseSelectorError {
            selector: selector.to_string(),
            reason,
        };
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(err("empty requirement"));
        }
        if let Some(key) = raw.strip_prefix('!') {
            return Ok(Expression::DoesNotExist(valid_key(key.trim()).ok_or_else(|| err("bad key"))?));
        }
        if let Some((key, value)) = raw.split_once("!=") {
            let key = valid_key(key.trim()).ok_or_else(|| err("bad key"))?;
            return Ok(Expression::NotEqual(key, value.trim().to_string()));
        }
        if let Some((key, value)) = raw.split_once("==").or_else(|| raw.split_once('=')) {
            let key = valid_key(key.trim()).ok_or_else(|| err("bad key"))?;
            return Ok(Expression::Equal(key, value.trim().to_string()));
        }
        if let Some((key, rest)) = split_set_operator(raw, " notin ") {
            let key = valid_key(key).ok_or_else(|| err("bad key"))?;
            return Ok(Expression::NotIn(key, parse_set(rest).ok_or_else(|| err("bad value set"))?));
        }
        if let Some((key, rest)) = split_set_operator(raw, " in ") {
            let key = valid_key(key).ok_or_else(|| err("bad key"))?;
            return Ok(Expression::In(key, parse_set(rest).ok_or_else(|| err("bad value set"))?));
        }
        Ok(Expression::Exists(valid_key(raw).ok_or_else(|| err("bad key"))?))
    }
}

fn valid_key(key: &str) -> Option<String> {
    (!key.is_empty() && !key.contains(char::is_whitespace)).then(|| key.to_string())
}

fn split_set_operator<'a>(raw: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    raw.split_once(op).map(|(k, rest)| (k.trim(), rest.trim()))
}

fn parse_set(raw: &str) -> Option<BTreeSet<String>> {
    let inner = raw.strip_prefix('(')?.strip_suffix(')')?;
    Some(
        inner
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from)
            .collect(),
    )
}

/// Split on commas that are not inside a `( .. )` value set
fn split_requirements(selector: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0_u32;
    let mut start = 0;
    for (i, c) in selector.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&selector[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&selector[start..]);
    parts
}

impl FromStr for Selector {
    type Err = ParseSelectorError;

    fn from_str(selector: &str) -> Result<Self, Self::Err> {
        if selector.trim().is_empty() {
            return Ok(Self::everything());
        }
        split_requirements(selector)
            .into_iter()
            .map(|raw| Expression::parse(raw, selector))
            .collect::<Result<Vec<_>, _>>()
            .map(Self::from_expressions)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_selector_string())
    }
}

// convenience conversions for Selector

impl FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter.into_iter().collect())
    }
}

impl From<Expression> for Selector {
    fn from(value: Expression) -> Self {
        Self(vec![value])
    }
}

impl From<LabelSelector> for Selector {
    fn from(value: LabelSelector) -> Self {
        let expressions = match value.match_expressions {
            Some(requirements) => requirements.into_iter().map(Into::into).collect(),
            None => vec![],
        };
        let mut equality: Selector = value
            .match_labels
            .map(|labels| labels.into_iter().collect())
            .unwrap_or_default();
        equality.0.extend(expressions);
        equality
    }
}

impl From<LabelSelectorRequirement> for Expression {
    fn from(requirement: LabelSelectorRequirement) -> Self {
        let key = requirement.key;
        let values = requirement.values.map(|values| values.into_iter().collect());
        match requirement.operator.as_str() {
            "In" => match values {
                Some(values) => Expression::In(key, values),
                None => Expression::Invalid,
            },
            "NotIn" => match values {
                Some(values) => Expression::NotIn(key, values),
                None => Expression::Invalid,
            },
            "Exists" => Expression::Exists(key),
            "DoesNotExist" => Expression::DoesNotExist(key),
            _ => Expression::Invalid,
        }
    }
}

impl From<Selector> for LabelSelector {
    fn from(value: Selector) -> Self {
        let mut equality = vec![];
        let mut expressions = vec![];
        for expr in value.0 {
            match expr {
                Expression::In(key, values) => expressions.push(LabelSelectorRequirement {
                    key,
                    operator: "In".into(),
                    values: Some(values.into_iter().collect()),
                }),
                Expression::NotIn(key, values) => expressions.push(LabelSelectorRequirement {
                    key,
                    operator: "NotIn".into(),
                    values: Some(values.into_iter().collect()),
                }),
                Expression::Equal(key, value) => equality.push((key, value)),
                Expression::NotEqual(key, value) => expressions.push(LabelSelectorRequirement {
                    key,
                    operator: "NotIn".into(),
                    values: Some(vec![value]),
                }),
                Expression::Exists(key) => expressions.push(LabelSelectorRequirement {
                    key,
                    operator: "Exists".into(),
                    values: None,
                }),
                Expression::DoesNotExist(key) => expressions.push(LabelSelectorRequirement {
                    key,
                    operator: "DoesNotExist".into(),
                    values: None,
                }),
                Expression::Invalid => (),
            }
        }

        LabelSelector {
            match_labels: (!equality.is_empty()).then_some(equality.into_iter().collect()),
            match_expressions: (!expressions.is_empty()).then_some(expressions),
        }
    }
}
