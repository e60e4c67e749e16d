//! NIP-01 subscription filters and the matcher.
//!
//! A filter is a conjunction over its populated fields; a filter list is a
//! disjunction over its filters. `ids` and `authors` match by prefix so that
//! clients can look events up by a short id.

use std::collections::HashMap;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::event::Event;

/// Declarative predicate over event attributes. Empty fields impose no
/// constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    /// Event id prefixes.
    pub ids: Vec<String>,
    /// Author pubkey prefixes.
    pub authors: Vec<String>,
    /// Accepted kinds.
    pub kinds: Vec<u32>,
    /// Lower bound on `created_at` (inclusive).
    pub since: Option<u64>,
    /// Upper bound on `created_at` (inclusive).
    pub until: Option<u64>,
    /// Cap on replayed matches; ignored for live events.
    pub limit: Option<usize>,
    /// Tag name (without `#`) to accepted first values.
    pub tags: HashMap<String, Vec<String>>,
}

/// A filter object whose fields have the wrong JSON types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("filter must be a JSON object")]
    NotAnObject,
    #[error("filter field `{0}` must be an array of strings")]
    Strings(String),
    #[error("filter field `{0}` must be an array of non-negative integers")]
    Integers(String),
    #[error("filter field `{0}` must be a non-negative integer")]
    Integer(String),
}

impl Filter {
    /// Build a `Filter` from a NIP-01 filter JSON object.
    ///
    /// Unknown keys are ignored; known keys with the wrong type are errors.
    pub fn from_value(val: &Value) -> Result<Self, FilterError> {
        let obj = val.as_object().ok_or(FilterError::NotAnObject)?;
        let mut filter = Filter {
            ids: strings(obj, "ids")?,
            authors: strings(obj, "authors")?,
            kinds: integers(obj, "kinds")?
                .into_iter()
                .map(|k| u32::try_from(k).map_err(|_| FilterError::Integers("kinds".into())))
                .collect::<Result<_, _>>()?,
            since: integer(obj, "since")?,
            until: integer(obj, "until")?,
            limit: integer(obj, "limit")?.map(|l| usize::try_from(l).unwrap_or(usize::MAX)),
            tags: HashMap::new(),
        };
        for key in obj.keys() {
            if let Some(name) = key.strip_prefix('#') {
                filter.tags.insert(name.to_string(), strings(obj, key)?);
            }
        }
        Ok(filter)
    }

    /// Check whether `event` satisfies every populated field of this filter.
    pub fn matches(&self, event: &Event) -> bool {
        // ids and authors are prefix matches; an empty prefix matches nothing
        if !self.ids.is_empty() && !self.ids.iter().any(|p| has_prefix(&event.id, p)) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.iter().any(|p| has_prefix(&event.pubkey, p))
        {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        self.tags
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .all(|(name, values)| {
                event.tags.iter().any(|tag| {
                    tag.name() == Some(name.as_str())
                        && tag.value().is_some_and(|v| values.iter().any(|want| want == v))
                })
            })
    }
}

/// True when `event` matches at least one of `filters`.
pub fn matches(event: &Event, filters: &[Filter]) -> bool {
    filters.iter().any(|f| f.matches(event))
}

fn has_prefix(value: &str, prefix: &str) -> bool {
    !prefix.is_empty() && value.starts_with(prefix)
}

fn strings(obj: &Map<String, Value>, key: &str) -> Result<Vec<String>, FilterError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(arr)) => arr
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| FilterError::Strings(key.into()))
            })
            .collect(),
        Some(_) => Err(FilterError::Strings(key.into())),
    }
}

fn integers(obj: &Map<String, Value>, key: &str) -> Result<Vec<u64>, FilterError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(arr)) => arr
            .iter()
            .map(|v| v.as_u64().ok_or_else(|| FilterError::Integers(key.into())))
            .collect(),
        Some(_) => Err(FilterError::Integers(key.into())),
    }
}

fn integer(obj: &Map<String, Value>, key: &str) -> Result<Option<u64>, FilterError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| FilterError::Integer(key.into())),
    }
}

/// Builders for constructing filters in code.
#[cfg(test)]
impl Filter {
    /// Create an empty filter (matches every event).
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.authors = authors.into_iter().map(Into::into).collect();
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    pub fn since(mut self, ts: u64) -> Self {
        self.since = Some(ts);
        self
    }

    pub fn until(mut self, ts: u64) -> Self {
        self.until = Some(ts);
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Add a tag constraint. A leading `#` on `name` is stripped.
    pub fn tag(mut self, name: &str, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let key = name.strip_prefix('#').unwrap_or(name).to_string();
        self.tags
            .insert(key, values.into_iter().map(Into::into).collect());
        self
    }
}
