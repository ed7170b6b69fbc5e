//! Named, re-runnable filters owned by one visual. Triggering a filter runs its
//! predicate over an input and keeps the result for later reads.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, EnumString};
use tracing::debug;

use crate::dataframe::DataError;
use crate::error::{DataviserError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FilterKind {
    /// Keep the items of an array.
    Array,
    /// Keep the entries of an object whose key passes.
    Keys,
    /// Keep the entries of an object whose value passes.
    Values,
}

/// `(candidate, args) -> keep?`
pub type Predicate = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

#[derive(Clone)]
struct Filter {
    kind: FilterKind,
    args: Value,
    callback: Predicate,
    cached: Option<Value>,
}

#[derive(Default)]
pub struct FilterRegistry {
    filters: DashMap<String, Filter>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the filter called `name`.
    pub fn register<F>(&self, name: impl Into<String>, kind: FilterKind, args: Value, callback: F)
    where
        F: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(filter = %name, kind = kind.as_ref(), "filter registered");
        self.filters.insert(
            name,
            Filter {
                kind,
                args,
                callback: Arc::new(callback),
                cached: None,
            },
        );
    }

    /// Merge `args` into the filter's arguments. Objects merge key by key; anything
    /// else replaces the arguments.
    pub fn update(&self, name: &str, args: Value) -> Result<()> {
        let mut filter = self
            .filters
            .get_mut(name)
            .ok_or_else(|| DataviserError::UnknownFilter(name.to_string()))?;
        match (&mut filter.args, args) {
            (Value::Object(current), Value::Object(patch)) => current.extend(patch),
            (current, args) => *current = args,
        }
        Ok(())
    }

    pub fn remove(&self, name: &str) -> bool {
        self.filters.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }

    pub fn args(&self, name: &str) -> Option<Value> {
        self.filters.get(name).map(|f| f.args.clone())
    }

    /// Run the filter over `input`, cache and return the result.
    pub fn trigger(&self, name: &str, input: &Value) -> Result<Value> {
        // run the predicate without holding the map shard
        let filter = self
            .filters
            .get(name)
            .map(|f| f.clone())
            .ok_or_else(|| DataviserError::UnknownFilter(name.to_string()))?;
        let result = apply(&filter, input)?;
        if let Some(mut entry) = self.filters.get_mut(name) {
            entry.cached = Some(result.clone());
        }
        Ok(result)
    }

    /// Result of the last `trigger`.
    pub fn cached(&self, name: &str) -> Option<Value> {
        self.filters.get(name).and_then(|f| f.cached.clone())
    }
}

fn apply(filter: &Filter, input: &Value) -> Result<Value> {
    let keep = |candidate: &Value| (filter.callback)(candidate, &filter.args);
    let out = match (filter.kind, input) {
        (FilterKind::Array, Value::Array(items)) => {
            Value::Array(items.iter().filter(|item| keep(item)).cloned().collect())
        }
        (FilterKind::Keys, Value::Object(entries)) => Value::Object(
            entries
                .iter()
                .filter(|(key, _)| keep(&Value::String((*key).clone())))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Map<_, _>>(),
        ),
        (FilterKind::Values, Value::Object(entries)) => Value::Object(
            entries
                .iter()
                .filter(|(_, value)| keep(value))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Map<_, _>>(),
        ),
        (kind, other) => {
            return Err(DataError::Malformed(format!(
                "{} filter cannot run over {}",
                kind.as_ref(),
                type_name(other)
            ))
            .into());
        }
    };
    Ok(out)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
