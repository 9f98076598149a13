//! Key filters that restrict which part of a client's state is synced.
//!
//! A filter is either `All` (keep the value as is) or a map of keys, each
//! with its own nested filter. The JSON form mirrors that: `true`, or an
//! object whose values are again filters.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Default)]
pub enum StateFilter {
    /// Keep everything
    #[default]
    All,
    /// Keep only these keys, filtered further
    Keys(BTreeMap<String, StateFilter>),
}

impl StateFilter {
    /// Filter that keeps each listed top-level key whole.
    pub fn keys<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        StateFilter::Keys(
            keys.into_iter()
                .map(|k| (k.into(), StateFilter::All))
                .collect(),
        )
    }

    /// Add a nested filter under `key`. Turns `All` into a key map.
    pub fn with(mut self, key: impl Into<String>, filter: StateFilter) -> Self {
        match &mut self {
            StateFilter::All => {
                let mut map = BTreeMap::new();
                map.insert(key.into(), filter);
                StateFilter::Keys(map)
            }
            StateFilter::Keys(map) => {
                map.insert(key.into(), filter);
                self
            }
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, StateFilter::All)
    }

    /// Parse the JSON form. Returns `None` for anything that is not `true` or an object of filters.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(true) => Some(StateFilter::All),
            Value::Object(map) => {
                let mut keys = BTreeMap::new();
                for (key, sub) in map {
                    keys.insert(key.clone(), StateFilter::from_json(sub)?);
                }
                Some(StateFilter::Keys(keys))
            }
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            StateFilter::All => Value::Bool(true),
            StateFilter::Keys(keys) => Value::Object(
                keys.iter()
                    .map(|(k, f)| (k.clone(), f.to_json()))
                    .collect(),
            ),
        }
    }

    /// Apply the filter, producing a new value.
    ///
    /// Listed keys missing from the input are skipped. A nested filter only
    /// descends into objects; a nested result with no keys left is dropped.
    /// A key map applied to a non-object yields `{}`.
    pub fn apply(&self, value: &Value) -> Value {
        match self {
            StateFilter::All => value.clone(),
            StateFilter::Keys(keys) => match value {
                Value::Object(obj) => Value::Object(filter_object(keys, obj)),
                _ => Value::Object(Map::new()),
            },
        }
    }
}

fn filter_object(keys: &BTreeMap<String, StateFilter>, obj: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, sub) in keys {
        let Some(value) = obj.get(key) else {
            continue;
        };
        match (sub, value) {
            (StateFilter::All, _) => {
                out.insert(key.clone(), value.clone());
            }
            (StateFilter::Keys(nested), Value::Object(inner)) => {
                let filtered = filter_object(nested, inner);
                if !filtered.is_empty() {
                    out.insert(key.clone(), Value::Object(filtered));
                }
            }
            _ => {}
        }
    }
    out
}
