//! Parameter maps and deferred parameter sources.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::BindError;

/// Named statement parameters, keyed by placeholder name without the colon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, Value>);

impl Params {
    /// Create an empty parameter map.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert or replace a parameter, returning the previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(name.into(), value.into())
    }

    /// Get a parameter by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Check if a parameter is present.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over parameters in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl<K, V> FromIterator<(K, V)> for Params
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl TryFrom<Value> for Params {
    type Error = BindError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(map.into_iter().collect()),
            Value::Null => Err(BindError::NotAnObject { found: "null" }),
            Value::Bool(_) => Err(BindError::NotAnObject { found: "a boolean" }),
            Value::Number(_) => Err(BindError::NotAnObject { found: "a number" }),
            Value::String(_) => Err(BindError::NotAnObject { found: "a string" }),
            Value::Array(_) => Err(BindError::NotAnObject { found: "an array" }),
        }
    }
}

/// Producer evaluated each time a task resolves its parameters.
pub type ParamFn = Arc<dyn Fn() -> Params + Send + Sync>;

/// Where a task gets its parameters from.
///
/// `Deferred` producers run at execution time, not at registration, so they
/// can read values that earlier tasks in the same unit of work produced.
#[derive(Clone)]
pub enum ParamSource {
    Static(Params),
    Deferred(ParamFn),
}

impl ParamSource {
    /// Wrap a producer function.
    pub fn deferred<F>(producer: F) -> Self
    where
        F: Fn() -> Params + Send + Sync + 'static,
    {
        ParamSource::Deferred(Arc::new(producer))
    }

    /// Produce the concrete parameters.
    pub fn resolve(&self) -> Params {
        match self {
            ParamSource::Static(params) => params.clone(),
            ParamSource::Deferred(producer) => producer(),
        }
    }

    /// Check if this source is evaluated lazily.
    pub fn is_deferred(&self) -> bool {
        matches!(self, ParamSource::Deferred(_))
    }
}

impl From<Params> for ParamSource {
    fn from(params: Params) -> Self {
        ParamSource::Static(params)
    }
}

impl fmt::Debug for ParamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamSource::Static(params) => f.debug_tuple("Static").field(params).finish(),
            ParamSource::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}
