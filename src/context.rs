//! Shared workflow state with deep-merge writes.
//!
//! A [`Context`] is a JSON object that every step of a run can read and
//! extend. Writes merge recursively: setting `{"balena": {"uuid": X}}` keeps a
//! previously written `{"balena": {"application": Y}}`. Arrays and scalars are
//! replaced wholesale.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Errors raised by typed context reads.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// Nothing is stored at the requested path.
    #[error("context has no value at '{path}'")]
    Missing {
        /// Dotted path that was looked up.
        path: String,
    },

    /// A value exists but does not deserialize into the requested type.
    #[error("context value at '{path}' has the wrong shape: {reason}")]
    Type {
        /// Dotted path that was looked up.
        path: String,
        /// Deserializer message.
        reason: String,
    },
}

/// Key-value state shared by the steps of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    state: Map<String, Value>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `partial` into the current state.
    ///
    /// Objects are merged key by key at every depth; any other value replaces
    /// what was there. A non-object `partial` has no keys to merge and is
    /// ignored.
    pub fn set(&mut self, partial: Value) {
        match partial {
            Value::Object(partial) => merge_into(&mut self.state, partial),
            other => tracing::warn!(value = %other, "ignoring non-object context write"),
        }
    }

    /// Merge a single value at a dotted path, creating intermediate objects.
    pub fn set_at(&mut self, path: &str, value: impl Into<Value>) {
        let mut nested = value.into();
        for segment in path.rsplit('.') {
            let mut wrapper = Map::new();
            wrapper.insert(segment.to_owned(), nested);
            nested = Value::Object(wrapper);
        }
        self.set(nested);
    }

    /// The full current state.
    pub fn get(&self) -> &Map<String, Value> {
        &self.state
    }

    /// A detached copy of the current state.
    pub fn snapshot(&self) -> Value {
        Value::Object(self.state.clone())
    }

    /// Look up a value by dotted path (`"balena.uuid"`).
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.state.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Read and deserialize the value at `path`.
    pub fn require<T: DeserializeOwned>(&self, path: &str) -> Result<T, ContextError> {
        let value = self.lookup(path).ok_or_else(|| ContextError::Missing {
            path: path.to_owned(),
        })?;
        T::deserialize(value).map_err(|e| ContextError::Type {
            path: path.to_owned(),
            reason: e.to_string(),
        })
    }

    /// Returns `true` if nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
}

fn merge_into(target: &mut Map<String, Value>, partial: Map<String, Value>) {
    for (key, incoming) in partial {
        match incoming {
            Value::Object(incoming) => {
                if let Some(Value::Object(existing)) = target.get_mut(&key) {
                    merge_into(existing, incoming);
                    continue;
                }
                target.insert(key, Value::Object(incoming));
            }
            other => {
                target.insert(key, other);
            }
        }
    }
}
