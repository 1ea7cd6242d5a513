//! Deferred resource values.
//!
//! An `Output<T>` is a pure description of how to compute a `T` from the
//! attributes recorded for other resources during a run. It carries the set of
//! URNs it reads from; those sets are the edges of the resource graph. Nothing
//! is evaluated until the engine calls [`Output::resolve`] against a
//! [`Resolution`], and evaluation never mutates shared state.

use super::error::{InfraError, Result};
use super::types::{Properties, Urn};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

type Eval<T> = dyn Fn(&Resolution) -> Result<T> + Send + Sync;

/// Write-once attribute store for one run.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    attributes: IndexMap<Urn, Properties>,
}

impl Resolution {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the attributes of a resource. A resource is recorded at most once.
    pub fn record(&mut self, urn: &Urn, attributes: Properties) -> Result<()> {
        if self.attributes.contains_key(urn) {
            return Err(InfraError::State(format!(
                "attributes of '{}' already recorded in this run",
                urn
            )));
        }
        self.attributes.insert(urn.clone(), attributes);
        Ok(())
    }

    pub fn contains(&self, urn: &Urn) -> bool {
        self.attributes.contains_key(urn)
    }

    pub fn attributes(&self, urn: &Urn) -> Option<&Properties> {
        self.attributes.get(urn)
    }

    /// Look up one attribute, or report it as not yet known.
    pub fn get(&self, urn: &Urn, key: &str) -> Result<&serde_json::Value> {
        self.attributes
            .get(urn)
            .and_then(|attrs| attrs.get(key))
            .ok_or_else(|| InfraError::Unresolved {
                urn: urn.clone(),
                key: key.to_string(),
            })
    }
}

/// A value known now or after the resources it depends on are recorded.
pub struct Output<T> {
    deps: BTreeSet<Urn>,
    eval: Arc<Eval<T>>,
}

impl<T> Clone for Output<T> {
    fn clone(&self) -> Self {
        Self {
            deps: self.deps.clone(),
            eval: Arc::clone(&self.eval),
        }
    }
}

impl<T> fmt::Debug for Output<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output")
            .field("deps", &self.deps)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> Output<T> {
    /// A value with no dependencies.
    pub fn known(value: T) -> Self {
        Self {
            deps: BTreeSet::new(),
            eval: Arc::new(move |_| Ok(value.clone())),
        }
    }

    /// Derive a new value. `f` must be pure.
    pub fn map<U, F>(&self, f: F) -> Output<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let inner = Arc::clone(&self.eval);
        Output {
            deps: self.deps.clone(),
            eval: Arc::new(move |r| inner(r).map(&f)),
        }
    }

    /// Derive a new value with a transform that can fail.
    pub fn try_map<U, F>(&self, f: F) -> Output<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(T) -> Result<U> + Send + Sync + 'static,
    {
        let inner = Arc::clone(&self.eval);
        Output {
            deps: self.deps.clone(),
            eval: Arc::new(move |r| inner(r).and_then(&f)),
        }
    }

    /// Combine two values; the result depends on both.
    pub fn zip<U>(&self, other: &Output<U>) -> Output<(T, U)>
    where
        U: Clone + Send + Sync + 'static,
    {
        let left = Arc::clone(&self.eval);
        let right = Arc::clone(&other.eval);
        Output {
            deps: self.deps.union(&other.deps).cloned().collect(),
            eval: Arc::new(move |r| Ok((left(r)?, right(r)?))),
        }
    }

    /// Collect many values into one, preserving order.
    pub fn all(items: Vec<Output<T>>) -> Output<Vec<T>> {
        let deps = items
            .iter()
            .flat_map(|o| o.deps.iter().cloned())
            .collect();
        let evals: Vec<Arc<Eval<T>>> = items.into_iter().map(|o| o.eval).collect();
        Output {
            deps,
            eval: Arc::new(move |r| evals.iter().map(|e| e(r)).collect()),
        }
    }

    /// Compute the value against recorded attributes.
    pub fn resolve(&self, resolution: &Resolution) -> Result<T> {
        (self.eval)(resolution)
    }

    /// URNs this value reads from.
    pub fn dependencies(&self) -> &BTreeSet<Urn> {
        &self.deps
    }

    /// True when the value is available without any resource being recorded.
    pub fn is_known(&self) -> bool {
        self.deps.is_empty()
    }
}

impl<T: DeserializeOwned + Clone + Send + Sync + 'static> Output<T> {
    /// An attribute the provider reports for `urn` once it is created.
    pub fn attribute(urn: &Urn, key: &str) -> Self {
        let owner = urn.clone();
        let key = key.to_string();
        Self {
            deps: BTreeSet::from([urn.clone()]),
            eval: Arc::new(move |r| {
                let value = r.get(&owner, &key)?;
                serde_json::from_value(value.clone()).map_err(|e| InfraError::AttributeType {
                    urn: owner.clone(),
                    key: key.clone(),
                    reason: e.to_string(),
                })
            }),
        }
    }
}

impl Output<serde_json::Value> {
    /// Assemble a JSON object from deferred fields, in the given order.
    pub fn object(fields: Vec<(&str, Output<serde_json::Value>)>) -> Self {
        let keys: Vec<String> = fields.iter().map(|(k, _)| k.to_string()).collect();
        let values = Output::all(fields.into_iter().map(|(_, v)| v).collect());
        values.map(move |values| {
            let map = keys.iter().cloned().zip(values).collect();
            serde_json::Value::Object(map)
        })
    }

    /// Assemble a JSON array from deferred items.
    pub fn array(items: Vec<Output<serde_json::Value>>) -> Self {
        Output::all(items).map(serde_json::Value::Array)
    }
}

// ============================================================================
// Conversions into resource inputs
// ============================================================================

/// Anything that can be passed as a resource input.
pub trait IntoInput {
    fn into_input(self) -> Output<serde_json::Value>;
}

impl IntoInput for Output<serde_json::Value> {
    fn into_input(self) -> Output<serde_json::Value> {
        self
    }
}

impl IntoInput for &Output<serde_json::Value> {
    fn into_input(self) -> Output<serde_json::Value> {
        self.clone()
    }
}

impl IntoInput for Output<String> {
    fn into_input(self) -> Output<serde_json::Value> {
        self.map(serde_json::Value::String)
    }
}

impl IntoInput for &Output<String> {
    fn into_input(self) -> Output<serde_json::Value> {
        self.clone().into_input()
    }
}

impl IntoInput for Vec<Output<String>> {
    fn into_input(self) -> Output<serde_json::Value> {
        Output::all(self).map(|items| {
            serde_json::Value::Array(items.into_iter().map(serde_json::Value::String).collect())
        })
    }
}

impl IntoInput for &[Output<String>] {
    fn into_input(self) -> Output<serde_json::Value> {
        self.to_vec().into_input()
    }
}

impl IntoInput for serde_json::Value {
    fn into_input(self) -> Output<serde_json::Value> {
        Output::known(self)
    }
}

impl IntoInput for &str {
    fn into_input(self) -> Output<serde_json::Value> {
        Output::known(serde_json::Value::String(self.to_string()))
    }
}

impl IntoInput for String {
    fn into_input(self) -> Output<serde_json::Value> {
        Output::known(serde_json::Value::String(self))
    }
}

impl IntoInput for bool {
    fn into_input(self) -> Output<serde_json::Value> {
        Output::known(serde_json::Value::Bool(self))
    }
}

impl IntoInput for u16 {
    fn into_input(self) -> Output<serde_json::Value> {
        Output::known(serde_json::Value::from(self))
    }
}

impl IntoInput for u32 {
    fn into_input(self) -> Output<serde_json::Value> {
        Output::known(serde_json::Value::from(self))
    }
}
