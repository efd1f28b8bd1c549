use serde::de::DeserializeOwned;

use crate::queue::{ChildOutcome, ChildRef};
use crate::{Error, Result};

/// Settled results of a parent's direct children, in declaration order and
/// keyed by queue-qualified child name (`queue:name`).
///
/// Children are addressed by key, or through [`ChildrenValues::single`] when
/// exactly one child is expected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChildrenValues {
    entries: Vec<(String, ChildOutcome)>,
}

impl ChildrenValues {
    pub(crate) fn from_refs(children: &[ChildRef]) -> Self {
        Self {
            entries: children
                .iter()
                .filter_map(|c| c.outcome.clone().map(|o| (c.key.clone(), o)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ChildOutcome)> {
        self.entries.iter().map(|(k, o)| (k.as_str(), o))
    }

    pub fn get(&self, key: &str) -> Option<&ChildOutcome> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, o)| o)
    }

    /// Return value of a completed child.
    ///
    /// Fails with `MissingChildValue` for an unknown key and `ChildFailed` for
    /// a child that failed.
    pub fn completed(&self, key: &str) -> Result<&serde_json::Value> {
        match self.get(key) {
            Some(ChildOutcome::Completed(value)) => Ok(value),
            Some(ChildOutcome::Failed(reason)) => Err(Error::ChildFailed {
                key: key.to_string(),
                reason: reason.clone(),
            }),
            None => Err(Error::MissingChildValue(key.to_string())),
        }
    }

    /// Deserialize a completed child's return value.
    pub fn decode<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        Ok(serde_json::from_value(self.completed(key)?.clone())?)
    }

    /// The only child's key and value. Fails unless there is exactly one
    /// child and it completed.
    pub fn single(&self) -> Result<(&str, &serde_json::Value)> {
        match self.entries.as_slice() {
            [(key, ChildOutcome::Completed(value))] => Ok((key.as_str(), value)),
            [(key, ChildOutcome::Failed(reason))] => Err(Error::ChildFailed {
                key: key.clone(),
                reason: reason.clone(),
            }),
            [] => Err(Error::MissingChildValue("<none>".to_string())),
            many => Err(Error::validation(format!(
                "expected exactly one child value, found {}",
                many.len()
            ))),
        }
    }

    /// `(key, reason)` of every failed child.
    pub fn failed(&self) -> Vec<(&str, &str)> {
        self.entries
            .iter()
            .filter_map(|(k, o)| match o {
                ChildOutcome::Failed(reason) => Some((k.as_str(), reason.as_str())),
                ChildOutcome::Completed(_) => None,
            })
            .collect()
    }
}
