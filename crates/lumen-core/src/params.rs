//! Project parameter lookup.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use crate::error::{Error, Result};

/// String-keyed parameter set, as read from a project file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamArray {
    values: BTreeMap<String, String>,
}

impl ParamArray {
    /// Create an empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a parameter, builder style.
    pub fn with(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert or replace a parameter.
    pub fn insert(&mut self, name: impl Into<String>, value: impl ToString) {
        self.values.insert(name.into(), value.to_string());
    }

    /// Raw string value of a parameter.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Check whether a parameter is present.
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Parse a required parameter.
    pub fn get<T>(&self, name: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self.get_str(name).ok_or_else(|| Error::InvalidParameter {
            name: name.to_string(),
            reason: "missing".to_string(),
        })?;

        raw.trim().parse().map_err(|e: T::Err| Error::InvalidParameter {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    /// Parse an optional parameter, falling back to `default` when it is absent
    /// or malformed. Malformed values are logged.
    pub fn get_optional<T>(&self, name: &str, default: T) -> T
    where
        T: FromStr,
        T::Err: Display,
    {
        if !self.contains(name) {
            return default;
        }

        match self.get(name) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("{e}, using default value");
                default
            }
        }
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over all parameters in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
