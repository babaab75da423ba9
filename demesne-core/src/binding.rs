//! Named, typed variables visible to expressions evaluated in a VM.
//!
//! A VM owns exactly one [`Bindings`] table. It is mutated by job evaluation
//! (expressions may assign to a binding) and by explicit management requests
//! (get/set). Names are unique; setting an existing name overwrites it.
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A typed binding value.
///
/// `Empty` is the value reported for a name that has never been bound. A get
/// on an absent name is not an error; it answers `Empty`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum BindingValue {
    #[default]
    Empty,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl BindingValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, BindingValue::Empty)
    }

    /// The type tag, as carried in management packets.
    pub fn type_tag(&self) -> &'static str {
        match self {
            BindingValue::Empty => "empty",
            BindingValue::Int(_) => "int",
            BindingValue::Float(_) => "float",
            BindingValue::Bool(_) => "bool",
            BindingValue::Str(_) => "string",
        }
    }
}

/// Result packets carry the display rendering of a value, so `Int(72)`
/// travels as `"72"`.
impl fmt::Display for BindingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingValue::Empty => Ok(()),
            BindingValue::Int(value) => write!(f, "{value}"),
            BindingValue::Float(value) => write!(f, "{value}"),
            BindingValue::Bool(value) => write!(f, "{value}"),
            BindingValue::Str(value) => write!(f, "{value}"),
        }
    }
}

impl From<&str> for BindingValue {
    fn from(value: &str) -> Self {
        BindingValue::Str(value.to_string())
    }
}

impl From<i64> for BindingValue {
    fn from(value: i64) -> Self {
        BindingValue::Int(value)
    }
}

/// A name → value table with unique names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bindings(HashMap<String, BindingValue>);

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look a name up. Absent names read as [`BindingValue::Empty`].
    pub fn get(&self, name: &str) -> BindingValue {
        self.0.get(name).cloned().unwrap_or_default()
    }

    /// Overwrite or create a named value.
    pub fn set(&mut self, name: impl Into<String>, value: BindingValue) {
        self.0.insert(name.into(), value);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merge `other` into this table, overwriting on collision.
    pub fn merge(&mut self, other: Bindings) {
        self.0.extend(other.0);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BindingValue)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }
}

impl FromIterator<(String, BindingValue)> for Bindings {
    fn from_iter<I: IntoIterator<Item = (String, BindingValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
