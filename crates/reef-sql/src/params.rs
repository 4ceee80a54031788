//! Named bound parameters.
//!
//! Values travel to `SQLite` as bound parameters and are never spliced into
//! SQL text.

use std::collections::BTreeMap;

pub use rusqlite::types::Value;

/// Conversion into a bindable [`Value`].
pub trait IntoValue {
    /// Convert `self`.
    fn into_value(self) -> Value;
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::Text(self.to_string())
    }
}

impl IntoValue for String {
    fn into_value(self) -> Value {
        Value::Text(self)
    }
}

impl IntoValue for &String {
    fn into_value(self) -> Value {
        Value::Text(self.clone())
    }
}

impl IntoValue for i64 {
    fn into_value(self) -> Value {
        Value::Integer(self)
    }
}

impl IntoValue for i32 {
    fn into_value(self) -> Value {
        Value::Integer(i64::from(self))
    }
}

impl IntoValue for f64 {
    fn into_value(self) -> Value {
        Value::Real(self)
    }
}

impl IntoValue for bool {
    fn into_value(self) -> Value {
        Value::Integer(i64::from(self))
    }
}

impl IntoValue for Vec<u8> {
    fn into_value(self) -> Value {
        Value::Blob(self)
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Value {
        self.map_or(Value::Null, IntoValue::into_value)
    }
}

/// One set of named parameters, keyed without the leading `:`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParamMap(BTreeMap<String, Value>);

impl ParamMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl IntoValue) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert or replace a value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl IntoValue) {
        let _ = self.0.insert(name.into(), value.into_value());
    }

    /// Look up a value by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy every entry of `other` over `self`.
    pub fn extend(&mut self, other: &ParamMap) {
        for (k, v) in &other.0 {
            let _ = self.0.insert(k.clone(), v.clone());
        }
    }
}

impl<K: Into<String>, V: IntoValue> FromIterator<(K, V)> for ParamMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// Parameters for one execution: none, one set, or many (executemany).
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Params {
    /// No parameters.
    #[default]
    None,
    /// One parameter set.
    One(ParamMap),
    /// One execution per set.
    Many(Vec<ParamMap>),
}

impl Params {
    /// Parameter sets to execute, at least one (possibly empty).
    pub(crate) fn into_sets(self) -> Vec<ParamMap> {
        match self {
            Self::None => vec![ParamMap::new()],
            Self::One(map) => vec![map],
            Self::Many(maps) => maps,
        }
    }

    /// First parameter set, if any.
    pub(crate) fn first(&self) -> Option<&ParamMap> {
        match self {
            Self::None => None,
            Self::One(map) => Some(map),
            Self::Many(maps) => maps.first(),
        }
    }
}

impl From<()> for Params {
    fn from((): ()) -> Self {
        Self::None
    }
}

impl From<ParamMap> for Params {
    fn from(map: ParamMap) -> Self {
        Self::One(map)
    }
}

impl From<Vec<ParamMap>> for Params {
    fn from(maps: Vec<ParamMap>) -> Self {
        Self::Many(maps)
    }
}

/// Build a [`ParamMap`]: `bind! { "x" => 1, "y" => "two" }`.
#[macro_export]
macro_rules! bind {
    () => { $crate::params::ParamMap::new() };
    ($($name:expr => $value:expr),+ $(,)?) => {
        $crate::params::ParamMap::new()$(.with($name, $value))+
    };
}
