// Configuration Models
// Raw build configuration, combinator axes and fully resolved matrix cells

use serde_yaml::{Mapping, Value};

/// Key holding the `exclude`/`include` adjustments
pub const MATRIX_KEY: &str = "matrix";

/// Script sections, in the order they run for every cell
pub const SECTIONS: [&str; 5] = [
    "before_install",
    "install",
    "before_script",
    "script",
    "after_script",
];

/// Top-level keys that are acted upon; everything else is reported as ignored
pub const UNDERSTOOD_KEYS: [&str; 10] = [
    "rvm",
    "gemfile",
    "env",
    MATRIX_KEY,
    "script",
    "bundler_args",
    "before_install",
    "install",
    "before_script",
    "after_script",
];

/// A configuration field whose list value expands the matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    /// Dependency manifest path
    Gemfile,
    /// Runtime version
    Rvm,
    /// Environment assignment string
    Env,
}

impl Axis {
    /// Expansion order; later axes vary fastest
    pub const ALL: [Axis; 3] = [Axis::Gemfile, Axis::Rvm, Axis::Env];

    pub fn key(self) -> &'static str {
        match self {
            Axis::Gemfile => "gemfile",
            Axis::Rvm => "rvm",
            Axis::Env => "env",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|axis| axis.key() == key)
    }

    pub fn is_combinator(key: &str) -> bool {
        Self::from_key(key).is_some()
    }
}

/// Render a scalar YAML value the way it was meant, so `rvm: 2.0` reads as "2.0"
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Human readable rendering of any value, used for summaries
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Sequence(items) => {
            let items: Vec<String> = items.iter().map(display_value).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Mapping(map) => {
            let pairs: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", display_value(k), display_value(v)))
                .collect();
            format!("{{{}}}", pairs.join(", "))
        }
        Value::Tagged(tagged) => display_value(&tagged.value),
        other => scalar_to_string(other).unwrap_or_default(),
    }
}

/// Flatten a scalar-or-list value into its string entries
pub fn value_to_list(value: &Value) -> Vec<String> {
    match value {
        Value::Sequence(items) => items.iter().filter_map(scalar_to_string).collect(),
        other => scalar_to_string(other).into_iter().collect(),
    }
}

fn string_keyed(mapping: Mapping) -> Mapping {
    mapping
        .into_iter()
        .filter_map(|(key, value)| match key {
            Value::String(_) => Some((key, value)),
            other => scalar_to_string(&other).map(|k| (Value::String(k), value)),
        })
        .collect()
}

/// Configuration as authored, keyed by top-level field name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawConfig {
    entries: Mapping,
}

impl RawConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a parsed YAML mapping; non-string scalar keys are stringified
    pub fn from_mapping(mapping: Mapping) -> Self {
        Self {
            entries: string_keyed(mapping),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries
            .insert(Value::String(key.into()), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries
            .iter()
            .filter_map(|(k, v)| k.as_str().map(|k| (k, v)))
    }

    /// Top-level keys outside the understood set, sorted
    pub fn ignored_keys(&self) -> Vec<String> {
        let mut ignored: Vec<String> = self
            .iter()
            .map(|(key, _)| key)
            .filter(|key| !UNDERSTOOD_KEYS.contains(key))
            .map(str::to_string)
            .collect();
        ignored.sort();
        ignored
    }

    /// Remove ignored keys, returning the remaining config and what was dropped
    pub fn split_ignored(mut self) -> (Self, Vec<String>) {
        let ignored = self.ignored_keys();
        for key in &ignored {
            self.remove(key);
        }
        (self, ignored)
    }

    /// Non-combinator, non-`matrix` keys; merged underneath every cell
    pub fn base(&self) -> Cell {
        self.iter()
            .filter(|(key, _)| *key != MATRIX_KEY && !Axis::is_combinator(key))
            .map(|(key, value)| (key, value.clone()))
            .collect()
    }

    /// Partial cells listed under `matrix.<name>`
    pub fn matrix_specs(&self, name: &str) -> Vec<Cell> {
        let Some(Value::Sequence(specs)) = self.get(MATRIX_KEY).and_then(|m| m.get(name)) else {
            return Vec::new();
        };
        specs.iter().filter_map(Cell::from_value).collect()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for RawConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut config = Self::new();
        for (key, value) in iter {
            config.insert(key, value);
        }
        config
    }
}

/// One fully resolved build leg
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cell {
    entries: Mapping,
}

impl Cell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a cell from a YAML mapping value; anything else is not a cell
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Mapping(map) => Some(Self {
                entries: string_keyed(map.clone()),
            }),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Scalar value of `key` as a string
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(scalar_to_string)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries
            .insert(Value::String(key.into()), value.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries
            .iter()
            .filter_map(|(k, v)| k.as_str().map(|k| (k, v)))
    }

    /// Copy of `self` with `base` merged underneath; own values win
    pub fn merged_over(&self, base: &Cell) -> Cell {
        let mut merged = base.clone();
        for (key, value) in self.iter() {
            merged.insert(key, value.clone());
        }
        merged
    }

    /// Partial match: every key of `spec` is present here with an equal value
    pub fn matches(&self, spec: &Cell) -> bool {
        spec.iter()
            .all(|(key, value)| self.get(key).is_some_and(|own| own == value))
    }

    pub fn rvm(&self) -> Option<String> {
        self.get_str(Axis::Rvm.key())
    }

    pub fn gemfile(&self) -> Option<String> {
        self.get_str(Axis::Gemfile.key())
    }

    pub fn env(&self) -> Option<String> {
        self.get_str(Axis::Env.key())
    }

    pub fn bundler_args(&self) -> Option<String> {
        self.get_str("bundler_args")
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Cell {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut cell = Self::new();
        for (key, value) in iter {
            cell.insert(key, value);
        }
        cell
    }
}
