use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::context::Value;

/// A named configuration slot: either a plain value or a nested compound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Plug {
    Value(Value),
    Compound(Plugs),
}

/// A tree of named configuration slots attached to a node.
///
/// Dispatchers install their per-node settings here through
/// [`Dispatcher::setup_plugs`](crate::Dispatcher::setup_plugs). Because slots
/// may already exist when a node is restored from saved state, the `ensure*`
/// methods never overwrite what is there.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Plugs {
    slots: BTreeMap<String, Plug>,
}

impl Plugs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Plug> {
        self.slots.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        match self.slots.get(name)? {
            Plug::Value(value) => Some(value),
            Plug::Compound(_) => None,
        }
    }

    pub fn compound(&self, name: &str) -> Option<&Plugs> {
        match self.slots.get(name)? {
            Plug::Compound(plugs) => Some(plugs),
            Plug::Value(_) => None,
        }
    }

    /// Follows a dot separated path of compounds down to a value, e.g.
    /// `"dispatcher.local.batchSize"`.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut plugs = self;
        let mut parts = path.split('.').peekable();

        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                return plugs.value(part);
            }
            plugs = plugs.compound(part)?;
        }

        None
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.slots.insert(name.into(), Plug::Value(value.into()));
        self
    }

    /// Inserts `default` unless a slot with this name already exists.
    pub fn ensure(&mut self, name: impl Into<String>, default: impl Into<Value>) -> &mut Self {
        self.slots
            .entry(name.into())
            .or_insert_with(|| Plug::Value(default.into()));
        self
    }

    /// Returns the compound with this name, creating it if missing. A value
    /// slot of the same name is replaced.
    pub fn ensure_compound(&mut self, name: impl Into<String>) -> &mut Plugs {
        let slot = self
            .slots
            .entry(name.into())
            .or_insert_with(|| Plug::Compound(Plugs::default()));

        loop {
            match slot {
                Plug::Compound(plugs) => return plugs,
                Plug::Value(_) => *slot = Plug::Compound(Plugs::default()),
            }
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
