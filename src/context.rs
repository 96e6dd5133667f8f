//! Evaluation contexts.
//!
//! A [`Context`] is the immutable set of named variables under which a node
//! is evaluated, for example the current frame. Contexts are layered: deriving
//! a child with [`Context::with`] never touches the parent, and two contexts
//! holding the same effective variables are equivalent no matter how they were
//! built, which is what [`Context::hash`] captures.
//!
//! Besides explicit passing, a context can be made *current* for the running
//! thread with [`Context::scope`]. Scopes nest like a stack, the innermost one
//! wins.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::{ArcStr, Blake3Hasher, Hash32};

/// Name of the variable holding the current frame.
pub const FRAME: &str = "frame";

/// A single context variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(value) => Some(*value as f64),
            Value::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Bool(value) => {
                state.write_u8(0);
                value.hash(state);
            }
            Value::Int(value) => {
                state.write_u8(1);
                value.hash(state);
            }
            Value::Float(value) => {
                state.write_u8(2);
                value.to_bits().hash(state);
            }
            Value::String(value) => {
                state.write_u8(3);
                value.hash(state);
            }
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(value) => write!(f, "{value}"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value}"),
            Value::String(value) => f.write_str(value),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

struct Layer {
    // effective variables, parents already folded in
    vars: BTreeMap<ArcStr, Value>,
    hash: Hash32,
}

/// Immutable, hashable, layered map of evaluation variables.
///
/// Cloning is cheap, the layers are shared. Each layer stores the effective
/// variables, so deriving a child costs the same however deep the parent is.
#[derive(Clone)]
pub struct Context {
    layer: Arc<Layer>,
}

impl Context {
    pub fn new() -> Self {
        Self::from_vars(BTreeMap::new())
    }

    fn from_vars(vars: BTreeMap<ArcStr, Value>) -> Self {
        let mut hasher = Blake3Hasher::default();
        for (key, value) in &vars {
            key.hash(&mut hasher);
            value.hash(&mut hasher);
        }

        Self {
            layer: Arc::new(Layer {
                vars,
                hash: hasher.into(),
            }),
        }
    }

    /// Derives a child context with one variable set or overridden.
    pub fn with(&self, key: impl AsRef<str>, value: impl Into<Value>) -> Context {
        let mut vars = self.layer.vars.clone();
        vars.insert(ArcStr::from(key.as_ref()), value.into());
        Self::from_vars(vars)
    }

    /// Derives a child context with the frame set.
    pub fn with_frame(&self, frame: f64) -> Context {
        self.with(FRAME, frame)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.layer.vars.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.layer.vars.contains_key(key)
    }

    /// The current frame, `1.0` when the context doesn't define one.
    pub fn frame(&self) -> f64 {
        self.get(FRAME).and_then(Value::as_f64).unwrap_or(1.0)
    }

    /// Content hash over the effective variables.
    pub fn hash(&self) -> Hash32 {
        self.layer.hash
    }

    /// All effective variables, parents overridden by children.
    pub fn entries(&self) -> &BTreeMap<ArcStr, Value> {
        &self.layer.vars
    }

    /// Expands variable references in `text`.
    ///
    /// * `${name}` and `$name` are replaced with the variable, or nothing if
    ///   it isn't set.
    /// * A run of `#` is replaced with the frame, rounded and zero-padded to
    ///   the length of the run.
    /// * `\` escapes the next character.
    pub fn substitute(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                }
                '#' => {
                    let mut width = 1;
                    while chars.next_if_eq(&'#').is_some() {
                        width += 1;
                    }
                    let frame = self.frame().round() as i64;
                    out.push_str(&format!("{frame:0width$}"));
                }
                '$' => {
                    let mut name = String::new();
                    if chars.next_if_eq(&'{').is_some() {
                        for c in chars.by_ref() {
                            if c == '}' {
                                break;
                            }
                            name.push(c);
                        }
                    } else {
                        while let Some(c) = chars.next_if(|c| c.is_alphanumeric() || *c == '_' || *c == ':') {
                            name.push(c);
                        }
                    }

                    if name.is_empty() {
                        out.push('$');
                    } else if let Some(value) = self.get(&name) {
                        out.push_str(&value.to_string());
                    }
                }
                c => out.push(c),
            }
        }

        out
    }

    /// Makes this context current for the running thread until the returned
    /// guard is dropped.
    pub fn scope(&self) -> Scope {
        CURRENT.with(|stack| stack.borrow_mut().push(self.clone()));
        Scope {
            _marker: PhantomData,
        }
    }

    /// The innermost context made current with [`Context::scope`], or an
    /// empty one.
    pub fn current() -> Context {
        CURRENT
            .with(|stack| stack.borrow().last().cloned())
            .unwrap_or_default()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Contexts compare by content.
impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for Context {}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.entries()).finish()
    }
}

thread_local! {
    static CURRENT: RefCell<Vec<Context>> = const { RefCell::new(Vec::new()) };
}

/// Guard returned by [`Context::scope`].
#[must_use = "the context stops being current when the scope is dropped"]
pub struct Scope {
    // pinned to the thread whose stack it pushed onto
    _marker: PhantomData<Rc<()>>,
}

impl Drop for Scope {
    fn drop(&mut self) {
        CURRENT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}
