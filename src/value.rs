use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map, Number};

use crate::context::{ContextId, Liveness};
use crate::error::{Error, ErrorKind, Result};

/// Largest integer a double represents exactly (`Number.MAX_SAFE_INTEGER`).
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

pub fn is_safe_integer(i: i64) -> bool {
    (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&i)
}

/// A host-side value.
///
/// Everything but `Function` is plain owned data and outlives the context it came from.
/// Objects keep the engine's property order; equality ignores it.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
    Function(FunctionHandle),
    Error(ScriptException),
}

/// An engine error object, thrown or returned.
#[derive(Clone, Debug, PartialEq)]
pub struct ScriptException {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl ScriptException {
    pub fn new<N: Into<String>, M: Into<String>>(name: N, message: M) -> Self {
        ScriptException {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }
}

impl fmt::Display for ScriptException {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// A reference to a function living in an engine context.
///
/// Only valid while that context is alive, and only in that context. Both are checked when the
/// handle is used, not when it is dropped.
#[derive(Clone)]
pub struct FunctionHandle {
    id: u32,
    owner: Arc<Liveness>,
}

impl FunctionHandle {
    pub(crate) fn new(id: u32, owner: Arc<Liveness>) -> Self {
        FunctionHandle {
            id: id,
            owner: owner,
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub fn context_id(&self) -> ContextId {
        self.owner.id()
    }

    pub fn is_alive(&self) -> bool {
        self.owner.is_alive()
    }

    /// Checks that this handle may be used in the context `id`.
    pub(crate) fn check_owner(&self, id: ContextId) -> Result<()> {
        if !self.owner.is_alive() {
            Err(Error::new(ErrorKind::ContextDestroyed,
                format!("function handle belongs to destroyed context {}", self.owner.id())))
        } else if self.owner.id() != id {
            Err(Error::new(ErrorKind::InvalidHandle,
                format!("function handle belongs to context {}, not {}", self.owner.id(), id)))
        } else {
            Ok(())
        }
    }
}

impl PartialEq for FunctionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.owner.id() == other.owner.id()
    }
}

impl fmt::Debug for FunctionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FunctionHandle({}, #{})", self.owner.id(), self.id)
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match *self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Error(_) => "error",
        }
    }

    pub fn is_null(&self) -> bool {
        *self == Value::Null
    }

    /// Arrays and objects, the values that count towards nesting.
    pub fn is_container(&self) -> bool {
        matches!(*self, Value::Array(_) | Value::Object(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(i) => Some(i),
            _ => None,
        }
    }

    /// Numeric value of either number variant.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Int(i) => Some(i as f64),
            Value::Double(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match *self {
            Value::String(ref s) => Some(s),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionHandle> {
        match *self {
            Value::Function(ref f) => Some(f),
            _ => None,
        }
    }

    /// A double, folded into `Int` when it is integral and safe, as the engine would hand it back.
    pub fn number(d: f64) -> Value {
        if d.fract() == 0.0 && d.abs() <= MAX_SAFE_INTEGER as f64 && !(d == 0.0 && d.is_sign_negative()) {
            Value::Int(d as i64)
        } else {
            Value::Double(d)
        }
    }

    /// Converts to JSON. Functions and non-finite doubles have no JSON form.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        let r = match *self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::Number(i.into()),
            Value::Double(d) => Number::from_f64(d)
                .map(serde_json::Value::Number)
                .ok_or_else(|| Error::unsupported(format!("{} has no JSON representation", d)))?,
            Value::String(ref s) => serde_json::Value::String(s.clone()),
            Value::Array(ref items) => serde_json::Value::Array(
                items.iter().map(|v| v.to_json()).collect::<Result<Vec<_>>>()?),
            Value::Object(ref props) => {
                let mut m = Map::with_capacity(props.len());
                for (k, v) in props {
                    m.insert(k.clone(), v.to_json()?);
                }
                serde_json::Value::Object(m)
            }
            Value::Function(ref f) => return Err(Error::unsupported(format!("{:?} has no JSON representation", f))),
            Value::Error(ref e) => {
                let mut m = Map::new();
                m.insert("name".into(), e.name.clone().into());
                m.insert("message".into(), e.message.clone().into());
                if let Some(ref stack) = e.stack {
                    m.insert("stack".into(), stack.clone().into());
                }
                serde_json::Value::Object(m)
            }
        };

        Ok(r)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(props) => Value::Object(
                props.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl<'a> From<&'a str> for Value {
    fn from(s: &'a str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(props: IndexMap<String, Value>) -> Self {
        Value::Object(props)
    }
}

impl From<FunctionHandle> for Value {
    fn from(f: FunctionHandle) -> Self {
        Value::Function(f)
    }
}
