//! Conversion between host `Value`s and engine values.
//!
//! Host to engine: `Int` outside the safe range becomes a BigInt, `Function` must belong to the
//! context it is passed into. Engine to host: numbers fold to `Int` when integral and safe,
//! `undefined` becomes `Null`, functions get registered and come back as handles.
//! Symbols, promises and cyclic graphs are refused, as are values past the depth or size limits.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::{ContextId, Liveness};
use crate::error::{Error, ErrorKind, Result};
use crate::value::{is_safe_integer, FunctionHandle, ScriptException, Value};

/// Nesting limit in either direction: at most this many arrays and objects on any path.
pub const MAX_DEPTH: usize = 64;

/// Array elements plus object properties one engine value may expand into.
pub const MAX_ELEMENTS: usize = 1 << 20;

struct Registered {
    function: v8::Global<v8::Function>,
    /// The object the function was read from, used as `this` when called.
    receiver: Option<v8::Global<v8::Object>>,
    hash: i32,
}

/// Functions handed out to the host, by handle id.
///
/// A function read through the same receiver keeps its id, so converting it again doesn't grow
/// the registry. Entries live until released or until the context goes away.
#[derive(Default)]
pub struct Registry {
    next_id: u32,
    functions: HashMap<u32, Registered>,
    by_hash: HashMap<i32, Vec<u32>>,
}

impl Registry {
    pub fn register<'s>(&mut self, scope: &mut v8::HandleScope<'s>, function: v8::Local<'s, v8::Function>,
                        receiver: Option<v8::Local<'s, v8::Object>>) -> u32 {
        let hash = i32::from(function.get_identity_hash());
        if let Some(ids) = self.by_hash.get(&hash) {
            for id in ids {
                if let Some(r) = self.functions.get(id) {
                    if same_function(scope, r, function, receiver) {
                        return *id;
                    }
                }
            }
        }

        self.next_id = self.next_id.wrapping_add(1);
        let id = self.next_id;
        self.functions.insert(id, Registered {
            function: v8::Global::new(scope, function),
            receiver: receiver.map(|r| v8::Global::new(scope, r)),
            hash: hash,
        });
        self.by_hash.entry(hash).or_insert_with(Vec::new).push(id);
        id
    }

    /// The function and its receiver (`undefined` when it has none).
    pub fn get<'s>(&self, scope: &mut v8::HandleScope<'s>, id: u32)
        -> Result<(v8::Local<'s, v8::Function>, v8::Local<'s, v8::Value>)> {
        let r = self.functions.get(&id)
            .ok_or_else(|| Error::new(ErrorKind::InvalidHandle,
                format!("function handle #{} has been released", id)))?;

        let function = v8::Local::new(scope, &r.function);
        let receiver = match r.receiver {
            Some(ref o) => v8::Local::new(scope, o).into(),
            None => v8::undefined(scope).into(),
        };
        Ok((function, receiver))
    }

    pub fn release(&mut self, id: u32) -> bool {
        let r = match self.functions.remove(&id) {
            Some(r) => r,
            None => return false,
        };
        if let Some(ids) = self.by_hash.get_mut(&r.hash) {
            ids.retain(|i| *i != id);
            if ids.is_empty() {
                self.by_hash.remove(&r.hash);
            }
        }
        true
    }

    pub fn clear(&mut self) {
        self.functions.clear();
        self.by_hash.clear();
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }
}

fn same_function<'s>(scope: &mut v8::HandleScope<'s>, r: &Registered, function: v8::Local<'s, v8::Function>,
                     receiver: Option<v8::Local<'s, v8::Object>>) -> bool {
    let f = v8::Local::new(scope, &r.function);
    if !f.strict_equals(function.into()) {
        return false;
    }
    match (r.receiver.as_ref(), receiver) {
        (None, None) => true,
        (Some(stored), Some(receiver)) => v8::Local::new(scope, stored).strict_equals(receiver.into()),
        _ => false,
    }
}

fn new_string<'s>(scope: &mut v8::HandleScope<'s>, s: &str) -> Result<v8::Local<'s, v8::String>> {
    v8::String::new(scope, s)
        .ok_or_else(|| Error::unsupported(format!("string of {} bytes exceeds the engine's limit", s.len())))
}

pub fn to_engine<'s>(scope: &mut v8::HandleScope<'s>, value: &Value, registry: &Registry, owner: ContextId)
    -> Result<v8::Local<'s, v8::Value>> {
    to_engine_at(scope, value, registry, owner, 0)
}

fn to_engine_at<'s>(scope: &mut v8::HandleScope<'s>, value: &Value, registry: &Registry, owner: ContextId, depth: usize)
    -> Result<v8::Local<'s, v8::Value>> {
    if value.is_container() && depth >= MAX_DEPTH {
        return Err(too_deep());
    }

    let v: v8::Local<v8::Value> = match *value {
        Value::Null => v8::null(scope).into(),
        Value::Bool(b) => v8::Boolean::new(scope, b).into(),
        Value::Int(i) if is_safe_integer(i) => v8::Number::new(scope, i as f64).into(),
        Value::Int(i) => v8::BigInt::new_from_i64(scope, i).into(),
        Value::Double(d) => v8::Number::new(scope, d).into(),
        Value::String(ref s) => new_string(scope, s)?.into(),
        Value::Array(ref items) => {
            let mut elements = Vec::with_capacity(items.len());
            for item in items {
                elements.push(to_engine_at(scope, item, registry, owner, depth + 1)?);
            }
            v8::Array::new_with_elements(scope, &elements).into()
        }
        Value::Object(ref props) => {
            let obj = v8::Object::new(scope);
            for (k, v) in props {
                let key = new_string(scope, k)?;
                let val = to_engine_at(scope, v, registry, owner, depth + 1)?;
                // Data properties, so keys like __proto__ stay plain keys.
                obj.create_data_property(scope, key.into(), val)
                    .ok_or_else(|| Error::unsupported(format!("could not define property {:?}", k)))?;
            }
            obj.into()
        }
        Value::Function(ref f) => {
            f.check_owner(owner)?;
            let (function, _) = registry.get(scope, f.id())?;
            function.into()
        }
        Value::Error(ref e) => {
            let message = new_string(scope, &e.message)?;
            let error = v8::Exception::error(scope, message);
            if let Ok(obj) = v8::Local::<v8::Object>::try_from(error) {
                if e.name != "Error" {
                    set_string(scope, obj, "name", &e.name)?;
                }
                if let Some(ref stack) = e.stack {
                    set_string(scope, obj, "stack", stack)?;
                }
            }
            error
        }
    };

    Ok(v)
}

fn set_string(scope: &mut v8::HandleScope, obj: v8::Local<v8::Object>, key: &str, value: &str) -> Result<()> {
    let k = new_string(scope, key)?;
    let v = new_string(scope, value)?;
    obj.set(scope, k.into(), v.into())
        .map(|_| ())
        .ok_or_else(|| Error::unsupported(format!("could not set {} on an error object", key)))
}

fn get_string(scope: &mut v8::HandleScope, obj: v8::Local<v8::Object>, key: &str) -> Option<String> {
    let k = v8::String::new(scope, key)?;
    let v = obj.get(scope, k.into())?;
    if v.is_null_or_undefined() {
        return None;
    }
    Some(v.to_string(scope)?.to_rust_string_lossy(scope))
}

/// Name, message and stack of an engine error object.
pub fn exception_of(scope: &mut v8::HandleScope, obj: v8::Local<v8::Object>) -> ScriptException {
    ScriptException {
        name: get_string(scope, obj, "name").unwrap_or_else(|| "Error".to_owned()),
        message: get_string(scope, obj, "message").unwrap_or_default(),
        stack: get_string(scope, obj, "stack"),
    }
}

/// Describes an arbitrary engine value for error messages.
pub fn describe(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> String {
    match value.to_string(scope) {
        Some(s) => s.to_rust_string_lossy(scope),
        None => value.type_of(scope).to_rust_string_lossy(scope),
    }
}

fn too_deep() -> Error {
    Error::unsupported(format!("values nested deeper than {} levels", MAX_DEPTH))
}

/// State of one engine-to-host conversion.
struct Walk<'s> {
    /// Containers on the path to the current value.
    path: Vec<v8::Local<'s, v8::Object>>,
    /// Elements left before the value counts as too large.
    budget: usize,
}

impl<'s> Walk<'s> {
    fn spend(&mut self, n: usize) -> Result<()> {
        if n > self.budget {
            return Err(Error::unsupported(format!("values with more than {} elements in total", MAX_ELEMENTS)));
        }
        self.budget -= n;
        Ok(())
    }
}

pub fn from_engine<'s>(scope: &mut v8::HandleScope<'s>, value: v8::Local<'s, v8::Value>, registry: &mut Registry,
                       owner: &Arc<Liveness>) -> Result<Value> {
    let mut walk = Walk {
        path: Vec::new(),
        budget: MAX_ELEMENTS,
    };
    from_engine_at(scope, value, None, registry, owner, &mut walk)
}

fn from_engine_at<'s>(scope: &mut v8::HandleScope<'s>, value: v8::Local<'s, v8::Value>,
                      receiver: Option<v8::Local<'s, v8::Object>>, registry: &mut Registry, owner: &Arc<Liveness>,
                      walk: &mut Walk<'s>) -> Result<Value> {
    if value.is_null_or_undefined() {
        Ok(Value::Null)
    } else if value.is_boolean() {
        Ok(Value::Bool(value.is_true()))
    } else if value.is_number() {
        let n = v8::Local::<v8::Number>::try_from(value).map_err(|_| Error::unsupported("malformed number"))?;
        Ok(Value::number(n.value()))
    } else if value.is_string() {
        let s = v8::Local::<v8::String>::try_from(value).map_err(|_| Error::unsupported("malformed string"))?;
        Ok(Value::String(s.to_rust_string_lossy(scope)))
    } else if value.is_big_int() {
        let b = v8::Local::<v8::BigInt>::try_from(value).map_err(|_| Error::unsupported("malformed bigint"))?;
        match b.i64_value() {
            (i, true) => Ok(Value::Int(i)),
            (_, false) => Err(Error::unsupported(format!("bigint {} does not fit in 64 bits", describe(scope, value)))),
        }
    } else if value.is_symbol() {
        Err(Error::unsupported("symbols have no host representation"))
    } else if value.is_function() {
        let f = v8::Local::<v8::Function>::try_from(value).map_err(|_| Error::unsupported("malformed function"))?;
        let id = registry.register(scope, f, receiver);
        Ok(Value::Function(FunctionHandle::new(id, owner.clone())))
    } else if value.is_native_error() {
        let obj = v8::Local::<v8::Object>::try_from(value).map_err(|_| Error::unsupported("malformed error"))?;
        Ok(Value::Error(exception_of(scope, obj)))
    } else if value.is_promise() {
        Err(Error::unsupported("promises have no host representation; await them in script"))
    } else if value.is_date() {
        let d = v8::Local::<v8::Date>::try_from(value).map_err(|_| Error::unsupported("malformed date"))?;
        Ok(Value::number(d.value_of()))
    } else if value.is_object() {
        let obj = v8::Local::<v8::Object>::try_from(value).map_err(|_| Error::unsupported("malformed object"))?;

        if walk.path.iter().any(|o| o.strict_equals(value)) {
            return Err(Error::unsupported("cyclic object graphs have no host representation"));
        }
        if walk.path.len() >= MAX_DEPTH {
            return Err(too_deep());
        }

        walk.path.push(obj);
        let r = if value.is_array() {
            array_from_engine(scope, value, registry, owner, walk)
        } else {
            object_from_engine(scope, obj, registry, owner, walk)
        };
        walk.path.pop();
        r
    } else {
        Err(Error::unsupported(format!("{} values have no host representation",
            value.type_of(scope).to_rust_string_lossy(scope))))
    }
}

// Lengths come from script and may be huge for sparse arrays. Nothing is sized from them.
fn array_from_engine<'s>(scope: &mut v8::HandleScope<'s>, value: v8::Local<'s, v8::Value>, registry: &mut Registry,
                         owner: &Arc<Liveness>, walk: &mut Walk<'s>) -> Result<Value> {
    let array = v8::Local::<v8::Array>::try_from(value).map_err(|_| Error::unsupported("malformed array"))?;
    let len = array.length();
    walk.spend(len as usize)?;
    let mut items = Vec::new();

    for i in 0..len {
        let item = array.get_index(scope, i)
            .ok_or_else(|| Error::unsupported(format!("reading array index {} threw", i)))?;
        items.push(from_engine_at(scope, item, None, registry, owner, walk)?);
    }

    Ok(Value::Array(items))
}

fn object_from_engine<'s>(scope: &mut v8::HandleScope<'s>, obj: v8::Local<'s, v8::Object>, registry: &mut Registry,
                          owner: &Arc<Liveness>, walk: &mut Walk<'s>) -> Result<Value> {
    let names = obj.get_own_property_names(scope, v8::GetPropertyNamesArgs::default())
        .ok_or_else(|| Error::unsupported("could not enumerate object properties"))?;
    let len = names.length();
    walk.spend(len as usize)?;
    let mut props = indexmap::IndexMap::new();

    for i in 0..len {
        let key = names.get_index(scope, i)
            .ok_or_else(|| Error::unsupported("could not read a property name"))?;
        let name = describe(scope, key);
        let v = obj.get(scope, key)
            .ok_or_else(|| Error::unsupported(format!("reading property {:?} threw", name)))?;
        props.insert(name, from_engine_at(scope, v, Some(obj), registry, owner, walk)?);
    }

    Ok(Value::Object(props))
}
