//! Heap object payloads and the slot interface.
//!
//! The VM talks to every heap object through a closed set of optional
//! operations (iterate, length, attribute access, display, comparisons,
//! move). For the builtin classes the slots are implemented as per-variant
//! inline logic on [`Payload`]; user-registered classes carry an explicit
//! vtable ([`ClassSlots`]) plus a method table.

use std::any::Any;
use std::cmp::Ordering;
use std::rc::Rc;

use crate::bytecode::Template;
use crate::error::{Error, Result};
use crate::heap::{Heap, ObjRef, ScopeId};
use crate::value::{Value, format_number};

/// User-registered class tags start here; everything below is reserved for
/// builtin types.
pub const USER_TYPE_FLOOR: u32 = 100;

// ---------------------------------------------------------------------------
// Builtin object state
// ---------------------------------------------------------------------------

/// State of the `loop` variable the VM maintains inside `for` bodies.
#[derive(Debug, Clone, Copy)]
pub struct LoopState {
    pub index0: usize,
    pub length: usize,
}

/// State of a `cycler(...)` object.
#[derive(Debug, Clone)]
pub struct CyclerState {
    pub items: Vec<Value>,
    pub pos: usize,
}

/// A user-class instance: its class definition plus opaque instance data.
pub struct UserObject {
    pub class: Rc<ClassDef>,
    pub data: Box<dyn Any>,
}

impl std::fmt::Debug for UserObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UserObject({})", self.class.name)
    }
}

/// A heap object's payload.
#[derive(Debug)]
pub enum Payload {
    /// Mutable string built at runtime.
    Str(String),
    /// String sharing immutable storage (constant tables); cloning the
    /// backing `Rc` instead of the bytes.
    ConstStr(Rc<str>),
    List(Vec<Value>),
    /// Insertion-ordered string-keyed map.
    Dict(Vec<(String, Value)>),
    /// `xrange(n)`: integers `0..n` with no storage.
    XRange(i64),
    Loop(LoopState),
    Cycler(CyclerState),
    /// A compiled template (also the value produced by `import`).
    Template(Template),
    User(UserObject),
}

impl Payload {
    /// Values referenced by this object, used by the heap to make `move`
    /// transitive.
    pub fn referenced_values(&self) -> Vec<Value> {
        match self {
            Payload::List(items) => items.clone(),
            Payload::Dict(pairs) => pairs.iter().map(|(_, v)| *v).collect(),
            Payload::Cycler(c) => c.items.clone(),
            Payload::User(u) => match &u.class.slots.move_refs {
                Some(f) => f(u.data.as_ref()),
                None => Vec::new(),
            },
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// User class registry
// ---------------------------------------------------------------------------

/// Context handed to host functions, methods and constructors. Gives access
/// to the heap so hosts can build container return values.
pub struct HostCtx<'h> {
    pub heap: &'h mut Heap,
    /// Scope that owns values allocated by the host call.
    pub scope: ScopeId,
}

impl HostCtx<'_> {
    pub fn alloc_str(&mut self, s: impl Into<String>) -> Value {
        Value::Str(self.heap.alloc(self.scope, Payload::Str(s.into())))
    }

    pub fn alloc_list(&mut self, items: Vec<Value>) -> Value {
        Value::Object(self.heap.alloc(self.scope, Payload::List(items)))
    }

    pub fn alloc_dict(&mut self, pairs: Vec<(String, Value)>) -> Value {
        Value::Object(self.heap.alloc(self.scope, Payload::Dict(pairs)))
    }

    /// String content of `v`, if it is a string.
    pub fn str_of<'a>(&'a self, v: &Value) -> Option<&'a str> {
        str_value(self.heap, v)
    }

    /// Textual rendering of `v` (what the print instruction would emit).
    pub fn display(&self, v: &Value) -> String {
        display(self.heap, v)
    }

    pub fn type_name(&self, v: &Value) -> String {
        type_name(self.heap, v)
    }

    /// `obj[key]`, exposed for host functions.
    pub fn attr_get(&mut self, obj: &Value, key: &Value) -> Result<Value> {
        attr_get(self, obj, key)
    }

    /// Length of `v`, exposed for host functions.
    pub fn len_of(&self, v: &Value) -> Result<usize> {
        len_of(self.heap, v)
    }

    /// The stable type tag of a user-class instance, for host-side type
    /// dispatch.
    pub fn user_tag(&self, v: &Value) -> Option<u32> {
        match v.obj_ref().map(|r| self.heap.payload(r)) {
            Some(Payload::User(u)) => Some(u.class.tag),
            _ => None,
        }
    }
}

/// A host function or filter (filters share the signature; the piped value
/// arrives as the first argument).
pub type HostFn = Rc<dyn Fn(&mut HostCtx, &[Value]) -> Result<Value>>;

/// A method on a user class. Receives the instance data alongside the
/// arguments.
pub type MethodFn = Rc<dyn Fn(&mut HostCtx, &mut dyn Any, &[Value]) -> Result<Value>>;

/// Constructor producing the opaque instance data.
pub type CtorFn = Rc<dyn Fn(&mut HostCtx, &[Value]) -> Result<Box<dyn Any>>>;

/// Optional slot overrides for a user class. Anything left `None` falls back
/// to a structured "not supported" error. Instance teardown is the `Drop`
/// impl of the instance data.
#[derive(Default)]
pub struct ClassSlots {
    pub len: Option<Rc<dyn Fn(&dyn Any) -> usize>>,
    pub display: Option<Rc<dyn Fn(&dyn Any) -> String>>,
    pub attr_get: Option<Rc<dyn Fn(&mut HostCtx, &dyn Any, &Value) -> Result<Value>>>,
    /// Materialize the iteration pairs; when present the object is iterable.
    pub iter_pairs: Option<Rc<dyn Fn(&dyn Any) -> Vec<(Value, Value)>>>,
    /// Values the instance references, for transitive `move`.
    pub move_refs: Option<Rc<dyn Fn(&dyn Any) -> Vec<Value>>>,
}

/// A registered user class.
pub struct ClassDef {
    pub name: String,
    /// Stable tag, `>= USER_TYPE_FLOOR`.
    pub tag: u32,
    pub ctor: CtorFn,
    pub methods: Vec<(String, MethodFn)>,
    pub slots: ClassSlots,
}

impl ClassDef {
    pub fn method(&self, name: &str) -> Option<&MethodFn> {
        self.methods.iter().find(|(n, _)| n == name).map(|(_, m)| m)
    }
}

// ---------------------------------------------------------------------------
// Allocation helpers
// ---------------------------------------------------------------------------

pub fn alloc_str(heap: &mut Heap, scope: ScopeId, s: impl Into<String>) -> Value {
    Value::Str(heap.alloc(scope, Payload::Str(s.into())))
}

pub fn alloc_const_str(heap: &mut Heap, scope: ScopeId, s: Rc<str>) -> Value {
    Value::Str(heap.alloc(scope, Payload::ConstStr(s)))
}

pub fn alloc_list(heap: &mut Heap, scope: ScopeId, items: Vec<Value>) -> Value {
    Value::Object(heap.alloc(scope, Payload::List(items)))
}

pub fn alloc_dict(heap: &mut Heap, scope: ScopeId, pairs: Vec<(String, Value)>) -> Value {
    Value::Object(heap.alloc(scope, Payload::Dict(pairs)))
}

pub fn alloc_xrange(heap: &mut Heap, scope: ScopeId, n: i64) -> Value {
    Value::Object(heap.alloc(scope, Payload::XRange(n)))
}

// ---------------------------------------------------------------------------
// Basic slots
// ---------------------------------------------------------------------------

/// String content of a value, if it is a string.
pub fn str_value<'h>(heap: &'h Heap, v: &Value) -> Option<&'h str> {
    match v {
        Value::Str(r) => match heap.payload(*r) {
            Payload::Str(s) => Some(s.as_str()),
            Payload::ConstStr(s) => Some(s.as_ref()),
            _ => None,
        },
        _ => None,
    }
}

/// Type name used in diagnostics and by the `typeof` filter.
pub fn type_name(heap: &Heap, v: &Value) -> String {
    match v {
        Value::None => "none".into(),
        Value::Bool(_) => "boolean".into(),
        Value::Number(_) => "number".into(),
        Value::Iter(_) => "iterator".into(),
        Value::Uninit => "<uninit>".into(),
        Value::Str(_) => "string".into(),
        Value::Object(r) => match heap.payload(*r) {
            Payload::Str(_) | Payload::ConstStr(_) => "string".into(),
            Payload::List(_) => "list".into(),
            Payload::Dict(_) => "dict".into(),
            Payload::XRange(_) => "xrange".into(),
            Payload::Loop(_) => "loop".into(),
            Payload::Cycler(_) => "cycler".into(),
            Payload::Template(_) => "template".into(),
            Payload::User(u) => u.class.name.clone(),
        },
    }
}

/// Python-style truthiness: empty containers, zero, None and false are falsy.
pub fn is_truthy(heap: &Heap, v: &Value) -> bool {
    if let Some(b) = v.primitive_truthy() {
        return b;
    }
    match v {
        Value::Str(_) => str_value(heap, v).is_some_and(|s| !s.is_empty()),
        Value::Object(r) => match heap.payload(*r) {
            Payload::List(items) => !items.is_empty(),
            Payload::Dict(pairs) => !pairs.is_empty(),
            Payload::XRange(n) => *n > 0,
            Payload::User(u) => match &u.class.slots.len {
                Some(len) => len(u.data.as_ref()) > 0,
                None => true,
            },
            _ => true,
        },
        _ => unreachable!("primitive handled above"),
    }
}

/// Length of a value. Strings count runes.
pub fn len_of(heap: &Heap, v: &Value) -> Result<usize> {
    match v {
        Value::Str(_) => Ok(str_value(heap, v).map(|s| s.chars().count()).unwrap_or(0)),
        Value::Object(r) => match heap.payload(*r) {
            Payload::List(items) => Ok(items.len()),
            Payload::Dict(pairs) => Ok(pairs.len()),
            Payload::XRange(n) => Ok((*n).max(0) as usize),
            Payload::Loop(l) => Ok(l.length),
            Payload::Cycler(c) => Ok(c.items.len()),
            Payload::User(u) => match &u.class.slots.len {
                Some(len) => Ok(len(u.data.as_ref())),
                None => Err(Error::RuntimeType(format!(
                    "type {} has no length",
                    u.class.name
                ))),
            },
            _ => Err(Error::RuntimeType(format!(
                "type {} has no length",
                type_name(heap, v)
            ))),
        },
        _ => Err(Error::RuntimeType(format!(
            "type {} has no length",
            type_name(heap, v)
        ))),
    }
}

/// Emptiness, defined exactly where length is.
pub fn is_empty(heap: &Heap, v: &Value) -> Result<bool> {
    Ok(len_of(heap, v)? == 0)
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

/// Textual rendering used by the print instruction. Strings render raw;
/// containers render their repr (strings inside them are quoted).
pub fn display(heap: &Heap, v: &Value) -> String {
    match v {
        Value::None => "None".into(),
        Value::Bool(b) => if *b { "True" } else { "False" }.into(),
        Value::Number(n) => format_number(*n),
        Value::Iter(_) => "<iterator>".into(),
        Value::Uninit => "<uninit>".into(),
        Value::Str(_) => str_value(heap, v).unwrap_or_default().to_string(),
        Value::Object(r) => match heap.payload(*r) {
            Payload::List(items) => {
                let inner: Vec<String> = items.iter().map(|i| repr(heap, i)).collect();
                format!("[{}]", inner.join(","))
            }
            Payload::Dict(pairs) => {
                let inner: Vec<String> = pairs
                    .iter()
                    .map(|(k, val)| format!("'{}':{}", k, repr(heap, val)))
                    .collect();
                format!("{{{}}}", inner.join(","))
            }
            Payload::XRange(n) => format!("xrange({n})"),
            Payload::Loop(l) => format!("loop({}/{})", l.index0, l.length),
            Payload::Cycler(c) => match c.items.get(c.pos % c.items.len().max(1)) {
                Some(cur) => display(heap, cur),
                None => "cycler()".into(),
            },
            Payload::Template(t) => format!("<template {}>", t.name),
            Payload::Str(_) | Payload::ConstStr(_) => {
                str_value(heap, v).unwrap_or_default().to_string()
            }
            Payload::User(u) => match &u.class.slots.display {
                Some(f) => f(u.data.as_ref()),
                None => format!("<{}>", u.class.name),
            },
        },
    }
}

fn repr(heap: &Heap, v: &Value) -> String {
    match v {
        Value::Str(_) => format!("'{}'", str_value(heap, v).unwrap_or_default()),
        _ => display(heap, v),
    }
}

// ---------------------------------------------------------------------------
// Attribute access
// ---------------------------------------------------------------------------

/// `obj[key]` / `obj.key`.
pub fn attr_get(ctx: &mut HostCtx, obj: &Value, key: &Value) -> Result<Value> {
    let r = match obj {
        Value::Object(r) | Value::Str(r) => *r,
        _ => {
            return Err(Error::RuntimeType(format!(
                "type {} has no attributes",
                type_name(ctx.heap, obj)
            )));
        }
    };
    enum Found {
        Val(Value),
        Str(String),
        UserSlot,
    }
    let found = match ctx.heap.payload(r) {
        Payload::List(items) => {
            let idx = key
                .as_number()
                .and_then(crate::value::to_integer)
                .ok_or_else(|| {
                    Error::RuntimeType(format!(
                        "list index must be an integer, got {}",
                        type_name(ctx.heap, key)
                    ))
                })?;
            if idx < 0 || idx as usize >= items.len() {
                return Err(Error::RuntimeBound(format!(
                    "list index {idx} out of range (length {})",
                    items.len()
                )));
            }
            Found::Val(items[idx as usize])
        }
        Payload::Dict(pairs) => {
            let k = str_value(ctx.heap, key).ok_or_else(|| {
                Error::RuntimeType(format!(
                    "dict key must be a string, got {}",
                    type_name(ctx.heap, key)
                ))
            })?;
            match pairs.iter().find(|(name, _)| name == k) {
                Some((_, v)) => Found::Val(*v),
                None => {
                    return Err(Error::RuntimeLookup(format!("dict has no key '{k}'")));
                }
            }
        }
        Payload::Loop(l) => {
            let k = str_value(ctx.heap, key).ok_or_else(|| {
                Error::RuntimeType("loop attribute name must be a string".into())
            })?;
            let n = |x: usize| Value::Number(x as f64);
            Found::Val(match k {
                "index" => n(l.index0 + 1),
                "index0" => n(l.index0),
                "revindex" => n(l.length - l.index0),
                "revindex0" => n(l.length - l.index0 - 1),
                "first" => Value::Bool(l.index0 == 0),
                "last" => Value::Bool(l.index0 + 1 == l.length),
                "length" => n(l.length),
                other => {
                    return Err(Error::RuntimeLookup(format!(
                        "loop has no attribute '{other}'"
                    )));
                }
            })
        }
        Payload::Cycler(c) => {
            let k = str_value(ctx.heap, key).ok_or_else(|| {
                Error::RuntimeType("cycler attribute name must be a string".into())
            })?;
            if k != "current" {
                return Err(Error::RuntimeLookup(format!(
                    "cycler has no attribute '{k}'"
                )));
            }
            if c.items.is_empty() {
                Found::Val(Value::None)
            } else {
                Found::Val(c.items[c.pos % c.items.len()])
            }
        }
        Payload::Str(_) | Payload::ConstStr(_) => {
            // Rune indexing into a string yields a one-character string.
            let s = str_value(ctx.heap, obj).unwrap_or_default();
            let idx = key
                .as_number()
                .and_then(crate::value::to_integer)
                .ok_or_else(|| Error::RuntimeType("string index must be an integer".into()))?;
            match s.chars().nth(idx.max(0) as usize) {
                Some(c) if idx >= 0 => Found::Str(c.to_string()),
                _ => {
                    return Err(Error::RuntimeBound(format!(
                        "string index {idx} out of range"
                    )));
                }
            }
        }
        Payload::User(_) => Found::UserSlot,
        _ => {
            return Err(Error::RuntimeType(format!(
                "type {} has no attributes",
                type_name(ctx.heap, obj)
            )));
        }
    };
    match found {
        Found::Val(v) => Ok(v),
        Found::Str(s) => Ok(ctx.alloc_str(s)),
        Found::UserSlot => {
            let (slot, class_name) = match ctx.heap.payload(r) {
                Payload::User(u) => (u.class.slots.attr_get.clone(), u.class.name.clone()),
                _ => unreachable!(),
            };
            match slot {
                Some(f) => {
                    // The instance data is read through a raw copy of the
                    // payload pointer; the slot only sees `&dyn Any`.
                    let key = *key;
                    with_user_data(ctx, r, move |ctx, data| f(ctx, data, &key))
                }
                None => Err(Error::RuntimeType(format!(
                    "type {class_name} does not support attribute access"
                ))),
            }
        }
    }
}

/// Run `f` with shared access to a user object's data while the context
/// keeps mutable heap access. The payload is temporarily taken out of the
/// slot so host code cannot observe a partially borrowed object.
fn with_user_data<T>(
    ctx: &mut HostCtx,
    r: ObjRef,
    f: impl FnOnce(&mut HostCtx, &dyn Any) -> Result<T>,
) -> Result<T> {
    let payload = std::mem::replace(ctx.heap.payload_mut(r), Payload::XRange(0));
    let result = match &payload {
        Payload::User(u) => f(ctx, u.data.as_ref()),
        _ => Err(Error::RuntimeType("not a user object".into())),
    };
    *ctx.heap.payload_mut(r) = payload;
    result
}

/// Same as [`with_user_data`] but with mutable instance data (methods).
pub fn with_user_data_mut<T>(
    ctx: &mut HostCtx,
    r: ObjRef,
    f: impl FnOnce(&mut HostCtx, &mut dyn Any) -> Result<T>,
) -> Result<T> {
    let mut payload = std::mem::replace(ctx.heap.payload_mut(r), Payload::XRange(0));
    let result = match &mut payload {
        Payload::User(u) => f(ctx, u.data.as_mut()),
        _ => Err(Error::RuntimeType("not a user object".into())),
    };
    *ctx.heap.payload_mut(r) = payload;
    result
}

/// `obj[key] = val`.
pub fn attr_set(heap: &mut Heap, obj: &Value, key: &Value, val: Value) -> Result<()> {
    let r = match obj {
        Value::Object(r) => *r,
        _ => {
            return Err(Error::RuntimeType(format!(
                "cannot set attributes on type {}",
                type_name(heap, obj)
            )));
        }
    };
    let key_str = str_value(heap, key).map(str::to_string);
    let key_num = key.as_number().and_then(crate::value::to_integer);
    match heap.payload_mut(r) {
        Payload::Dict(pairs) => {
            let k = key_str
                .ok_or_else(|| Error::RuntimeType("dict key must be a string".into()))?;
            match pairs.iter_mut().find(|(name, _)| *name == k) {
                Some(pair) => pair.1 = val,
                None => pairs.push((k, val)),
            }
            Ok(())
        }
        Payload::List(items) => {
            let idx =
                key_num.ok_or_else(|| Error::RuntimeType("list index must be an integer".into()))?;
            if idx < 0 || idx as usize >= items.len() {
                return Err(Error::RuntimeBound(format!(
                    "list index {idx} out of range (length {})",
                    items.len()
                )));
            }
            items[idx as usize] = val;
            Ok(())
        }
        other => Err(Error::RuntimeType(format!(
            "cannot set attributes on this type ({})",
            payload_kind(other)
        ))),
    }
}

/// Append `val` to an ordered container.
pub fn attr_push(heap: &mut Heap, obj: &Value, val: Value) -> Result<()> {
    let r = match obj {
        Value::Object(r) => *r,
        _ => {
            return Err(Error::RuntimeType(format!(
                "cannot push into type {}",
                type_name(heap, obj)
            )));
        }
    };
    match heap.payload_mut(r) {
        Payload::List(items) => {
            items.push(val);
            Ok(())
        }
        other => Err(Error::RuntimeType(format!(
            "cannot push into this type ({})",
            payload_kind(other)
        ))),
    }
}

fn payload_kind(p: &Payload) -> &'static str {
    match p {
        Payload::Str(_) | Payload::ConstStr(_) => "string",
        Payload::List(_) => "list",
        Payload::Dict(_) => "dict",
        Payload::XRange(_) => "xrange",
        Payload::Loop(_) => "loop",
        Payload::Cycler(_) => "cycler",
        Payload::Template(_) => "template",
        Payload::User(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Builtin method tables
// ---------------------------------------------------------------------------

/// Template-callable list methods: `append`, `extend`, `pop_back`, `count`,
/// `clear`. The mutating ones move their operands into the list's owning
/// scope, so a value appended inside a nested scope survives as long as the
/// list does. `append`/`extend`/`pop_back` return the list itself, so calls
/// chain.
pub fn list_method(heap: &mut Heap, r: ObjRef, name: &str, args: &[Value]) -> Result<Value> {
    let scope = match heap.get(r) {
        Some(o) if matches!(o.payload, Payload::List(_)) => o.scope,
        _ => return Err(Error::RuntimeType("not a list".into())),
    };
    match name {
        "append" => {
            if args.is_empty() {
                return Err(Error::RuntimeArity(
                    "list.append() needs at least one argument".into(),
                ));
            }
            for &arg in args {
                let v = heap.move_value(arg, scope);
                let Payload::List(items) = heap.payload_mut(r) else {
                    unreachable!("receiver checked above");
                };
                items.push(v);
            }
            Ok(Value::Object(r))
        }
        "extend" => {
            if args.len() != 1 {
                return Err(Error::RuntimeArity(
                    "list.extend() takes exactly one argument".into(),
                ));
            }
            let other = match args[0].obj_ref().map(|o| heap.payload(o)) {
                Some(Payload::List(items)) => items.clone(),
                _ => {
                    return Err(Error::RuntimeType(
                        "list.extend() argument must be a list".into(),
                    ));
                }
            };
            for v in other {
                let v = heap.move_value(v, scope);
                let Payload::List(items) = heap.payload_mut(r) else {
                    unreachable!("receiver checked above");
                };
                items.push(v);
            }
            Ok(Value::Object(r))
        }
        "pop_back" => {
            no_args(args, "list.pop_back")?;
            let Payload::List(items) = heap.payload_mut(r) else {
                unreachable!("receiver checked above");
            };
            if items.pop().is_none() {
                return Err(Error::RuntimeBound(
                    "list.pop_back() on an empty list".into(),
                ));
            }
            Ok(Value::Object(r))
        }
        "count" => {
            no_args(args, "list.count")?;
            let Payload::List(items) = heap.payload(r) else {
                unreachable!("receiver checked above");
            };
            Ok(Value::Number(items.len() as f64))
        }
        "clear" => {
            no_args(args, "list.clear")?;
            let Payload::List(items) = heap.payload_mut(r) else {
                unreachable!("receiver checked above");
            };
            items.clear();
            Ok(Value::None)
        }
        other => Err(Error::RuntimeLookup(format!(
            "list has no method '{other}'"
        ))),
    }
}

/// Template-callable dict methods: `set`, `get`, `update`, `pop`,
/// `has_key`, `count`, `clear`. `set` only inserts a missing key and
/// `update` only overwrites an existing one; both report whether they took
/// effect, and both move the stored value into the dict's owning scope.
pub fn dict_method(heap: &mut Heap, r: ObjRef, name: &str, args: &[Value]) -> Result<Value> {
    let scope = match heap.get(r) {
        Some(o) if matches!(o.payload, Payload::Dict(_)) => o.scope,
        _ => return Err(Error::RuntimeType("not a dict".into())),
    };
    let key_arg = |heap: &Heap, method: &str| -> Result<String> {
        match args.first().and_then(|k| str_value(heap, k)) {
            Some(k) => Ok(k.to_string()),
            None => Err(Error::RuntimeType(format!(
                "dict.{method}() key must be a string"
            ))),
        }
    };
    match name {
        "get" => {
            if args.len() != 1 {
                return Err(Error::RuntimeArity(
                    "dict.get() takes exactly one argument".into(),
                ));
            }
            let key = key_arg(heap, "get")?;
            let Payload::Dict(pairs) = heap.payload(r) else {
                unreachable!("receiver checked above");
            };
            Ok(pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| *v)
                .unwrap_or(Value::None))
        }
        "set" => {
            if args.len() != 2 {
                return Err(Error::RuntimeArity(
                    "dict.set() takes a key and a value".into(),
                ));
            }
            let key = key_arg(heap, "set")?;
            let exists = {
                let Payload::Dict(pairs) = heap.payload(r) else {
                    unreachable!("receiver checked above");
                };
                pairs.iter().any(|(k, _)| *k == key)
            };
            if exists {
                return Ok(Value::FALSE);
            }
            let v = heap.move_value(args[1], scope);
            let Payload::Dict(pairs) = heap.payload_mut(r) else {
                unreachable!("receiver checked above");
            };
            pairs.push((key, v));
            Ok(Value::TRUE)
        }
        "update" => {
            if args.len() != 2 {
                return Err(Error::RuntimeArity(
                    "dict.update() takes a key and a value".into(),
                ));
            }
            let key = key_arg(heap, "update")?;
            let exists = {
                let Payload::Dict(pairs) = heap.payload(r) else {
                    unreachable!("receiver checked above");
                };
                pairs.iter().any(|(k, _)| *k == key)
            };
            if !exists {
                return Ok(Value::FALSE);
            }
            let v = heap.move_value(args[1], scope);
            let Payload::Dict(pairs) = heap.payload_mut(r) else {
                unreachable!("receiver checked above");
            };
            if let Some(pair) = pairs.iter_mut().find(|(k, _)| *k == key) {
                pair.1 = v;
            }
            Ok(Value::TRUE)
        }
        "pop" => {
            if args.len() != 1 {
                return Err(Error::RuntimeArity(
                    "dict.pop() takes exactly one argument".into(),
                ));
            }
            let key = key_arg(heap, "pop")?;
            let Payload::Dict(pairs) = heap.payload_mut(r) else {
                unreachable!("receiver checked above");
            };
            match pairs.iter().position(|(k, _)| *k == key) {
                Some(pos) => {
                    pairs.remove(pos);
                    Ok(Value::TRUE)
                }
                None => Ok(Value::FALSE),
            }
        }
        "has_key" => {
            if args.len() != 1 {
                return Err(Error::RuntimeArity(
                    "dict.has_key() takes exactly one argument".into(),
                ));
            }
            let key = key_arg(heap, "has_key")?;
            let Payload::Dict(pairs) = heap.payload(r) else {
                unreachable!("receiver checked above");
            };
            Ok(Value::Bool(pairs.iter().any(|(k, _)| *k == key)))
        }
        "count" => {
            no_args(args, "dict.count")?;
            let Payload::Dict(pairs) = heap.payload(r) else {
                unreachable!("receiver checked above");
            };
            Ok(Value::Number(pairs.len() as f64))
        }
        "clear" => {
            no_args(args, "dict.clear")?;
            let Payload::Dict(pairs) = heap.payload_mut(r) else {
                unreachable!("receiver checked above");
            };
            pairs.clear();
            Ok(Value::None)
        }
        other => Err(Error::RuntimeLookup(format!(
            "dict has no method '{other}'"
        ))),
    }
}

fn no_args(args: &[Value], method: &str) -> Result<()> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(Error::RuntimeArity(format!(
            "{method}() takes no arguments"
        )))
    }
}

// ---------------------------------------------------------------------------
// Iteration
// ---------------------------------------------------------------------------

/// Start iterating `v`. Iterator state is a non-negative integer.
pub fn iter_start(heap: &Heap, v: &Value) -> Result<i32> {
    iterable_check(heap, v)?;
    Ok(0)
}

pub fn iter_has(heap: &Heap, v: &Value, it: i32) -> Result<bool> {
    Ok((it as usize) < iter_len(heap, v)?)
}

pub fn iter_move(heap: &Heap, v: &Value, it: i32) -> Result<i32> {
    iterable_check(heap, v)?;
    Ok(it + 1)
}

/// Dereference the iterator: returns `(key, value)`. Dict keys are freshly
/// allocated strings in `ctx.scope`.
pub fn iter_deref(ctx: &mut HostCtx, v: &Value, it: i32) -> Result<(Value, Value)> {
    let idx = it as usize;
    let r = match v {
        Value::Object(r) => *r,
        _ => return Err(not_iterable(ctx.heap, v)),
    };
    enum Entry {
        Plain(Value, Value),
        DictPair(String, Value),
    }
    let entry = match ctx.heap.payload(r) {
        Payload::List(items) => Entry::Plain(Value::Number(idx as f64), items[idx]),
        Payload::Dict(pairs) => {
            let (k, val) = &pairs[idx];
            Entry::DictPair(k.clone(), *val)
        }
        Payload::XRange(_) => Entry::Plain(Value::Number(idx as f64), Value::Number(idx as f64)),
        Payload::User(u) => match &u.class.slots.iter_pairs {
            Some(pairs) => {
                let all = pairs(u.data.as_ref());
                let (k, val) = all[idx];
                Entry::Plain(k, val)
            }
            None => return Err(not_iterable(ctx.heap, v)),
        },
        _ => return Err(not_iterable(ctx.heap, v)),
    };
    match entry {
        Entry::Plain(k, val) => Ok((k, val)),
        Entry::DictPair(k, val) => {
            let key = ctx.alloc_str(k);
            Ok((key, val))
        }
    }
}

fn iterable_check(heap: &Heap, v: &Value) -> Result<()> {
    iter_len(heap, v).map(|_| ())
}

/// Number of elements the iteration protocol will produce for `v`.
pub fn iteration_len(heap: &Heap, v: &Value) -> Result<usize> {
    iter_len(heap, v)
}

fn iter_len(heap: &Heap, v: &Value) -> Result<usize> {
    match v {
        Value::Object(r) => match heap.payload(*r) {
            Payload::List(items) => Ok(items.len()),
            Payload::Dict(pairs) => Ok(pairs.len()),
            Payload::XRange(n) => Ok((*n).max(0) as usize),
            Payload::User(u) => match &u.class.slots.iter_pairs {
                Some(pairs) => Ok(pairs(u.data.as_ref()).len()),
                None => Err(not_iterable(heap, v)),
            },
            _ => Err(not_iterable(heap, v)),
        },
        _ => Err(not_iterable(heap, v)),
    }
}

fn not_iterable(heap: &Heap, v: &Value) -> Error {
    Error::RuntimeType(format!("type {} is not iterable", type_name(heap, v)))
}

/// Whether the iteration slots are present for this value.
pub fn is_iterable(heap: &Heap, v: &Value) -> bool {
    iter_len(heap, v).is_ok()
}

// ---------------------------------------------------------------------------
// Comparisons
// ---------------------------------------------------------------------------

/// Structural equality. Type-mismatched operands compare unequal instead of
/// failing.
pub fn values_eq(heap: &Heap, l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::None, Value::None) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a == b,
        (Value::Str(_), Value::Str(_)) => str_value(heap, l) == str_value(heap, r),
        (Value::Object(a), Value::Object(b)) => {
            match (heap.payload(*a), heap.payload(*b)) {
                (Payload::List(x), Payload::List(y)) => {
                    x.len() == y.len()
                        && x.iter().zip(y.iter()).all(|(i, j)| values_eq(heap, i, j))
                }
                (Payload::Dict(x), Payload::Dict(y)) => {
                    x.len() == y.len()
                        && x.iter().all(|(k, v)| {
                            y.iter()
                                .find(|(k2, _)| k2 == k)
                                .is_some_and(|(_, v2)| values_eq(heap, v, v2))
                        })
                }
                (Payload::XRange(x), Payload::XRange(y)) => x == y,
                // Everything else compares by identity.
                _ => a == b,
            }
        }
        _ => false,
    }
}

/// Ordering for `< <= > >=`. Mismatched complex types raise a runtime error.
pub fn values_cmp(heap: &Heap, l: &Value, r: &Value) -> Result<Ordering> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a
            .partial_cmp(b)
            .ok_or_else(|| Error::RuntimeType("cannot order NaN".into())),
        (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
        (Value::Str(_), Value::Str(_)) => {
            let a = str_value(heap, l).unwrap_or_default();
            let b = str_value(heap, r).unwrap_or_default();
            Ok(a.as_bytes().cmp(b.as_bytes()))
        }
        (Value::Object(a), Value::Object(b)) => match (heap.payload(*a), heap.payload(*b)) {
            (Payload::List(x), Payload::List(y)) => {
                match x.len().cmp(&y.len()) {
                    Ordering::Equal => {}
                    ord => return Ok(ord),
                }
                let (x, y) = (x.clone(), y.clone());
                for (i, j) in x.iter().zip(y.iter()) {
                    match values_cmp(heap, i, j)? {
                        Ordering::Equal => continue,
                        ord => return Ok(ord),
                    }
                }
                Ok(Ordering::Equal)
            }
            (Payload::Dict(x), Payload::Dict(y)) => {
                match x.len().cmp(&y.len()) {
                    Ordering::Equal => {}
                    ord => return Ok(ord),
                }
                let (x, y) = (x.clone(), y.clone());
                for (k, v) in &x {
                    let Some((_, v2)) = y.iter().find(|(k2, _)| k2 == k) else {
                        return Err(Error::RuntimeType(
                            "cannot order dicts with differing keys".into(),
                        ));
                    };
                    match values_cmp(heap, v, v2)? {
                        Ordering::Equal => continue,
                        ord => return Ok(ord),
                    }
                }
                Ok(Ordering::Equal)
            }
            (Payload::XRange(x), Payload::XRange(y)) => Ok(x.cmp(y)),
            _ => Err(Error::RuntimeType(format!(
                "cannot order {} and {}",
                type_name(heap, l),
                type_name(heap, r)
            ))),
        },
        _ => Err(Error::RuntimeType(format!(
            "cannot order {} and {}",
            type_name(heap, l),
            type_name(heap, r)
        ))),
    }
}

/// The `in` operator: element of a list, key of a dict, substring of a
/// string.
pub fn value_in(heap: &Heap, item: &Value, container: &Value) -> Result<bool> {
    if let Some(hay) = str_value(heap, container) {
        let needle = str_value(heap, item).ok_or_else(|| {
            Error::RuntimeType("substring test requires a string operand".into())
        })?;
        return Ok(hay.contains(needle));
    }
    match container {
        Value::Object(r) => match heap.payload(*r) {
            Payload::List(items) => Ok(items.iter().any(|i| values_eq(heap, i, item))),
            Payload::Dict(pairs) => {
                let k = str_value(heap, item).ok_or_else(|| {
                    Error::RuntimeType("dict membership test requires a string key".into())
                })?;
                Ok(pairs.iter().any(|(name, _)| name == k))
            }
            _ => Err(Error::RuntimeType(format!(
                "type {} does not support 'in'",
                type_name(heap, container)
            ))),
        },
        _ => Err(Error::RuntimeType(format!(
            "type {} does not support 'in'",
            type_name(heap, container)
        ))),
    }
}
