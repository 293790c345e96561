//! Value representation of the amber runtime.
//!
//! Reference kinds (strings, tables, userdata, functions, threads) are shared
//! `Rc` allocations; identity is pointer identity, surfaced to the serializer
//! as a hashable [`ObjKey`].

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use super::vm::{Function, Thread};
use super::VmError;

/// An immutable byte string. Strings are opaque byte sequences; they are not
/// required to be valid UTF-8.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct VmString(Box<[u8]>);

impl VmString {
    pub fn new(bytes: impl Into<Box<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for VmString {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().into())
    }
}

impl fmt::Debug for VmString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

/// A first-class runtime value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    /// A raw pointer-sized word carried around as data. Never dereferenced by
    /// the runtime; the serializer uses it for surrogate identities and
    /// opaque I/O handles.
    LightPtr(usize),
    Number(f64),
    Str(Rc<VmString>),
    Table(Rc<RefCell<Table>>),
    Userdata(Rc<RefCell<Userdata>>),
    Function(Function),
    Thread(Rc<RefCell<Thread>>),
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Str(Rc::new(VmString::from(s)))
    }

    pub fn table() -> Self {
        Value::Table(Rc::new(RefCell::new(Table::new())))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::LightPtr(_) => "lightpointer",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Table(_) => "table",
            Value::Userdata(_) => "userdata",
            Value::Function(_) => "function",
            Value::Thread(_) => "thread",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Raw identity, the way the host compares objects: reference kinds by
    /// pointer, everything else by value.
    pub fn identical(&self, other: &Value) -> bool {
        match (self.obj_key(), other.obj_key()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self == other,
            _ => false,
        }
    }

    /// Identity key for reference kinds; `None` for the trivially small
    /// values that are always written inline.
    pub(crate) fn obj_key(&self) -> Option<ObjKey> {
        match self {
            Value::Nil | Value::Boolean(_) | Value::LightPtr(_) | Value::Number(_) => None,
            Value::Str(s) => Some(ObjKey::Str(Rc::as_ptr(s) as usize)),
            Value::Table(t) => Some(ObjKey::Table(Rc::as_ptr(t) as usize)),
            Value::Userdata(u) => Some(ObjKey::Userdata(Rc::as_ptr(u) as usize)),
            Value::Function(Function::Native(f)) => Some(ObjKey::NativeFn(*f as usize)),
            Value::Function(Function::NativeClosure(c)) => {
                Some(ObjKey::NativeClosure(Rc::as_ptr(c) as usize))
            }
            Value::Function(Function::Script(c)) => {
                Some(ObjKey::ScriptClosure(Rc::as_ptr(c) as usize))
            }
            Value::Thread(t) => Some(ObjKey::Thread(Rc::as_ptr(t) as usize)),
        }
    }
}

/// Host equality: numbers and booleans by value, strings by content,
/// reference kinds by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::LightPtr(a), Value::LightPtr(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b) || a.as_bytes() == b.as_bytes(),
            _ => match (self.obj_key(), other.obj_key()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

// Values form cyclic graphs; keep Debug shallow so it terminates.
impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::LightPtr(p) => write!(f, "lightpointer: {p:#x}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Table(t) => write!(f, "table: {:p}", Rc::as_ptr(t)),
            Value::Userdata(u) => write!(f, "userdata: {:p}", Rc::as_ptr(u)),
            Value::Function(Function::Native(n)) => write!(f, "function: {:#x}", *n as usize),
            Value::Function(Function::NativeClosure(c)) => {
                write!(f, "function: {:p}", Rc::as_ptr(c))
            }
            Value::Function(Function::Script(c)) => write!(f, "function: {:p}", Rc::as_ptr(c)),
            Value::Thread(t) => write!(f, "thread: {:p}", Rc::as_ptr(t)),
        }
    }
}

/// Pointer identity of a reference value, usable as a hash-map key. This is
/// the generalized form of the serializer's "surrogate": prototypes and
/// upvalues, which are not first-class values, get their own variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ObjKey {
    Str(usize),
    Table(usize),
    Userdata(usize),
    NativeFn(usize),
    NativeClosure(usize),
    ScriptClosure(usize),
    Thread(usize),
    Proto(usize),
    Upvalue(usize),
}

/// A table key: any non-nil, non-NaN value. Strings hash by content, numbers
/// by bit pattern (`-0.0` normalized), reference kinds by identity.
#[derive(Debug, Clone)]
pub struct TableKey(Value);

impl TableKey {
    pub fn try_new(value: Value) -> Result<Self, VmError> {
        match value {
            Value::Nil => Err(VmError::NilIndex),
            Value::Number(n) if n.is_nan() => Err(VmError::NanIndex),
            Value::Number(n) if n == 0.0 => Ok(Self(Value::Number(0.0))),
            other => Ok(Self(other)),
        }
    }

    pub fn value(&self) -> &Value {
        &self.0
    }
}

impl PartialEq for TableKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for TableKey {}

impl std::hash::Hash for TableKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match &self.0 {
            Value::Nil => unreachable!("nil table key"),
            Value::Boolean(b) => (0u8, b).hash(state),
            Value::LightPtr(p) => (1u8, p).hash(state),
            Value::Number(n) => (2u8, n.to_bits()).hash(state),
            Value::Str(s) => (3u8, s.as_bytes()).hash(state),
            other => (4u8, other.obj_key()).hash(state),
        }
    }
}

/// A mutable key/value table with an optional metatable. Iteration order is
/// insertion order, which is what makes persistence deterministic.
#[derive(Debug, Default)]
pub struct Table {
    pub entries: IndexMap<TableKey, Value>,
    pub metatable: Option<Rc<RefCell<Table>>>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Value) -> Value {
        match TableKey::try_new(key.clone()) {
            Ok(k) => self.entries.get(&k).cloned().unwrap_or(Value::Nil),
            Err(_) => Value::Nil,
        }
    }

    /// Set `key` to `value`; a nil value removes the entry, as the host does.
    pub fn set(&mut self, key: Value, value: Value) -> Result<(), VmError> {
        let key = TableKey::try_new(key)?;
        if value.is_nil() {
            self.entries.shift_remove(&key);
        } else {
            self.entries.insert(key, value);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A raw userdata payload with an optional metatable. The runtime attaches no
/// meaning to the bytes.
#[derive(Debug, Default)]
pub struct Userdata {
    pub data: Vec<u8>,
    pub metatable: Option<Rc<RefCell<Table>>>,
}

impl Userdata {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            metatable: None,
        }
    }
}
