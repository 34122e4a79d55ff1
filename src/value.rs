//! The tagged value ("memcell") at the heart of the VM.
//!
//! A `Value` is always in exactly one of eight states. There is no separate
//! tag field to fall out of sync with the payload: the tag *is* the enum
//! discriminant, so every match on a `Value` is exhaustive and the compiler
//! rejects the "assert on UNDEF" class of bug the original C avm_memcell
//! was prone to.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::table::Table;

/// A resolved user-function reference: the code offset of its `funcenter`
/// plus the name it was declared under, so `Value::UserFunc` can render
/// itself (`userfunction: <id> , address: <addr>`) without reaching back
/// into the image the way the C original's `avm_getfuncinfo` does.
#[derive(Clone, Debug, PartialEq)]
pub struct UserFuncRef {
    pub address: usize,
    pub id: Rc<str>,
}

/// Canonical tag names, in declaration order. `typeof()` and diagnostics
/// both key off this so renaming a variant can't silently desync the two.
pub const TYPE_NAMES: [&str; 8] = [
    "number", "string", "bool", "table", "userfunc", "libfunc", "nil", "undef",
];

pub enum Value {
    Number(f64),
    Str(String),
    Bool(bool),
    Table(Rc<RefCell<Table>>),
    UserFunc(UserFuncRef),
    /// Name of a library function, as it appears in `namedLibFuncs`.
    LibFunc(String),
    Nil,
    Undef,
}

impl Value {
    pub fn tag_name(&self) -> &'static str {
        match self {
            Value::Number(_) => TYPE_NAMES[0],
            Value::Str(_) => TYPE_NAMES[1],
            Value::Bool(_) => TYPE_NAMES[2],
            Value::Table(_) => TYPE_NAMES[3],
            Value::UserFunc(_) => TYPE_NAMES[4],
            Value::LibFunc(_) => TYPE_NAMES[5],
            Value::Nil => TYPE_NAMES[6],
            Value::Undef => TYPE_NAMES[7],
        }
    }

    pub fn is_undef(&self) -> bool {
        matches!(self, Value::Undef)
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Rc<RefCell<Table>>> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    /// `avm_tobool`. UNDEF has no meaningful boolean reading and callers
    /// must never ask; that invariant is enforced by the caller checking
    /// first (the dispatcher never calls this on a freshly-cleared cell).
    pub fn to_bool(&self) -> bool {
        match self {
            Value::Number(n) => *n != 0.0,
            Value::Str(s) => s.as_bytes().first().copied().unwrap_or(0) != 0,
            Value::Bool(b) => *b,
            Value::Table(_) | Value::UserFunc(_) | Value::LibFunc(_) => true,
            Value::Nil => false,
            Value::Undef => unreachable!("to_bool() called on Undef"),
        }
    }

    /// `avm_tostring`. Table formatting borrows the partition order and
    /// `{key:value}` / `{'key':value}` rendering from `Table::to_string`.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Number(n) => format!("{:.6}", n),
            Value::Str(s) => s.clone(),
            Value::Bool(b) => {
                if *b {
                    "true".to_string()
                } else {
                    "false".to_string()
                }
            }
            Value::Table(t) => t.borrow().to_display_string(),
            Value::UserFunc(f) => format!("userfunction: {} , address: {}", f.id, f.address),
            Value::LibFunc(name) => name.clone(),
            Value::Nil => "nil".to_string(),
            Value::Undef => "undef".to_string(),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.tag_name(), self.to_display_string())
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Undef
    }
}

/// `avm_assign`'s duplicate-on-copy behavior, made automatic: cloning a
/// `Str` duplicates its bytes, cloning a `Table` bumps the table's
/// refcount (see `table::Table::incref`) as well as the `Rc`'s own strong
/// count. Written by hand rather than derived so the refcount bump isn't
/// forgotten at a call site.
impl Clone for Value {
    fn clone(&self) -> Self {
        match self {
            Value::Number(n) => Value::Number(*n),
            Value::Str(s) => Value::Str(s.clone()),
            Value::Bool(b) => Value::Bool(*b),
            Value::Table(t) => {
                t.borrow_mut().incref();
                Value::Table(Rc::clone(t))
            }
            Value::UserFunc(f) => Value::UserFunc(f.clone()),
            Value::LibFunc(l) => Value::LibFunc(l.clone()),
            Value::Nil => Value::Nil,
            Value::Undef => Value::Undef,
        }
    }
}

/// `avm_memcellclear`'s table branch (`avm_tabledecrefcounter`). Number,
/// string, bool and the rest need no teardown beyond what Rust already
/// does when their storage is freed.
impl Drop for Value {
    fn drop(&mut self) {
        if let Value::Table(t) = self {
            t.borrow_mut().decref();
        }
    }
}
